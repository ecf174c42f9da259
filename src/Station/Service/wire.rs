// Byte encodings of request parameters and responses carried in mailboxes.
// Every struct here is repr(C) with explicit padding so both sides agree on
// the bytes regardless of how they were compiled.

use std::mem::size_of;
use std::ptr;
use std::time::Duration;

use super::layout::{ClientName, CLIENT_NAME_LEN, REQUEST_BYTES};
use crate::Station::Buffer::{ClientId, QueueKind, QueueMask, Slot};
use crate::Station::Structs::{Record, Selector, StreamId};

/// Most selectors one fetch can carry.
pub const MAX_SELECTORS: usize = 16;

/// Marker for plain structs that may be copied to and from raw bytes.
///
/// # Safety
/// Implementors must be `repr(C)`, contain no implicit padding, and accept
/// any bit pattern.
pub unsafe trait Plain: Copy {}

/// Append the bytes of `value`.
pub fn put<T: Plain>(out: &mut Vec<u8>, value: &T) {
    let bytes = unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    out.extend_from_slice(bytes);
}

/// Read a `T` at `offset`, or `None` if the bytes run out.
pub fn get<T: Plain>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }
    Some(unsafe { ptr::read_unaligned(bytes.as_ptr().add(offset) as *const T) })
}

/// Overwrite the bytes of a `T` previously reserved at `offset`.
fn patch<T: Plain>(out: &mut [u8], offset: usize, value: &T) {
    let bytes = unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    out[offset..offset + bytes.len()].copy_from_slice(bytes);
}

#[inline]
fn pad8(len: usize) -> usize {
    (len + 7) & !7
}

// -----------------------------------------------------------------------------
// FetchRecords
// -----------------------------------------------------------------------------

/// Where a fetch starts.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeqMode {
    /// Continue from `next_packet`.
    #[default]
    Continue = 0,
    /// Restart at the oldest record still held.
    First = 1,
    /// Skip everything published so far.
    Last = 2,
}

impl SeqMode {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(SeqMode::Continue),
            1 => Some(SeqMode::First),
            2 => Some(SeqMode::Last),
            _ => None,
        }
    }
}

const FETCH_HAS_FLOOR: u8 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FetchParams {
    pub next_packet: u64,
    pub min_timestamp: f64,
    pub max_records: u32,
    pub mode: u8,
    pub kinds: u8,
    pub selector_count: u8,
    pub flags: u8,
    pub selectors: [[u8; 5]; MAX_SELECTORS],
}

unsafe impl Plain for FetchParams {}

/// A fetch as the client describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub mode: SeqMode,
    /// Packet number the previous reply said to resume from.
    pub next_packet: u64,
    /// Skip records whose header time is older than this.
    pub min_timestamp: Option<f64>,
    pub max_records: u32,
    pub kinds: QueueMask,
    /// Empty matches every stream.
    pub selectors: Vec<Selector>,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            mode: SeqMode::Continue,
            next_packet: 0,
            min_timestamp: None,
            max_records: 64,
            kinds: QueueMask::ALL,
            selectors: Vec::new(),
        }
    }
}

impl FetchRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut selectors = [[b'?'; 5]; MAX_SELECTORS];
        for (dst, sel) in selectors.iter_mut().zip(self.selectors.iter()) {
            *dst = sel.as_bytes();
        }
        let params = FetchParams {
            next_packet: self.next_packet,
            min_timestamp: self.min_timestamp.unwrap_or(0.0),
            max_records: self.max_records,
            mode: self.mode as u8,
            kinds: self.kinds.bits(),
            selector_count: self.selectors.len().min(MAX_SELECTORS) as u8,
            flags: if self.min_timestamp.is_some() { FETCH_HAS_FLOOR } else { 0 },
            selectors,
        };
        let mut out = Vec::with_capacity(size_of::<FetchParams>());
        put(&mut out, &params);
        out
    }

    /// `None` for short input, an unknown mode or too many selectors.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let params: FetchParams = get(bytes, 0)?;
        let mode = SeqMode::from_raw(params.mode)?;
        let count = params.selector_count as usize;
        if count > MAX_SELECTORS {
            return None;
        }
        Some(Self {
            mode,
            next_packet: params.next_packet,
            min_timestamp: (params.flags & FETCH_HAS_FLOOR != 0).then_some(params.min_timestamp),
            max_records: params.max_records,
            kinds: QueueMask::from_bits(params.kinds),
            selectors: params.selectors[..count]
                .iter()
                .map(|&p| Selector::from_bytes(p))
                .collect(),
        })
    }

    /// Whether a record of `kind` from `stream` stamped `header_time` is wanted.
    pub fn accepts(&self, kind: QueueKind, stream: &StreamId, header_time: f64) -> bool {
        if !self.kinds.contains(kind) {
            return false;
        }
        if kind.carries_stream()
            && !self.selectors.is_empty()
            && !self.selectors.iter().any(|sel| sel.matches(stream))
        {
            return false;
        }
        match self.min_timestamp {
            Some(floor) => header_time >= floor,
            None => true,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FetchReplyHeader {
    pub resume_from: u64,
    pub count: u32,
    pub _pad: u32,
}

unsafe impl Plain for FetchReplyHeader {}

pub const FETCH_REPLY_HEADER_LEN: usize = size_of::<FetchReplyHeader>();

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RecordHeader {
    pub packet_num: u64,
    pub reception: f64,
    pub header_time: f64,
    pub len: u32,
    pub kind: u8,
    pub location: [u8; 2],
    pub channel: [u8; 3],
    pub _pad: [u8; 6],
}

unsafe impl Plain for RecordHeader {}

/// Bytes one record with a `payload_len` payload takes in a fetch reply.
pub fn record_encoded_len(payload_len: usize) -> usize {
    size_of::<RecordHeader>() + pad8(payload_len)
}

/// Builds a fetch reply in place: header first, records appended.
pub struct FetchReplyWriter<'a> {
    out: &'a mut Vec<u8>,
    start: usize,
    capacity: usize,
    count: u32,
}

impl<'a> FetchReplyWriter<'a> {
    /// Start a reply that may grow to `capacity` bytes of `out`.
    pub fn new(out: &'a mut Vec<u8>, capacity: usize) -> Self {
        let start = out.len();
        put(
            out,
            &FetchReplyHeader {
                resume_from: 0,
                count: 0,
                _pad: 0,
            },
        );
        Self {
            out,
            start,
            capacity,
            count: 0,
        }
    }

    /// Whether the reply header itself fits.
    pub fn header_fits(&self) -> bool {
        self.out.len() - self.start <= self.capacity
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Append one record. False, and nothing written, if it would not fit.
    pub fn push(&mut self, kind: QueueKind, slot: &Slot) -> bool {
        let used = self.out.len() - self.start;
        if used + record_encoded_len(slot.payload().len()) > self.capacity {
            return false;
        }
        let stream = slot.stream();
        put(
            self.out,
            &RecordHeader {
                packet_num: slot.packet_num(),
                reception: slot.reception(),
                header_time: slot.header_time(),
                len: slot.payload().len() as u32,
                kind: kind as u8,
                location: stream.location,
                channel: stream.channel,
                _pad: [0; 6],
            },
        );
        self.out.extend_from_slice(slot.payload());
        let padded = pad8(slot.payload().len());
        self.out.resize(self.out.len() + padded - slot.payload().len(), 0);
        self.count += 1;
        true
    }

    pub fn finish(self, resume_from: u64) -> u32 {
        patch(
            self.out,
            self.start,
            &FetchReplyHeader {
                resume_from,
                count: self.count,
                _pad: 0,
            },
        );
        self.count
    }
}

/// A decoded fetch response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchReply {
    /// Packet number to send as `next_packet` on the next fetch.
    pub resume_from: u64,
    pub records: Vec<Record>,
}

impl FetchReply {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let header: FetchReplyHeader = get(bytes, 0)?;
        let mut offset = size_of::<FetchReplyHeader>();
        let mut records = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            let rec: RecordHeader = get(bytes, offset)?;
            offset += size_of::<RecordHeader>();
            let len = rec.len as usize;
            let data = bytes.get(offset..offset.checked_add(len)?)?.to_vec();
            offset += pad8(len);
            records.push(Record {
                packet_num: rec.packet_num,
                kind: QueueKind::from_index(rec.kind)?,
                reception: rec.reception,
                header_time: rec.header_time,
                stream: StreamId {
                    location: rec.location,
                    channel: rec.channel,
                },
                data,
            });
        }
        Some(Self {
            resume_from: header.resume_from,
            records,
        })
    }
}

// -----------------------------------------------------------------------------
// Attach
// -----------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AttachReply {
    pub invocation: u64,
    pub client: u32,
    pub blocking: u32,
}

unsafe impl Plain for AttachReply {}

pub const ATTACH_REPLY_LEN: usize = size_of::<AttachReply>();

/// What the broker tells a client on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachInfo {
    pub invocation: u64,
    pub client: ClientId,
    pub blocking: bool,
}

impl AttachInfo {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put(
            out,
            &AttachReply {
                invocation: self.invocation,
                client: self.client.index() as u32,
                blocking: self.blocking as u32,
            },
        );
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let reply: AttachReply = get(bytes, 0)?;
        Some(Self {
            invocation: reply.invocation,
            client: ClientId::new(reply.client as usize)?,
            blocking: reply.blocking != 0,
        })
    }
}

// -----------------------------------------------------------------------------
// ClientDirectory
// -----------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy)]
pub struct DirectoryHeader {
    pub count: u32,
    pub _pad: u32,
}

unsafe impl Plain for DirectoryHeader {}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct DirectoryEntry {
    pub name: [u8; CLIENT_NAME_LEN],
    pub pid: u32,
    pub uid: u32,
    pub idle_secs: u32,
    pub timeout_secs: u32,
    pub gaps: u64,
    pub flags: u32,
    pub _pad: u32,
}

unsafe impl Plain for DirectoryEntry {}

const DIR_ACTIVE: u32 = 1;
const DIR_BLOCKING: u32 = 2;
const DIR_RESERVED: u32 = 4;

/// One row of the client directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: ClientName,
    pub pid: u32,
    pub uid: u32,
    /// Time since the client was last serviced.
    pub idle: Duration,
    pub timeout: Duration,
    pub gaps: u64,
    pub active: bool,
    pub blocking: bool,
    pub reserved: bool,
}

/// Bytes a directory of `count` rows takes.
pub fn directory_len(count: usize) -> usize {
    size_of::<DirectoryHeader>() + count * size_of::<DirectoryEntry>()
}

pub fn encode_directory(out: &mut Vec<u8>, rows: &[ClientInfo]) {
    put(
        out,
        &DirectoryHeader {
            count: rows.len() as u32,
            _pad: 0,
        },
    );
    for row in rows {
        let mut flags = 0;
        if row.active {
            flags |= DIR_ACTIVE;
        }
        if row.blocking {
            flags |= DIR_BLOCKING;
        }
        if row.reserved {
            flags |= DIR_RESERVED;
        }
        put(
            out,
            &DirectoryEntry {
                name: row.name.as_bytes(),
                pid: row.pid,
                uid: row.uid,
                idle_secs: row.idle.as_secs().min(u32::MAX as u64) as u32,
                timeout_secs: row.timeout.as_secs().min(u32::MAX as u64) as u32,
                gaps: row.gaps,
                flags,
                _pad: 0,
            },
        );
    }
}

pub fn decode_directory(bytes: &[u8]) -> Option<Vec<ClientInfo>> {
    let header: DirectoryHeader = get(bytes, 0)?;
    (0..header.count as usize)
        .map(|i| {
            let e: DirectoryEntry = get(
                bytes,
                size_of::<DirectoryHeader>() + i * size_of::<DirectoryEntry>(),
            )?;
            Some(ClientInfo {
                name: ClientName::from_bytes(e.name),
                pid: e.pid,
                uid: e.uid,
                idle: Duration::from_secs(e.idle_secs as u64),
                timeout: Duration::from_secs(e.timeout_secs as u64),
                gaps: e.gaps,
                active: e.flags & DIR_ACTIVE != 0,
                blocking: e.flags & DIR_BLOCKING != 0,
                reserved: e.flags & DIR_RESERVED != 0,
            })
        })
        .collect()
}

// -----------------------------------------------------------------------------
// UnblockClient
// -----------------------------------------------------------------------------

pub fn encode_client_name(name: &ClientName) -> Vec<u8> {
    name.as_bytes().to_vec()
}

pub fn decode_client_name(bytes: &[u8]) -> Option<ClientName> {
    let raw: [u8; CLIENT_NAME_LEN] = bytes.get(..CLIENT_NAME_LEN)?.try_into().ok()?;
    let name = ClientName::from_bytes(raw);
    (!name.is_empty()).then_some(name)
}

/// Whether `input` fits in a mailbox request.
pub fn fits_request(input: &[u8]) -> bool {
    input.len() <= REQUEST_BYTES
}
