use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::Station::Buffer::MAXCLIENTS;

/// "STNBRKR1"
pub const REGION_MAGIC: u64 = 0x5354_4E42_524B_5231;

/// The version of the memory layout.
pub const LAYOUT_VERSION: u32 = 1;

pub const CLIENT_NAME_LEN: usize = 8;
pub const STATION_NAME_LEN: usize = 8;

/// Bytes of request parameters a mailbox carries inline.
pub const REQUEST_BYTES: usize = 256;

/// A zero-padded client name as stored in shared memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientName([u8; CLIENT_NAME_LEN]);

impl ClientName {
    pub const EMPTY: ClientName = ClientName([0; CLIENT_NAME_LEN]);

    /// `None` for empty names, names that are too long, or names with
    /// non-printable bytes.
    pub fn new(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.is_empty()
            || name.len() > CLIENT_NAME_LEN
            || !name.bytes().all(|b| b.is_ascii_graphic())
        {
            return None;
        }
        let mut bytes = [0u8; CLIENT_NAME_LEN];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Some(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; CLIENT_NAME_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> [u8; CLIENT_NAME_LEN] {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(CLIENT_NAME_LEN);
        std::str::from_utf8(&self.0[..end]).unwrap_or("?")
    }
}

impl fmt::Debug for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientName({:?})", self.as_str())
    }
}

impl fmt::Display for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of a connection (mailbox) in the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u8);

impl ConnectionId {
    pub fn new(index: usize) -> Option<Self> {
        (index < MAXCLIENTS).then_some(Self(index as u8))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Value stored in a service entry; 0 is reserved for "free".
    #[inline]
    pub fn handle(self) -> u32 {
        self.0 as u32 + 1
    }

    pub fn from_handle(handle: u32) -> Option<Self> {
        handle.checked_sub(1).and_then(|i| Self::new(i as usize))
    }

    pub fn all() -> impl Iterator<Item = ConnectionId> {
        (0..MAXCLIENTS).filter_map(Self::new)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Broker lifecycle as published in the region header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Initializing = 0,
    Running = 1,
    Terminated = 2,
}

impl RegionState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => RegionState::Running,
            2 => RegionState::Terminated,
            _ => RegionState::Initializing,
        }
    }
}

/// Connection (mailbox) ownership states.
pub const CONN_FREE: u32 = 0;
pub const CONN_OPEN: u32 = 1;
pub const CONN_CLOSING: u32 = 2;

/// One slot of the service queue: "connection `handle - 1` has a request".
#[repr(C)]
pub struct ServiceEntry {
    /// 0 when free, otherwise connection index + 1.
    pub handle: AtomicU32,
    pub _pad: u32,
    /// Name of the last client that used this entry.
    pub name: UnsafeCell<[u8; CLIENT_NAME_LEN]>,
}

/// The header located at the very beginning of a station region.
///
/// It is the entry point for every client: identity and generation of the
/// broker, the client wait policy, the lock and doorbell words, and the
/// service queue. Mailboxes follow at `mailbox_offset`.
#[repr(C, align(128))]
pub struct RegionHeader {
    /// A "magic number" identifying a station region.
    pub magic: u64,
    pub version: u32,
    pub max_clients: u32,
    /// Chosen fresh each time a broker starts.
    pub invocation: AtomicU64,
    /// `RegionState` as u32.
    pub state: AtomicU32,
    pub broker_pid: u32,
    pub broker_uid: u32,
    pub mailbox_stride: u32,
    pub mailbox_offset: u32,
    pub output_capacity: u32,
    pub max_wait_ms: u32,
    pub same_user_poll_ms: u32,
    pub foreign_user_poll_ms: u32,
    pub probe_interval_ms: u32,
    pub station: [u8; STATION_NAME_LEN],

    /// Holder pid of the service-queue lock, 0 when free.
    pub service_lock: CachePadded<AtomicU32>,

    /// Bumped by clients after enqueueing; the broker sleeps on it.
    pub doorbell: CachePadded<AtomicU32>,

    pub entries: [ServiceEntry; MAXCLIENTS],
}

/// Per-connection request/response record. The output area follows the
/// header inside the connection's stride.
#[repr(C, align(128))]
pub struct MailboxHeader {
    /// 1 while a request is outstanding; the broker clears it when done.
    pub pending: AtomicU32,
    /// `CommandStatus` of the last device command.
    pub command_status: AtomicU32,
    /// `CONN_FREE`, `CONN_OPEN` or `CONN_CLOSING`.
    pub state: AtomicU32,
    pub command: AtomicU32,
    /// `ResultCode` of the last completed request.
    pub result: AtomicU32,
    pub client_pid: AtomicU32,
    pub client_uid: AtomicU32,
    pub input_len: AtomicU32,
    pub output_len: AtomicU32,
    pub _pad: u32,
    pub owner: UnsafeCell<[u8; CLIENT_NAME_LEN]>,
    pub input: UnsafeCell<[u8; REQUEST_BYTES]>,
}
