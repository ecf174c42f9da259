// The per-kind record rings owned by the broker

use std::fmt;

use super::clientset::ClientSet;
use crate::error::RecordError;
use crate::Station::Structs::{Record, StreamId};

/// The six record kinds, one ring each.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    Data = 0,
    Detection = 1,
    Calibration = 2,
    Timing = 3,
    Message = 4,
    Blockette = 5,
}

impl QueueKind {
    pub const COUNT: usize = 6;

    pub const ALL: [QueueKind; Self::COUNT] = [
        QueueKind::Data,
        QueueKind::Detection,
        QueueKind::Calibration,
        QueueKind::Timing,
        QueueKind::Message,
        QueueKind::Blockette,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Data => "data",
            QueueKind::Detection => "detection",
            QueueKind::Calibration => "calibration",
            QueueKind::Timing => "timing",
            QueueKind::Message => "message",
            QueueKind::Blockette => "blockette",
        }
    }

    /// Whether records of this kind carry a location/channel identity that
    /// selectors apply to. Timing marks and log messages do not.
    pub fn carries_stream(self) -> bool {
        !matches!(self, QueueKind::Timing | QueueKind::Message)
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of record kinds, one bit per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QueueMask(u8);

impl QueueMask {
    pub const NONE: QueueMask = QueueMask(0);
    pub const ALL: QueueMask = QueueMask(0b11_1111);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn only(kind: QueueKind) -> Self {
        Self(1 << kind.index())
    }

    pub fn with(self, kind: QueueKind) -> Self {
        Self(self.0 | 1 << kind.index())
    }

    pub fn contains(self, kind: QueueKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    pub fn set(&mut self, kind: QueueKind, on: bool) {
        if on {
            self.0 |= 1 << kind.index();
        } else {
            self.0 &= !(1 << kind.index());
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Index of a slot within one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIdx(pub(crate) u32);

impl SlotIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One ring element: a record plus the clients that still owe an ack for it.
pub struct Slot {
    pub(crate) packet_num: u64,
    pub(crate) blocking: ClientSet,
    pub(crate) reception: f64,
    pub(crate) header_time: f64,
    pub(crate) stream: StreamId,
    pub(crate) payload: Vec<u8>,
    pub(crate) capacity: usize,
}

impl Slot {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            packet_num: 0,
            blocking: ClientSet::EMPTY,
            reception: 0.0,
            header_time: 0.0,
            stream: StreamId::BLANK,
            payload: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Forget the previous record; called when the slot is handed out again.
    pub(crate) fn clear(&mut self) {
        self.reception = 0.0;
        self.header_time = 0.0;
        self.stream = StreamId::BLANK;
        self.payload.clear();
    }

    pub fn packet_num(&self) -> u64 {
        self.packet_num
    }

    pub fn blocking(&self) -> ClientSet {
        self.blocking
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn reception(&self) -> f64 {
        self.reception
    }

    pub fn header_time(&self) -> f64 {
        self.header_time
    }

    /// Fill the slot. The packet number and blocking set were assigned when
    /// the slot was handed out and are left alone.
    pub fn write(
        &mut self,
        stream: StreamId,
        reception: f64,
        header_time: f64,
        bytes: &[u8],
    ) -> Result<(), RecordError> {
        if bytes.len() > self.capacity {
            return Err(RecordError::TooLarge {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.stream = stream;
        self.reception = reception;
        self.header_time = header_time;
        self.payload.clear();
        self.payload.extend_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn to_record(&self, kind: QueueKind) -> Record {
        Record {
            packet_num: self.packet_num,
            kind,
            reception: self.reception,
            header_time: self.header_time,
            stream: self.stream,
            data: self.payload.clone(),
        }
    }
}

/// A fixed-capacity ring of slots for one record kind.
///
/// Live slots run from `tail` for `len` slots; `head` (`tail + len`) is the
/// next slot handed to the producer. A full ring reuses its tail slot.
pub struct Ring {
    pub(crate) kind: QueueKind,
    pub(crate) slots: Vec<Slot>,
    pub(crate) tail: u32,
    pub(crate) len: u32,
    pub(crate) evictions: u64,
    /// Packet number of the most recently evicted record.
    pub(crate) last_evicted: Option<u64>,
}
