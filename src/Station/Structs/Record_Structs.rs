// Records as clients see them, and the selectors they filter with

use std::fmt;
use std::str::FromStr;

use crate::Station::Buffer::QueueKind;

/// Location (2 bytes) and channel (3 bytes) codes of a stream, space padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId {
    pub location: [u8; 2],
    pub channel: [u8; 3],
}

impl StreamId {
    pub const BLANK: StreamId = StreamId {
        location: *b"  ",
        channel: *b"   ",
    };

    pub fn new(location: &str, channel: &str) -> Self {
        let mut id = Self::BLANK;
        for (dst, src) in id.location.iter_mut().zip(location.bytes()) {
            *dst = src;
        }
        for (dst, src) in id.channel.iter_mut().zip(channel.bytes()) {
            *dst = src;
        }
        id
    }

    /// The five identity bytes, location first.
    pub fn bytes(&self) -> [u8; 5] {
        [
            self.location[0],
            self.location[1],
            self.channel[0],
            self.channel[1],
            self.channel[2],
        ]
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            String::from_utf8_lossy(&self.location).trim(),
            String::from_utf8_lossy(&self.channel).trim()
        )
    }
}

/// A record delivered to a client by a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub packet_num: u64,
    pub kind: QueueKind,
    /// When the broker received the record (seconds since the epoch).
    pub reception: f64,
    /// Time stamped in the record header (seconds since the epoch).
    pub header_time: f64,
    pub stream: StreamId,
    pub data: Vec<u8>,
}

/// A location/channel pattern. `?` matches any single byte.
///
/// Written as five characters (`00BHZ`), as three characters meaning any
/// location (`BHZ`), or `*` for everything.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selector {
    pattern: [u8; 5],
}

impl Selector {
    pub const ANY: Selector = Selector { pattern: *b"?????" };

    pub fn from_bytes(pattern: [u8; 5]) -> Self {
        Self { pattern }
    }

    pub fn as_bytes(&self) -> [u8; 5] {
        self.pattern
    }

    pub fn matches(&self, stream: &StreamId) -> bool {
        self.pattern
            .iter()
            .zip(stream.bytes().iter())
            .all(|(p, b)| *p == b'?' || p == b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("selector must be 3 or 5 characters or \"*\", got {0:?}")]
pub struct SelectorParseError(pub String);

impl FromStr for Selector {
    type Err = SelectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let mut pattern = *b"?????";
        match bytes.len() {
            1 if bytes[0] == b'*' => {}
            3 => pattern[2..].copy_from_slice(bytes),
            5 => pattern.copy_from_slice(bytes),
            _ => return Err(SelectorParseError(s.to_string())),
        }
        Ok(Self { pattern })
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", String::from_utf8_lossy(&self.pattern))
    }
}
