// Result codes shared with clients, and the broker's own error types.

use std::fmt;
use std::io;

/// Outcome of a service call, as stored in a mailbox and returned to clients.
///
/// The numeric values are part of the shared layout and must not change.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Good = 0,
    EnqueueFailed = 1,
    Timeout = 2,
    Initializing = 3,
    AttachRefused = 4,
    NoData = 5,
    Busy = 6,
    Invalid = 7,
    Died = 8,
    Changed = 9,
    SegmentError = 10,
    BufferTooSmall = 11,
    Privilege = 12,
}

impl ResultCode {
    #[inline]
    pub fn is_good(self) -> bool {
        self == ResultCode::Good
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Human readable text for front ends.
    pub fn description(self) -> &'static str {
        match self {
            ResultCode::Good => "good",
            ResultCode::EnqueueFailed => "could not enqueue request, service queue full",
            ResultCode::Timeout => "timed out waiting for the station",
            ResultCode::Initializing => "station is initializing",
            ResultCode::AttachRefused => "station refused the attach",
            ResultCode::NoData => "no data available",
            ResultCode::Busy => "a command is already in progress",
            ResultCode::Invalid => "invalid request",
            ResultCode::Died => "station process is gone",
            ResultCode::Changed => "station was restarted",
            ResultCode::SegmentError => "could not map the station region",
            ResultCode::BufferTooSmall => "output buffer too small",
            ResultCode::Privilege => "insufficient privilege",
        }
    }
}

impl TryFrom<u32> for ResultCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ResultCode::Good,
            1 => ResultCode::EnqueueFailed,
            2 => ResultCode::Timeout,
            3 => ResultCode::Initializing,
            4 => ResultCode::AttachRefused,
            5 => ResultCode::NoData,
            6 => ResultCode::Busy,
            7 => ResultCode::Invalid,
            8 => ResultCode::Died,
            9 => ResultCode::Changed,
            10 => ResultCode::SegmentError,
            11 => ResultCode::BufferTooSmall,
            12 => ResultCode::Privilege,
            other => return Err(other),
        })
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Progress of a device command, kept per connection in its mailbox.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandStatus {
    #[default]
    Idle = 0,
    InProgress = 20,
    Finished = 21,
    Rejected = 22,
    TransferStarted = 23,
    TransferDone = 24,
    TransferFailed = 25,
}

impl CommandStatus {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for CommandStatus {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => CommandStatus::Idle,
            20 => CommandStatus::InProgress,
            21 => CommandStatus::Finished,
            22 => CommandStatus::Rejected,
            23 => CommandStatus::TransferStarted,
            24 => CommandStatus::TransferDone,
            25 => CommandStatus::TransferFailed,
            other => return Err(other),
        })
    }
}

/// Failures while setting up or attaching to a station region.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("shared memory: {0}")]
    Io(#[from] io::Error),

    #[error("configuration: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("region {name} has an incompatible layout: {reason}")]
    Layout { name: String, reason: String },
}

/// Producer-side failures when filling a slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record of {len} bytes exceeds the {capacity}-byte slot")]
    TooLarge { len: usize, capacity: usize },

    #[error("queue {0} is blocked by a client that has not caught up")]
    Blocked(&'static str),
}
