// Request codes and the privilege each one needs

use std::collections::HashMap;

use crate::config::PrivilegeGrant;

/// First code of the pass-through device command range.
pub const DEVICE_BASE: u32 = 16;
/// Last device command code; privilege bits are 64 wide.
pub const DEVICE_LAST: u32 = 63;

/// Every request a client can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Attach,
    FetchRecords,
    LinkInfo,
    CalibratorInfo,
    DigitizerInfo,
    ChannelInfo,
    UltraInfo,
    LinkStatus,
    ClientDirectory,
    UnblockClient,
    Reconfigure,
    Suspend,
    Resume,
    AckCommand,
    Terminate,
    SetLinkParams,
    /// Pass-through device command, code in `DEVICE_BASE..=DEVICE_LAST`.
    Device(u32),
}

/// Blobs the link layer publishes for clients to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoKind {
    Link,
    Calibrator,
    Digitizer,
    Channel,
    Ultra,
    LinkStatus,
}

impl InfoKind {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        match self {
            InfoKind::Link => 0,
            InfoKind::Calibrator => 1,
            InfoKind::Digitizer => 2,
            InfoKind::Channel => 3,
            InfoKind::Ultra => 4,
            InfoKind::LinkStatus => 5,
        }
    }

    pub fn command(self) -> Command {
        match self {
            InfoKind::Link => Command::LinkInfo,
            InfoKind::Calibrator => Command::CalibratorInfo,
            InfoKind::Digitizer => Command::DigitizerInfo,
            InfoKind::Channel => Command::ChannelInfo,
            InfoKind::Ultra => Command::UltraInfo,
            InfoKind::LinkStatus => Command::LinkStatus,
        }
    }
}

/// A set of command privilege bits, bit `n` for command code `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PrivilegeMask(pub u64);

impl PrivilegeMask {
    pub const NONE: PrivilegeMask = PrivilegeMask(0);
    pub const ALL: PrivilegeMask = PrivilegeMask(u64::MAX);

    pub fn of(command: Command) -> Self {
        Self(1u64 << command.code())
    }

    pub fn with(self, command: Command) -> Self {
        Self(self.0 | Self::of(command).0)
    }

    pub fn intersects(self, other: PrivilegeMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl Command {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Command::Attach,
            1 => Command::FetchRecords,
            2 => Command::LinkInfo,
            3 => Command::CalibratorInfo,
            4 => Command::DigitizerInfo,
            5 => Command::ChannelInfo,
            6 => Command::UltraInfo,
            7 => Command::LinkStatus,
            8 => Command::ClientDirectory,
            9 => Command::UnblockClient,
            10 => Command::Reconfigure,
            11 => Command::Suspend,
            12 => Command::Resume,
            13 => Command::AckCommand,
            14 => Command::Terminate,
            15 => Command::SetLinkParams,
            DEVICE_BASE..=DEVICE_LAST => Command::Device(code),
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        match self {
            Command::Attach => 0,
            Command::FetchRecords => 1,
            Command::LinkInfo => 2,
            Command::CalibratorInfo => 3,
            Command::DigitizerInfo => 4,
            Command::ChannelInfo => 5,
            Command::UltraInfo => 6,
            Command::LinkStatus => 7,
            Command::ClientDirectory => 8,
            Command::UnblockClient => 9,
            Command::Reconfigure => 10,
            Command::Suspend => 11,
            Command::Resume => 12,
            Command::AckCommand => 13,
            Command::Terminate => 14,
            Command::SetLinkParams => 15,
            Command::Device(code) => code,
        }
    }

    /// The privilege bit this command needs, or `None` if anyone may use it.
    pub fn required_privilege(self) -> Option<PrivilegeMask> {
        match self {
            Command::Attach
            | Command::FetchRecords
            | Command::LinkInfo
            | Command::CalibratorInfo
            | Command::DigitizerInfo
            | Command::ChannelInfo
            | Command::UltraInfo
            | Command::LinkStatus
            | Command::ClientDirectory
            | Command::AckCommand => None,
            Command::UnblockClient
            | Command::Reconfigure
            | Command::Suspend
            | Command::Resume
            | Command::Terminate
            | Command::SetLinkParams
            | Command::Device(_) => Some(PrivilegeMask::of(self)),
        }
    }

    pub fn info_kind(self) -> Option<InfoKind> {
        match self {
            Command::LinkInfo => Some(InfoKind::Link),
            Command::CalibratorInfo => Some(InfoKind::Calibrator),
            Command::DigitizerInfo => Some(InfoKind::Digitizer),
            Command::ChannelInfo => Some(InfoKind::Channel),
            Command::UltraInfo => Some(InfoKind::Ultra),
            Command::LinkStatus => Some(InfoKind::LinkStatus),
            _ => None,
        }
    }
}

/// Who may run privileged commands: the broker's own user, plus an allow-list.
#[derive(Debug, Clone, Default)]
pub struct PrivilegeTable {
    broker_uid: u32,
    grants: HashMap<u32, PrivilegeMask>,
}

impl PrivilegeTable {
    pub fn new(broker_uid: u32, grants: &[PrivilegeGrant]) -> Self {
        let mut table = Self {
            broker_uid,
            grants: HashMap::new(),
        };
        for grant in grants {
            table.grant(grant.uid, PrivilegeMask(grant.mask));
        }
        table
    }

    /// Add bits for `uid`; repeated grants accumulate.
    pub fn grant(&mut self, uid: u32, mask: PrivilegeMask) {
        let entry = self.grants.entry(uid).or_default();
        entry.0 |= mask.0;
    }

    pub fn mask_for(&self, uid: u32) -> PrivilegeMask {
        self.grants.get(&uid).copied().unwrap_or_default()
    }

    pub fn permits(&self, uid: u32, command: Command) -> bool {
        match command.required_privilege() {
            None => true,
            Some(bit) => uid == self.broker_uid || self.mask_for(uid).intersects(bit),
        }
    }
}
