// Hand-off to the digitizer link layer and the single device busy token

use tracing::debug;

use crate::error::{CommandStatus, ResultCode};
use crate::Station::Buffer::ClientId;

/// The link layer the broker forwards device commands to.
///
/// `submit` only has to accept or refuse the command; the link layer reports
/// the final outcome later through `Broker::complete_device_command`.
pub trait DeviceLink: Send {
    /// Forward device command `code` (16 and up) with its raw parameters.
    fn submit(&mut self, code: u32, params: &[u8]) -> ResultCode;

    /// Apply new link parameters.
    fn link_settings(&mut self, params: &[u8]) -> ResultCode;

    /// A reconfigure request arrived.
    fn reconfigure(&mut self) {}
}

/// Used when no link layer is wired in: every device command is invalid.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLink;

impl DeviceLink for NoLink {
    fn submit(&mut self, _code: u32, _params: &[u8]) -> ResultCode {
        ResultCode::Invalid
    }

    fn link_settings(&mut self, _params: &[u8]) -> ResultCode {
        ResultCode::Invalid
    }
}

/// At most one client may have a device command outstanding.
#[derive(Debug, Default)]
pub struct DeviceToken {
    owner: Option<ClientId>,
}

impl DeviceToken {
    pub fn owner(&self) -> Option<ClientId> {
        self.owner
    }

    /// Whether `client`, whose connection shows `status`, may start a command.
    pub fn admits(&self, client: ClientId, status: CommandStatus) -> bool {
        status == CommandStatus::Idle && self.owner.map_or(true, |owner| owner == client)
    }

    pub fn take(&mut self, client: ClientId) {
        self.owner = Some(client);
    }

    /// Give the token back if `client` holds it.
    pub fn release(&mut self, client: ClientId) -> bool {
        if self.owner == Some(client) {
            debug!(client = %client, "device token released");
            self.owner = None;
            true
        } else {
            false
        }
    }
}
