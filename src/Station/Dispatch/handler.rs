// The broker's request dispatcher and the state it mutates

use std::time::Instant;

use tracing::{debug, info, warn};

use super::commands::{Command, InfoKind, PrivilegeTable};
use super::device::{DeviceLink, DeviceToken, NoLink};
use super::fetch::fetch_records;
use crate::error::{CommandStatus, ResultCode};
use crate::Station::Buffer::{ClientId, QueueKind, RecordStore, MAXCLIENTS};
use crate::Station::Service::layout::{ClientName, ConnectionId};
use crate::Station::Service::wire::{
    decode_client_name, directory_len, encode_directory, AttachInfo, ClientInfo, FetchRequest,
    ATTACH_REPLY_LEN,
};
use crate::Station::{ClientTable, Cursor, DetachReason};

/// Identity of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub connection: ConnectionId,
    pub name: ClientName,
    pub pid: u32,
    pub uid: u32,
}

/// What the broker remembers about one connection between requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Session {
    pub client: Option<ClientId>,
    pub command_status: CommandStatus,
}

/// Everything a request can read or change.
pub struct BrokerState {
    pub(crate) store: RecordStore,
    pub(crate) clients: ClientTable,
    pub(crate) privileges: PrivilegeTable,
    pub(crate) sessions: [Session; MAXCLIENTS],
    pub(crate) device: DeviceToken,
    pub(crate) link: Box<dyn DeviceLink>,
    info: [Option<Vec<u8>>; InfoKind::COUNT],
    terminate_requested: bool,
    reconfigure_requested: bool,
    gap_events: u64,
    invocation: u64,
}

impl BrokerState {
    pub fn new(
        store: RecordStore,
        clients: ClientTable,
        privileges: PrivilegeTable,
        invocation: u64,
    ) -> Self {
        Self {
            store,
            clients,
            privileges,
            sessions: [Session::default(); MAXCLIENTS],
            device: DeviceToken::default(),
            link: Box::new(NoLink),
            info: Default::default(),
            terminate_requested: false,
            reconfigure_requested: false,
            gap_events: 0,
            invocation,
        }
    }

    pub fn with_link(mut self, link: Box<dyn DeviceLink>) -> Self {
        self.link = link;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut RecordStore {
        &mut self.store
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    pub fn session(&self, conn: ConnectionId) -> &Session {
        &self.sessions[conn.index()]
    }

    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    /// Eviction gaps seen across all clients.
    pub fn gap_events(&self) -> u64 {
        self.gap_events
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate_requested
    }

    /// Take a pending reconfigure request.
    pub fn take_reconfigure_request(&mut self) -> bool {
        std::mem::take(&mut self.reconfigure_requested)
    }

    /// Publish a blob for info queries; `None` withdraws it.
    pub fn set_info(&mut self, kind: InfoKind, blob: Option<Vec<u8>>) {
        self.info[kind.index()] = blob;
    }

    /// Link layer: the device command owned by `client` reached `status`.
    pub fn complete_device_command(&mut self, status: CommandStatus) -> Option<ConnectionId> {
        let owner = self.device.owner()?;
        let conn = self.clients.get(owner)?.connection?;
        self.sessions[conn.index()].command_status = status;
        debug!(client = %owner, ?status, "device command progressed");
        Some(conn)
    }

    /// Handle one request. Output bytes are appended to `out`, never more
    /// than `capacity` of them.
    pub fn dispatch(
        &mut self,
        caller: &Caller,
        code: u32,
        input: &[u8],
        out: &mut Vec<u8>,
        capacity: usize,
        now: Instant,
    ) -> ResultCode {
        let Some(command) = Command::from_code(code) else {
            debug!(code, connection = %caller.connection, "unknown request code");
            return ResultCode::Invalid;
        };

        if !self.privileges.permits(caller.uid, command) {
            warn!(
                ?command,
                uid = caller.uid,
                client = %caller.name,
                "privileged command refused"
            );
            return ResultCode::Privilege;
        }

        if command == Command::Attach {
            return self.attach(caller, out, capacity, now);
        }

        // Everything else needs a bound, live client on this connection
        let Some(id) = self.bound_client(caller) else {
            return ResultCode::Invalid;
        };
        if let Some(client) = self.clients.get_mut(id) {
            client.last_service = now;
        }

        match command {
            Command::Attach => ResultCode::Invalid,
            Command::FetchRecords => self.fetch(id, input, out, capacity),
            Command::LinkInfo
            | Command::CalibratorInfo
            | Command::DigitizerInfo
            | Command::ChannelInfo
            | Command::UltraInfo
            | Command::LinkStatus => match command.info_kind() {
                Some(kind) => self.info(kind, out, capacity),
                None => ResultCode::Invalid,
            },
            Command::ClientDirectory => self.directory(out, capacity, now),
            Command::UnblockClient => self.unblock(input),
            Command::Reconfigure => {
                info!(client = %caller.name, "reconfigure requested");
                self.reconfigure_requested = true;
                self.link.reconfigure();
                ResultCode::Good
            }
            Command::Suspend => {
                if !self.store.is_suspended() {
                    info!(client = %caller.name, "delivery promises suspended");
                }
                self.store.set_suspended(true);
                ResultCode::Good
            }
            Command::Resume => {
                if self.store.is_suspended() {
                    info!(client = %caller.name, "delivery promises resumed");
                }
                self.store.set_suspended(false);
                ResultCode::Good
            }
            Command::AckCommand => {
                self.sessions[caller.connection.index()].command_status = CommandStatus::Idle;
                self.device.release(id);
                ResultCode::Good
            }
            Command::Terminate => {
                info!(client = %caller.name, "terminate requested");
                self.terminate_requested = true;
                ResultCode::Good
            }
            Command::SetLinkParams => self.link.link_settings(input),
            Command::Device(code) => self.device_command(caller.connection, id, code, input),
        }
    }

    fn bound_client(&self, caller: &Caller) -> Option<ClientId> {
        let id = self.sessions[caller.connection.index()].client?;
        let client = self.clients.get(id)?;
        (client.active && client.name == caller.name).then_some(id)
    }

    fn attach(&mut self, caller: &Caller, out: &mut Vec<u8>, capacity: usize, now: Instant) -> ResultCode {
        if caller.name.is_empty() {
            return ResultCode::Invalid;
        }
        if capacity < ATTACH_REPLY_LEN {
            return ResultCode::BufferTooSmall;
        }

        // Another connection still bound to this name loses it
        if let Some(existing) = self.clients.find(&caller.name) {
            let stale = self
                .clients
                .get(existing)
                .and_then(|c| c.connection)
                .filter(|&conn| conn != caller.connection);
            if let Some(conn) = stale {
                self.sessions[conn.index()].client = None;
            }
        }

        let Some(reg) = self.clients.register(caller.name, caller.pid, caller.uid, now) else {
            warn!(client = %caller.name, "client table full, attach refused");
            return ResultCode::AttachRefused;
        };
        self.store.activate(reg.id, reg.blocking);

        if let Some(client) = self.clients.get_mut(reg.id) {
            client.connection = Some(caller.connection);
        }
        self.sessions[caller.connection.index()] = Session {
            client: Some(reg.id),
            command_status: CommandStatus::Idle,
        };

        AttachInfo {
            invocation: self.invocation,
            client: reg.id,
            blocking: reg.blocking,
        }
        .encode(out);
        ResultCode::Good
    }

    fn fetch(&mut self, id: ClientId, input: &[u8], out: &mut Vec<u8>, capacity: usize) -> ResultCode {
        let Some(request) = FetchRequest::decode(input) else {
            return ResultCode::Invalid;
        };
        let Some(client) = self.clients.get_mut(id) else {
            return ResultCode::Invalid;
        };
        let outcome = fetch_records(&mut self.store, id, client, &request, out, capacity);
        self.gap_events += outcome.gaps as u64;
        outcome.result
    }

    fn info(&self, kind: InfoKind, out: &mut Vec<u8>, capacity: usize) -> ResultCode {
        match &self.info[kind.index()] {
            None => ResultCode::NoData,
            Some(blob) if blob.len() > capacity => ResultCode::BufferTooSmall,
            Some(blob) => {
                out.extend_from_slice(blob);
                ResultCode::Good
            }
        }
    }

    /// Snapshot of every known client.
    pub fn client_directory(&self, now: Instant) -> Vec<ClientInfo> {
        self.clients
            .iter()
            .map(|(_, c)| ClientInfo {
                name: c.name,
                pid: c.pid,
                uid: c.uid,
                idle: now.saturating_duration_since(c.last_service),
                timeout: c.timeout,
                gaps: c.gaps,
                active: c.active,
                blocking: c.blocking,
                reserved: c.reserved,
            })
            .collect()
    }

    fn directory(&self, out: &mut Vec<u8>, capacity: usize, now: Instant) -> ResultCode {
        let rows = self.client_directory(now);
        if directory_len(rows.len()) > capacity {
            return ResultCode::BufferTooSmall;
        }
        encode_directory(out, &rows);
        ResultCode::Good
    }

    fn unblock(&mut self, input: &[u8]) -> ResultCode {
        let Some(name) = decode_client_name(input) else {
            return ResultCode::Invalid;
        };
        let Some(id) = self.clients.find(&name) else {
            return ResultCode::Invalid;
        };
        self.catch_up(id);
        self.store.unblock(id);
        info!(client = %name, "client unblocked");
        ResultCode::Good
    }

    /// Move every cursor of `id` to the newest record.
    fn catch_up(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        for kind in QueueKind::ALL {
            let ring = self.store.ring(kind);
            client.cursors[kind.index()] = ring.newest().map(|slot| Cursor {
                slot,
                packet: ring.slot(slot).packet_num(),
            });
        }
        client.primed = true;
    }

    fn device_command(&mut self, conn: ConnectionId, id: ClientId, code: u32, input: &[u8]) -> ResultCode {
        let session = &mut self.sessions[conn.index()];
        if !self.device.admits(id, session.command_status) {
            return ResultCode::Busy;
        }
        let result = self.link.submit(code, input);
        if result.is_good() {
            session.command_status = CommandStatus::InProgress;
            self.device.take(id);
        }
        result
    }

    /// Drop a client: inactive in the table, no blocking bits, no device
    /// token, no connection.
    pub fn evict(&mut self, id: ClientId, reason: DetachReason) {
        let connection = self.clients.get(id).and_then(|c| c.connection);
        if self.clients.deactivate(id, reason) {
            self.store.deactivate(id);
        }
        self.device.release(id);
        if let Some(conn) = connection {
            let session = &mut self.sessions[conn.index()];
            if session.client == Some(id) {
                *session = Session::default();
            }
        }
    }

    /// The connection went away; evict whoever was bound to it.
    pub fn close_connection(&mut self, conn: ConnectionId, reason: DetachReason) {
        if let Some(id) = self.sessions[conn.index()].client {
            self.evict(id, reason);
        }
        self.sessions[conn.index()] = Session::default();
    }
}

