// Client side of the service channel: one connection per station, and a
// session that scans several stations round-robin.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::layout::{ClientName, ConnectionId, RegionState, CONN_CLOSING};
use super::region::ServiceRegion;
use super::wire::{
    decode_directory, encode_client_name, fits_request, AttachInfo, ClientInfo, FetchReply,
    FetchRequest, SeqMode,
};
use crate::config::{region_name, BrokerConfig};
use crate::error::{BrokerError, CommandStatus, ResultCode};
use crate::Core::futex::futex_wait;
use crate::Core::process::{current_pid, current_uid, process_alive};
use crate::Core::RegionBacking;
use crate::Station::Buffer::{ClientId, QueueMask};
use crate::Station::Dispatch::{Command, InfoKind};
use crate::Station::Structs::{Record, Selector};

/// Where a connection is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unattached,
    Attaching,
    Attached,
    /// The broker was restarted or died; the next check maps it again.
    Reattaching,
    Detached,
}

enum Wait {
    Done,
    TimedOut,
    BrokerGone,
}

/// A client's connection to one station broker.
pub struct StationConnection {
    station: String,
    region_name: String,
    backing: RegionBacking,
    name: ClientName,
    region: Option<ServiceRegion>,
    conn: Option<ConnectionId>,
    state: LinkState,
    /// Generation of the broker we last attached to; 0 before the first attach.
    invocation: u64,
    client: Option<ClientId>,
    blocking: bool,
    last_probe: Option<Instant>,
    request: FetchRequest,
    last_status: ResultCode,
    pid: u32,
    uid: u32,
}

impl StationConnection {
    /// A connection named `name` to `station`, using the default region
    /// prefix and backing.
    pub fn new(station: &str, name: &str) -> Result<Self, BrokerError> {
        let defaults = BrokerConfig::default();
        let client = ClientName::new(name)
            .ok_or_else(|| BrokerError::Invalid(format!("bad client name {:?}", name)))?;
        Ok(Self {
            station: station.to_string(),
            region_name: region_name(&defaults.region_prefix, station),
            backing: defaults.backing,
            name: client,
            region: None,
            conn: None,
            state: LinkState::Unattached,
            invocation: 0,
            client: None,
            blocking: false,
            last_probe: None,
            request: FetchRequest {
                mode: SeqMode::First,
                ..FetchRequest::default()
            },
            last_status: ResultCode::Good,
            pid: current_pid(),
            uid: current_uid(),
        })
    }

    pub fn with_backing(mut self, backing: RegionBacking) -> Self {
        self.backing = backing;
        self
    }

    pub fn with_region_prefix(mut self, prefix: &str) -> Self {
        self.region_name = region_name(prefix, &self.station);
        self
    }

    pub fn with_kinds(mut self, kinds: QueueMask) -> Self {
        self.request.kinds = kinds;
        self
    }

    pub fn with_selectors(mut self, selectors: Vec<Selector>) -> Self {
        self.request.selectors = selectors;
        self
    }

    pub fn with_max_records(mut self, max_records: u32) -> Self {
        self.request.max_records = max_records;
        self
    }

    pub fn with_min_timestamp(mut self, floor: Option<f64>) -> Self {
        self.request.min_timestamp = floor;
        self
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn name(&self) -> ClientName {
        self.name
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.conn
    }

    /// Packet number the next fetch continues from.
    pub fn next_packet(&self) -> u64 {
        self.request.next_packet
    }

    pub fn fetch_template(&self) -> &FetchRequest {
        &self.request
    }

    /// Start the next fetch at the oldest record (`First`) or after the
    /// newest (`Last`).
    pub fn restart(&mut self, mode: SeqMode) {
        self.request.mode = mode;
        if mode != SeqMode::Continue {
            self.request.next_packet = 0;
        }
    }

    pub(crate) fn last_status(&self) -> ResultCode {
        self.last_status
    }

    pub(crate) fn set_last_status(&mut self, status: ResultCode) {
        self.last_status = status;
    }

    /// Map the region if needed, claim a connection and register with the broker.
    pub fn attach(&mut self) -> ResultCode {
        if self.region.is_none() {
            match ServiceRegion::attach(&self.region_name, self.backing) {
                Ok(region) => {
                    self.region = Some(region);
                    self.conn = None;
                }
                Err(e) => {
                    debug!(region = %self.region_name, error = %e, "cannot map station region");
                    return ResultCode::SegmentError;
                }
            }
        }
        let Some(region) = self.region.as_ref() else {
            return ResultCode::SegmentError;
        };

        match region.state() {
            RegionState::Initializing => return ResultCode::Initializing,
            RegionState::Terminated => return ResultCode::Died,
            RegionState::Running => {}
        }

        if self.conn.is_none() {
            let Some(_lock) = region.lock(region.policy().max_wait()) else {
                return ResultCode::Timeout;
            };
            match region.claim_connection(&self.name, self.pid, self.uid) {
                Some(conn) => self.conn = Some(conn),
                None => return ResultCode::AttachRefused,
            }
        }

        self.state = LinkState::Attaching;
        let (result, output) = self.svc(Command::Attach, &[]);
        if !result.is_good() {
            self.state = LinkState::Unattached;
            return result;
        }
        let Some(reply) = AttachInfo::decode(&output) else {
            self.state = LinkState::Unattached;
            return ResultCode::Invalid;
        };

        self.invocation = reply.invocation;
        self.client = Some(reply.client);
        self.blocking = reply.blocking;
        self.state = LinkState::Attached;
        self.last_probe = Some(Instant::now());
        info!(
            station = %self.station,
            client = %self.name,
            id = %reply.client,
            "attached to station"
        );
        ResultCode::Good
    }

    /// Detect a restarted or dead broker. Returns `Changed` once after a
    /// restart (cursors reset, attached again), `Died` while the broker is gone.
    pub fn check(&mut self) -> ResultCode {
        let Some(region) = self.region.as_ref() else {
            return self.remap();
        };

        let probe_due = self
            .last_probe
            .map_or(true, |at| at.elapsed() >= Duration::from_millis(region.policy().probe_interval_ms));
        let terminated = region.state() == RegionState::Terminated;
        let dead = probe_due && !process_alive(region.broker_pid());
        if probe_due {
            self.last_probe = Some(Instant::now());
        }

        if terminated || dead {
            warn!(station = %self.station, terminated, "station broker is gone");
            self.drop_region();
            return self.remap();
        }

        if region.invocation() != self.invocation || self.state != LinkState::Attached {
            let previous = self.invocation;
            // Same generation: the mailbox is still ours, attach again through it
            if previous != region.invocation() {
                self.conn = None;
            }
            let result = self.attach();
            if !result.is_good() {
                return result;
            }
            if previous != 0 && previous != self.invocation {
                self.reset_cursors();
                return ResultCode::Changed;
            }
        }
        ResultCode::Good
    }

    /// Try to map a (possibly new) broker after losing the old one.
    fn remap(&mut self) -> ResultCode {
        let previous = self.invocation;
        match self.attach() {
            ResultCode::Good if previous != 0 && previous != self.invocation => {
                info!(station = %self.station, "station broker restarted");
                self.reset_cursors();
                ResultCode::Changed
            }
            ResultCode::Good => ResultCode::Good,
            other => {
                self.drop_region();
                if previous != 0 {
                    ResultCode::Died
                } else {
                    other
                }
            }
        }
    }

    fn reset_cursors(&mut self) {
        self.request.next_packet = 0;
        self.request.mode = SeqMode::First;
    }

    /// Forget the current mapping without telling the broker.
    fn drop_region(&mut self) {
        self.region = None;
        self.conn = None;
        self.client = None;
        if self.state != LinkState::Detached {
            self.state = LinkState::Reattaching;
        }
    }

    /// One request/response exchange. The wait is bounded by the broker's
    /// configured maximum.
    pub fn svc(&mut self, command: Command, input: &[u8]) -> (ResultCode, Vec<u8>) {
        let (Some(region), Some(conn)) = (self.region.as_ref(), self.conn) else {
            let result = if self.invocation != 0 {
                ResultCode::Died
            } else {
                ResultCode::Invalid
            };
            return (result, Vec::new());
        };
        if !fits_request(input) {
            return (ResultCode::Invalid, Vec::new());
        }

        let policy = region.policy();
        let deadline = Instant::now() + policy.max_wait();
        let same_user = self.uid == region.broker_uid();
        let step = if same_user {
            Duration::from_millis(policy.same_user_poll_ms)
        } else {
            Duration::from_millis(policy.foreign_user_poll_ms)
        };
        let mailbox = region.mailbox(conn);

        // A request abandoned by an earlier timeout may still be in the broker's hands
        if mailbox.is_pending() {
            match wait_for_completion(region, conn, deadline, step, same_user) {
                Wait::Done => {}
                Wait::TimedOut => return (ResultCode::Busy, Vec::new()),
                Wait::BrokerGone => {
                    self.drop_region();
                    return (ResultCode::Died, Vec::new());
                }
            }
        }

        mailbox.write_request(command.code(), input);
        {
            let Some(_lock) = region.lock(deadline.saturating_duration_since(Instant::now())) else {
                mailbox.cancel();
                return (ResultCode::Timeout, Vec::new());
            };
            if !region.enqueue(conn, &self.name) {
                mailbox.cancel();
                return (ResultCode::EnqueueFailed, Vec::new());
            }
        }

        region.ring_doorbell();
        if !process_alive(region.broker_pid()) {
            if let Some(_lock) = region.lock(step) {
                region.withdraw(conn);
            }
            mailbox.cancel();
            self.drop_region();
            return (ResultCode::Died, Vec::new());
        }

        match wait_for_completion(region, conn, deadline, step, same_user) {
            Wait::Done => (mailbox.result(), mailbox.read_output()),
            Wait::TimedOut => {
                let withdrawn = region
                    .lock(step)
                    .map(|_lock| region.withdraw(conn))
                    .unwrap_or(false);
                // If the broker already took it, leave it pending for the next call to drain
                if withdrawn {
                    mailbox.cancel();
                }
                warn!(station = %self.station, ?command, "service call timed out");
                (ResultCode::Timeout, Vec::new())
            }
            Wait::BrokerGone => {
                self.drop_region();
                (ResultCode::Died, Vec::new())
            }
        }
    }

    /// Fetch the next batch. `NoData` comes back as an empty reply.
    pub fn fetch(&mut self) -> Result<FetchReply, ResultCode> {
        let input = self.request.encode();
        let (result, output) = self.svc(Command::FetchRecords, &input);
        match result {
            ResultCode::Good | ResultCode::NoData => {
                let reply = FetchReply::decode(&output).ok_or(ResultCode::Invalid)?;
                self.request.next_packet = reply.resume_from;
                self.request.mode = SeqMode::Continue;
                Ok(reply)
            }
            ResultCode::Invalid => {
                // The broker no longer knows this connection (evicted); attach again on next check
                if self.state == LinkState::Attached {
                    self.state = LinkState::Unattached;
                }
                Err(ResultCode::Invalid)
            }
            other => Err(other),
        }
    }

    pub fn directory(&mut self) -> Result<Vec<ClientInfo>, ResultCode> {
        let (result, output) = self.svc(Command::ClientDirectory, &[]);
        if !result.is_good() {
            return Err(result);
        }
        decode_directory(&output).ok_or(ResultCode::Invalid)
    }

    pub fn info(&mut self, kind: InfoKind) -> Result<Vec<u8>, ResultCode> {
        let (result, output) = self.svc(kind.command(), &[]);
        if result.is_good() {
            Ok(output)
        } else {
            Err(result)
        }
    }

    pub fn unblock(&mut self, client: &ClientName) -> ResultCode {
        self.svc(Command::UnblockClient, &encode_client_name(client)).0
    }

    pub fn suspend(&mut self) -> ResultCode {
        self.svc(Command::Suspend, &[]).0
    }

    pub fn resume(&mut self) -> ResultCode {
        self.svc(Command::Resume, &[]).0
    }

    pub fn reconfigure(&mut self) -> ResultCode {
        self.svc(Command::Reconfigure, &[]).0
    }

    pub fn terminate(&mut self) -> ResultCode {
        self.svc(Command::Terminate, &[]).0
    }

    pub fn set_link_params(&mut self, params: &[u8]) -> ResultCode {
        self.svc(Command::SetLinkParams, params).0
    }

    /// Send device command `code` (16 and up).
    pub fn device(&mut self, code: u32, params: &[u8]) -> ResultCode {
        match Command::from_code(code) {
            Some(command @ Command::Device(_)) => self.svc(command, params).0,
            _ => ResultCode::Invalid,
        }
    }

    pub fn ack_command(&mut self) -> ResultCode {
        self.svc(Command::AckCommand, &[]).0
    }

    /// Progress of this connection's device command as the broker last wrote it.
    pub fn command_status(&self) -> CommandStatus {
        match (self.region.as_ref(), self.conn) {
            (Some(region), Some(conn)) => region.mailbox(conn).command_status(),
            _ => CommandStatus::Idle,
        }
    }

    /// Give the connection back; the broker deactivates this client on its
    /// next maintenance pass.
    pub fn detach(&mut self) {
        if let (Some(region), Some(conn)) = (self.region.as_ref(), self.conn) {
            region
                .mailbox(conn)
                .header()
                .state
                .store(CONN_CLOSING, std::sync::atomic::Ordering::Release);
            region.ring_doorbell();
            debug!(station = %self.station, client = %self.name, "detached");
        }
        self.region = None;
        self.conn = None;
        self.client = None;
        self.state = LinkState::Detached;
    }
}

impl Drop for StationConnection {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Same-user clients sleep on the pending word; others poll it.
fn wait_for_completion(
    region: &ServiceRegion,
    conn: ConnectionId,
    deadline: Instant,
    step: Duration,
    same_user: bool,
) -> Wait {
    let mailbox = region.mailbox(conn);
    loop {
        if !mailbox.is_pending() {
            return Wait::Done;
        }
        if region.state() == RegionState::Terminated {
            return Wait::BrokerGone;
        }
        let now = Instant::now();
        if now >= deadline {
            return Wait::TimedOut;
        }
        let nap = step.min(deadline - now);
        if same_user {
            futex_wait(&mailbox.header().pending, 1, nap);
        } else {
            std::thread::sleep(nap);
        }
    }
}

/// Something `ClientSession::scan` found.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// New records from `station`.
    Records { station: String, records: Vec<Record> },
    /// `station` changed status (restarted, died, unreachable).
    Alert { station: String, code: ResultCode },
}

/// A set of station connections polled round-robin.
#[derive(Default)]
pub struct ClientSession {
    stations: Vec<StationConnection>,
    next: usize,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, station: StationConnection) {
        self.stations.push(station);
    }

    pub fn stations(&self) -> &[StationConnection] {
        &self.stations
    }

    pub fn station_mut(&mut self, station: &str) -> Option<&mut StationConnection> {
        self.stations.iter_mut().find(|s| s.station() == station)
    }

    /// Visit each station at most once, starting after the one that answered
    /// last time. Returns the first station with records or a new non-good
    /// status, or `None` after a quiet round.
    pub fn scan(&mut self) -> Option<ScanEvent> {
        let count = self.stations.len();
        for _ in 0..count {
            let index = self.next;
            self.next = (self.next + 1) % count;
            let station = &mut self.stations[index];

            let mut status = station.check();
            if status.is_good() {
                match station.fetch() {
                    Ok(reply) if !reply.records.is_empty() => {
                        station.set_last_status(ResultCode::Good);
                        return Some(ScanEvent::Records {
                            station: station.station().to_string(),
                            records: reply.records,
                        });
                    }
                    Ok(_) => {}
                    Err(code) => status = code,
                }
            }

            let previous = station.last_status();
            station.set_last_status(status);
            if status == ResultCode::Changed || (status != previous && !status.is_good()) {
                return Some(ScanEvent::Alert {
                    station: station.station().to_string(),
                    code: status,
                });
            }
        }
        None
    }
}
