// In src/Station/broker.rs
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Relaxed};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use super::Buffer::{QueueKind, RecordStore, Slot, MAXCLIENTS};
use super::Dispatch::{BrokerState, Caller, InfoKind};
use super::Service::layout::{RegionState, CONN_CLOSING, CONN_OPEN};
use super::Service::{ConnectionId, ServiceRegion};
use super::Structs::StreamId;
use super::DetachReason;
use crate::error::{CommandStatus, RecordError, ResultCode};
use crate::Core::process::process_alive;

/// The station broker: owns the record store, the client table and the
/// service region, and runs the poll loop that answers client requests.
///
/// The producer side (`get_buffer` and friends) and the poll loop are meant
/// to run on the same thread.
pub struct Broker {
    state: BrokerState,
    region: ServiceRegion,
    next_entry: usize,
    max_proc: usize,
    poll_interval: Duration,
    out: Vec<u8>,
}

impl Broker {
    pub(crate) fn new(
        state: BrokerState,
        region: ServiceRegion,
        max_proc: usize,
        poll_interval: Duration,
    ) -> Self {
        let capacity = region.output_capacity();
        Self {
            state,
            region,
            next_entry: 0,
            max_proc: max_proc.max(1),
            poll_interval,
            out: Vec::with_capacity(capacity),
        }
    }

    // ---- Producer API ----

    /// The slot to fill next in `kind`, or `None` while the queue is blocked.
    pub fn get_buffer(&mut self, kind: QueueKind) -> Option<&mut Slot> {
        self.state.store.get_buffer(kind)
    }

    pub fn buffer_available(&self, kind: QueueKind) -> bool {
        self.state.store.buffer_available(kind)
    }

    /// Refresh the blocked-queue mask; true while any queue is blocked.
    pub fn check_and_update_block_mask(&mut self, kind: Option<QueueKind>) -> bool {
        self.state.store.check_and_update_block_mask(kind)
    }

    pub fn publish(
        &mut self,
        kind: QueueKind,
        stream: StreamId,
        reception: f64,
        header_time: f64,
        bytes: &[u8],
    ) -> Result<u64, RecordError> {
        self.state
            .store
            .publish(kind, stream, reception, header_time, bytes)
    }

    /// Publish a blob answered to info queries of `kind`.
    pub fn set_info(&mut self, kind: InfoKind, blob: Option<Vec<u8>>) {
        self.state.set_info(kind, blob);
    }

    /// Report progress of the outstanding device command to its owner.
    pub fn complete_device_command(&mut self, status: CommandStatus) {
        if let Some(conn) = self.state.complete_device_command(status) {
            self.region.mailbox(conn).set_command_status(status);
        }
    }

    // ---- Accessors ----

    pub fn store(&self) -> &RecordStore {
        &self.state.store
    }

    pub fn state(&self) -> &BrokerState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut BrokerState {
        &mut self.state
    }

    pub fn region(&self) -> &ServiceRegion {
        &self.region
    }

    pub fn invocation(&self) -> u64 {
        self.state.invocation()
    }

    pub fn gap_events(&self) -> u64 {
        self.state.gap_events()
    }

    pub fn terminate_requested(&self) -> bool {
        self.state.terminate_requested()
    }

    pub fn take_reconfigure_request(&mut self) -> bool {
        self.state.take_reconfigure_request()
    }

    // ---- Poll loop ----

    /// Service up to `max_proc` queued requests. Returns how many were handled.
    pub fn poll_once(&mut self) -> usize {
        self.poll_once_at(Instant::now())
    }

    pub fn poll_once_at(&mut self, now: Instant) -> usize {
        let pending = self.region.take_pending(self.next_entry, self.max_proc);
        self.next_entry = (self.next_entry + 1) % MAXCLIENTS;

        for &conn in &pending {
            self.service(conn, now);
        }
        pending.len()
    }

    fn service(&mut self, conn: ConnectionId, now: Instant) {
        let mailbox = self.region.mailbox(conn);
        if !mailbox.is_pending() {
            // Withdrawn by a client that gave up
            return;
        }

        let header = mailbox.header();
        if header.state.load(Acquire) != CONN_OPEN {
            mailbox.complete(ResultCode::Invalid, &[], CommandStatus::Idle);
            return;
        }

        let caller = Caller {
            connection: conn,
            name: mailbox.owner(),
            pid: header.client_pid.load(Relaxed),
            uid: header.client_uid.load(Relaxed),
        };
        let (code, input) = mailbox.read_request();

        self.out.clear();
        let result = self.state.dispatch(
            &caller,
            code,
            &input,
            &mut self.out,
            mailbox.output_capacity(),
            now,
        );
        trace!(connection = %conn, code, ?result, "request serviced");

        let status = self.state.session(conn).command_status;
        mailbox.complete(result, &self.out, status);
    }

    /// Liveness sweep and backpressure refresh.
    pub fn maintenance(&mut self, now: Instant) {
        let gone: Vec<_> = self
            .state
            .clients()
            .iter()
            .filter(|(_, c)| c.active && !process_alive(c.pid))
            .map(|(id, _)| id)
            .collect();
        for id in gone {
            self.state.evict(id, DetachReason::ProcessGone);
        }

        let expired = self.state.clients().timed_out(now);
        for id in expired {
            self.state.evict(id, DetachReason::TimedOut);
        }

        for conn in ConnectionId::all() {
            let mailbox = self.region.mailbox(conn);
            let header = mailbox.header();
            let reason = match header.state.load(Acquire) {
                CONN_CLOSING => DetachReason::Detached,
                CONN_OPEN if !process_alive(header.client_pid.load(Relaxed)) => {
                    DetachReason::ProcessGone
                }
                _ => continue,
            };
            debug!(connection = %conn, owner = %mailbox.owner(), ?reason, "connection closed");
            self.state.close_connection(conn, reason);
            mailbox.release();
        }

        self.state.store.check_and_update_block_mask(None);
    }

    /// Run until `stop` is set or a client requests termination.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!(region = self.region.name(), invocation = self.invocation(), "broker running");

        while !stop.load(Relaxed) && !self.state.terminate_requested() {
            let seen = self.region.doorbell();
            let now = Instant::now();
            let serviced = self.poll_once_at(now);
            self.maintenance(now);
            if serviced == 0 {
                self.region.wait_doorbell(seen, self.poll_interval);
            }
        }

        info!(region = self.region.name(), "broker stopping");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.region.set_state(RegionState::Terminated);
    }
}
