// View over a mapped station region: header, service queue and mailboxes.
// All addressing is by offset from the mapping base, so each process resolves
// the same layout against its own mapping.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::time::Duration;

use crossbeam_utils::CachePadded;

use super::layout::*;
use crate::config::ServicePolicy;
use crate::error::{BrokerError, CommandStatus, ResultCode};
use crate::Core::futex::{futex_wait, futex_wake, RegionLock};
use crate::Core::{align_up, attach_shared_memory, create_shared_memory, RegionBacking, SharedMemoryBackend};
use crate::Station::Buffer::MAXCLIENTS;

/// Values the broker publishes in a fresh region header.
#[derive(Debug, Clone)]
pub struct RegionParams {
    pub station: String,
    pub invocation: u64,
    pub broker_pid: u32,
    pub broker_uid: u32,
    pub output_capacity: usize,
    pub policy: ServicePolicy,
}

pub struct ServiceRegion {
    shm: Box<dyn SharedMemoryBackend>,
    header: *mut RegionHeader,
    name: String,
}

// Shared words are atomics; byte areas are only touched by the side that
// currently owns the mailbox according to the pending protocol.
unsafe impl Send for ServiceRegion {}
unsafe impl Sync for ServiceRegion {}

impl ServiceRegion {
    /// Offset of the first mailbox.
    pub fn mailbox_offset() -> usize {
        align_up(size_of::<RegionHeader>())
    }

    /// Bytes per connection: header plus output area, aligned.
    pub fn mailbox_stride(output_capacity: usize) -> usize {
        align_up(size_of::<MailboxHeader>() + output_capacity)
    }

    pub fn required_size(output_capacity: usize) -> usize {
        Self::mailbox_offset() + MAXCLIENTS * Self::mailbox_stride(output_capacity)
    }

    /// Create and initialize a region. The header starts `Initializing`.
    pub fn create(
        name: &str,
        backing: RegionBacking,
        params: &RegionParams,
    ) -> Result<Self, BrokerError> {
        let size = Self::required_size(params.output_capacity);
        let shm = create_shared_memory(size, name, backing)?;

        let header = shm.as_ptr() as *mut RegionHeader;
        if (header as usize) % crate::Core::REGION_ALIGN != 0 {
            return Err(BrokerError::Layout {
                name: name.to_string(),
                reason: "region not properly aligned".into(),
            });
        }

        let mut station = [0u8; STATION_NAME_LEN];
        let len = params.station.len().min(STATION_NAME_LEN);
        station[..len].copy_from_slice(&params.station.as_bytes()[..len]);

        // Only the creator writes the header wholesale, before anyone can see it
        unsafe {
            ptr::write(
                header,
                RegionHeader {
                    magic: 0,
                    version: LAYOUT_VERSION,
                    max_clients: MAXCLIENTS as u32,
                    invocation: AtomicU64::new(params.invocation),
                    state: AtomicU32::new(RegionState::Initializing as u32),
                    broker_pid: params.broker_pid,
                    broker_uid: params.broker_uid,
                    mailbox_stride: Self::mailbox_stride(params.output_capacity) as u32,
                    mailbox_offset: Self::mailbox_offset() as u32,
                    output_capacity: params.output_capacity as u32,
                    max_wait_ms: params.policy.max_wait_ms as u32,
                    same_user_poll_ms: params.policy.same_user_poll_ms as u32,
                    foreign_user_poll_ms: params.policy.foreign_user_poll_ms as u32,
                    probe_interval_ms: params.policy.probe_interval_ms as u32,
                    station,
                    service_lock: CachePadded::new(AtomicU32::new(0)),
                    doorbell: CachePadded::new(AtomicU32::new(0)),
                    entries: std::mem::zeroed(),
                },
            );
            // The magic goes in last so a racing attach never sees a half-built header
            std::sync::atomic::fence(Release);
            ptr::write_volatile(&mut (*header).magic, REGION_MAGIC);
        }

        Ok(Self {
            shm,
            header,
            name: name.to_string(),
        })
    }

    /// Map an existing region and check that it speaks this layout.
    pub fn attach(name: &str, backing: RegionBacking) -> Result<Self, BrokerError> {
        let shm = attach_shared_memory(name, size_of::<RegionHeader>(), backing)?;
        let header = shm.as_ptr() as *mut RegionHeader;

        let layout_error = |reason: String| BrokerError::Layout {
            name: name.to_string(),
            reason,
        };

        let (magic, version, max_clients, stride, offset, capacity) = unsafe {
            let h = &*header;
            (
                ptr::read_volatile(&h.magic),
                h.version,
                h.max_clients,
                h.mailbox_stride as usize,
                h.mailbox_offset as usize,
                h.output_capacity as usize,
            )
        };
        if magic != REGION_MAGIC {
            return Err(layout_error("invalid magic number".into()));
        }
        if version != LAYOUT_VERSION || max_clients != MAXCLIENTS as u32 {
            return Err(layout_error(format!(
                "layout v{} with {} clients, expected v{} with {}",
                version, max_clients, LAYOUT_VERSION, MAXCLIENTS
            )));
        }
        if stride != Self::mailbox_stride(capacity) || offset != Self::mailbox_offset() {
            return Err(layout_error("mailbox geometry mismatch".into()));
        }
        if shm.size() < Self::required_size(capacity) {
            return Err(layout_error(format!(
                "region is {} bytes, layout needs {}",
                shm.size(),
                Self::required_size(capacity)
            )));
        }

        Ok(Self {
            shm,
            header,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &RegionHeader {
        unsafe { &*self.header }
    }

    pub(crate) fn header_ptr(&self) -> *const RegionHeader {
        self.header
    }

    pub(crate) fn backend(&self) -> &dyn SharedMemoryBackend {
        &*self.shm
    }

    pub fn invocation(&self) -> u64 {
        self.header().invocation.load(Acquire)
    }

    pub fn state(&self) -> RegionState {
        RegionState::from_raw(self.header().state.load(Acquire))
    }

    pub fn set_state(&self, state: RegionState) {
        self.header().state.store(state as u32, Release);
        // Wake every waiting client so it re-reads the state
        for conn in ConnectionId::all() {
            futex_wake(&self.mailbox(conn).header().pending);
        }
    }

    pub fn broker_pid(&self) -> u32 {
        self.header().broker_pid
    }

    pub fn broker_uid(&self) -> u32 {
        self.header().broker_uid
    }

    pub fn output_capacity(&self) -> usize {
        self.header().output_capacity as usize
    }

    /// Client wait policy as configured by the broker.
    pub fn policy(&self) -> ServicePolicy {
        let h = self.header();
        ServicePolicy {
            max_wait_ms: h.max_wait_ms as u64,
            same_user_poll_ms: h.same_user_poll_ms as u64,
            foreign_user_poll_ms: h.foreign_user_poll_ms as u64,
            probe_interval_ms: h.probe_interval_ms as u64,
        }
    }

    pub fn mailbox(&self, conn: ConnectionId) -> Mailbox<'_> {
        let h = self.header();
        let base = unsafe {
            self.shm
                .as_ptr()
                .add(h.mailbox_offset as usize + conn.index() * h.mailbox_stride as usize)
        };
        Mailbox {
            base,
            output_capacity: h.output_capacity as usize,
            _region: PhantomData,
        }
    }

    pub fn lock(&self, timeout: Duration) -> Option<RegionLock<'_>> {
        RegionLock::acquire(&self.header().service_lock, timeout)
    }

    /// Wake hint for the broker. Never required for correctness.
    pub fn ring_doorbell(&self) {
        let doorbell = &self.header().doorbell;
        doorbell.fetch_add(1, AcqRel);
        futex_wake(doorbell);
    }

    /// Broker side: sleep until the doorbell moves or `timeout` passes.
    pub fn wait_doorbell(&self, seen: u32, timeout: Duration) {
        futex_wait(&self.header().doorbell, seen, timeout);
    }

    pub fn doorbell(&self) -> u32 {
        self.header().doorbell.load(Acquire)
    }

    /// Client side: take a connection for `name`. Prefers the connection this
    /// name used before, then a never-used one, then any free one.
    /// Caller holds the region lock.
    pub fn claim_connection(&self, name: &ClientName, pid: u32, uid: u32) -> Option<ConnectionId> {
        let free: Vec<ConnectionId> = ConnectionId::all()
            .filter(|&conn| self.mailbox(conn).header().state.load(Acquire) == CONN_FREE)
            .collect();

        let chosen = free
            .iter()
            .copied()
            .find(|&conn| self.mailbox(conn).owner() == *name)
            .or_else(|| free.iter().copied().find(|&conn| self.mailbox(conn).owner().is_empty()))
            .or_else(|| free.first().copied())?;

        let mailbox = self.mailbox(chosen);
        let h = mailbox.header();
        mailbox.set_owner(name);
        h.client_pid.store(pid, Relaxed);
        h.client_uid.store(uid, Relaxed);
        h.pending.store(0, Relaxed);
        h.command_status.store(CommandStatus::Idle.code(), Relaxed);
        h.result.store(ResultCode::Good.code(), Relaxed);
        h.state.store(CONN_OPEN, Release);
        Some(chosen)
    }

    /// Client side: post `conn` to the service queue. Caller holds the lock.
    pub fn enqueue(&self, conn: ConnectionId, name: &ClientName) -> bool {
        let entries = &self.header().entries;
        let free = |e: &ServiceEntry| e.handle.load(Acquire) == 0;
        let entry_name = |e: &ServiceEntry| unsafe { ClientName::from_bytes(ptr::read(e.name.get())) };

        let chosen = entries
            .iter()
            .find(|e| free(e) && entry_name(e) == *name)
            .or_else(|| entries.iter().find(|e| free(e) && entry_name(e).is_empty()))
            .or_else(|| entries.iter().find(|e| free(e)));

        match chosen {
            Some(entry) => {
                unsafe { ptr::write(entry.name.get(), name.as_bytes()) };
                entry.handle.store(conn.handle(), Release);
                true
            }
            None => false,
        }
    }

    /// Client side: take `conn` back off the service queue if the broker has
    /// not picked it up yet. Caller holds the lock.
    pub fn withdraw(&self, conn: ConnectionId) -> bool {
        self.header()
            .entries
            .iter()
            .any(|e| e.handle.compare_exchange(conn.handle(), 0, AcqRel, Relaxed).is_ok())
    }

    /// Broker side: pop up to `max` posted connections, scanning from `start`
    /// so that low entries cannot starve high ones.
    pub fn take_pending(&self, start: usize, max: usize) -> Vec<ConnectionId> {
        let entries = &self.header().entries;
        let mut taken = Vec::with_capacity(max);
        for i in 0..MAXCLIENTS {
            if taken.len() >= max {
                break;
            }
            let entry = &entries[(start + i) % MAXCLIENTS];
            let handle = entry.handle.swap(0, AcqRel);
            if let Some(conn) = ConnectionId::from_handle(handle) {
                taken.push(conn);
            }
        }
        taken
    }
}

/// View of one connection's mailbox.
pub struct Mailbox<'a> {
    base: *mut u8,
    output_capacity: usize,
    _region: PhantomData<&'a ServiceRegion>,
}

impl<'a> Mailbox<'a> {
    pub fn header(&self) -> &'a MailboxHeader {
        unsafe { &*(self.base as *const MailboxHeader) }
    }

    pub fn output_capacity(&self) -> usize {
        self.output_capacity
    }

    pub fn owner(&self) -> ClientName {
        unsafe { ClientName::from_bytes(ptr::read(self.header().owner.get())) }
    }

    pub fn set_owner(&self, name: &ClientName) {
        unsafe { ptr::write(self.header().owner.get(), name.as_bytes()) };
    }

    pub fn is_pending(&self) -> bool {
        self.header().pending.load(Acquire) != 0
    }

    pub fn result(&self) -> ResultCode {
        ResultCode::try_from(self.header().result.load(Acquire)).unwrap_or(ResultCode::Invalid)
    }

    pub fn command_status(&self) -> CommandStatus {
        CommandStatus::try_from(self.header().command_status.load(Acquire))
            .unwrap_or(CommandStatus::Idle)
    }

    /// Client side: stage a request. The mailbox must not be pending.
    pub fn write_request(&self, command: u32, input: &[u8]) -> bool {
        if input.len() > REQUEST_BYTES {
            return false;
        }
        let h = self.header();
        unsafe {
            ptr::copy_nonoverlapping(input.as_ptr(), h.input.get() as *mut u8, input.len());
        }
        h.command.store(command, Relaxed);
        h.input_len.store(input.len() as u32, Relaxed);
        h.output_len.store(0, Relaxed);
        h.pending.store(1, Release);
        true
    }

    /// Broker side: command code and a copy of the parameters.
    pub fn read_request(&self) -> (u32, Vec<u8>) {
        let h = self.header();
        let len = (h.input_len.load(Acquire) as usize).min(REQUEST_BYTES);
        let mut input = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(h.input.get() as *const u8, input.as_mut_ptr(), len);
        }
        (h.command.load(Acquire), input)
    }

    /// Broker side: publish the response and release the client.
    pub fn complete(&self, result: ResultCode, output: &[u8], status: CommandStatus) {
        let h = self.header();
        let len = output.len().min(self.output_capacity);
        unsafe {
            ptr::copy_nonoverlapping(output.as_ptr(), self.output_ptr(), len);
        }
        h.output_len.store(len as u32, Relaxed);
        h.result.store(result.code(), Relaxed);
        h.command_status.store(status.code(), Relaxed);
        h.pending.store(0, Release);
        futex_wake(&h.pending);
    }

    /// Client side: copy of the response bytes.
    pub fn read_output(&self) -> Vec<u8> {
        let len = (self.header().output_len.load(Acquire) as usize).min(self.output_capacity);
        let mut out = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(self.output_ptr(), out.as_mut_ptr(), len);
        }
        out
    }

    /// Give up a pending request that no one will service.
    pub fn cancel(&self) {
        self.header().pending.store(0, Release);
    }

    pub fn set_command_status(&self, status: CommandStatus) {
        self.header().command_status.store(status.code(), Release);
    }

    /// Return the connection to the free pool, keeping the owner name so the
    /// same client tends to get it back.
    pub fn release(&self) {
        let h = self.header();
        h.pending.store(0, Relaxed);
        h.command_status.store(CommandStatus::Idle.code(), Relaxed);
        h.state.store(CONN_FREE, Release);
    }

    unsafe fn output_ptr(&self) -> *mut u8 {
        self.base.add(size_of::<MailboxHeader>())
    }
}
