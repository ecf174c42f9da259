// Client descriptors owned by the broker

use std::time::{Duration, Instant};

use tracing::info;

use crate::config::ReservedClient;
use crate::error::BrokerError;
use crate::Station::Buffer::{ClientId, ClientSet, QueueKind, SlotIdx, MAXCLIENTS};
use crate::Station::Service::layout::ClientName;
use crate::Station::Service::ConnectionId;

/// Timeout given to clients that are not declared in the configuration.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(3600);

/// A client's remembered position in one ring: the last slot it has
/// acknowledged and the packet that slot held at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub slot: SlotIdx,
    pub packet: u64,
}

/// Why a client stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    Detached,
    TimedOut,
    ProcessGone,
    Replaced,
}

#[derive(Debug, Clone)]
pub struct ClientSlot {
    pub name: ClientName,
    pub pid: u32,
    pub uid: u32,
    pub blocking: bool,
    pub reserved: bool,
    pub timeout: Duration,
    pub active: bool,
    pub last_service: Instant,
    /// Per-queue ack position; `None` means "start at the tail".
    pub cursors: [Option<Cursor>; QueueKind::COUNT],
    /// Cursors have been set by a fetch since the last attach.
    pub primed: bool,
    /// Times this client's cursor was overtaken by eviction.
    pub gaps: u64,
    /// Per-queue eviction count already judged for gaps.
    pub evictions_seen: [u64; QueueKind::COUNT],
    pub connection: Option<ConnectionId>,
}

impl ClientSlot {
    fn new(name: ClientName, blocking: bool, reserved: bool, timeout: Duration) -> Self {
        Self {
            name,
            pid: 0,
            uid: 0,
            blocking,
            reserved,
            timeout,
            active: false,
            last_service: Instant::now(),
            cursors: [None; QueueKind::COUNT],
            primed: false,
            gaps: 0,
            evictions_seen: [0; QueueKind::COUNT],
            connection: None,
        }
    }

    pub fn reset_cursors(&mut self) {
        self.cursors = [None; QueueKind::COUNT];
        self.primed = false;
    }
}

/// Result of an attach against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: ClientId,
    /// The client was not active before this attach.
    pub newly_active: bool,
    pub blocking: bool,
}

/// Fixed table of up to `MAXCLIENTS` clients.
pub struct ClientTable {
    slots: Vec<Option<ClientSlot>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAXCLIENTS],
        }
    }

    /// Table with the configured clients pre-declared in order.
    pub fn with_reserved(reserved: &[ReservedClient]) -> Result<Self, BrokerError> {
        if reserved.len() > MAXCLIENTS {
            return Err(BrokerError::Invalid(format!(
                "{} reserved clients, at most {}",
                reserved.len(),
                MAXCLIENTS
            )));
        }
        let mut table = Self::new();
        for (i, client) in reserved.iter().enumerate() {
            let name = ClientName::new(&client.name).ok_or_else(|| {
                BrokerError::Invalid(format!("bad reserved client name {:?}", client.name))
            })?;
            table.slots[i] = Some(ClientSlot::new(
                name,
                client.blocking,
                true,
                client.timeout(),
            ));
        }
        Ok(table)
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientSlot> {
        self.slots[id.index()].as_ref()
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientSlot> {
        self.slots[id.index()].as_mut()
    }

    pub fn find(&self, name: &ClientName) -> Option<ClientId> {
        self.iter()
            .find(|(_, slot)| slot.name == *name)
            .map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &ClientSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| Some((ClientId::new(i)?, slot.as_ref()?)))
    }

    pub fn active_set(&self) -> ClientSet {
        self.iter()
            .filter(|(_, slot)| slot.active)
            .map(|(id, _)| id)
            .collect()
    }

    /// Attach `name`: reuse its slot if known, otherwise take an empty slot
    /// or the slot of an inactive unreserved client. `None` when full.
    pub fn register(
        &mut self,
        name: ClientName,
        pid: u32,
        uid: u32,
        now: Instant,
    ) -> Option<Registration> {
        let id = match self.find(&name) {
            Some(id) => id,
            None => {
                let free = self
                    .slots
                    .iter()
                    .position(Option::is_none)
                    .or_else(|| {
                        self.slots.iter().position(|slot| {
                            slot.as_ref()
                                .map(|s| !s.reserved && !s.active)
                                .unwrap_or(false)
                        })
                    })?;
                self.slots[free] = Some(ClientSlot::new(
                    name,
                    false,
                    false,
                    DEFAULT_CLIENT_TIMEOUT,
                ));
                ClientId::new(free)?
            }
        };

        let slot = self.slots[id.index()].as_mut()?;
        let newly_active = !slot.active;
        slot.pid = pid;
        slot.uid = uid;
        slot.active = true;
        slot.last_service = now;
        slot.reset_cursors();

        if newly_active {
            info!(client = %name, id = %id, pid, blocking = slot.blocking, "client attached");
        }

        Some(Registration {
            id,
            newly_active,
            blocking: slot.blocking,
        })
    }

    /// Mark a client inactive. Returns false if it already was.
    pub fn deactivate(&mut self, id: ClientId, reason: DetachReason) -> bool {
        let Some(slot) = self.slots[id.index()].as_mut() else {
            return false;
        };
        if !slot.active {
            return false;
        }
        slot.active = false;
        slot.connection = None;
        info!(client = %slot.name, id = %id, ?reason, "client detached");
        true
    }

    /// Blocking clients that have not been heard from within their timeout.
    pub fn timed_out(&self, now: Instant) -> Vec<ClientId> {
        self.iter()
            .filter(|(_, slot)| {
                slot.active
                    && slot.blocking
                    && now.saturating_duration_since(slot.last_service) > slot.timeout
            })
            .map(|(id, _)| id)
            .collect()
    }
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}
