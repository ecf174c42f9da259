use tracing::{debug, trace, warn};

use super::clientset::{ClientId, ClientSet};
use super::Buffer::{QueueKind, QueueMask, Ring, Slot, SlotIdx};
use crate::config::QueueSizes;
use crate::error::RecordError;
use crate::Station::Structs::StreamId;

impl Ring {
    pub(crate) fn new(kind: QueueKind, slots: usize, slot_size: usize) -> Self {
        Self {
            kind,
            slots: (0..slots).map(|_| Slot::new(slot_size)).collect(),
            tail: 0,
            len: 0,
            evictions: 0,
            last_evicted: None,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Oldest live slot.
    pub fn tail(&self) -> SlotIdx {
        SlotIdx(self.tail)
    }

    /// Next slot handed to the producer.
    pub fn head(&self) -> SlotIdx {
        SlotIdx(((self.tail as usize + self.len()) % self.capacity()) as u32)
    }

    /// Records dropped because the ring was full.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn last_evicted(&self) -> Option<u64> {
        self.last_evicted
    }

    #[inline]
    pub fn next(&self, idx: SlotIdx) -> SlotIdx {
        SlotIdx(((idx.index() + 1) % self.capacity()) as u32)
    }

    /// Distance of `idx` from the tail.
    #[inline]
    pub fn offset_of(&self, idx: SlotIdx) -> usize {
        (idx.index() + self.capacity() - self.tail as usize) % self.capacity()
    }

    /// Slot `offset` places after the tail.
    #[inline]
    pub fn at_offset(&self, offset: usize) -> SlotIdx {
        SlotIdx(((self.tail as usize + offset) % self.capacity()) as u32)
    }

    pub fn is_live(&self, idx: SlotIdx) -> bool {
        idx.index() < self.capacity() && self.offset_of(idx) < self.len()
    }

    pub fn slot(&self, idx: SlotIdx) -> &Slot {
        &self.slots[idx.index()]
    }

    pub(crate) fn slot_mut(&mut self, idx: SlotIdx) -> &mut Slot {
        &mut self.slots[idx.index()]
    }

    /// Live slots, oldest first.
    pub fn live(&self) -> impl Iterator<Item = SlotIdx> + '_ {
        (0..self.len()).map(move |offset| self.at_offset(offset))
    }

    /// Newest live slot.
    pub fn newest(&self) -> Option<SlotIdx> {
        self.len().checked_sub(1).map(|offset| self.at_offset(offset))
    }

    /// Whether the producer may take the head slot without breaking a
    /// delivery promise to an active client.
    pub(crate) fn reusable(&self, active: ClientSet) -> bool {
        !self.is_full() || self.slot(self.tail()).blocking.intersection(active).is_empty()
    }

    /// Hand out the head slot, evicting the tail first when full.
    /// Caller has checked `reusable`.
    pub(crate) fn claim(&mut self, packet_num: u64, blocking: ClientSet) -> SlotIdx {
        if self.is_full() {
            let evicted = self.slot(self.tail()).packet_num;
            self.tail = self.next(self.tail()).0;
            self.len -= 1;
            self.evictions += 1;
            self.last_evicted = Some(evicted);
            trace!(queue = %self.kind, packet = evicted, "evicted oldest record");
        }
        let idx = self.head();
        self.len += 1;

        let slot = self.slot_mut(idx);
        slot.clear();
        slot.packet_num = packet_num;
        slot.blocking = blocking;
        idx
    }
}

/// The six rings plus the broker-wide delivery bookkeeping they share.
pub struct RecordStore {
    rings: Vec<Ring>,
    next_packet: u64,
    /// Clients currently attached.
    active: ClientSet,
    /// Attached clients that asked for guaranteed delivery.
    promised: ClientSet,
    /// While set, new slots carry no delivery promises.
    suspended: bool,
    /// Queues the producer must not write to.
    blocked: QueueMask,
}

impl RecordStore {
    /// Build the rings; `sizes` is `(slots, slot_size)` per kind in `QueueKind::ALL` order.
    pub fn new(sizes: [(usize, usize); QueueKind::COUNT]) -> Self {
        let rings = QueueKind::ALL
            .iter()
            .zip(sizes.iter())
            .map(|(&kind, &(slots, size))| Ring::new(kind, slots.max(1), size))
            .collect();

        Self {
            rings,
            next_packet: 0,
            active: ClientSet::EMPTY,
            promised: ClientSet::EMPTY,
            suspended: false,
            blocked: QueueMask::NONE,
        }
    }

    pub fn from_config(queues: &QueueSizes) -> Self {
        Self::new(QueueKind::ALL.map(|kind| {
            let queue = queues.get(kind);
            (queue.slots, queue.slot_size)
        }))
    }

    pub fn ring(&self, kind: QueueKind) -> &Ring {
        &self.rings[kind.index()]
    }

    pub(crate) fn ring_mut(&mut self, kind: QueueKind) -> &mut Ring {
        &mut self.rings[kind.index()]
    }

    /// Packet number the next published record will get.
    pub fn next_packet(&self) -> u64 {
        self.next_packet
    }

    pub fn blocked_mask(&self) -> QueueMask {
        self.blocked
    }

    pub fn active_clients(&self) -> ClientSet {
        self.active
    }

    pub fn blocking_clients(&self) -> ClientSet {
        self.promised
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// The slot the producer should fill next, or `None` when reusing it
    /// would drop a record an active blocking client has not acknowledged.
    pub fn get_buffer(&mut self, kind: QueueKind) -> Option<&mut Slot> {
        let active = self.active;
        if !self.ring(kind).reusable(active) {
            return None;
        }

        let packet_num = self.next_packet;
        self.next_packet += 1;
        let promise = if self.suspended {
            ClientSet::EMPTY
        } else {
            self.promised
        };

        let ring = self.ring_mut(kind);
        let idx = ring.claim(packet_num, promise);
        Some(ring.slot_mut(idx))
    }

    /// Non-mutating peek: would `get_buffer` succeed?
    pub fn buffer_available(&self, kind: QueueKind) -> bool {
        self.ring(kind).reusable(self.active)
    }

    /// Refresh the blocked flag of one queue (or every queue with `None`).
    /// Returns whether any queue is blocked.
    pub fn check_and_update_block_mask(&mut self, kind: Option<QueueKind>) -> bool {
        let kinds: &[QueueKind] = match kind {
            Some(ref kind) => std::slice::from_ref(kind),
            None => &QueueKind::ALL,
        };

        for &kind in kinds {
            let blocked = !self.buffer_available(kind);
            if blocked != self.blocked.contains(kind) {
                if blocked {
                    let holders = self.ring(kind).slot(self.ring(kind).tail()).blocking;
                    warn!(queue = %kind, clients = ?holders, "queue blocked by unacknowledged records");
                } else {
                    debug!(queue = %kind, "queue unblocked");
                }
            }
            self.blocked.set(kind, blocked);
        }

        !self.blocked.is_empty()
    }

    /// Drop every delivery obligation `client` holds.
    pub fn unblock(&mut self, client: ClientId) {
        for ring in &mut self.rings {
            for slot in &mut ring.slots {
                slot.blocking.remove(client);
            }
        }
    }

    /// Clear `client`'s bit on one slot: the client has consumed it.
    pub(crate) fn ack(&mut self, kind: QueueKind, idx: SlotIdx, client: ClientId) {
        self.ring_mut(kind).slot_mut(idx).blocking.remove(client);
    }

    /// Make `client` owe an ack for every live record.
    pub fn add_block(&mut self, client: ClientId) {
        for ring in &mut self.rings {
            let live: Vec<SlotIdx> = ring.live().collect();
            for idx in live {
                ring.slot_mut(idx).blocking.insert(client);
            }
        }
    }

    /// Record that `client` attached; blocking clients start owing acks.
    pub fn activate(&mut self, client: ClientId, blocking: bool) {
        self.active.insert(client);
        if blocking && !self.promised.contains(client) {
            self.promised.insert(client);
            self.add_block(client);
        }
    }

    /// Record that `client` is gone and release everything it held.
    pub fn deactivate(&mut self, client: ClientId) {
        self.active.remove(client);
        self.promised.remove(client);
        self.unblock(client);
    }

    /// Convenience for producers: take a slot and fill it in one step.
    /// Returns the packet number.
    pub fn publish(
        &mut self,
        kind: QueueKind,
        stream: StreamId,
        reception: f64,
        header_time: f64,
        bytes: &[u8],
    ) -> Result<u64, RecordError> {
        let capacity = self.ring(kind).slot(SlotIdx(0)).capacity();
        if bytes.len() > capacity {
            return Err(RecordError::TooLarge {
                len: bytes.len(),
                capacity,
            });
        }
        let slot = self
            .get_buffer(kind)
            .ok_or_else(|| RecordError::Blocked(kind.name()))?;
        slot.write(stream, reception, header_time, bytes)?;
        Ok(slot.packet_num())
    }
}
