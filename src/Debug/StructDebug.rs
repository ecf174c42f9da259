use std::fmt;
use std::sync::atomic::Ordering;

use crate::Station::Buffer::{QueueKind, RecordStore, Ring};
use crate::Station::Service::{ServiceRegion, StationConnection};
use crate::Station::Broker;

/// Debug function for Ring
///
/// Shows occupancy and positions, never the payloads.
pub fn debug_ring(ring: &Ring, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Ring")
        .field("kind", &ring.kind())
        .field("len", &ring.len())
        .field("capacity", &ring.capacity())
        .field("tail", &ring.tail().index())
        .field("head", &ring.head().index())
        .field("evictions", &ring.evictions())
        .finish()
}

/// Debug function for RecordStore
///
/// Shows:
/// - Next packet number
/// - Active and blocking client sets
/// - Blocked queues and the suspend flag
/// - Every ring
pub fn debug_record_store(store: &RecordStore, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let rings: Vec<&Ring> = QueueKind::ALL.iter().map(|&kind| store.ring(kind)).collect();
    f.debug_struct("RecordStore")
        .field("next_packet", &store.next_packet())
        .field("active", &store.active_clients())
        .field("blocking", &store.blocking_clients())
        .field("blocked", &store.blocked_mask())
        .field("suspended", &store.is_suspended())
        .field("rings", &rings)
        .finish()
}

/// Debug function for ServiceRegion
///
/// Reads only header words; the mapping itself stays opaque.
pub fn debug_service_region(region: &ServiceRegion, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServiceRegion")
        .field("name", &region.name())
        .field("shm", &region.backend().raw_handle())
        .field("header", &format_args!("{:p}", region.header_ptr()))
        .field("state", &region.state())
        .field("invocation", &format_args!("{:#018x}", region.invocation()))
        .field("broker_pid", &region.broker_pid())
        .field("doorbell", &region.header().doorbell.load(Ordering::Relaxed))
        .finish()
}

pub fn debug_broker(broker: &Broker, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Broker")
        .field("region", broker.region())
        .field("store", broker.store())
        .field("gap_events", &broker.gap_events())
        .field("terminate_requested", &broker.terminate_requested())
        .finish_non_exhaustive()
}

pub fn debug_station_connection(conn: &StationConnection, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StationConnection")
        .field("station", &conn.station())
        .field("name", &conn.name())
        .field("state", &conn.state())
        .field("connection", &conn.connection())
        .field("invocation", &format_args!("{:#018x}", conn.invocation()))
        .field("next_packet", &conn.next_packet())
        .finish_non_exhaustive()
}
