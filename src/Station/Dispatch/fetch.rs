// FetchRecords: acknowledge what the client has consumed, then merge pending
// records from all rings in packet order into one reply.

use tracing::warn;

use crate::error::ResultCode;
use crate::Station::Buffer::{ClientId, QueueKind, RecordStore, SlotIdx};
use crate::Station::Service::wire::{FetchReplyWriter, FetchRequest, SeqMode};
use crate::Station::{ClientSlot, Cursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub result: ResultCode,
    pub delivered: u32,
    /// Packet number the client should continue from.
    pub resume_from: u64,
    /// Rings in which unread records were evicted before this fetch.
    pub gaps: u32,
}

/// Serve one fetch for `client`. The reply is appended to `out`, which may
/// grow by at most `capacity` bytes.
pub fn fetch_records(
    store: &mut RecordStore,
    id: ClientId,
    client: &mut ClientSlot,
    request: &FetchRequest,
    out: &mut Vec<u8>,
    capacity: usize,
) -> FetchOutcome {
    let mut gaps = 0;

    match (request.mode, client.primed) {
        (SeqMode::First, _) => {
            client.reset_cursors();
        }
        (SeqMode::Last, _) => {
            skip_to_newest(store, id, client);
        }
        (SeqMode::Continue, false) => {
            // First fetch after an attach: start at the tail, but honour what
            // the client says it already has
            client.reset_cursors();
            for kind in QueueKind::ALL {
                acknowledge(store, id, client, kind, request.next_packet);
            }
        }
        (SeqMode::Continue, true) => {
            for kind in QueueKind::ALL {
                let fresh = store.ring(kind).evictions() > client.evictions_seen[kind.index()];
                if fresh && overtaken(store, client, kind, request.next_packet) {
                    gaps += 1;
                    client.gaps += 1;
                    warn!(
                        client = %client.name,
                        queue = %kind,
                        next_wanted = request.next_packet,
                        evicted = ?store.ring(kind).last_evicted(),
                        "records evicted before delivery, resuming at oldest"
                    );
                }
                acknowledge(store, id, client, kind, request.next_packet);
            }
        }
    }
    // Evictions up to here are judged; only later ones can be new gaps
    for kind in QueueKind::ALL {
        client.evictions_seen[kind.index()] = store.ring(kind).evictions();
    }
    client.primed = true;

    let (delivered, resume_from, too_small) = merge(store, client, request, out, capacity);

    let result = if too_small {
        ResultCode::BufferTooSmall
    } else if delivered == 0 {
        ResultCode::NoData
    } else {
        ResultCode::Good
    };

    FetchOutcome {
        result,
        delivered,
        resume_from,
        gaps,
    }
}

/// Offset from the tail of the first slot after the client's ack position.
fn pending_start(store: &RecordStore, client: &ClientSlot, kind: QueueKind) -> usize {
    let ring = store.ring(kind);
    match client.cursors[kind.index()] {
        Some(cursor) if ring.is_live(cursor.slot) && ring.slot(cursor.slot).packet_num() == cursor.packet => {
            ring.offset_of(cursor.slot) + 1
        }
        // Never acked, or the acked slot has been reused: everything live is newer
        _ => 0,
    }
}

/// Whether the ring dropped a record the client has not yet been sent.
fn overtaken(store: &RecordStore, client: &ClientSlot, kind: QueueKind, next_wanted: u64) -> bool {
    let ring = store.ring(kind);
    let Some(evicted) = ring.last_evicted() else {
        return false;
    };
    if evicted < next_wanted {
        return false;
    }
    // Nothing pending was lost if the ack position is still live
    match client.cursors[kind.index()] {
        Some(cursor) => !(ring.is_live(cursor.slot) && ring.slot(cursor.slot).packet_num() == cursor.packet),
        None => true,
    }
}

/// Walk the client's ack position forward over every slot below `next_wanted`.
fn acknowledge(store: &mut RecordStore, id: ClientId, client: &mut ClientSlot, kind: QueueKind, next_wanted: u64) {
    let start = pending_start(store, client, kind);
    let len = store.ring(kind).len();

    for offset in start..len {
        let idx = store.ring(kind).at_offset(offset);
        let packet = store.ring(kind).slot(idx).packet_num();
        if packet >= next_wanted {
            break;
        }
        store.ack(kind, idx, id);
        client.cursors[kind.index()] = Some(Cursor { slot: idx, packet });
    }
}

/// Pretend the client has seen everything published so far.
fn skip_to_newest(store: &mut RecordStore, id: ClientId, client: &mut ClientSlot) {
    for kind in QueueKind::ALL {
        let ring = store.ring(kind);
        client.cursors[kind.index()] = ring.newest().map(|slot| Cursor {
            slot,
            packet: ring.slot(slot).packet_num(),
        });
    }
    store.unblock(id);
}

/// Copy pending records in global packet order. Returns the count written,
/// the resume point and whether the buffer could not take a single record.
fn merge(
    store: &RecordStore,
    client: &ClientSlot,
    request: &FetchRequest,
    out: &mut Vec<u8>,
    capacity: usize,
) -> (u32, u64, bool) {
    let mut positions = QueueKind::ALL.map(|kind| pending_start(store, client, kind));
    let mut writer = FetchReplyWriter::new(out, capacity);
    if !writer.header_fits() {
        let resume_from = store.next_packet();
        writer.finish(resume_from);
        return (0, resume_from, true);
    }

    let limit = match request.max_records {
        0 => u32::MAX,
        n => n,
    };

    let next_pending = |positions: &[usize; QueueKind::COUNT]| -> Option<(QueueKind, SlotIdx, u64)> {
        QueueKind::ALL
            .iter()
            .filter_map(|&kind| {
                let ring = store.ring(kind);
                let offset = positions[kind.index()];
                (offset < ring.len()).then(|| {
                    let idx = ring.at_offset(offset);
                    (kind, idx, ring.slot(idx).packet_num())
                })
            })
            .min_by_key(|&(_, _, packet)| packet)
    };

    let mut too_small = false;
    let resume_from = loop {
        let Some((kind, idx, packet)) = next_pending(&positions) else {
            break store.next_packet();
        };
        if writer.count() >= limit {
            break packet;
        }

        let slot = store.ring(kind).slot(idx);
        if request.accepts(kind, &slot.stream(), slot.header_time()) && !writer.push(kind, slot) {
            too_small = writer.count() == 0;
            break packet;
        }
        positions[kind.index()] += 1;
    };

    let delivered = writer.finish(resume_from);
    (delivered, resume_from, too_small)
}
