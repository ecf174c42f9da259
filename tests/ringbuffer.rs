use station_broker::Station::Buffer::{ClientId, ClientSet, QueueKind, RecordStore};
use station_broker::Station::Structs::StreamId;
use station_broker::RecordError;

fn store_with_data(slots: usize) -> RecordStore {
    let mut sizes = [(4, 64); QueueKind::COUNT];
    sizes[QueueKind::Data.index()] = (slots, 64);
    RecordStore::new(sizes)
}

fn client(n: usize) -> ClientId {
    ClientId::new(n).unwrap()
}

fn fill(store: &mut RecordStore, kind: QueueKind, byte: u8) -> Option<u64> {
    let slot = store.get_buffer(kind)?;
    slot.write(StreamId::new("00", "BHZ"), 1.0, 1.0, &[byte; 8]).unwrap();
    Some(slot.packet_num())
}

#[test]
fn no_clients_never_blocks() {
    let mut store = store_with_data(3);

    assert_eq!(fill(&mut store, QueueKind::Data, 0), Some(0));
    assert_eq!(fill(&mut store, QueueKind::Data, 1), Some(1));
    assert_eq!(fill(&mut store, QueueKind::Data, 2), Some(2));
    assert!(store.ring(QueueKind::Data).is_full());

    assert_eq!(fill(&mut store, QueueKind::Data, 3), Some(3));
    let ring = store.ring(QueueKind::Data);
    assert_eq!(ring.evictions(), 1);
    assert_eq!(ring.last_evicted(), Some(0));
    let live: Vec<u64> = ring.live().map(|idx| ring.slot(idx).packet_num()).collect();
    assert_eq!(live, vec![1, 2, 3]);
}

#[test]
fn blocking_client_holds_full_ring() {
    let mut store = store_with_data(3);
    let c = client(0);
    store.activate(c, true);

    for i in 0..3 {
        assert_eq!(fill(&mut store, QueueKind::Data, i), Some(i as u64));
    }
    assert!(!store.buffer_available(QueueKind::Data));
    assert!(store.get_buffer(QueueKind::Data).is_none());
    assert!(store.check_and_update_block_mask(Some(QueueKind::Data)));
    assert!(store.blocked_mask().contains(QueueKind::Data));

    // Other queues are unaffected
    assert!(store.buffer_available(QueueKind::Timing));

    store.unblock(c);
    assert!(store.buffer_available(QueueKind::Data));
    assert!(!store.check_and_update_block_mask(None));
    assert_eq!(fill(&mut store, QueueKind::Data, 9), Some(3));
}

#[test]
fn non_blocking_clients_do_not_hold_slots() {
    let mut store = store_with_data(2);
    store.activate(client(1), false);

    for i in 0..5 {
        assert!(fill(&mut store, QueueKind::Data, i).is_some());
    }
    assert_eq!(store.ring(QueueKind::Data).evictions(), 3);
}

#[test]
fn suspended_store_makes_no_promises() {
    let mut store = store_with_data(2);
    let c = client(0);
    store.activate(c, true);
    store.set_suspended(true);

    for i in 0..4 {
        assert!(fill(&mut store, QueueKind::Data, i).is_some());
    }

    store.set_suspended(false);
    fill(&mut store, QueueKind::Data, 4);
    let ring = store.ring(QueueKind::Data);
    let newest = ring.newest().unwrap();
    assert!(ring.slot(newest).blocking().contains(c));
}

#[test]
fn add_block_covers_live_slots_only() {
    let mut store = store_with_data(4);
    fill(&mut store, QueueKind::Data, 0);
    fill(&mut store, QueueKind::Data, 1);

    let c = client(3);
    store.activate(c, true);

    let ring = store.ring(QueueKind::Data);
    for idx in ring.live() {
        assert!(ring.slot(idx).blocking().contains(c));
    }
    // The two unused slots carry nothing
    let unused = ring.head();
    assert!(ring.slot(unused).blocking().is_empty());
}

#[test]
fn deactivate_releases_everything() {
    let mut store = store_with_data(2);
    let c = client(0);
    store.activate(c, true);
    fill(&mut store, QueueKind::Data, 0);
    fill(&mut store, QueueKind::Data, 1);
    assert!(!store.buffer_available(QueueKind::Data));

    store.deactivate(c);
    assert!(store.buffer_available(QueueKind::Data));
    assert!(store.active_clients().is_empty());
    assert!(store.blocking_clients().is_empty());
}

#[test]
fn oversize_record_is_rejected() {
    let mut store = store_with_data(2);
    let err = store
        .publish(QueueKind::Data, StreamId::BLANK, 0.0, 0.0, &[0u8; 65])
        .unwrap_err();
    assert_eq!(err, RecordError::TooLarge { len: 65, capacity: 64 });
    // Nothing was consumed
    assert_eq!(store.next_packet(), 0);
}

#[test]
fn publish_reports_blocked_queue() {
    let mut store = store_with_data(1);
    store.activate(client(0), true);
    store
        .publish(QueueKind::Data, StreamId::BLANK, 0.0, 0.0, b"one")
        .unwrap();
    let err = store
        .publish(QueueKind::Data, StreamId::BLANK, 0.0, 0.0, b"two")
        .unwrap_err();
    assert_eq!(err, RecordError::Blocked("data"));
}

#[test]
fn packet_numbers_are_global_across_queues() {
    let mut store = store_with_data(4);
    assert_eq!(fill(&mut store, QueueKind::Data, 0), Some(0));
    assert_eq!(fill(&mut store, QueueKind::Timing, 0), Some(1));
    assert_eq!(fill(&mut store, QueueKind::Message, 0), Some(2));
    assert_eq!(fill(&mut store, QueueKind::Data, 0), Some(3));
    assert_eq!(store.next_packet(), 4);
}

#[test]
fn random_traffic_keeps_ring_invariants() {
    let mut rng = fastrand::Rng::with_seed(7);
    let mut store = store_with_data(5);
    let clients = [client(0), client(1), client(2)];
    let mut active = ClientSet::EMPTY;

    let mut last_evictions = 0;
    for _ in 0..2_000 {
        match rng.u8(0..10) {
            0 => {
                let c = clients[rng.usize(0..clients.len())];
                if active.contains(c) {
                    store.deactivate(c);
                    active.remove(c);
                } else {
                    store.activate(c, rng.bool());
                    active.insert(c);
                }
            }
            1 => {
                let c = clients[rng.usize(0..clients.len())];
                store.unblock(c);
            }
            _ => {
                let available = store.buffer_available(QueueKind::Data);
                let tail_before = store.ring(QueueKind::Data).tail();
                let head_before = store.ring(QueueKind::Data).head();
                let was_full = store.ring(QueueKind::Data).is_full();

                // The slot about to be reused must not be promised to an active client
                if was_full && available {
                    let ring = store.ring(QueueKind::Data);
                    let blocking = ring.slot(ring.tail()).blocking();
                    assert!(blocking.intersection(store.active_clients()).is_empty());
                }

                let got = fill(&mut store, QueueKind::Data, 0).is_some();
                assert_eq!(got, available);

                let ring = store.ring(QueueKind::Data);
                if got {
                    assert_eq!(ring.head(), ring.next(head_before));
                    if was_full {
                        assert_eq!(ring.tail(), ring.next(tail_before));
                    } else {
                        assert_eq!(ring.tail(), tail_before);
                    }
                } else {
                    assert_eq!(ring.head(), head_before);
                    assert_eq!(ring.tail(), tail_before);
                }
                assert!(ring.evictions() >= last_evictions);
                last_evictions = ring.evictions();
            }
        }
    }
}
