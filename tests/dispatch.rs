use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use station_broker::config::{PrivilegeGrant, ReservedClient};
use station_broker::Station::Buffer::{ClientId, ClientSet, QueueKind, QueueMask, RecordStore};
use station_broker::Station::Dispatch::fetch::fetch_records;
use station_broker::Station::Dispatch::{
    BrokerState, Caller, Command, DeviceLink, InfoKind, PrivilegeMask, PrivilegeTable,
};
use station_broker::Station::Service::wire::{
    decode_directory, encode_client_name, AttachInfo, FetchReply, FetchRequest, SeqMode,
};
use station_broker::Station::Service::{ClientName, ConnectionId};
use station_broker::Station::Structs::{Selector, StreamId};
use station_broker::Station::{ClientSlot, ClientTable, DetachReason};
use station_broker::{CommandStatus, ResultCode};

const BROKER_UID: u32 = 1000;
const OPERATOR_UID: u32 = 1001;
const STRANGER_UID: u32 = 1002;
const CAPACITY: usize = 64 * 1024;

fn build_state(data_slots: usize) -> BrokerState {
    let mut sizes = [(8, 64); QueueKind::COUNT];
    sizes[QueueKind::Data.index()] = (data_slots, 64);
    let store = RecordStore::new(sizes);
    let clients =
        ClientTable::with_reserved(&[ReservedClient::blocking("SLOW", Duration::from_secs(10))])
            .unwrap();
    let privileges = PrivilegeTable::new(
        BROKER_UID,
        &[PrivilegeGrant {
            uid: OPERATOR_UID,
            mask: PrivilegeMask::of(Command::Suspend)
                .with(Command::Resume)
                .0,
        }],
    );
    BrokerState::new(store, clients, privileges, 0xfeed)
}

fn caller(conn: usize, name: &str, uid: u32) -> Caller {
    Caller {
        connection: ConnectionId::new(conn).unwrap(),
        name: ClientName::new(name).unwrap(),
        pid: 0,
        uid,
    }
}

fn call(state: &mut BrokerState, who: &Caller, command: Command, input: &[u8]) -> (ResultCode, Vec<u8>) {
    call_at(state, who, command, input, Instant::now())
}

fn call_at(
    state: &mut BrokerState,
    who: &Caller,
    command: Command,
    input: &[u8],
    now: Instant,
) -> (ResultCode, Vec<u8>) {
    let mut out = Vec::new();
    let result = state.dispatch(who, command.code(), input, &mut out, CAPACITY, now);
    (result, out)
}

fn attach(state: &mut BrokerState, who: &Caller) -> AttachInfo {
    let (result, out) = call(state, who, Command::Attach, &[]);
    assert_eq!(result, ResultCode::Good);
    AttachInfo::decode(&out).unwrap()
}

fn fetch(state: &mut BrokerState, who: &Caller, request: FetchRequest) -> (ResultCode, FetchReply) {
    let (result, out) = call(state, who, Command::FetchRecords, &request.encode());
    let reply = FetchReply::decode(&out).unwrap_or_default();
    (result, reply)
}

fn continue_from(next_packet: u64) -> FetchRequest {
    FetchRequest {
        mode: SeqMode::Continue,
        next_packet,
        ..FetchRequest::default()
    }
}

fn first() -> FetchRequest {
    FetchRequest {
        mode: SeqMode::First,
        ..FetchRequest::default()
    }
}

fn publish(state: &mut BrokerState, kind: QueueKind, channel: &str) -> u64 {
    state
        .store_mut()
        .publish(kind, StreamId::new("00", channel), 1.0, 1.0, channel.as_bytes())
        .unwrap()
}

fn packets(reply: &FetchReply) -> Vec<u64> {
    reply.records.iter().map(|r| r.packet_num).collect()
}

#[test]
fn attach_reports_invocation_and_blocking() {
    let mut state = build_state(4);
    let slow = attach(&mut state, &caller(0, "SLOW", BROKER_UID));
    assert_eq!(slow.invocation, 0xfeed);
    assert!(slow.blocking);

    let other = attach(&mut state, &caller(1, "OTHER", STRANGER_UID));
    assert!(!other.blocking);
    assert_ne!(slow.client, other.client);
}

#[test]
fn requests_before_attach_are_invalid() {
    let mut state = build_state(4);
    let who = caller(0, "NOBODY", BROKER_UID);
    assert_eq!(call(&mut state, &who, Command::FetchRecords, &first().encode()).0, ResultCode::Invalid);

    let mut out = Vec::new();
    let result = state.dispatch(&who, 9999, &[], &mut out, CAPACITY, Instant::now());
    assert_eq!(result, ResultCode::Invalid);
}

#[test]
fn malformed_fetch_is_invalid() {
    let mut state = build_state(4);
    let who = caller(0, "C", BROKER_UID);
    attach(&mut state, &who);
    assert_eq!(call(&mut state, &who, Command::FetchRecords, &[1, 2, 3]).0, ResultCode::Invalid);
}

#[test]
fn privilege_depends_only_on_uid_and_mask() {
    let mut state = build_state(4);
    let broker = caller(0, "OWNER", BROKER_UID);
    let operator = caller(1, "OPER", OPERATOR_UID);
    let stranger = caller(2, "ANON", STRANGER_UID);
    for who in [&broker, &operator, &stranger] {
        attach(&mut state, who);
    }

    for _ in 0..3 {
        assert_eq!(call(&mut state, &stranger, Command::Suspend, &[]).0, ResultCode::Privilege);
        assert!(!state.store().is_suspended());

        assert_eq!(call(&mut state, &operator, Command::Suspend, &[]).0, ResultCode::Good);
        assert!(state.store().is_suspended());
        assert_eq!(call(&mut state, &operator, Command::Resume, &[]).0, ResultCode::Good);
        assert!(!state.store().is_suspended());

        assert_eq!(call(&mut state, &operator, Command::Terminate, &[]).0, ResultCode::Privilege);
        assert!(!state.terminate_requested());
    }

    // Open commands need no privilege
    assert_eq!(call(&mut state, &stranger, Command::ClientDirectory, &[]).0, ResultCode::Good);

    assert_eq!(call(&mut state, &broker, Command::Terminate, &[]).0, ResultCode::Good);
    assert!(state.terminate_requested());
}

#[test]
fn blocking_client_releases_ring_by_acknowledging() {
    let mut state = build_state(3);
    let slow = caller(0, "SLOW", BROKER_UID);
    attach(&mut state, &slow);

    for _ in 0..3 {
        publish(&mut state, QueueKind::Data, "BHZ");
    }
    assert!(!state.store().buffer_available(QueueKind::Data));

    let (result, reply) = fetch(&mut state, &slow, first());
    assert_eq!(result, ResultCode::Good);
    assert_eq!(packets(&reply), vec![0, 1, 2]);
    assert_eq!(reply.resume_from, 3);

    // Delivered, but not acknowledged until the client asks for more
    assert!(!state.store().buffer_available(QueueKind::Data));

    // Asking again from 1 acknowledges only packet 0 and redelivers the rest
    let (result, reply) = fetch(&mut state, &slow, continue_from(1));
    assert_eq!(result, ResultCode::Good);
    assert_eq!(packets(&reply), vec![1, 2]);
    assert!(state.store().buffer_available(QueueKind::Data));

    let (result, reply) = fetch(&mut state, &slow, continue_from(3));
    assert_eq!(result, ResultCode::NoData);
    assert!(reply.records.is_empty());
    assert_eq!(reply.resume_from, 3);
}

#[test]
fn first_fetch_after_attach_honours_next_packet() {
    let mut state = build_state(3);
    let slow = caller(0, "SLOW", BROKER_UID);
    attach(&mut state, &slow);
    for _ in 0..3 {
        publish(&mut state, QueueKind::Data, "BHZ");
    }

    let (result, reply) = fetch(&mut state, &slow, continue_from(1));
    assert_eq!(result, ResultCode::Good);
    assert_eq!(packets(&reply), vec![1, 2]);
    // Packet 0 was acknowledged, so its slot can be reused
    assert!(state.store().buffer_available(QueueKind::Data));
}

#[test]
fn timed_out_client_is_evicted() {
    let mut state = build_state(3);
    let start = Instant::now();
    let slow = caller(0, "SLOW", BROKER_UID);
    let (result, _) = call_at(&mut state, &slow, Command::Attach, &[], start);
    assert_eq!(result, ResultCode::Good);
    for _ in 0..3 {
        publish(&mut state, QueueKind::Data, "BHZ");
    }
    publish(&mut state, QueueKind::Timing, "   ");
    assert!(!state.store().buffer_available(QueueKind::Data));

    assert!(state.clients().timed_out(start + Duration::from_secs(5)).is_empty());
    let expired = state.clients().timed_out(start + Duration::from_secs(15));
    assert_eq!(expired.len(), 1);
    for id in expired {
        state.evict(id, DetachReason::TimedOut);
    }

    for kind in [QueueKind::Data, QueueKind::Timing] {
        let ring = state.store().ring(kind);
        assert!(ring.live().all(|idx| ring.slot(idx).blocking().is_empty()));
    }
    assert!(state.store_mut().get_buffer(QueueKind::Data).is_some());

    // The evicted connection has to attach again
    assert_eq!(call(&mut state, &slow, Command::FetchRecords, &first().encode()).0, ResultCode::Invalid);
}

#[test]
fn selector_skips_other_channels() {
    let mut state = build_state(8);
    let picky = caller(0, "PICKY", STRANGER_UID);
    attach(&mut state, &picky);

    let bhn = publish(&mut state, QueueKind::Data, "BHN");
    let bhz = publish(&mut state, QueueKind::Data, "BHZ");

    let request = FetchRequest {
        mode: SeqMode::First,
        selectors: vec!["BHZ".parse::<Selector>().unwrap()],
        ..FetchRequest::default()
    };
    let (result, reply) = fetch(&mut state, &picky, request.clone());
    assert_eq!(result, ResultCode::Good);
    assert_eq!(packets(&reply), vec![bhz]);
    assert!(reply.resume_from > bhn);

    let (result, reply) = fetch(
        &mut state,
        &picky,
        FetchRequest {
            mode: SeqMode::Continue,
            next_packet: reply.resume_from,
            ..request
        },
    );
    assert_eq!(result, ResultCode::NoData);
    assert!(reply.records.is_empty());
}

#[test]
fn selectors_do_not_filter_timing_and_messages() {
    let mut state = build_state(8);
    let who = caller(0, "C", STRANGER_UID);
    attach(&mut state, &who);

    publish(&mut state, QueueKind::Data, "BHN");
    let timing = publish(&mut state, QueueKind::Timing, "   ");
    let message = publish(&mut state, QueueKind::Message, "   ");

    let request = FetchRequest {
        mode: SeqMode::First,
        selectors: vec!["BHZ".parse().unwrap()],
        ..FetchRequest::default()
    };
    let (_, reply) = fetch(&mut state, &who, request);
    assert_eq!(packets(&reply), vec![timing, message]);
}

#[test]
fn kind_mask_and_time_floor_filter() {
    let mut state = build_state(8);
    let who = caller(0, "C", STRANGER_UID);
    attach(&mut state, &who);

    state
        .store_mut()
        .publish(QueueKind::Data, StreamId::new("00", "BHZ"), 5.0, 5.0, b"old")
        .unwrap();
    let fresh = state
        .store_mut()
        .publish(QueueKind::Data, StreamId::new("00", "BHZ"), 50.0, 50.0, b"new")
        .unwrap();
    publish(&mut state, QueueKind::Detection, "BHZ");

    let request = FetchRequest {
        mode: SeqMode::First,
        kinds: QueueMask::only(QueueKind::Data),
        min_timestamp: Some(10.0),
        ..FetchRequest::default()
    };
    let (_, reply) = fetch(&mut state, &who, request);
    assert_eq!(packets(&reply), vec![fresh]);
    assert_eq!(reply.records[0].data, b"new");
}

#[test]
fn merge_delivers_global_order() {
    let mut rng = fastrand::Rng::with_seed(42);
    let mut state = build_state(64);
    // A blocking client, so nothing it has not acknowledged can be evicted
    let who = caller(0, "SLOW", STRANGER_UID);
    attach(&mut state, &who);

    let kinds = [QueueKind::Data, QueueKind::Detection, QueueKind::Timing, QueueKind::Message];
    let mut published = Vec::new();
    let mut received = Vec::new();
    let mut next = 0;
    let mut mode = SeqMode::First;

    for _ in 0..40 {
        for _ in 0..rng.usize(0..6) {
            let kind = kinds[rng.usize(0..kinds.len())];
            if state.store().buffer_available(kind) {
                published.push(publish(&mut state, kind, "BHZ"));
            }
        }
        let request = FetchRequest {
            mode,
            next_packet: next,
            max_records: rng.u32(1..4),
            ..FetchRequest::default()
        };
        let (_, reply) = fetch(&mut state, &who, request);
        received.extend(packets(&reply));
        next = reply.resume_from;
        mode = SeqMode::Continue;
    }

    // Drain what is left
    loop {
        let (result, reply) = fetch(&mut state, &who, continue_from(next));
        received.extend(packets(&reply));
        next = reply.resume_from;
        if result == ResultCode::NoData {
            break;
        }
    }

    assert!(received.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(received, published);
}

#[test]
fn max_records_and_resume_point() {
    let mut state = build_state(8);
    let who = caller(0, "C", STRANGER_UID);
    attach(&mut state, &who);
    for _ in 0..5 {
        publish(&mut state, QueueKind::Data, "BHZ");
    }

    let (_, reply) = fetch(
        &mut state,
        &who,
        FetchRequest {
            mode: SeqMode::First,
            max_records: 2,
            ..FetchRequest::default()
        },
    );
    assert_eq!(packets(&reply), vec![0, 1]);
    assert_eq!(reply.resume_from, 2);

    let (_, reply) = fetch(&mut state, &who, continue_from(2));
    assert_eq!(packets(&reply), vec![2, 3, 4]);
    assert_eq!(reply.resume_from, 5);
}

#[test]
fn output_too_small_for_one_record() {
    let mut state = build_state(8);
    let who = caller(0, "C", STRANGER_UID);
    attach(&mut state, &who);
    publish(&mut state, QueueKind::Data, "BHZ");

    let mut out = Vec::new();
    let result = state.dispatch(
        &who,
        Command::FetchRecords.code(),
        &first().encode(),
        &mut out,
        24,
        Instant::now(),
    );
    assert_eq!(result, ResultCode::BufferTooSmall);
}

#[test]
fn last_mode_skips_history_and_releases_slots() {
    let mut state = build_state(3);
    let slow = caller(0, "SLOW", BROKER_UID);
    attach(&mut state, &slow);
    for _ in 0..3 {
        publish(&mut state, QueueKind::Data, "BHZ");
    }

    let (result, reply) = fetch(
        &mut state,
        &slow,
        FetchRequest {
            mode: SeqMode::Last,
            ..FetchRequest::default()
        },
    );
    assert_eq!(result, ResultCode::NoData);
    assert_eq!(reply.resume_from, 3);
    assert!(state.store().buffer_available(QueueKind::Data));

    let newest = publish(&mut state, QueueKind::Data, "BHZ");
    let (_, reply) = fetch(&mut state, &slow, continue_from(3));
    assert_eq!(packets(&reply), vec![newest]);
}

#[test]
fn lagging_client_gap_is_counted() {
    let mut state = build_state(2);
    let who = caller(0, "LAGGY", STRANGER_UID);
    attach(&mut state, &who);

    let (result, reply) = fetch(&mut state, &who, first());
    assert_eq!(result, ResultCode::NoData);
    assert_eq!(reply.resume_from, 0);

    for _ in 0..5 {
        publish(&mut state, QueueKind::Data, "BHZ");
    }
    let (result, reply) = fetch(&mut state, &who, continue_from(0));
    assert_eq!(result, ResultCode::Good);
    assert_eq!(packets(&reply), vec![3, 4]);
    assert_eq!(state.gap_events(), 1);

    // Caught up again: no further gap
    publish(&mut state, QueueKind::Data, "BHZ");
    let (_, reply) = fetch(&mut state, &who, continue_from(5));
    assert_eq!(packets(&reply), vec![5]);
    assert_eq!(state.gap_events(), 1);

    let (_, out) = call(&mut state, &who, Command::ClientDirectory, &[]);
    let rows = decode_directory(&out).unwrap();
    let laggy = rows.iter().find(|r| r.name.as_str() == "LAGGY").unwrap();
    assert_eq!(laggy.gaps, 1);
    assert!(laggy.active);
    let slow = rows.iter().find(|r| r.name.as_str() == "SLOW").unwrap();
    assert!(slow.reserved && slow.blocking && !slow.active);
}

#[test]
fn delivered_records_rolling_off_are_not_gaps() {
    let mut state = build_state(2);
    let who = caller(0, "C", STRANGER_UID);
    attach(&mut state, &who);
    publish(&mut state, QueueKind::Data, "BHZ");
    publish(&mut state, QueueKind::Data, "BHZ");

    let (_, reply) = fetch(&mut state, &who, first());
    assert_eq!(packets(&reply), vec![0, 1]);

    // Both delivered slots get evicted before the next fetch
    publish(&mut state, QueueKind::Data, "BHZ");
    publish(&mut state, QueueKind::Data, "BHZ");
    let (_, reply) = fetch(&mut state, &who, continue_from(2));
    assert_eq!(packets(&reply), vec![2, 3]);
    assert_eq!(state.gap_events(), 0);
}

#[test]
fn unblock_catches_client_up() {
    let mut state = build_state(3);
    let slow = caller(0, "SLOW", BROKER_UID);
    let admin = caller(1, "ADMIN", BROKER_UID);
    attach(&mut state, &slow);
    attach(&mut state, &admin);
    for _ in 0..3 {
        publish(&mut state, QueueKind::Data, "BHZ");
    }
    assert!(!state.store().buffer_available(QueueKind::Data));

    let name = ClientName::new("SLOW").unwrap();
    let (result, _) = call(&mut state, &admin, Command::UnblockClient, &encode_client_name(&name));
    assert_eq!(result, ResultCode::Good);
    assert!(state.store().buffer_available(QueueKind::Data));

    // Nothing old is redelivered
    let (result, _) = fetch(&mut state, &slow, continue_from(0));
    assert_eq!(result, ResultCode::NoData);

    let unknown = ClientName::new("GHOST").unwrap();
    let (result, _) = call(&mut state, &admin, Command::UnblockClient, &encode_client_name(&unknown));
    assert_eq!(result, ResultCode::Invalid);
}

#[test]
fn attach_unblock_detach_round_trip() {
    let mut state = build_state(4);
    let other = caller(1, "OTHER", BROKER_UID);
    attach(&mut state, &other);
    for _ in 0..3 {
        publish(&mut state, QueueKind::Data, "BHZ");
        publish(&mut state, QueueKind::Detection, "BHZ");
    }

    let snapshot = |state: &BrokerState| -> Vec<ClientSet> {
        QueueKind::ALL
            .iter()
            .flat_map(|&kind| {
                let ring = state.store().ring(kind);
                ring.live().map(move |idx| ring.slot(idx).blocking()).collect::<Vec<_>>()
            })
            .collect()
    };
    let before = snapshot(&state);

    let slow = caller(0, "SLOW", BROKER_UID);
    let info = attach(&mut state, &slow);
    assert!(snapshot(&state).iter().all(|set| set.contains(info.client)));

    let name = ClientName::new("SLOW").unwrap();
    call(&mut state, &other, Command::UnblockClient, &encode_client_name(&name));
    state.close_connection(slow.connection, DetachReason::Detached);

    assert_eq!(snapshot(&state), before);
    assert!(!state.store().active_clients().contains(info.client));
}

#[test]
fn client_table_full_refuses_attach() {
    let mut state = build_state(4);
    // One reserved slot plus 31 dynamic clients fill the table
    for i in 0..31 {
        attach(&mut state, &caller(i % 8, &format!("C{}", i), STRANGER_UID));
    }
    let (result, _) = call(&mut state, &caller(9, "LATE", STRANGER_UID), Command::Attach, &[]);
    assert_eq!(result, ResultCode::AttachRefused);

    // The reserved client still gets its slot
    let (result, _) = call(&mut state, &caller(10, "SLOW", STRANGER_UID), Command::Attach, &[]);
    assert_eq!(result, ResultCode::Good);
}

#[test]
fn info_queries() {
    let mut state = build_state(4);
    let who = caller(0, "C", STRANGER_UID);
    attach(&mut state, &who);

    assert_eq!(call(&mut state, &who, Command::DigitizerInfo, &[]).0, ResultCode::NoData);

    state.set_info(InfoKind::Digitizer, Some(b"Q330 s/n 1234".to_vec()));
    let (result, out) = call(&mut state, &who, Command::DigitizerInfo, &[]);
    assert_eq!(result, ResultCode::Good);
    assert_eq!(out, b"Q330 s/n 1234");

    let mut small = Vec::new();
    let result = state.dispatch(&who, Command::DigitizerInfo.code(), &[], &mut small, 4, Instant::now());
    assert_eq!(result, ResultCode::BufferTooSmall);
}

struct RecordingLink(Arc<Mutex<Vec<u32>>>);

impl DeviceLink for RecordingLink {
    fn submit(&mut self, code: u32, _params: &[u8]) -> ResultCode {
        self.0.lock().push(code);
        ResultCode::Good
    }

    fn link_settings(&mut self, _params: &[u8]) -> ResultCode {
        ResultCode::Good
    }
}

#[test]
fn device_token_is_exclusive() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let mut state = build_state(4).with_link(Box::new(RecordingLink(Arc::clone(&sent))));
    let a = caller(0, "A", BROKER_UID);
    let b = caller(1, "B", BROKER_UID);
    attach(&mut state, &a);
    attach(&mut state, &b);

    assert_eq!(call(&mut state, &a, Command::Device(16), &[]).0, ResultCode::Good);
    assert_eq!(state.session(a.connection).command_status, CommandStatus::InProgress);

    // Same client, command still outstanding
    assert_eq!(call(&mut state, &a, Command::Device(17), &[]).0, ResultCode::Busy);
    // Other client, token held by A
    assert_eq!(call(&mut state, &b, Command::Device(16), &[]).0, ResultCode::Busy);

    assert_eq!(state.complete_device_command(CommandStatus::Finished), Some(a.connection));
    assert_eq!(state.session(a.connection).command_status, CommandStatus::Finished);
    assert_eq!(call(&mut state, &b, Command::Device(16), &[]).0, ResultCode::Busy);

    assert_eq!(call(&mut state, &a, Command::AckCommand, &[]).0, ResultCode::Good);
    assert_eq!(state.session(a.connection).command_status, CommandStatus::Idle);
    assert_eq!(call(&mut state, &b, Command::Device(18), &[]).0, ResultCode::Good);

    assert_eq!(*sent.lock(), vec![16, 18]);
}

#[test]
fn device_commands_need_privilege_and_a_link() {
    let mut state = build_state(4);
    let stranger = caller(0, "ANON", STRANGER_UID);
    let owner = caller(1, "OWNER", BROKER_UID);
    attach(&mut state, &stranger);
    attach(&mut state, &owner);

    assert_eq!(call(&mut state, &stranger, Command::Device(20), &[]).0, ResultCode::Privilege);
    // No link layer wired in
    assert_eq!(call(&mut state, &owner, Command::Device(20), &[]).0, ResultCode::Invalid);
    assert_eq!(state.session(owner.connection).command_status, CommandStatus::Idle);
}

#[test]
fn reconfigure_raises_flag_once() {
    let mut state = build_state(4);
    let owner = caller(0, "OWNER", BROKER_UID);
    attach(&mut state, &owner);
    assert_eq!(call(&mut state, &owner, Command::Reconfigure, &[]).0, ResultCode::Good);
    assert!(state.take_reconfigure_request());
    assert!(!state.take_reconfigure_request());
}

#[test]
fn batched_fetches_count_one_eviction_once() {
    let mut state = build_state(3);
    let who = caller(0, "BATCH", STRANGER_UID);
    attach(&mut state, &who);
    let (result, _) = fetch(&mut state, &who, first());
    assert_eq!(result, ResultCode::NoData);

    publish(&mut state, QueueKind::Message, "   ");
    publish(&mut state, QueueKind::Message, "   ");
    for _ in 0..4 {
        publish(&mut state, QueueKind::Data, "BHZ");
    }
    // Packet 2 rolled off the three-slot data ring unread
    assert_eq!(state.store().ring(QueueKind::Data).last_evicted(), Some(2));

    let mut delivered = Vec::new();
    let mut next_packet = 0;
    for _ in 0..6 {
        let (_, reply) = fetch(
            &mut state,
            &who,
            FetchRequest {
                max_records: 1,
                ..continue_from(next_packet)
            },
        );
        delivered.extend(packets(&reply));
        next_packet = reply.resume_from;
    }

    assert_eq!(delivered, vec![0, 1, 3, 4, 5]);
    assert_eq!(state.gap_events(), 1);

    let (_, out) = call(&mut state, &who, Command::ClientDirectory, &[]);
    let rows = decode_directory(&out).unwrap();
    let batch = rows.iter().find(|r| r.name.as_str() == "BATCH").unwrap();
    assert_eq!(batch.gaps, 1);

    // A later loss is a new gap
    for _ in 0..4 {
        publish(&mut state, QueueKind::Data, "BHZ");
    }
    let (_, reply) = fetch(&mut state, &who, continue_from(next_packet));
    assert_eq!(packets(&reply), vec![7, 8, 9]);
    assert_eq!(state.gap_events(), 2);
}

#[test]
fn reply_without_room_for_header_keeps_resume_point() {
    let mut store = RecordStore::new([(4, 64); QueueKind::COUNT]);
    store
        .publish(QueueKind::Data, StreamId::new("00", "BHZ"), 1.0, 1.0, b"abc")
        .unwrap();
    let mut client = ClientSlot {
        name: ClientName::new("TINY").unwrap(),
        pid: 0,
        uid: STRANGER_UID,
        blocking: false,
        reserved: false,
        timeout: Duration::from_secs(10),
        active: true,
        last_service: Instant::now(),
        cursors: [None; QueueKind::COUNT],
        primed: false,
        gaps: 0,
        evictions_seen: [0; QueueKind::COUNT],
        connection: None,
    };

    let mut out = Vec::new();
    let outcome = fetch_records(&mut store, ClientId::new(0).unwrap(), &mut client, &first(), &mut out, 8);
    assert_eq!(outcome.result, ResultCode::BufferTooSmall);
    assert_eq!(outcome.delivered, 0);
    assert_eq!(outcome.resume_from, store.next_packet());
}
