// Layout conformance tests for the station region.
// Clients built separately from the broker map the same bytes, so sizes,
// alignments and field offsets of everything in shared memory or on the
// mailbox wire are pinned here. Observed values are printed to aid
// debugging when a mismatch occurs on a given platform.
use crossbeam_utils::CachePadded;
use memoffset::offset_of;
use std::mem::{align_of, size_of};
use std::sync::atomic::AtomicU32;

use station_broker::Core::{align_up, REGION_ALIGN};
use station_broker::Station::Buffer::MAXCLIENTS;
use station_broker::Station::Service::layout::{
    MailboxHeader, RegionHeader, ServiceEntry, REQUEST_BYTES,
};
use station_broker::Station::Service::wire::{
    AttachReply, DirectoryEntry, DirectoryHeader, FetchParams, FetchReplyHeader, RecordHeader,
    ATTACH_REPLY_LEN, FETCH_REPLY_HEADER_LEN,
};
use station_broker::Station::Service::ServiceRegion;

#[test]
fn region_header_layout() {
    let pad = align_of::<CachePadded<AtomicU32>>();
    let off_lock = offset_of!(RegionHeader, service_lock);
    let off_doorbell = offset_of!(RegionHeader, doorbell);
    let off_entries = offset_of!(RegionHeader, entries);

    println!(
        "RegionHeader => size: {}, align: {}, offsets: [service_lock:{off_lock}, doorbell:{off_doorbell}, entries:{off_entries}], cache pad: {pad}",
        size_of::<RegionHeader>(),
        align_of::<RegionHeader>()
    );

    assert_eq!(offset_of!(RegionHeader, magic), 0);
    assert_eq!(offset_of!(RegionHeader, version), 8);
    assert_eq!(offset_of!(RegionHeader, max_clients), 12);
    assert_eq!(offset_of!(RegionHeader, invocation), 16);
    assert_eq!(offset_of!(RegionHeader, state), 24);
    assert_eq!(offset_of!(RegionHeader, broker_pid), 28);
    assert_eq!(offset_of!(RegionHeader, broker_uid), 32);
    assert_eq!(offset_of!(RegionHeader, mailbox_stride), 36);
    assert_eq!(offset_of!(RegionHeader, mailbox_offset), 40);
    assert_eq!(offset_of!(RegionHeader, output_capacity), 44);
    assert_eq!(offset_of!(RegionHeader, max_wait_ms), 48);
    assert_eq!(offset_of!(RegionHeader, same_user_poll_ms), 52);
    assert_eq!(offset_of!(RegionHeader, foreign_user_poll_ms), 56);
    assert_eq!(offset_of!(RegionHeader, probe_interval_ms), 60);
    assert_eq!(offset_of!(RegionHeader, station), 64);

    // Lock and doorbell each sit on their own cache line
    assert_eq!(off_lock % pad, 0);
    assert!(off_lock >= 72);
    assert_eq!(off_doorbell, off_lock + pad);
    assert_eq!(off_entries, off_doorbell + pad);

    assert_eq!(align_of::<RegionHeader>(), REGION_ALIGN);
    assert_eq!(size_of::<RegionHeader>() % REGION_ALIGN, 0);
    assert!(size_of::<RegionHeader>() >= off_entries + MAXCLIENTS * size_of::<ServiceEntry>());
}

#[test]
fn service_entry_layout() {
    assert_eq!(size_of::<ServiceEntry>(), 16);
    assert_eq!(offset_of!(ServiceEntry, handle), 0);
    assert_eq!(offset_of!(ServiceEntry, name), 8);
}

#[test]
fn mailbox_header_layout() {
    println!(
        "MailboxHeader => size: {}, align: {}",
        size_of::<MailboxHeader>(),
        align_of::<MailboxHeader>()
    );

    assert_eq!(offset_of!(MailboxHeader, pending), 0);
    assert_eq!(offset_of!(MailboxHeader, command_status), 4);
    assert_eq!(offset_of!(MailboxHeader, state), 8);
    assert_eq!(offset_of!(MailboxHeader, command), 12);
    assert_eq!(offset_of!(MailboxHeader, result), 16);
    assert_eq!(offset_of!(MailboxHeader, client_pid), 20);
    assert_eq!(offset_of!(MailboxHeader, client_uid), 24);
    assert_eq!(offset_of!(MailboxHeader, input_len), 28);
    assert_eq!(offset_of!(MailboxHeader, output_len), 32);
    assert_eq!(offset_of!(MailboxHeader, owner), 40);
    assert_eq!(offset_of!(MailboxHeader, input), 48);

    assert_eq!(align_of::<MailboxHeader>(), REGION_ALIGN);
    assert_eq!(size_of::<MailboxHeader>(), align_up(48 + REQUEST_BYTES));
}

#[test]
fn region_geometry() {
    let capacity = 10_000;
    let stride = ServiceRegion::mailbox_stride(capacity);
    assert_eq!(stride % REGION_ALIGN, 0);
    assert!(stride >= size_of::<MailboxHeader>() + capacity);

    assert_eq!(ServiceRegion::mailbox_offset(), size_of::<RegionHeader>());
    assert_eq!(
        ServiceRegion::required_size(capacity),
        ServiceRegion::mailbox_offset() + MAXCLIENTS * stride
    );
}

#[test]
fn fetch_wire_layout() {
    assert_eq!(size_of::<FetchParams>(), 104);
    assert_eq!(align_of::<FetchParams>(), 8);
    assert_eq!(offset_of!(FetchParams, next_packet), 0);
    assert_eq!(offset_of!(FetchParams, min_timestamp), 8);
    assert_eq!(offset_of!(FetchParams, max_records), 16);
    assert_eq!(offset_of!(FetchParams, mode), 20);
    assert_eq!(offset_of!(FetchParams, kinds), 21);
    assert_eq!(offset_of!(FetchParams, selector_count), 22);
    assert_eq!(offset_of!(FetchParams, flags), 23);
    assert_eq!(offset_of!(FetchParams, selectors), 24);
    assert!(size_of::<FetchParams>() <= REQUEST_BYTES);

    assert_eq!(size_of::<FetchReplyHeader>(), FETCH_REPLY_HEADER_LEN);
    assert_eq!(FETCH_REPLY_HEADER_LEN, 16);
    assert_eq!(offset_of!(FetchReplyHeader, resume_from), 0);
    assert_eq!(offset_of!(FetchReplyHeader, count), 8);

    assert_eq!(size_of::<RecordHeader>(), 40);
    assert_eq!(offset_of!(RecordHeader, packet_num), 0);
    assert_eq!(offset_of!(RecordHeader, reception), 8);
    assert_eq!(offset_of!(RecordHeader, header_time), 16);
    assert_eq!(offset_of!(RecordHeader, len), 24);
    assert_eq!(offset_of!(RecordHeader, kind), 28);
    assert_eq!(offset_of!(RecordHeader, location), 29);
    assert_eq!(offset_of!(RecordHeader, channel), 31);
}

#[test]
fn attach_and_directory_layout() {
    assert_eq!(size_of::<AttachReply>(), ATTACH_REPLY_LEN);
    assert_eq!(ATTACH_REPLY_LEN, 16);
    assert_eq!(offset_of!(AttachReply, invocation), 0);
    assert_eq!(offset_of!(AttachReply, client), 8);
    assert_eq!(offset_of!(AttachReply, blocking), 12);

    assert_eq!(size_of::<DirectoryHeader>(), 8);
    assert_eq!(size_of::<DirectoryEntry>(), 40);
    assert_eq!(offset_of!(DirectoryEntry, name), 0);
    assert_eq!(offset_of!(DirectoryEntry, pid), 8);
    assert_eq!(offset_of!(DirectoryEntry, uid), 12);
    assert_eq!(offset_of!(DirectoryEntry, idle_secs), 16);
    assert_eq!(offset_of!(DirectoryEntry, timeout_secs), 20);
    assert_eq!(offset_of!(DirectoryEntry, gaps), 24);
    assert_eq!(offset_of!(DirectoryEntry, flags), 32);
}
