mod common;

use std::sync::Arc;

use common::{deferred, frame_to, Harness};
use netback_engine::{
    ChecksumState, GsoInfo, GsoKind, NetbackConfig, OutboundFrame, RxMode, XmitError,
};
use netback_frontend::{Frontend, RxBufferKind};
use netback_grant::{Fault, GrantError, Page, PAGE_SIZE};
use netback_ring::{gso_type, status, ExtraInfo, RxFlags, RxRequest, TxFlags};

const UNICAST: [u8; 6] = [0x02, 0, 0, 0, 0, 0x09];
const MDNS: [u8; 6] = [0x01, 0x00, 0x5e, 0x00, 0x00, 0xfb];
const ALL_HOSTS: [u8; 6] = [0x01, 0x00, 0x5e, 0x00, 0x00, 0x01];

fn post(h: &Harness, guest: &mut common::Guest, buffers: usize) {
    assert_eq!(guest.fe.post_rx_buffers(buffers), buffers);
    guest.fe.push_rx();
    h.netback.interrupt(guest.id).unwrap();
}

#[test]
fn frame_is_copied_into_a_posted_buffer() {
    let h = Harness::new(deferred());
    let mut guest = h.connect(1);
    post(&h, &mut guest, 4);
    let data = frame_to(UNICAST, 60);

    h.netback
        .start_xmit(guest.id, OutboundFrame::from_bytes(&data))
        .unwrap();
    h.run();

    let frames = guest.fe.collect_rx().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, data);
    assert_eq!(frames[0].error, None);
    assert_eq!(guest.fe.rx_posted(), 3);
    assert!(guest.fe.notifications() > 0);

    let stats = h.netback.stats(guest.id).unwrap();
    assert_eq!((stats.rx_frames, stats.rx_bytes), (1, 60));
}

#[test]
fn multi_page_segmented_frame_takes_an_extra_slot() {
    let h = Harness::new(deferred());
    let mut guest = h.connect(1);
    post(&h, &mut guest, 8);
    let data = frame_to(UNICAST, PAGE_SIZE + 904);
    let frame = OutboundFrame::from_bytes(&data)
        .with_checksum(ChecksumState::Partial {
            start: 34,
            offset: 16,
        })
        .with_gso(Some(GsoInfo {
            size: 1448,
            kind: GsoKind::TcpV4,
        }));

    h.netback.start_xmit(guest.id, frame).unwrap();
    h.run();

    let frames = guest.fe.collect_rx().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, data);
    assert!(frames[0]
        .flags
        .contains(RxFlags::CSUM_BLANK | RxFlags::DATA_VALIDATED | RxFlags::EXTRA_INFO));
    let gso = frames[0].gso.unwrap();
    assert_eq!((gso.size, gso.gso_type), (1448, gso_type::TCPV4));
    // Two data buffers and one for the extra-info record.
    assert_eq!(guest.fe.rx_posted(), 5);
}

#[test]
fn frame_split_across_host_segments_is_reassembled() {
    let h = Harness::new(deferred());
    let mut guest = h.connect(1);
    post(&h, &mut guest, 4);
    let data = frame_to(UNICAST, 3000);

    let mut frame = OutboundFrame::new();
    for chunk in data.chunks(700) {
        let page = Page::new();
        page.write(100, chunk);
        frame
            .push_segment(Arc::new(page), 100, chunk.len())
            .unwrap();
    }
    h.netback.start_xmit(guest.id, frame).unwrap();
    h.run();

    assert_eq!(guest.fe.collect_rx().unwrap()[0].data, data);
}

#[test]
fn queued_frames_wait_for_buffers() {
    let h = Harness::new(deferred());
    let mut guest = h.connect(1);
    for n in 0..3 {
        h.netback
            .start_xmit(guest.id, OutboundFrame::from_bytes(&frame_to(UNICAST, 60 + n)))
            .unwrap();
    }
    h.run();
    assert!(guest.fe.collect_rx().unwrap().is_empty());

    post(&h, &mut guest, 2);
    h.run();
    let lens: Vec<usize> = guest
        .fe
        .collect_rx()
        .unwrap()
        .iter()
        .map(|f| f.data.len())
        .collect();
    assert_eq!(lens, vec![60, 61]);

    post(&h, &mut guest, 2);
    h.run();
    assert_eq!(guest.fe.collect_rx().unwrap().len(), 1);
    assert_eq!(h.netback.stats(guest.id).unwrap().rx_dropped, 0);
}

#[test]
fn stalled_guest_loses_the_frame_after_the_timeout() {
    let h = Harness::new(deferred());
    let mut guest = h.connect(1);
    h.netback
        .start_xmit(guest.id, OutboundFrame::from_bytes(&frame_to(UNICAST, 60)))
        .unwrap();
    h.run();

    h.clock.advance(h.netback.config().rx_stall_timeout);
    h.run();
    assert_eq!(h.netback.stats(guest.id).unwrap().rx_dropped, 1);

    post(&h, &mut guest, 2);
    h.run();
    assert!(guest.fe.collect_rx().unwrap().is_empty());
}

#[test]
fn transfer_mode_moves_pages_and_backs_off_when_the_pool_runs_dry() {
    let h = Harness::new(NetbackConfig {
        transfer_pool_pages: 2,
        ..deferred()
    });
    let fe = Frontend::with_rx_kind(h.hv.clone(), 1, RxBufferKind::Transfer);
    let mut guest = h.connect_with(fe, |params| params.rx_mode = RxMode::Transfer);
    post(&h, &mut guest, 8);

    for n in 0..3 {
        h.netback
            .start_xmit(guest.id, OutboundFrame::from_bytes(&frame_to(UNICAST, 100 + n)))
            .unwrap();
    }
    h.run();
    let first = guest.fe.collect_rx().unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].data, frame_to(UNICAST, 100));

    h.clock.advance(h.netback.config().transfer_backoff);
    h.run();
    let rest = guest.fe.collect_rx().unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].data, frame_to(UNICAST, 102));
    assert_eq!(h.hv.stats().transfers, 3);
}

#[test]
fn transfer_mode_rejects_frames_larger_than_the_pool() {
    let h = Harness::new(NetbackConfig {
        transfer_pool_pages: 1,
        ..deferred()
    });
    let fe = Frontend::with_rx_kind(h.hv.clone(), 1, RxBufferKind::Transfer);
    let guest = h.connect_with(fe, |params| params.rx_mode = RxMode::Transfer);

    let big = OutboundFrame::from_bytes(&frame_to(UNICAST, PAGE_SIZE + 1));
    assert_eq!(
        h.netback.start_xmit(guest.id, big),
        Err(XmitError::BadFrame(PAGE_SIZE + 1))
    );
}

#[test]
fn full_queue_rejects_further_frames() {
    let h = Harness::new(NetbackConfig {
        rx_queue_frames: 2,
        ..deferred()
    });
    let guest = h.connect(1);
    let frame = || OutboundFrame::from_bytes(&frame_to(UNICAST, 60));

    h.netback.start_xmit(guest.id, frame()).unwrap();
    h.netback.start_xmit(guest.id, frame()).unwrap();
    assert_eq!(
        h.netback.start_xmit(guest.id, frame()),
        Err(XmitError::QueueFull(guest.id))
    );
    assert_eq!(h.netback.stats(guest.id).unwrap().rx_dropped, 1);
}

#[test]
fn runt_frames_are_rejected() {
    let h = Harness::new(deferred());
    let guest = h.connect(1);
    assert_eq!(
        h.netback
            .start_xmit(guest.id, OutboundFrame::from_bytes(&[0; 10])),
        Err(XmitError::BadFrame(10))
    );
}

#[test]
fn multicast_subscriptions_filter_delivery() {
    let h = Harness::new(deferred());
    let fe = Frontend::new(h.hv.clone(), 1);
    let mut guest = h.connect_with(fe, |params| params.multicast_control = true);
    let id = guest.id;
    let xmit = |dest| {
        h.netback
            .start_xmit(id, OutboundFrame::from_bytes(&frame_to(dest, 60)))
    };

    assert_eq!(xmit(MDNS), Err(XmitError::Filtered(id)));

    h.send(&mut guest, &[0], TxFlags::empty(), &[ExtraInfo::mcast_add(MDNS)]);
    let statuses: Vec<i16> = h.responses(&mut guest).iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![status::OKAY, status::NULL]);
    assert_eq!(h.held(), 0);
    assert_eq!(h.netback.stats(id).unwrap().multicast_groups, 1);

    assert_eq!(xmit(MDNS), Ok(()));
    assert_eq!(xmit(ALL_HOSTS), Err(XmitError::Filtered(id)));
    assert_eq!(xmit([0xff; 6]), Ok(()));
    assert_eq!(xmit(UNICAST), Ok(()));

    h.send(&mut guest, &[0], TxFlags::empty(), &[ExtraInfo::mcast_del(MDNS)]);
    assert_eq!(h.netback.stats(id).unwrap().multicast_groups, 0);
    assert_eq!(xmit(MDNS), Err(XmitError::Filtered(id)));
}

#[test]
fn without_multicast_control_everything_is_accepted() {
    let h = Harness::new(deferred());
    let guest = h.connect(1);
    assert_eq!(
        h.netback
            .start_xmit(guest.id, OutboundFrame::from_bytes(&frame_to(ALL_HOSTS, 60))),
        Ok(())
    );
}

#[test]
fn failed_copy_reports_an_error_to_the_guest() {
    let h = Harness::new(deferred());
    let mut guest = h.connect(1);
    post(&h, &mut guest, 1);
    let gref = guest.fe.rx_ring().shared().read_slot::<RxRequest>(0).gref;
    h.hv.inject_fault(1, gref, Fault::Always(GrantError::BadGrantRef));

    h.netback
        .start_xmit(guest.id, OutboundFrame::from_bytes(&frame_to(UNICAST, 60)))
        .unwrap();
    h.run();

    let frames = guest.fe.collect_rx().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].error, Some(status::ERROR));
    let stats = h.netback.stats(guest.id).unwrap();
    assert_eq!((stats.rx_frames, stats.rx_errors, stats.busted), (0, 1, false));
}

#[test]
fn interface_checksum_hint_is_forwarded() {
    let h = Harness::new(deferred());
    let mut guest = h.connect(1);
    post(&h, &mut guest, 1);
    let frame = OutboundFrame::from_bytes(&frame_to(UNICAST, 60)).with_checksum(ChecksumState::Unnecessary);

    h.netback.start_xmit(guest.id, frame).unwrap();
    h.run();

    let frames = guest.fe.collect_rx().unwrap();
    assert!(frames[0].flags.contains(RxFlags::DATA_VALIDATED));
    assert!(!frames[0].flags.contains(RxFlags::CSUM_BLANK));
}

#[test]
fn guest_posting_past_the_ring_disables_the_interface() {
    let h = Harness::new(deferred());
    let guest = h.connect(1);
    let shared = guest.fe.rx_ring().shared();
    shared.set_req_prod(shared.entries() + 44);

    h.netback
        .start_xmit(guest.id, OutboundFrame::from_bytes(&frame_to(UNICAST, 60)))
        .unwrap();
    h.run();

    let stats = h.netback.stats(guest.id).unwrap();
    assert!(stats.busted);
    assert_eq!(stats.rx_frames, 0);
    assert!(h.hv.is_masked(guest.fe.port()));
    assert_eq!(shared.rsp_prod(), 0);
    assert_eq!(
        h.netback
            .start_xmit(guest.id, OutboundFrame::from_bytes(&frame_to(UNICAST, 60))),
        Err(XmitError::CarrierDown(guest.id))
    );
}
