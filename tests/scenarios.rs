mod common;

use common::{deferred, frame, setup};
use netback_engine::{NetbackConfig, OutboundFrame, XmitError};
use netback_grant::PAGE_SIZE;
use netback_ring::{status, TxFlags, TxRequest};

#[test]
fn single_small_frame_is_delivered_and_answered_once() {
    let s = setup(deferred());
    let (mut fe, id) = s.guest(1);
    let data = frame(64, 1);

    let ids = fe.queue_frame(&data, TxFlags::empty(), &[]).unwrap();
    s.kick(&mut fe, id);

    let delivered = s.take_delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].len(), 64);
    assert_eq!(delivered[0].to_vec(), data);

    let responses = fe.collect_tx_responses().unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!((responses[0].id, responses[0].status), (ids[0], status::OKAY));
    assert!(fe.collect_tx_responses().unwrap().is_empty());

    let stats = s.netback.stats(id).unwrap();
    assert_eq!((stats.tx_frames, stats.tx_bytes), (1, 64));
}

#[test]
fn over_long_chain_is_fully_answered_then_the_interface_is_disabled() {
    let s = setup(deferred());
    let (mut fe, id) = s.guest(1);
    let slot = 100u16;
    let slots = 20u16;
    for n in 0..slots {
        let gref = fe.grant_tx_page(0, &frame(usize::from(slot), n as u8));
        let last = n + 1 == slots;
        fe.queue_tx_request(&TxRequest {
            gref,
            offset: 0,
            flags: if last { TxFlags::empty() } else { TxFlags::MORE_DATA },
            id: n,
            size: if n == 0 { slot * slots } else { slot },
        });
    }
    s.kick(&mut fe, id);

    let responses = fe.collect_tx_responses().unwrap();
    let ids: Vec<u16> = responses.iter().map(|r| r.id).collect();
    assert_eq!(ids, (0..slots).collect::<Vec<_>>());
    assert!(responses.iter().all(|r| r.status == status::ERROR));
    assert_eq!(s.held(), 0);

    let stats = s.netback.stats(id).unwrap();
    assert!(stats.busted);
    assert!(!stats.carrier);
    assert_eq!(
        s.netback
            .start_xmit(id, OutboundFrame::from_bytes(&frame(60, 0))),
        Err(XmitError::CarrierDown(id))
    );
}

#[test]
fn exhausted_pool_defers_the_second_guest_until_the_first_releases() {
    let s = setup(NetbackConfig {
        max_pending: 18,
        ..deferred()
    });
    let (mut first, first_id) = s.guest(1);
    let (mut second, second_id) = s.guest(2);
    assert_eq!(s.netback.group_of(first_id), s.netback.group_of(second_id));

    // Each frame keeps one slot mapped past the copied header.
    for n in 0..18 {
        first.queue_frame(&frame(1000, n), TxFlags::empty(), &[]).unwrap();
    }
    s.kick(&mut first, first_id);
    assert_eq!(s.held(), 18);

    let late = frame(1000, 99);
    second.queue_frame(&late, TxFlags::empty(), &[]).unwrap();
    s.kick(&mut second, second_id);
    assert_eq!(s.held(), 18);
    assert!(second.collect_tx_responses().unwrap().is_empty());

    drop(s.take_delivered());
    s.netback.run_deferred();

    assert_eq!(first.collect_tx_responses().unwrap().len(), 18);
    let delivered = s.take_delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].interface(), second_id);
    assert_eq!(delivered[0].to_vec(), late);
    drop(delivered);
    s.netback.run_deferred();

    let responses = second.collect_tx_responses().unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, status::OKAY);
    assert_eq!(s.netback.stats(first_id).unwrap().tx_dropped, 0);
    assert_eq!(s.netback.stats(second_id).unwrap().tx_dropped, 0);
}

#[test]
fn large_receive_waits_for_enough_buffers_and_arrives_once() {
    let s = setup(deferred());
    let (mut fe, id) = s.guest(1);
    assert_eq!(fe.post_rx_buffers(3), 3);
    fe.push_rx();
    s.netback.interrupt(id).unwrap();
    s.netback.run_deferred();

    let data = frame(4 * PAGE_SIZE + 100, 5);
    s.netback
        .start_xmit(id, OutboundFrame::from_bytes(&data))
        .unwrap();
    s.netback.run_deferred();
    assert!(fe.collect_rx().unwrap().is_empty());
    assert_eq!(fe.rx_posted(), 3);

    assert_eq!(fe.post_rx_buffers(2), 2);
    assert!(fe.push_rx(), "backend asked to hear about the fifth buffer");
    s.netback.interrupt(id).unwrap();
    s.netback.run_deferred();

    let frames = fe.collect_rx().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, data);
    assert_eq!(fe.rx_posted(), 0);

    s.netback.run_deferred();
    assert!(fe.collect_rx().unwrap().is_empty());
    let stats = s.netback.stats(id).unwrap();
    assert_eq!((stats.rx_frames, stats.rx_dropped), (1, 0));
}
