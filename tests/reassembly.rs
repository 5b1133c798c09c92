mod common;

use std::sync::Arc;

use common::{deferred, setup};
use netback_engine::OutboundFrame;
use netback_grant::{Page, PAGE_SIZE};
use netback_ring::TxFlags;
use proptest::prelude::*;

fn payload(len: usize, seed: u8) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len)
        .map(|i| (i as u8).wrapping_mul(seed | 1).wrapping_add(seed))
        .collect();
    data[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x42]);
    data
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn guest_frames_reach_the_stack_byte_for_byte(
        len in 14usize..(4 * PAGE_SIZE),
        seed in any::<u8>(),
    ) {
        let s = setup(deferred());
        let (mut fe, id) = s.guest(1);
        let data = payload(len, seed);

        fe.queue_frame(&data, TxFlags::empty(), &[]).unwrap();
        s.kick(&mut fe, id);

        let delivered = s.take_delivered();
        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(delivered[0].len(), len);
        prop_assert_eq!(delivered[0].to_vec(), data);
        drop(delivered);
        s.netback.run_deferred();
        prop_assert_eq!(fe.collect_tx_responses().unwrap().len(), len.div_ceil(PAGE_SIZE));
    }

    #[test]
    fn host_segments_reach_the_guest_byte_for_byte(
        cuts in proptest::collection::vec((1usize..1500, 0usize..2500), 1..8),
        seed in any::<u8>(),
    ) {
        let total: usize = cuts.iter().map(|(len, _)| len).sum();
        prop_assume!(total >= 14);
        let data = payload(total, seed);

        let mut frame = OutboundFrame::new();
        let mut at = 0;
        for (len, offset) in &cuts {
            let page = Page::new();
            page.write(*offset, &data[at..at + len]);
            frame.push_segment(Arc::new(page), *offset, *len).unwrap();
            at += len;
        }

        let s = setup(deferred());
        let (mut fe, id) = s.guest(1);
        fe.post_rx_buffers(16);
        fe.push_rx();
        s.netback.interrupt(id).unwrap();
        s.netback.start_xmit(id, frame).unwrap();
        s.netback.run_deferred();

        let frames = fe.collect_rx().unwrap();
        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(&frames[0].data, &data);
        prop_assert_eq!(frames[0].error, None);
    }
}
