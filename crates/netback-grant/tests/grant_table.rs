#![cfg(not(feature = "loom"))]

use std::sync::Arc;

use netback_grant::{
    CopyOp, CopyPtr, EventChannels, Fault, GrantBroker, GrantError, GrantOp, GrantOutput, MapFlags,
    MapOp, Multicall, Page, SimHypervisor, TransferOp,
};
use proptest::prelude::*;

const GUEST: u16 = 7;

fn guest_page(hv: &SimHypervisor, data: &[u8], readonly: bool) -> (Arc<Page>, u32) {
    let page = Arc::new(Page::from_bytes(data));
    let gref = hv.grant_access(GUEST, page.clone(), readonly);
    (page, gref)
}

#[test]
fn readonly_grant_refuses_writable_map_and_copy_into() {
    let hv = SimHypervisor::new();
    let (_page, gref) = guest_page(&hv, b"ro", true);

    let err = hv
        .map(&MapOp {
            dom: GUEST,
            gref,
            flags: MapFlags::empty(),
        })
        .unwrap_err();
    assert_eq!(err, GrantError::PermissionDenied);

    let local = Arc::new(Page::from_bytes(b"xx"));
    let err = hv
        .copy(&CopyOp {
            source: CopyPtr::Local {
                page: local,
                offset: 0,
            },
            dest: CopyPtr::Grant {
                dom: GUEST,
                gref,
                offset: 0,
            },
            len: 2,
        })
        .unwrap_err();
    assert_eq!(err, GrantError::PermissionDenied);
}

#[test]
fn guest_cannot_revoke_a_mapped_grant() {
    let hv = SimHypervisor::new();
    let (_page, gref) = guest_page(&hv, b"abc", true);

    let mapped = hv
        .map(&MapOp {
            dom: GUEST,
            gref,
            flags: MapFlags::READONLY,
        })
        .unwrap();
    assert_eq!(hv.map_count(GUEST, gref), 1);
    assert_eq!(hv.end_access(GUEST, gref), Err(GrantError::PermissionDenied));

    hv.unmap(mapped.handle).unwrap();
    assert_eq!(hv.unmap(mapped.handle), Err(GrantError::BadHandle));
    assert_eq!(hv.end_access(GUEST, gref), Ok(()));
    assert_eq!(hv.active_mappings(), 0);
}

#[test]
fn transfer_moves_a_page_into_an_offered_slot_once() {
    let hv = SimHypervisor::new();
    let gref = hv.grant_transfer(GUEST);
    let page = Arc::new(Page::from_bytes(b"moved"));

    let op = TransferOp {
        page: page.clone(),
        dom: GUEST,
        gref,
    };
    hv.transfer(&op).unwrap();
    assert_eq!(hv.transfer(&op), Err(GrantError::BadGrantRef));

    let received = hv.take_transferred(GUEST, gref).expect("page transferred");
    assert_eq!(received.to_vec(0, 5), b"moved".to_vec());
    assert!(hv.take_transferred(GUEST, gref).is_none());
}

#[test]
fn persistent_fault_fails_every_entry_touching_the_grant() {
    let hv = SimHypervisor::new();
    let (_page, gref) = guest_page(&hv, &[1; 8], true);
    hv.inject_fault(GUEST, gref, Fault::Always(GrantError::BadPage));

    let mut batch = Multicall::new();
    let a = batch.push(GrantOp::Map(MapOp {
        dom: GUEST,
        gref,
        flags: MapFlags::READONLY,
    }));
    let b = batch.push(GrantOp::Map(MapOp {
        dom: GUEST,
        gref,
        flags: MapFlags::READONLY,
    }));
    let mut results = batch.submit_with_retry(&hv, 4);
    assert_eq!(results.take(a).unwrap_err(), GrantError::BadPage);
    assert_eq!(results.take(b).unwrap_err(), GrantError::BadPage);

    hv.clear_faults();
    assert!(hv
        .map(&MapOp {
            dom: GUEST,
            gref,
            flags: MapFlags::READONLY,
        })
        .is_ok());
}

#[test]
fn batched_notify_counts_once_per_call() {
    let hv = SimHypervisor::new();
    let a = hv.bind_port(1);
    let b = hv.bind_port(2);

    hv.notify_batch(&[a, b]);
    hv.notify(a);

    assert_eq!(hv.notifications(a), 2);
    assert_eq!(hv.notifications(b), 1);
    let stats = hv.stats();
    assert_eq!(stats.notify_batches, 1);
    assert_eq!(stats.notifies, 1);

    hv.mask(b);
    assert!(hv.is_masked(b));
    hv.unmask(b);
    assert!(!hv.is_masked(b));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn copy_out_and_back_leaves_guest_page_unchanged(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        offset in 0u16..3000,
    ) {
        let hv = SimHypervisor::new();
        let page = Arc::new(Page::new());
        page.write(usize::from(offset), &data);
        let before = page.to_vec(0, netback_grant::PAGE_SIZE);
        let gref = hv.grant_access(GUEST, page.clone(), false);

        let local = Arc::new(Page::new());
        let len = data.len() as u16;
        let mut batch = Multicall::new();
        let out = batch.push(GrantOp::Copy(CopyOp {
            source: CopyPtr::Grant { dom: GUEST, gref, offset },
            dest: CopyPtr::Local { page: local.clone(), offset: 0 },
            len,
        }));
        let back = batch.push(GrantOp::Copy(CopyOp {
            source: CopyPtr::Local { page: local.clone(), offset: 0 },
            dest: CopyPtr::Grant { dom: GUEST, gref, offset },
            len,
        }));
        let mut results = batch.submit(&hv);
        prop_assert!(matches!(results.take(out), Ok(GrantOutput::Copied)));
        prop_assert!(matches!(results.take(back), Ok(GrantOutput::Copied)));

        prop_assert_eq!(local.to_vec(0, data.len()), data);
        prop_assert_eq!(page.to_vec(0, netback_grant::PAGE_SIZE), before);
    }

    #[test]
    fn map_and_unmap_leaves_guest_page_unchanged(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let hv = SimHypervisor::new();
        let page = Arc::new(Page::from_bytes(&data));
        let gref = hv.grant_access(GUEST, page.clone(), true);

        let mapped = hv.map(&MapOp { dom: GUEST, gref, flags: MapFlags::READONLY }).unwrap();
        prop_assert_eq!(mapped.page.to_vec(0, data.len()), data.clone());
        hv.unmap(mapped.handle).unwrap();

        prop_assert_eq!(page.to_vec(0, data.len()), data);
        prop_assert_eq!(hv.map_count(GUEST, gref), 0);
    }
}
