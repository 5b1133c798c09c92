//! Batch builder for privileged grant operations.
//!
//! Operations are appended with [`Multicall::push`], which returns the entry's index. After
//! [`Multicall::submit`] the per-entry results must be taken back in the same order they were
//! appended; taking out of order is a caller bug and panics.

use tracing::debug;

use crate::{execute, CopyOp, GrantBroker, GrantError, GrantOp, GrantResult};

/// Position of an operation inside one batch.
pub type OpIndex = usize;

#[derive(Debug, Default)]
pub struct Multicall {
    ops: Vec<GrantOp>,
}

impl Multicall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, op: GrantOp) -> OpIndex {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Submit the whole batch as one privileged call.
    pub fn submit<B: GrantBroker + ?Sized>(self, broker: &B) -> MulticallResults {
        if self.ops.is_empty() {
            return MulticallResults::new(Vec::new());
        }
        let expected = self.ops.len();
        let results = broker.multicall(self.ops);
        assert_eq!(
            results.len(),
            expected,
            "grant broker returned {} results for {expected} operations",
            results.len()
        );
        MulticallResults::new(results)
    }

    /// Submit the batch, then re-issue any copy that reported [`GrantError::Again`] on its own,
    /// up to `max_retries` times. Other entries are never resubmitted.
    pub fn submit_with_retry<B: GrantBroker + ?Sized>(
        self,
        broker: &B,
        max_retries: usize,
    ) -> MulticallResults {
        let copies: Vec<Option<CopyOp>> = self
            .ops
            .iter()
            .map(|op| match op {
                GrantOp::Copy(copy) => Some(copy.clone()),
                _ => None,
            })
            .collect();

        let mut results = self.submit(broker);
        for (idx, copy) in copies.into_iter().enumerate() {
            let Some(copy) = copy else { continue };
            let mut attempts = 0;
            while matches!(results.results[idx], Some(Err(GrantError::Again))) && attempts < max_retries
            {
                attempts += 1;
                debug!(op = idx, attempt = attempts, "retrying grant copy");
                results.results[idx] = Some(execute(broker, GrantOp::Copy(copy.clone())));
            }
        }
        results
    }
}

/// Per-entry results of a submitted [`Multicall`].
#[derive(Debug)]
pub struct MulticallResults {
    results: Vec<Option<GrantResult>>,
    cursor: usize,
}

impl MulticallResults {
    fn new(results: Vec<GrantResult>) -> Self {
        Self {
            results: results.into_iter().map(Some).collect(),
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of results not yet taken.
    pub fn remaining(&self) -> usize {
        self.results.len() - self.cursor
    }

    /// Take the result for `idx`, which must be the next entry in append order.
    pub fn take(&mut self, idx: OpIndex) -> GrantResult {
        assert_eq!(
            idx, self.cursor,
            "multicall results consumed out of order: wanted {idx}, next is {}",
            self.cursor
        );
        self.cursor += 1;
        self.results[idx]
            .take()
            .unwrap_or_else(|| panic!("multicall result {idx} already taken"))
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{CopyPtr, Fault, GrantOutput, Page, SimHypervisor};

    fn local(page: &Arc<Page>) -> CopyPtr {
        CopyPtr::Local {
            page: page.clone(),
            offset: 0,
        }
    }

    #[test]
    fn results_come_back_per_entry_in_order() {
        let hv = SimHypervisor::new();
        let guest_page = Arc::new(Page::from_bytes(b"hello"));
        let gref = hv.grant_access(3, guest_page, true);

        let dst = Arc::new(Page::new());
        let mut batch = Multicall::new();
        let good = batch.push(GrantOp::Copy(CopyOp {
            source: CopyPtr::Grant {
                dom: 3,
                gref,
                offset: 0,
            },
            dest: local(&dst),
            len: 5,
        }));
        let bad = batch.push(GrantOp::Copy(CopyOp {
            source: CopyPtr::Grant {
                dom: 3,
                gref: gref + 100,
                offset: 0,
            },
            dest: local(&dst),
            len: 5,
        }));

        let mut results = batch.submit(&hv);
        assert!(matches!(results.take(good), Ok(GrantOutput::Copied)));
        assert_eq!(results.take(bad).unwrap_err(), GrantError::BadGrantRef);
        assert_eq!(dst.to_vec(0, 5), b"hello".to_vec());
        assert_eq!(hv.stats().multicalls, 1);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn taking_results_out_of_order_panics() {
        let hv = SimHypervisor::new();
        let mut batch = Multicall::new();
        batch.push(GrantOp::Unmap(crate::GrantHandle(1)));
        let second = batch.push(GrantOp::Unmap(crate::GrantHandle(2)));
        let mut results = batch.submit(&hv);
        let _ = results.take(second);
    }

    #[test]
    fn transient_copy_failure_is_retried_individually() {
        let hv = SimHypervisor::new();
        let gref = hv.grant_access(4, Arc::new(Page::from_bytes(&[9; 16])), true);
        hv.inject_fault(4, gref, Fault::Once(GrantError::Again));

        let dst = Arc::new(Page::new());
        let mut batch = Multicall::new();
        let idx = batch.push(GrantOp::Copy(CopyOp {
            source: CopyPtr::Grant {
                dom: 4,
                gref,
                offset: 0,
            },
            dest: local(&dst),
            len: 16,
        }));

        let mut results = batch.submit_with_retry(&hv, 3);
        assert!(results.take(idx).is_ok());
        assert_eq!(dst.to_vec(0, 16), vec![9; 16]);

        let stats = hv.stats();
        assert_eq!(stats.multicalls, 1, "retry must not resubmit the batch");
        assert_eq!(stats.copies, 2);
    }
}
