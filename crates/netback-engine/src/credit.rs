//! Per-interface token bucket for guest transmit bytes.

use std::time::{Duration, Instant};

/// Transmit allowance for one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditLimit {
    pub bytes_per_window: u64,
    pub window: Duration,
}

impl CreditLimit {
    pub const UNLIMITED: Self = Self {
        bytes_per_window: u64::MAX,
        window: Duration::ZERO,
    };

    pub fn new(bytes_per_window: u64, window: Duration) -> Self {
        Self {
            bytes_per_window,
            window,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_window == u64::MAX
    }
}

impl Default for CreditLimit {
    fn default() -> Self {
        Self::UNLIMITED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditState {
    HasCredit,
    WaitingForTimer { until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Skip the interface until `until`.
    Deferred { until: Instant },
}

#[derive(Debug, Clone)]
pub struct CreditBucket {
    limit: CreditLimit,
    max_burst: u64,
    remaining: u64,
    next_replenish: Instant,
    state: CreditState,
}

impl CreditBucket {
    /// `min_burst` is raised to at least the largest admissible frame so a maximal frame can
    /// always eventually pass.
    pub fn new(limit: CreditLimit, min_burst: u64, now: Instant) -> Self {
        let max_burst = limit.bytes_per_window.max(min_burst);
        Self {
            limit,
            max_burst,
            remaining: limit.bytes_per_window,
            next_replenish: now + limit.window,
            state: CreditState::HasCredit,
        }
    }

    pub fn limit(&self) -> CreditLimit {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn max_burst(&self) -> u64 {
        self.max_burst
    }

    pub fn state(&self) -> CreditState {
        self.state
    }

    pub fn admit(&mut self, bytes: u64, now: Instant) -> Admission {
        if self.limit.is_unlimited() {
            return Admission::Admitted;
        }
        if let CreditState::WaitingForTimer { until } = self.state {
            if now < until {
                return Admission::Deferred { until };
            }
        }

        if bytes > self.remaining && now >= self.next_replenish {
            self.replenish(now);
        }
        if bytes <= self.remaining {
            self.remaining -= bytes;
            self.state = CreditState::HasCredit;
            return Admission::Admitted;
        }

        let until = self.next_replenish;
        self.state = CreditState::WaitingForTimer { until };
        Admission::Deferred { until }
    }

    fn replenish(&mut self, now: Instant) {
        self.remaining = self
            .remaining
            .saturating_add(self.limit.bytes_per_window)
            .min(self.max_burst);
        self.next_replenish = now + self.limit.window;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn unlimited_bucket_never_defers() {
        let now = Instant::now();
        let mut bucket = CreditBucket::new(CreditLimit::UNLIMITED, 65549, now);
        for _ in 0..1000 {
            assert_eq!(bucket.admit(65549, now), Admission::Admitted);
        }
    }

    #[test]
    fn exhausted_bucket_waits_for_the_window() {
        let t0 = Instant::now();
        let mut bucket = CreditBucket::new(CreditLimit::new(1000, 10 * MS), 1000, t0);

        assert_eq!(bucket.admit(600, t0), Admission::Admitted);
        assert_eq!(bucket.admit(600, t0), Admission::Deferred { until: t0 + 10 * MS });
        assert!(matches!(bucket.state(), CreditState::WaitingForTimer { .. }));
        assert_eq!(bucket.admit(1, t0 + 5 * MS), Admission::Deferred { until: t0 + 10 * MS });

        assert_eq!(bucket.admit(600, t0 + 10 * MS), Admission::Admitted);
        assert_eq!(bucket.state(), CreditState::HasCredit);
        // Replenishment is clamped to the burst before the charge.
        assert_eq!(bucket.remaining(), 1000 - 600);
    }

    #[test]
    fn large_frame_passes_once_burst_accumulates() {
        let t0 = Instant::now();
        let mut bucket = CreditBucket::new(CreditLimit::new(1000, 10 * MS), 2500, t0);
        assert_eq!(bucket.max_burst(), 2500);

        let mut now = t0;
        let mut waits = 0;
        while let Admission::Deferred { until } = bucket.admit(2500, now) {
            now = until;
            waits += 1;
            assert!(waits < 5, "large frame starved");
        }
        assert_eq!(waits, 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn credit_stays_within_burst(
            per_window in 1u64..100_000,
            min_burst in 1u64..200_000,
            steps in proptest::collection::vec((0u64..150_000, 0u64..30), 1..200),
        ) {
            let mut now = Instant::now();
            let mut bucket = CreditBucket::new(CreditLimit::new(per_window, 10 * MS), min_burst, now);
            for (bytes, advance_ms) in steps {
                now += Duration::from_millis(advance_ms);
                match bucket.admit(bytes, now) {
                    Admission::Admitted => {
                        prop_assert!(bucket.remaining() + bytes <= bucket.max_burst());
                    }
                    Admission::Deferred { until } => prop_assert!(until > now || bucket.remaining() < bytes),
                }
                prop_assert!(bucket.remaining() <= bucket.max_burst());
            }
        }
    }
}
