//! Spreading background renewals out so that clients holding credentials
//! issued at the same moment do not all renew at the same moment

use wiz_clock::{DurationSecs, UnixTime};

/// Decides how far ahead of its due instant a renewal is attempted
pub trait RenewalJitter {
    /// The lead to take ahead of `due` for credentials issued at `issued_at`
    ///
    /// Background renewal never schedules a renewal before the credentials
    /// were issued, whatever lead is returned.
    fn lead(&mut self, issued_at: UnixTime, due: UnixTime) -> DurationSecs;
}

/// Renews exactly when credentials become due
#[derive(Clone, Copy, Debug, Default)]
pub struct NoJitter;

impl RenewalJitter for NoJitter {
    #[inline]
    fn lead(&mut self, _: UnixTime, _: UnixTime) -> DurationSecs {
        DurationSecs::ZERO
    }
}

#[cfg(feature = "rand")]
mod random {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use wiz_clock::{DurationSecs, UnixTime};

    /// Renews up to `max_lead` early, chosen uniformly at random
    ///
    /// The lead never exceeds half of the time between issue and the due
    /// instant, so credentials with a short lifetime still get used for a
    /// while before they are renewed.
    #[derive(Debug)]
    pub struct RandomLead<R = StdRng> {
        max_lead: DurationSecs,
        rng: R,
    }

    impl RandomLead {
        /// Renews up to `max_lead` early, seeded from the operating system
        pub fn new(max_lead: DurationSecs) -> Self {
            Self::with_rng(max_lead, StdRng::from_entropy())
        }
    }

    impl<R> RandomLead<R> {
        /// Renews up to `max_lead` early, drawing from `rng`
        pub fn with_rng(max_lead: DurationSecs, rng: R) -> Self {
            Self { max_lead, rng }
        }
    }

    impl<R: Rng> super::RenewalJitter for RandomLead<R> {
        fn lead(&mut self, issued_at: UnixTime, due: UnixTime) -> DurationSecs {
            let half_window = DurationSecs((due - issued_at).0 / 2);
            let max_lead = self.max_lead.min(half_window);
            if max_lead == DurationSecs::ZERO {
                return DurationSecs::ZERO;
            }

            DurationSecs(self.rng.gen_range(0..max_lead.0))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::super::RenewalJitter;
        use super::*;

        const ISSUED: UnixTime = UnixTime(10_000);

        fn seeded(max_lead: u64) -> RandomLead<StdRng> {
            RandomLead::with_rng(DurationSecs(max_lead), StdRng::seed_from_u64(7))
        }

        #[test]
        fn leads_stay_below_the_maximum() {
            let mut jitter = seeded(60);
            let due = ISSUED + DurationSecs(3300);

            for _ in 0..100 {
                assert!(jitter.lead(ISSUED, due) < DurationSecs(60));
            }
        }

        #[test]
        fn short_lifetimes_cap_the_lead_at_half_the_window() {
            let mut jitter = seeded(60);
            let due = ISSUED + DurationSecs(20);

            for _ in 0..100 {
                assert!(jitter.lead(ISSUED, due) < DurationSecs(10));
            }
        }

        #[test]
        fn credentials_due_on_issue_get_no_lead() {
            let mut jitter = seeded(60);
            assert_eq!(jitter.lead(ISSUED, ISSUED), DurationSecs::ZERO);
            assert_eq!(
                RandomLead::new(DurationSecs::ZERO).lead(ISSUED, ISSUED + DurationSecs(3300)),
                DurationSecs::ZERO
            );
        }
    }
}

#[cfg(feature = "rand")]
pub use random::RandomLead;
