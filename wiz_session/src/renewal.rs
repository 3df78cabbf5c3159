use std::time::Duration;

use tokio::task::JoinHandle;
use wiz_clock::{Clock, DurationSecs, UnixTime};

use crate::{jitter::RenewalJitter, AuthError, CredentialSet, ExpiryPolicy, SessionManager};

// The timer does not advance while a machine is suspended, so sleeps are
// capped and the clock re-read on every wake.
const HEARTBEAT: DurationSecs = DurationSecs(30);

// Credentials are never renewed sooner than this after they were issued.
const MIN_CREDENTIAL_AGE: DurationSecs = DurationSecs(1);

/// How background renewal waits between attempts that fail transiently
///
/// The first retry waits `first_delay`, and each consecutive failure doubles
/// the wait up to `max_delay`. A successful renewal starts over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenewalBackoff {
    first_delay: Duration,
    max_delay: Duration,
}

impl Default for RenewalBackoff {
    /// Waits 100 ms after the first failure, doubling up to 15 seconds
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(15))
    }
}

impl RenewalBackoff {
    /// Constructs a backoff starting at `first_delay` and capped at `max_delay`
    pub const fn new(first_delay: Duration, max_delay: Duration) -> Self {
        Self {
            first_delay,
            max_delay,
        }
    }

    /// The wait after `failures` consecutive failed attempts
    pub fn delay_after(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        self.first_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
    }
}

enum Delay {
    UntilTime(UnixTime),
    ForDuration(Duration),
}

/// Spawns a task that renews the access token in the background shortly
/// before it becomes due
///
/// Renewals go through the manager's refresh coordinator, so they share a
/// flight with any renewal a request triggers at the same moment. Transient
/// failures are retried according to `backoff`. The task ends once there is
/// no session or a renewal is refused.
pub fn spawn_background_renewal<J>(
    manager: SessionManager,
    jitter: J,
    backoff: RenewalBackoff,
) -> JoinHandle<()>
where
    J: RenewalJitter + Send + 'static,
{
    tokio::spawn(renew_forever(manager, jitter, backoff))
}

/// When to renew `credentials`
///
/// The jittered due instant, but never before the credentials are
/// [`MIN_CREDENTIAL_AGE`] old, so that credentials issued already due are not
/// renewed in a tight loop.
fn next_renewal<J: RenewalJitter>(
    policy: ExpiryPolicy,
    jitter: &mut J,
    credentials: &CredentialSet,
) -> UnixTime {
    let issued_at = credentials.issued_at();
    let due = policy.renewal_due_at(credentials);
    let earliest = issued_at + MIN_CREDENTIAL_AGE;

    (due - jitter.lead(issued_at, due)).max(earliest)
}

async fn renew_forever<J: RenewalJitter>(
    manager: SessionManager,
    mut jitter: J,
    backoff: RenewalBackoff,
) {
    let clock = manager.clock().clone();
    let policy = manager.policy();
    let mut failures = 0u32;

    let Some(first) = manager.session() else {
        tracing::info!("no session to renew, halting background renewal");
        return;
    };
    let mut expires_at = first.credentials().expires_at();
    let mut delay = Delay::UntilTime(next_renewal(policy, &mut jitter, first.credentials()));

    loop {
        match delay {
            Delay::ForDuration(d) => tokio::time::sleep(d).await,
            Delay::UntilTime(due) => loop {
                let now = clock.now();
                if now >= due {
                    tracing::trace!("access token now due for renewal");
                    break;
                }

                let until_due = due - now;
                let sleep = until_due.min(HEARTBEAT);
                tracing::trace!(
                    delay = sleep.0,
                    until_due = until_due.0,
                    "access token not yet due, sleeping"
                );
                tokio::time::sleep(sleep.into()).await;

                match manager.session() {
                    Some(current) if current.credentials().expires_at() == expires_at => {}
                    Some(_) => break,
                    None => {
                        tracing::info!("session ended, halting background renewal");
                        return;
                    }
                }
            },
        }

        if let Some(current) = manager.session() {
            let credentials = current.credentials();
            if credentials.expires_at() != expires_at {
                let next = next_renewal(policy, &mut jitter, credentials);
                if next > clock.now() {
                    tracing::debug!(
                        expires_at = credentials.expires_at().0,
                        "access token was renewed elsewhere"
                    );
                    expires_at = credentials.expires_at();
                    delay = Delay::UntilTime(next);
                    continue;
                }
            }
        }

        tracing::debug!("renewing access token in the background");
        delay = match manager.refresh().await {
            Ok(session) => {
                failures = 0;
                let credentials = session.credentials();
                expires_at = credentials.expires_at();
                let next = next_renewal(policy, &mut jitter, credentials);
                tracing::debug!(
                    next = next.0,
                    delay = (next - clock.now()).0,
                    "waiting for access token to become due"
                );
                Delay::UntilTime(next)
            }
            Err(AuthError::NoSession) => {
                tracing::info!("session ended, halting background renewal");
                return;
            }
            Err(error) if error.is_terminal() => {
                tracing::info!(
                    error = (&error as &dyn std::error::Error),
                    "renewal refused, halting background renewal"
                );
                return;
            }
            Err(error) => {
                failures = failures.saturating_add(1);
                let delay = backoff.delay_after(failures);
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "error renewing access token, will retry"
                );
                Delay::ForDuration(delay)
            }
        };
    }
}
