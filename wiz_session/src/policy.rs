use wiz_clock::{DurationSecs, UnixTime};

use crate::CredentialSet;

/// Decides when a credential set is due for renewal
///
/// Renewal is due once less than the renewal margin remains before expiry.
/// A margin keeps renewal off the hot path for most requests while making
/// sure no request goes out with a token that has already expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    margin: DurationSecs,
}

impl ExpiryPolicy {
    /// The default renewal margin of five minutes
    pub const DEFAULT_MARGIN: DurationSecs = DurationSecs::from_mins(5);

    /// Constructs a policy with a custom renewal margin
    pub const fn new(margin: DurationSecs) -> Self {
        Self { margin }
    }

    /// The renewal margin
    #[inline]
    pub fn margin(&self) -> DurationSecs {
        self.margin
    }

    /// Whether renewal is due as of `now`
    ///
    /// Absent credentials are always due.
    #[inline]
    pub fn is_renewal_due(&self, credentials: Option<&CredentialSet>, now: UnixTime) -> bool {
        match credentials {
            Some(credentials) => credentials.expires_at() < now + self.margin,
            None => true,
        }
    }

    /// The instant from which a background renewal should be attempted
    ///
    /// Renewal is reported as due one second later. Credentials that do not
    /// outlive the margin are instead renewed halfway through their lifetime.
    #[inline]
    pub fn renewal_due_at(&self, credentials: &CredentialSet) -> UnixTime {
        let due = credentials.expires_at() - self.margin;
        if due > credentials.issued_at() {
            due
        } else {
            credentials.issued_at() + DurationSecs(credentials.lifetime().0 / 2)
        }
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MARGIN)
    }
}
