use serde::{Deserialize, Serialize};
use wiz_clock::{Clock, DurationSecs, UnixTime};

use crate::{AccessToken, AccessTokenRef, AuthError, RefreshToken, RefreshTokenRef};

/// An access/refresh token pair with the interval during which the access
/// token is valid
///
/// A credential set always satisfies `expires_at > issued_at`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    access_token: AccessToken,
    refresh_token: RefreshToken,
    issued_at: UnixTime,
    expires_at: UnixTime,
}

impl CredentialSet {
    /// Constructs a credential set issued at `issued_at` and valid for `lifetime`
    ///
    /// Fails if the lifetime is zero.
    pub fn issue(
        access_token: AccessToken,
        refresh_token: RefreshToken,
        issued_at: UnixTime,
        lifetime: DurationSecs,
    ) -> Result<Self, AuthError> {
        let expires_at = issued_at + lifetime;
        if expires_at <= issued_at {
            return Err(AuthError::InvalidLifetime { lifetime });
        }

        Ok(Self {
            access_token,
            refresh_token,
            issued_at,
            expires_at,
        })
    }

    /// Constructs a credential set issued now according to `clock`
    pub fn issue_with_clock<C: Clock>(
        access_token: AccessToken,
        refresh_token: RefreshToken,
        lifetime: DurationSecs,
        clock: &C,
    ) -> Result<Self, AuthError> {
        Self::issue(access_token, refresh_token, clock.now(), lifetime)
    }

    /// Produces the credential set that results from renewing the access token
    ///
    /// The refresh token is carried over unchanged.
    pub fn renewed(
        &self,
        access_token: AccessToken,
        issued_at: UnixTime,
        lifetime: DurationSecs,
    ) -> Result<Self, AuthError> {
        Self::issue(
            access_token,
            self.refresh_token.clone(),
            issued_at,
            lifetime,
        )
    }

    /// Gets the current access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Gets the time that the access token was issued
    #[inline]
    pub fn issued_at(&self) -> UnixTime {
        self.issued_at
    }

    /// Gets the time that the access token will expire
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// Gets the token's lifetime
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.expires_at - self.issued_at
    }

    /// Gets the interval during which the access token is valid
    #[inline]
    pub fn valid_interval(&self) -> std::ops::Range<UnixTime> {
        self.issued_at..self.expires_at
    }

    /// Whether the access token is no longer valid as of `time`
    #[inline]
    pub fn is_expired_at(&self, time: UnixTime) -> bool {
        time >= self.expires_at
    }

    /// Gets a duration for how much longer the access token would be valid
    /// as of the provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expires_at - time
    }
}

/// A denormalized copy of the authenticated principal
///
/// This is a convenience snapshot only; the server holds the authoritative
/// record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    /// The user's identifier
    pub id: u64,
    /// The user's login name
    pub username: String,
    /// The user's email address, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// The user's remaining credits
    #[serde(default)]
    pub credits: i64,
    /// Whether the user is an administrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,
}

/// The credential set together with the user it was issued to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    credentials: CredentialSet,
    user: UserSnapshot,
}

impl Session {
    /// Constructs a new session
    pub fn new(credentials: CredentialSet, user: UserSnapshot) -> Self {
        Self { credentials, user }
    }

    /// Gets the session's credentials
    #[inline]
    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    /// Gets the user snapshot
    #[inline]
    pub fn user(&self) -> &UserSnapshot {
        &self.user
    }

    /// Returns a copy of this session holding `credentials` instead
    pub fn with_credentials(&self, credentials: CredentialSet) -> Self {
        Self {
            credentials,
            user: self.user.clone(),
        }
    }

    /// Returns a copy of this session holding `user` instead
    pub fn with_user(&self, user: UserSnapshot) -> Self {
        Self {
            credentials: self.credentials.clone(),
            user,
        }
    }
}
