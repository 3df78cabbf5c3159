use std::time::Duration;

use url::Url;
use wiz_clock::DurationSecs;

use crate::{ExpiryPolicy, HttpAuthService, ReadCache};

/// Settings for a [`SessionManager`][crate::SessionManager] backed by an
/// authentication service over HTTP
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    api_base_url: Url,
    renewal_margin: DurationSecs,
    auth_timeout: Duration,
    cache_stale_after: DurationSecs,
}

impl SessionConfig {
    /// The API base URL used when none is configured
    pub const DEFAULT_API_BASE_URL: &'static str = "http://localhost:5000/api/";

    /// Constructs a configuration for the API rooted at `api_base_url`
    ///
    /// Uses a renewal margin of five minutes, a ten second timeout on calls to
    /// the authentication service, and lets cached reads go stale after five
    /// minutes.
    pub fn new(api_base_url: Url) -> Self {
        Self {
            api_base_url,
            renewal_margin: ExpiryPolicy::DEFAULT_MARGIN,
            auth_timeout: HttpAuthService::DEFAULT_TIMEOUT,
            cache_stale_after: ReadCache::DEFAULT_STALE_AFTER,
        }
    }

    /// Sets how long before expiry a credential becomes due for renewal
    pub fn with_renewal_margin(mut self, margin: DurationSecs) -> Self {
        self.renewal_margin = margin;
        self
    }

    /// Sets the timeout applied to each call to the authentication service
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Sets how long cached reads remain fresh
    pub fn with_cache_stale_after(mut self, stale_after: DurationSecs) -> Self {
        self.cache_stale_after = stale_after;
        self
    }

    /// The API base URL
    #[inline]
    pub fn api_base_url(&self) -> &Url {
        &self.api_base_url
    }

    /// The renewal margin
    #[inline]
    pub fn renewal_margin(&self) -> DurationSecs {
        self.renewal_margin
    }

    /// The timeout applied to each call to the authentication service
    #[inline]
    pub fn auth_timeout(&self) -> Duration {
        self.auth_timeout
    }

    /// How long cached reads remain fresh
    #[inline]
    pub fn cache_stale_after(&self) -> DurationSecs {
        self.cache_stale_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_components() {
        let config = SessionConfig::new(SessionConfig::DEFAULT_API_BASE_URL.parse().unwrap());

        assert_eq!(config.api_base_url().as_str(), "http://localhost:5000/api/");
        assert_eq!(config.renewal_margin(), DurationSecs(300));
        assert_eq!(config.auth_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache_stale_after(), DurationSecs(300));
    }

    #[test]
    fn builders_override_defaults() {
        let config = SessionConfig::new("https://api.example.com/".parse().unwrap())
            .with_renewal_margin(DurationSecs(60))
            .with_auth_timeout(Duration::from_secs(2))
            .with_cache_stale_after(DurationSecs::ZERO);

        assert_eq!(config.renewal_margin(), DurationSecs(60));
        assert_eq!(config.auth_timeout(), Duration::from_secs(2));
        assert_eq!(config.cache_stale_after(), DurationSecs::ZERO);
    }
}
