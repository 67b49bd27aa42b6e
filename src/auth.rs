//! Publish token store
//!
//! Short-lived single-use tokens gate RTMP publish admission. A token is
//! bound to one stream key and optionally to the publisher's IP; once
//! consumed or expired it never validates again. Everything lives in one
//! small map behind an exclusive lock, so validate-and-consume is a single
//! atomic check-and-set and two racing publishers cannot both win.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::config::TokenConfig;
use crate::error::AuthError;

/// Token length in characters; 32 alphanumerics carry ~190 bits of entropy
const TOKEN_LEN: usize = 32;

/// How long an expired token lingers before it is purged
const PURGE_GRACE_SECS: i64 = 60;

/// A single-use publish token
#[derive(Debug, Clone)]
pub struct PublishToken {
    pub token: String,
    pub stream_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub publisher_hint: Option<IpAddr>,
    pub consumed: bool,
}

/// In-memory token table
pub struct TokenStore {
    config: TokenConfig,
    tokens: Mutex<HashMap<String, PublishToken>>,
}

impl TokenStore {
    pub fn new(config: TokenConfig) -> Self {
        Self {
            config,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a token for `stream_key`.
    ///
    /// A non-positive `requested_ttl_secs` selects the configured default;
    /// anything else is clamped to the configured maximum.
    pub fn issue(
        &self,
        stream_key: &str,
        requested_ttl_secs: i64,
        publisher_hint: Option<IpAddr>,
    ) -> PublishToken {
        let ttl_secs = if requested_ttl_secs <= 0 {
            self.config.default_ttl_secs as i64
        } else {
            requested_ttl_secs.min(self.config.max_ttl_secs as i64)
        };

        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();

        let now = Utc::now();
        let entry = PublishToken {
            token: token.clone(),
            stream_key: stream_key.to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            publisher_hint,
            consumed: false,
        };

        debug!(stream_key, ttl_secs, "issued publish token");
        self.tokens.lock().insert(token, entry.clone());
        entry
    }

    /// Check a token without consuming it
    pub fn validate(
        &self,
        token: &str,
        stream_key: &str,
        publisher_ip: Option<IpAddr>,
    ) -> Result<(), AuthError> {
        let tokens = self.tokens.lock();
        let entry = tokens.get(token).ok_or(AuthError::NotFound)?;
        Self::check(&self.config, entry, stream_key, publisher_ip)
    }

    /// Atomically validate and mark the token used.
    ///
    /// The check and the set happen under one lock acquisition, so at most
    /// one caller ever succeeds for a given token.
    pub fn consume(
        &self,
        token: &str,
        stream_key: &str,
        publisher_ip: Option<IpAddr>,
    ) -> Result<(), AuthError> {
        let mut tokens = self.tokens.lock();
        let entry = tokens.get_mut(token).ok_or(AuthError::NotFound)?;
        Self::check(&self.config, entry, stream_key, publisher_ip)?;
        entry.consumed = true;
        Ok(())
    }

    /// Purge every token that expired more than a minute ago. Returns the
    /// number of entries removed.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - Duration::seconds(PURGE_GRACE_SECS);
        let mut tokens = self.tokens.lock();
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at > cutoff);
        before - tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    fn check(
        config: &TokenConfig,
        entry: &PublishToken,
        stream_key: &str,
        publisher_ip: Option<IpAddr>,
    ) -> Result<(), AuthError> {
        if entry.consumed {
            return Err(AuthError::AlreadyUsed);
        }
        if entry.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        if entry.stream_key != stream_key {
            return Err(AuthError::WrongStream);
        }
        if config.bind_publisher_ip {
            if let (Some(hint), Some(ip)) = (entry.publisher_hint, publisher_ip) {
                if hint != ip {
                    return Err(AuthError::WrongAddress);
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn force_expire(&self, token: &str, seconds_ago: i64) {
        let mut tokens = self.tokens.lock();
        if let Some(entry) = tokens.get_mut(token) {
            entry.expires_at = Utc::now() - Duration::seconds(seconds_ago);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> TokenStore {
        TokenStore::new(TokenConfig::default())
    }

    #[test]
    fn test_issue_validate_consume_once() {
        let store = store();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let tok = store.issue("live1", 60, Some(ip));
        assert_eq!(tok.token.len(), TOKEN_LEN);

        assert_eq!(store.validate(&tok.token, "live1", Some(ip)), Ok(()));
        assert_eq!(store.consume(&tok.token, "live1", Some(ip)), Ok(()));
        assert_eq!(
            store.validate(&tok.token, "live1", Some(ip)),
            Err(AuthError::AlreadyUsed)
        );
        assert_eq!(
            store.consume(&tok.token, "live1", Some(ip)),
            Err(AuthError::AlreadyUsed)
        );
    }

    #[test]
    fn test_expired_token_never_validates() {
        let store = store();
        let tok = store.issue("live1", 60, None);
        store.force_expire(&tok.token, 1);
        assert_eq!(
            store.validate(&tok.token, "live1", None),
            Err(AuthError::Expired)
        );
    }

    #[test]
    fn test_wrong_stream_key() {
        let store = store();
        let tok = store.issue("live1", 60, None);
        assert_eq!(
            store.validate(&tok.token, "live2", None),
            Err(AuthError::WrongStream)
        );
    }

    #[test]
    fn test_unknown_token() {
        let store = store();
        assert_eq!(
            store.validate("nope", "live1", None),
            Err(AuthError::NotFound)
        );
    }

    #[test]
    fn test_ip_binding_enforced_when_enabled() {
        let config = TokenConfig {
            bind_publisher_ip: true,
            ..Default::default()
        };
        let store = TokenStore::new(config);
        let hint: IpAddr = "1.2.3.4".parse().unwrap();
        let other: IpAddr = "5.6.7.8".parse().unwrap();
        let tok = store.issue("live1", 60, Some(hint));

        assert_eq!(
            store.validate(&tok.token, "live1", Some(other)),
            Err(AuthError::WrongAddress)
        );
        assert_eq!(store.validate(&tok.token, "live1", Some(hint)), Ok(()));
    }

    #[test]
    fn test_ttl_clamped_and_defaulted() {
        let store = store();
        let tok = store.issue("live1", 0, None);
        let default_secs = (tok.expires_at - tok.created_at).num_seconds();
        assert_eq!(default_secs, 300);

        let tok = store.issue("live1", 999_999, None);
        let clamped = (tok.expires_at - tok.created_at).num_seconds();
        assert_eq!(clamped, 3600);
    }

    #[test]
    fn test_sweep_purges_after_grace() {
        let store = store();
        let tok = store.issue("live1", 60, None);
        assert_eq!(store.sweep(), 0);

        // expired but inside the grace window: kept
        store.force_expire(&tok.token, 30);
        assert_eq!(store.sweep(), 0);
        assert_eq!(store.len(), 1);

        // past the grace window: purged
        store.force_expire(&tok.token, PURGE_GRACE_SECS + 1);
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_racing_consumers_one_winner() {
        let store = Arc::new(store());
        let tok = store.issue("live1", 60, None);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let token = tok.token.clone();
            handles.push(std::thread::spawn(move || {
                store.consume(&token, "live1", None).is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(wins, 1);
    }
}
