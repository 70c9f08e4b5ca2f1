//! In-memory token store.

use std::time::Duration;

use chatwire_core::Principal;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::TokenValidator;
use crate::token::{TOKEN_PREFIX, decode_token, encode_token};

/// What a token was issued for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRecord {
    /// The identity the token authenticates.
    pub principal: Principal,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// First instant at which the token is no longer accepted.
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Whether the token is still accepted at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Concurrent map from raw token to [`TokenRecord`].
pub struct InMemoryTokenStore {
    tokens: DashMap<String, TokenRecord>,
    ttl: Duration,
}

impl InMemoryTokenStore {
    /// Create an empty store whose tokens live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    /// Issue a token for `principal` with the store's lifetime.
    ///
    /// Returns the transport (base64) form.
    pub fn issue(&self, principal: &Principal) -> String {
        self.issue_with_ttl(principal, self.ttl)
    }

    /// Issue a token with an explicit lifetime.
    pub fn issue_with_ttl(&self, principal: &Principal, ttl: Duration) -> String {
        let issued_at = Utc::now();
        let raw = format!(
            "{TOKEN_PREFIX}{}_{}",
            Uuid::new_v4(),
            issued_at.timestamp_millis()
        );
        let lifetime = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = issued_at
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let _ = self.tokens.insert(
            raw.clone(),
            TokenRecord {
                principal: principal.clone(),
                issued_at,
                expires_at,
            },
        );
        debug!(user_id = principal.user_id, "issued token");
        encode_token(&raw)
    }

    /// Look up a token, evicting it if it has expired.
    pub fn lookup(&self, encoded: &str) -> Option<TokenRecord> {
        let raw = match decode_token(encoded) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "rejecting malformed token");
                return None;
            }
        };

        let now = Utc::now();
        let record = self.tokens.get(&raw).map(|r| r.value().clone())?;
        if record.is_valid_at(now) {
            return Some(record);
        }

        let _ = self.tokens.remove_if(&raw, |_, r| !r.is_valid_at(now));
        debug!(user_id = record.principal.user_id, "evicted expired token");
        None
    }

    /// Forget a token. Returns whether it was known.
    pub fn revoke(&self, encoded: &str) -> bool {
        decode_token(encoded)
            .ok()
            .and_then(|raw| self.tokens.remove(&raw))
            .is_some()
    }

    /// Drop every expired token. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.tokens.len();
        self.tokens.retain(|_, r| r.is_valid_at(now));
        let removed = before.saturating_sub(self.tokens.len());
        if removed > 0 {
            info!(removed, "cleaned up expired tokens");
        }
        removed
    }

    /// Number of stored tokens, expired or not.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are stored.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenValidator for InMemoryTokenStore {
    fn validate(&self, token: &str) -> Option<Principal> {
        self.lookup(token).map(|record| record.principal)
    }
}
