//! Cached platform credentials.
//!
//! Credentials live only in the TTL cache. Each one is written under every
//! key of its [`CacheKeySet`](crate::keys::CacheKeySet) and read back with
//! ordered fallback, so a key-strategy switch never causes a miss.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenManager                       │
//! │  - decides what to fetch and when        │
//! └─────────────────────────────────────────┘
//!          ↓ set(keys, ttl)     ↑ get(keys)
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - dual-write primary + compat keys      │
//! │  - ordered fallback reads                │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       CacheStore (Redis, memory)         │
//! │  - per-key TTL, expiry enforced here     │
//! └─────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

mod storage;

pub use storage::CredentialStore;

/// Lower bound for any cached credential lifetime, in seconds.
pub const MIN_CACHE_TTL_SECONDS: u64 = 60;

/// The four credential kinds of the token chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    VerifyTicket,
    ComponentToken,
    PreAuthCode,
    AuthorizerToken,
}

/// A credential as written to the cache.
#[derive(Clone, Debug, Serialize)]
pub struct Credential {
    pub kind: CredentialKind,

    /// Component app id, or the authorizer app id for authorizer tokens
    pub owner_id: String,

    /// Opaque bearer value
    pub value: String,

    pub issued_at: DateTime<Utc>,

    /// Lifetime granted in the cache (already reduced by the safety margin)
    pub ttl_seconds: u64,
}

impl Credential {
    pub fn new(kind: CredentialKind, owner_id: &str, value: &str, ttl_seconds: u64) -> Self {
        Self {
            kind,
            owner_id: owner_id.to_string(),
            value: value.to_string(),
            issued_at: Utc::now(),
            ttl_seconds,
        }
    }

    /// Saturates at the latest representable time.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| self.issued_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Cache lifetime for a value the platform says lives `remote_ttl` seconds.
///
/// Subtracts `margin` so the cached copy dies before the remote one, and
/// never goes below [`MIN_CACHE_TTL_SECONDS`].
pub fn cache_ttl(remote_ttl: u64, margin: u64) -> u64 {
    remote_ttl
        .saturating_sub(margin)
        .max(MIN_CACHE_TTL_SECONDS)
}

/// First few characters of a secret for log lines.
pub fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(8).collect();
    format!("{}***", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        assert_eq!(mask("ticket@@@abcdefgh"), "ticket@@***");
        assert_eq!(mask("abc"), "abc***");
    }

    #[test]
    fn test_cache_ttl_subtracts_margin() {
        assert_eq!(cache_ttl(7200, 300), 6900);
        assert_eq!(cache_ttl(600, 30), 570);
    }

    #[test]
    fn test_cache_ttl_floor() {
        assert_eq!(cache_ttl(100, 300), MIN_CACHE_TTL_SECONDS);
        assert_eq!(cache_ttl(0, 0), MIN_CACHE_TTL_SECONDS);
        assert_eq!(cache_ttl(90, 30), MIN_CACHE_TTL_SECONDS);
        for remote in [0u64, 1, 59, 60, 61, 330, 7200, u64::MAX] {
            assert!(cache_ttl(remote, 300) >= MIN_CACHE_TTL_SECONDS);
        }
    }

    #[test]
    fn test_credential_expiry() {
        let cred = Credential::new(CredentialKind::ComponentToken, "wx1", "tok", 6900);
        assert_eq!(cred.expires_at() - cred.issued_at, Duration::seconds(6900));
    }

    #[test]
    fn test_credential_expiry_saturates() {
        let cred = Credential::new(CredentialKind::ComponentToken, "wx1", "tok", u64::MAX);
        assert_eq!(cred.expires_at(), DateTime::<Utc>::MAX_UTC);

        let cred = Credential::new(CredentialKind::ComponentToken, "wx1", "tok", i64::MAX as u64);
        assert_eq!(cred.expires_at(), DateTime::<Utc>::MAX_UTC);
    }
}
