//! TTL derivation and touch policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TTL used when neither the store nor the cookie provides one.
pub const ONE_DAY_SECS: u64 = 86_400;

/// Resolve the expiry in seconds for a write.
///
/// Precedence: the store-wide override, then the cookie's `maxAge`
/// (milliseconds, floored to whole seconds), then one day. A negative
/// `maxAge` resolves to `0`.
pub fn resolve_ttl(store_ttl: Option<u64>, max_age_ms: Option<i64>) -> u64 {
    if let Some(ttl) = store_ttl.filter(|&t| t > 0) {
        return ttl;
    }
    match max_age_ms {
        Some(ms) => (ms / 1000).max(0) as u64,
        None => ONE_DAY_SECS,
    }
}

/// How `touch` treats a session that is still fresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TouchPolicy {
    /// Rewrite the record only when `lastModified` is missing or older than
    /// the TTL; otherwise just refresh the expiry.
    #[default]
    AntiThrash,
    /// Rewrite the record with a fresh `lastModified` on every touch.
    Always,
}

/// What a touch should do to the stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    /// Re-encode the record with `lastModified = now` and upsert it.
    Rewrite,
    /// Keep the stored document and only reset its expiry.
    RefreshExpiry,
}

impl TouchPolicy {
    /// Decide the touch action for a record last modified at `last_modified`.
    pub fn decide(
        self,
        last_modified: Option<DateTime<Utc>>,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> TouchAction {
        match self {
            TouchPolicy::Always => TouchAction::Rewrite,
            TouchPolicy::AntiThrash => match last_modified {
                None => TouchAction::Rewrite,
                Some(ts) => {
                    let elapsed_ms = (now - ts).num_milliseconds();
                    let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
                    if ttl_secs > 0 && elapsed_ms > ttl_ms {
                        TouchAction::Rewrite
                    } else {
                        TouchAction::RefreshExpiry
                    }
                }
            },
        }
    }
}
