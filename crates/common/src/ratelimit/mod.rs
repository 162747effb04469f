//! Per-API-key rate limiting
//!
//! Fixed one-minute windows keyed by API key id. A key's counter resets when
//! a request arrives in a later window; there is no sliding behavior, so a
//! burst at a window boundary can briefly see up to twice the per-minute
//! limit. Revoked and expired keys are rejected before any counting
//! (fail-closed).
//!
//! State is process-local. Each gateway instance enforces the limit over the
//! traffic it sees.

use crate::db::models::ApiKey;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Fixed-window limiter over per-key minute quotas
#[derive(Default)]
pub struct KeyRateLimiter {
    windows: Mutex<HashMap<Uuid, Window>>,
}

impl KeyRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject one request for `key` at instant `now`.
    ///
    /// Returns `ExpiredApiKey`/`InvalidApiKey` for unusable keys and
    /// `RateLimited` once the window quota is spent.
    pub fn admit(&self, key: &ApiKey, now: DateTime<Utc>) -> Result<()> {
        if !key.is_usable_at(now) {
            // Distinguish expiry from revocation for the caller's logs
            return match key.expires_at {
                Some(expiry) if now >= expiry => Err(AppError::ExpiredApiKey),
                _ => Err(AppError::InvalidApiKey),
            };
        }

        let limit = key.rate_limit_per_minute.max(0) as u32;

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(key.id).or_insert(Window {
            started_at: now,
            count: 0,
        });

        // Lazy reset: stale windows roll over on the next request
        if now - window.started_at >= Duration::minutes(1) {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= limit {
            return Err(AppError::RateLimited { limit });
        }

        window.count += 1;
        Ok(())
    }

    /// Drop state for keys that have been idle past `max_idle`, so revoked
    /// keys do not pin memory forever
    pub fn evict_idle(&self, now: DateTime<Utc>, max_idle: Duration) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.retain(|_, w| now - w.started_at < max_idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(limit: i32) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            key_hash: "hash".to_string(),
            label: "test".to_string(),
            rate_limit_per_minute: limit,
            is_active: true,
            expires_at: None,
            created_at: Utc::now().into(),
        }
    }

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let limiter = KeyRateLimiter::new();
        let key = key(5);
        let now = Utc::now();

        for _ in 0..5 {
            assert!(limiter.admit(&key, now).is_ok());
        }

        let err = limiter.admit(&key, now).unwrap_err();
        assert!(matches!(err, AppError::RateLimited { limit: 5 }));
    }

    #[test]
    fn test_window_resets_after_a_minute() {
        let limiter = KeyRateLimiter::new();
        let key = key(2);
        let now = Utc::now();

        assert!(limiter.admit(&key, now).is_ok());
        assert!(limiter.admit(&key, now).is_ok());
        assert!(limiter.admit(&key, now).is_err());

        // 59s in, still the same window
        let late = now + Duration::seconds(59);
        assert!(limiter.admit(&key, late).is_err());

        let next = now + Duration::seconds(60);
        assert!(limiter.admit(&key, next).is_ok());
    }

    #[test]
    fn test_keys_do_not_share_windows() {
        let limiter = KeyRateLimiter::new();
        let a = key(1);
        let b = key(1);
        let now = Utc::now();

        assert!(limiter.admit(&a, now).is_ok());
        assert!(limiter.admit(&a, now).is_err());
        assert!(limiter.admit(&b, now).is_ok());
    }

    #[test]
    fn test_inactive_key_fails_closed() {
        let limiter = KeyRateLimiter::new();
        let mut revoked = key(10);
        revoked.is_active = false;
        let now = Utc::now();

        assert!(matches!(
            limiter.admit(&revoked, now).unwrap_err(),
            AppError::InvalidApiKey
        ));
    }

    #[test]
    fn test_expired_key_fails_closed() {
        let limiter = KeyRateLimiter::new();
        let mut expired = key(10);
        let now = Utc::now();
        expired.expires_at = Some((now - Duration::seconds(1)).into());

        assert!(matches!(
            limiter.admit(&expired, now).unwrap_err(),
            AppError::ExpiredApiKey
        ));
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let limiter = KeyRateLimiter::new();
        let key = key(0);
        assert!(limiter.admit(&key, Utc::now()).is_err());
    }

    #[test]
    fn test_evict_idle() {
        let limiter = KeyRateLimiter::new();
        let key = key(5);
        let now = Utc::now();

        limiter.admit(&key, now).unwrap();
        limiter.evict_idle(now + Duration::hours(2), Duration::hours(1));

        // Fresh window after eviction
        for _ in 0..5 {
            assert!(limiter.admit(&key, now + Duration::hours(2)).is_ok());
        }
    }
}
