//! Tenant quota gate
//!
//! Pure admit/deny decisions over a usage count and a configured limit. The
//! counting itself happens inside store transactions so that the check and
//! the insert cannot be split by a concurrent writer; this module only owns
//! the decision rule and the calendar-month boundary.

use crate::errors::AppError;
use chrono::{DateTime, Datelike, TimeZone, Utc};

/// Outcome of comparing current usage against a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny,
}

impl QuotaDecision {
    /// Map a denial to the given error
    pub fn allow_or(self, err: AppError) -> Result<(), AppError> {
        match self {
            QuotaDecision::Allow => Ok(()),
            QuotaDecision::Deny => Err(err),
        }
    }
}

/// Decide whether one more unit of usage fits under `limit`.
///
/// The boundary is inclusive of the limit itself: usage at the limit denies
/// the next request. A zero limit denies everything.
pub fn decide(used: u64, limit: i32) -> QuotaDecision {
    if limit <= 0 {
        return QuotaDecision::Deny;
    }
    if used >= limit as u64 {
        QuotaDecision::Deny
    } else {
        QuotaDecision::Allow
    }
}

/// First instant of the UTC calendar month containing `now`.
///
/// Monthly evaluation quotas reset at this boundary; nothing is prorated.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .expect("first of month is always a valid UTC timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_boundaries() {
        assert_eq!(decide(0, 10), QuotaDecision::Allow);
        assert_eq!(decide(9, 10), QuotaDecision::Allow);
        assert_eq!(decide(10, 10), QuotaDecision::Deny);
        assert_eq!(decide(11, 10), QuotaDecision::Deny);
    }

    #[test]
    fn test_zero_limit_denies() {
        assert_eq!(decide(0, 0), QuotaDecision::Deny);
        assert_eq!(decide(0, -1), QuotaDecision::Deny);
    }

    #[test]
    fn test_month_start() {
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 14, 30, 5).unwrap();
        let start = month_start(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());

        // January stays in January
        let jan = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(month_start(jan), jan);
    }

    #[test]
    fn test_allow_or() {
        assert!(decide(0, 5)
            .allow_or(AppError::QuotaExceeded {
                scope: "evaluation".to_string(),
                limit: 5,
            })
            .is_ok());

        let err = decide(5, 5)
            .allow_or(AppError::QuotaExceeded {
                scope: "evaluation".to_string(),
                limit: 5,
            })
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded { limit: 5, .. }));
    }
}
