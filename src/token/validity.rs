//! Token validity calculator.
//!
//! Pure functions over a token's validity interval. Clients must stop
//! relying on a token appreciably before its hard expiry (clock skew,
//! in-flight latency), and the caching cap bounds how long a server could
//! otherwise force a client to keep reusing one token.

use chrono::{DateTime, Duration, TimeZone, Utc};

use super::SecurityToken;

/// Sentinel for tokens that never expire.
///
/// A token whose `valid_to` is at or after this instant keeps its own
/// expiration; no threshold or cap is applied.
pub fn infinite_expiration() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
}

/// Compute the instant after which a cached token must no longer be used.
///
/// For a finite-validity token this is the smaller of:
/// - `valid_from + (valid_to - valid_from) * threshold_percent / 100`
/// - `valid_from + max_caching`
pub fn effective_expiration(
    token: &SecurityToken,
    threshold_percent: u8,
    max_caching: Duration,
) -> DateTime<Utc> {
    let valid_to = token.valid_to();
    if valid_to >= infinite_expiration() {
        return valid_to;
    }

    let valid_from = token.valid_from();
    let interval = valid_to - valid_from;
    let candidate = valid_from + interval * i32::from(threshold_percent) / 100;
    let cap = valid_from + max_caching;

    candidate.min(cap)
}

/// Whether a token is still usable at `now` under the given policy.
pub fn is_currently_valid(
    now: DateTime<Utc>,
    token: &SecurityToken,
    threshold_percent: u8,
    max_caching: Duration,
) -> bool {
    now <= effective_expiration(token, threshold_percent, max_caching)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenId;
    use proptest::prelude::*;

    fn token(from: DateTime<Utc>, to: DateTime<Utc>) -> SecurityToken {
        SecurityToken::new(TokenId::new("tok"), from, to, vec![])
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_threshold_worked_example() {
        // Valid 00:00-00:10, threshold 60%, cap 1h => expires effectively at 00:06
        let tok = token(at(0, 0), at(0, 10));
        let effective = effective_expiration(&tok, 60, Duration::hours(1));
        assert_eq!(effective, at(0, 6));

        assert!(is_currently_valid(at(0, 5), &tok, 60, Duration::hours(1)));
        assert!(!is_currently_valid(at(0, 7), &tok, 60, Duration::hours(1)));
    }

    #[test]
    fn test_caching_cap_wins_over_threshold() {
        // 10h validity at 90% would be 9h; a 1h cap comes first
        let tok = token(at(0, 0), at(10, 0));
        let effective = effective_expiration(&tok, 90, Duration::hours(1));
        assert_eq!(effective, at(1, 0));
    }

    #[test]
    fn test_infinite_sentinel_passthrough() {
        let tok = token(at(0, 0), infinite_expiration());
        let effective = effective_expiration(&tok, 1, Duration::seconds(1));
        assert_eq!(effective, infinite_expiration());
    }

    #[test]
    fn test_beyond_sentinel_passthrough() {
        let beyond = infinite_expiration() + Duration::days(1);
        let tok = token(at(0, 0), beyond);
        assert_eq!(effective_expiration(&tok, 50, Duration::hours(1)), beyond);
    }

    proptest! {
        /// For all finite tokens and thresholds in (0,100], the effective
        /// expiration never exceeds the hard expiry or the caching cap.
        #[test]
        fn prop_effective_expiration_capped(
            start_offset_secs in 0i64..1_000_000,
            interval_secs in 1i64..10_000_000,
            threshold in 1u8..=100,
            cap_secs in 1i64..10_000_000,
        ) {
            let from = at(0, 0) + Duration::seconds(start_offset_secs);
            let to = from + Duration::seconds(interval_secs);
            let tok = token(from, to);
            let cap = Duration::seconds(cap_secs);

            let effective = effective_expiration(&tok, threshold, cap);
            prop_assert!(effective <= to);
            prop_assert!(effective <= from + cap);
        }

        /// Full threshold with a generous cap yields the hard expiry itself.
        #[test]
        fn prop_full_threshold_reaches_valid_to(
            interval_secs in 1i64..10_000_000,
        ) {
            let from = at(0, 0);
            let to = from + Duration::seconds(interval_secs);
            let tok = token(from, to);

            let effective = effective_expiration(&tok, 100, Duration::seconds(interval_secs + 1));
            prop_assert_eq!(effective, to);
        }
    }
}
