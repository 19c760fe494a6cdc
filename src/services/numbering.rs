//! Human-readable document numbers: `{PREFIX}-YYYYMMDD-NNNNN`.
//!
//! The unique column is the real guarantee. Generation only tries to avoid
//! hitting it: a few random candidates are checked inside the caller's
//! transaction, then a sub-second suffix is used.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use tracing::warn;

use crate::errors::ServiceResult;

pub const ORDER_PREFIX: &str = "ORD";
pub const REMITTANCE_PREFIX: &str = "REM";

pub fn random_number(prefix: &str, at: DateTime<Utc>) -> String {
    let n: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("{}-{}-{:05}", prefix, at.format("%Y%m%d"), n)
}

/// Suffix from the sub-second part of `at`, in 10µs steps.
pub fn fallback_number(prefix: &str, at: DateTime<Utc>) -> String {
    let n = (at.timestamp_subsec_nanos() / 10_000) % 100_000;
    format!("{}-{}-{:05}", prefix, at.format("%Y%m%d"), n)
}

/// Picks a number that `exists` reports as free, falling back after `attempts` tries.
pub async fn unique_number<F, Fut>(prefix: &str, attempts: u32, mut exists: F) -> ServiceResult<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ServiceResult<bool>>,
{
    for _ in 0..attempts.max(1) {
        let candidate = random_number(prefix, Utc::now());
        if !exists(candidate.clone()).await? {
            return Ok(candidate);
        }
    }
    let fallback = fallback_number(prefix, Utc::now());
    warn!(prefix, attempts, number = %fallback, "number collisions; using sub-second fallback");
    Ok(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{is_valid_order_number, is_valid_remittance_number};
    use chrono::TimeZone;

    #[test]
    fn formats() {
        let at = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        let n = random_number(ORDER_PREFIX, at);
        assert!(n.starts_with("ORD-20240315-"));
        assert!(is_valid_order_number(&n));
        assert!(is_valid_remittance_number(&fallback_number(REMITTANCE_PREFIX, at)));
    }

    #[test]
    fn fallback_uses_sub_second_precision() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(fallback_number(ORDER_PREFIX, at), "ORD-20231114-12345");
    }

    #[tokio::test]
    async fn falls_back_when_every_candidate_is_taken() {
        let mut calls = 0;
        let n = unique_number(ORDER_PREFIX, 3, |_| {
            calls += 1;
            async { Ok(true) }
        })
        .await
        .unwrap();
        assert_eq!(calls, 3);
        assert!(is_valid_order_number(&n));
    }
}
