//! Wire timestamps.

use chrono::Utc;

/// Current time as milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Stamp a write so that per-user timestamps never go backwards, even if the
/// wall clock does.
pub fn stamp_after(previous: Option<i64>) -> i64 {
    let now = now_millis();
    previous.map_or(now, |prev| now.max(prev))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2024() {
        assert!(now_millis() > 1_704_067_200_000);
    }

    #[test]
    fn stamp_never_goes_backwards() {
        let future = now_millis() + 60_000;
        assert_eq!(stamp_after(Some(future)), future);
    }

    #[test]
    fn stamp_without_previous_is_now() {
        let before = now_millis();
        let stamped = stamp_after(None);
        assert!(stamped >= before);
    }
}
