//! Durable per-PVC state. The only storage substrate is the PVC itself: a
//! resize timestamp and a hysteresis counter ride along as annotations, so
//! cooldown enforcement survives controller restarts. Values are re-read from
//! the live object every iteration and never cached in-process.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

pub const LAST_RESIZED_AT: &str = "volume.autoscaler.kubernetes.io/last-resized-at";
pub const SCALE_ABOVE_COUNTER: &str = "volume.autoscaler.kubernetes.io/scale-above-counter";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PvcState {
    /// When the last successful resize happened. `None` means never resized.
    pub last_resized_at: Option<DateTime<Utc>>,
    /// Consecutive iterations the volume was observed above its threshold.
    pub intervals_above_threshold: u32,
}

impl PvcState {
    pub fn from_annotations(pvc: &impl Display, annotations: &BTreeMap<String, String>) -> Self {
        let last_resized_at = annotations.get(LAST_RESIZED_AT).and_then(|raw| {
            match DateTime::parse_from_rfc3339(raw) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(e) => {
                    warn!(pvc = %pvc, value = %raw, "unreadable last-resized-at annotation, treating as never resized: {e}");
                    None
                }
            }
        });
        let intervals_above_threshold = annotations
            .get(SCALE_ABOVE_COUNTER)
            .and_then(|raw| match raw.parse::<u32>() {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(pvc = %pvc, value = %raw, "unreadable scale-above-counter annotation, treating as zero: {e}");
                    None
                }
            })
            .unwrap_or(0);
        PvcState {
            last_resized_at,
            intervals_above_threshold,
        }
    }

    /// Time left before another resize is allowed, `None` once the cooldown
    /// has fully elapsed (or the volume was never resized).
    pub fn cooldown_remaining(&self, cooldown: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_resized_at?;
        let elapsed = now.signed_duration_since(last).to_std().unwrap_or(Duration::ZERO);
        if elapsed < cooldown {
            Some(cooldown - elapsed)
        } else {
            None
        }
    }
}

pub fn counter_annotation(value: u32) -> (String, String) {
    (SCALE_ABOVE_COUNTER.to_string(), value.to_string())
}

pub fn timestamp_annotation(at: DateTime<Utc>) -> (String, String) {
    (
        LAST_RESIZED_AT.to_string(),
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn annotations(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn absent_annotations_mean_fresh_state() {
        let state = PvcState::from_annotations(&"default.data", &BTreeMap::new());
        assert_eq!(state, PvcState::default());
        assert_eq!(state.intervals_above_threshold, 0);
        assert!(state.last_resized_at.is_none());
    }

    #[test]
    fn annotations_round_trip() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let (ts_key, ts_value) = timestamp_annotation(at);
        let (counter_key, counter_value) = counter_annotation(4);
        let state = PvcState::from_annotations(
            &"default.data",
            &annotations(&[(&ts_key, &ts_value), (&counter_key, &counter_value)]),
        );
        assert_eq!(state.last_resized_at, Some(at));
        assert_eq!(state.intervals_above_threshold, 4);
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let state = PvcState::from_annotations(
            &"default.data",
            &annotations(&[
                (LAST_RESIZED_AT, "yesterday-ish"),
                (SCALE_ABOVE_COUNTER, "-3"),
            ]),
        );
        assert_eq!(state, PvcState::default());
    }

    #[test]
    fn cooldown_still_active() {
        let now = Utc::now();
        let state = PvcState {
            last_resized_at: Some(now - chrono::Duration::seconds(3600)),
            intervals_above_threshold: 0,
        };
        let remaining = state
            .cooldown_remaining(Duration::from_secs(22_200), now)
            .expect("cooldown should still be in effect");
        assert_eq!(remaining, Duration::from_secs(22_200 - 3600));
    }

    #[test]
    fn cooldown_elapsed() {
        let now = Utc::now();
        let state = PvcState {
            last_resized_at: Some(now - chrono::Duration::seconds(30_000)),
            intervals_above_threshold: 0,
        };
        assert!(state.cooldown_remaining(Duration::from_secs(22_200), now).is_none());
    }

    #[test]
    fn never_resized_has_no_cooldown() {
        let state = PvcState::default();
        assert!(state
            .cooldown_remaining(Duration::from_secs(22_200), Utc::now())
            .is_none());
    }
}
