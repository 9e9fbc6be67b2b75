//! Per-PVC scaling policy, layered from hard-coded defaults, global
//! configuration, and `volume.autoscaler.kubernetes.io/*` annotations.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::cluster::PvcSnapshot;
use crate::config::Config;

pub const ANNOTATION_PREFIX: &str = "volume.autoscaler.kubernetes.io/";

pub const SCALE_ABOVE_PERCENT: &str = "volume.autoscaler.kubernetes.io/scale-above-percent";
pub const SCALE_AFTER_INTERVALS: &str = "volume.autoscaler.kubernetes.io/scale-after-intervals";
pub const SCALE_UP_PERCENT: &str = "volume.autoscaler.kubernetes.io/scale-up-percent";
pub const SCALE_UP_MIN_INCREMENT: &str = "volume.autoscaler.kubernetes.io/scale-up-min-increment";
pub const SCALE_UP_MAX_INCREMENT: &str = "volume.autoscaler.kubernetes.io/scale-up-max-increment";
pub const SCALE_UP_MAX_SIZE: &str = "volume.autoscaler.kubernetes.io/scale-up-max-size";
pub const SCALE_COOLDOWN_TIME: &str = "volume.autoscaler.kubernetes.io/scale-cooldown-time";
pub const IGNORE: &str = "volume.autoscaler.kubernetes.io/ignore";

/// The effective scaling knobs for one PVC during one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub scale_above_percent: u32,
    pub scale_after_intervals: u32,
    pub scale_up_percent: u32,
    pub scale_up_min_increment: u64,
    pub scale_up_max_increment: u64,
    pub scale_up_max_size: u64,
    pub scale_cooldown: Duration,
    pub ignore: bool,
}

impl ScalingPolicy {
    fn from_config(config: &Config) -> Self {
        ScalingPolicy {
            scale_above_percent: config.scale_above_percent,
            scale_after_intervals: config.scale_after_intervals,
            scale_up_percent: config.scale_up_percent,
            scale_up_min_increment: config.scale_up_min_increment,
            scale_up_max_increment: config.scale_up_max_increment,
            scale_up_max_size: config.scale_up_max_size,
            scale_cooldown: config.scale_cooldown_time,
            ignore: false,
        }
    }
}

/// Overwrite `slot` with the annotation value when present and parseable.
/// A typo on a single PVC keeps the lower layer instead of breaking the loop.
fn override_from<T>(
    annotations: &BTreeMap<String, String>,
    key: &str,
    pvc: &impl Display,
    slot: &mut T,
) where
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = annotations.get(key) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(e) => warn!(
                pvc = %pvc,
                annotation = key,
                value = %raw,
                "could not parse annotation, keeping configured value: {e}"
            ),
        }
    }
}

/// Resolve the effective policy for one PVC. Deterministic: the same config
/// and snapshot always produce the same policy.
pub fn resolve(config: &Config, snapshot: &PvcSnapshot) -> ScalingPolicy {
    let mut policy = ScalingPolicy::from_config(config);
    let annotations = &snapshot.annotations;
    let id = &snapshot.id;

    override_from(annotations, SCALE_ABOVE_PERCENT, id, &mut policy.scale_above_percent);
    override_from(annotations, SCALE_AFTER_INTERVALS, id, &mut policy.scale_after_intervals);
    override_from(annotations, SCALE_UP_PERCENT, id, &mut policy.scale_up_percent);
    override_from(annotations, SCALE_UP_MIN_INCREMENT, id, &mut policy.scale_up_min_increment);
    override_from(annotations, SCALE_UP_MAX_INCREMENT, id, &mut policy.scale_up_max_increment);
    override_from(annotations, SCALE_UP_MAX_SIZE, id, &mut policy.scale_up_max_size);
    let mut cooldown_secs = policy.scale_cooldown.as_secs();
    override_from(annotations, SCALE_COOLDOWN_TIME, id, &mut cooldown_secs);
    policy.scale_cooldown = Duration::from_secs(cooldown_secs);
    if let Some(raw) = annotations.get(IGNORE) {
        policy.ignore = raw.eq_ignore_ascii_case("true");
    }

    sanitize(config, snapshot, &mut policy);
    policy
}

/// Revert out-of-range override values to the global layer. Runs after
/// annotation layering so one bad override cannot smuggle in an invalid
/// combination.
fn sanitize(config: &Config, snapshot: &PvcSnapshot, policy: &mut ScalingPolicy) {
    let id = &snapshot.id;
    if !(1..=99).contains(&policy.scale_above_percent) {
        warn!(
            pvc = %id,
            value = policy.scale_above_percent,
            "scale-above-percent outside [1, 99], reverting to {}",
            config.scale_above_percent
        );
        policy.scale_above_percent = config.scale_above_percent;
    }
    if policy.scale_after_intervals < 1 {
        warn!(pvc = %id, "scale-after-intervals below 1, reverting to {}", config.scale_after_intervals);
        policy.scale_after_intervals = config.scale_after_intervals;
    }
    if policy.scale_up_max_increment < policy.scale_up_min_increment {
        warn!(
            pvc = %id,
            min = policy.scale_up_min_increment,
            max = policy.scale_up_max_increment,
            "scale-up-max-increment below scale-up-min-increment, reverting both to configured values"
        );
        policy.scale_up_min_increment = config.scale_up_min_increment;
        policy.scale_up_max_increment = config.scale_up_max_increment;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PvcId;

    fn snapshot(annotations: &[(&str, &str)]) -> PvcSnapshot {
        PvcSnapshot {
            id: PvcId::new("default", "data-claim"),
            storage_class: Some("standard".to_string()),
            requested_bytes: 10_000_000_000,
            phase: Some("Bound".to_string()),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            expandable: true,
            uid: None,
            resource_version: None,
        }
    }

    #[test]
    fn defaults_flow_from_config() {
        let config = Config::default();
        let policy = resolve(&config, &snapshot(&[]));
        assert_eq!(policy.scale_above_percent, 80);
        assert_eq!(policy.scale_after_intervals, 5);
        assert_eq!(policy.scale_up_percent, 20);
        assert!(!policy.ignore);
    }

    #[test]
    fn annotations_override_config() {
        let config = Config::default();
        let policy = resolve(
            &config,
            &snapshot(&[
                (SCALE_ABOVE_PERCENT, "90"),
                (SCALE_AFTER_INTERVALS, "2"),
                (SCALE_UP_MAX_SIZE, "20000000000"),
                (SCALE_COOLDOWN_TIME, "60"),
                (IGNORE, "TRUE"),
            ]),
        );
        assert_eq!(policy.scale_above_percent, 90);
        assert_eq!(policy.scale_after_intervals, 2);
        assert_eq!(policy.scale_up_max_size, 20_000_000_000);
        assert_eq!(policy.scale_cooldown, Duration::from_secs(60));
        assert!(policy.ignore);
    }

    #[test]
    fn unparseable_annotation_keeps_lower_layer() {
        let config = Config::default();
        let policy = resolve(&config, &snapshot(&[(SCALE_ABOVE_PERCENT, "ninety")]));
        assert_eq!(policy.scale_above_percent, config.scale_above_percent);
    }

    #[test]
    fn out_of_range_threshold_reverts() {
        let config = Config::default();
        let policy = resolve(&config, &snapshot(&[(SCALE_ABOVE_PERCENT, "120")]));
        assert_eq!(policy.scale_above_percent, config.scale_above_percent);
    }

    #[test]
    fn inverted_increments_revert_together() {
        let config = Config::default();
        let policy = resolve(
            &config,
            &snapshot(&[
                (SCALE_UP_MIN_INCREMENT, "5000000000"),
                (SCALE_UP_MAX_INCREMENT, "1000000000"),
            ]),
        );
        assert_eq!(policy.scale_up_min_increment, config.scale_up_min_increment);
        assert_eq!(policy.scale_up_max_increment, config.scale_up_max_increment);
    }

    #[test]
    fn resolution_is_deterministic() {
        let config = Config::default();
        let snap = snapshot(&[(SCALE_UP_PERCENT, "50")]);
        assert_eq!(resolve(&config, &snap), resolve(&config, &snap));
    }
}
