//! The reconciliation engine: joins utilization observations with live PVCs,
//! advances per-PVC hysteresis counters, and orchestrates expansions under
//! cooldown, capability and policy bounds.
//!
//! The decision logic is a pure function over one PVC's snapshot, policy,
//! durable state and observation; the surrounding struct wires decisions to
//! the cluster, the notifier and the controller metrics.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterAdapter, PvcId, PvcSnapshot};
use crate::config::Config;
use crate::error::Error;
use crate::gmp::{GmpClient, Observation};
use crate::observability::ControllerMetrics;
use crate::policy::{self, ScalingPolicy};
use crate::sizing::{self, format_bytes};
use crate::slack::{Severity, SlackNotifier};
use crate::state::{self, PvcState};

pub const REASON_TRIGGERED: &str = "VolumeResizeTriggered";
pub const REASON_SUCCEEDED: &str = "VolumeResizeSucceeded";
pub const REASON_FAILED: &str = "VolumeResizeFailed";
pub const REASON_AT_MAX: &str = "VolumeAtMaxSize";
pub const REASON_NOT_EXPANDABLE: &str = "StorageClassNotExpandable";

/// Rate-limiter key for cooldown-deferred trigger events, distinct from the
/// immediate trigger notification.
const DEFERRED_WARNING: &str = "VolumeResizeDeferred";

/// Why a PVC can never be resized, no matter what its metrics say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateFreeReason {
    /// The ignore annotation is set.
    Ignored,
    /// The storage class has `allowVolumeExpansion: false` (or is unknown).
    ClassNotExpandable,
    /// The effective max size is below what the claim already requests.
    MaxSizeBelowRequested,
}

/// Outcome of evaluating one measured PVC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Utilization is under the threshold; reset the counter if it was armed.
    BelowThreshold { reset_counter: bool },
    /// Above threshold but the PVC can never be resized. A stale counter is
    /// cleared so it does not fire spuriously if the condition lifts.
    CandidateFree {
        reason: CandidateFreeReason,
        reset_counter: bool,
    },
    /// Above threshold, still accumulating consecutive observations.
    CountUp { counter: u32 },
    /// The counter reached the threshold but the cooldown since the last
    /// resize is still running. The counter is clamped one below the trigger
    /// point so a single post-cooldown observation fires the resize.
    Deferred { counter: u32, remaining: Duration },
    /// Growing is pointless: the computed target does not exceed the current
    /// request.
    AtMaxSize,
    /// All gates passed; grow to `target_bytes`.
    Resize { target_bytes: u64 },
}

/// The per-PVC decision machine. Pure: all inputs are explicit, including the
/// clock, so every path is testable without a cluster.
pub fn evaluate(
    snapshot: &PvcSnapshot,
    policy: &ScalingPolicy,
    state: &PvcState,
    observation: &Observation,
    now: DateTime<Utc>,
) -> Decision {
    let triggered = observation
        .peak_used_pct()
        .is_some_and(|pct| pct >= policy.scale_above_percent as f64);
    if !triggered {
        return Decision::BelowThreshold {
            reset_counter: state.intervals_above_threshold > 0,
        };
    }

    let reset_counter = state.intervals_above_threshold > 0;
    if policy.ignore {
        return Decision::CandidateFree {
            reason: CandidateFreeReason::Ignored,
            reset_counter,
        };
    }
    if !snapshot.expandable {
        return Decision::CandidateFree {
            reason: CandidateFreeReason::ClassNotExpandable,
            reset_counter,
        };
    }
    if policy.scale_up_max_size < snapshot.requested_bytes {
        return Decision::CandidateFree {
            reason: CandidateFreeReason::MaxSizeBelowRequested,
            reset_counter,
        };
    }

    let counter = state.intervals_above_threshold.saturating_add(1);
    if counter < policy.scale_after_intervals {
        return Decision::CountUp { counter };
    }

    if let Some(remaining) = state.cooldown_remaining(policy.scale_cooldown, now) {
        return Decision::Deferred {
            counter: policy.scale_after_intervals - 1,
            remaining,
        };
    }

    let target_bytes = sizing::target_bytes(snapshot.requested_bytes, policy);
    if target_bytes <= snapshot.requested_bytes {
        return Decision::AtMaxSize;
    }
    Decision::Resize { target_bytes }
}

enum Disposition {
    Above,
    Below,
}

pub struct Reconciler {
    config: Config,
    gmp: GmpClient,
    cluster: ClusterAdapter,
    slack: Option<SlackNotifier>,
    metrics: ControllerMetrics,
    /// In-memory event rate limiting. Losing this on restart only means one
    /// extra warning event, never an extra resize.
    warned_at: HashMap<(PvcId, &'static str), DateTime<Utc>>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        gmp: GmpClient,
        cluster: ClusterAdapter,
        slack: Option<SlackNotifier>,
        metrics: ControllerMetrics,
    ) -> Self {
        Reconciler {
            config,
            gmp,
            cluster,
            slack,
            metrics,
            warned_at: HashMap::new(),
        }
    }

    /// One full pass: fetch, join, decide, act. Returns an error only when
    /// the iteration had to be abandoned wholesale (metrics or PVC list
    /// unavailable); per-PVC failures are contained inside.
    pub async fn run_iteration(&mut self) -> crate::Result<()> {
        self.metrics.inc_resize_evaluated();

        let observations = self.gmp.fetch_observations().await?;
        debug!(count = observations.len(), "fetched volume observations");

        let snapshots = self.cluster.list_pvcs().await?;
        let now = Utc::now();

        let mut above = 0usize;
        let mut below = 0usize;
        let mut unmeasured = 0usize;
        let mut orphaned = observations.len();

        for snapshot in &snapshots {
            let Some(observation) = observations.get(&snapshot.id) else {
                debug!(pvc = %snapshot.id, "no metrics for PVC this iteration, skipping");
                unmeasured += 1;
                continue;
            };
            orphaned -= 1;
            match self.process_pvc(snapshot, observation, now).await {
                Disposition::Above => above += 1,
                Disposition::Below => below += 1,
            }
        }
        if orphaned > 0 {
            // Metrics for claims Kubernetes no longer lists: deletions in
            // flight or kubelet label jitter.
            debug!(count = orphaned, "observations without a matching PVC");
        }

        self.metrics
            .set_pvc_counts(observations.len(), above, below, unmeasured);
        info!(
            valid = observations.len(),
            above, below, unmeasured, "iteration complete"
        );
        Ok(())
    }

    async fn process_pvc(
        &mut self,
        snapshot: &PvcSnapshot,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> Disposition {
        let id = &snapshot.id;
        let policy = policy::resolve(&self.config, snapshot);
        let state = PvcState::from_annotations(id, &snapshot.annotations);
        let used_pct = observation.peak_used_pct().unwrap_or_default();

        match evaluate(snapshot, &policy, &state, observation, now) {
            Decision::BelowThreshold { reset_counter } => {
                if reset_counter {
                    self.write_annotations(id, &[state::counter_annotation(0)]).await;
                }
                debug!(pvc = %id, used_pct, "below threshold");
                Disposition::Below
            }
            Decision::CandidateFree { reason, reset_counter } => {
                self.metrics.inc_candidate_free_skipped();
                if reset_counter {
                    self.write_annotations(id, &[state::counter_annotation(0)]).await;
                }
                match reason {
                    CandidateFreeReason::Ignored => {
                        debug!(pvc = %id, used_pct, "above threshold but ignore annotation is set");
                    }
                    CandidateFreeReason::ClassNotExpandable => {
                        warn!(
                            pvc = %id,
                            storage_class = snapshot.storage_class.as_deref().unwrap_or("<none>"),
                            "above threshold but storage class does not allow expansion"
                        );
                        if self.should_warn(id, REASON_NOT_EXPANDABLE, policy.scale_cooldown, now) {
                            let message = format!(
                                "Volume is {used_pct:.0}% full but storage class `{}` does not allow volume expansion",
                                snapshot.storage_class.as_deref().unwrap_or("<none>")
                            );
                            self.cluster
                                .emit_event(snapshot, REASON_NOT_EXPANDABLE, &message, true)
                                .await;
                        }
                    }
                    CandidateFreeReason::MaxSizeBelowRequested => {
                        warn!(
                            pvc = %id,
                            max_size = policy.scale_up_max_size,
                            requested = snapshot.requested_bytes,
                            "scale-up-max-size is below the current request, not scaling"
                        );
                    }
                }
                Disposition::Above
            }
            Decision::CountUp { counter } => {
                info!(
                    pvc = %id,
                    used_pct,
                    counter,
                    needed = policy.scale_after_intervals,
                    "volume above threshold, waiting for consecutive intervals"
                );
                self.write_annotations(id, &[state::counter_annotation(counter)]).await;
                Disposition::Above
            }
            Decision::Deferred { counter, remaining } => {
                info!(
                    pvc = %id,
                    cooldown_remaining_secs = remaining.as_secs(),
                    "resize trigger reached but volume is cooling down"
                );
                if state.intervals_above_threshold != counter {
                    self.write_annotations(id, &[state::counter_annotation(counter)]).await;
                }
                if self.should_warn(id, DEFERRED_WARNING, policy.scale_cooldown, now) {
                    let message = format!(
                        "Volume is {used_pct:.0}% full; resize deferred for another {} seconds of cooldown",
                        remaining.as_secs()
                    );
                    self.cluster
                        .emit_event(snapshot, REASON_TRIGGERED, &message, false)
                        .await;
                }
                Disposition::Above
            }
            Decision::AtMaxSize => {
                warn!(
                    pvc = %id,
                    max_size = %format_bytes(policy.scale_up_max_size),
                    "volume is at its maximum size and still above threshold"
                );
                let message = format!(
                    "Volume is {used_pct:.0}% full but already at its maximum size of {}",
                    format_bytes(policy.scale_up_max_size)
                );
                self.cluster
                    .emit_event(snapshot, REASON_AT_MAX, &message, true)
                    .await;
                // Stamping the resize time suppresses this warning for one
                // cooldown window.
                self.write_annotations(
                    id,
                    &[state::timestamp_annotation(now), state::counter_annotation(0)],
                )
                .await;
                Disposition::Above
            }
            Decision::Resize { target_bytes } => {
                self.resize(snapshot, &policy, target_bytes, now).await;
                Disposition::Above
            }
        }
    }

    async fn resize(
        &mut self,
        snapshot: &PvcSnapshot,
        policy: &ScalingPolicy,
        target_bytes: u64,
        now: DateTime<Utc>,
    ) {
        let id = &snapshot.id;
        if self.config.dry_run {
            info!(
                pvc = %id,
                from = %format_bytes(snapshot.requested_bytes),
                to = %format_bytes(target_bytes),
                dry_run = true,
                "would resize volume"
            );
            return;
        }
        let summary = format!(
            "to scale up `{}` by `{}%` from `{}` to `{}`, it was using more than `{}%` disk or inode space over the last `{} seconds`",
            id,
            policy.scale_up_percent,
            format_bytes(snapshot.requested_bytes),
            format_bytes(target_bytes),
            policy.scale_above_percent,
            policy.scale_after_intervals as u64 * self.config.interval_time.as_secs(),
        );

        self.metrics.inc_resize_attempted();
        self.cluster
            .emit_event(snapshot, REASON_TRIGGERED, &format!("Requesting {summary}"), false)
            .await;

        match self.cluster.patch_size(id, target_bytes, now).await {
            Ok(()) => {
                self.metrics.inc_resize_successful();
                info!(
                    pvc = %id,
                    from = snapshot.requested_bytes,
                    to = target_bytes,
                    "resize requested"
                );
                let message = format!("Successfully requested {summary}");
                self.cluster
                    .emit_event(snapshot, REASON_SUCCEEDED, &message, false)
                    .await;
                if let Some(slack) = &self.slack {
                    slack.send(&message, Severity::Info).await;
                }
            }
            Err(e @ (Error::PvcGone(_) | Error::Conflict(_))) => {
                // Deleted or concurrently written; drop it for this iteration
                // and let the next list sort it out.
                warn!(pvc = %id, "skipping resize: {e}");
            }
            Err(e) => {
                self.metrics.inc_resize_failure();
                error!(pvc = %id, "resize failed: {e}");
                let message = format!("FAILED requesting {summary}");
                self.cluster
                    .emit_event(snapshot, REASON_FAILED, &message, true)
                    .await;
                if let Some(slack) = &self.slack {
                    slack.send(&message, Severity::Error).await;
                }
                // The stored counter still sits one short of the trigger, so
                // the next triggering observation retries the resize.
            }
        }
    }

    /// Counter/timestamp writes outside of a resize. Per-PVC write failures
    /// never abort the iteration.
    async fn write_annotations(&self, id: &PvcId, entries: &[(String, String)]) {
        match self.cluster.patch_annotations(id, entries).await {
            Ok(()) => {}
            Err(e @ (Error::PvcGone(_) | Error::Conflict(_))) => {
                warn!(pvc = %id, "skipping state update: {e}");
            }
            Err(e) => {
                warn!(pvc = %id, "failed to update state annotations: {e}");
            }
        }
    }

    /// At most one warning per (PVC, reason) per cooldown window.
    fn should_warn(
        &mut self,
        id: &PvcId,
        reason: &'static str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(last) = self.warned_at.get(&(id.clone(), reason)) {
            let elapsed = now
                .signed_duration_since(*last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < window {
                return false;
            }
        }
        self.warned_at.insert((id.clone(), reason), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(requested_bytes: u64, expandable: bool) -> PvcSnapshot {
        PvcSnapshot {
            id: PvcId::new("default", "data-claim"),
            storage_class: Some("standard".to_string()),
            requested_bytes,
            phase: Some("Bound".to_string()),
            annotations: BTreeMap::new(),
            expandable,
            uid: None,
            resource_version: None,
        }
    }

    fn test_policy() -> ScalingPolicy {
        ScalingPolicy {
            scale_above_percent: 80,
            scale_after_intervals: 3,
            scale_up_percent: 20,
            scale_up_min_increment: 1_000_000_000,
            scale_up_max_increment: 100_000_000_000,
            scale_up_max_size: 10_000_000_000_000,
            scale_cooldown: Duration::ZERO,
            ignore: false,
        }
    }

    fn counted(n: u32) -> PvcState {
        PvcState {
            last_resized_at: None,
            intervals_above_threshold: n,
        }
    }

    fn bytes_pct(pct: f64) -> Observation {
        Observation {
            bytes_used_pct: Some(pct),
            inodes_used_pct: Some(1.0),
            capacity_bytes: Some(10_000_000_000),
        }
    }

    #[test]
    fn counts_up_then_resizes_then_resets() {
        let snap = snapshot(10_000_000_000, true);
        let policy = test_policy();
        let now = Utc::now();

        // Iterations 1-2: arming.
        assert_eq!(
            evaluate(&snap, &policy, &counted(0), &bytes_pct(85.0), now),
            Decision::CountUp { counter: 1 }
        );
        assert_eq!(
            evaluate(&snap, &policy, &counted(1), &bytes_pct(82.0), now),
            Decision::CountUp { counter: 2 }
        );

        // Iteration 3: counter reaches the trigger and the resize fires.
        assert_eq!(
            evaluate(&snap, &policy, &counted(2), &bytes_pct(90.0), now),
            Decision::Resize {
                target_bytes: 12_000_000_000
            }
        );

        // Iteration 4: usage dropped after the resize, counter resets.
        let after_resize = PvcState {
            last_resized_at: Some(now),
            intervals_above_threshold: 0,
        };
        assert_eq!(
            evaluate(&snap, &policy, &after_resize, &bytes_pct(70.0), now),
            Decision::BelowThreshold { reset_counter: false }
        );
    }

    #[test]
    fn below_threshold_resets_armed_counter() {
        let snap = snapshot(10_000_000_000, true);
        assert_eq!(
            evaluate(&snap, &test_policy(), &counted(2), &bytes_pct(50.0), Utc::now()),
            Decision::BelowThreshold { reset_counter: true }
        );
    }

    #[test]
    fn threshold_is_inclusive() {
        let snap = snapshot(10_000_000_000, true);
        assert_eq!(
            evaluate(&snap, &test_policy(), &counted(0), &bytes_pct(80.0), Utc::now()),
            Decision::CountUp { counter: 1 }
        );
    }

    #[test]
    fn inode_pressure_triggers_like_disk_pressure() {
        let snap = snapshot(10_000_000_000, true);
        let observation = Observation {
            bytes_used_pct: Some(10.0),
            inodes_used_pct: Some(95.0),
            capacity_bytes: Some(10_000_000_000),
        };
        assert_eq!(
            evaluate(&snap, &test_policy(), &counted(2), &observation, Utc::now()),
            Decision::Resize {
                target_bytes: 12_000_000_000
            }
        );
    }

    #[test]
    fn unmeasured_axes_do_not_trigger() {
        let snap = snapshot(10_000_000_000, true);
        assert_eq!(
            evaluate(
                &snap,
                &test_policy(),
                &counted(0),
                &Observation::default(),
                Utc::now()
            ),
            Decision::BelowThreshold { reset_counter: false }
        );
    }

    #[test]
    fn cooldown_defers_and_clamps_counter() {
        let snap = snapshot(10_000_000_000, true);
        let policy = ScalingPolicy {
            scale_cooldown: Duration::from_secs(22_200),
            ..test_policy()
        };
        let now = Utc::now();
        let state = PvcState {
            last_resized_at: Some(now - chrono::Duration::seconds(3600)),
            intervals_above_threshold: 2,
        };

        match evaluate(&snap, &policy, &state, &bytes_pct(90.0), now) {
            Decision::Deferred { counter, remaining } => {
                assert_eq!(counter, policy.scale_after_intervals - 1);
                assert_eq!(remaining, Duration::from_secs(22_200 - 3600));
            }
            other => panic!("expected deferral, got {other:?}"),
        }

        // One triggering observation after the cooldown fires the resize.
        let after_cooldown = now + chrono::Duration::seconds(22_200);
        assert!(matches!(
            evaluate(&snap, &policy, &counted(2), &bytes_pct(90.0), after_cooldown),
            Decision::Resize { .. }
        ));
    }

    #[test]
    fn at_max_size_is_a_warning_not_a_resize() {
        let snap = snapshot(16_000_000_000_000, true);
        let policy = ScalingPolicy {
            scale_up_max_size: 16_000_000_000_000,
            ..test_policy()
        };
        assert_eq!(
            evaluate(&snap, &policy, &counted(2), &bytes_pct(95.0), Utc::now()),
            Decision::AtMaxSize
        );
    }

    #[test]
    fn ignored_pvc_is_candidate_free_and_keeps_counter_at_zero() {
        let snap = snapshot(10_000_000_000, true);
        let policy = ScalingPolicy {
            ignore: true,
            ..test_policy()
        };
        assert_eq!(
            evaluate(&snap, &policy, &counted(0), &bytes_pct(99.0), Utc::now()),
            Decision::CandidateFree {
                reason: CandidateFreeReason::Ignored,
                reset_counter: false,
            }
        );
    }

    #[test]
    fn non_expandable_class_resets_stale_counter() {
        let snap = snapshot(10_000_000_000, false);
        assert_eq!(
            evaluate(&snap, &test_policy(), &counted(4), &bytes_pct(99.0), Utc::now()),
            Decision::CandidateFree {
                reason: CandidateFreeReason::ClassNotExpandable,
                reset_counter: true,
            }
        );
    }

    #[test]
    fn max_size_below_request_is_candidate_free() {
        let snap = snapshot(10_000_000_000, true);
        let policy = ScalingPolicy {
            scale_up_max_size: 5_000_000_000,
            ..test_policy()
        };
        assert_eq!(
            evaluate(&snap, &policy, &counted(0), &bytes_pct(95.0), Utc::now()),
            Decision::CandidateFree {
                reason: CandidateFreeReason::MaxSizeBelowRequested,
                reset_counter: false,
            }
        );
    }

    #[test]
    fn min_increment_floors_the_resize() {
        let snap = snapshot(1_000_000_000, true);
        let policy = ScalingPolicy {
            scale_up_percent: 5,
            ..test_policy()
        };
        assert_eq!(
            evaluate(&snap, &policy, &counted(2), &bytes_pct(90.0), Utc::now()),
            Decision::Resize {
                target_bytes: 2_000_000_000
            }
        );
    }

    #[test]
    fn failed_patch_leaves_counter_armed_for_retry() {
        // After a failed resize the durable counter still reads after-1, so
        // the very next triggering observation reaches the trigger again.
        let snap = snapshot(10_000_000_000, true);
        let policy = test_policy();
        let state = counted(policy.scale_after_intervals - 1);
        assert!(matches!(
            evaluate(&snap, &policy, &state, &bytes_pct(90.0), Utc::now()),
            Decision::Resize { .. }
        ));
    }

    #[test]
    fn resizes_respect_all_bounds() {
        // Property sweep: any resize decision satisfies the min/max bounds.
        let policy = test_policy();
        for requested in [1_000_000_000u64, 10_000_000_000, 9_999_000_000_000] {
            let snap = snapshot(requested, true);
            if let Decision::Resize { target_bytes } =
                evaluate(&snap, &policy, &counted(2), &bytes_pct(90.0), Utc::now())
            {
                let delta = target_bytes - requested;
                assert!(delta >= policy.scale_up_min_increment || target_bytes == policy.scale_up_max_size);
                assert!(delta <= policy.scale_up_max_increment);
                assert!(target_bytes <= policy.scale_up_max_size);
            }
        }
    }
}
