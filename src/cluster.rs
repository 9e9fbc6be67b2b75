//! Kubernetes adapter: lists PVCs joined with their storage class's
//! expansion capability, patches sizes and state annotations, and emits
//! Events on the claims it touches. All mutating calls are bounded by the
//! configured HTTP timeout and become structured log records in dry-run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sizing;
use crate::state;

/// Stable identity of a claim across resizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PvcId {
    pub namespace: String,
    pub name: String,
}

impl PvcId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        PvcId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PvcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Everything the reconciler needs to know about one claim, captured fresh
/// each iteration.
#[derive(Debug, Clone)]
pub struct PvcSnapshot {
    pub id: PvcId,
    pub storage_class: Option<String>,
    /// `spec.resources.requests.storage`. This is the authoritative "current
    /// size" even while an expansion is pending in status.
    pub requested_bytes: u64,
    pub phase: Option<String>,
    pub annotations: BTreeMap<String, String>,
    /// Whether the claim's storage class allows in-place expansion.
    pub expandable: bool,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

pub struct ClusterAdapter {
    client: Client,
    timeout: Duration,
    dry_run: bool,
}

impl ClusterAdapter {
    pub fn new(client: Client, timeout: Duration, dry_run: bool) -> Self {
        ClusterAdapter {
            client,
            timeout,
            dry_run,
        }
    }

    /// List every claim in the cluster together with its storage class's
    /// expansion capability. One storage-class list serves the whole join.
    pub async fn list_pvcs(&self) -> Result<Vec<PvcSnapshot>> {
        let lp = ListParams::default().timeout(self.timeout.as_secs() as u32);

        let classes = Api::<StorageClass>::all(self.client.clone()).list(&lp).await?;
        let expandable: HashMap<String, bool> = classes
            .items
            .into_iter()
            .map(|sc| (sc.name_any(), sc.allow_volume_expansion.unwrap_or(false)))
            .collect();

        let claims = Api::<PersistentVolumeClaim>::all(self.client.clone())
            .list(&lp)
            .await?;
        let snapshots = claims
            .items
            .into_iter()
            .filter_map(|pvc| snapshot_from(pvc, &expandable))
            .collect::<Vec<_>>();
        debug!(count = snapshots.len(), "listed PVCs");
        Ok(snapshots)
    }

    /// Grow a claim. The new size and both state annotations travel in one
    /// strategic-merge patch so a successful resize can never be observed
    /// without its cooldown timestamp.
    pub async fn patch_size(&self, id: &PvcId, new_bytes: u64, at: DateTime<Utc>) -> Result<()> {
        if self.dry_run {
            info!(
                pvc = %id,
                new_size = new_bytes,
                new_size_human = %sizing::format_bytes(new_bytes),
                dry_run = true,
                "would patch PVC size"
            );
            return Ok(());
        }
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &id.namespace);
        let patch = resize_patch(new_bytes, at);
        self.bounded(api.patch(&id.name, &PatchParams::default(), &Patch::Strategic(patch)))
            .await
            .map_err(|e| map_write_error(id, e))?;
        Ok(())
    }

    /// Write state annotations without touching the size (counter advances
    /// and resets that do not coincide with a resize).
    pub async fn patch_annotations(&self, id: &PvcId, entries: &[(String, String)]) -> Result<()> {
        if self.dry_run {
            info!(pvc = %id, annotations = ?entries, dry_run = true, "would patch PVC annotations");
            return Ok(());
        }
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &id.namespace);
        let patch = annotations_patch(entries);
        self.bounded(api.patch(&id.name, &PatchParams::default(), &Patch::Merge(patch)))
            .await
            .map_err(|e| map_write_error(id, e))?;
        Ok(())
    }

    /// Record a decision on the claim so `kubectl describe pvc` shows what
    /// the autoscaler did and why. Failures are logged and swallowed.
    pub async fn emit_event(
        &self,
        snapshot: &PvcSnapshot,
        reason: &str,
        message: &str,
        warning: bool,
    ) {
        let id = &snapshot.id;
        if self.dry_run {
            info!(pvc = %id, reason, message, dry_run = true, "would emit event");
            return;
        }
        let event = build_event(snapshot, reason, message, warning, Utc::now());
        let api: Api<Event> = Api::namespaced(self.client.clone(), &id.namespace);
        match self.bounded(api.create(&PostParams::default(), &event)).await {
            Ok(_) => debug!(pvc = %id, reason, "event emitted"),
            Err(e) => warn!(pvc = %id, reason, "failed to emit event: {e}"),
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, kube::Error>>,
    ) -> std::result::Result<T, Error> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }
}

fn map_write_error(id: &PvcId, error: Error) -> Error {
    match error {
        Error::Kube {
            source: kube::Error::Api(ref response),
        } if response.code == 404 => Error::PvcGone(id.to_string()),
        Error::Kube {
            source: kube::Error::Api(ref response),
        } if response.code == 409 => Error::Conflict(id.to_string()),
        other => other,
    }
}

fn resize_patch(new_bytes: u64, at: DateTime<Utc>) -> Value {
    let (ts_key, ts_value) = state::timestamp_annotation(at);
    let (counter_key, counter_value) = state::counter_annotation(0);
    json!({
        "metadata": {
            "annotations": {
                ts_key: ts_value,
                counter_key: counter_value,
            }
        },
        "spec": {
            "resources": {
                "requests": {
                    "storage": new_bytes.to_string(),
                }
            }
        }
    })
}

fn annotations_patch(entries: &[(String, String)]) -> Value {
    let annotations: serde_json::Map<String, Value> = entries
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    json!({ "metadata": { "annotations": annotations } })
}

fn snapshot_from(
    pvc: PersistentVolumeClaim,
    expandable_classes: &HashMap<String, bool>,
) -> Option<PvcSnapshot> {
    let name = pvc.metadata.name.clone()?;
    let namespace = pvc.metadata.namespace.clone()?;
    let id = PvcId::new(namespace, name);

    let storage_class = pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.clone());
    let requested = pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .map(|quantity| quantity.0.as_str());
    let requested_bytes = match requested {
        Some(raw) => match sizing::parse_quantity(raw) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(pvc = %id, quantity = raw, "unreadable storage request, skipping PVC: {e}");
                return None;
            }
        },
        None => {
            debug!(pvc = %id, "PVC has no storage request");
            0
        }
    };
    let expandable = storage_class
        .as_deref()
        .and_then(|class| expandable_classes.get(class).copied())
        .unwrap_or(false);

    Some(PvcSnapshot {
        phase: pvc.status.as_ref().and_then(|status| status.phase.clone()),
        annotations: pvc.metadata.annotations.clone().unwrap_or_default(),
        uid: pvc.metadata.uid.clone(),
        resource_version: pvc.metadata.resource_version.clone(),
        id,
        storage_class,
        requested_bytes,
        expandable,
    })
}

fn build_event(
    snapshot: &PvcSnapshot,
    reason: &str,
    message: &str,
    warning: bool,
    now: DateTime<Utc>,
) -> Event {
    let id = &snapshot.id;
    // Event names must be unique per namespace; suffix with the creation
    // instant like client-side recorders do.
    let suffix = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{}.{:x}", id.name, suffix)),
            namespace: Some(id.namespace.clone()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("PersistentVolumeClaim".to_string()),
            name: Some(id.name.clone()),
            namespace: Some(id.namespace.clone()),
            uid: snapshot.uid.clone(),
            resource_version: snapshot.resource_version.clone(),
            ..Default::default()
        },
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        type_: Some(if warning { "Warning" } else { "Normal" }.to_string()),
        source: Some(EventSource {
            component: Some("volume-autoscaler".to_string()),
            ..Default::default()
        }),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        count: Some(1),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PersistentVolumeClaimStatus};
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn test_pvc(name: &str, storage_class: Option<&str>, request: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("abc-123".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: storage_class.map(str::to_string),
                resources: request.map(|r| {
                    k8s_openapi::api::core::v1::VolumeResourceRequirements {
                        requests: Some(
                            [("storage".to_string(), Quantity(r.to_string()))]
                                .into_iter()
                                .collect(),
                        ),
                        ..Default::default()
                    }
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn classes(entries: &[(&str, bool)]) -> HashMap<String, bool> {
        entries
            .iter()
            .map(|(name, expandable)| (name.to_string(), *expandable))
            .collect()
    }

    #[test]
    fn snapshot_joins_storage_class_capability() {
        let map = classes(&[("fast", true), ("frozen", false)]);

        let snap = snapshot_from(test_pvc("a", Some("fast"), Some("10Gi")), &map).unwrap();
        assert!(snap.expandable);
        assert_eq!(snap.requested_bytes, 10 * 1024 * 1024 * 1024);
        assert_eq!(snap.id.to_string(), "default.a");

        let snap = snapshot_from(test_pvc("b", Some("frozen"), Some("10Gi")), &map).unwrap();
        assert!(!snap.expandable);

        // Unknown class: treat as not expandable rather than guessing.
        let snap = snapshot_from(test_pvc("c", Some("mystery"), Some("10Gi")), &map).unwrap();
        assert!(!snap.expandable);

        let snap = snapshot_from(test_pvc("d", None, Some("10Gi")), &map).unwrap();
        assert!(!snap.expandable);
    }

    #[test]
    fn snapshot_without_request_defaults_to_zero_bytes() {
        let snap = snapshot_from(test_pvc("a", Some("fast"), None), &classes(&[("fast", true)]))
            .unwrap();
        assert_eq!(snap.requested_bytes, 0);
    }

    #[test]
    fn snapshot_with_garbage_request_is_skipped() {
        let snap = snapshot_from(
            test_pvc("a", Some("fast"), Some("lots")),
            &classes(&[("fast", true)]),
        );
        assert!(snap.is_none());
    }

    #[test]
    fn resize_patch_carries_size_and_both_annotations() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let patch = resize_patch(12_000_000_000, at);
        assert_eq!(
            patch["spec"]["resources"]["requests"]["storage"],
            "12000000000"
        );
        assert_eq!(
            patch["metadata"]["annotations"][state::LAST_RESIZED_AT],
            "2025-06-01T12:00:00Z"
        );
        assert_eq!(patch["metadata"]["annotations"][state::SCALE_ABOVE_COUNTER], "0");
    }

    #[test]
    fn annotations_patch_only_touches_metadata() {
        let patch = annotations_patch(&[state::counter_annotation(3)]);
        assert_eq!(patch["metadata"]["annotations"][state::SCALE_ABOVE_COUNTER], "3");
        assert!(patch.get("spec").is_none());
    }

    #[test]
    fn events_reference_the_claim() {
        let snap = snapshot_from(
            test_pvc("data", Some("fast"), Some("10Gi")),
            &classes(&[("fast", true)]),
        )
        .unwrap();
        let event = build_event(&snap, "VolumeResizeSucceeded", "resized", false, Utc::now());
        assert_eq!(event.involved_object.kind.as_deref(), Some("PersistentVolumeClaim"));
        assert_eq!(event.involved_object.uid.as_deref(), Some("abc-123"));
        assert_eq!(event.type_.as_deref(), Some("Normal"));
        assert!(event.metadata.name.unwrap().starts_with("data."));
    }
}
