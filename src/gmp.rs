//! Google Managed Prometheus adapter. Issues the three canonical PromQL
//! queries (bytes-used percent, inodes-used percent, capacity bytes) and
//! normalizes the responses into one observation per PVC identity.
//!
//! Authentication uses the GCE metadata service (Workload Identity in GKE);
//! no credential material is read from disk.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cluster::PvcId;
use crate::error::{Error, Result};

const METADATA_PROJECT_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/project/project-id";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";

/// One PVC's utilization for a single iteration. Any field may be absent
/// when the corresponding time series was not reported.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Observation {
    pub bytes_used_pct: Option<f64>,
    pub inodes_used_pct: Option<f64>,
    pub capacity_bytes: Option<u64>,
}

impl Observation {
    /// The higher of the two utilization axes. Either one can trip the
    /// scaling threshold.
    pub fn peak_used_pct(&self) -> Option<f64> {
        match (self.bytes_used_pct, self.inodes_used_pct) {
            (Some(b), Some(i)) => Some(b.max(i)),
            (Some(b), None) => Some(b),
            (None, Some(i)) => Some(i),
            (None, None) => None,
        }
    }
}

/// Detect the GCP project from the GCE metadata service. Returns `None`
/// outside of GCP (the caller then requires `GCP_PROJECT_ID`).
pub async fn detect_project_id() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    let response = client
        .get(METADATA_PROJECT_URL)
        .header(METADATA_FLAVOR_HEADER, "Google")
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.text().await.ok().filter(|p| !p.is_empty())
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: (f64, String),
}

pub struct GmpClient {
    http: reqwest::Client,
    base_url: String,
    label_match: String,
    use_metadata_auth: bool,
    token: Mutex<Option<CachedToken>>,
}

impl GmpClient {
    /// Client against the managed endpoint of the given project, with bearer
    /// tokens from the metadata service.
    pub fn new(project_id: &str, label_match: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(GmpClient {
            http,
            base_url: format!(
                "https://monitoring.googleapis.com/v1/projects/{project_id}/location/global/prometheus/api/v1"
            ),
            label_match: label_match.to_string(),
            use_metadata_auth: true,
            token: Mutex::new(None),
        })
    }

    /// Client against an arbitrary Prometheus-compatible endpoint without
    /// authentication. Used by the test suite.
    pub fn with_base_url(
        base_url: impl Into<String>,
        label_match: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(GmpClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            label_match: label_match.to_string(),
            use_metadata_auth: false,
            token: Mutex::new(None),
        })
    }

    fn bytes_query(&self) -> String {
        format!(
            "max by (namespace, persistentvolumeclaim) (100 - (kubelet_volume_stats_available_bytes{{{m}}} / kubelet_volume_stats_capacity_bytes{{{m}}}) * 100)",
            m = self.label_match
        )
    }

    fn inodes_query(&self) -> String {
        format!(
            "max by (namespace, persistentvolumeclaim) (100 - (kubelet_volume_stats_inodes_free{{{m}}} / kubelet_volume_stats_inodes{{{m}}}) * 100)",
            m = self.label_match
        )
    }

    fn capacity_query(&self) -> String {
        format!(
            "max by (namespace, persistentvolumeclaim) (kubelet_volume_stats_capacity_bytes{{{m}}})",
            m = self.label_match
        )
    }

    async fn bearer_token(&self) -> Result<Option<String>> {
        if !self.use_metadata_auth {
            return Ok(None);
        }
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(Some(token.value.clone()));
            }
        }
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header(METADATA_FLAVOR_HEADER, "Google")
            .send()
            .await
            .map_err(|e| Error::MetricsUnavailable(format!("token request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::MetricsUnavailable(format!(
                "metadata service returned HTTP {} for token request",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::MetricsUnavailable(format!("unreadable token response: {e}")))?;
        // Refresh one minute before the advertised expiry.
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60));
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at,
        });
        Ok(Some(value))
    }

    /// Run one instant query and return the rows that identify a PVC.
    /// Rows without both identifying labels are discarded.
    async fn query_vector(&self, promql: &str) -> Result<Vec<(PvcId, f64)>> {
        debug!(query = promql, "querying GMP");
        let mut request = self
            .http
            .get(format!("{}/query", self.base_url))
            .query(&[("query", promql)]);
        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::MetricsUnavailable(format!("query request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::MetricsUnavailable(format!(
                "query returned HTTP {}",
                response.status()
            )));
        }
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::MetricsUnavailable(format!("unreadable query response: {e}")))?;
        if body.status != "success" {
            return Err(Error::MetricsUnavailable(format!(
                "query status {:?}: {}",
                body.status,
                body.error.unwrap_or_default()
            )));
        }

        let mut rows = Vec::new();
        for series in body.data.map(|d| d.result).unwrap_or_default() {
            let (Some(namespace), Some(name)) = (
                series.metric.get("namespace"),
                series.metric.get("persistentvolumeclaim"),
            ) else {
                debug!(labels = ?series.metric, "discarding row without PVC identity");
                continue;
            };
            match series.value.1.parse::<f64>() {
                Ok(value) => rows.push((PvcId::new(namespace, name), value)),
                Err(e) => warn!(
                    namespace = %namespace,
                    pvc = %name,
                    raw = %series.value.1,
                    "discarding unparseable sample: {e}"
                ),
            }
        }
        Ok(rows)
    }

    /// Startup probe. Fatal for the caller when this fails: a controller that
    /// cannot read utilization must not run.
    pub async fn test_connection(&self) -> Result<()> {
        self.query_vector("up").await.map(|_| ())
    }

    /// Fetch and join all three canonical queries. Any query failing aborts
    /// the whole fetch; partial observations are never returned, since
    /// advancing hysteresis counters on half-reported data would trigger
    /// spurious resizes.
    pub async fn fetch_observations(&self) -> Result<HashMap<PvcId, Observation>> {
        let bytes_query = self.bytes_query();
        let inodes_query = self.inodes_query();
        let capacity_query = self.capacity_query();
        let (bytes, inodes, capacity) = futures::try_join!(
            self.query_vector(&bytes_query),
            self.query_vector(&inodes_query),
            self.query_vector(&capacity_query),
        )?;
        Ok(merge_rows(bytes, inodes, capacity))
    }
}

/// Merge the three result sets into one observation per identity. Duplicate
/// series keep the maximum for the percent queries and the last row seen for
/// capacity.
fn merge_rows(
    bytes: Vec<(PvcId, f64)>,
    inodes: Vec<(PvcId, f64)>,
    capacity: Vec<(PvcId, f64)>,
) -> HashMap<PvcId, Observation> {
    let mut observations: HashMap<PvcId, Observation> = HashMap::new();
    for (id, value) in bytes {
        let entry = observations.entry(id).or_default();
        entry.bytes_used_pct = Some(entry.bytes_used_pct.map_or(value, |prev| prev.max(value)));
    }
    for (id, value) in inodes {
        let entry = observations.entry(id).or_default();
        entry.inodes_used_pct = Some(entry.inodes_used_pct.map_or(value, |prev| prev.max(value)));
    }
    for (id, value) in capacity {
        observations.entry(id).or_default().capacity_bytes = Some(value as u64);
    }
    observations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> PvcId {
        PvcId::new("default", name)
    }

    #[test]
    fn peak_takes_the_higher_axis() {
        let observation = Observation {
            bytes_used_pct: Some(10.0),
            inodes_used_pct: Some(95.0),
            capacity_bytes: None,
        };
        assert_eq!(observation.peak_used_pct(), Some(95.0));
        assert_eq!(Observation::default().peak_used_pct(), None);
    }

    #[test]
    fn merge_joins_all_three_queries() {
        let observations = merge_rows(
            vec![(id("a"), 85.0)],
            vec![(id("a"), 12.0), (id("b"), 91.0)],
            vec![(id("a"), 10_000_000_000.0)],
        );
        let a = &observations[&id("a")];
        assert_eq!(a.bytes_used_pct, Some(85.0));
        assert_eq!(a.inodes_used_pct, Some(12.0));
        assert_eq!(a.capacity_bytes, Some(10_000_000_000));
        let b = &observations[&id("b")];
        assert_eq!(b.bytes_used_pct, None);
        assert_eq!(b.inodes_used_pct, Some(91.0));
    }

    #[test]
    fn duplicate_percent_rows_keep_the_maximum() {
        let observations = merge_rows(vec![(id("a"), 70.0), (id("a"), 88.0)], vec![], vec![]);
        assert_eq!(observations[&id("a")].bytes_used_pct, Some(88.0));
    }

    #[test]
    fn duplicate_capacity_rows_keep_the_last_seen() {
        let observations = merge_rows(
            vec![],
            vec![],
            vec![(id("a"), 1_000.0), (id("a"), 2_000.0)],
        );
        assert_eq!(observations[&id("a")].capacity_bytes, Some(2_000));
    }

    #[test]
    fn label_match_is_inserted_verbatim() {
        let client = GmpClient::with_base_url(
            "http://localhost:9090",
            "namespace=\"dev\"",
            Duration::from_secs(15),
        )
        .unwrap();
        assert_eq!(
            client.bytes_query(),
            "max by (namespace, persistentvolumeclaim) (100 - (kubelet_volume_stats_available_bytes{namespace=\"dev\"} / kubelet_volume_stats_capacity_bytes{namespace=\"dev\"}) * 100)"
        );
        assert!(client.inodes_query().contains("kubelet_volume_stats_inodes_free{namespace=\"dev\"}"));
        assert!(client.capacity_query().ends_with("(kubelet_volume_stats_capacity_bytes{namespace=\"dev\"})"));
    }
}
