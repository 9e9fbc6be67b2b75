use std::time::Duration;

/// All errors possible to occur while reconciling volumes
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid global configuration, fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The metrics backend could not produce a complete answer. Aborts the
    /// current iteration; the next interval retries from scratch.
    #[error("metrics backend unavailable: {0}")]
    MetricsUnavailable(String),

    /// Any error originating from the `kube-rs` crate
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// Error making an HTTP request to an external endpoint.
    #[error("HTTP request error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    /// The PVC vanished between listing and patching.
    #[error("PVC {0} no longer exists")]
    PvcGone(String),

    /// The API server rejected a patch with a conflict; the PVC is skipped
    /// for the rest of the iteration.
    #[error("conflicting write on PVC {0}")]
    Conflict(String),

    /// A network call exceeded the configured timeout.
    #[error("API call timed out after {0:?}")]
    Timeout(Duration),

    /// Catch-all for any other error.
    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
