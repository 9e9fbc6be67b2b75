use std::pin::pin;
use std::time::Instant;

use anyhow::{anyhow, Context};
use kube::{client::Client, Config as KubeConfig};
use tokio::time::sleep_until;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_autoscaler::api::{self, AppState};
use volume_autoscaler::cluster::ClusterAdapter;
use volume_autoscaler::config::Config;
use volume_autoscaler::gmp::{self, GmpClient};
use volume_autoscaler::observability::ControllerMetrics;
use volume_autoscaler::reconciler::Reconciler;
use volume_autoscaler::slack::SlackNotifier;

const METRICS_PORT: u16 = 8000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Environment setup through .env file, for running outside the cluster.
    dotenvy::dotenv().ok();

    let verbose = std::env::var("VERBOSE")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" })),
        )
        .with(fmt::layer())
        .init();

    let config = Config::from_env().context("reading configuration")?;

    let project_id = match config.gcp_project_id.clone() {
        Some(project) => project,
        None => gmp::detect_project_id().await.ok_or_else(|| {
            anyhow!("GCP_PROJECT_ID must be set or detectable from the metadata service")
        })?,
    };
    config.log_banner(&project_id);

    // First, a Kubernetes client must be obtained using the `kube` crate.
    // Attempt to infer the configuration: in-cluster first, kubeconfig as a
    // fallback.
    let kube_config = KubeConfig::infer().await.map_err(kube::Error::InferConfig)?;
    let client = Client::try_from(kube_config)?;

    let gmp_client = GmpClient::new(&project_id, &config.gmp_label_match, config.http_timeout)?;
    info!(project = %project_id, "testing connection to Google Managed Prometheus");
    gmp_client
        .test_connection()
        .await
        .context("cannot reach Google Managed Prometheus")?;
    info!("successfully connected to Google Managed Prometheus");

    let metrics = ControllerMetrics::new();
    metrics.set_info(&config, &project_id);

    let app_state = AppState::new();
    let _server = tokio::spawn(api::serve(METRICS_PORT, app_state.clone()));

    let cluster = ClusterAdapter::new(client, config.http_timeout, config.dry_run);
    let slack = SlackNotifier::from_config(&config);
    let interval = config.interval_time;
    let mut reconciler = Reconciler::new(config, gmp_client, cluster, slack, metrics.clone());

    info!("starting reconciliation loop");
    let mut shutdown = pin!(shutdown_signal());
    let mut next_start = Instant::now();
    loop {
        // Wait for the scheduled start, unless a shutdown arrives first.
        // Signals are only honored between iterations, so an in-flight patch
        // always completes.
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("received shutdown signal, exiting");
                break;
            }
            _ = sleep_until(next_start.into()) => {}
        }

        let started = Instant::now();
        match reconciler.run_iteration().await {
            Ok(()) => app_state.mark_ready(),
            Err(e) => {
                error!("iteration aborted: {e}");
                metrics.inc_iteration_failed();
            }
        }

        // The next iteration is scheduled from this iteration's start, not
        // its end. An overrun starts the next one immediately.
        next_start = started + interval;
        if Instant::now() >= next_start {
            warn!(
                elapsed_secs = started.elapsed().as_secs(),
                interval_secs = interval.as_secs(),
                "iteration overran the interval"
            );
            metrics.inc_iteration_overrun();
            next_start = Instant::now();
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
