use std::sync::Arc;

use admin_executor::AdminExecutor;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use core_types::{DashboardError, LatencySnapshot};
use derived_metrics::freshness_age;
use observability::{init_metrics, init_tracing, render_metrics};
use serde::Serialize;
use telemetry_client::{
    ClientConfig, HttpTelemetry, ADMIN_KEY_ENV, BACKEND_URL_ENV, DEFAULT_BACKEND_URL,
};
use view_orchestrator::{
    DashboardState, LoadOutcome, ViewFailure, ViewKind, ViewSession, ViewState, ViewTag,
};

#[derive(Parser, Debug)]
#[command(name = "modelwatch", about = "Prediction service monitoring CLI", version)]
struct Cli {
    #[arg(long, global = true, env = BACKEND_URL_ENV, default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,
    #[arg(long, global = true, env = ADMIN_KEY_ENV, hide_env_values = true)]
    admin_key: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    /// Print Prometheus exposition text after the command.
    #[arg(long, global = true, default_value_t = false)]
    metrics: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Models, drift, latency, health and freshness in one view.
    Overview,
    /// Drift, training history and latency.
    Monitoring,
    /// Registered model versions and the active one.
    Models,
    Predict(PredictArgs),
    /// Overview, monitoring and models loaded side by side.
    Snapshot,
    Model(VersionArgs),
    Recent(RecentArgs),
    /// Activate a model version, then re-read the registry to confirm.
    Activate(VersionArgs),
    /// Trigger a training run without waiting for it.
    Train,
    TrainStatus,
}

#[derive(Args, Debug, Clone)]
struct PredictArgs {
    #[arg(long)]
    symbol: String,
}

#[derive(Args, Debug, Clone)]
struct VersionArgs {
    #[arg(long)]
    version: String,
}

#[derive(Args, Debug, Clone)]
struct RecentArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Serialize)]
struct ViewReport<'a> {
    view: &'static str,
    status: ViewTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a DashboardState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<&'a ViewFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<Notes>,
}

/// Reader hints derived from a ready view.
#[derive(Debug, Default, PartialEq, Serialize)]
struct Notes {
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_percentiles: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_age_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    upstream_age_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_prediction_age_secs: Option<i64>,
}

const SYNTHETIC_PERCENTILES: &str = "approximate: p95_ms and max_ms equal the backend average";

#[derive(Debug, Serialize)]
struct ActivationReport {
    requested_version: String,
    ack: core_types::ActivationAck,
    active_version: Option<String>,
    converged: Option<bool>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    let _guard = init_tracing("modelwatch", level);
    if cli.metrics {
        init_metrics()?;
    }

    let cfg = ClientConfig::new(cli.backend_url).with_admin_key(cli.admin_key);
    tracing::debug!(backend = %cfg.base_url, admin_key = cfg.admin_key.is_some(), "config loaded");

    let result = run(cli.command, cfg).await;
    if let Some(text) = render_metrics() {
        println!("{text}");
    }
    result
}

async fn run(command: Commands, cfg: ClientConfig) -> Result<()> {
    let telemetry = Arc::new(HttpTelemetry::new(cfg.clone()));
    match command {
        Commands::Overview => show_view(ViewKind::Overview, telemetry).await,
        Commands::Monitoring => show_view(ViewKind::Monitoring, telemetry).await,
        Commands::Models => show_view(ViewKind::ModelManagement, telemetry).await,
        Commands::Predict(args) => show_view(ViewKind::prediction(&args.symbol), telemetry).await,
        Commands::Snapshot => run_snapshot(telemetry).await,
        Commands::Model(args) => {
            let details = telemetry.model_details(&args.version).await.map_err(report)?;
            print_json(&details)
        }
        Commands::Recent(args) => {
            let audit = telemetry.recent_predictions(args.limit).await.map_err(report)?;
            print_json(&audit)
        }
        Commands::Activate(args) => run_activate(cfg, telemetry, args.version).await,
        Commands::Train => {
            let ack = AdminExecutor::new(cfg).trigger_training().await.map_err(report)?;
            print_json(&ack)
        }
        Commands::TrainStatus => {
            let job = AdminExecutor::new(cfg).training_status().await.map_err(report)?;
            print_json(&job)
        }
    }
}

/// Mounts a view, loads it once and leaves it.
async fn load_view(kind: ViewKind, telemetry: Arc<HttpTelemetry>) -> (ViewKind, ViewState) {
    let session = ViewSession::new(kind.clone(), telemetry);
    let state = match session.load().await {
        LoadOutcome::Applied(state) => state,
        LoadOutcome::Discarded => ViewState::Idle,
    };
    session.unmount();
    (kind, state)
}

fn notes(state: &DashboardState, now: DateTime<Utc>) -> Notes {
    let latency: Option<&LatencySnapshot> = match state {
        DashboardState::Overview(s) => Some(&s.latency),
        DashboardState::Monitoring(s) => Some(&s.latency),
        DashboardState::ModelManagement(_) | DashboardState::Prediction(_) => None,
    };
    let mut notes = Notes {
        latency_percentiles: latency
            .filter(|l| l.is_synthetic())
            .map(|_| SYNTHETIC_PERCENTILES),
        ..Notes::default()
    };
    if let DashboardState::Overview(s) = state {
        let age = |ts: &Option<String>| freshness_age(ts.as_deref(), now).map(|d| d.num_seconds());
        notes.model_age_secs = age(&s.freshness.model_last_trained);
        notes.upstream_age_secs = age(&s.freshness.last_upstream_fetch);
        notes.last_prediction_age_secs = age(&s.freshness.last_prediction_time);
    }
    notes
}

fn view_report<'a>(kind: &ViewKind, state: &'a ViewState, now: DateTime<Utc>) -> ViewReport<'a> {
    let data = state.ready();
    ViewReport {
        view: kind.name(),
        status: state.tag(),
        data,
        failure: match state {
            ViewState::Failed(failure) => Some(failure),
            _ => None,
        },
        notes: data.map(|d| notes(d, now)).filter(|n| *n != Notes::default()),
    }
}

async fn show_view(kind: ViewKind, telemetry: Arc<HttpTelemetry>) -> Result<()> {
    let (kind, state) = load_view(kind, telemetry).await;
    match &state {
        ViewState::Ready(_) => print_json(&view_report(&kind, &state, Utc::now())),
        ViewState::Failed(failure) => bail!("{}", failure.message),
        ViewState::Idle | ViewState::Loading => bail!("{} view did not settle", kind.name()),
    }
}

async fn run_snapshot(telemetry: Arc<HttpTelemetry>) -> Result<()> {
    let kinds = [ViewKind::Overview, ViewKind::Monitoring, ViewKind::ModelManagement];
    let verdicts = futures::future::join_all(
        kinds
            .into_iter()
            .map(|kind| load_view(kind, telemetry.clone())),
    )
    .await;

    let now = Utc::now();
    let reports = verdicts
        .iter()
        .map(|(kind, state)| view_report(kind, state, now))
        .collect::<Vec<_>>();
    print_json(&reports)?;

    let failed = reports
        .iter()
        .filter(|r| r.status != ViewTag::Ready)
        .count();
    if failed > 0 {
        bail!("{failed} of {} views failed to load", reports.len());
    }
    Ok(())
}

async fn run_activate(
    cfg: ClientConfig,
    telemetry: Arc<HttpTelemetry>,
    version: String,
) -> Result<()> {
    let ack = AdminExecutor::new(cfg).activate(&version).await.map_err(report)?;

    // The ack only says the request was accepted; confirm against a fresh read.
    let (_, state) = load_view(ViewKind::ModelManagement, telemetry).await;
    let models = state.ready().and_then(DashboardState::models);
    let converged = models.map(|m| m.is_active(&version));
    if converged != Some(true) {
        tracing::warn!(version = %version, ?converged, "activation not yet visible in registry");
    }

    print_json(&ActivationReport {
        active_version: models.and_then(|m| m.active_version.clone()),
        requested_version: version,
        ack,
        converged,
    })
}

fn report(err: DashboardError) -> anyhow::Error {
    anyhow!("{} ({err})", err.user_message())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
