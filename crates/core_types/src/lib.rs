use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Drift policy threshold. Fixed on the client, never supplied by the backend.
pub const DRIFT_THRESHOLD: f64 = 0.25;

pub const UNKNOWN_STATUS: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

/// Response wrapper used by most backend endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: EnvelopeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.status == EnvelopeStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Health,
    Ready,
    Models,
    ModelDetails,
    Drift,
    Latency,
    Freshness,
    History,
    Predict,
    RecentPredictions,
    Activate,
    Train,
    TrainStatus,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Ready => "ready",
            Self::Models => "models",
            Self::ModelDetails => "model_details",
            Self::Drift => "drift",
            Self::Latency => "latency",
            Self::Freshness => "freshness",
            Self::History => "history",
            Self::Predict => "predict",
            Self::RecentPredictions => "recent_predictions",
            Self::Activate => "activate",
            Self::Train => "train",
            Self::TrainStatus => "train_status",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Activate | Self::Train | Self::TrainStatus)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DashboardError {
    #[error("{endpoint}: network error{}: {message}", status_suffix(.status))]
    Network {
        endpoint: Endpoint,
        status: Option<u16>,
        message: String,
    },
    #[error("{endpoint}: decode error: {reason}")]
    Decode { endpoint: Endpoint, reason: String },
    #[error("{endpoint}: authorization error{}: {message}", status_suffix(.status))]
    Authorization {
        endpoint: Endpoint,
        status: Option<u16>,
        message: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (http {code})"),
        None => String::new(),
    }
}

pub type DashResult<T> = Result<T, DashboardError>;

impl DashboardError {
    pub fn network(endpoint: Endpoint, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Network {
            endpoint,
            status,
            message: message.into(),
        }
    }

    pub fn decode(endpoint: Endpoint, reason: impl Into<String>) -> Self {
        Self::Decode {
            endpoint,
            reason: reason.into(),
        }
    }

    pub fn unauthorized(endpoint: Endpoint, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Authorization {
            endpoint,
            status,
            message: message.into(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::Network { endpoint, .. }
            | Self::Decode { endpoint, .. }
            | Self::Authorization { endpoint, .. } => *endpoint,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Decode { .. } => "decode",
            Self::Authorization { .. } => "authorization",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Network { status, .. } | Self::Authorization { status, .. } => *status,
            Self::Decode { .. } => None,
        }
    }

    /// Operator-facing text. Any failure on an admin endpoint is attributed to
    /// the credential first, since that is the common cause.
    pub fn user_message(&self) -> &'static str {
        if matches!(self, Self::Authorization { .. }) || self.endpoint().is_admin() {
            "Admin action failed. Check the configured admin key (MODELWATCH_ADMIN_KEY)."
        } else {
            "Request to the prediction service failed."
        }
    }
}

fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

fn lenient_number<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(d)?;
    Ok(raw
        .as_f64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok())))
}

fn lenient_flag<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Value::deserialize(d)?.as_bool().unwrap_or(false))
}

/// Drift rows that are not usable objects degrade to an empty row.
fn lenient_rows<'de, D>(d: D) -> Result<BTreeMap<String, FeatureDriftRaw>, D::Error>
where
    D: Deserializer<'de>,
{
    let rows = Option::<BTreeMap<String, Value>>::deserialize(d)?.unwrap_or_default();
    Ok(rows
        .into_iter()
        .map(|(name, row)| (name, serde_json::from_value(row).unwrap_or_default()))
        .collect())
}

fn unknown_if_null<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(d)?.unwrap_or_else(unknown_status))
}

fn unknown_status() -> String {
    UNKNOWN_STATUS.to_string()
}

fn no_calls() -> u64 {
    0
}

fn zero_latency() -> f64 {
    0.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    #[serde(default = "unknown_status", deserialize_with = "unknown_if_null")]
    pub status: String,
    #[serde(default = "unknown_status", deserialize_with = "unknown_if_null")]
    pub service: String,
    #[serde(default = "unknown_status", deserialize_with = "unknown_if_null")]
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessStatus {
    #[serde(default = "unknown_status", deserialize_with = "unknown_if_null")]
    pub status: String,
    #[serde(default)]
    pub registry_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRegistry {
    #[serde(default, deserialize_with = "nullable")]
    pub available_versions: Vec<String>,
    #[serde(default)]
    pub active_version: Option<String>,
}

impl ModelRegistry {
    pub fn contains(&self, version: &str) -> bool {
        self.available_versions.iter().any(|v| v == version)
    }

    pub fn is_active(&self, version: &str) -> bool {
        self.active_version.as_deref() == Some(version)
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.active_version.as_deref() {
            Some(active) if !self.contains(active) => Err(format!(
                "active_version {active} is not among available_versions"
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDetails {
    pub version: String,
    #[serde(default, deserialize_with = "nullable")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "nullable")]
    pub feature_columns: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub dataset_summary: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub is_active: bool,
}

/// Per-feature row of the raw drift report. Only the fields the dashboard
/// reads are typed; the rest of the row is ignored. Unusable values read as
/// absent so a bad row contributes zero instead of failing the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureDriftRaw {
    #[serde(default, deserialize_with = "lenient_number")]
    pub mean_deviation_ratio: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub std_deviation_ratio: Option<f64>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub drift: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftRaw {
    #[serde(default = "unknown_status", deserialize_with = "unknown_if_null")]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_rows")]
    pub details: BTreeMap<String, FeatureDriftRaw>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSummary {
    pub status: String,
    pub score: f64,
    pub threshold: f64,
    pub feature_count: usize,
    pub drifted_features: Vec<String>,
}

impl DriftSummary {
    pub fn exceeds_threshold(&self) -> bool {
        self.score > self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyRaw {
    #[serde(default = "no_calls", deserialize_with = "nullable")]
    pub recent_calls: u64,
    #[serde(default = "zero_latency", deserialize_with = "nullable")]
    pub avg_latency_ms: f64,
}

/// Dashboard latency view. `p95_ms` and `max_ms` are not measured: the
/// backend only reports an average, so both are set to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub average_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
    pub history: Vec<f64>,
}

impl LatencySnapshot {
    pub fn is_synthetic(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "FreshnessWire")]
pub struct FreshnessReport {
    pub model_last_trained: Option<String>,
    pub last_upstream_fetch: Option<String>,
    pub last_prediction_time: Option<String>,
}

/// Backend spelling of the freshness payload. `upstream_last_seen` wins when
/// both upstream keys are present.
#[derive(Deserialize)]
struct FreshnessWire {
    #[serde(default)]
    model_last_trained: Option<String>,
    #[serde(default)]
    upstream_last_seen: Option<String>,
    #[serde(default)]
    last_upstream_fetch: Option<String>,
    #[serde(default)]
    last_prediction_time: Option<String>,
}

impl From<FreshnessWire> for FreshnessReport {
    fn from(wire: FreshnessWire) -> Self {
        Self {
            model_last_trained: wire.model_last_trained,
            last_upstream_fetch: wire.upstream_last_seen.or(wire.last_upstream_fetch),
            last_prediction_time: wire.last_prediction_time,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(default)]
    pub rmse: Option<f64>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub timestamp: String,
    pub version: String,
    #[serde(default)]
    pub metrics: Option<RunMetrics>,
}

impl TrainingRun {
    pub fn rmse(&self) -> Option<f64> {
        self.metrics.as_ref().and_then(|m| m.rmse)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    #[serde(default, deserialize_with = "nullable")]
    pub runs: Vec<TrainingRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub prediction: Value,
    pub confidence: f64,
    pub model_version: String,
    #[serde(default, deserialize_with = "nullable")]
    pub features: BTreeMap<String, Value>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl PredictionResult {
    pub fn validate(&self) -> Result<(), String> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if self.prediction.is_null() {
            return Err("prediction is null".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub prediction: Option<Value>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub features: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionAudit {
    #[serde(default, deserialize_with = "nullable")]
    pub entries: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingState {
    Idle,
    Running,
    Succeeded,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    #[serde(default, deserialize_with = "nullable")]
    pub state: TrainingState,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingDispatch {
    Started,
    AlreadyRunning,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Acknowledgement of a training trigger. Accepted, not finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingAck {
    #[serde(default, deserialize_with = "nullable")]
    pub status: TrainingDispatch,
    #[serde(default)]
    pub training: Option<TrainingJob>,
}

/// Acknowledgement of an activation request. The registry may not have
/// converged yet; re-read `models` to confirm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationAck {
    #[serde(default = "unknown_status", deserialize_with = "unknown_if_null")]
    pub status: String,
    #[serde(default)]
    pub active_version: Option<String>,
}

/// Read side of the backend, one accessor per capability. Every accessor
/// returns a fully shaped value or an error; never a partial one.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn health(&self) -> DashResult<HealthStatus>;
    async fn ready(&self) -> DashResult<ReadinessStatus>;
    async fn models(&self) -> DashResult<ModelRegistry>;
    async fn drift(&self) -> DashResult<DriftSummary>;
    async fn latency(&self) -> DashResult<LatencySnapshot>;
    async fn freshness(&self) -> DashResult<FreshnessReport>;
    async fn history(&self) -> DashResult<TrainingHistory>;
    async fn predict(&self, symbol: &str) -> DashResult<PredictionResult>;
}
