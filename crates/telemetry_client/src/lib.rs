pub mod envelope;

use std::time::Instant;

use async_trait::async_trait;
use core_types::{
    DashResult, DashboardError, DriftRaw, DriftSummary, Endpoint, FreshnessReport, HealthStatus,
    LatencyRaw, LatencySnapshot, ModelDetails, ModelRegistry, PredictionAudit, PredictionResult,
    ReadinessStatus, TelemetrySource, TrainingHistory,
};
use derived_metrics::{summarize_drift, synthesize_latency, MAX_LATENCY_SAMPLES};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use envelope::{
    error_body_message, error_envelope_message, is_success_without_data, unwrap_envelope,
};

pub const BACKEND_URL_ENV: &str = "MODELWATCH_BACKEND_URL";
pub const ADMIN_KEY_ENV: &str = "MODELWATCH_ADMIN_KEY";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    pub admin_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BACKEND_URL)
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            admin_key: None,
        }
    }

    /// Blank keys count as absent.
    pub fn with_admin_key(mut self, key: Option<String>) -> Self {
        self.admin_key = key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        self
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base_url = lookup(BACKEND_URL_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        Self::new(base_url).with_admin_key(lookup(ADMIN_KEY_ENV))
    }

    /// Joins path segments onto the base URL, escaping each segment.
    pub fn endpoint_url(&self, segments: &[&str]) -> Result<Url, String> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| format!("invalid base url {}: {e}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| format!("base url {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Turns a response into a bare JSON payload: non-2xx statuses, error
/// envelopes and unparsable bodies become errors, success envelopes are
/// unwrapped.
pub async fn decode_response(endpoint: Endpoint, res: Response) -> DashResult<Value> {
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| DashboardError::network(endpoint, Some(status.as_u16()), e.to_string()))?;

    if !status.is_success() {
        let message = error_body_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        });
        let rejected = status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN;
        if endpoint.is_admin() && rejected {
            return Err(DashboardError::unauthorized(endpoint, Some(status.as_u16()), message));
        }
        return Err(DashboardError::network(endpoint, Some(status.as_u16()), message));
    }

    let raw: Value = serde_json::from_str(&body)
        .map_err(|e| DashboardError::decode(endpoint, format!("body is not json: {e}")))?;
    if let Some(message) = error_envelope_message(&raw) {
        return Err(DashboardError::network(endpoint, Some(status.as_u16()), message));
    }
    if is_success_without_data(&raw) {
        return Err(DashboardError::decode(endpoint, "success envelope without data"));
    }
    Ok(unwrap_envelope(raw))
}

/// Decodes an unwrapped payload into its canonical shape.
pub fn shape<T: DeserializeOwned>(endpoint: Endpoint, payload: Value) -> DashResult<T> {
    serde_json::from_value(payload).map_err(|e| DashboardError::decode(endpoint, e.to_string()))
}

pub fn transport_error(endpoint: Endpoint, err: reqwest::Error) -> DashboardError {
    DashboardError::network(endpoint, err.status().map(|s| s.as_u16()), err.to_string())
}

pub fn record_outcome<T>(endpoint: Endpoint, started: Instant, result: &DashResult<T>) {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    metrics::histogram!("telemetry.fetch_ms", "endpoint" => endpoint.as_str()).record(elapsed_ms);
    match result {
        Ok(_) => tracing::debug!(%endpoint, elapsed_ms, "fetch ok"),
        Err(err) => {
            metrics::counter!(
                "telemetry.fetch_error",
                "endpoint" => endpoint.as_str(),
                "kind" => err.kind()
            )
            .increment(1);
            tracing::warn!(%endpoint, elapsed_ms, error = %err, "fetch failed");
        }
    }
}

#[derive(Clone)]
pub struct HttpTelemetry {
    http: Client,
    cfg: ClientConfig,
}

impl HttpTelemetry {
    pub fn new(cfg: ClientConfig) -> Self {
        Self::with_client(Client::new(), cfg)
    }

    pub fn with_client(http: Client, cfg: ClientConfig) -> Self {
        Self { http, cfg }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> DashResult<T> {
        let started = Instant::now();
        let result = self.fetch_inner(endpoint, segments, query).await;
        record_outcome(endpoint, started, &result);
        result
    }

    async fn fetch_inner<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> DashResult<T> {
        let url = self
            .cfg
            .endpoint_url(segments)
            .map_err(|e| DashboardError::network(endpoint, None, e))?;
        let res = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;
        let payload = decode_response(endpoint, res).await?;
        shape(endpoint, payload)
    }

    pub async fn model_details(&self, version: &str) -> DashResult<ModelDetails> {
        self.fetch(Endpoint::ModelDetails, &["models", version], &[])
            .await
    }

    pub async fn recent_predictions(&self, limit: usize) -> DashResult<PredictionAudit> {
        let limit = limit.max(1).to_string();
        self.fetch(
            Endpoint::RecentPredictions,
            &["predictions", "recent"],
            &[("limit", limit)],
        )
        .await
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetry {
    async fn health(&self) -> DashResult<HealthStatus> {
        self.fetch(Endpoint::Health, &["health"], &[]).await
    }

    async fn ready(&self) -> DashResult<ReadinessStatus> {
        self.fetch(Endpoint::Ready, &["ready"], &[]).await
    }

    async fn models(&self) -> DashResult<ModelRegistry> {
        let models: ModelRegistry = self.fetch(Endpoint::Models, &["models"], &[]).await?;
        models
            .validate()
            .map_err(|reason| DashboardError::decode(Endpoint::Models, reason))?;
        Ok(models)
    }

    async fn drift(&self) -> DashResult<DriftSummary> {
        let raw: DriftRaw = self
            .fetch(Endpoint::Drift, &["monitoring", "drift"], &[])
            .await?;
        Ok(summarize_drift(&raw))
    }

    async fn latency(&self) -> DashResult<LatencySnapshot> {
        let raw: LatencyRaw = self
            .fetch(Endpoint::Latency, &["monitoring", "latency"], &[])
            .await?;
        if raw.recent_calls > MAX_LATENCY_SAMPLES {
            return Err(DashboardError::decode(
                Endpoint::Latency,
                format!(
                    "recent_calls {} exceeds the {MAX_LATENCY_SAMPLES} sample window",
                    raw.recent_calls
                ),
            ));
        }
        Ok(synthesize_latency(&raw))
    }

    async fn freshness(&self) -> DashResult<FreshnessReport> {
        self.fetch(Endpoint::Freshness, &["monitoring", "freshness"], &[])
            .await
    }

    async fn history(&self) -> DashResult<TrainingHistory> {
        self.fetch(Endpoint::History, &["monitoring", "history"], &[])
            .await
    }

    async fn predict(&self, symbol: &str) -> DashResult<PredictionResult> {
        let result: PredictionResult = self
            .fetch(Endpoint::Predict, &["predict"], &[("symbol", symbol.to_string())])
            .await?;
        result
            .validate()
            .map_err(|reason| DashboardError::decode(Endpoint::Predict, reason))?;
        Ok(result)
    }
}
