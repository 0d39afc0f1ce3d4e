//! Credentialed mutating calls against the prediction service.
//!
//! Success means the backend accepted the request. Activation is not
//! confirmed until a fresh `models` read shows the new version, and a
//! training trigger does not wait for the run. Nothing here is retried and
//! nothing refreshes a view on its own.

use std::time::Instant;

use core_types::{ActivationAck, DashResult, DashboardError, Endpoint, TrainingAck, TrainingJob};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use telemetry_client::{decode_response, record_outcome, shape, transport_error, ClientConfig};

pub const ADMIN_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Deserialize)]
struct TrainingStatusReply {
    #[serde(default)]
    training: Option<TrainingJob>,
}

#[derive(Clone)]
pub struct AdminExecutor {
    http: Client,
    cfg: ClientConfig,
}

impl AdminExecutor {
    pub fn new(cfg: ClientConfig) -> Self {
        Self::with_client(Client::new(), cfg)
    }

    pub fn with_client(http: Client, cfg: ClientConfig) -> Self {
        Self { http, cfg }
    }

    pub fn has_credential(&self) -> bool {
        self.cfg.admin_key.is_some()
    }

    /// Asks the backend to make `version` active. An unknown version is
    /// rejected by the backend and surfaces as an error.
    pub async fn activate(&self, version: &str) -> DashResult<ActivationAck> {
        let ack: ActivationAck = self
            .send(Endpoint::Activate, Method::POST, &["admin", "activate", version])
            .await?;
        tracing::info!(version, status = %ack.status, "activation accepted");
        Ok(ack)
    }

    pub async fn trigger_training(&self) -> DashResult<TrainingAck> {
        let ack: TrainingAck = self
            .send(Endpoint::Train, Method::POST, &["admin", "train"])
            .await?;
        tracing::info!(status = ?ack.status, "training trigger accepted");
        Ok(ack)
    }

    /// One read of the training job; callers decide whether to ask again.
    pub async fn training_status(&self) -> DashResult<TrainingJob> {
        let reply: TrainingStatusReply = self
            .send(Endpoint::TrainStatus, Method::GET, &["admin", "train", "status"])
            .await?;
        reply.training.ok_or_else(|| {
            DashboardError::decode(Endpoint::TrainStatus, "missing field `training`")
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        method: Method,
        segments: &[&str],
    ) -> DashResult<T> {
        let started = Instant::now();
        let result = self.send_inner(endpoint, method, segments).await;
        record_outcome(endpoint, started, &result);
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(err) => err.kind(),
        };
        metrics::counter!("admin.action", "action" => endpoint.as_str(), "outcome" => outcome)
            .increment(1);
        result
    }

    async fn send_inner<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        method: Method,
        segments: &[&str],
    ) -> DashResult<T> {
        let Some(key) = self.cfg.admin_key.as_deref() else {
            return Err(DashboardError::unauthorized(
                endpoint,
                None,
                "no admin key configured",
            ));
        };
        let url = self
            .cfg
            .endpoint_url(segments)
            .map_err(|e| DashboardError::network(endpoint, None, e))?;
        let res = self
            .http
            .request(method, url)
            .header(ADMIN_KEY_HEADER, key)
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;
        let payload = decode_response(endpoint, res).await?;
        shape(endpoint, payload)
    }
}
