//! Per-view composition of backend telemetry.
//!
//! A [`ViewSession`] owns the state of one mounted view and moves it through
//! `Idle -> Loading -> Ready | Failed`. Each load fans out every fetch the
//! view needs at once and waits for all of them to settle; one failure fails
//! the whole view. State is replaced wholesale, never patched, and results
//! that arrive after the view was unmounted or reloaded are dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use core_types::{
    DashboardError, DriftSummary, Endpoint, FreshnessReport, HealthStatus, LatencySnapshot,
    ModelRegistry, PredictionResult, TelemetrySource, TrainingHistory,
};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewKind {
    Overview,
    Monitoring,
    ModelManagement,
    Prediction { symbol: String },
}

impl ViewKind {
    pub fn prediction(symbol: &str) -> Self {
        Self::Prediction {
            symbol: symbol.trim().to_ascii_uppercase(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Overview => "overview",
            Self::Monitoring => "monitoring",
            Self::ModelManagement => "model_management",
            Self::Prediction { .. } => "prediction",
        }
    }

    /// Fetches issued on every load of this view.
    pub fn endpoints(&self) -> &'static [Endpoint] {
        match self {
            Self::Overview => &[
                Endpoint::Models,
                Endpoint::Drift,
                Endpoint::Latency,
                Endpoint::Health,
                Endpoint::Freshness,
            ],
            Self::Monitoring => &[Endpoint::Drift, Endpoint::History, Endpoint::Latency],
            Self::ModelManagement => &[Endpoint::Models],
            Self::Prediction { .. } => &[Endpoint::Predict],
        }
    }

    pub fn failure_message(&self) -> &'static str {
        match self {
            Self::Overview => "Failed to load dashboard",
            Self::Monitoring => "Failed to load monitoring data",
            Self::ModelManagement => "Failed to load model versions",
            Self::Prediction { .. } => "Prediction request failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverviewState {
    pub models: ModelRegistry,
    pub drift: DriftSummary,
    pub latency: LatencySnapshot,
    pub health: HealthStatus,
    pub freshness: FreshnessReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringState {
    pub drift: DriftSummary,
    pub history: TrainingHistory,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelManagementState {
    pub models: ModelRegistry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionState {
    pub symbol: String,
    pub result: PredictionResult,
}

/// Everything one view renders, from a single fetch cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum DashboardState {
    Overview(OverviewState),
    Monitoring(MonitoringState),
    ModelManagement(ModelManagementState),
    Prediction(PredictionState),
}

impl DashboardState {
    pub fn models(&self) -> Option<&ModelRegistry> {
        match self {
            Self::Overview(s) => Some(&s.models),
            Self::ModelManagement(s) => Some(&s.models),
            Self::Monitoring(_) | Self::Prediction(_) => None,
        }
    }
}

/// All-or-nothing verdict of a failed load. The failed endpoints are kept for
/// diagnostics; no partial data is exposed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewFailure {
    pub message: String,
    pub failed_endpoints: Vec<Endpoint>,
    pub causes: Vec<String>,
}

impl ViewFailure {
    fn from_errors(
        kind: &ViewKind,
        errors: impl IntoIterator<Item = Option<DashboardError>>,
    ) -> Self {
        let errors = errors.into_iter().flatten().collect::<Vec<_>>();
        Self {
            message: kind.failure_message().to_string(),
            failed_endpoints: errors.iter().map(DashboardError::endpoint).collect(),
            causes: errors.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewTag {
    Idle,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Idle,
    Loading,
    Ready(Arc<DashboardState>),
    Failed(ViewFailure),
}

impl ViewState {
    pub fn tag(&self) -> ViewTag {
        match self {
            Self::Idle => ViewTag::Idle,
            Self::Loading => ViewTag::Loading,
            Self::Ready(_) => ViewTag::Ready,
            Self::Failed(_) => ViewTag::Failed,
        }
    }

    pub fn ready(&self) -> Option<&DashboardState> {
        match self {
            Self::Ready(state) => Some(state),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Applied(ViewState),
    /// The view was unmounted or reloaded while this load was in flight.
    Discarded,
}

/// Runs one fan-out for `kind`. Every fetch is issued before any is awaited
/// and all of them settle before the verdict; there is no short-circuit.
pub async fn compose<S>(source: &S, kind: &ViewKind) -> Result<DashboardState, ViewFailure>
where
    S: TelemetrySource + ?Sized,
{
    match kind {
        ViewKind::Overview => {
            let (models, drift, latency, health, freshness) = tokio::join!(
                source.models(),
                source.drift(),
                source.latency(),
                source.health(),
                source.freshness()
            );
            match (models, drift, latency, health, freshness) {
                (Ok(models), Ok(drift), Ok(latency), Ok(health), Ok(freshness)) => {
                    Ok(DashboardState::Overview(OverviewState {
                        models,
                        drift,
                        latency,
                        health,
                        freshness,
                    }))
                }
                (models, drift, latency, health, freshness) => Err(ViewFailure::from_errors(
                    kind,
                    [
                        models.err(),
                        drift.err(),
                        latency.err(),
                        health.err(),
                        freshness.err(),
                    ],
                )),
            }
        }
        ViewKind::Monitoring => {
            let (drift, history, latency) =
                tokio::join!(source.drift(), source.history(), source.latency());
            match (drift, history, latency) {
                (Ok(drift), Ok(history), Ok(latency)) => {
                    Ok(DashboardState::Monitoring(MonitoringState {
                        drift,
                        history,
                        latency,
                    }))
                }
                (drift, history, latency) => Err(ViewFailure::from_errors(
                    kind,
                    [drift.err(), history.err(), latency.err()],
                )),
            }
        }
        ViewKind::ModelManagement => match source.models().await {
            Ok(models) => Ok(DashboardState::ModelManagement(ModelManagementState { models })),
            Err(err) => Err(ViewFailure::from_errors(kind, [Some(err)])),
        },
        ViewKind::Prediction { symbol } => {
            if symbol.is_empty() {
                let err = DashboardError::decode(Endpoint::Predict, "symbol is empty");
                return Err(ViewFailure::from_errors(kind, [Some(err)]));
            }
            match source.predict(symbol).await {
                Ok(result) => Ok(DashboardState::Prediction(PredictionState {
                    symbol: symbol.clone(),
                    result,
                })),
                Err(err) => Err(ViewFailure::from_errors(kind, [Some(err)])),
            }
        }
    }
}

/// State owner for one mounted view. Nothing is shared between sessions, so
/// two views fetching the same endpoint fetch it twice.
pub struct ViewSession<S: ?Sized> {
    kind: ViewKind,
    source: Arc<S>,
    state: watch::Sender<ViewState>,
    generation: AtomicU64,
    mounted: AtomicBool,
}

impl<S> ViewSession<S>
where
    S: TelemetrySource + ?Sized,
{
    pub fn new(kind: ViewKind, source: Arc<S>) -> Self {
        let (state, _) = watch::channel(ViewState::Idle);
        Self {
            kind,
            source,
            state,
            generation: AtomicU64::new(0),
            mounted: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> &ViewKind {
        &self.kind
    }

    pub fn state(&self) -> ViewState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state.subscribe()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.is_mounted() && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Publishes `next` only if `generation` is still the live one. The check
    /// runs under the channel lock so it cannot interleave with `unmount`.
    fn publish(&self, generation: u64, next: &ViewState) -> bool {
        self.state.send_if_modified(|current| {
            if !self.is_current(generation) {
                return false;
            }
            *current = next.clone();
            true
        })
    }

    /// Mount-time load and refresh share this path: enter `Loading`, fan out,
    /// then replace the state with the verdict.
    pub async fn load(&self) -> LoadOutcome {
        let view = self.kind.name();
        if !self.is_mounted() {
            return LoadOutcome::Discarded;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.publish(generation, &ViewState::Loading) {
            return LoadOutcome::Discarded;
        }
        tracing::debug!(view, generation, "view loading");

        let next = match compose(self.source.as_ref(), &self.kind).await {
            Ok(state) => ViewState::Ready(Arc::new(state)),
            Err(failure) => ViewState::Failed(failure),
        };

        if !self.publish(generation, &next) {
            metrics::counter!("view.stale_discard", "view" => view).increment(1);
            tracing::debug!(view, generation, "stale view result discarded");
            return LoadOutcome::Discarded;
        }

        match &next {
            ViewState::Failed(failure) => {
                metrics::counter!("view.failed", "view" => view).increment(1);
                tracing::warn!(
                    view,
                    generation,
                    failed = ?failure.failed_endpoints,
                    causes = ?failure.causes,
                    "view failed"
                );
            }
            _ => {
                metrics::counter!("view.ready", "view" => view).increment(1);
                tracing::info!(view, generation, "view ready");
            }
        }
        LoadOutcome::Applied(next)
    }

    /// Leaves the view: in-flight loads become stale and the state is
    /// discarded back to `Idle`.
    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ViewState::Idle);
        tracing::debug!(view = self.kind.name(), "view unmounted");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use core_types::{DashResult, ReadinessStatus, DRIFT_THRESHOLD};
    use tokio::sync::Semaphore;

    use super::*;

    struct FakeSource {
        failing: Mutex<HashSet<Endpoint>>,
        calls: Mutex<Vec<Endpoint>>,
        active_version: Mutex<Option<String>>,
        gate: Option<Semaphore>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                failing: Mutex::new(HashSet::new()),
                calls: Mutex::new(Vec::new()),
                active_version: Mutex::new(Some("v1".to_string())),
                gate: None,
            }
        }

        fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::new()
            }
        }

        fn fail(&self, endpoint: Endpoint) {
            self.failing.lock().expect("failing").insert(endpoint);
        }

        fn release(&self) {
            self.allow(64);
        }

        fn allow(&self, fetches: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(fetches);
            }
        }

        fn calls(&self) -> Vec<Endpoint> {
            self.calls.lock().expect("calls").clone()
        }

        async fn enter(&self, endpoint: Endpoint) -> DashResult<()> {
            self.calls.lock().expect("calls").push(endpoint);
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate open").forget();
            }
            if self.failing.lock().expect("failing").contains(&endpoint) {
                return Err(DashboardError::network(endpoint, Some(500), "boom"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TelemetrySource for FakeSource {
        async fn health(&self) -> DashResult<HealthStatus> {
            self.enter(Endpoint::Health).await?;
            Ok(HealthStatus {
                status: "ok".into(),
                service: "ml-api".into(),
                environment: "test".into(),
            })
        }

        async fn ready(&self) -> DashResult<ReadinessStatus> {
            self.enter(Endpoint::Ready).await?;
            Ok(ReadinessStatus {
                status: "ok".into(),
                registry_path: None,
            })
        }

        async fn models(&self) -> DashResult<ModelRegistry> {
            self.enter(Endpoint::Models).await?;
            Ok(ModelRegistry {
                available_versions: vec!["v1".into(), "v2".into()],
                active_version: self.active_version.lock().expect("active").clone(),
            })
        }

        async fn drift(&self) -> DashResult<DriftSummary> {
            self.enter(Endpoint::Drift).await?;
            Ok(DriftSummary {
                status: "healthy".into(),
                score: 0.05,
                threshold: DRIFT_THRESHOLD,
                feature_count: 2,
                drifted_features: Vec::new(),
            })
        }

        async fn latency(&self) -> DashResult<LatencySnapshot> {
            self.enter(Endpoint::Latency).await?;
            Ok(LatencySnapshot {
                count: 2,
                average_ms: 40.0,
                p95_ms: 40.0,
                max_ms: 40.0,
                history: vec![40.0, 40.2],
            })
        }

        async fn freshness(&self) -> DashResult<FreshnessReport> {
            self.enter(Endpoint::Freshness).await?;
            Ok(FreshnessReport::default())
        }

        async fn history(&self) -> DashResult<TrainingHistory> {
            self.enter(Endpoint::History).await?;
            Ok(TrainingHistory::default())
        }

        async fn predict(&self, symbol: &str) -> DashResult<PredictionResult> {
            self.enter(Endpoint::Predict).await?;
            Ok(PredictionResult {
                prediction: serde_json::json!(0.58),
                confidence: 0.66,
                model_version: "v1".into(),
                features: Default::default(),
                symbol: Some(symbol.to_string()),
                timestamp: None,
            })
        }
    }

    async fn wait_for_loading<S: TelemetrySource + ?Sized>(session: &ViewSession<S>) {
        while session.state().tag() != ViewTag::Loading {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn overview_ready_after_all_fetches() {
        let source = Arc::new(FakeSource::new());
        let session = ViewSession::new(ViewKind::Overview, source.clone());
        assert_eq!(session.state(), ViewState::Idle);

        let outcome = session.load().await;
        let LoadOutcome::Applied(ViewState::Ready(state)) = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        let DashboardState::Overview(overview) = state.as_ref() else {
            panic!("expected overview state");
        };
        assert_eq!(overview.models.active_version.as_deref(), Some("v1"));
        assert_eq!(overview.health.status, "ok");

        let called = source.calls().into_iter().collect::<HashSet<_>>();
        let expected = ViewKind::Overview.endpoints().iter().copied().collect::<HashSet<_>>();
        assert_eq!(called, expected);
        assert_eq!(session.state().tag(), ViewTag::Ready);
    }

    #[tokio::test]
    async fn any_single_failure_fails_the_view() {
        for failing in ViewKind::Overview.endpoints() {
            let source = Arc::new(FakeSource::new());
            source.fail(*failing);
            let session = ViewSession::new(ViewKind::Overview, source.clone());

            let LoadOutcome::Applied(ViewState::Failed(failure)) = session.load().await else {
                panic!("expected failure when {failing} fails");
            };
            assert_eq!(failure.message, "Failed to load dashboard");
            assert_eq!(failure.failed_endpoints, vec![*failing]);
            assert_eq!(failure.causes.len(), 1);
            // every fetch still ran to completion
            assert_eq!(source.calls().len(), 5);
            assert!(session.state().ready().is_none());
        }
    }

    #[tokio::test]
    async fn failure_lists_every_failed_endpoint() {
        let source = Arc::new(FakeSource::new());
        source.fail(Endpoint::Drift);
        source.fail(Endpoint::History);
        let session = ViewSession::new(ViewKind::Monitoring, source.clone());
        let LoadOutcome::Applied(ViewState::Failed(failure)) = session.load().await else {
            panic!("expected failure");
        };
        assert_eq!(failure.failed_endpoints, vec![Endpoint::Drift, Endpoint::History]);
        assert_eq!(failure.message, "Failed to load monitoring data");
    }

    #[tokio::test]
    async fn monitoring_fetches_its_own_set() {
        let source = Arc::new(FakeSource::new());
        let session = ViewSession::new(ViewKind::Monitoring, source.clone());
        let LoadOutcome::Applied(ViewState::Ready(state)) = session.load().await else {
            panic!("expected ready");
        };
        assert!(matches!(state.as_ref(), DashboardState::Monitoring(_)));
        assert!(state.models().is_none());
        let mut called = source.calls();
        called.sort_by_key(|e| e.as_str());
        assert_eq!(called, vec![Endpoint::Drift, Endpoint::History, Endpoint::Latency]);
    }

    #[tokio::test]
    async fn prediction_normalizes_symbol_and_rejects_empty() {
        let source = Arc::new(FakeSource::new());
        let session = ViewSession::new(ViewKind::prediction(" aapl "), source.clone());
        let LoadOutcome::Applied(ViewState::Ready(state)) = session.load().await else {
            panic!("expected ready");
        };
        let DashboardState::Prediction(prediction) = state.as_ref() else {
            panic!("expected prediction");
        };
        assert_eq!(prediction.symbol, "AAPL");
        assert_eq!(prediction.result.symbol.as_deref(), Some("AAPL"));

        let empty_source = Arc::new(FakeSource::new());
        let empty = ViewSession::new(ViewKind::prediction("   "), empty_source.clone());
        let LoadOutcome::Applied(ViewState::Failed(failure)) = empty.load().await else {
            panic!("expected failure");
        };
        assert_eq!(failure.failed_endpoints, vec![Endpoint::Predict]);
        assert!(empty_source.calls().is_empty());
    }

    #[tokio::test]
    async fn refresh_replaces_state_wholesale() {
        let source = Arc::new(FakeSource::new());
        let session = ViewSession::new(ViewKind::ModelManagement, source.clone());
        let LoadOutcome::Applied(ViewState::Ready(first)) = session.load().await else {
            panic!("expected ready");
        };
        *source.active_version.lock().expect("active") = Some("v2".to_string());

        let mut rx = session.subscribe();
        let LoadOutcome::Applied(ViewState::Ready(second)) = session.load().await else {
            panic!("expected ready");
        };
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.models().and_then(|m| m.active_version.as_deref()), Some("v1"));
        assert_eq!(second.models().and_then(|m| m.active_version.as_deref()), Some("v2"));

        assert!(rx.has_changed().expect("sender alive"));
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen, ViewState::Ready(second));
    }

    #[tokio::test]
    async fn refresh_publishes_loading_between_ready_states() {
        let source = Arc::new(FakeSource::gated());
        source.allow(1);
        let session = Arc::new(ViewSession::new(ViewKind::ModelManagement, source.clone()));
        let mut rx = session.subscribe();

        let LoadOutcome::Applied(first) = session.load().await else {
            panic!("expected first load to apply");
        };
        assert_eq!(first.tag(), ViewTag::Ready);
        assert_eq!(*rx.borrow_and_update(), first);
        *source.active_version.lock().expect("active") = Some("v2".to_string());

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.load().await })
        };
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow_and_update(), ViewState::Loading);

        source.allow(1);
        let LoadOutcome::Applied(second) = task.await.expect("refresh task") else {
            panic!("expected refresh to apply");
        };
        rx.changed().await.expect("sender alive");
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen, second);
        let models = seen.ready().and_then(DashboardState::models);
        assert_eq!(models.and_then(|m| m.active_version.as_deref()), Some("v2"));
    }

    #[tokio::test]
    async fn result_after_unmount_is_discarded() {
        let source = Arc::new(FakeSource::gated());
        let session = Arc::new(ViewSession::new(ViewKind::Overview, source.clone()));
        let rx = session.subscribe();

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.load().await })
        };
        wait_for_loading(&session).await;

        session.unmount();
        source.release();
        let outcome = task.await.expect("load task");

        assert_eq!(outcome, LoadOutcome::Discarded);
        assert_eq!(session.state(), ViewState::Idle);
        assert_eq!(*rx.borrow(), ViewState::Idle);
        assert_eq!(session.load().await, LoadOutcome::Discarded);
    }

    #[tokio::test]
    async fn superseded_load_is_discarded() {
        let source = Arc::new(FakeSource::gated());
        let session = Arc::new(ViewSession::new(ViewKind::Monitoring, source.clone()));

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.load().await })
        };
        wait_for_loading(&session).await;
        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.load().await })
        };
        while source.calls().len() < 6 {
            tokio::task::yield_now().await;
        }
        source.release();

        assert_eq!(first.await.expect("first"), LoadOutcome::Discarded);
        let second = second.await.expect("second");
        assert!(matches!(second, LoadOutcome::Applied(ViewState::Ready(_))));
        assert_eq!(session.state().tag(), ViewTag::Ready);
    }

    #[test]
    fn dashboard_state_serializes_with_view_tag() {
        let state = DashboardState::ModelManagement(ModelManagementState {
            models: ModelRegistry {
                available_versions: vec!["v1".into()],
                active_version: Some("v1".into()),
            },
        });
        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["view"], "model_management");
        assert_eq!(value["models"]["active_version"], "v1");
    }
}
