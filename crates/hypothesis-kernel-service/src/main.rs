use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use hypothesis_kernel_core::{HumanDecision, KernelConfig, RunId};
use hypothesis_kernel_orchestrator::{
    default_owner, load_config, ChangeNotifier, DecideOutcome, DecideStatus, DecisionRequest,
    DrainReport, LogTerminalEffect, NoopWorkerDispatcher, Orchestrator, RunChange, SweepReport,
    SystemClock,
};
use hypothesis_kernel_store_sqlite::{
    CommitOutcome, CommitRequest, CommitStatus, NewRun, RunRecord, RunStatusView, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const CHANGE_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_WAIT_MS: u64 = 10_000;
const MAX_WAIT_MS: u64 = 60_000;
const MAINTENANCE_BATCH: usize = 32;

/// Fans committed changes out to long-poll waiters. Dropped when nobody listens.
#[derive(Debug)]
struct BroadcastNotifier {
    sender: broadcast::Sender<RunChange>,
}

impl BroadcastNotifier {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    fn subscribe(&self) -> broadcast::Receiver<RunChange> {
        self.sender.subscribe()
    }
}

impl ChangeNotifier for BroadcastNotifier {
    fn publish(&self, change: &RunChange) {
        if self.sender.send(change.clone()).is_err() {
            debug!(run_id = %change.run_id, version = change.version, "no change subscribers");
        }
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: PathBuf,
    config: KernelConfig,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
    notifier: Arc<BroadcastNotifier>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommitBody {
    change_id: String,
    #[serde(default)]
    patch: Option<Value>,
    #[serde(default)]
    history_entries: Vec<Value>,
    #[serde(default)]
    expected_version: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct DecisionBody {
    decision: HumanDecision,
    decided_by: String,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AbandonBody {
    reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DrainBody {
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    max_items: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SweepBody {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct WaitParams {
    after_version: u64,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct WaitResponse {
    changed: bool,
    status: RunStatusView,
}

#[derive(Debug, Clone, Serialize)]
struct MigrateResponse {
    migrated: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    change_subscribers: usize,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    conflict_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    conflict_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "hypothesis-kernel-service")]
#[command(about = "Local HTTP service for Hypothesis Kernel runs")]
struct Args {
    #[arg(long, default_value = "./hypothesis_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Sweep overdue checkpoints and drain the completion queue on this interval.
    #[arg(long)]
    maintenance_interval_ms: Option<u64>,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn new(db_path: PathBuf, config: KernelConfig, operation_timeout: Duration) -> Self {
        Self {
            db_path,
            config,
            operation_timeout,
            telemetry: Arc::new(ServiceTelemetry::default()),
            notifier: Arc::new(BroadcastNotifier::new(CHANGE_CHANNEL_CAPACITY)),
        }
    }

    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    /// Builds a failure for a protocol outcome and counts it.
    fn reject(
        &self,
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        self.telemetry.record_failure(code, false);
        Self::failure(status, code, message, details)
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.reject(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn parse_run_id(&self, raw: &str) -> Result<RunId, ServiceFailure> {
        RunId::parse(raw).map_err(|err| {
            self.reject(StatusCode::BAD_REQUEST, "validation_error", err.to_string(), None)
        })
    }

    fn classify_error(err: &anyhow::Error) -> ServiceFailure {
        let message = format!("{err:#}");
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::InvalidDelta(_) | StoreError::UnknownRoutingVersion(_)) => {
                Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
            }
            Some(StoreError::RunClosed { run_id, status }) => Self::failure(
                StatusCode::CONFLICT,
                "run_closed",
                message,
                Some(json!({"run_id": run_id, "status": status})),
            ),
            Some(StoreError::CheckpointState {
                run_id,
                checkpoint_name,
            }) => Self::failure(
                StatusCode::CONFLICT,
                "checkpoint_state",
                message,
                Some(json!({"run_id": run_id, "checkpoint_name": checkpoint_name})),
            ),
            Some(StoreError::LeaseLost { item_id, owner }) => Self::failure(
                StatusCode::CONFLICT,
                "lease_lost",
                message,
                Some(json!({"item_id": item_id, "owner": owner})),
            ),
            None => Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                message,
                None,
            ),
        }
    }

    /// Runs a blocking orchestrator call on the blocking pool, bounded by the operation
    /// timeout. Each call opens its own connection.
    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&Orchestrator<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db_path = self.db_path.clone();
        let config = self.config.clone();
        let notifier = Arc::clone(&self.notifier);
        let handle = tokio::task::spawn_blocking(move || {
            let clock = SystemClock;
            let orchestrator = Orchestrator::new(
                &db_path,
                config,
                &clock,
                notifier.as_ref(),
                &NoopWorkerDispatcher,
            );
            op(&orchestrator)
        });

        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                Self::failure(
                    StatusCode::GATEWAY_TIMEOUT,
                    "timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_error(&err);
                if failure.status.is_server_error() {
                    warn!(operation = operation_label, error = %failure.message, "operation failed");
                }
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    async fn status_or_not_found(&self, run_id: RunId) -> Result<RunStatusView, ServiceFailure> {
        let status = self
            .run_blocking("get_status", move |orchestrator| orchestrator.get_status(run_id))
            .await?;
        status.ok_or_else(|| {
            self.reject(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("run {run_id} not found"),
                None,
            )
        })
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "timeout" => return,
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "not_found" => &self.not_found_total,
            "version_conflict" | "run_closed" | "checkpoint_state" | "lease_lost" => {
                &self.conflict_total
            }
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/runs", post(run_create))
        .route("/v1/runs/:run_id/commit", post(run_commit))
        .route("/v1/runs/:run_id/status", get(run_status))
        .route("/v1/runs/:run_id/wait", get(run_wait))
        .route("/v1/runs/:run_id/abandon", post(run_abandon))
        .route(
            "/v1/runs/:run_id/checkpoints/:name/decision",
            post(checkpoint_decide),
        )
        .route("/v1/checkpoints/sweep", post(checkpoints_sweep))
        .route("/v1/queue/drain", post(queue_drain))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let state = ServiceState::new(
        args.db,
        config,
        Duration::from_millis(args.operation_timeout_ms),
    );
    state
        .run_blocking("migrate", |orchestrator| orchestrator.migrate())
        .await
        .map_err(|failure| anyhow::anyhow!("startup migration failed: {}", failure.message))?;

    if let Some(interval_ms) = args.maintenance_interval_ms {
        tokio::spawn(maintenance_loop(
            state.clone(),
            Duration::from_millis(interval_ms.max(100)),
        ));
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "hypothesis kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn maintenance_loop(state: ServiceState, interval: Duration) {
    let owner = default_owner("service");
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let pass_owner = owner.clone();
        let result = state
            .run_blocking("maintenance", move |orchestrator| {
                let swept = orchestrator.sweep_expired_checkpoints(None)?;
                let drained =
                    orchestrator.drain_all(&pass_owner, &LogTerminalEffect, MAINTENANCE_BATCH)?;
                Ok((swept.expired.len(), drained.len()))
            })
            .await;
        match result {
            Ok((0, 0)) => {}
            Ok((expired, drained)) => info!(expired, drained, "maintenance pass"),
            Err(failure) => warn!(code = failure.code, error = %failure.message, "maintenance pass failed"),
        }
    }
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        change_subscribers: state.notifier.sender.receiver_count(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn db_migrate(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<MigrateResponse>>, ServiceFailure> {
    state.run_blocking("migrate", |orchestrator| orchestrator.migrate()).await?;
    Ok(Json(envelope(MigrateResponse { migrated: true })))
}

async fn run_create(
    State(state): State<ServiceState>,
    payload: Result<Json<NewRun>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RunRecord>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let run = state
        .run_blocking("create_run", move |orchestrator| {
            orchestrator.create_run(&request)
        })
        .await?;
    Ok(Json(envelope(run)))
}

async fn run_commit(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
    payload: Result<Json<CommitBody>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<CommitOutcome>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let run_id = state.parse_run_id(&run_id)?;
    let expected_version = body.expected_version;
    let request = CommitRequest {
        run_id,
        change_id: body.change_id,
        patch: body.patch,
        history_entries: body.history_entries,
        expected_version,
    };
    let outcome = state
        .run_blocking("commit", move |orchestrator| orchestrator.commit(&request))
        .await?;

    match outcome.status {
        CommitStatus::Committed | CommitStatus::Duplicate => Ok(Json(envelope(outcome))),
        CommitStatus::NotFound => Err(state.reject(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("run {run_id} not found"),
            None,
        )),
        CommitStatus::VersionConflict => Err(state.reject(
            StatusCode::CONFLICT,
            "version_conflict",
            format!("run {run_id} is not at the expected version"),
            Some(json!({
                "expected_version": expected_version,
                "current_version": outcome.version,
            })),
        )),
    }
}

async fn run_status(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
) -> Result<Json<ServiceEnvelope<RunStatusView>>, ServiceFailure> {
    let run_id = state.parse_run_id(&run_id)?;
    let status = state.status_or_not_found(run_id).await?;
    Ok(Json(envelope(status)))
}

/// Long-poll: returns once the run moves past `after_version` or the wait times out.
async fn run_wait(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
    Query(params): Query<WaitParams>,
) -> Result<Json<ServiceEnvelope<WaitResponse>>, ServiceFailure> {
    let run_id = state.parse_run_id(&run_id)?;
    // Subscribe before reading so a commit between the read and the wait is not missed.
    let mut receiver = state.notifier.subscribe();
    let status = state.status_or_not_found(run_id).await?;
    if status.version > params.after_version {
        return Ok(Json(envelope(WaitResponse {
            changed: true,
            status,
        })));
    }

    let wait = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_WAIT_MS).min(MAX_WAIT_MS));
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Ok(change)) if change.run_id == run_id && change.version > params.after_version => {
                break
            }
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                debug!(run_id = %run_id, skipped, "change waiter lagged; re-reading status");
                break;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }

    let status = state.status_or_not_found(run_id).await?;
    Ok(Json(envelope(WaitResponse {
        changed: status.version > params.after_version,
        status,
    })))
}

async fn run_abandon(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
    payload: Result<Json<AbandonBody>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<CommitOutcome>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let run_id = state.parse_run_id(&run_id)?;
    let outcome = state
        .run_blocking("abandon", move |orchestrator| {
            orchestrator.abandon(run_id, &body.reason)
        })
        .await?;
    if outcome.status == CommitStatus::NotFound {
        return Err(state.reject(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("run {run_id} not found"),
            None,
        ));
    }
    Ok(Json(envelope(outcome)))
}

async fn checkpoint_decide(
    State(state): State<ServiceState>,
    Path((run_id, checkpoint_name)): Path<(String, String)>,
    payload: Result<Json<DecisionBody>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<DecideOutcome>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let run_id = state.parse_run_id(&run_id)?;
    let request = DecisionRequest {
        run_id,
        checkpoint_name,
        decision: body.decision,
        decided_by: body.decided_by,
        note: body.note,
    };
    let outcome = state
        .run_blocking("decide_checkpoint", move |orchestrator| {
            orchestrator.decide_checkpoint(&request)
        })
        .await?;
    if outcome.status == DecideStatus::NotFound {
        return Err(state.reject(
            StatusCode::NOT_FOUND,
            "not_found",
            format!(
                "checkpoint {} not found on run {run_id}",
                outcome.checkpoint_name
            ),
            None,
        ));
    }
    Ok(Json(envelope(outcome)))
}

async fn checkpoints_sweep(
    State(state): State<ServiceState>,
    payload: Result<Json<SweepBody>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SweepReport>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let report = state
        .run_blocking("sweep_checkpoints", move |orchestrator| {
            orchestrator.sweep_expired_checkpoints(body.limit)
        })
        .await?;
    Ok(Json(envelope(report)))
}

async fn queue_drain(
    State(state): State<ServiceState>,
    payload: Result<Json<DrainBody>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Vec<DrainReport>>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let owner = body.owner.unwrap_or_else(|| default_owner("service"));
    let max_items = body.max_items.unwrap_or(1).clamp(1, MAINTENANCE_BATCH);
    let reports = state
        .run_blocking("drain_queue", move |orchestrator| {
            if max_items == 1 {
                Ok(vec![orchestrator.drain_once(&owner, &LogTerminalEffect)?])
            } else {
                orchestrator.drain_all(&owner, &LogTerminalEffect, max_items)
            }
        })
        .await?;
    Ok(Json(envelope(reports)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    struct TempDb(PathBuf);

    impl TempDb {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!(
                "hypothesis-service-{}.sqlite3",
                ulid::Ulid::new()
            )))
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = self.0.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(PathBuf::from(path));
            }
        }
    }

    async fn migrated_state(db_path: &std::path::Path) -> ServiceState {
        let state = ServiceState::new(
            db_path.to_path_buf(),
            KernelConfig::default(),
            Duration::from_millis(2500),
        );
        if let Err(failure) = state.run_blocking("migrate", |orchestrator| orchestrator.migrate()).await {
            panic!("failed to migrate test db: {}", failure.message);
        }
        state
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(value.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    async fn create_run(router: &Router) -> String {
        let (status, value) = call(router, "POST", "/v1/runs", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK, "create failed: {value}");
        match value["data"]["run_id"].as_str() {
            Some(run_id) => run_id.to_string(),
            None => panic!("create response carries no run_id: {value}"),
        }
    }

    fn error_code(value: &Value) -> Option<&str> {
        value.get("error").and_then(|error| error.get("code")).and_then(Value::as_str)
    }

    #[tokio::test]
    async fn temp_db_is_removed_when_the_test_unwinds() {
        let db = TempDb::new();
        let path = db.0.clone();
        let _ = migrated_state(&db.0).await;
        assert!(path.exists());

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = db;
            panic!("assertion failed mid-test");
        }));
        assert!(outcome.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db = TempDb::new();
        let router = app(migrated_state(&db.0).await);

        let (status, value) = call(&router, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["status"], json!("ok"));
    }

    #[tokio::test]
    async fn commit_status_and_audience_pivot_round_trip() {
        let db = TempDb::new();
        let router = app(migrated_state(&db.0).await);
        let run_id = create_run(&router).await;

        let (status, value) = call(
            &router,
            "POST",
            &format!("/v1/runs/{run_id}/commit"),
            Some(json!({
                "change_id": "interviews",
                "patch": {"discovery": {"interviews_completed": 6, "problem_confirmed_ratio": 0.5}},
                "expected_version": 0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "commit failed: {value}");
        assert_eq!(value["data"]["opened_checkpoint"], json!("discovery_review"));

        let (status, value) = call(
            &router,
            "POST",
            &format!("/v1/runs/{run_id}/checkpoints/discovery_review/decision"),
            Some(json!({"decision": "approve", "decided_by": "founder"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "decide failed: {value}");
        assert_eq!(value["data"]["status"], json!("resumed"));

        let (status, value) = call(
            &router,
            "POST",
            &format!("/v1/runs/{run_id}/commit"),
            Some(json!({
                "change_id": "resonance",
                "patch": {"desirability": {"problem_resonance": 0.2}}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "commit failed: {value}");
        assert_eq!(value["data"]["decision"]["decision"], json!("pivot"));
        assert_eq!(value["data"]["decision"]["kind"], json!("audience_mismatch"));

        let (status, value) = call(&router, "GET", &format!("/v1/runs/{run_id}/status"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["current_phase"], json!("discovery"));
        assert_eq!(value["data"]["summary"]["pivot_count"], json!(1));
    }

    #[tokio::test]
    async fn stale_commit_maps_to_version_conflict() {
        let db = TempDb::new();
        let router = app(migrated_state(&db.0).await);
        let run_id = create_run(&router).await;

        let uri = format!("/v1/runs/{run_id}/commit");
        let (status, _) = call(
            &router,
            "POST",
            &uri,
            Some(json!({"change_id": "first", "patch": {"discovery": {"interviews_completed": 1}}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, value) = call(
            &router,
            "POST",
            &uri,
            Some(json!({
                "change_id": "second",
                "patch": {"discovery": {"interviews_completed": 2}},
                "expected_version": 0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&value), Some("version_conflict"));
        assert_eq!(value["error"]["details"]["current_version"], json!(1));
    }

    #[tokio::test]
    async fn unknown_and_malformed_runs_are_rejected() {
        let db = TempDb::new();
        let router = app(migrated_state(&db.0).await);

        let missing = ulid::Ulid::new().to_string();
        let (status, value) = call(&router, "GET", &format!("/v1/runs/{missing}/status"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&value), Some("not_found"));

        let (status, value) = call(&router, "GET", "/v1/runs/not-a-ulid/status", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&value), Some("validation_error"));

        let (status, value) = call(
            &router,
            "POST",
            &format!("/v1/runs/{missing}/commit"),
            Some(json!({"patch": {}})),
        )
        .await;
        assert!(status.is_client_error());
        assert_eq!(error_code(&value), Some("invalid_json"));
    }

    #[tokio::test]
    async fn abandoned_run_rejects_new_deltas() {
        let db = TempDb::new();
        let router = app(migrated_state(&db.0).await);
        let run_id = create_run(&router).await;

        let (status, value) = call(
            &router,
            "POST",
            &format!("/v1/runs/{run_id}/abandon"),
            Some(json!({"reason": "market closed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["run_status"], json!("failed"));

        let (status, value) = call(
            &router,
            "POST",
            &format!("/v1/runs/{run_id}/commit"),
            Some(json!({"change_id": "late", "patch": {"discovery": {"interviews_completed": 3}}})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&value), Some("run_closed"));
    }

    #[tokio::test]
    async fn wait_returns_immediately_for_newer_versions_and_times_out_otherwise() {
        let db = TempDb::new();
        let router = app(migrated_state(&db.0).await);
        let run_id = create_run(&router).await;

        let (status, value) = call(
            &router,
            "GET",
            &format!("/v1/runs/{run_id}/wait?after_version=0&timeout_ms=50"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["changed"], json!(false));

        let (status, _) = call(
            &router,
            "POST",
            &format!("/v1/runs/{run_id}/commit"),
            Some(json!({"change_id": "c1", "patch": {"discovery": {"interviews_completed": 1}}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, value) = call(
            &router,
            "GET",
            &format!("/v1/runs/{run_id}/wait?after_version=0"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["changed"], json!(true));
        assert_eq!(value["data"]["status"]["version"], json!(1));
    }

    #[tokio::test]
    async fn committed_changes_reach_subscribers() {
        let db = TempDb::new();
        let state = migrated_state(&db.0).await;
        let mut receiver = state.notifier.subscribe();
        let router = app(state);
        let run_id = create_run(&router).await;

        let created = match receiver.recv().await {
            Ok(change) => change,
            Err(err) => panic!("expected a change for the new run: {err}"),
        };
        assert_eq!(created.run_id.to_string(), run_id);
        assert_eq!(created.version, 0);

        let (status, _) = call(
            &router,
            "POST",
            &format!("/v1/runs/{run_id}/commit"),
            Some(json!({"change_id": "c1", "patch": {"discovery": {"interviews_completed": 2}}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let committed = match receiver.recv().await {
            Ok(change) => change,
            Err(err) => panic!("expected a change for the commit: {err}"),
        };
        assert_eq!(committed.version, 1);
    }

    #[tokio::test]
    async fn drain_and_sweep_endpoints_report_idle_queues() {
        let db = TempDb::new();
        let router = app(migrated_state(&db.0).await);

        let (status, value) = call(&router, "POST", "/v1/queue/drain", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"][0]["outcome"], json!("idle"));

        let (status, value) =
            call(&router, "POST", "/v1/checkpoints/sweep", Some(json!({"limit": 10}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["scanned"], json!(0));

        let (status, value) = call(&router, "POST", "/v1/db/migrate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["migrated"], json!(true));
    }
}
