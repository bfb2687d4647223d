use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use execution_authority_backend::{BackendClient, BackendError, CircuitState, DependencyHealth};
use execution_authority_core::{
    AcceptRequest, AcceptanceKind, AuthorityError, ExecutionFilter, ExecutionId, ExecutionPage,
    ExecutionRecord, ExecutionStatus, FieldError, Lineage, PageRequest, SpanId, ValidateRequest,
    ValidationOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::authority::ExecutionAuthority;
use crate::correlation;

pub const SERVICE_CONTRACT_VERSION: &str = "authority.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const INTERNAL_ERROR_MESSAGE: &str =
    "internal error; quote the correlation id when reporting this failure";

#[derive(Debug, Clone)]
pub struct ServiceState {
    pub authority: ExecutionAuthority,
    pub backend: Arc<BackendClient>,
    pub operation_timeout: Duration,
    pub telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    #[serde(flatten)]
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
    correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceFailure {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

/// How long a request waits on its blocking task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    /// Answer 504 once `operation_timeout` elapses.
    Bounded,
    /// Await the task until it finishes.
    RunToCompletion,
}

#[derive(Debug, Clone, Serialize)]
struct AcceptResponse {
    execution_id: ExecutionId,
    accepted: bool,
    authority_signature: String,
    root_span_id: SpanId,
    lineage: Lineage,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    idempotent_replay: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListParams {
    caller_id: Option<String>,
    org_id: Option<String>,
    status: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct VectorResponse {
    operation: &'static str,
    result: Value,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    circuit_state: CircuitState,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessChecks {
    current_schema_version: i64,
    target_schema_version: i64,
    pending_migrations: usize,
    constraints_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: ReadinessChecks,
}

#[derive(Debug, Clone, Serialize)]
struct DependencyReadiness {
    status: &'static str,
    #[serde(flatten)]
    health: DependencyHealth,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
pub struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    contract_violation_total: AtomicU64,
    not_found_total: AtomicU64,
    service_unavailable_total: AtomicU64,
    upstream_error_total: AtomicU64,
    internal_error_total: AtomicU64,
    accept_minted_total: AtomicU64,
    accept_replayed_total: AtomicU64,
    breaker_rejections_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
pub struct ServiceTelemetrySnapshot {
    pub requests_total: u64,
    pub requests_success_total: u64,
    pub requests_failure_total: u64,
    pub timeout_total: u64,
    pub invalid_json_total: u64,
    pub validation_error_total: u64,
    pub contract_violation_total: u64,
    pub not_found_total: u64,
    pub service_unavailable_total: u64,
    pub upstream_error_total: u64,
    pub internal_error_total: u64,
    pub accept_minted_total: u64,
    pub accept_replayed_total: u64,
    pub breaker_rejections_total: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
                correlation_id: correlation::current(),
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceFailure {
    fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self { status, code, message: message.into(), details }
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", INTERNAL_ERROR_MESSAGE, None)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message, None)
    }

    fn validation(errors: &[FieldError]) -> Self {
        let message = errors
            .iter()
            .map(|error| error.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Self::new(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("validation failed: {message}"),
            Some(json!({ "fields": errors })),
        )
    }

    /// Maps request-parsing errors; anything else is an internal failure.
    fn from_authority_error(err: &AuthorityError) -> Self {
        match err {
            AuthorityError::Validation(errors) => Self::validation(errors),
            AuthorityError::ContractViolation(issues) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "contract_violation",
                "request body does not match the contract",
                Some(json!({ "issues": issues })),
            ),
            _ => Self::internal(),
        }
    }

    fn from_backend_error(err: &BackendError) -> Self {
        match err {
            BackendError::CircuitOpen { retry_after_ms } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "vector backend is temporarily unavailable",
                Some(json!({ "retry_after_ms": retry_after_ms })),
            ),
            BackendError::Upstream { status, .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                err.to_string(),
                Some(json!({ "upstream_status": status })),
            ),
            BackendError::Timeout => Self::new(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                err.to_string(),
                Some(json!({ "reason": "timeout" })),
            ),
            BackendError::Transport(_) | BackendError::Decode(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "upstream_error", err.to_string(), None)
            }
        }
    }
}

impl ServiceState {
    #[must_use]
    pub fn new(
        authority: ExecutionAuthority,
        backend: Arc<BackendClient>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            authority,
            backend,
            operation_timeout,
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn reject(&self, failure: ServiceFailure) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure(failure.code, false);
        failure
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.reject(ServiceFailure::new(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        ))
    }

    fn parse_failure(&self, err: &AuthorityError) -> ServiceFailure {
        self.reject(ServiceFailure::from_authority_error(err))
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ExecutionAuthority) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_authority(operation_label, Deadline::Bounded, op).await
    }

    /// Acceptance and validation wait for the store to commit or fail.
    async fn run_to_completion<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ExecutionAuthority) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_authority(operation_label, Deadline::RunToCompletion, op).await
    }

    async fn run_authority<T, F>(
        &self,
        operation_label: &'static str,
        deadline: Deadline,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ExecutionAuthority) -> anyhow::Result<T> + Send + 'static,
    {
        let authority = self.authority.clone();
        match self.join_blocking(operation_label, deadline, move || op(authority)).await? {
            Ok(value) => self.succeed(value),
            Err(err) => {
                let failure = match err.downcast_ref::<AuthorityError>() {
                    Some(AuthorityError::CorruptRecord(execution_id)) => {
                        tracing::error!(
                            operation = operation_label,
                            execution_id = %execution_id,
                            "stored record failed signature recomputation"
                        );
                        ServiceFailure::internal()
                    }
                    Some(
                        authority_err @ (AuthorityError::Validation(_)
                        | AuthorityError::ContractViolation(_)),
                    ) => ServiceFailure::from_authority_error(authority_err),
                    _ => {
                        tracing::error!(
                            operation = operation_label,
                            error = %format!("{err:#}"),
                            "operation failed"
                        );
                        ServiceFailure::internal()
                    }
                };
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    async fn run_vector<F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<Value, ServiceFailure>
    where
        F: FnOnce(&BackendClient) -> Result<Value, BackendError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        match self.join_blocking(operation_label, Deadline::Bounded, move || op(&backend)).await? {
            Ok(value) => self.succeed(value),
            Err(err) => {
                if matches!(err, BackendError::CircuitOpen { .. }) {
                    self.telemetry.breaker_rejections_total.fetch_add(1, Ordering::Relaxed);
                }
                let failure = ServiceFailure::from_backend_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    fn succeed<T>(&self, value: T) -> Result<T, ServiceFailure> {
        self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn join_blocking<R, F>(
        &self,
        operation_label: &'static str,
        deadline: Deadline,
        op: F,
    ) -> Result<R, ServiceFailure>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::task::spawn_blocking(op);
        let join_result = match deadline {
            Deadline::RunToCompletion => handle.await,
            Deadline::Bounded => {
                tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                    self.telemetry.record_failure("timeout", true);
                    tracing::warn!(
                        operation = operation_label,
                        timeout_ms = self.timeout_ms(),
                        "operation timed out"
                    );
                    ServiceFailure::new(
                        StatusCode::GATEWAY_TIMEOUT,
                        "timeout",
                        format!("{operation_label} timed out after {} ms", self.timeout_ms()),
                        Some(json!({ "timeout_ms": self.timeout_ms() })),
                    )
                })?
            }
        };

        join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            tracing::error!(operation = operation_label, error = %err, "blocking task failed");
            ServiceFailure::internal()
        })
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "contract_violation" => &self.contract_violation_total,
            "not_found" => &self.not_found_total,
            "service_unavailable" => &self.service_unavailable_total,
            "upstream_error" => &self.upstream_error_total,
            "timeout" => return,
            _ => &self.internal_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_accept(&self, idempotent_replay: bool) {
        let counter =
            if idempotent_replay { &self.accept_replayed_total } else { &self.accept_minted_total };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            contract_violation_total: self.contract_violation_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            service_unavailable_total: self.service_unavailable_total.load(Ordering::Relaxed),
            upstream_error_total: self.upstream_error_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            accept_minted_total: self.accept_minted_total.load(Ordering::Relaxed),
            accept_replayed_total: self.accept_replayed_total.load(Ordering::Relaxed),
            breaker_rejections_total: self.breaker_rejections_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

pub fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/ready/dependencies", get(ready_dependencies))
        .route("/v1/openapi", get(openapi))
        .route("/v1/executions", post(accept_standard).get(list_executions))
        .route("/v1/executions/validate", post(validate_execution))
        .route("/v1/executions/:execution_id", get(show_execution))
        .route("/v1/authority/mint", post(authority_mint))
        .route("/v1/vectors/insert", post(vector_insert))
        .route("/v1/vectors/query", post(vector_query))
        .route("/v1/vectors/query/filtered", post(vector_query_filtered))
        .layer(axum::middleware::from_fn(correlation::propagate))
        .with_state(state)
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms: state.timeout_ms(),
        circuit_state: state.backend.breaker().state(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let (schema_status, constraints) = state
        .run_blocking("schema_status", |authority| {
            Ok((authority.schema_status()?, authority.verify_constraints()?))
        })
        .await?;

    let checks = ReadinessChecks {
        current_schema_version: schema_status.current_version,
        target_schema_version: schema_status.target_version,
        pending_migrations: schema_status.pending_versions.len(),
        constraints_complete: constraints.is_complete(),
    };

    if schema_status.is_current() && checks.constraints_complete {
        return Ok(Json(envelope(ReadinessResponse { status: "ready", checks })));
    }

    state.telemetry.record_failure("service_unavailable", false);
    Err(ServiceFailure::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "service_unavailable",
        "ledger schema is not ready",
        Some(json!({
            "current_version": schema_status.current_version,
            "target_version": schema_status.target_version,
            "pending_versions": schema_status.pending_versions,
            "missing_constraints": constraints.missing(),
        })),
    ))
}

async fn ready_dependencies(State(state): State<ServiceState>) -> Response {
    let backend = Arc::clone(&state.backend);
    let health = match tokio::task::spawn_blocking(move || backend.health()).await {
        Ok(health) => health,
        Err(err) => {
            tracing::error!(error = %err, "dependency probe task failed");
            let snapshot = state.backend.breaker().snapshot();
            DependencyHealth {
                ready: false,
                connected: false,
                circuit_state: snapshot.state,
                consecutive_failures: snapshot.consecutive_failures,
            }
        }
    };

    let (status_code, status) = if health.ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (status_code, Json(envelope(DependencyReadiness { status, health }))).into_response()
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn accept_standard(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<AcceptResponse>>), ServiceFailure> {
    accept(&state, AcceptanceKind::Standard, payload).await
}

async fn authority_mint(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<AcceptResponse>>), ServiceFailure> {
    accept(&state, AcceptanceKind::AuthorityMint, payload).await
}

async fn accept(
    state: &ServiceState,
    kind: AcceptanceKind,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<AcceptResponse>>), ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let request = AcceptRequest::parse(kind, &body).map_err(|err| state.parse_failure(&err))?;

    let outcome = state
        .run_to_completion("accept", move |authority| authority.accept(&request))
        .await?;
    state.telemetry.record_accept(outcome.idempotent_replay);
    tracing::info!(
        execution_id = %outcome.record.execution_id,
        idempotent_replay = outcome.idempotent_replay,
        "execution accepted"
    );

    let status = match (kind, outcome.idempotent_replay) {
        (AcceptanceKind::Standard, false) => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    let record = outcome.record;
    Ok((
        status,
        Json(envelope(AcceptResponse {
            execution_id: record.execution_id,
            accepted: record.accepted,
            authority_signature: record.authority_signature,
            root_span_id: record.root_span_id,
            lineage: record.lineage,
            created_at: record.created_at,
            idempotent_replay: outcome.idempotent_replay,
        })),
    ))
}

async fn show_execution(
    State(state): State<ServiceState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ExecutionRecord>>, ServiceFailure> {
    let lookup_id = execution_id.clone();
    let record = state
        .run_blocking("show_execution", move |authority| authority.get(&lookup_id))
        .await?;
    match record {
        Some(record) => Ok(Json(envelope(record))),
        None => {
            state.telemetry.record_failure("not_found", false);
            Err(ServiceFailure::not_found(format!("execution {execution_id} not found")))
        }
    }
}

async fn list_executions(
    State(state): State<ServiceState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<ExecutionPage>>, ServiceFailure> {
    let Query(params) = params.map_err(|rejection| {
        state.reject(ServiceFailure::validation(&[FieldError::new("query", rejection.body_text())]))
    })?;
    let (filter, page) = parse_list_params(params).map_err(|errors| {
        state.reject(ServiceFailure::validation(&errors))
    })?;

    let listing = state
        .run_blocking("list_executions", move |authority| authority.list(&filter, page))
        .await?;
    Ok(Json(envelope(listing)))
}

fn parse_list_params(
    params: ListParams,
) -> Result<(ExecutionFilter, PageRequest), Vec<FieldError>> {
    let mut errors = Vec::new();
    let status = match params.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => {
            let parsed = ExecutionStatus::parse(raw);
            if parsed.is_none() {
                errors.push(FieldError::new("status", "status must be one of: accepted, rejected"));
            }
            parsed
        }
    };
    let limit = parse_number::<u32>("limit", params.limit.as_deref(), &mut errors);
    let offset = parse_number::<u64>("offset", params.offset.as_deref(), &mut errors);

    if !errors.is_empty() {
        return Err(errors);
    }

    let filter = ExecutionFilter {
        caller_id: non_blank(params.caller_id),
        org_id: non_blank(params.org_id),
        status,
    };
    Ok((filter, PageRequest::new(limit, offset)))
}

fn parse_number<T>(field: &str, raw: Option<&str>, errors: &mut Vec<FieldError>) -> Option<T>
where
    T: std::str::FromStr,
{
    let raw = raw.map(str::trim).filter(|value| !value.is_empty())?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            errors.push(FieldError::new(field, format!("{field} must be a non-negative integer")));
            None
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|raw| raw.trim().to_string()).filter(|raw| !raw.is_empty())
}

async fn validate_execution(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ValidationOutcome>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let request = ValidateRequest::parse(&body).map_err(|err| state.parse_failure(&err))?;
    let outcome = state
        .run_to_completion("validate_execution", move |authority| {
            authority.validate(&request)
        })
        .await?;
    Ok(Json(envelope(outcome)))
}

async fn vector_insert(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<VectorResponse>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let result = state.run_vector("vector_insert", move |backend| backend.insert(&body)).await?;
    Ok(Json(envelope(VectorResponse { operation: "insert", result })))
}

async fn vector_query(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<VectorResponse>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let result = state
        .run_vector("vector_query", move |backend| backend.similarity_query(&body))
        .await?;
    Ok(Json(envelope(VectorResponse { operation: "similarity_query", result })))
}

async fn vector_query_filtered(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<VectorResponse>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let result = state
        .run_vector("vector_query_filtered", move |backend| backend.filtered_query(&body))
        .await?;
    Ok(Json(envelope(VectorResponse { operation: "filtered_query", result })))
}
