//! Administrative accessors and the HTTP surface over them
//!
//! Every mutation is applied to the live registry or rule table first and
//! then written through to the repository, so the running gateway never
//! waits on storage to change behaviour.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router as HttpRouter,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use chrono::{DateTime, Utc};
use smsc_core::{
    Address, DependencyStatus, HealthStatus, Message, MessageId, OperatorId, OperatorRecord,
    OperatorStatus, Priority, ReadinessStatus, Result, RoutingRule, SmscError,
};
use smsc_sigtran::{RemoteState, SigtranStack};
use smsc_store::Repository;
use smsc_telemetry::Exposition;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::dispatcher::{Dispatcher, TransportFactory};
use crate::gateway::Gateway;
use crate::queue::{DeliveryQueue, QueueStats};
use crate::registry::{OperatorLoad, OperatorRegistry};
use crate::routing::Router;
use crate::smpp::{SmppServer, SubmitError};

pub const SERVICE_ID: &str = "smsc";

/// Largest page the message listing returns
pub const MAX_PAGE: usize = 500;

/// Client id stamped on messages submitted over HTTP
const HTTP_CLIENT: &str = "admin-api";

#[derive(Debug, Clone, Serialize)]
pub struct SmppStatus {
    pub active_sessions: u64,
    pub total_connections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteStatus {
    pub name: String,
    pub state: RemoteState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub health: HealthStatus,
    pub smpp: Option<SmppStatus>,
    pub sigtran: Vec<RemoteStatus>,
    pub queue: QueueStats,
    pub operators: Vec<OperatorLoad>,
}

/// Message submitted over HTTP. Text that is not plain ASCII is sent as UCS2.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub source: String,
    pub destination: String,
    pub text: String,
    #[serde(default)]
    pub registered_delivery: bool,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub validity_secs: Option<u64>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl SubmitRequest {
    fn into_message(self) -> Result<Message> {
        if self.destination.is_empty() || !self.destination.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SmscError::Validation(format!("bad destination '{}'", self.destination)));
        }
        if self.text.is_empty() {
            return Err(SmscError::Validation("empty message text".to_string()));
        }
        let (content, data_coding) = if self.text.is_ascii() {
            (self.text.into_bytes(), 0x00)
        } else {
            let ucs2: Vec<u8> = self.text.encode_utf16().flat_map(u16::to_be_bytes).collect();
            (ucs2, 0x08)
        };

        let mut message = Message::new(
            Address::international(self.source),
            Address::international(self.destination),
            content,
        );
        message.data_coding = data_coding;
        message.client_id = Some(HTTP_CLIENT.to_string());
        message.registered_delivery = u8::from(self.registered_delivery);
        if let Some(priority) = self.priority {
            message.priority = priority;
        }
        if let Some(validity) = self.validity_secs {
            message.validity_secs = validity;
        }
        message.scheduled_at = self.scheduled_at;
        Ok(message)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub offset: usize,
    pub limit: usize,
    pub messages: Vec<Message>,
}

pub struct Admin {
    registry: Arc<OperatorRegistry>,
    router: Arc<Router>,
    gateway: Arc<Gateway>,
    queue: DeliveryQueue,
    dispatcher: Arc<Dispatcher>,
    transports: Arc<TransportFactory>,
    repository: Arc<dyn Repository>,
    smpp: Option<Arc<SmppServer>>,
    sigtran: Option<Arc<SigtranStack>>,
    started_at: Instant,
}

impl Admin {
    pub fn new(
        registry: Arc<OperatorRegistry>,
        router: Arc<Router>,
        gateway: Arc<Gateway>,
        dispatcher: Arc<Dispatcher>,
        transports: Arc<TransportFactory>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self {
            registry,
            router,
            queue: gateway.queue().clone(),
            gateway,
            dispatcher,
            transports,
            repository,
            smpp: None,
            sigtran: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_smpp(mut self, server: Arc<SmppServer>) -> Self {
        self.smpp = Some(server);
        self
    }

    pub fn with_sigtran(mut self, stack: Arc<SigtranStack>) -> Self {
        self.sigtran = Some(stack);
        self
    }

    // Operators

    pub fn list_operators(&self) -> Vec<OperatorRecord> {
        self.registry.list()
    }

    pub async fn add_operator(&self, record: OperatorRecord) -> Result<OperatorRecord> {
        self.registry.add(record.clone())?;
        if let Err(e) = self.repository.save_operator(&record).await {
            // Keep memory and storage in step
            let _ = self.registry.remove(&record.id);
            return Err(e.into());
        }
        self.transports.rebind(&self.dispatcher, &record).await;
        Ok(record)
    }

    pub async fn update_operator(&self, record: OperatorRecord) -> Result<OperatorRecord> {
        let previous = self
            .registry
            .get(&record.id)
            .map(|entry| entry.record())
            .ok_or_else(|| SmscError::NotFound(format!("operator {}", record.id)))?;
        self.registry.update(record.clone())?;
        self.repository.save_operator(&record).await?;
        if previous.transport != record.transport {
            self.transports.rebind(&self.dispatcher, &record).await;
        }
        Ok(record)
    }

    /// Refused while routing rules still point at the operator
    pub async fn remove_operator(&self, id: &OperatorId) -> Result<OperatorRecord> {
        let referencing: Vec<String> = self.router.rules_for(id).into_iter().map(|r| r.id).collect();
        if !referencing.is_empty() {
            return Err(SmscError::Validation(format!(
                "operator {} is used by rules {}",
                id,
                referencing.join(", ")
            )));
        }
        let removed = self.registry.remove(id)?;
        if let Some(transport) = self.dispatcher.unbind(id) {
            transport.close().await;
        }
        self.repository.delete_operator(id).await?;
        Ok(removed)
    }

    pub async fn set_operator_status(&self, id: &OperatorId, status: OperatorStatus) -> Result<OperatorRecord> {
        self.registry.set_status(id, status)?;
        let record = self
            .registry
            .get(id)
            .map(|entry| entry.record())
            .ok_or_else(|| SmscError::NotFound(format!("operator {}", id)))?;
        self.repository.save_operator(&record).await?;
        Ok(record)
    }

    pub fn get_operator_load(&self, id: &OperatorId) -> Result<OperatorLoad> {
        self.registry
            .loads()
            .into_iter()
            .find(|load| &load.id == id)
            .ok_or_else(|| SmscError::NotFound(format!("operator {}", id)))
    }

    // Rules

    pub fn list_rules(&self) -> Vec<RoutingRule> {
        self.router.list_rules()
    }

    pub async fn add_rule(&self, rule: RoutingRule) -> Result<RoutingRule> {
        self.router.add_rule(rule.clone())?;
        self.repository.save_rule(&rule).await?;
        Ok(rule)
    }

    pub async fn update_rule(&self, rule: RoutingRule) -> Result<RoutingRule> {
        self.router.update_rule(rule.clone())?;
        self.repository.save_rule(&rule).await?;
        Ok(rule)
    }

    pub async fn remove_rule(&self, id: &str) -> Result<RoutingRule> {
        let removed = self.router.remove_rule(id)?;
        self.repository.delete_rule(id).await?;
        Ok(removed)
    }

    // Queue and messages

    pub fn get_queue_size(&self, id: &OperatorId) -> Result<usize> {
        self.queue
            .queue_size(id)
            .ok_or_else(|| SmscError::NotFound(format!("operator {}", id)))
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Route and queue one message exactly as an SMPP `submit_sm` would be
    pub fn submit_message(&self, request: SubmitRequest) -> Result<MessageId> {
        let message = request.into_message()?;
        let destination = message.destination.digits.clone();
        self.gateway.accept(message).map_err(|e| match e {
            SubmitError::NoRoute => SmscError::Validation(format!("no route for {}", destination)),
            SubmitError::Backpressure => SmscError::Backpressure(format!("queue full for {}", destination)),
            SubmitError::Unavailable => SmscError::Unavailable("delivery queue".to_string()),
        })
    }

    pub async fn list_messages(&self, page: Page) -> Result<MessagePage> {
        let limit = page.limit.clamp(1, MAX_PAGE);
        let messages = self.repository.list_messages(page.offset, limit).await?;
        Ok(MessagePage {
            offset: page.offset,
            limit,
            messages,
        })
    }

    /// Live state while the queue holds the message, stored state after
    pub async fn message_status(&self, id: &MessageId) -> Result<Message> {
        if let Some(message) = self.queue.message(id) {
            return Ok(message);
        }
        self.repository
            .get_message(id)
            .await?
            .ok_or_else(|| SmscError::NotFound(format!("message {}", id)))
    }

    // Probes

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: SERVICE_ID.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Ready when storage answers and at least one operator has a transport
    pub async fn ready(&self) -> ReadinessStatus {
        let started = Instant::now();
        let store_ok = self.repository.is_healthy().await;
        let mut dependencies = vec![DependencyStatus {
            name: "store".to_string(),
            available: store_ok,
            latency_ms: Some(started.elapsed().as_millis() as u64),
        }];

        let bound = self
            .registry
            .list()
            .iter()
            .filter(|op| self.dispatcher.is_bound(&op.id))
            .count();
        dependencies.push(DependencyStatus {
            name: "operators".to_string(),
            available: bound > 0,
            latency_ms: None,
        });

        if let Some(stack) = &self.sigtran {
            for (name, state) in stack.remote_states() {
                dependencies.push(DependencyStatus {
                    name: format!("sigtran:{}", name),
                    available: state == RemoteState::Active,
                    latency_ms: None,
                });
            }
        }

        ReadinessStatus {
            ready: store_ok && bound > 0,
            dependencies,
        }
    }

    /// Every counter the gateway keeps, in text exposition form
    pub fn metrics(&self) -> String {
        let mut out = Exposition::new();
        out.gauge(
            "smsc_uptime_seconds",
            "Seconds since the service started",
            self.started_at.elapsed().as_secs(),
        );
        self.queue.export_metrics(&mut out);
        if let Some(server) = &self.smpp {
            server.export_metrics(&mut out);
        }
        if let Some(stack) = &self.sigtran {
            let states = stack.remote_states();
            out.labeled_gauge(
                "sigtran_remote_active",
                "1 while the remote ASP is active",
                "remote",
                states
                    .iter()
                    .map(|(name, state)| (name.as_str(), u64::from(*state == RemoteState::Active))),
            );
        }
        out.finish()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            health: self.health(),
            smpp: self.smpp.as_ref().map(|server| SmppStatus {
                active_sessions: server.active_sessions(),
                total_connections: server.total_connections(),
            }),
            sigtran: self
                .sigtran
                .as_ref()
                .map(|stack| {
                    stack
                        .remote_states()
                        .into_iter()
                        .map(|(name, state)| RemoteStatus { name, state })
                        .collect()
                })
                .unwrap_or_default(),
            queue: self.queue.stats(),
            operators: self.registry.loads(),
        }
    }
}

/// `SmscError` as an HTTP response
pub struct ApiError(pub SmscError);

impl From<SmscError> for ApiError {
    fn from(err: SmscError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = if status.is_server_error() {
            error!(error = %self.0, "Admin request failed");
            match &self.0 {
                SmscError::Unavailable(_) | SmscError::Timeout(_) => self.0.to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.0.to_string()
        };
        let body = Json(json!({
            "error": message,
            "code": self.0.error_code(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: OperatorStatus,
}

pub fn routes(admin: Arc<Admin>) -> HttpRouter {
    HttpRouter::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/queue", get(queue_stats))
        .route("/operators", get(list_operators).post(add_operator))
        .route(
            "/operators/{id}",
            put(update_operator).delete(remove_operator),
        )
        .route("/operators/{id}/status", put(set_operator_status))
        .route("/operators/{id}/load", get(operator_load))
        .route("/rules", get(list_rules).post(add_rule))
        .route("/rules/{id}", put(update_rule).delete(remove_rule))
        .route("/messages", get(list_messages).post(submit_message))
        .route("/messages/{id}", get(message_status))
        .route("/metrics", get(metrics))
        .with_state(admin)
}

async fn health(State(admin): State<Arc<Admin>>) -> Json<HealthStatus> {
    Json(admin.health())
}

async fn ready(State(admin): State<Arc<Admin>>) -> (StatusCode, Json<ReadinessStatus>) {
    let readiness = admin.ready().await;
    let code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness))
}

async fn status(State(admin): State<Arc<Admin>>) -> Json<StatusReport> {
    Json(admin.status())
}

async fn queue_stats(State(admin): State<Arc<Admin>>) -> Json<QueueStats> {
    Json(admin.queue_stats())
}

async fn list_operators(State(admin): State<Arc<Admin>>) -> Json<Vec<OperatorRecord>> {
    Json(admin.list_operators())
}

async fn add_operator(
    State(admin): State<Arc<Admin>>,
    Json(record): Json<OperatorRecord>,
) -> std::result::Result<(StatusCode, Json<OperatorRecord>), ApiError> {
    let record = admin.add_operator(record).await?;
    info!(operator = %record.id, "Operator added via admin API");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_operator(
    State(admin): State<Arc<Admin>>,
    Path(id): Path<String>,
    Json(record): Json<OperatorRecord>,
) -> ApiResult<OperatorRecord> {
    if record.id.as_str() != id {
        return Err(SmscError::Validation(format!("body id {} does not match path {}", record.id, id)).into());
    }
    Ok(Json(admin.update_operator(record).await?))
}

async fn remove_operator(
    State(admin): State<Arc<Admin>>,
    Path(id): Path<String>,
) -> ApiResult<OperatorRecord> {
    Ok(Json(admin.remove_operator(&OperatorId::new(id)).await?))
}

async fn set_operator_status(
    State(admin): State<Arc<Admin>>,
    Path(id): Path<String>,
    Json(change): Json<StatusChange>,
) -> ApiResult<OperatorRecord> {
    Ok(Json(
        admin
            .set_operator_status(&OperatorId::new(id), change.status)
            .await?,
    ))
}

async fn operator_load(
    State(admin): State<Arc<Admin>>,
    Path(id): Path<String>,
) -> ApiResult<OperatorLoad> {
    Ok(Json(admin.get_operator_load(&OperatorId::new(id))?))
}

async fn list_rules(State(admin): State<Arc<Admin>>) -> Json<Vec<RoutingRule>> {
    Json(admin.list_rules())
}

async fn add_rule(
    State(admin): State<Arc<Admin>>,
    Json(rule): Json<RoutingRule>,
) -> std::result::Result<(StatusCode, Json<RoutingRule>), ApiError> {
    let rule = admin.add_rule(rule).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(admin): State<Arc<Admin>>,
    Path(id): Path<String>,
    Json(rule): Json<RoutingRule>,
) -> ApiResult<RoutingRule> {
    if rule.id != id {
        return Err(SmscError::Validation(format!("body id {} does not match path {}", rule.id, id)).into());
    }
    Ok(Json(admin.update_rule(rule).await?))
}

async fn remove_rule(
    State(admin): State<Arc<Admin>>,
    Path(id): Path<String>,
) -> ApiResult<RoutingRule> {
    Ok(Json(admin.remove_rule(&id).await?))
}

async fn submit_message(
    State(admin): State<Arc<Admin>>,
    Json(request): Json<SubmitRequest>,
) -> std::result::Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let id = admin.submit_message(request)?;
    info!(message_id = %id, "Message submitted via admin API");
    Ok((StatusCode::ACCEPTED, Json(json!({ "message_id": id }))))
}

async fn list_messages(
    State(admin): State<Arc<Admin>>,
    Query(page): Query<Page>,
) -> ApiResult<MessagePage> {
    Ok(Json(admin.list_messages(page).await?))
}

async fn metrics(State(admin): State<Arc<Admin>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        admin.metrics(),
    )
}

async fn message_status(
    State(admin): State<Arc<Admin>>,
    Path(id): Path<String>,
) -> ApiResult<Message> {
    match admin.message_status(&MessageId(id)).await {
        Ok(message) => Ok(Json(message)),
        Err(e) => {
            if !matches!(e, SmscError::NotFound(_)) {
                warn!(error = %e, "Message lookup failed");
            }
            Err(e.into())
        }
    }
}
