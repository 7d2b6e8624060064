//! HTTP route handlers for fsk-daemon.
//!
//! `build_router` is public so integration tests can drive the router
//! in-process without binding a TCP port.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use fsk_compliance::ComplianceError;
use fsk_schemas::{CompletedOrder, SecretString, SettingsPatch};
use futures_util::stream::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::api_types::{
    ErrorResponse, HealthResponse, OrderAcceptedResponse, OrderAuditResponse, QueueResponse,
    RecoverResponse, StatusResponse, UploadQuery,
};
use crate::state::{uptime_secs, AppState, BusMsg};

/// Marker the settings GET returns in place of a secret.
const REDACTED: &str = "<REDACTED>";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/settings", get(get_settings).post(update_settings))
        .route("/v1/connection/test", post(test_connection))
        .route("/v1/transmit", post(transmit_now))
        .route("/v1/export", post(export_dep))
        .route(
            "/v1/certificates",
            get(list_certificates).post(upload_certificate),
        )
        .route("/v1/orders/completed", post(order_completed))
        .route("/v1/orders/:order_id/audit", get(order_audit))
        .route("/v1/queue", get(queue))
        .route("/v1/audit/recover", post(recover_audit))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_status(err: &ComplianceError) -> StatusCode {
    match err {
        ComplianceError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ComplianceError::Link(_) => StatusCode::SERVICE_UNAVAILABLE,
        ComplianceError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ComplianceError::NotReady(_) | ComplianceError::Busy(_) => StatusCode::CONFLICT,
        ComplianceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(st: &AppState, err: ComplianceError) -> Response {
    let code = error_status(&err);
    if code.is_server_error() {
        warn!(error = %err, "request failed");
    }
    st.log("warn", err.to_string());
    (
        code,
        Json(ErrorResponse {
            error: err.code().to_string(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn publish_status(st: &AppState, connection: fsk_schemas::ConnectionStatus) {
    let _ = st.bus.send(BusMsg::Status(connection));
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let svc = &st.service;
    let halt = svc.audit_halt_reason();
    (
        StatusCode::OK,
        Json(StatusResponse {
            daemon_uptime_secs: uptime_secs(),
            transport: svc.transport_name(),
            store: svc.store_kind(),
            audit_halted: halt.is_some(),
            audit_halt_reason: halt,
            connection: svc.status().await,
        }),
    )
}

pub(crate) async fn get_settings(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.service.settings().redacted()))
}

/// A client that echoes the redacted GET body back must not overwrite the
/// stored secret with the marker.
fn drop_redacted(secret: Option<SecretString>) -> Option<SecretString> {
    secret.filter(|s| s.expose() != REDACTED)
}

pub(crate) async fn update_settings(
    State(st): State<Arc<AppState>>,
    Json(mut patch): Json<SettingsPatch>,
) -> Response {
    patch.pin = drop_redacted(patch.pin);
    patch.signing_key = drop_redacted(patch.signing_key);

    match st.service.update_settings(patch).await {
        Ok(saved) => {
            info!("compliance settings updated");
            (StatusCode::OK, Json(saved.redacted())).into_response()
        }
        Err(e) => error_response(&st, e),
    }
}

pub(crate) async fn test_connection(State(st): State<Arc<AppState>>) -> Response {
    let res = st.service.test_connection().await;
    // Publish the link state even when the probe failed.
    publish_status(&st, st.service.status().await);
    match res {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(&st, e),
    }
}

pub(crate) async fn transmit_now(State(st): State<Arc<AppState>>) -> Response {
    match st.service.transmit_now().await {
        Ok(report) => {
            st.log(
                "info",
                format!(
                    "transmit: {} sent, {} failed, {} pending",
                    report.transmitted_count, report.failed_count, report.pending_count
                ),
            );
            publish_status(&st, st.service.status().await);
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => error_response(&st, e),
    }
}

pub(crate) async fn export_dep(State(st): State<Arc<AppState>>) -> Response {
    match st.service.export_dep().await {
        Ok(receipt) => {
            st.log("info", format!("dep export written to {}", receipt.path));
            (StatusCode::OK, Json(receipt)).into_response()
        }
        Err(e) => error_response(&st, e),
    }
}

pub(crate) async fn upload_certificate(
    State(st): State<Arc<AppState>>,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> Response {
    match st.service.upload_certificate(&q.name, &body).await {
        Ok(cert) => (StatusCode::OK, Json(cert)).into_response(),
        Err(e) => error_response(&st, e),
    }
}

pub(crate) async fn list_certificates(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.service.certificates().await))
}

pub(crate) async fn order_completed(
    State(st): State<Arc<AppState>>,
    Json(order): Json<CompletedOrder>,
) -> Response {
    match st.service.on_order_completed(order).await {
        Ok(item) => {
            if item.is_some() {
                publish_status(&st, st.service.status().await);
            }
            (
                StatusCode::OK,
                Json(OrderAcceptedResponse {
                    queued: item.is_some(),
                    item,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(&st, e),
    }
}

pub(crate) async fn order_audit(
    State(st): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    let entries = st.service.audit_log(&order_id);
    (StatusCode::OK, Json(OrderAuditResponse { order_id, entries }))
}

pub(crate) async fn queue(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let pending = st.service.pending().await;
    (
        StatusCode::OK,
        Json(QueueResponse {
            pending_count: pending.len(),
            pending,
        }),
    )
}

pub(crate) async fn recover_audit(State(st): State<Arc<AppState>>) -> Response {
    match st.service.recover_audit() {
        Ok(()) => {
            info!("audit log recovered");
            (
                StatusCode::OK,
                Json(RecoverResponse {
                    ok: true,
                    audit_halted: st.service.audit_halt_reason().is_some(),
                }),
            )
                .into_response()
        }
        Err(e) => error_response(&st, e),
    }
}

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let rx = st.bus.subscribe();
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));
    (headers, Sse::new(broadcast_to_sse(rx)).keep_alive(KeepAlive::new()))
}

fn broadcast_to_sse(
    rx: tokio::sync::broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        // Lagged receivers drop messages; the next status event resyncs them.
        let msg = msg.ok()?;
        let event_name = match &msg {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::Status(_) => "status",
            BusMsg::LogLine { .. } => "log",
        };
        let json = serde_json::to_string(&msg).ok()?;
        Some(Ok(Event::default().event(event_name).data(json)))
    })
}
