use crate::context::{AppContext, BatchAck, DispatchError};
use crate::realtime;
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use disparo_core::batch_loader::load_contacts;
use disparo_core::delay::DelayConfig;
use disparo_core::session::{SessionIdentity, SessionLifecycle, SessionSnapshot};
use disparo_core::{BatchSession, ContactRecord};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

const UPLOAD_FIELD: &str = "file";
const DEFAULT_UPLOAD_NAME: &str = "upload.csv";

#[derive(Clone, Debug)]
pub struct RouterOptions {
    pub cors_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

/// `{success: true, data, message?, timestamp?}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            message: None,
            timestamp: None,
        })
    }

    fn with_message(data: T, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            message: Some(message.into()),
            timestamp: None,
        })
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Busy => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, "DISPATCH_BUSY", err.to_string())
            }
            DispatchError::QueueClosed => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "DISPATCH_UNAVAILABLE",
                err.to_string(),
            ),
        }
    }
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: ErrorDetail<'a>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.code,
                message: &self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(ctx: Arc<AppContext>, options: &RouterOptions) -> Router {
    let origins: Vec<HeaderValue> = options
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(event = "cors_origin_invalid", origin = %origin);
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, ACCEPT])
        .allow_credentials(true);

    Router::new()
        .route("/status", get(status))
        .route("/qr", get(qr))
        .route("/debug", get(debug_state))
        .route("/restart", post(restart))
        .route("/clean-session", post(clean_session))
        .route("/configure-delay", post(configure_delay))
        .route("/delay-config", get(delay_config))
        .route("/send", post(send_batch))
        .route("/history", get(history))
        .route("/history/:session_id/contacts", get(history_contacts))
        .route("/ws", get(realtime::ws_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .layer(cors)
        .with_state(ctx)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusView {
    #[serde(flatten)]
    snapshot: SessionSnapshot,
    ready: bool,
    qr: Option<String>,
    instance_initialized: bool,
    lifecycle: SessionLifecycle,
}

async fn status(State(ctx): State<Arc<AppContext>>) -> Json<ApiResponse<StatusView>> {
    let state = ctx.session_state().await;
    let view = StatusView {
        snapshot: state.snapshot(),
        ready: ctx.is_ready().await,
        qr: state.last_qr,
        instance_initialized: ctx.gateway().is_initialized(),
        lifecycle: state.lifecycle,
    };
    let mut response = ApiResponse::ok(view);
    response.0.timestamp = Some(Utc::now());
    response
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QrView {
    qr: String,
    connected: bool,
    has_qr: bool,
    ready: bool,
}

async fn qr(State(ctx): State<Arc<AppContext>>) -> Json<ApiResponse<QrView>> {
    let state = ctx.session_state().await;
    let ready = ctx.is_ready().await;
    ApiResponse::ok(QrView {
        has_qr: state.last_qr.is_some(),
        qr: state.last_qr.unwrap_or_default(),
        connected: ready,
        ready,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DebugView {
    qr_code_string: &'static str,
    qr_length: usize,
    is_client_ready: bool,
    client_exists: bool,
    client_state: Option<SessionIdentity>,
}

async fn debug_state(State(ctx): State<Arc<AppContext>>) -> Json<ApiResponse<DebugView>> {
    let state = ctx.session_state().await;
    ApiResponse::ok(DebugView {
        qr_code_string: if state.last_qr.is_some() {
            "present"
        } else {
            "absent"
        },
        qr_length: state.last_qr.as_deref().map(str::len).unwrap_or(0),
        is_client_ready: ctx.is_ready().await,
        client_exists: ctx.gateway().is_initialized(),
        client_state: state.identity,
    })
}

fn gateway_unavailable(err: impl ToString) -> ApiError {
    ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "GATEWAY_UNAVAILABLE",
        err.to_string(),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RestartView {
    restarting: bool,
}

async fn restart(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<ApiResponse<RestartView>>, ApiError> {
    ctx.restart(true).await.map_err(gateway_unavailable)?;
    Ok(ApiResponse::with_message(
        RestartView { restarting: true },
        "session restarting",
    ))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanSessionView {
    session_cleaned: bool,
}

async fn clean_session(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<ApiResponse<CleanSessionView>>, ApiError> {
    ctx.clean_session().await.map_err(gateway_unavailable)?;
    Ok(ApiResponse::with_message(
        CleanSessionView {
            session_cleaned: true,
        },
        "session cleaned and restarting",
    ))
}

/// Accepts a JSON number or a numeric string.
fn requested_delay(body: &Value) -> Option<f64> {
    match body.get("delaySeconds")? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

async fn configure_delay(
    State(ctx): State<Arc<AppContext>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ApiResponse<DelayConfig>>, ApiError> {
    let invalid = || ApiError::bad_request("INVALID_DELAY", "delaySeconds must be between 0 and 300");
    let Ok(Json(body)) = body else {
        return Err(invalid());
    };
    let base = requested_delay(&body).ok_or_else(invalid)?;
    let config = DelayConfig::validated(base)
        .map_err(|err| ApiError::bad_request(err.code(), err.to_string()))?;
    ctx.replace_delay(config);
    Ok(ApiResponse::with_message(
        config,
        format!("delay set to {} seconds", config.base_seconds),
    ))
}

#[derive(Serialize)]
struct DelayView {
    #[serde(flatten)]
    config: DelayConfig,
    description: String,
}

async fn delay_config(State(ctx): State<Arc<AppContext>>) -> Json<ApiResponse<DelayView>> {
    let config = ctx.delay_config();
    ApiResponse::ok(DelayView {
        description: config.description(),
        config,
    })
}

struct Upload {
    file_name: String,
    bytes: Bytes,
}

fn upload_error(err: MultipartError) -> ApiError {
    ApiError::new(err.status(), "UPLOAD_ERROR", err.body_text())
}

async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Option<Upload>, ApiError> {
    let Ok(mut multipart) = multipart else {
        return Ok(None);
    };
    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field
            .file_name()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_UPLOAD_NAME)
            .to_string();
        let bytes = field.bytes().await.map_err(upload_error)?;
        return Ok(Some(Upload { file_name, bytes }));
    }
    Ok(None)
}

async fn send_batch(
    State(ctx): State<Arc<AppContext>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ApiResponse<BatchAck>>, ApiError> {
    if !ctx.is_ready().await {
        return Err(ApiError::bad_request(
            "CLIENT_NOT_READY",
            "session is not connected; scan the QR code first",
        ));
    }
    let upload = read_upload(multipart)
        .await?
        .ok_or_else(|| ApiError::bad_request("FILE_NOT_PROVIDED", "no CSV file was uploaded"))?;
    let contacts = load_contacts(&upload.bytes)
        .map_err(|err| ApiError::bad_request(err.code(), err.to_string()))?;
    let total = contacts.len();
    let ack = ctx.accept_batch(upload.file_name, contacts).await?;
    Ok(ApiResponse::with_message(
        ack,
        format!("processing started for {total} contacts"),
    ))
}

async fn history(State(ctx): State<Arc<AppContext>>) -> Json<ApiResponse<Vec<BatchSession>>> {
    ApiResponse::ok(ctx.history().await)
}

async fn history_contacts(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<ContactRecord>>>, ApiError> {
    ctx.batch_contacts(&session_id)
        .await
        .map(ApiResponse::ok)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "SESSION_NOT_FOUND",
                format!("no finished batch {session_id} in history"),
            )
        })
}
