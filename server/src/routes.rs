//! HTTP route handlers for the UniLink hub.
//!
//! - `GET /ws?token=<jwt>` - WebSocket endpoint for signed-in clients
//! - `POST /events` - Publish endpoint for the platform's REST handlers
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The hub handle used to register sessions and publish events
//! - The directory used to load a user's targeting attributes at connect
//! - The JWT validator
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use unilink_hub::config::Config;
//! use unilink_hub::directory::InMemoryDirectory;
//! use unilink_hub::hub::{Hub, HubConfig};
//! use unilink_hub::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let directory = Arc::new(InMemoryDirectory::new());
//!     let (hub, _task) = Hub::spawn(directory.clone(), HubConfig::default());
//!     let app = create_router(AppState::new(config, hub, directory));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ws::WebSocket, DefaultBodyLimit, Query, State, WebSocketUpgrade},
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, info, trace, warn, Span};

use crate::auth::{verify_service_token, AuthError, TokenValidator};
use crate::config::Config;
use crate::directory::Directory;
use crate::error::ServerError;
use crate::hub::HubHandle;
use crate::session::{run_session, Session, Snapshot, MAX_BUFFERED_MESSAGE_SIZE};
use crate::types::{Event, UserId};

// ============================================================================
// Constants
// ============================================================================

/// Maximum body size for event publishing (1 MiB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Scheme expected in the `Authorization` header of publish requests.
const BEARER_PREFIX: &str = "Bearer ";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Handle to the running hub.
    pub hub: HubHandle,

    /// Source of user profiles and group membership.
    pub directory: Arc<dyn Directory>,

    /// Validator for client JWTs.
    pub validator: TokenValidator,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates the application state around a running hub.
    ///
    /// The directory should be the same one the hub resolves group
    /// membership against.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle, directory: Arc<dyn Directory>) -> Self {
        let validator = TokenValidator::new(&config.jwt_secret);
        Self {
            config: Arc::new(config),
            hub,
            directory,
            validator,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .field("validator", &self.validator)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(post_events))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Request span without the query string, which carries client tokens.
fn request_span(request: &Request<Body>) -> Span {
    debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    )
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    pub(crate) fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub(crate) fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

// ============================================================================
// POST /events - Event Publishing
// ============================================================================

/// Request body for event publishing.
///
/// Accepts either a single event or an array of events.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventsPayload {
    Single(Event),
    Batch(Vec<Event>),
}

impl EventsPayload {
    fn into_events(self) -> Vec<Event> {
        match self {
            Self::Single(event) => vec![event],
            Self::Batch(events) => events,
        }
    }
}

/// Response body for an accepted publish request.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Events handed to the hub.
    pub accepted: usize,

    /// Events dropped because the hub was saturated or stopped.
    pub dropped: usize,
}

/// POST /events - Hand events to the hub.
///
/// # Authentication
///
/// Requires `Authorization: Bearer <service token>`. When no service token
/// is configured, every request is rejected.
///
/// # Responses
///
/// - `202 Accepted` - Events handed to the hub. Delivery is best effort;
///   drops are reported in the body and still return 202.
/// - `400 Bad Request` - Body is not a valid event or event array
/// - `401 Unauthorized` - Missing or wrong service token
/// - `413 Payload Too Large` - Body above 1 MiB
async fn post_events(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(expected) = state.config.service_token.as_deref() else {
        debug!("Publish rejected, no service token configured");
        return ServerError::from(AuthError::InvalidToken).into_response();
    };

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .unwrap_or_default();

    if let Err(err) = verify_service_token(provided, expected) {
        warn!(error = %err, "Publish request failed authentication");
        return ServerError::from(err).into_response();
    }

    let events = match serde_json::from_slice::<EventsPayload>(&body) {
        Ok(payload) => payload.into_events(),
        Err(err) => {
            debug!(error = %err, "Failed to parse publish payload");
            return ServerError::validation(format!("invalid event format: {err}")).into_response();
        }
    };

    let mut accepted = 0;
    let mut dropped = 0;
    for event in events {
        trace!(event_type = event.kind(), "Publishing event");
        match state.hub.publish(event) {
            Ok(()) => accepted += 1,
            Err(_) => dropped += 1,
        }
    }

    info!(accepted, dropped, "Events published");

    (
        StatusCode::ACCEPTED,
        Json(PublishResponse { accepted, dropped }),
    )
        .into_response()
}

// ============================================================================
// GET /ws - WebSocket Connection
// ============================================================================

/// Query parameters for the WebSocket endpoint.
#[derive(Debug, Deserialize)]
pub struct WsQueryParams {
    /// Platform JWT.
    pub token: Option<String>,
}

/// A user cleared to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Admission {
    user_id: UserId,
    snapshot: Snapshot,
}

/// Authenticates a connection attempt and loads the user's targeting
/// attributes. Runs before the upgrade, so a rejected client never gets a
/// session.
async fn admit(state: &AppState, token: Option<&str>) -> Result<Admission, Response> {
    let claims = state
        .validator
        .validate(token.unwrap_or_default())
        .map_err(|err| {
            debug!(code = err.code(), "WebSocket connection rejected");
            ServerError::from(err).into_response()
        })?;

    let profile = state
        .directory
        .user_profile(claims.user_id)
        .await
        .map_err(|err| {
            warn!(user_id = claims.user_id, error = %err, "Profile lookup failed");
            ServerError::from(err).into_response()
        })?;

    if profile.college_id != claims.college_id {
        warn!(
            user_id = claims.user_id,
            token_college = claims.college_id,
            profile_college = profile.college_id,
            "Token college differs from profile, using profile"
        );
    }

    Ok(Admission {
        user_id: claims.user_id,
        snapshot: profile.snapshot(),
    })
}

/// GET /ws - WebSocket endpoint.
///
/// # Query Parameters
///
/// - `token` - Platform JWT (required)
///
/// # WebSocket Protocol
///
/// The server sends `{"type": <kind>, "payload": {...}}` text frames and a
/// ping every keepalive period. Client messages are logged and ignored;
/// a client frame above 64 KiB ends the connection.
///
/// # Responses
///
/// - `101 Switching Protocols` - Session established
/// - `401 Unauthorized` - Missing, invalid or expired token
/// - `404 Not Found` - Token names an unknown user
/// - `503 Service Unavailable` - The directory could not be reached
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let admission = match admit(&state, params.token.as_deref()).await {
        Ok(admission) => admission,
        Err(response) => return response,
    };

    info!(
        user_id = admission.user_id,
        college_id = admission.snapshot.college_id,
        "WebSocket client connecting"
    );

    ws.max_message_size(MAX_BUFFERED_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, state, admission))
}

/// Runs an upgraded connection as a hub session.
async fn handle_websocket(socket: WebSocket, state: AppState, admission: Admission) {
    let (sink, stream) = socket.split();
    let (session, outbound) = Session::new(
        admission.user_id,
        admission.snapshot,
        state.config.session_queue,
    );

    state.hub.connect(Arc::clone(&session));
    run_session(
        session,
        sink,
        stream,
        outbound,
        state.hub.clone(),
        state.config.ping_interval,
    )
    .await;
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live sessions.
    pub connections: usize,

    /// Number of users with at least one live session.
    pub users: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.hub.stats();

    Json(HealthResponse {
        status: "ok".to_string(),
        connections: stats.connections,
        users: stats.users,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
