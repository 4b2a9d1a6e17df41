use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::{AppError, GameError};
use crate::registry::{DEFAULT_CODE_ATTEMPTS, Registry};
use crate::room::RoomSummary;
use crate::session::{Connection, SessionManager};
use crate::types::GameType;
use crate::validation::RoomCode;

#[derive(Clone)]
pub struct AppState {
    sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    fn registry(&self) -> &Arc<Registry> {
        self.sessions.registry()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    game_type: Option<GameType>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRoom {
    pub code: RoomCode,
    pub id: String,
    pub game_type: GameType,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub rooms: usize,
    pub connections: usize,
}

/// Build the router with CORS and request tracing attached.
pub fn router(state: AppState, cors_origin: Option<&str>) -> Router {
    Router::new()
        .route("/api/rooms/create", post(create_room))
        .route("/api/rooms/{code}", get(get_room))
        .route("/api/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors_layer(cors_origin))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let Some(origin) = origin else {
        return CorsLayer::permissive();
    };
    match HeaderValue::from_str(origin) {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(err) => {
            warn!(%origin, error = %err, "unusable CORS origin; allowing any");
            CorsLayer::permissive()
        }
    }
}

/// The body is optional; an empty body creates a Quiplash room.
pub async fn create_room(State(state): State<AppState>, body: Bytes) -> Result<Json<CreatedRoom>, AppError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CreateRoomRequest::default()
    } else {
        serde_json::from_slice::<CreateRoomRequest>(&body)
            .map_err(|err| AppError::BadRequest(format!("invalid room request: {err}")))?
    };

    let handle = state.registry().create_unique(DEFAULT_CODE_ATTEMPTS)?;
    Ok(Json(CreatedRoom {
        code: handle.code,
        id: handle.id,
        game_type: request.game_type.unwrap_or(GameType::Quiplash),
    }))
}

pub async fn get_room(State(state): State<AppState>, Path(code): Path<String>) -> Result<Json<RoomSummary>, AppError> {
    let code = RoomCode::parse_lenient(&code)?;
    let handle = state.registry().get(&code).ok_or(GameError::RoomNotFound)?;
    Ok(Json(handle.summary()))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        rooms: state.registry().len(),
        connections: state.sessions.connection_count(),
    })
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Arc<str>>();

    // Dedicated writer so room events keep flowing while we await inbound frames.
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound_rx.recv().await {
            if sender.send(Message::Text(payload.to_string().into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(Arc::clone(&state.sessions), outbound_tx);
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => connection.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(connection = %connection.id(), error = %err, "websocket receive error");
                break;
            }
        }
    }

    connection.close().await;
    let _ = writer.await;
}
