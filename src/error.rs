use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced to a client, either as a `player:error` event or as an HTTP error.
///
/// None of these ever leave partial state behind in a room; they are produced
/// before a command reaches the room actor or by the actor before it mutates anything.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("invalid room code")]
    InvalidRoomCode,
    #[error("invalid player name")]
    InvalidPlayerName,
    #[error("invalid {0} data")]
    InvalidPayload(&'static str),
    #[error("room not found")]
    RoomNotFound,
    #[error("player not in room")]
    PlayerNotInRoom,
    #[error("join timed out")]
    JoinTimeout,
    #[error("room did not respond in time")]
    CommandTimeout,
    #[error("unable to generate a unique room code after {attempts} attempts")]
    CodeGenerationExhausted { attempts: usize },
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<GameError> for AppError {
    fn from(err: GameError) -> Self {
        match err {
            GameError::RoomNotFound | GameError::InvalidRoomCode => AppError::NotFound(err.to_string()),
            GameError::CodeGenerationExhausted { .. }
            | GameError::CommandTimeout
            | GameError::JoinTimeout => AppError::ServiceUnavailable(err.to_string()),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}
