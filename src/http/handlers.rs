use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

use crate::message::{Message, Stats};
use crate::pipeline::MessagePipeline;
use crate::Error;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: MessagePipeline,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(default)]
    pub processed: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageResponse {
    pub id: i32,
    pub content: String,
    pub processed: bool,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            content: message.content,
            processed: message.processed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    pub all: i64,
    pub processed: i64,
}

impl From<Stats> for StatsResponse {
    fn from(stats: Stats) -> Self {
        Self {
            all: stats.all,
            processed: stats.processed,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error response with a JSON body of the form `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Maps a create failure. Anything that is not a request problem is
    /// reported as unprocessable.
    fn create(e: Error) -> Self {
        let status = match e.root() {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::AlreadyExists => StatusCode::CONFLICT,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => {
                error!(error = %e, "create message");
                StatusCode::UNPROCESSABLE_ENTITY
            }
        };
        Self::new(status, e.to_string())
    }

    fn read(e: Error) -> Self {
        if e.is_not_found() {
            return Self::new(StatusCode::NOT_FOUND, e.to_string());
        }
        error!(error = %e, "read message");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// `POST /messages`
#[instrument(skip_all)]
pub async fn create_message(
    State(state): State<AppState>,
    payload: Result<Json<CreateMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let Json(request) =
        payload.map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text()))?;

    let message = state
        .pipeline
        .create_message(&request.content, request.processed)
        .await
        .map_err(ApiError::create)?;

    Ok((StatusCode::CREATED, Json(message.into())))
}

/// `GET /messages/stats`
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.pipeline.get_stats().await.map_err(|e| {
        error!(error = %e, "get stats");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    Ok(Json(stats.into()))
}

/// `GET /messages/{id}`
pub async fn get_message(
    State(state): State<AppState>,
    id: Result<Path<i32>, PathRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Path(id) =
        id.map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text()))?;

    let message = state
        .pipeline
        .get_message(id)
        .await
        .map_err(ApiError::read)?;
    Ok(Json(message.into()))
}

/// `GET /health`
pub async fn heartbeat() -> &'static str {
    "."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_error_status_mapping() {
        let cases = [
            (Error::Validation("empty".to_string()), StatusCode::BAD_REQUEST),
            (Error::AlreadyExists, StatusCode::CONFLICT),
            (Error::NotCreated, StatusCode::UNPROCESSABLE_ENTITY),
            (
                Error::Encode("x".to_string()).context("create message"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::create(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_read_error_status_mapping() {
        let response = ApiError::read(Error::NotFound { id: 4 }).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::read(Error::Connection("down".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
