//! Message routes
//!
//! - POST /messages - Store a message without live delivery

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use parley_relay::Message;
use serde::Serialize;
use tracing::instrument;

use super::ApiError;
use crate::server::AppState;

/// Create the messages router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/messages", post(send_message_handler))
        .with_state(state)
}

/// Response for a stored message
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    #[serde(flatten)]
    pub message: Message,
}

/// POST /messages
///
/// Responds 201 whether or not the recipient is connected.
#[instrument(skip_all)]
pub async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Message>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(message) = payload?;
    let id = state.accounts.send_message(&message).await?;
    Ok((StatusCode::CREATED, Json(MessageResponse { id, message })))
}
