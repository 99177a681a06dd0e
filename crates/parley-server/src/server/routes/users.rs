//! User account routes
//!
//! - POST /users - Create an account
//! - GET /users/:id - Fetch an account (session cache first)

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parley_relay::User;
use tracing::instrument;

use super::ApiError;
use crate::accounts::CreateUser;
use crate::server::AppState;

/// Create the users router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/users", post(create_user_handler))
        .route("/users/:id", get(get_user_handler))
        .with_state(state)
}

/// POST /users
///
/// Responds 201 with `{id, username, email}`. The password is never echoed.
#[instrument(skip_all)]
pub async fn create_user_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateUser>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let user: User = state.accounts.create_user(request).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /users/:id
#[instrument(skip_all)]
pub async fn get_user_handler(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    let user = state.accounts.get_user(id).await?;
    Ok(Json(user))
}
