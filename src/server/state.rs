//! Read-only inspection of updater and backflow state.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use super::AppState;
use crate::backflow::BackflowStatus;
use crate::store::{StateCache, StoreError};
use crate::types::{InProgressPullRequest, UpdaterId};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no state for {0}")]
    NotFound(String),

    #[error("invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for StateError {
    fn into_response(self) -> Response {
        let status = match &self {
            StateError::NotFound(_) => StatusCode::NOT_FOUND,
            StateError::InvalidId(_) => StatusCode::BAD_REQUEST,
            StateError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Rejects identifiers that could escape a key namespace.
///
/// Updater ids are repository URLs, so `/` is allowed, but `..` segments,
/// backslashes and control characters are not.
pub fn validate_identifier(id: &str) -> Result<(), StateError> {
    let invalid = id.is_empty()
        || id.starts_with('.')
        || id.contains('\\')
        || id.chars().any(char::is_control)
        || id.split('/').any(|segment| segment == "..");
    if invalid {
        return Err(StateError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// `GET /api/v1/updaters/{updater_id}/state`
///
/// The id is the updater's display form: a subscription id for non-batched
/// updaters, `{repository}:{branch}` (percent-encoded) for batched ones.
pub async fn updater_state_handler(
    State(app_state): State<AppState>,
    Path(updater_id): Path<String>,
) -> Result<Json<InProgressPullRequest>, StateError> {
    validate_identifier(&updater_id)?;
    let id = UpdaterId::parse(&updater_id).ok_or_else(|| StateError::InvalidId(updater_id.clone()))?;
    let cache = StateCache::<InProgressPullRequest>::new(app_state.store(), &id.to_string());
    cache
        .get()
        .await?
        .map(Json)
        .ok_or(StateError::NotFound(updater_id))
}

/// `GET /api/v1/backflow/{commit}`
pub async fn backflow_status_handler(
    State(app_state): State<AppState>,
    Path(commit): Path<String>,
) -> Result<Json<BackflowStatus>, StateError> {
    if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StateError::InvalidId(commit));
    }
    BackflowStatus::cache(app_state.store(), &commit)
        .get()
        .await?
        .map(Json)
        .ok_or(StateError::NotFound(commit))
}
