//! Manual subscription triggering.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use super::AppState;
use crate::trigger::{self, TriggerError};
use crate::types::{BuildId, SubscriptionId};

#[derive(Debug, Error)]
pub enum TriggerRequestError {
    #[error("invalid subscription id: {0:?}")]
    InvalidId(String),

    #[error("subscription {0} was not triggered")]
    NotTriggered(SubscriptionId),

    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

impl IntoResponse for TriggerRequestError {
    fn into_response(self) -> Response {
        let status = match &self {
            TriggerRequestError::InvalidId(_) => StatusCode::BAD_REQUEST,
            TriggerRequestError::NotTriggered(_) => StatusCode::NOT_FOUND,
            TriggerRequestError::Trigger(TriggerError::Dispatch(_)) => StatusCode::SERVICE_UNAVAILABLE,
            TriggerRequestError::Trigger(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TriggerParams {
    pub bar_build_id: Option<u64>,
    #[serde(default)]
    pub force: bool,
}

/// `POST /api/v1/subscriptions/{id}/trigger?bar-build-id=N&force=true`
///
/// Without a build id the latest build on the subscription's channel is
/// applied. Returns 202 once the work item is queued, 404 if the
/// subscription is missing, disabled or has nothing to apply.
pub async fn trigger_subscription_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TriggerParams>,
) -> Result<StatusCode, TriggerRequestError> {
    let subscription_id = Uuid::parse_str(&id)
        .map(SubscriptionId)
        .map_err(|_| TriggerRequestError::InvalidId(id))?;
    let triggered = trigger::trigger_subscription(
        app_state.registry().as_ref(),
        app_state.queue().as_ref(),
        subscription_id,
        params.bar_build_id.map(BuildId),
        params.force,
    )
    .await?;
    if triggered {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(TriggerRequestError::NotTriggered(subscription_id))
    }
}
