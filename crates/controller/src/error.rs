//! Error taxonomy for zone control and the HTTP API.
//!
//! `NotFound` and `Conflict` variants are terminal for the call that
//! produced them; callers must surface them, never retry. Upstream
//! failures (weather, relay) are recovered locally and do not appear
//! here; they are logged at the point of failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("zone {0} not found")]
    ZoneNotFound(i64),

    #[error("sequence {0} not found")]
    SequenceNotFound(i64),

    #[error("schedule {0} not found")]
    ScheduleNotFound(i64),

    /// Exclusivity violation: another zone is already watering.
    #[error("zone \"{name}\" is already running, stop it first")]
    ZoneBusy { name: String },

    /// Winter mode blocks all zone starts regardless of other logic.
    #[error("winter mode active, watering is disabled")]
    WinterLock,

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ControlError {
    fn status(&self) -> StatusCode {
        match self {
            ControlError::ZoneNotFound(_)
            | ControlError::SequenceNotFound(_)
            | ControlError::ScheduleNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::ZoneBusy { .. } => StatusCode::CONFLICT,
            ControlError::WinterLock => StatusCode::LOCKED,
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        if let ControlError::Internal(e) = &self {
            tracing::error!("internal error: {e:#}");
        }
        let body = Json(json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

impl From<sqlx::Error> for ControlError {
    fn from(e: sqlx::Error) -> Self {
        ControlError::Internal(e.into())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_busy_names_the_running_zone() {
        let e = ControlError::ZoneBusy {
            name: "Front Lawn".into(),
        };
        assert!(e.to_string().contains("Front Lawn"));
        assert_eq!(e.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(ControlError::ZoneNotFound(7).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ControlError::SequenceNotFound(2).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn winter_lock_maps_to_423() {
        assert_eq!(ControlError::WinterLock.status(), StatusCode::LOCKED);
    }

    #[test]
    fn validation_maps_to_400() {
        let e = ControlError::Validation("name is required".into());
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
        assert_eq!(e.to_string(), "name is required");
    }
}
