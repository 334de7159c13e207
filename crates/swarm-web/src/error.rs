use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use swarmd::OrchestratorError;

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("resource not found: {resource}")]
    NotFound { resource: String },
    #[error("invalid request: {message}")]
    BadRequest { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<OrchestratorError> for WebError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::ProjectNotFound { project } => WebError::NotFound {
                resource: format!("project:{project}"),
            },
            OrchestratorError::Progress(err) => WebError::BadRequest {
                message: err.to_string(),
            },
            other => WebError::Internal {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            WebError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("resource not found: {resource}"),
            ),
            WebError::BadRequest { message } => (StatusCode::BAD_REQUEST, "bad_request", message),
            WebError::Internal { message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };

        let body = ErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_errors_map_to_web_statuses() {
        let err: WebError = OrchestratorError::ProjectNotFound {
            project: "shop".to_string(),
        }
        .into();
        assert!(matches!(err, WebError::NotFound { .. }));

        let parse = swarm_core::progress::parse_progress("- [ ] A @id(a) @depends(ghost)\n")
            .expect_err("parse error");
        let err: WebError = OrchestratorError::Progress(parse).into();
        assert!(matches!(err, WebError::BadRequest { .. }));
    }

    #[test]
    fn error_body_is_structured_json() {
        let response = WebError::BadRequest {
            message: "missing field".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
