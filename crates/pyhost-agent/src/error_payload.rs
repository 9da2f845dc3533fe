use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::lifecycle::LifecycleError;

const MAX_MESSAGE_BYTES: usize = 8 * 1024;
const MAX_HINT_BYTES: usize = 2 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }
}

/// JSON error response for the management API.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub payload: ErrorPayload,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: ErrorPayload::new(code, message, None),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let status = match &err {
            LifecycleError::AccessDenied | LifecycleError::SuperAdminOnly => StatusCode::FORBIDDEN,
            LifecycleError::AlreadyRunning(_) | LifecycleError::Taken(_) => StatusCode::CONFLICT,
            LifecycleError::TargetNotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            LifecycleError::LaunchFailure(_) | LifecycleError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let hint = match &err {
            LifecycleError::AlreadyRunning(_) => Some("stop or restart the target first".to_string()),
            LifecycleError::LaunchFailure(_) => {
                Some("check PYHOST_INTERPRETER on the agent host".to_string())
            }
            _ => None,
        };
        Self {
            status,
            payload: ErrorPayload::new(err.code(), err.to_string(), hint),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.payload)).into_response()
    }
}
