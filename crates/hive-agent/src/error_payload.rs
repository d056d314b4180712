use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::HiveError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

const TRUNCATED: &str = "…(truncated)";

/// Cuts `s` to at most `max_bytes` on a char boundary, marker included.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let budget = max_bytes.saturating_sub(TRUNCATED.len());
    let end = (0..=budget)
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0);
    format!("{}{TRUNCATED}", &s[..end])
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            hint: hint
                .filter(|h| !h.trim().is_empty())
                .map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }

    pub fn from_error(err: &HiveError) -> Self {
        Self::new(err.code(), format!("{err:#}"), hint_for(err))
    }
}

fn hint_for(err: &HiveError) -> Option<String> {
    match err {
        HiveError::Exec(e) => Some(e.output.clone()),
        HiveError::Pipeline { source, .. } => source
            .downcast_ref::<crate::error::ExecError>()
            .map(|e| e.output.clone()),
        HiveError::ResourceExhausted => {
            Some("widen port_ranges or trash instances that are no longer needed".to_string())
        }
        HiveError::TimedOut { .. } => {
            Some("the server was force-killed; check server.log before starting it again".to_string())
        }
        _ => None,
    }
}

pub fn http_status(err: &HiveError) -> StatusCode {
    match err {
        HiveError::NotFound(_) => StatusCode::NOT_FOUND,
        HiveError::InvalidId(_) => StatusCode::BAD_REQUEST,
        HiveError::AlreadyExists(_) => StatusCode::CONFLICT,
        HiveError::ResourceExhausted | HiveError::Unreachable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        HiveError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        HiveError::Exec(_)
        | HiveError::Pipeline { .. }
        | HiveError::Store(_)
        | HiveError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Wraps [`HiveError`] for axum handlers.
#[derive(Debug)]
pub struct ApiError(pub HiveError);

impl From<HiveError> for ApiError {
    fn from(value: HiveError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(&self.0);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        }
        (status, Json(ErrorPayload::from_error(&self.0))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use hive_process::InstanceId;

    use super::*;
    use crate::error::{ExecError, ExecFailure};

    #[test]
    fn message_and_hint_are_truncated() {
        let long = "a".repeat(MAX_MESSAGE_BYTES + 1024);
        let hint = Some("é".repeat(MAX_HINT_BYTES));
        let p = ErrorPayload::new("test", long, hint);
        assert!(p.message.len() <= MAX_MESSAGE_BYTES);
        assert!(p.message.ends_with("…(truncated)"));
        let hint = p.hint.unwrap();
        assert!(hint.len() <= MAX_HINT_BYTES);
        assert!(hint.ends_with("…(truncated)"));
    }

    #[test]
    fn blank_hint_is_dropped() {
        let p = ErrorPayload::new("x", "m", Some("  ".into()));
        let v = serde_json::to_value(&p).unwrap();
        assert!(v.get("hint").is_none());
    }

    #[test]
    fn exec_output_becomes_hint() {
        let err = HiveError::from(
            ExecError::new("screen", ExecFailure::ExitStatus("1".into()))
                .with_output("No screen session found."),
        );
        let p = ErrorPayload::from_error(&err);
        assert_eq!(p.code, "exec_failed");
        assert_eq!(p.hint.as_deref(), Some("No screen session found."));
        assert_eq!(http_status(&err), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn status_mapping() {
        let id = InstanceId::parse("a").unwrap();
        assert_eq!(http_status(&HiveError::NotFound(id.clone())), StatusCode::NOT_FOUND);
        assert_eq!(http_status(&HiveError::AlreadyExists(id)), StatusCode::CONFLICT);
        assert_eq!(
            http_status(&HiveError::ResourceExhausted),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
