use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Error taxonomy shared by every binary in the platform (spec §7).
///
/// Each variant maps to the nearest standard HTTP status at a REST
/// boundary; internal callback handlers are lenient and translate these
/// into a 200 with an `"ignored"`/`"error"` body field instead of bubbling
/// the status up, per the propagation policy in spec §7.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("not authorized for this meeting")]
    AuthzFailure,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient backend error: {0}")]
    TransientBackend(String),

    #[error("workload scheduling failed: {0}")]
    WorkloadScheduling(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("malformed protocol message: {0}")]
    ProtocolMalformed(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("recognizer crashed: {0}")]
    RecognizerCrash(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            Error::AuthzFailure => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::LimitExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::TransientBackend(_) | Error::UpstreamUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::WorkloadScheduling(_)
            | Error::InvalidTransition(_)
            | Error::RecognizerCrash(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ProtocolMalformed(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::AuthFailure(_) => "auth_failure",
            Error::AuthzFailure => "authz_failure",
            Error::Conflict(_) => "conflict",
            Error::LimitExceeded(_) => "limit_exceeded",
            Error::NotFound(_) => "not_found",
            Error::TransientBackend(_) => "transient_backend",
            Error::WorkloadScheduling(_) => "workload_scheduling",
            Error::InvalidTransition(_) => "invalid_transition",
            Error::ProtocolMalformed(_) => "protocol_malformed",
            Error::UpstreamUnavailable(_) => "upstream_unavailable",
            Error::RecognizerCrash(_) => "recognizer_crash",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::TransientBackend(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::TransientBackend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
