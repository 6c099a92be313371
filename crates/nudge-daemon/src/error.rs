use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nudge_core::Envelope;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Peer error: {0}")]
    External(String),
    #[error("Storage busy: {0}")]
    Busy(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Attach the request id the failure is reported under.
    pub fn tagged(self, id: u64) -> Rejection {
        Rejection { id, error: self }
    }
}

impl From<nudge_core::Error> for AppError {
    fn from(error: nudge_core::Error) -> Self {
        use nudge_core::Error;

        match error {
            Error::InvalidInput(message) => Self::BadRequest(message),
            Error::Constraint(_) | Error::InvalidRecurrence(_) => {
                Self::BadRequest(error.to_string())
            }
            Error::NotFound(message) => Self::NotFound(message),
            Error::Savepoint(inner) => Self::Conflict(inner.to_string()),
            Error::Peer(message) => Self::External(message),
            Error::Http(inner) => Self::External(inner.to_string()),
            Error::Busy { .. } => Self::Busy(error.to_string()),
            other => {
                tracing::error!(error = %other, "request failed");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.tagged(0).into_response()
    }
}

/// A failure rendered as a `status: false` envelope.
#[derive(Debug)]
pub struct Rejection {
    pub id: u64,
    pub error: AppError,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let body = Envelope::failed(self.id, self.error.to_string());
        (status, Json(body)).into_response()
    }
}

/// Tag a fallible result with the current request id.
pub trait Tagged<T> {
    fn tagged(self, id: u64) -> Result<T, Rejection>;
}

impl<T, E: Into<AppError>> Tagged<T> for Result<T, E> {
    fn tagged(self, id: u64) -> Result<T, Rejection> {
        self.map_err(|error| {
            let error: AppError = error.into();
            error.tagged(id)
        })
    }
}
