use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::fmt::Display;
use tracing::Level;

/// Crate-wide error type.
///
/// Limit-reached outcomes are deliberately *not* errors: the rate limiter
/// returns a `RateLimitDecision` and the usage meter a `UsageCheck`, so
/// callers branch on values. `Error` is reserved for configuration problems
/// and genuine infrastructure failures.
#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new`
// method and log the error.
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    Config { message: String },
    InternalError { message: String },
    InvalidRequest { message: String },
    StoreUnavailable { message: String },
}

impl ErrorDetails {
    /// The tracing level at which this error should be logged.
    pub fn level(&self) -> Level {
        match self {
            ErrorDetails::Config { .. } => Level::ERROR,
            ErrorDetails::InternalError { .. } => Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => Level::WARN,
            ErrorDetails::StoreUnavailable { .. } => Level::WARN,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ErrorDetails::Config { .. } | ErrorDetails::InternalError { .. } => {
                "internal_server_error"
            }
            ErrorDetails::InvalidRequest { .. } => "invalid_request_error",
            ErrorDetails::StoreUnavailable { .. } => "store_unavailable",
        }
    }

    pub fn log(&self) {
        match self.level() {
            Level::ERROR => tracing::error!("{self}"),
            Level::WARN => tracing::warn!("{self}"),
            Level::INFO => tracing::info!("{self}"),
            Level::DEBUG => tracing::debug!("{self}"),
            _ => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => write!(f, "Config error: {message}"),
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "Invalid request: {message}"),
            ErrorDetails::StoreUnavailable { message } => {
                write!(f, "Store unavailable: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.get_details().error_type(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}
