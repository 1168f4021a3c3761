//! Actix Web error adapters for the runner's errors.
//!
//! This module lets [`Error`] and the viewer's own request errors be
//! returned straight from Actix Web handlers.

use crate::error::Error;
use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;

fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
        Error::ConfigInvalid(_) | Error::ConfigParse(_) | Error::ConfigValidation(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_error(status_code: StatusCode, message: String) -> HttpResponse {
    HttpResponse::build(status_code)
        .content_type("application/json")
        .json(json!({
            "error": message,
            "code": status_code.as_u16()
        }))
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        json_error(self.status_code(), self.to_string())
    }

    fn status_code(&self) -> StatusCode {
        error_status(self)
    }
}

/// Errors raised while handling a log viewer request
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No channel with that name
    #[error("Unknown log channel: {0}")]
    UnknownChannel(String),

    /// Anything coming from the runner itself
    #[error(transparent)]
    Internal(#[from] Error),
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        json_error(self.status_code(), self.to_string())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::UnknownChannel(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(e) => error_status(e),
        }
    }
}
