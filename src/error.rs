//! Handler error type.
//!
//! Every fallible handler returns `Result<T, ApiError>`. Client errors carry
//! their message to the caller; upstream and internal errors are logged with
//! full detail and answered with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::openai::LlmError;

#[derive(Debug, Error)]
pub enum ApiError {
  /// The caller sent an invalid or malformed request.
  #[error("bad request: {0}")]
  BadRequest(String),

  /// The caller referenced a session, question or user that does not exist.
  #[error("not found: {0}")]
  NotFound(String),

  /// The language-model API failed or answered with garbage.
  #[error("upstream error: {0}")]
  Upstream(#[from] LlmError),

  /// A feature that needs the model API was called without one configured.
  #[error("unavailable: {0}")]
  Unavailable(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
      ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  /// Message safe to show to end users.
  pub fn public_message(&self) -> String {
    match self {
      ApiError::BadRequest(m) | ApiError::NotFound(m) | ApiError::Unavailable(m) => m.clone(),
      ApiError::Upstream(_) => "The tutor is unavailable right now. Please try again.".to_string(),
      ApiError::Internal(_) => "internal server error".to_string(),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    match &self {
      ApiError::Upstream(e) => error!(target: "mathmate", error = %e, "upstream model error"),
      ApiError::Internal(m) => error!(target: "mathmate", message = %m, "internal server error"),
      _ => {}
    }
    let status = self.status();
    (status, Json(json!({ "error": self.public_message() }))).into_response()
  }
}
