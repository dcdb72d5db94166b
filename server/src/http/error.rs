use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use super::dto::ErrorResponse;
use crate::error::{ErrorKind, KeystoreError};

/// A [`KeystoreError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub KeystoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status =
            StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if kind == ErrorKind::Storage {
            error!("Request failed: {:#}", anyhow::Error::new(self.0.clone()));
        }

        let body = Json(ErrorResponse {
            error: kind.name().to_string(),
            details: Some(self.0.to_string()),
        });

        (status, body).into_response()
    }
}

impl From<KeystoreError> for ApiError {
    fn from(err: KeystoreError) -> Self {
        ApiError(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
