use crate::services::storage::StorageError;
use crate::services::transcoder::TranscodeError;
use crate::utils::validation::ValidationError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// JSON body of every non-2xx response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    /// Machine-readable error kind, e.g. `INVALID_FILE_TYPE`
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

const PROCESSING_FAILED: &str = "Failed to process image";

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Transcode(TranscodeError::PoolClosed) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Transcode(_) | AppError::Storage(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(e) => e.code(),
            AppError::Transcode(e) => e.code(),
            AppError::Storage(_) => "FILESYSTEM_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code().to_string();

        let body = match self {
            AppError::Validation(e) => ErrorBody {
                error: e.to_string(),
                code,
                details: None,
            },
            AppError::BadRequest(msg) => ErrorBody {
                error: "Invalid upload request".to_string(),
                code,
                details: Some(msg),
            },
            AppError::Transcode(TranscodeError::PoolClosed) => ErrorBody {
                error: "Service is shutting down".to_string(),
                code,
                details: None,
            },
            AppError::Transcode(e) => {
                tracing::error!("Transcode error: {}", e);
                ErrorBody {
                    error: PROCESSING_FAILED.to_string(),
                    code,
                    details: Some(e.to_string()),
                }
            }
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                ErrorBody {
                    error: PROCESSING_FAILED.to_string(),
                    code,
                    details: Some(e.to_string()),
                }
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ErrorBody {
                    error: PROCESSING_FAILED.to_string(),
                    code,
                    details: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_validation_errors_are_400_without_details() {
        let (status, json) =
            body_json(ValidationError::InvalidFileType("text/plain".into()).into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INVALID_FILE_TYPE");
        assert!(json["error"].as_str().unwrap().contains("text/plain"));
        assert!(json.get("details").is_none());
    }

    #[tokio::test]
    async fn test_transcode_errors_are_500_with_details() {
        let (status, json) = body_json(TranscodeError::Decode("bad marker".into()).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], PROCESSING_FAILED);
        assert_eq!(json["code"], "DECODE_ERROR");
        assert!(json["details"].as_str().unwrap().contains("bad marker"));
    }

    #[tokio::test]
    async fn test_closed_pool_is_503() {
        let (status, json) = body_json(TranscodeError::PoolClosed.into()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["code"], "SERVICE_UNAVAILABLE");
    }
}
