use crate::AppState;
use crate::api::error::AppError;
use crate::models::{OptimizedResult, RequestStage, UploadedImage};
use crate::utils::validation::{ValidationError, sanitize_extension};
use axum::{
    extract::{
        Multipart, State,
        multipart::{Field, MultipartError},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use tracing::{info, warn};
use utoipa::ToSchema;

/// Multipart form accepted by `POST /api/upload`
#[derive(ToSchema)]
pub struct UploadForm {
    /// Image to optimize (JPEG, PNG, GIF or WebP)
    #[schema(value_type = String, format = Binary)]
    pub image: Vec<u8>,
    /// Output format: jpeg, jpg, webp, png or avif. Defaults to webp.
    pub format: Option<String>,
}

fn map_multipart_error(e: MultipartError, limit: usize) -> AppError {
    let err_msg = e.body_text();
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE || err_msg.contains("length limit exceeded") {
        AppError::Validation(ValidationError::PayloadTooLarge { max: limit })
    } else {
        AppError::BadRequest(err_msg)
    }
}

/// Buffers the image part, stopping one byte past `limit` so an oversized
/// upload is measured without being held in memory.
async fn read_image_field(mut field: Field<'_>, limit: usize) -> Result<UploadedImage, AppError> {
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();
    let extension = sanitize_extension(field.file_name(), &content_type);

    let mut buf = BytesMut::new();
    let mut received = 0usize;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| map_multipart_error(e, limit))?
    {
        received += chunk.len();
        if received > limit {
            break;
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(UploadedImage {
        data: buf.freeze(),
        content_type,
        declared_size: received,
        extension,
    })
}

fn image_response(result: OptimizedResult) -> Response {
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, result.content_type())],
        result.data,
    )
        .into_response();

    let headers = response.headers_mut();
    headers.insert("x-image-width", HeaderValue::from(result.width));
    headers.insert("x-image-height", HeaderValue::from(result.height));
    response
}

#[utoipa::path(
    post,
    path = "/api/upload",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Optimized image bytes", content_type = "image/webp"),
        (status = 400, description = "Missing file, unsupported type or file too large", body = ErrorBody),
        (status = 500, description = "Image could not be decoded, encoded or stored", body = ErrorBody),
        (status = 503, description = "Server is shutting down", body = ErrorBody)
    ),
    tag = "images"
)]
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let limit = state.optimizer.config().max_file_size;
    let mut image: Option<UploadedImage> = None;
    let mut format: Option<String> = None;

    info!(stage = %RequestStage::Received, "Upload received");

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| map_multipart_error(e, limit))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == "image" {
            if image.is_some() {
                warn!("Ignoring extra image part, one image per request");
                continue;
            }
            image = Some(read_image_field(field, limit).await?);
        } else if name == "format" {
            let text = field.text().await.map_err(|e| map_multipart_error(e, limit))?;
            if !text.trim().is_empty() {
                format = Some(text);
            }
        }
    }

    // Run the pipeline on its own task: a client hanging up must not cancel
    // a transcode halfway or race its cleanup.
    let optimizer = state.optimizer.clone();
    let outcome = tokio::spawn(async move { optimizer.optimize(image, format.as_deref()).await })
        .await
        .map_err(|e| AppError::Internal(format!("Pipeline task failed: {}", e)))?;

    match outcome {
        Ok(result) => {
            info!(stage = %RequestStage::Responded, bytes = result.size, "Sending optimized image");
            Ok(image_response(result))
        }
        Err(e) => {
            info!(stage = %RequestStage::ErrorResponded, code = e.code(), "Sending error response");
            Err(e)
        }
    }
}
