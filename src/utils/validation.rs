use crate::config::OptimizerConfig;
use crate::models::UploadedImage;
use std::path::Path;
use thiserror::Error;

/// Longest extension kept from a client filename
const MAX_EXTENSION_LEN: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No image file provided")]
    NoFileProvided,

    #[error("Invalid file type '{0}'. Only JPEG, PNG, GIF, and WebP are allowed.")]
    InvalidFileType(String),

    #[error("File exceeds maximum allowed size of {}", describe_limit(.max))]
    PayloadTooLarge { max: usize },
}

const MIB: usize = 1024 * 1024;

/// `1024 bytes`, or `10485760 bytes (10 MB)` once the limit reaches a MiB
fn describe_limit(max: &usize) -> String {
    let max = *max;
    if max >= MIB {
        format!("{} bytes ({} MB)", max, max / MIB)
    } else {
        format!("{} bytes", max)
    }
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::NoFileProvided => "NO_FILE_PROVIDED",
            ValidationError::InvalidFileType(_) => "INVALID_FILE_TYPE",
            ValidationError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
        }
    }
}

/// Strips parameters and lowercases, e.g. `Image/JPEG; q=1` -> `image/jpeg`.
/// Falls back to a manual split when the value does not parse as a MIME type.
pub fn normalize_mime_type(content_type: &str) -> String {
    match content_type.trim().parse::<mime::Mime>() {
        Ok(parsed) => parsed.essence_str().to_lowercase(),
        Err(_) => content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase(),
    }
}

/// Validates MIME type against the configured allowlist
pub fn validate_mime_type(content_type: &str, allowed: &[String]) -> Result<(), ValidationError> {
    let normalized = normalize_mime_type(content_type);

    if allowed.iter().any(|a| a.eq_ignore_ascii_case(&normalized)) {
        return Ok(());
    }

    Err(ValidationError::InvalidFileType(content_type.to_string()))
}

/// Validates file size against maximum limit
pub fn validate_file_size(size: usize, max_size: usize) -> Result<(), ValidationError> {
    if size > max_size {
        tracing::debug!(size, max_size, "Upload rejected as too large");
        return Err(ValidationError::PayloadTooLarge { max: max_size });
    }
    Ok(())
}

/// Checks an upload before anything touches the disk.
pub fn validate_upload(
    image: Option<UploadedImage>,
    config: &OptimizerConfig,
) -> Result<UploadedImage, ValidationError> {
    let image = image.ok_or(ValidationError::NoFileProvided)?;

    validate_mime_type(&image.content_type, &config.allowed_mime_types)?;
    validate_file_size(image.declared_size, config.max_file_size)?;

    Ok(image)
}

/// A `..` component, with either separator
pub fn is_traversal_attempt(name: &str) -> bool {
    name.split(['/', '\\']).any(|part| part == "..")
}

/// Derives a safe extension for the stored input file.
///
/// Only the final path component of `filename` is considered, so traversal
/// attempts like `../../x.png` still yield `png`. Without a usable extension
/// one is derived from the MIME type.
pub fn sanitize_extension(filename: Option<&str>, content_type: &str) -> String {
    if let Some(name) = filename.filter(|name| is_traversal_attempt(name)) {
        tracing::warn!("Path traversal attempt detected in upload name: {}", name);
    }

    let from_name = filename
        .and_then(|name| {
            // Treat backslashes as separators too, browsers on Windows send them
            let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
            Path::new(name)
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_ascii_lowercase())
        })
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        });

    if let Some(ext) = from_name {
        return ext;
    }

    match normalize_mime_type(content_type).as_str() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
    .to_string()
}
