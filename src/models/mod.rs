use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use utoipa::ToSchema;

/// An image part received from the client, held in memory until validated.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub data: Bytes,
    pub content_type: String,
    /// Bytes received for the part. May exceed `data.len()` when the reader
    /// stopped buffering an oversized upload.
    pub declared_size: usize,
    pub extension: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Input,
    Output,
}

impl FileRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileRole::Input => "input",
            FileRole::Output => "output",
        }
    }
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file materialized in the temp directory for one request.
///
/// The request that allocated it owns it until the path is handed to the
/// cleanup manager, which is then the only thing allowed to delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub role: FileRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Webp,
    Jpeg,
    Png,
    Avif,
}

impl OutputFormat {
    /// Resolve the client's `format` field. Missing or unknown values fall
    /// back to WebP rather than failing the request.
    pub fn negotiate(requested: Option<&str>) -> Self {
        requested.and_then(Self::parse).unwrap_or_default()
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "webp" => Some(OutputFormat::Webp),
            "jpeg" | "jpg" => Some(OutputFormat::Jpeg),
            "png" => Some(OutputFormat::Png),
            "avif" => Some(OutputFormat::Avif),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Avif => "avif",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "image/webp",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Avif => "image/avif",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Avif => "avif",
        })
    }
}

/// Per-request encode parameters derived from the config and `format` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeSpec {
    pub format: OutputFormat,
    pub max_width: u32,
    pub quality: u8,
    pub avif_speed: u8,
}

#[derive(Debug, Clone)]
pub struct OptimizedResult {
    pub data: Bytes,
    pub size: usize,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

impl OptimizedResult {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

/// Lifecycle of one upload request, attached to pipeline log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Validated,
    InputStored,
    Transcoding,
    Completed,
    Failed,
    Responded,
    ErrorResponded,
    CleanupScheduled,
    CleanedUp,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStage::Received => "received",
            RequestStage::Validated => "validated",
            RequestStage::InputStored => "input_stored",
            RequestStage::Transcoding => "transcoding",
            RequestStage::Completed => "completed",
            RequestStage::Failed => "failed",
            RequestStage::Responded => "responded",
            RequestStage::ErrorResponded => "error_responded",
            RequestStage::CleanupScheduled => "cleanup_scheduled",
            RequestStage::CleanedUp => "cleaned_up",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_known_formats() {
        assert_eq!(OutputFormat::negotiate(Some("webp")), OutputFormat::Webp);
        assert_eq!(OutputFormat::negotiate(Some("jpeg")), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::negotiate(Some("jpg")), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::negotiate(Some(" PNG ")), OutputFormat::Png);
        assert_eq!(OutputFormat::negotiate(Some("avif")), OutputFormat::Avif);
    }

    #[test]
    fn test_negotiate_falls_back_to_webp() {
        assert_eq!(OutputFormat::negotiate(None), OutputFormat::Webp);
        assert_eq!(OutputFormat::negotiate(Some("")), OutputFormat::Webp);
        assert_eq!(OutputFormat::negotiate(Some("tiff")), OutputFormat::Webp);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(OutputFormat::Jpeg.content_type(), "image/jpeg");
        assert_eq!(OutputFormat::Jpeg.extension(), "jpg");
        assert_eq!(OutputFormat::Avif.content_type(), "image/avif");
        assert_eq!(OutputFormat::Webp.to_string(), "webp");
    }
}
