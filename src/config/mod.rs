use crate::models::OutputFormat;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Per-format encoder quality (1-100)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatQuality {
    pub jpeg: u8,
    /// Only used for lossy WebP encoders; the bundled encoder is lossless
    pub webp: u8,
    /// Mapped to compression effort, PNG is always lossless
    pub png: u8,
    pub avif: u8,
}

impl Default for FormatQuality {
    fn default() -> Self {
        Self {
            jpeg: 80,
            webp: 80,
            png: 80,
            avif: 80,
        }
    }
}

impl FormatQuality {
    pub fn for_format(&self, format: OutputFormat) -> u8 {
        match format {
            OutputFormat::Jpeg => self.jpeg,
            OutputFormat::Webp => self.webp,
            OutputFormat::Png => self.png,
            OutputFormat::Avif => self.avif,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{name} must be between 1 and 100, got {value}")]
    Quality { name: &'static str, value: u8 },

    #[error("AVIF speed must be between 1 and 10, got {0}")]
    AvifSpeed(u8),

    #[error("At least one allowed MIME type is required")]
    NoMimeTypes,
}

/// Image optimizer configuration
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum upload size in bytes (default: 10 MiB)
    pub max_file_size: usize,

    /// Accepted declared MIME types for the uploaded image
    pub allowed_mime_types: Vec<String>,

    /// Output images are never wider than this (default: 800)
    pub max_width: u32,

    pub quality: FormatQuality,

    /// AVIF encoder speed, 1 (slowest, smallest) to 10 (fastest) (default: 6)
    pub avif_speed: u8,

    /// Directory holding request input/output files (default: "./uploads")
    pub temp_dir: PathBuf,

    /// Delete attempts per file before giving up (default: 3)
    pub cleanup_max_attempts: u32,

    /// Base backoff between delete attempts, multiplied by the attempt number (default: 100ms)
    pub cleanup_backoff: Duration,

    /// Settle delay before a cleanup job starts deleting (default: 100ms)
    pub cleanup_delay: Duration,

    /// Bounded cleanup queue capacity (default: 1024)
    pub cleanup_queue_capacity: usize,

    /// Concurrent transcodes admitted at once (default: available parallelism)
    pub max_concurrent_transcodes: usize,

    /// Allowed CORS origins, "*" allows any
    pub allowed_origins: Vec<String>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024, // 10 MiB
            allowed_mime_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/gif".to_string(),
                "image/webp".to_string(),
            ],
            max_width: 800,
            quality: FormatQuality::default(),
            avif_speed: 6,
            temp_dir: PathBuf::from("./uploads"),
            cleanup_max_attempts: 3,
            cleanup_backoff: Duration::from_millis(100),
            cleanup_delay: Duration::from_millis(100),
            cleanup_queue_capacity: 1024,
            max_concurrent_transcodes: default_parallelism(),
            allowed_origins: vec!["*".to_string()],
        }
    }
}

impl OptimizerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_file_size: env_parse("MAX_FILE_SIZE").unwrap_or(default.max_file_size),

            allowed_mime_types: env_list("ALLOWED_MIME_TYPES")
                .map(|types| types.into_iter().map(|t| t.to_lowercase()).collect())
                .unwrap_or(default.allowed_mime_types),

            max_width: env_parse("MAX_WIDTH").unwrap_or(default.max_width),

            quality: FormatQuality {
                jpeg: env_parse("JPEG_QUALITY").unwrap_or(default.quality.jpeg),
                webp: env_parse("WEBP_QUALITY").unwrap_or(default.quality.webp),
                png: env_parse("PNG_QUALITY").unwrap_or(default.quality.png),
                avif: env_parse("AVIF_QUALITY").unwrap_or(default.quality.avif),
            },

            avif_speed: env_parse("AVIF_SPEED").unwrap_or(default.avif_speed),

            temp_dir: env::var("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.temp_dir),

            cleanup_max_attempts: env_parse("CLEANUP_MAX_ATTEMPTS")
                .unwrap_or(default.cleanup_max_attempts),

            cleanup_backoff: env_parse("CLEANUP_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.cleanup_backoff),

            cleanup_delay: env_parse("CLEANUP_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.cleanup_delay),

            cleanup_queue_capacity: env_parse("CLEANUP_QUEUE_CAPACITY")
                .unwrap_or(default.cleanup_queue_capacity),

            max_concurrent_transcodes: env_parse("MAX_CONCURRENT_TRANSCODES")
                .unwrap_or(default.max_concurrent_transcodes),

            allowed_origins: env_list("ALLOWED_ORIGINS").unwrap_or(default.allowed_origins),
        }
    }

    /// Config for tests and local runs: short cleanup timings, files under `temp_dir`
    pub fn development(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            cleanup_backoff: Duration::from_millis(10),
            cleanup_delay: Duration::from_millis(10),
            max_concurrent_transcodes: 2,
            avif_speed: 10,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_file_size == 0 {
            return Err(ConfigError::Zero("MAX_FILE_SIZE"));
        }
        if self.max_width == 0 {
            return Err(ConfigError::Zero("MAX_WIDTH"));
        }
        if self.cleanup_max_attempts == 0 {
            return Err(ConfigError::Zero("CLEANUP_MAX_ATTEMPTS"));
        }
        if self.cleanup_queue_capacity == 0 {
            return Err(ConfigError::Zero("CLEANUP_QUEUE_CAPACITY"));
        }
        if self.max_concurrent_transcodes == 0 {
            return Err(ConfigError::Zero("MAX_CONCURRENT_TRANSCODES"));
        }
        if self.allowed_mime_types.is_empty() {
            return Err(ConfigError::NoMimeTypes);
        }

        let qualities = [
            ("JPEG_QUALITY", self.quality.jpeg),
            ("WEBP_QUALITY", self.quality.webp),
            ("PNG_QUALITY", self.quality.png),
            ("AVIF_QUALITY", self.quality.avif),
        ];
        for (name, value) in qualities {
            if !(1..=100).contains(&value) {
                return Err(ConfigError::Quality { name, value });
            }
        }

        if !(1..=10).contains(&self.avif_speed) {
            return Err(ConfigError::AvifSpeed(self.avif_speed));
        }

        Ok(())
    }

    /// Transport-level body limit: the image itself plus multipart framing
    pub fn body_limit(&self) -> usize {
        self.max_file_size.saturating_add(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OptimizerConfig::default();
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.max_width, 800);
        assert_eq!(config.quality.for_format(OutputFormat::Webp), 80);
        assert_eq!(config.cleanup_max_attempts, 3);
        assert_eq!(config.cleanup_backoff, Duration::from_millis(100));
        assert_eq!(config.allowed_mime_types.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = OptimizerConfig::development("/tmp/optimizer-test");
        assert_eq!(config.temp_dir, PathBuf::from("/tmp/optimizer-test"));
        assert!(config.cleanup_delay < Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_quality() {
        let mut config = OptimizerConfig::default();
        config.quality.avif = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Quality {
                name: "AVIF_QUALITY",
                value: 0
            })
        );

        config.quality.avif = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = OptimizerConfig {
            max_width: 0,
            ..OptimizerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("MAX_WIDTH")));

        let config = OptimizerConfig {
            allowed_mime_types: Vec::new(),
            ..OptimizerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoMimeTypes));
    }

    #[test]
    fn test_body_limit_adds_multipart_overhead() {
        let config = OptimizerConfig::default();
        assert_eq!(config.body_limit(), 11 * 1024 * 1024);

        let huge = OptimizerConfig {
            max_file_size: usize::MAX - 10,
            ..OptimizerConfig::default()
        };
        assert_eq!(huge.body_limit(), usize::MAX);
    }
}
