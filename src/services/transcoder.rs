use crate::models::{OptimizedResult, OutputFormat, TranscodeSpec};
use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode {format}: {reason}")]
    Encode {
        format: OutputFormat,
        reason: String,
    },

    #[error("Filesystem error on {path}: {source}")]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Transcode pool is shut down")]
    PoolClosed,

    #[error("Transcode task failed: {0}")]
    Join(String),
}

impl TranscodeError {
    /// The output path belonged to someone else when we tried to create it
    pub fn is_collision_on(&self, output: &Path) -> bool {
        matches!(
            self,
            TranscodeError::Filesystem { path, source }
                if path == output && source.kind() == std::io::ErrorKind::AlreadyExists
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            TranscodeError::Decode(_) => "DECODE_ERROR",
            TranscodeError::Encode { .. } => "ENCODE_ERROR",
            TranscodeError::Filesystem { .. } => "FILESYSTEM_ERROR",
            TranscodeError::PoolClosed => "SERVICE_UNAVAILABLE",
            TranscodeError::Join(_) => "INTERNAL_ERROR",
        }
    }
}

/// Output size for an image limited to `max_width`, preserving aspect ratio.
/// Images already narrow enough keep their size; nothing is ever enlarged.
pub fn target_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || width == 0 {
        return (width, height);
    }

    let scaled = (height as f64 * max_width as f64 / width as f64).round() as u32;
    (max_width, scaled.max(1))
}

pub fn resize_to_fit(img: DynamicImage, max_width: u32) -> DynamicImage {
    let (width, height) = (img.width(), img.height());
    let (target_w, target_h) = target_dimensions(width, height, max_width);

    if (target_w, target_h) == (width, height) {
        return img;
    }
    img.resize_exact(target_w, target_h, FilterType::Lanczos3)
}

/// PNG is lossless, so "quality" selects compression effort instead.
fn png_compression(quality: u8) -> CompressionType {
    match quality {
        0..=33 => CompressionType::Fast,
        34..=66 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

/// Encoders below only accept 8-bit buffers
fn to_8bit(img: &DynamicImage) -> DynamicImage {
    if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    }
}

pub fn encode_image(img: &DynamicImage, spec: &TranscodeSpec) -> Result<Vec<u8>, TranscodeError> {
    let mut buf = Cursor::new(Vec::new());
    let encode_err = |e: image::ImageError| TranscodeError::Encode {
        format: spec.format,
        reason: e.to_string(),
    };

    match spec.format {
        OutputFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, spec.quality);
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(encode_err)?;
        }
        OutputFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut buf,
                png_compression(spec.quality),
                PngFilterType::Adaptive,
            );
            to_8bit(img).write_with_encoder(encoder).map_err(encode_err)?;
        }
        OutputFormat::Webp => {
            // The bundled WebP encoder is lossless only; quality has no effect here
            let encoder = WebPEncoder::new_lossless(&mut buf);
            to_8bit(img).write_with_encoder(encoder).map_err(encode_err)?;
        }
        OutputFormat::Avif => {
            let encoder = AvifEncoder::new_with_speed_quality(&mut buf, spec.avif_speed, spec.quality);
            to_8bit(img).write_with_encoder(encoder).map_err(encode_err)?;
        }
    }

    Ok(buf.into_inner())
}

/// Decodes `input`, resizes, encodes per `spec` and writes the result to `output`.
///
/// Blocking; run it through [`TranscodePool`] from async code. On failure the
/// output file may already exist and still needs cleanup.
pub fn transcode(
    input: &Path,
    output: &Path,
    spec: &TranscodeSpec,
) -> Result<OptimizedResult, TranscodeError> {
    let fs_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| TranscodeError::Filesystem { path, source }
    };

    // Sniff the real format; the extension only comes from the client filename
    let reader = ImageReader::open(input)
        .map_err(fs_err(input))?
        .with_guessed_format()
        .map_err(fs_err(input))?;

    let img = reader
        .decode()
        .map_err(|e| TranscodeError::Decode(e.to_string()))?;
    let (src_w, src_h) = (img.width(), img.height());

    let resized = resize_to_fit(img, spec.max_width);
    let (width, height) = (resized.width(), resized.height());
    let encoded = encode_image(&resized, spec)?;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .map_err(fs_err(output))?;
    file.write_all(&encoded).map_err(fs_err(output))?;

    debug!(
        src_width = src_w,
        src_height = src_h,
        width,
        height,
        format = %spec.format,
        bytes = encoded.len(),
        "Transcoded image"
    );

    Ok(OptimizedResult {
        size: encoded.len(),
        data: Bytes::from(encoded),
        format: spec.format,
        width,
        height,
    })
}

/// Caps how many transcodes run at once and keeps them off the async workers.
#[derive(Debug, Clone)]
pub struct TranscodePool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TranscodePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn run(
        &self,
        input: PathBuf,
        output: PathBuf,
        spec: TranscodeSpec,
    ) -> Result<OptimizedResult, TranscodeError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TranscodeError::PoolClosed)?;

        debug!(
            available = self.semaphore.available_permits(),
            capacity = self.capacity,
            "Transcode slot acquired"
        );

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            transcode(&input, &output, &spec)
        })
        .await
        .map_err(|e| TranscodeError::Join(e.to_string()))?
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

    fn spec(format: OutputFormat) -> TranscodeSpec {
        TranscodeSpec {
            format,
            max_width: 800,
            quality: 80,
            avif_speed: 10,
        }
    }

    fn write_jpeg(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 40, 90]));
        DynamicImage::ImageRgb8(img)
            .save_with_format(path, ImageFormat::Jpeg)
            .unwrap();
    }

    #[test]
    fn test_target_dimensions() {
        assert_eq!(target_dimensions(2000, 1000, 800), (800, 400));
        assert_eq!(target_dimensions(1600, 1200, 800), (800, 600));
        assert_eq!(target_dimensions(800, 300, 800), (800, 300));
        // No enlargement
        assert_eq!(target_dimensions(320, 240, 800), (320, 240));
        // Extreme panoramas keep at least one row
        assert_eq!(target_dimensions(100_000, 10, 800), (800, 1));
    }

    #[test]
    fn test_target_dimensions_never_exceed_input_or_limit() {
        for width in [1u32, 7, 799, 800, 801, 1234, 4096] {
            for height in [1u32, 3, 600, 5000] {
                let (w, h) = target_dimensions(width, height, 800);
                assert!(w <= width.min(800));
                assert!(h <= height);
            }
        }
    }

    #[test]
    fn test_png_compression_mapping() {
        assert!(matches!(png_compression(10), CompressionType::Fast));
        assert!(matches!(png_compression(50), CompressionType::Default));
        assert!(matches!(png_compression(80), CompressionType::Best));
    }

    #[test]
    fn test_encode_jpeg_drops_alpha() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([1, 2, 3, 128])));
        let data = encode_image(&img, &spec(OutputFormat::Jpeg)).unwrap();
        assert_eq!(&data[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_encode_png() {
        let img = DynamicImage::new_rgb8(10, 10);
        let data = encode_image(&img, &spec(OutputFormat::Png)).unwrap();
        assert_eq!(&data[0..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn test_encode_webp_from_16bit() {
        let img = DynamicImage::new_rgb16(10, 10);
        let data = encode_image(&img, &spec(OutputFormat::Webp)).unwrap();
        assert_eq!(&data[0..4], b"RIFF");
        assert_eq!(&data[8..12], b"WEBP");
    }

    #[test]
    fn test_encode_avif() {
        let img = DynamicImage::new_rgb8(16, 16);
        let data = encode_image(&img, &spec(OutputFormat::Avif)).unwrap();
        assert_eq!(&data[4..8], b"ftyp");
    }

    #[test]
    fn test_transcode_downscales_and_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.jpg");
        let output = dir.path().join("out.webp");
        write_jpeg(&input, 2000, 1000);

        let result = transcode(&input, &output, &spec(OutputFormat::Webp)).unwrap();
        assert_eq!((result.width, result.height), (800, 400));
        assert_eq!(result.content_type(), "image/webp");
        assert_eq!(result.size, result.data.len());
        assert_eq!(std::fs::read(&output).unwrap(), result.data.as_ref());

        let decoded = image::load_from_memory(&result.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (800, 400));
    }

    #[test]
    fn test_transcode_never_upscales() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("small.jpg");
        let output = dir.path().join("small.png");
        write_jpeg(&input, 120, 90);

        let result = transcode(&input, &output, &spec(OutputFormat::Png)).unwrap();
        assert_eq!((result.width, result.height), (120, 90));
    }

    #[test]
    fn test_transcode_sniffs_format_over_extension() {
        let dir = tempfile::tempdir().unwrap();
        // JPEG bytes behind a .png name
        let input = dir.path().join("lying.png");
        let output = dir.path().join("out.jpg");
        write_jpeg(&input, 50, 50);

        let result = transcode(&input, &output, &spec(OutputFormat::Jpeg)).unwrap();
        assert_eq!(result.format, OutputFormat::Jpeg);
    }

    #[test]
    fn test_transcode_corrupt_input_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("broken.jpg");
        let output = dir.path().join("out.webp");
        std::fs::write(&input, b"definitely not a jpeg").unwrap();

        let err = transcode(&input, &output, &spec(OutputFormat::Webp)).unwrap_err();
        assert_eq!(err.code(), "DECODE_ERROR");
        assert!(!output.exists());
    }

    #[test]
    fn test_transcode_missing_input_is_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = transcode(
            &dir.path().join("missing.jpg"),
            &dir.path().join("out.webp"),
            &spec(OutputFormat::Webp),
        )
        .unwrap_err();
        assert_eq!(err.code(), "FILESYSTEM_ERROR");
    }

    #[test]
    fn test_transcode_never_overwrites_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.jpg");
        let output = dir.path().join("taken.webp");
        write_jpeg(&input, 10, 10);
        std::fs::write(&output, b"someone else").unwrap();

        let err = transcode(&input, &output, &spec(OutputFormat::Webp)).unwrap_err();
        assert!(err.is_collision_on(&output));
        assert_eq!(std::fs::read(&output).unwrap(), b"someone else");
    }

    #[test]
    fn test_transcode_unwritable_output_is_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.jpg");
        write_jpeg(&input, 10, 10);

        let output = dir.path().join("no-such-dir").join("out.webp");
        let err = transcode(&input, &output, &spec(OutputFormat::Webp)).unwrap_err();
        assert!(matches!(err, TranscodeError::Filesystem { .. }));
    }

    #[tokio::test]
    async fn test_pool_runs_and_releases_permits() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.jpg");
        write_jpeg(&input, 900, 300);

        let pool = TranscodePool::new(2);
        let result = pool
            .run(input, dir.path().join("out.jpg"), spec(OutputFormat::Jpeg))
            .await
            .unwrap();
        assert_eq!((result.width, result.height), (800, 267));
        assert_eq!(pool.available(), pool.capacity());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_work() {
        let pool = TranscodePool::new(1);
        pool.close();
        let err = pool
            .run(
                PathBuf::from("in.jpg"),
                PathBuf::from("out.jpg"),
                spec(OutputFormat::Jpeg),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::PoolClosed));
    }
}
