use crate::api::error::AppError;
use crate::config::OptimizerConfig;
use crate::models::{
    FileRole, OptimizedResult, OutputFormat, RequestStage, StoredFile, TranscodeSpec, UploadedImage,
};
use crate::services::cleanup::CleanupManager;
use crate::services::storage::{StorageError, TempStorage};
use crate::services::transcoder::TranscodePool;
use crate::utils::validation::validate_upload;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs one upload through validate → store → transcode, and makes sure
/// every file it created is handed to the cleanup manager whatever happens.
pub struct OptimizerService {
    config: Arc<OptimizerConfig>,
    storage: TempStorage,
    pool: TranscodePool,
    cleanup: CleanupManager,
}

/// Paths created so far by one request. Dropping it schedules their deletion,
/// which also covers early returns and panics in the pipeline.
struct Allocations {
    cleanup: CleanupManager,
    paths: Vec<PathBuf>,
}

impl Allocations {
    fn new(cleanup: CleanupManager) -> Self {
        Self {
            cleanup,
            paths: Vec::with_capacity(2),
        }
    }

    fn track(&mut self, file: &StoredFile) {
        self.paths.push(file.path.clone());
    }

    /// Drops a path we turned out not to own
    fn forget(&mut self, file: &StoredFile) {
        self.paths.retain(|p| p != &file.path);
    }
}

impl Drop for Allocations {
    fn drop(&mut self) {
        let paths = std::mem::take(&mut self.paths);
        if !paths.is_empty() {
            tracing::debug!(stage = %RequestStage::CleanupScheduled, files = paths.len(), "Scheduling cleanup");
            self.cleanup.schedule(paths);
        }
    }
}

impl OptimizerService {
    pub fn new(
        config: Arc<OptimizerConfig>,
        storage: TempStorage,
        pool: TranscodePool,
        cleanup: CleanupManager,
    ) -> Self {
        Self {
            config,
            storage,
            pool,
            cleanup,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn storage(&self) -> &TempStorage {
        &self.storage
    }

    pub fn pool(&self) -> &TranscodePool {
        &self.pool
    }

    pub fn cleanup(&self) -> &CleanupManager {
        &self.cleanup
    }

    pub fn transcode_spec(&self, format: OutputFormat) -> TranscodeSpec {
        TranscodeSpec {
            format,
            max_width: self.config.max_width,
            quality: self.config.quality.for_format(format),
            avif_speed: self.config.avif_speed,
        }
    }

    /// Validates and transcodes `image` into the negotiated format.
    ///
    /// Validation failures return before any file is created. Every file
    /// created afterwards is scheduled for deletion before this returns.
    pub async fn optimize(
        &self,
        image: Option<UploadedImage>,
        requested_format: Option<&str>,
    ) -> Result<OptimizedResult, AppError> {
        let image = validate_upload(image, &self.config)?;

        let format = OutputFormat::negotiate(requested_format);
        if let Some(requested) = requested_format.filter(|f| !f.trim().is_empty()) {
            if OutputFormat::parse(requested).is_none() {
                warn!(requested, negotiated = %format, "Unknown output format requested, using default");
            }
        }

        info!(
            stage = %RequestStage::Validated,
            content_type = %image.content_type,
            size = image.declared_size,
            format = %format,
            "Upload accepted"
        );

        let mut allocations = Allocations::new(self.cleanup.clone());

        let input = self.storage.allocate(FileRole::Input, &image.extension).await?;
        allocations.track(&input);
        if let Err(e) = self.storage.persist(&input, &image.data).await {
            if matches!(e, StorageError::Collision { .. }) {
                allocations.forget(&input);
            }
            return Err(e.into());
        }
        info!(stage = %RequestStage::InputStored, path = %input.path.display(), "Input stored");

        let output = self.storage.allocate(FileRole::Output, format.extension()).await?;
        allocations.track(&output);

        info!(stage = %RequestStage::Transcoding, "Transcoding");
        let spec = self.transcode_spec(format);
        let result = self
            .pool
            .run(input.path.clone(), output.path.clone(), spec)
            .await;

        match &result {
            Ok(optimized) => info!(
                stage = %RequestStage::Completed,
                width = optimized.width,
                height = optimized.height,
                bytes = optimized.size,
                content_type = optimized.content_type(),
                "Image optimized"
            ),
            Err(e) => {
                if e.is_collision_on(&output.path) {
                    allocations.forget(&output);
                }
                error!(stage = %RequestStage::Failed, error = %e, "Image processing error");
            }
        }

        // `allocations` drops here and hands the paths to the cleanup worker
        result.map_err(AppError::from)
    }
}
