use crate::config::OptimizerConfig;
use crate::services::storage::{StorageError, TempStorage};
use tracing::info;

/// Creates the temp directory and resolves it to an absolute path.
pub async fn setup_storage(config: &OptimizerConfig) -> Result<TempStorage, StorageError> {
    let mut storage = TempStorage::new(&config.temp_dir);
    storage.ensure_dir().await?;

    info!("📁 Temp storage: {}", storage.root().display());
    Ok(storage)
}
