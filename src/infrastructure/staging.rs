use crate::config::IngestConfig;
use crate::services::staging::StagingStore;
use std::sync::Arc;
use tracing::info;

pub async fn setup_staging(config: &IngestConfig) -> anyhow::Result<Arc<StagingStore>> {
    let staging = StagingStore::new(&config.staging_dir, config.staging_extension());
    staging.prepare().await?;

    info!("📁 Staging directory: {:?}", staging.dir());

    Ok(Arc::new(staging))
}
