use crate::api::error::AppError;
use crate::config::IngestConfig;
use crate::services::classifier::{ClassificationOutcome, Classifier};
use crate::services::gallery::ImageStore;
use crate::services::staging::{StagedFile, StagingStore};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, info_span, warn};

/// Where the background half of an upload ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Target detected and stored under this id
    Persisted(i32),
    /// Classifier ran and did not find the target
    Discarded,
    /// Classifier could not produce a verdict
    ClassifyFailed(String),
    /// Target detected but the database write failed
    StoreFailed(String),
}

/// Owns the lifecycle of one upload: validate, stage, hand back to the
/// handler, then classify, persist or discard, and release the staged file.
pub struct IngestionService {
    staging: Arc<StagingStore>,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn ImageStore>,
    tracker: TaskTracker,
    content_type: String,
    max_upload_size: usize,
}

impl IngestionService {
    pub fn new(
        staging: Arc<StagingStore>,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn ImageStore>,
        tracker: TaskTracker,
        config: &IngestConfig,
    ) -> Self {
        Self {
            staging,
            classifier,
            store,
            tracker,
            content_type: config.accepted_content_type.clone(),
            max_upload_size: config.max_upload_size,
        }
    }

    /// Validates the payload and stages it. Errors here are reported to the
    /// uploader.
    pub async fn accept(
        &self,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Result<StagedFile, AppError> {
        self.validate(content_type, data)?;
        Ok(self.staging.stage(data).await?)
    }

    fn validate(&self, content_type: Option<&str>, data: &[u8]) -> Result<(), AppError> {
        if data.is_empty() {
            return Err(AppError::BadRequest("Empty upload".to_string()));
        }

        if data.len() > self.max_upload_size {
            return Err(AppError::PayloadTooLarge(format!(
                "Upload is {} bytes, limit is {}",
                data.len(),
                self.max_upload_size
            )));
        }

        let declared = content_type
            .and_then(|v| v.split(';').next())
            .map(str::trim)
            .unwrap_or_default();
        if !declared.eq_ignore_ascii_case(&self.content_type) {
            return Err(AppError::UnsupportedMediaType(format!(
                "Expected {}, got '{}'",
                self.content_type, declared
            )));
        }

        let detected = infer::get(data).map(|kind| kind.mime_type());
        if detected != Some(self.content_type.as_str()) {
            return Err(AppError::BadRequest(format!(
                "Payload is not a valid {} image",
                self.content_type
            )));
        }

        Ok(())
    }

    /// Runs the background pipeline for a staged upload on the shared
    /// tracker. A supervisor task releases the staged file if the pipeline
    /// panics.
    pub fn spawn_pipeline(
        self: &Arc<Self>,
        staged: StagedFile,
        data: Bytes,
        request_id: String,
    ) -> tokio::task::JoinHandle<Option<PipelineOutcome>> {
        let span = info_span!("pipeline", upload_id = %staged.id, request_id = %request_id);

        let service = Arc::clone(self);
        let pipeline_staged = staged.clone();
        let pipeline = self.tracker.spawn(
            async move { service.run_pipeline(&pipeline_staged, &data).await }
                .instrument(span.clone()),
        );

        let staging = Arc::clone(&self.staging);
        self.tracker.spawn(
            async move {
                match pipeline.await {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        error!("Pipeline task aborted: {}", e);
                        // A classifier still running was sent SIGKILL through
                        // kill_on_drop but is not reaped here. It may still
                        // hold the file open while it is unlinked, which unix
                        // allows.
                        if let Err(e) = staging.release(&staged).await {
                            error!("Failed to release staged file after abort: {}", e);
                        }
                        None
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Classify, then persist or discard. The staged file is released on
    /// every path before returning.
    pub async fn run_pipeline(&self, staged: &StagedFile, data: &[u8]) -> PipelineOutcome {
        let outcome = match self.classifier.classify(staged).await {
            ClassificationOutcome::Detected(label) => {
                match self.store.persist(data, &self.content_type, &label).await {
                    Ok(id) => {
                        info!("📸 Detected '{}', stored as image {}", label, id);
                        PipelineOutcome::Persisted(id)
                    }
                    Err(e) => {
                        error!("Failed to store detected image: {}", e);
                        PipelineOutcome::StoreFailed(e.to_string())
                    }
                }
            }
            ClassificationOutcome::NotDetected => {
                info!("🗑️  Target not detected, discarding upload");
                PipelineOutcome::Discarded
            }
            ClassificationOutcome::Failed(e) => {
                warn!("Classification failed, discarding upload: {}", e);
                PipelineOutcome::ClassifyFailed(e.to_string())
            }
        };

        if let Err(e) = self.staging.release(staged).await {
            error!("Failed to release staged file: {}", e);
        }

        outcome
    }
}
