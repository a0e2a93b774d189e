use crate::services::classifier::LabelPolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the ingestion pipeline
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Maximum upload size in bytes (default: 5 MB)
    pub max_upload_size: usize,

    /// The only content type accepted on `/upload` (default: "image/jpeg")
    pub accepted_content_type: String,

    /// Directory holding staged uploads while they are classified
    pub staging_dir: PathBuf,

    /// Classifier executable (default: "python3")
    pub classifier_program: String,

    /// Arguments placed before the staged file path (default: "ml_model/detect.py")
    pub classifier_args: Vec<String>,

    /// Class name that marks an image worth keeping (default: "cat")
    pub target_label: String,

    /// Upper bound on a single classifier run (default: 30s)
    pub classifier_timeout: Duration,

    /// Which token wins when the classifier prints more than one
    pub label_policy: LabelPolicy,

    /// Database URL (default: local SQLite file)
    pub database_url: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 5 * 1024 * 1024, // 5 MB
            accepted_content_type: mime::IMAGE_JPEG.to_string(),
            staging_dir: PathBuf::from("uploads/staging"),
            classifier_program: "python3".to_string(),
            classifier_args: vec!["ml_model/detect.py".to_string()],
            target_label: "cat".to_string(),
            classifier_timeout: Duration::from_secs(30),
            label_policy: LabelPolicy::Last,
            database_url: "sqlite://camtrap.db?mode=rwc".to_string(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_upload_size: env::var("MAX_UPLOAD_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_upload_size),

            accepted_content_type: env::var("ACCEPTED_CONTENT_TYPE")
                .unwrap_or(default.accepted_content_type),

            staging_dir: env::var("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.staging_dir),

            classifier_program: env::var("CLASSIFIER_PROGRAM")
                .unwrap_or(default.classifier_program),

            classifier_args: env::var("CLASSIFIER_ARGS")
                .map(|v| split_args(&v))
                .unwrap_or(default.classifier_args),

            target_label: env::var("TARGET_LABEL").unwrap_or(default.target_label),

            classifier_timeout: env::var("CLASSIFIER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.classifier_timeout),

            label_policy: env::var("LABEL_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.label_policy),

            database_url: env::var("DATABASE_URL").unwrap_or(default.database_url),
        }
    }

    /// File extension used for staged files, derived from the accepted type
    pub fn staging_extension(&self) -> &'static str {
        match self.accepted_content_type.as_str() {
            "image/jpeg" => "jpg",
            "image/png" => "png",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "bin",
        }
    }
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
