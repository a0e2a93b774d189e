use crate::config::IngestConfig;
use crate::services::classifier::{Classifier, SubprocessClassifier};
use std::sync::Arc;
use tracing::info;

pub async fn setup_classifier(config: &IngestConfig) -> Arc<dyn Classifier> {
    let classifier = SubprocessClassifier::from_config(config);

    if classifier.health_check().await {
        info!(
            "🔎 Classifier ready: {} {} (target: '{}')",
            config.classifier_program,
            config.classifier_args.join(" "),
            config.target_label
        );
    } else {
        tracing::warn!(
            "⚠️  Classifier '{}' not found! Uploads will be staged but every classification will fail.",
            config.classifier_program
        );
    }

    Arc::new(classifier)
}
