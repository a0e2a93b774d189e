use super::classifier::ClassificationOutcome;

/// Turns raw classifier output into a keep/discard decision.
///
/// Matching is a case-sensitive substring test so classifiers may print
/// extra metadata (e.g. `"cat,dog"` or `"cat 0.91"`) next to the class name.
#[derive(Debug, Clone)]
pub struct ResultInterpreter {
    target: String,
}

impl ResultInterpreter {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn interpret(&self, raw: &str) -> ClassificationOutcome {
        let label = raw.trim();
        if !label.is_empty() && label.contains(self.target.as_str()) {
            ClassificationOutcome::Detected(label.to_string())
        } else {
            ClassificationOutcome::NotDetected
        }
    }
}
