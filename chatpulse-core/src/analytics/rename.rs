//! Display names for intents in cross-area views.

use crate::config::AnalyticsConfig;
use std::collections::HashMap;

/// Maps raw intent names to the names shown in merged reports.
///
/// Names without a mapping are shown as-is.
#[derive(Debug, Clone, Default)]
pub struct IntentRenamer {
    renames: HashMap<String, String>,
}

impl IntentRenamer {
    pub fn new(renames: HashMap<String, String>) -> Self {
        Self { renames }
    }

    pub fn from_config(config: &AnalyticsConfig) -> Self {
        Self::new(config.intent_renames.clone())
    }

    pub fn display_name(&self, intent_name: &str) -> String {
        self.renames
            .get(intent_name)
            .cloned()
            .unwrap_or_else(|| intent_name.to_string())
    }
}
