use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QuizKeepError;

pub const DEFAULT_SCHEMA_VERSION: &str = "1.0.0";
const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Tunables for the persistence layer. Every field has a default, so a
/// partial JSON file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
    pub schema_version: String,
    pub quiz_state_ttl_ms: u64,
    pub quiz_result_ttl_ms: u64,
    /// `None` disables expiry for the auth-redirect record.
    pub auth_redirect_ttl_ms: Option<u64>,
    pub state_debounce_ms: u64,
    pub auth_debounce_ms: u64,
    pub event_sync_debounce_ms: u64,
    /// Synced progress events older than this are folded into the log's
    /// baseline projections. `None` keeps every event.
    pub event_retention_ms: Option<u64>,
    pub similarity: SimilarityThresholds,
}

/// Minimum similarity (0-100) for a fuzzy-graded answer to count as correct.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimilarityThresholds {
    pub fill_blank_threshold: f64,
    pub essay_threshold: f64,
}

impl Default for SimilarityThresholds {
    fn default() -> Self {
        Self {
            fill_blank_threshold: 80.0,
            essay_threshold: 70.0,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            quiz_state_ttl_ms: DAY_MS,
            quiz_result_ttl_ms: DAY_MS,
            auth_redirect_ttl_ms: Some(60 * 60 * 1000),
            state_debounce_ms: 300,
            auth_debounce_ms: 150,
            event_sync_debounce_ms: 1000,
            event_retention_ms: Some(30 * DAY_MS),
            similarity: SimilarityThresholds::default(),
        }
    }
}

impl PersistenceConfig {
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            QuizKeepError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| QuizKeepError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.schema_version.trim().is_empty() {
            return Err(QuizKeepError::Configuration(
                "schemaVersion must not be empty".to_string(),
            ));
        }
        if self.state_debounce_ms == 0 || self.auth_debounce_ms == 0 {
            return Err(QuizKeepError::Configuration(
                "debounce windows must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("fillBlankThreshold", self.similarity.fill_blank_threshold),
            ("essayThreshold", self.similarity.essay_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(QuizKeepError::Configuration(format!(
                    "{} must be within 0-100, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn state_debounce(&self) -> Duration {
        Duration::from_millis(self.state_debounce_ms)
    }

    pub fn auth_debounce(&self) -> Duration {
        Duration::from_millis(self.auth_debounce_ms)
    }

    pub fn event_sync_debounce(&self) -> Duration {
        Duration::from_millis(self.event_sync_debounce_ms)
    }
}
