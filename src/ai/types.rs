use serde::{Deserialize, Serialize};

/// Error type for AI operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AiError {
    #[error("Connection failed: {0}")]
    ConnectionError(String),
    #[error("Authentication failed: {0}")]
    AuthError(String),
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Model error: {0}")]
    ModelError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AiError {
    /// How long the backend asked us to wait, if it said so.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AiError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Structured result of one frame analysis.
///
/// Only the fields the scheduler reads are modelled; unknown fields are
/// ignored. Every field is optional because models routinely omit some.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlayUpdate {
    /// 0–100 severity estimate for the scene.
    pub stress_level: Option<f64>,
    /// Parsed so it can be logged, never applied to the overlay.
    pub status: Option<String>,
    pub critical_warning: Option<String>,
    /// Free-text advice from the model.
    pub guidance: Option<String>,
    pub object_count: Option<u32>,
    pub warnings: Option<Vec<String>>,
    /// 0.0–1.0
    pub confidence: Option<f64>,
}

impl OverlayUpdate {
    /// True when the update carries nothing worth merging.
    pub fn is_empty(&self) -> bool {
        self.stress_level.is_none()
            && self.critical_warning.is_none()
            && self.guidance.is_none()
            && self.object_count.is_none()
            && self.warnings.is_none()
            && self.confidence.is_none()
    }
}
