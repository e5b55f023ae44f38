use async_trait::async_trait;

use crate::capture::encode::EncodedFrame;

pub mod azure_vision;
pub mod types;
pub use types::*;

/// Trait for vision inference backends (Azure OpenAI, local models, mocks).
///
/// A call resolves to exactly one result or one error. Callers that need a
/// deadline enforce it themselves; the provider is free to take as long as
/// its transport allows.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Analyze one encoded frame and return the structured overlay fields.
    /// `system_prompt` is the user's configured prompt.
    async fn analyze_frame(
        &self,
        frame: &EncodedFrame,
        system_prompt: &str,
    ) -> Result<OverlayUpdate, AiError>;

    /// Provider name for logging/display
    fn name(&self) -> &str;
}
