pub mod azure;
pub mod say;
pub mod ssml;

use crate::config_loader::{SayerKind, Settings};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use azure::AzureSayer;
pub use say::SaySayer;

/// Audio produced by one speak call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Speech {
    /// Short codec/container tag such as "mp3" or "aiff".
    pub format: String,
    pub audio: Vec<u8>,
}

impl Speech {
    /// What blank input synthesizes to: no format, no audio.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
    }
}

/// Trait that all speech synthesis backends must implement.
/// One instance serves every request of a server generation, concurrently.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Returns the unique ID of the backend (e.g., "azure")
    fn id(&self) -> &'static str;

    /// Synthesizes `text` with the voice selected by `role`.
    /// Blank text succeeds with `Speech::empty()`.
    async fn speak(&self, role: &str, text: &str) -> Result<Speech>;

    /// Releases temp storage and connections. Idempotent, never fails.
    async fn close(&self);
}

/// Builds the backend the snapshot enables. Called once per generation.
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn SpeechBackend>> {
    let backend: Arc<dyn SpeechBackend> = match settings.enabled_sayer {
        SayerKind::Azure => Arc::new(AzureSayer::from_settings(&settings.azure_sayer)?),
        SayerKind::Say => Arc::new(SaySayer::new(&settings.say_sayer)?),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_follows_enabled_sayer() {
        let mut settings = Settings {
            enabled_sayer: SayerKind::Say,
            ..Settings::default()
        };
        settings.say_sayer.clean = true;
        let backend = from_settings(&settings).unwrap();
        assert_eq!(backend.id(), "say");
        backend.close().await;

        settings.enabled_sayer = SayerKind::Azure;
        settings.azure_sayer.speech_key = "key".to_string();
        settings.azure_sayer.speech_region = "eastus".to_string();
        let backend = from_settings(&settings).unwrap();
        assert_eq!(backend.id(), "azure");
        backend.close().await;
    }
}
