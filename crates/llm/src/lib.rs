//! Model-service seam for murmur: the [`LlmProvider`] trait, the events its
//! workers emit, and the Ollama adapter built on rig.

pub mod channel;
pub mod error;
pub mod events;
pub mod model;
pub mod ollama;
pub mod provider;
pub mod pull;

use std::sync::Arc;

pub use events::{
    ConversationId, Role, StreamEventMapped, StreamEventPayload, StreamTarget, TurnId,
};
pub use channel::{
    ChatStreamHandle, EventStream, ProviderWorker, PullHandle, StreamHandle, WorkerSide,
    event_channel,
};
pub use error::{ProviderError, ProviderResult};
pub use model::{
    CacheLookup, CatalogSource, DEFAULT_OLLAMA_MODEL, Model, ModelAvailability, ModelCache,
    ModelCatalog, default_ollama_models, format_size, parse_tags_payload,
};
pub use ollama::{DEFAULT_OLLAMA_URL, OLLAMA_PROVIDER_ID, OllamaProvider};
pub use provider::{
    BoxFuture, LlmProvider, ProviderConfig, ProviderMessage, Sampling, StreamRequest,
};
pub use pull::{LineBuffer, PullEvent, PullProgress, parse_pull_line};

/// Builds the provider named by `config.provider_id`. Only Ollama is wired up.
pub fn create_provider(config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    match config.provider_id.as_str() {
        OLLAMA_PROVIDER_ID => Ok(Arc::new(OllamaProvider::new(config))),
        other => error::UnsupportedProviderSnafu {
            stage: "create-provider",
            provider_id: other.to_string(),
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_provider_builds_ollama() {
        let provider = create_provider(ProviderConfig::new(
            OLLAMA_PROVIDER_ID,
            DEFAULT_OLLAMA_URL,
            None,
        ))
        .expect("ollama provider");
        assert_eq!(provider.id(), OLLAMA_PROVIDER_ID);
        assert_eq!(provider.name(), "Ollama");
        assert_eq!(provider.default_model(), DEFAULT_OLLAMA_MODEL);
    }

    #[test]
    fn create_provider_rejects_unknown_ids() {
        let error = match create_provider(ProviderConfig::new("openai", "", None)) {
            Ok(_) => panic!("openai is not wired up"),
            Err(error) => error,
        };
        assert!(matches!(
            error,
            ProviderError::UnsupportedProvider { ref provider_id, .. } if provider_id == "openai"
        ));
    }
}
