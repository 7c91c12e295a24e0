use std::future::Future;
use std::pin::Pin;

use super::channel::{ChatStreamHandle, PullHandle};
use super::error::ProviderResult;
use super::events::{Role, StreamTarget};
use super::model::ModelCatalog;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where a provider lives and which model it falls back to. Built from settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub base_url: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        default_model: Option<String>,
    ) -> Self {
        let default_model = default_model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());
        Self {
            provider_id: provider_id.into().trim().to_string(),
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            default_model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Sampling knobs forwarded to the model. `None` leaves the server default.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sampling {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u64>,
}

/// One streaming completion call. The last non-system message is the prompt;
/// earlier ones are sent as role-tagged history.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub sampling: Sampling,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            messages,
            preamble: None,
            sampling: Sampling::default(),
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn has_prompt(&self) -> bool {
        self.messages
            .iter()
            .any(|message| !matches!(message.role, Role::System))
    }
}

/// A model server murmur can chat with and manage models on.
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;

    /// Whether the server answers at all. Errors count as unavailable.
    fn is_available<'a>(&'a self) -> BoxFuture<'a, bool>;
    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>>;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ChatStreamHandle>;
    /// Starts downloading `model_id`; progress arrives on the returned stream.
    fn pull_model(&self, model_id: &str) -> ProviderResult<PullHandle>;
    fn delete_model<'a>(&'a self, model_id: &'a str) -> BoxFuture<'a, ProviderResult<()>>;
}
