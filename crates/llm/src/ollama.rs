use std::sync::Arc;

use futures::StreamExt;
use rig::client::Nothing;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, Method, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use rig::streaming::StreamedAssistantContent;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;

use super::channel::{ChatStreamHandle, ProviderWorker, PullHandle, WorkerSide, event_channel};
use super::error::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, MissingModelSnafu,
    ModelNotFoundSnafu, ProviderError, ProviderResult,
};
use super::events::{Role, StreamEventMapped, StreamTarget};
use super::model::{
    CacheLookup, CatalogSource, DEFAULT_OLLAMA_MODEL, Model, ModelCache, ModelCatalog,
    default_ollama_models, parse_tags_payload,
};
use super::provider::{BoxFuture, LlmProvider, ProviderConfig, ProviderMessage, StreamRequest};
use super::pull::{LineBuffer, PullEvent, parse_pull_line};

pub const OLLAMA_PROVIDER_ID: &str = "ollama";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

type OllamaStreamingResponse = rig::streaming::StreamingCompletionResponse<
    <ollama::CompletionModel as CompletionModel>::StreamingResponse,
>;

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

/// Chats with and manages models on a local Ollama server through rig.
pub struct OllamaProvider {
    config: ProviderConfig,
    fallback_models: Vec<Model>,
    model_cache: Arc<ModelCache>,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            fallback_models: default_ollama_models(),
            model_cache: Arc::new(ModelCache::default()),
        }
    }

    pub fn base_url(&self) -> &str {
        if self.config.base_url.is_empty() {
            DEFAULT_OLLAMA_URL
        } else {
            &self.config.base_url
        }
    }

    fn build_client(base_url: &str) -> ProviderResult<ollama::Client> {
        ollama::Client::builder()
            .api_key(Nothing)
            .base_url(base_url)
            .build()
            .context(HttpClientSnafu {
                stage: "build-client",
            })
    }

    fn json_body(payload: &Value, stage: &'static str) -> ProviderResult<Vec<u8>> {
        serde_json::to_vec(payload).map_err(|source| ProviderError::BuildRequest {
            stage,
            message: source.to_string(),
        })
    }

    async fn get_text(
        client: &ollama::Client,
        path: &str,
        stage: &'static str,
    ) -> ProviderResult<String> {
        let request = client
            .get(path)
            .context(HttpClientSnafu { stage })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildRequest {
                stage,
                message: source.to_string(),
            })?;

        let response = client
            .send(request)
            .await
            .map_err(|source| ProviderError::from_http(stage, source))?;
        http_client::text(response)
            .await
            .context(HttpClientSnafu { stage })
    }

    async fn fetch_models_from_server(&self) -> ProviderResult<Vec<Model>> {
        let client = Self::build_client(self.base_url())?;
        let payload = Self::get_text(&client, "api/tags", "fetch-tags").await?;
        parse_tags_payload(&payload)
    }

    async fn delete_from_server(&self, model_id: &str) -> ProviderResult<()> {
        let client = Self::build_client(self.base_url())?;
        let body = Self::json_body(&json!({ "model": model_id }), "encode-delete-request")?;
        let request = client
            .post("api/delete")
            .context(HttpClientSnafu {
                stage: "build-delete-request",
            })?
            .method(Method::DELETE)
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|source| ProviderError::BuildRequest {
                stage: "build-delete-request",
                message: source.to_string(),
            })?;

        match client.send::<_, Vec<u8>>(request).await {
            Ok(_) => Ok(()),
            Err(source) => match ProviderError::from_http("send-delete-request", source) {
                error if error.status() == Some(404) => ModelNotFoundSnafu {
                    stage: "delete-model-missing",
                    model_id,
                }
                .fail(),
                error => Err(error),
            },
        }
    }

    async fn open_pull(
        base_url: &str,
        model_id: &str,
    ) -> ProviderResult<http_client::StreamingResponse> {
        let client = Self::build_client(base_url)?;
        let body = Self::json_body(
            &json!({ "model": model_id, "stream": true }),
            "encode-pull-request",
        )?;
        let request = client
            .post("api/pull")
            .context(HttpClientSnafu {
                stage: "build-pull-request",
            })?
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|source| ProviderError::BuildRequest {
                stage: "build-pull-request",
                message: source.to_string(),
            })?;

        client
            .send_streaming(request)
            .await
            .map_err(|source| ProviderError::from_http("open-pull-stream", source))
    }

    /// Forwards progress lines and returns the terminal event, if one arrived.
    fn forward_pull_lines(
        lines: Vec<Vec<u8>>,
        events: &mpsc::UnboundedSender<PullEvent>,
    ) -> Option<PullEvent> {
        for line in lines {
            match parse_pull_line(&line) {
                Ok(PullEvent::Progress(progress)) => {
                    if events.send(PullEvent::Progress(progress)).is_err() {
                        return Some(PullEvent::Error("pull listener went away".to_string()));
                    }
                }
                Ok(terminal) => return Some(terminal),
                Err(error) => return Some(PullEvent::Error(error.to_string())),
            }
        }
        None
    }

    async fn run_pull_worker(
        base_url: String,
        model_id: String,
        model_cache: Arc<ModelCache>,
        worker: WorkerSide<PullEvent>,
    ) {
        let WorkerSide {
            events,
            mut cancelled,
        } = worker;

        let response = match Self::open_pull(&base_url, &model_id).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    base_url = %base_url,
                    model_id = %model_id,
                    error = %error,
                    "failed to start model pull"
                );
                let _ = events.send(PullEvent::Error(error.to_string()));
                return;
            }
        };

        let mut body = response.into_body();
        let mut lines = LineBuffer::default();
        let end = loop {
            tokio::select! {
                _ = &mut cancelled => {
                    tracing::debug!(model_id = %model_id, "model pull cancelled");
                    return;
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if let Some(end) = Self::forward_pull_lines(lines.push(&bytes), &events) {
                            break end;
                        }
                    }
                    Some(Err(source)) => {
                        break PullEvent::Error(
                            ProviderError::from_http("read-pull-stream", source).to_string(),
                        );
                    }
                    None => {
                        let trailing = lines.finish().into_iter().collect::<Vec<_>>();
                        break Self::forward_pull_lines(trailing, &events).unwrap_or_else(|| {
                            PullEvent::Error(
                                "pull stream ended before the server reported success".to_string(),
                            )
                        });
                    }
                }
            }
        };

        match &end {
            PullEvent::Done => {
                model_cache.invalidate(&base_url).await;
                tracing::info!(base_url = %base_url, model_id = %model_id, "pulled model");
            }
            PullEvent::Error(message) => {
                tracing::warn!(model_id = %model_id, error = %message, "model pull failed");
            }
            PullEvent::Progress(_) => {}
        }
        let _ = events.send(end);
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    /// Joins the request preamble with any system-role messages, in order.
    pub(crate) fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let parts = request
            .preamble
            .iter()
            .chain(
                request
                    .messages
                    .iter()
                    .filter(|message| matches!(message.role, Role::System))
                    .map(|message| &message.content),
            )
            .filter(|part| !part.trim().is_empty())
            .cloned()
            .collect::<Vec<_>>();

        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    /// Sampling options in the shape the Ollama chat endpoint reads them.
    /// rig replaces the whole `options` object when extra params carry one, so
    /// temperature is repeated here.
    pub(crate) fn sampling_options(request: &StreamRequest) -> Option<Value> {
        let sampling = request.sampling;
        let mut options = Map::new();
        if let Some(temperature) = sampling.temperature {
            options.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = sampling.top_p {
            options.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(top_k) = sampling.top_k {
            options.insert("top_k".to_string(), json!(top_k));
        }
        if let Some(max_tokens) = sampling.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }

        (!options.is_empty()).then(|| json!({ "options": options }))
    }

    async fn open_stream(
        base_url: &str,
        request: &StreamRequest,
    ) -> ProviderResult<OllamaStreamingResponse> {
        let client = Self::build_client(base_url)?;
        let model = client.completion_model(request.model_id.as_str());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                target: request.target,
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);
        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.sampling.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.sampling.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }
        if let Some(options) = Self::sampling_options(request) {
            builder = builder.additional_params(options);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventMapped::delta(target, text.text))
            }
            _ => None,
        }
    }

    async fn run_stream_worker(
        base_url: String,
        request: StreamRequest,
        worker: WorkerSide<StreamEventMapped>,
    ) {
        let WorkerSide {
            events,
            mut cancelled,
        } = worker;
        let target = request.target;

        let mut stream = match Self::open_stream(&base_url, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    base_url = %base_url,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open ollama stream"
                );
                let _ = events.send(StreamEventMapped::error(target, error.to_string()));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancelled => {
                    tracing::debug!(target = ?target, "ollama stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => match next_item {
                    Some(Ok(item)) => {
                        if let Some(mapped) = Self::map_stream_item(target, item)
                            && events.send(mapped).is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(source)) => {
                        tracing::warn!(
                            target = ?target,
                            error = %source,
                            "ollama stream emitted an error chunk"
                        );
                        let error = ProviderError::CompletionsFailed {
                            stage: "stream-chunk",
                            source,
                        };
                        let _ = events.send(StreamEventMapped::error(target, error.to_string()));
                        return;
                    }
                    None => break,
                }
            }
        }

        let _ = events.send(StreamEventMapped::done(target));
    }
}

impl LlmProvider for OllamaProvider {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Ollama"
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(DEFAULT_OLLAMA_MODEL)
    }

    fn is_available<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let version = match Self::build_client(self.base_url()) {
                Ok(client) => Self::get_text(&client, "api/version", "check-version").await,
                Err(error) => Err(error),
            };
            match version {
                Ok(payload) => {
                    let version = serde_json::from_str::<VersionResponse>(&payload)
                        .map(|response| response.version)
                        .unwrap_or_default();
                    tracing::debug!(base_url = %self.base_url(), version = %version, "ollama reachable");
                    true
                }
                Err(error) => {
                    tracing::debug!(base_url = %self.base_url(), error = %error, "ollama unreachable");
                    false
                }
            }
        })
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move {
            let server = self.base_url();
            let stale = match self.model_cache.lookup(server).await {
                CacheLookup::Fresh(models) => {
                    return Ok(ModelCatalog::new(models, CatalogSource::Cache));
                }
                CacheLookup::Stale(models) => Some(models),
                CacheLookup::Miss => None,
            };

            match self.fetch_models_from_server().await {
                Ok(models) => {
                    tracing::debug!(
                        base_url = %server,
                        model_count = models.len(),
                        "fetched ollama model list"
                    );
                    self.model_cache.store(server, models.clone()).await;
                    Ok(ModelCatalog::new(models, CatalogSource::Server))
                }
                Err(error) => {
                    let error = error.to_string();
                    match stale {
                        Some(models) => {
                            tracing::warn!(
                                base_url = %server,
                                cached_model_count = models.len(),
                                error = %error,
                                "model fetch failed; serving stale cached models"
                            );
                            Ok(ModelCatalog::new(models, CatalogSource::StaleCache { error }))
                        }
                        None => {
                            tracing::warn!(
                                base_url = %server,
                                error = %error,
                                "model fetch failed without cache; serving fallback models"
                            );
                            Ok(ModelCatalog::new(
                                self.fallback_models.clone(),
                                CatalogSource::Fallback { error },
                            ))
                        }
                    }
                }
            }
        })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ChatStreamHandle> {
        ensure!(
            request.has_prompt(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );

        let (worker_side, events) = event_channel();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.base_url().to_string(),
            request,
            worker_side,
        ));
        Ok(ChatStreamHandle { events, worker })
    }

    fn pull_model(&self, model_id: &str) -> ProviderResult<PullHandle> {
        let model_id = model_id.trim();
        ensure!(!model_id.is_empty(), MissingModelSnafu { stage: "pull-model" });

        let (worker_side, events) = event_channel();
        let worker: ProviderWorker = Box::pin(Self::run_pull_worker(
            self.base_url().to_string(),
            model_id.to_string(),
            self.model_cache.clone(),
            worker_side,
        ));
        Ok(PullHandle { events, worker })
    }

    fn delete_model<'a>(&'a self, model_id: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            let model_id = model_id.trim();
            ensure!(!model_id.is_empty(), MissingModelSnafu { stage: "delete-model" });

            self.delete_from_server(model_id).await?;
            self.model_cache.invalidate(self.base_url()).await;
            tracing::info!(base_url = %self.base_url(), model_id = %model_id, "deleted model");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ConversationId, TurnId};
    use crate::provider::Sampling;

    /// Nothing listens on the discard port, so every request fails fast.
    const UNREACHABLE_URL: &str = "http://127.0.0.1:9";

    fn request(messages: Vec<ProviderMessage>) -> StreamRequest {
        StreamRequest::new(
            StreamTarget::new(ConversationId::new(1), TurnId::new(1)),
            "llama3.2:latest",
            messages,
        )
    }

    fn provider_at(base_url: &str) -> OllamaProvider {
        OllamaProvider::new(ProviderConfig::new(OLLAMA_PROVIDER_ID, base_url, None))
    }

    #[test]
    fn empty_base_url_falls_back_to_local_server() {
        let provider = provider_at("");
        assert_eq!(provider.base_url(), DEFAULT_OLLAMA_URL);
        assert_eq!(provider.default_model(), DEFAULT_OLLAMA_MODEL);

        let configured = OllamaProvider::new(ProviderConfig::new(
            OLLAMA_PROVIDER_ID,
            "http://gpu-box:11434/",
            Some("qwen2.5:7b".to_string()),
        ));
        assert_eq!(configured.base_url(), "http://gpu-box:11434");
        assert_eq!(configured.default_model(), "qwen2.5:7b");
    }

    #[test]
    fn stream_chat_rejects_requests_without_conversation_messages() {
        let provider = provider_at("");
        assert!(matches!(
            provider.stream_chat(request(Vec::new())),
            Err(ProviderError::EmptyMessageSet { .. })
        ));
        assert!(matches!(
            provider.stream_chat(request(vec![ProviderMessage::new(Role::System, "be brief")])),
            Err(ProviderError::EmptyMessageSet { .. })
        ));
    }

    #[test]
    fn preamble_merges_request_preamble_and_system_messages() {
        let request = request(vec![
            ProviderMessage::new(Role::System, "Answer in English."),
            ProviderMessage::new(Role::User, "hi"),
        ])
        .with_preamble("You are a helpful assistant.");

        assert_eq!(
            OllamaProvider::merged_preamble(&request).as_deref(),
            Some("You are a helpful assistant.\n\nAnswer in English.")
        );
        assert_eq!(
            OllamaProvider::merged_preamble(&self::request(vec![ProviderMessage::new(
                Role::User,
                "hi"
            )])),
            None
        );
    }

    #[test]
    fn sampling_options_use_ollama_names() {
        let request = request(vec![ProviderMessage::new(Role::User, "hi")]).with_sampling(
            Sampling {
                temperature: Some(0.7),
                top_p: Some(0.9),
                top_k: Some(40),
                max_tokens: Some(2048),
            },
        );

        assert_eq!(
            OllamaProvider::sampling_options(&request),
            Some(json!({
                "options": {
                    "temperature": 0.7,
                    "top_p": 0.9,
                    "top_k": 40,
                    "num_predict": 2048
                }
            }))
        );
        assert_eq!(
            OllamaProvider::sampling_options(&self::request(Vec::new())),
            None
        );
    }

    #[tokio::test]
    async fn unreachable_server_serves_fallback_models_and_reports_unavailable() {
        let provider = provider_at(UNREACHABLE_URL);

        assert!(!provider.is_available().await);

        let catalog = provider.fetch_models().await.expect("fallback catalog");
        assert!(matches!(catalog.source, CatalogSource::Fallback { .. }));
        assert!(catalog.warning().is_some());
        assert_eq!(
            catalog.availability(DEFAULT_OLLAMA_MODEL),
            crate::model::ModelAvailability::Installed
        );
    }

    #[tokio::test]
    async fn model_management_rejects_blank_names() {
        let provider = provider_at(UNREACHABLE_URL);
        assert!(matches!(
            provider.pull_model("  "),
            Err(ProviderError::MissingModel { .. })
        ));
        assert!(matches!(
            provider.delete_model("").await,
            Err(ProviderError::MissingModel { .. })
        ));
    }

    #[tokio::test]
    async fn pull_against_unreachable_server_ends_with_an_error_event() {
        let provider = provider_at(UNREACHABLE_URL);
        let PullHandle { mut events, worker } = provider.pull_model("llama3.2").expect("pull starts");
        tokio::spawn(worker);

        match events.recv().await {
            Some(PullEvent::Error(message)) => assert!(!message.is_empty()),
            other => panic!("expected a pull error, got {other:?}"),
        }
        assert_eq!(events.recv().await, None);

        assert!(matches!(
            provider.delete_model("llama3.2").await,
            Err(ProviderError::HttpClient { .. })
        ));
    }
}
