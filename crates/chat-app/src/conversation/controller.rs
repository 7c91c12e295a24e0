use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use murmur_llm::{
    CatalogSource, ChatStreamHandle, ConversationId, EventStream, LlmProvider, ModelAvailability,
    ModelCatalog, ProviderMessage, PullEvent, Sampling, StreamEventMapped, StreamEventPayload,
    StreamHandle, StreamRequest, StreamTarget, TurnId,
};
use murmur_storage::{
    NewMessage, NewSession, NewSystemPrompt, SessionId, SessionRecord, Storage,
    SystemPromptId, SystemPromptRecord, TurnSession,
};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};
use tokio::time::error::Elapsed;

use super::events::{DisplayEvent, StopHandle};
use super::message::{
    Message, MessageKey, MessageStatus, StreamState, StreamTransition,
};
use super::title::synthesize_title;
use crate::config::{AppSettings, SettingsStore};
use crate::error::{
    BusySnafu, ConversationError, ConversationResult, InvalidModelSnafu, ModelPullSnafu,
    ProviderSnafu, SessionNotFoundSnafu, StorageSnafu,
};

/// Result of one `submit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Blank input; nothing happened.
    Ignored,
    Completed {
        session_id: Option<SessionId>,
        reply: String,
    },
    Failed {
        session_id: Option<SessionId>,
        message: String,
    },
    Cancelled {
        session_id: Option<SessionId>,
        partial: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug)]
enum TurnEnd {
    Completed,
    Failed(String),
    Cancelled,
}

struct PreparedTurn {
    target: StreamTarget,
    assistant_key: MessageKey,
    user_content: String,
    request: StreamRequest,
}

struct ConversationState {
    conversation_id: ConversationId,
    session_id: Option<SessionId>,
    pending_title: Option<String>,
    messages: Vec<Message>,
    stream_state: StreamState,
    model_id: String,
    /// Index of the first message sent to the model as history.
    context_floor: usize,
    /// Set from the start of a turn until its persistence finished.
    turn_in_flight: bool,
    /// Model currently being downloaded, if any.
    pulling: Option<String>,
    /// Last catalog fetched from the server; cleared when installed models change.
    known_catalog: Option<ModelCatalog>,
    next_conversation_id: u64,
    next_turn_id: u64,
    next_message_key: u64,
}

impl ConversationState {
    fn new(model_id: String) -> Self {
        Self {
            conversation_id: ConversationId::new(1),
            session_id: None,
            pending_title: None,
            messages: Vec::new(),
            stream_state: StreamState::Idle,
            model_id,
            context_floor: 0,
            turn_in_flight: false,
            pulling: None,
            known_catalog: None,
            next_conversation_id: 2,
            next_turn_id: 1,
            next_message_key: 1,
        }
    }

    fn reset(&mut self, session_id: Option<SessionId>, messages: Vec<Message>) {
        self.conversation_id = ConversationId::new(self.next_conversation_id);
        self.next_conversation_id = self.next_conversation_id.saturating_add(1);
        self.session_id = session_id;
        self.pending_title = None;
        self.messages = messages;
        self.stream_state = StreamState::Idle;
        self.context_floor = 0;
    }

    fn alloc_message_key(&mut self) -> MessageKey {
        let key = MessageKey::new(self.next_message_key);
        self.next_message_key = self.next_message_key.saturating_add(1);
        key
    }

    fn alloc_target(&mut self) -> StreamTarget {
        let turn_id = TurnId::new(self.next_turn_id);
        self.next_turn_id = self.next_turn_id.saturating_add(1);
        StreamTarget::new(self.conversation_id, turn_id)
    }

    fn message_mut(&mut self, key: MessageKey) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.key == key)
    }

    /// History sent with the next request: everything past the context floor that
    /// finished normally and has text.
    fn request_history(&self) -> Vec<ProviderMessage> {
        self.messages
            .iter()
            .skip(self.context_floor)
            .filter(|message| !message.content.trim().is_empty())
            .filter(|message| {
                matches!(message.status, MessageStatus::Done | MessageStatus::Cancelled)
            })
            .map(|message| ProviderMessage::new(message.role, message.content.clone()))
            .collect()
    }
}

/// Owns the active conversation and coordinates the store, the model service
/// and the display channel.
///
/// Methods take `&self`; share the controller behind an `Arc` so a display
/// surface can stop or query it while a turn is streaming.
pub struct ConversationController {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn LlmProvider>,
    settings: Arc<SettingsStore>,
    display: mpsc::UnboundedSender<DisplayEvent>,
    state: Mutex<ConversationState>,
    stop: StopHandle,
    pull_stop: StopHandle,
}

impl ConversationController {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn LlmProvider>,
        settings: Arc<SettingsStore>,
        display: mpsc::UnboundedSender<DisplayEvent>,
    ) -> Self {
        let model_id = settings.settings().default_model.clone();
        Self {
            storage,
            provider,
            settings,
            display,
            state: Mutex::new(ConversationState::new(model_id)),
            stop: StopHandle::default(),
            pull_stop: StopHandle::default(),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.lock_state().session_id
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock_state().messages.clone()
    }

    pub fn model_id(&self) -> String {
        self.lock_state().model_id.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock_state().turn_in_flight
    }

    pub fn pulling_model(&self) -> Option<String> {
        self.lock_state().pulling.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Cancels the streaming turn. Returns false when nothing was running.
    pub fn stop(&self) -> bool {
        self.stop.stop()
    }

    /// Sends `text` as the next user turn and streams the reply to completion.
    pub async fn submit(&self, text: &str) -> ConversationResult<TurnOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(TurnOutcome::Ignored);
        }

        let settings = self.settings.settings();
        let prepared = self.begin_turn(text, &settings)?;
        let mut guard = TurnGuard {
            controller: self,
            armed: true,
        };
        let stop_rx = self.stop.arm();

        let end = match self.provider.stream_chat(prepared.request.clone()) {
            Ok(handle) => {
                self.drive_stream(
                    handle,
                    prepared.target,
                    prepared.assistant_key,
                    stop_rx,
                    settings.stream_idle_timeout(),
                )
                .await
            }
            Err(error) => {
                tracing::warn!(
                    target = ?prepared.target,
                    model_id = %prepared.request.model_id,
                    error = %error,
                    "failed to open model stream"
                );
                TurnEnd::Failed(error.to_string())
            }
        };
        self.stop.disarm();
        guard.armed = false;

        let outcome = self.finish_turn(prepared, end, &settings)?;
        // The turn is already saved; a stale session list must not hide that.
        if settings.auto_save_chat_history
            && let Err(error) = self.refresh_sessions()
        {
            tracing::warn!(error = %error, "failed to refresh sessions after turn");
            self.emit(DisplayEvent::Notice(format!(
                "Error: failed to refresh conversations: {error}"
            )));
        }
        Ok(outcome)
    }

    fn begin_turn(&self, text: &str, settings: &AppSettings) -> ConversationResult<PreparedTurn> {
        let stored_prompt = self.active_prompt_text();
        let mut state = self.lock_state();
        ensure!(!state.turn_in_flight, BusySnafu { stage: "submit" });

        let target = state.alloc_target();
        match state.stream_state.apply(StreamTransition::Start(target)) {
            Ok(next) => state.stream_state = next,
            Err(rejection) => {
                tracing::warn!(target = ?target, ?rejection, "stream start rejected");
                return BusySnafu { stage: "submit" }.fail();
            }
        }
        state.turn_in_flight = true;

        if state.session_id.is_none() && state.pending_title.is_none() {
            state.pending_title = Some(synthesize_title(text));
        }

        let user_key = state.alloc_message_key();
        let user_message = Message::user(user_key, text);
        state.messages.push(user_message.clone());
        self.emit(DisplayEvent::MessageAppended(user_message));

        let history = state.request_history();

        let assistant_key = state.alloc_message_key();
        let assistant_message = Message::assistant_streaming(assistant_key, target.turn_id);
        state.messages.push(assistant_message.clone());
        self.emit(DisplayEvent::MessageAppended(assistant_message));

        let parameters = settings.models.resolve(&state.model_id);
        let mut request = StreamRequest::new(target, state.model_id.clone(), history)
            .with_sampling(Sampling {
                temperature: Some(parameters.temperature),
                top_p: Some(parameters.top_p),
                top_k: Some(parameters.top_k),
                max_tokens: Some(parameters.max_tokens),
            });
        if let Some(preamble) = parameters.system_prompt.or(stored_prompt) {
            request = request.with_preamble(preamble);
        }

        tracing::debug!(
            target = ?target,
            model_id = %state.model_id,
            history_len = request.messages.len(),
            "starting turn"
        );

        Ok(PreparedTurn {
            target,
            assistant_key,
            user_content: text.to_string(),
            request,
        })
    }

    fn active_prompt_text(&self) -> Option<String> {
        match self.storage.active_system_prompt() {
            Ok(prompt) => prompt
                .map(|prompt| prompt.content)
                .filter(|content| !content.trim().is_empty()),
            Err(error) => {
                tracing::warn!(error = %error, "failed to load active system prompt");
                None
            }
        }
    }

    async fn drive_stream(
        &self,
        handle: ChatStreamHandle,
        target: StreamTarget,
        assistant_key: MessageKey,
        mut stop_rx: oneshot::Receiver<()>,
        idle_timeout: Option<Duration>,
    ) -> TurnEnd {
        let StreamHandle {
            events: mut stream,
            worker,
        } = handle;
        let worker_task = tokio::spawn(worker);
        let mut stop_closed = false;

        let end = loop {
            let next = tokio::select! {
                signal = &mut stop_rx, if !stop_closed => match signal {
                    Ok(()) => break TurnEnd::Cancelled,
                    Err(_) => {
                        stop_closed = true;
                        continue;
                    }
                },
                next = next_stream_event(&mut stream, idle_timeout) => next,
            };

            match next {
                Err(_) => {
                    let seconds = idle_timeout.map(|idle| idle.as_secs()).unwrap_or_default();
                    tracing::warn!(target = ?target, seconds, "model stream stalled");
                    break TurnEnd::Failed(format!(
                        "no response from the model for {seconds} seconds"
                    ));
                }
                Ok(None) => {
                    break TurnEnd::Failed("the model stream closed before completing".to_string());
                }
                Ok(Some(event)) if event.target != target => {
                    tracing::debug!(
                        expected = ?target,
                        received = ?event.target,
                        "dropping stale stream event"
                    );
                }
                Ok(Some(StreamEventMapped { payload, .. })) => match payload {
                    StreamEventPayload::Delta(token) => {
                        self.apply_token(target, assistant_key, &token)
                    }
                    StreamEventPayload::Done => break TurnEnd::Completed,
                    StreamEventPayload::Error(message) => break TurnEnd::Failed(message),
                },
            }
        };

        if !matches!(end, TurnEnd::Completed) {
            stream.cancel();
        }
        drop(stream);
        if matches!(end, TurnEnd::Cancelled) {
            worker_task.abort();
        }

        end
    }

    fn apply_token(&self, target: StreamTarget, assistant_key: MessageKey, token: &str) {
        let mut state = self.lock_state();
        if !state.stream_state.accepts_stream_event(target) {
            return;
        }

        if let Some(message) = state.message_mut(assistant_key) {
            message.content.push_str(token);
            let update = DisplayEvent::updated(message);
            self.emit(update);
        }
    }

    fn finish_turn(
        &self,
        prepared: PreparedTurn,
        end: TurnEnd,
        settings: &AppSettings,
    ) -> ConversationResult<TurnOutcome> {
        let mut state = self.lock_state();
        let target = prepared.target;

        let (transition, status) = match &end {
            TurnEnd::Completed => (StreamTransition::Complete(target), MessageStatus::Done),
            TurnEnd::Failed(message) => (
                StreamTransition::Fail {
                    target,
                    message: message.clone(),
                },
                MessageStatus::Error(message.clone()),
            ),
            TurnEnd::Cancelled => (StreamTransition::Cancel(target), MessageStatus::Cancelled),
        };
        match state.stream_state.apply(transition) {
            Ok(next) => state.stream_state = next,
            Err(rejection) => {
                tracing::warn!(target = ?target, ?rejection, "stream finish rejected");
                state.stream_state = StreamState::Idle;
            }
        }

        let mut reply = String::new();
        if let Some(message) = state.message_mut(prepared.assistant_key) {
            if let TurnEnd::Failed(error) = &end {
                message.content = format!("Error: {error}");
            }
            message.status = status;
            reply = message.content.clone();
            let update = DisplayEvent::updated(message);
            self.emit(update);
        }

        if let TurnEnd::Failed(error) = &end {
            self.emit(DisplayEvent::Notice(format!("Error: {error}")));
        }

        let mut messages = vec![NewMessage::user(prepared.user_content)];
        if !matches!(end, TurnEnd::Failed(_)) && !reply.is_empty() {
            messages.push(NewMessage::assistant(reply.clone()));
        }

        if settings.auto_save_chat_history {
            let commit_result = self.commit_turn(&mut state, messages);
            state.turn_in_flight = false;
            commit_result?;
        } else {
            state.turn_in_flight = false;
        }

        let session_id = state.session_id;
        Ok(match end {
            TurnEnd::Completed => TurnOutcome::Completed { session_id, reply },
            TurnEnd::Failed(message) => TurnOutcome::Failed {
                session_id,
                message,
            },
            TurnEnd::Cancelled => TurnOutcome::Cancelled {
                session_id,
                partial: reply,
            },
        })
    }

    fn commit_turn(
        &self,
        state: &mut ConversationState,
        messages: Vec<NewMessage>,
    ) -> ConversationResult<()> {
        let session = match state.session_id {
            Some(session_id) => TurnSession::Existing(session_id),
            None => TurnSession::Create(NewSession::new(
                state
                    .pending_title
                    .clone()
                    .unwrap_or_else(|| synthesize_title("")),
            )),
        };

        match self.storage.commit_turn(session, messages) {
            Ok(commit) => {
                tracing::info!(
                    session_id = %commit.session.id,
                    created_session = commit.created_session,
                    message_count = commit.messages.len(),
                    "persisted turn"
                );
                state.session_id = Some(commit.session.id);
                state.pending_title = None;
                Ok(())
            }
            Err(source) => {
                tracing::error!(error = %source, "failed to persist turn");
                self.emit(DisplayEvent::Notice(format!(
                    "Error: failed to save conversation: {source}"
                )));
                Err(ConversationError::Storage {
                    stage: "commit-turn",
                    source,
                })
            }
        }
    }

    /// Drops the in-memory conversation; the next submit starts a new session.
    pub fn new_session(&self) -> ConversationResult<()> {
        let mut state = self.lock_state();
        ensure!(!state.turn_in_flight, BusySnafu { stage: "new-session" });

        state.reset(None, Vec::new());
        self.emit(DisplayEvent::MessagesReplaced {
            session_id: None,
            messages: Vec::new(),
        });
        Ok(())
    }

    /// Makes a stored session active and replaces the displayed history with it.
    pub fn switch_session(&self, session_id: SessionId) -> ConversationResult<SessionRecord> {
        let mut state = self.lock_state();
        ensure!(
            !state.turn_in_flight,
            BusySnafu {
                stage: "switch-session"
            }
        );

        let session = self
            .storage
            .get_session(session_id)
            .context(StorageSnafu {
                stage: "switch-session-load",
            })?
            .ok_or_else(|| {
                SessionNotFoundSnafu {
                    stage: "switch-session-load",
                    session_id,
                }
                .build()
            })?;
        let records = self.storage.list_messages(session_id).context(StorageSnafu {
            stage: "switch-session-messages",
        })?;

        let messages = records
            .into_iter()
            .map(|record| Message::from_record(state.alloc_message_key(), record))
            .collect::<Vec<_>>();
        state.reset(Some(session_id), messages.clone());

        tracing::debug!(
            session_id = %session_id,
            message_count = messages.len(),
            "switched session"
        );
        self.emit(DisplayEvent::MessagesReplaced {
            session_id: Some(session_id),
            messages,
        });
        Ok(session)
    }

    /// Deletes a stored session. Deleting the active one resets the conversation.
    pub fn delete_session(&self, session_id: SessionId) -> ConversationResult<()> {
        {
            let mut state = self.lock_state();
            let is_active = state.session_id == Some(session_id);
            ensure!(
                !(is_active && state.turn_in_flight),
                BusySnafu {
                    stage: "delete-session"
                }
            );

            if let Err(source) = self.storage.delete_session(session_id) {
                if source.is_not_found() {
                    return SessionNotFoundSnafu {
                        stage: "delete-session",
                        session_id,
                    }
                    .fail();
                }
                return Err(ConversationError::Storage {
                    stage: "delete-session",
                    source,
                });
            }
            tracing::info!(session_id = %session_id, "deleted session");

            if is_active {
                state.reset(None, Vec::new());
                self.emit(DisplayEvent::MessagesReplaced {
                    session_id: None,
                    messages: Vec::new(),
                });
            }
        }

        self.refresh_sessions()?;
        Ok(())
    }

    /// Switches the model for later turns. Messages already on screen stay, but
    /// are no longer sent as history.
    ///
    /// A model the last server catalog does not list is still selected, with a
    /// notice that it has to be pulled first.
    pub fn set_model(&self, model_id: &str) -> ConversationResult<()> {
        let model_id = model_id.trim();
        ensure!(!model_id.is_empty(), InvalidModelSnafu { stage: "set-model" });

        let mut state = self.lock_state();
        ensure!(!state.turn_in_flight, BusySnafu { stage: "set-model" });
        if state.model_id == model_id {
            return Ok(());
        }

        state.model_id = model_id.to_string();
        state.context_floor = state.messages.len();
        tracing::info!(model_id = %model_id, context_floor = state.context_floor, "model changed");

        let availability = state
            .known_catalog
            .as_ref()
            .map(|catalog| catalog.availability(model_id));
        if availability == Some(ModelAvailability::Missing) {
            self.emit(DisplayEvent::Notice(format!(
                "Model {model_id} is not installed on the server; pull it before sending"
            )));
        }
        Ok(())
    }

    pub fn refresh_sessions(&self) -> ConversationResult<Vec<SessionRecord>> {
        let sessions = self.storage.list_sessions().context(StorageSnafu {
            stage: "refresh-sessions",
        })?;
        self.emit(DisplayEvent::SessionsRefreshed(sessions.clone()));
        Ok(sessions)
    }

    pub async fn list_models(&self) -> ConversationResult<ModelCatalog> {
        let catalog = self
            .provider
            .fetch_models()
            .await
            .context(ProviderSnafu {
                stage: "list-models",
            })?;
        if let Some(warning) = catalog.warning() {
            let shown = match catalog.source {
                CatalogSource::StaleCache { .. } => "previously fetched",
                _ => "suggested",
            };
            self.emit(DisplayEvent::Notice(format!(
                "Could not reach the model service, showing {shown} models: {warning}"
            )));
        }
        self.lock_state().known_catalog = Some(catalog.clone());
        Ok(catalog)
    }

    /// Whether the model service answers right now.
    pub async fn server_available(&self) -> bool {
        let available = self.provider.is_available().await;
        tracing::debug!(provider_id = %self.provider.id(), available, "checked model service");
        available
    }

    /// Downloads `model_id` onto the server, reporting progress on the display
    /// channel. Only one pull runs at a time; `cancel_pull` stops it.
    pub async fn pull_model(&self, model_id: &str) -> ConversationResult<PullOutcome> {
        let model_id = model_id.trim();
        ensure!(!model_id.is_empty(), InvalidModelSnafu { stage: "pull-model" });
        {
            let mut state = self.lock_state();
            ensure!(state.pulling.is_none(), BusySnafu { stage: "pull-model" });
            state.pulling = Some(model_id.to_string());
        }
        let _guard = PullGuard { controller: self };

        let StreamHandle { mut events, worker } =
            self.provider
                .pull_model(model_id)
                .context(ProviderSnafu {
                    stage: "pull-model-open",
                })?;
        let mut stop_rx = self.pull_stop.arm();
        let worker_task = tokio::spawn(worker);
        let mut stop_closed = false;
        tracing::info!(model_id = %model_id, "pulling model");

        let end = loop {
            let next = tokio::select! {
                signal = &mut stop_rx, if !stop_closed => match signal {
                    Ok(()) => break Ok(PullOutcome::Cancelled),
                    Err(_) => {
                        stop_closed = true;
                        continue;
                    }
                },
                next = events.recv() => next,
            };

            match next {
                Some(PullEvent::Progress(progress)) => self.emit(DisplayEvent::PullProgress {
                    model_id: model_id.to_string(),
                    progress,
                }),
                Some(PullEvent::Done) => break Ok(PullOutcome::Completed),
                Some(PullEvent::Error(message)) => {
                    break ModelPullSnafu {
                        stage: "pull-model-stream",
                        model_id,
                        message,
                    }
                    .fail();
                }
                None => {
                    break ModelPullSnafu {
                        stage: "pull-model-stream",
                        model_id,
                        message: "the pull stream closed before completing",
                    }
                    .fail();
                }
            }
        };

        match &end {
            Ok(PullOutcome::Completed) => {
                self.lock_state().known_catalog = None;
                tracing::info!(model_id = %model_id, "model pull finished");
                self.emit(DisplayEvent::Notice(format!("Pulled model {model_id}")));
            }
            Ok(PullOutcome::Cancelled) => {
                events.cancel();
                worker_task.abort();
                tracing::info!(model_id = %model_id, "model pull cancelled");
            }
            Err(error) => tracing::warn!(model_id = %model_id, error = %error, "model pull failed"),
        }
        end
    }

    /// Stops the running pull. Returns false when nothing was being pulled.
    pub fn cancel_pull(&self) -> bool {
        self.pull_stop.stop()
    }

    /// Removes `model_id` from the server.
    pub async fn delete_model(&self, model_id: &str) -> ConversationResult<()> {
        let model_id = model_id.trim();
        ensure!(!model_id.is_empty(), InvalidModelSnafu { stage: "delete-model" });
        ensure!(
            self.lock_state().pulling.as_deref() != Some(model_id),
            BusySnafu {
                stage: "delete-model"
            }
        );

        self.provider
            .delete_model(model_id)
            .await
            .context(ProviderSnafu {
                stage: "delete-model",
            })?;
        tracing::info!(model_id = %model_id, "deleted model");

        let mut state = self.lock_state();
        state.known_catalog = None;
        if state.model_id == model_id {
            self.emit(DisplayEvent::Notice(format!(
                "Deleted {model_id}, the current model; choose another before sending"
            )));
        }
        Ok(())
    }

    pub fn list_system_prompts(&self) -> ConversationResult<Vec<SystemPromptRecord>> {
        self.storage.list_system_prompts().context(StorageSnafu {
            stage: "list-system-prompts",
        })
    }

    pub fn active_system_prompt(&self) -> ConversationResult<Option<SystemPromptRecord>> {
        self.storage.active_system_prompt().context(StorageSnafu {
            stage: "active-system-prompt",
        })
    }

    pub fn add_system_prompt(
        &self,
        name: &str,
        content: &str,
    ) -> ConversationResult<SystemPromptRecord> {
        self.storage
            .add_system_prompt(NewSystemPrompt {
                name: name.trim().to_string(),
                content: content.trim().to_string(),
            })
            .context(StorageSnafu {
                stage: "add-system-prompt",
            })
    }

    pub fn set_active_system_prompt(&self, prompt_id: SystemPromptId) -> ConversationResult<()> {
        self.storage
            .set_active_system_prompt(prompt_id)
            .context(StorageSnafu {
                stage: "set-active-system-prompt",
            })
    }

    fn emit(&self, event: DisplayEvent) {
        if self.display.send(event).is_err() {
            tracing::trace!("display channel closed; dropping event");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConversationState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Clears the pull slot however `pull_model` returns, including when its future
/// is dropped.
struct PullGuard<'a> {
    controller: &'a ConversationController,
}

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.controller.pull_stop.disarm();
        self.controller.lock_state().pulling = None;
    }
}

/// Releases the busy flag when a `submit` future is dropped before the turn
/// reached `finish_turn`.
struct TurnGuard<'a> {
    controller: &'a ConversationController,
    armed: bool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.controller.stop.disarm();
        let mut state = self.controller.lock_state();
        tracing::debug!("turn abandoned before completion");
        for message in state.messages.iter_mut().filter(|message| message.is_streaming()) {
            message.status = MessageStatus::Cancelled;
        }
        state.stream_state = StreamState::Idle;
        state.turn_in_flight = false;
    }
}

async fn next_stream_event(
    stream: &mut EventStream<StreamEventMapped>,
    idle_timeout: Option<Duration>,
) -> Result<Option<StreamEventMapped>, Elapsed> {
    match idle_timeout {
        Some(idle) => tokio::time::timeout(idle, stream.recv()).await,
        None => Ok(stream.recv().await),
    }
}
