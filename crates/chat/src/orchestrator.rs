use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatline_llm::{
    CompletionRequest, CompletionTransport, NormalizeError, ProviderError, StreamEvent,
    StreamEventStream, normalize_stream,
};
use chatline_storage::{
    ContentHash, ContentPart, ContentStore, ConversationId, Direction, MessageContent,
    MessageId, MessagePatch, MessageRecord, MessageRole, MessageStore, NewContent, NewMessage,
    Storage, StorageError,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::assembler::{AssemblyError, AssemblyOptions, RequestAssembler};
use crate::hooks::{ChatHooks, NoopHooks};
use crate::hydration::{HydrationCache, HydrationError, HydrationOptions, Hydrator};
use crate::media::parse_data_uri;
use crate::session::{SendSession, SendState};
use crate::settings::ChatSettings;

/// What happens to the assistant placeholder when a turn fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPartialPolicy {
    /// Keep the placeholder only if it gathered text or attachments.
    #[default]
    KeepNonEmpty,
    AlwaysKeep,
    AlwaysDiscard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed {
        user_message_id: MessageId,
        assistant_message_id: MessageId,
    },
    /// Partial content, if any, stays on the assistant message.
    Aborted {
        user_message_id: MessageId,
        assistant_message_id: Option<MessageId>,
    },
}

impl TurnOutcome {
    pub fn user_message_id(&self) -> MessageId {
        match self {
            Self::Completed {
                user_message_id, ..
            }
            | Self::Aborted {
                user_message_id, ..
            } => *user_message_id,
        }
    }

    pub fn assistant_message_id(&self) -> Option<MessageId> {
        match self {
            Self::Completed {
                assistant_message_id,
                ..
            } => Some(*assistant_message_id),
            Self::Aborted {
                assistant_message_id,
                ..
            } => *assistant_message_id,
        }
    }
}

pub type SendResult<T> = Result<T, SendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SendError {
    #[snafu(display("conversation {conversation_id} already has a turn in flight"))]
    Busy {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("failed to assemble request on `{stage}`: {source}"))]
    Assembly {
        stage: &'static str,
        source: AssemblyError,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to open completion stream on `{stage}`: {source}"))]
    OpenStream {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("completion stream failed on `{stage}`: {source}"))]
    Stream {
        stage: &'static str,
        source: NormalizeError,
    },
    #[snafu(display("message {message_id} does not exist"))]
    MessageNotFound {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("no user message found for {message_id}"))]
    NoUserMessage {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("failed to set up hydration on `{stage}`: {source}"))]
    Hydrator {
        stage: &'static str,
        source: HydrationError,
    },
}

/// The user's side of a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub text: String,
    /// Inline image and file parts sent alongside the text.
    pub parts: Vec<ContentPart>,
    pub attachments: Vec<ContentHash>,
    pub model: Option<String>,
}

impl SendRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<ContentHash>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_parts(mut self, parts: Vec<ContentPart>) -> Self {
        self.parts = parts;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.parts.is_empty() && self.attachments.is_empty()
    }

    fn user_content(&self) -> MessageContent {
        if self.parts.is_empty() {
            return MessageContent::Text(self.text.clone());
        }

        let mut parts = Vec::with_capacity(self.parts.len() + 1);
        if !self.text.is_empty() {
            parts.push(ContentPart::text(self.text.clone()));
        }
        parts.extend(self.parts.iter().cloned());
        MessageContent::Parts(parts)
    }

    fn from_record(record: &MessageRecord, model: Option<String>) -> Self {
        let parts = match &record.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| !matches!(part, ContentPart::Text { .. }))
                .cloned()
                .collect(),
        };

        Self {
            text: record.content.text(),
            parts,
            attachments: record.attachments.clone(),
            model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub default_model: String,
    pub assembly: AssemblyOptions,
    pub hydration: HydrationOptions,
    pub flush_interval: Duration,
    pub max_streamed_attachments: usize,
    pub error_partial_policy: ErrorPartialPolicy,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &ChatSettings) -> Self {
        Self {
            default_model: settings.provider.default_model.clone(),
            assembly: settings.assembly.clone(),
            hydration: settings.hydration.clone(),
            flush_interval: Duration::from_millis(settings.persistence.flush_interval_ms),
            max_streamed_attachments: settings.persistence.max_streamed_attachments,
            error_partial_policy: settings.persistence.error_partial_policy,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&ChatSettings::default())
    }
}

struct TurnSlot {
    state: SendState,
    cancel: CancellationToken,
}

type TurnRegistry = Mutex<HashMap<ConversationId, TurnSlot>>;

fn lock_turns(turns: &TurnRegistry) -> MutexGuard<'_, HashMap<ConversationId, TurnSlot>> {
    turns.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns one conversation's slot for the life of a turn; dropping it returns to idle.
struct TurnGuard<'a> {
    turns: &'a TurnRegistry,
    conversation_id: ConversationId,
    cancel: CancellationToken,
}

impl TurnGuard<'_> {
    fn transition(&self, next: SendState) {
        let mut turns = lock_turns(self.turns);
        let Some(slot) = turns.get_mut(&self.conversation_id) else {
            return;
        };

        match slot.state.advance(next) {
            Ok(state) => {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    from = ?slot.state,
                    to = ?state,
                    "send state transition"
                );
                slot.state = state;
            }
            Err(illegal) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    from = ?illegal.from,
                    to = ?illegal.to,
                    "ignored illegal send state transition"
                );
            }
        }
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut turns = lock_turns(self.turns);
        if let Some(slot) = turns.remove(&self.conversation_id)
            && !slot.state.is_terminal()
        {
            // Caller dropped the future mid-turn; stop whatever is still reading.
            self.cancel.cancel();
            tracing::warn!(
                conversation_id = %self.conversation_id,
                state = ?slot.state,
                "turn dropped before reaching a terminal state"
            );
        }
    }
}

enum StreamStep {
    Cancelled,
    FlushDue,
    Event(Option<Result<StreamEvent, NormalizeError>>),
}

/// Drives one turn at a time per conversation.
///
/// A turn persists the user message, assembles the request, appends a pending
/// assistant placeholder and streams into it with throttled writes. Different
/// conversations run independently.
pub struct SendOrchestrator {
    messages: Arc<dyn MessageStore>,
    content: Arc<dyn ContentStore>,
    transport: Arc<dyn CompletionTransport>,
    hydrator: Arc<Hydrator>,
    assembler: RequestAssembler,
    hooks: Arc<dyn ChatHooks>,
    config: OrchestratorConfig,
    turns: TurnRegistry,
}

impl SendOrchestrator {
    pub fn new<S>(
        storage: Arc<S>,
        transport: Arc<dyn CompletionTransport>,
        cache: Arc<HydrationCache>,
        config: OrchestratorConfig,
    ) -> SendResult<Self>
    where
        S: Storage + 'static,
    {
        let messages: Arc<dyn MessageStore> = storage.clone();
        let content: Arc<dyn ContentStore> = storage;
        let hydrator = Arc::new(
            Hydrator::new(cache, content.clone(), config.hydration.clone()).context(
                HydratorSnafu {
                    stage: "orchestrator-build-hydrator",
                },
            )?,
        );
        let assembler = RequestAssembler::new(hydrator.clone(), content.clone());

        Ok(Self {
            messages,
            content,
            transport,
            hydrator,
            assembler,
            hooks: Arc::new(NoopHooks),
            config,
            turns: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ChatHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state(&self, conversation_id: ConversationId) -> SendState {
        lock_turns(&self.turns)
            .get(&conversation_id)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    pub fn is_busy(&self, conversation_id: ConversationId) -> bool {
        lock_turns(&self.turns).contains_key(&conversation_id)
    }

    /// Cancels the in-flight turn; false when nothing cancellable is running.
    pub fn abort(&self, conversation_id: ConversationId) -> bool {
        let turns = lock_turns(&self.turns);
        let Some(slot) = turns.get(&conversation_id) else {
            return false;
        };
        if !slot.state.is_cancellable() {
            return false;
        }

        slot.cancel.cancel();
        tracing::info!(
            conversation_id = %conversation_id,
            state = ?slot.state,
            "turn abort requested"
        );
        true
    }

    pub async fn send(
        &self,
        conversation_id: ConversationId,
        request: SendRequest,
    ) -> SendResult<TurnOutcome> {
        let guard = self.begin_turn(conversation_id)?;
        let request = SendRequest {
            text: self.hooks.transform_outgoing_text(request.text),
            ..request
        };

        let outcome = self.run_turn(&guard, request).await?;
        self.hooks.after_send(conversation_id, &outcome);
        Ok(outcome)
    }

    /// Replaces the user message that `message_id` belongs to, plus its reply, with a
    /// fresh turn at the end of the conversation.
    ///
    /// `message_id` may name the user message or an assistant reply. Only the
    /// targeted pair is deleted; every other message keeps its id and order.
    pub async fn retry(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        model_override: Option<String>,
    ) -> SendResult<TurnOutcome> {
        let guard = self.begin_turn(conversation_id)?;
        self.hooks.before_retry(conversation_id, message_id);

        let request = match self
            .take_retry_pair(conversation_id, message_id, model_override)
            .await
        {
            Ok(request) => request,
            Err(error) => return Err(self.fail_before_session(&guard, error)),
        };

        let outcome = self.run_turn(&guard, request).await?;
        self.hooks.after_retry(conversation_id, &outcome);
        Ok(outcome)
    }

    fn begin_turn(&self, conversation_id: ConversationId) -> SendResult<TurnGuard<'_>> {
        let mut turns = lock_turns(&self.turns);
        if let Some(slot) = turns.get(&conversation_id) {
            tracing::warn!(
                conversation_id = %conversation_id,
                state = ?slot.state,
                "rejected send while a turn is in flight"
            );
            return BusySnafu {
                stage: "begin-turn",
                conversation_id,
            }
            .fail();
        }

        let cancel = CancellationToken::new();
        turns.insert(
            conversation_id,
            TurnSlot {
                state: SendState::BuildingContext,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(
            conversation_id = %conversation_id,
            from = ?SendState::Idle,
            to = ?SendState::BuildingContext,
            "send state transition"
        );

        Ok(TurnGuard {
            turns: &self.turns,
            conversation_id,
            cancel,
        })
    }

    async fn take_retry_pair(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        model_override: Option<String>,
    ) -> SendResult<SendRequest> {
        let anchor = self
            .messages
            .get_message(conversation_id, message_id)
            .await
            .context(StorageSnafu {
                stage: "retry-load-anchor",
            })?
            .context(MessageNotFoundSnafu {
                stage: "retry-load-anchor",
                message_id,
            })?;

        let user_message = match anchor.role {
            MessageRole::User => anchor,
            MessageRole::Assistant => self
                .messages
                .nearest_message(conversation_id, anchor.id, MessageRole::User, Direction::Before)
                .await
                .context(StorageSnafu {
                    stage: "retry-find-user-message",
                })?
                .context(NoUserMessageSnafu {
                    stage: "retry-find-user-message",
                    message_id,
                })?,
            MessageRole::System => {
                return NoUserMessageSnafu {
                    stage: "retry-find-user-message",
                    message_id,
                }
                .fail();
            }
        };

        let next_assistant = self
            .messages
            .nearest_message(
                conversation_id,
                user_message.id,
                MessageRole::Assistant,
                Direction::After,
            )
            .await
            .context(StorageSnafu {
                stage: "retry-find-reply",
            })?;
        let next_user = self
            .messages
            .nearest_message(
                conversation_id,
                user_message.id,
                MessageRole::User,
                Direction::After,
            )
            .await
            .context(StorageSnafu {
                stage: "retry-find-reply",
            })?;
        // A reply belongs to this user message only if no later user message sits in between.
        let reply = next_assistant.filter(|assistant| {
            next_user
                .as_ref()
                .is_none_or(|next| assistant.seq < next.seq)
        });

        let model = model_override
            .filter(|model| !model.trim().is_empty())
            .or_else(|| reply.as_ref().and_then(|reply| reply.model.clone()));

        if let Some(reply) = &reply {
            self.messages
                .delete_message(conversation_id, reply.id)
                .await
                .context(StorageSnafu {
                    stage: "retry-delete-reply",
                })?;
        }
        self.messages
            .delete_message(conversation_id, user_message.id)
            .await
            .context(StorageSnafu {
                stage: "retry-delete-user-message",
            })?;

        tracing::info!(
            conversation_id = %conversation_id,
            user_message_id = %user_message.id,
            reply_deleted = reply.is_some(),
            "retrying turn"
        );
        Ok(SendRequest::from_record(&user_message, model))
    }

    async fn run_turn(
        &self,
        guard: &TurnGuard<'_>,
        request: SendRequest,
    ) -> SendResult<TurnOutcome> {
        let conversation_id = guard.conversation_id;
        if request.is_blank() {
            let error = SendError::Assembly {
                stage: "send-validate-request",
                source: AssemblyError::EmptyTurn {
                    stage: "send-validate-request",
                },
            };
            return Err(self.fail_before_session(guard, error));
        }

        let requested_model = request
            .model
            .clone()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());
        let model = self.hooks.select_model(requested_model);

        let user_message = match self
            .messages
            .append_message(
                conversation_id,
                NewMessage::user(request.user_content(), request.attachments.clone()),
            )
            .await
            .context(StorageSnafu {
                stage: "send-append-user-message",
            }) {
            Ok(message) => message,
            Err(error) => return Err(self.fail_before_session(guard, error)),
        };

        let mut session = SendSession::new(user_message, model, guard.cancel.clone());
        match self.drive(guard, &mut session).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => Err(self.apply_error_policy(guard, &mut session, error).await),
        }
    }

    async fn drive(
        &self,
        guard: &TurnGuard<'_>,
        session: &mut SendSession,
    ) -> SendResult<TurnOutcome> {
        let conversation_id = session.conversation_id;
        self.hooks.before_send(conversation_id, &session.user_message);

        let history = self
            .messages
            .list_messages(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "send-load-history",
            })?;
        self.settle_stale_placeholders(conversation_id, &history)
            .await;
        let assembled = self
            .assembler
            .assemble(
                &history,
                &self.config.assembly,
                &session.model,
                self.hooks.as_ref(),
                &session.cancel,
            )
            .await;
        if session.cancel.is_cancelled() {
            return Ok(self.finish_aborted(guard, session).await);
        }
        let assembled = assembled.context(AssemblySnafu {
            stage: "send-assemble-request",
        })?;
        let messages = self.hooks.transform_message_list(assembled.messages);

        let placeholder = self
            .messages
            .append_message(
                conversation_id,
                NewMessage::assistant_placeholder(session.stream_id, &session.model),
            )
            .await
            .context(StorageSnafu {
                stage: "send-append-placeholder",
            })?;
        session.assistant_message_id = Some(placeholder.id);
        guard.transition(SendState::Streaming);

        tracing::info!(
            conversation_id = %conversation_id,
            stream_id = %session.stream_id,
            model = %session.model,
            messages = messages.len(),
            modalities = ?assembled.modalities,
            "opening completion stream"
        );
        let request = CompletionRequest::streaming(&session.model, messages, assembled.modalities);
        let body = match self
            .transport
            .open_stream(request, session.cancel.clone())
            .await
        {
            Ok(body) => body,
            Err(_) if session.cancel.is_cancelled() => {
                return Ok(self.finish_aborted(guard, session).await);
            }
            Err(source) => {
                return Err(SendError::OpenStream {
                    stage: "send-open-stream",
                    source,
                });
            }
        };

        let events = normalize_stream(body, session.cancel.clone());
        self.consume_stream(guard, session, events).await
    }

    /// Clears `pending` on placeholders left behind by turns whose future was dropped.
    async fn settle_stale_placeholders(
        &self,
        conversation_id: ConversationId,
        history: &[MessageRecord],
    ) {
        let stale = history
            .iter()
            .filter(|message| message.role == MessageRole::Assistant && message.pending);
        for message in stale {
            let patch = MessagePatch {
                pending: Some(false),
                ..MessagePatch::default()
            };
            match self
                .messages
                .update_message(conversation_id, message.id, patch)
                .await
            {
                Ok(_) => tracing::debug!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    "settled stale pending placeholder"
                ),
                Err(error) => tracing::warn!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    error = %error,
                    "failed to settle stale pending placeholder"
                ),
            }
        }
    }

    async fn consume_stream(
        &self,
        guard: &TurnGuard<'_>,
        session: &mut SendSession,
        mut events: StreamEventStream,
    ) -> SendResult<TurnOutcome> {
        let interval = self.config.flush_interval;
        let mut last_write: Option<Instant> = None;

        loop {
            let deadline = session.is_dirty().then(|| {
                last_write
                    .map(|at| at + interval)
                    .unwrap_or_else(Instant::now)
            });

            let step = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => StreamStep::Cancelled,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    StreamStep::FlushDue
                }
                event = events.next() => StreamStep::Event(event),
            };

            match step {
                StreamStep::Cancelled => return Ok(self.finish_aborted(guard, session).await),
                StreamStep::FlushDue => {
                    self.flush(session).await?;
                    last_write = Some(Instant::now());
                }
                StreamStep::Event(None) => {
                    if session.cancel.is_cancelled() {
                        return Ok(self.finish_aborted(guard, session).await);
                    }
                    break;
                }
                StreamStep::Event(Some(Err(source))) => {
                    return Err(SendError::Stream {
                        stage: "send-read-stream",
                        source,
                    });
                }
                StreamStep::Event(Some(Ok(event))) => {
                    self.hooks.on_delta(session.conversation_id, &event);
                    match event {
                        StreamEvent::Text(delta) => session.push_text(&delta),
                        StreamEvent::Reasoning(delta) => session.push_reasoning(&delta),
                        StreamEvent::Image { url, index, .. } => {
                            session.clear_pending();
                            self.store_streamed_image(session, &url, index).await;
                        }
                        StreamEvent::Done => break,
                    }

                    let due = last_write.is_none_or(|at| at + interval <= Instant::now());
                    if session.is_dirty() && due {
                        self.flush(session).await?;
                        last_write = Some(Instant::now());
                    }
                }
            }
        }

        self.finish_completed(guard, session).await
    }

    async fn flush(&self, session: &mut SendSession) -> SendResult<()> {
        let Some(assistant_message_id) = session.assistant_message_id else {
            return Ok(());
        };

        let patch = session.take_patch();
        self.messages
            .update_message(session.conversation_id, assistant_message_id, patch)
            .await
            .context(StorageSnafu {
                stage: "stream-flush-assistant",
            })?;
        Ok(())
    }

    async fn store_streamed_image(&self, session: &mut SendSession, url: &str, index: usize) {
        if session.attachments.len() >= self.config.max_streamed_attachments {
            tracing::debug!(
                stream_id = %session.stream_id,
                index,
                limit = self.config.max_streamed_attachments,
                "streamed image over attachment cap, not stored"
            );
            return;
        }

        let hydrated = self.hydrator.hydrate(url, &session.cancel).await;
        let Some(resolved) = hydrated.resolved() else {
            tracing::debug!(stream_id = %session.stream_id, index, "streamed image unavailable");
            return;
        };
        let Some(data) = parse_data_uri(&resolved.data_uri) else {
            tracing::warn!(
                stream_id = %session.stream_id,
                index,
                "streamed image is not decodable"
            );
            return;
        };

        let stored = self
            .content
            .put_content(NewContent {
                bytes: data.bytes,
                media_type: resolved.media_type.clone(),
                name: None,
            })
            .await;
        match stored {
            Ok(metadata) => {
                session.push_attachment(metadata.hash);
            }
            Err(error) => {
                tracing::warn!(
                    stream_id = %session.stream_id,
                    index,
                    error = %error,
                    "failed to store streamed image"
                );
            }
        }
    }

    async fn finish_completed(
        &self,
        guard: &TurnGuard<'_>,
        session: &mut SendSession,
    ) -> SendResult<TurnOutcome> {
        guard.transition(SendState::Finalizing);
        let text = std::mem::take(&mut session.text);
        session.text = self.hooks.transform_incoming_text(text);
        session.pending = false;
        self.flush(session).await?;
        guard.transition(SendState::Done);

        let assistant_message_id = session
            .assistant_message_id
            .context(MessageNotFoundSnafu {
                stage: "send-finalize",
                message_id: session.user_message.id,
            })?;
        tracing::info!(
            conversation_id = %session.conversation_id,
            stream_id = %session.stream_id,
            text_len = session.text.len(),
            attachments = session.attachments.len(),
            "turn completed"
        );
        Ok(TurnOutcome::Completed {
            user_message_id: session.user_message.id,
            assistant_message_id,
        })
    }

    async fn finish_aborted(
        &self,
        guard: &TurnGuard<'_>,
        session: &mut SendSession,
    ) -> TurnOutcome {
        if session.assistant_message_id.is_some() {
            session.pending = false;
            if let Err(error) = self.flush(session).await {
                tracing::warn!(
                    conversation_id = %session.conversation_id,
                    error = %error,
                    "failed to persist partial content after abort"
                );
            }
        }
        guard.transition(SendState::Aborted);

        tracing::info!(
            conversation_id = %session.conversation_id,
            stream_id = %session.stream_id,
            text_len = session.text.len(),
            "turn aborted"
        );
        TurnOutcome::Aborted {
            user_message_id: session.user_message.id,
            assistant_message_id: session.assistant_message_id,
        }
    }

    fn fail_before_session(&self, guard: &TurnGuard<'_>, error: SendError) -> SendError {
        guard.transition(SendState::Error);
        tracing::warn!(conversation_id = %guard.conversation_id, error = %error, "turn failed");
        self.hooks.on_error(guard.conversation_id, &error);
        error
    }

    async fn apply_error_policy(
        &self,
        guard: &TurnGuard<'_>,
        session: &mut SendSession,
        error: SendError,
    ) -> SendError {
        guard.transition(SendState::Error);
        let conversation_id = session.conversation_id;
        let message = error.to_string();
        let discard = match self.config.error_partial_policy {
            ErrorPartialPolicy::KeepNonEmpty => session.is_empty(),
            ErrorPartialPolicy::AlwaysKeep => false,
            ErrorPartialPolicy::AlwaysDiscard => true,
        };

        match session.assistant_message_id {
            Some(assistant_message_id) if !discard => {
                session.pending = false;
                let mut patch = session.take_patch();
                patch.error = Some(message);
                if let Err(write_error) = self
                    .messages
                    .update_message(conversation_id, assistant_message_id, patch)
                    .await
                {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %write_error,
                        "failed to record error on assistant message"
                    );
                }
            }
            Some(assistant_message_id) => {
                if let Err(delete_error) = self
                    .messages
                    .delete_message(conversation_id, assistant_message_id)
                    .await
                {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %delete_error,
                        "failed to discard assistant placeholder"
                    );
                }
                session.assistant_message_id = None;
                self.record_error_on_user_message(session, message).await;
            }
            None => self.record_error_on_user_message(session, message).await,
        }

        tracing::warn!(
            conversation_id = %conversation_id,
            stream_id = %session.stream_id,
            error = %error,
            kept_partial = !discard,
            "turn failed"
        );
        self.hooks.on_error(conversation_id, &error);
        error
    }

    async fn record_error_on_user_message(&self, session: &SendSession, message: String) {
        let patch = MessagePatch {
            error: Some(message),
            ..MessagePatch::default()
        };
        if let Err(error) = self
            .messages
            .update_message(session.conversation_id, session.user_message.id, patch)
            .await
        {
            tracing::warn!(
                conversation_id = %session.conversation_id,
                error = %error,
                "failed to record error on user message"
            );
        }
    }
}
