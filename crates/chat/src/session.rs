use chatline_storage::{
    ContentHash, ConversationId, MessageContent, MessageId, MessagePatch, MessageRecord, StreamId,
};
use tokio_util::sync::CancellationToken;

/// Lifecycle of one turn.
///
/// `Idle -> BuildingContext -> Streaming -> Finalizing -> Done`, with `Error` reachable
/// from any working state and `Aborted` from the two cancellable ones. Every terminal
/// state returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendState {
    #[default]
    Idle,
    BuildingContext,
    Streaming,
    Finalizing,
    Done,
    Error,
    Aborted,
}

/// Rejected state change, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: SendState,
    pub to: SendState,
}

impl SendState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Aborted)
    }

    /// True while `abort()` has something to interrupt.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::BuildingContext | Self::Streaming)
    }

    pub fn advance(self, next: SendState) -> Result<SendState, IllegalTransition> {
        let allowed = match (self, next) {
            (Self::Idle, Self::BuildingContext) => true,
            (Self::BuildingContext, Self::Streaming | Self::Error | Self::Aborted) => true,
            (Self::Streaming, Self::Finalizing | Self::Error | Self::Aborted) => true,
            (Self::Finalizing, Self::Done | Self::Error) => true,
            (from, Self::Idle) => from.is_terminal(),
            _ => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

/// Ephemeral per-turn buffers owned by the orchestrator.
#[derive(Debug)]
pub struct SendSession {
    pub conversation_id: ConversationId,
    pub stream_id: StreamId,
    pub model: String,
    pub user_message: MessageRecord,
    pub assistant_message_id: Option<MessageId>,
    pub cancel: CancellationToken,
    pub text: String,
    pub reasoning: String,
    pub attachments: Vec<ContentHash>,
    pub pending: bool,
    dirty: bool,
}

impl SendSession {
    pub fn new(
        user_message: MessageRecord,
        model: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conversation_id: user_message.conversation_id,
            stream_id: StreamId::new_v7(),
            model: model.into(),
            user_message,
            assistant_message_id: None,
            cancel,
            text: String::new(),
            reasoning: String::new(),
            attachments: Vec::new(),
            pending: true,
            dirty: false,
        }
    }

    pub fn push_text(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.text.push_str(delta);
        self.mark_content_arrived();
    }

    pub fn push_reasoning(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.reasoning.push_str(delta);
        self.mark_content_arrived();
    }

    /// Records a stored image; returns false for a hash already attached.
    pub fn push_attachment(&mut self, hash: ContentHash) -> bool {
        if self.attachments.contains(&hash) {
            return false;
        }
        self.attachments.push(hash);
        self.mark_content_arrived();
        true
    }

    /// Any visible arrival ends the placeholder's pending phase, stored or not.
    pub fn clear_pending(&mut self) {
        if self.pending {
            self.mark_content_arrived();
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Nothing visible was produced: no text and no attachments.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.attachments.is_empty()
    }

    /// Snapshot of the buffers for the next assistant write; clears the dirty flag.
    pub fn take_patch(&mut self) -> MessagePatch {
        self.dirty = false;
        MessagePatch {
            content: Some(MessageContent::Text(self.text.clone())),
            attachments: Some(self.attachments.clone()),
            reasoning_text: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
            pending: Some(self.pending),
            error: None,
        }
    }

    fn mark_content_arrived(&mut self) {
        self.pending = false;
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use chatline_storage::MessageRole;

    use super::*;

    fn user_record() -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            conversation_id: ConversationId::new_v7(),
            seq: 1,
            role: MessageRole::User,
            content: MessageContent::Text("hi".to_string()),
            stream_id: None,
            attachments: Vec::new(),
            reasoning_text: None,
            pending: false,
            error: None,
            model: None,
        }
    }

    #[test]
    fn happy_path_walks_every_state() {
        let state = SendState::Idle
            .advance(SendState::BuildingContext)
            .and_then(|state| state.advance(SendState::Streaming))
            .and_then(|state| state.advance(SendState::Finalizing))
            .and_then(|state| state.advance(SendState::Done))
            .and_then(|state| state.advance(SendState::Idle));

        assert_eq!(state, Ok(SendState::Idle));
    }

    #[test]
    fn abort_is_only_reachable_from_cancellable_states() {
        assert!(SendState::Streaming.advance(SendState::Aborted).is_ok());
        assert!(SendState::BuildingContext.advance(SendState::Aborted).is_ok());
        assert_eq!(
            SendState::Finalizing.advance(SendState::Aborted),
            Err(IllegalTransition {
                from: SendState::Finalizing,
                to: SendState::Aborted,
            })
        );
        assert!(SendState::Idle.advance(SendState::Streaming).is_err());
        assert!(SendState::Streaming.advance(SendState::Idle).is_err());
    }

    #[test]
    fn first_content_clears_pending_and_marks_dirty() {
        let mut session = SendSession::new(user_record(), "model", CancellationToken::new());
        assert!(session.pending);

        session.push_text("");
        assert!(session.pending);
        assert!(!session.is_dirty());

        session.push_reasoning("thinking");
        assert!(!session.pending);
        assert!(session.is_dirty());
        assert!(session.is_empty());

        let patch = session.take_patch();
        assert_eq!(patch.pending, Some(false));
        assert_eq!(patch.reasoning_text.as_deref(), Some("thinking"));
        assert!(!session.is_dirty());
    }

    #[test]
    fn duplicate_attachments_are_ignored() {
        let mut session = SendSession::new(user_record(), "model", CancellationToken::new());
        let hash = ContentHash::digest(b"img");

        assert!(session.push_attachment(hash.clone()));
        assert!(!session.push_attachment(hash));
        assert_eq!(session.attachments.len(), 1);
    }
}
