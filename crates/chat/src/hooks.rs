use chatline_llm::{StreamEvent, WireMessage};
use chatline_storage::{ConversationId, MessageId, MessageRecord};

use crate::assembler::ImageCandidate;
use crate::orchestrator::{SendError, TurnOutcome};

/// Extension seam invoked at fixed points of a turn.
///
/// Observers return nothing; transforms receive a value and hand back the value to
/// use. Every method defaults to a pass-through, so implementors override only the
/// points they care about. Hooks run inline on the turn's task and must not block.
pub trait ChatHooks: Send + Sync {
    fn before_send(&self, _conversation_id: ConversationId, _user_message: &MessageRecord) {}

    fn after_send(&self, _conversation_id: ConversationId, _outcome: &TurnOutcome) {}

    fn on_delta(&self, _conversation_id: ConversationId, _event: &StreamEvent) {}

    fn on_error(&self, _conversation_id: ConversationId, _error: &SendError) {}

    fn before_retry(&self, _conversation_id: ConversationId, _message_id: MessageId) {}

    fn after_retry(&self, _conversation_id: ConversationId, _outcome: &TurnOutcome) {}

    /// Rewrites the user's text before it is persisted and sent.
    fn transform_outgoing_text(&self, text: String) -> String {
        text
    }

    fn select_model(&self, model: String) -> String {
        model
    }

    /// Post-processes the final assistant text once the stream is done.
    fn transform_incoming_text(&self, text: String) -> String {
        text
    }

    fn transform_message_list(&self, messages: Vec<WireMessage>) -> Vec<WireMessage> {
        messages
    }

    /// Reorders or drops image candidates; the returned order is the budget priority.
    fn filter_images(&self, candidates: Vec<ImageCandidate>) -> Vec<ImageCandidate> {
        candidates
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ChatHooks for NoopHooks {}
