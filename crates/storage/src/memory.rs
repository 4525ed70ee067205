use std::collections::HashMap;

use bytes::Bytes;
use snafu::OptionExt;
use tokio::sync::RwLock;

use super::error::{NotFoundSnafu, StorageResult};
use super::ids::{ContentHash, ConversationId, MessageId};
use super::types::{
    ContentMetadata, Direction, MessagePatch, MessageRecord, MessageRole, NewContent, NewMessage,
};
use super::{BoxFuture, ContentStore, MessageStore};

#[derive(Default)]
struct ConversationLog {
    next_seq: u64,
    messages: Vec<MessageRecord>,
}

/// Process-local storage used by tests and `--ephemeral` runs.
#[derive(Default)]
pub struct InMemoryStorage {
    conversations: RwLock<HashMap<ConversationId, ConversationLog>>,
    contents: RwLock<HashMap<ContentHash, (ContentMetadata, Bytes)>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for InMemoryStorage {
    fn append_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut conversations = self.conversations.write().await;
            let log = conversations.entry(conversation_id).or_default();
            log.next_seq += 1;

            let record = MessageRecord {
                id: MessageId::new_v7(),
                conversation_id,
                seq: log.next_seq,
                role: input.role,
                content: input.content,
                stream_id: input.stream_id,
                attachments: input.attachments,
                reasoning_text: input.reasoning_text,
                pending: input.pending,
                error: None,
                model: input.model,
            };
            log.messages.push(record.clone());
            Ok(record)
        })
    }

    fn get_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let conversations = self.conversations.read().await;
            Ok(conversations.get(&conversation_id).and_then(|log| {
                log.messages
                    .iter()
                    .find(|message| message.id == message_id)
                    .cloned()
            }))
        })
    }

    fn update_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut conversations = self.conversations.write().await;
            let record = conversations
                .get_mut(&conversation_id)
                .and_then(|log| {
                    log.messages
                        .iter_mut()
                        .find(|message| message.id == message_id)
                })
                .context(NotFoundSnafu {
                    stage: "memory-message-update-missing",
                    entity: "message",
                    id: message_id.to_string(),
                })?;

            patch.apply_to(record);
            Ok(record.clone())
        })
    }

    fn delete_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut conversations = self.conversations.write().await;
            let log = conversations
                .get_mut(&conversation_id)
                .context(NotFoundSnafu {
                    stage: "memory-message-delete-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;

            let before = log.messages.len();
            log.messages.retain(|message| message.id != message_id);
            if log.messages.len() == before {
                return NotFoundSnafu {
                    stage: "memory-message-delete-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }
            Ok(())
        })
    }

    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let conversations = self.conversations.read().await;
            Ok(conversations
                .get(&conversation_id)
                .map(|log| log.messages.clone())
                .unwrap_or_default())
        })
    }

    fn nearest_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        anchor: MessageId,
        role: MessageRole,
        direction: Direction,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let conversations = self.conversations.read().await;
            let Some(log) = conversations.get(&conversation_id) else {
                return Ok(None);
            };
            let position = log
                .messages
                .iter()
                .position(|message| message.id == anchor)
                .context(NotFoundSnafu {
                    stage: "memory-message-nearest-anchor",
                    entity: "message",
                    id: anchor.to_string(),
                })?;

            let found = match direction {
                Direction::Before => log.messages[..position]
                    .iter()
                    .rev()
                    .find(|message| message.role == role),
                Direction::After => log.messages[position + 1..]
                    .iter()
                    .find(|message| message.role == role),
            };
            Ok(found.cloned())
        })
    }
}

impl ContentStore for InMemoryStorage {
    fn put_content<'a>(
        &'a self,
        input: NewContent,
    ) -> BoxFuture<'a, StorageResult<ContentMetadata>> {
        Box::pin(async move {
            let hash = ContentHash::digest(&input.bytes);
            let mut contents = self.contents.write().await;
            if let Some((metadata, _)) = contents.get(&hash) {
                return Ok(metadata.clone());
            }

            let metadata = ContentMetadata {
                hash: hash.clone(),
                media_type: input.media_type,
                size_bytes: input.bytes.len() as u64,
                name: input.name,
            };
            contents.insert(hash, (metadata.clone(), input.bytes));
            Ok(metadata)
        })
    }

    fn content_metadata<'a>(
        &'a self,
        hash: &'a ContentHash,
    ) -> BoxFuture<'a, StorageResult<Option<ContentMetadata>>> {
        Box::pin(async move {
            let contents = self.contents.read().await;
            Ok(contents.get(hash).map(|(metadata, _)| metadata.clone()))
        })
    }

    fn content_blob<'a>(
        &'a self,
        hash: &'a ContentHash,
    ) -> BoxFuture<'a, StorageResult<Option<Bytes>>> {
        Box::pin(async move {
            let contents = self.contents.read().await;
            Ok(contents.get(hash).map(|(_, bytes)| bytes.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageContent;

    fn user(text: &str) -> NewMessage {
        NewMessage::user(MessageContent::Text(text.to_string()), Vec::new())
    }

    #[tokio::test]
    async fn append_assigns_monotonic_seq_per_conversation() {
        let storage = InMemoryStorage::new();
        let conversation = ConversationId::new_v7();
        let other = ConversationId::new_v7();

        let first = storage.append_message(conversation, user("a")).await.unwrap();
        let second = storage.append_message(conversation, user("b")).await.unwrap();
        let foreign = storage.append_message(other, user("c")).await.unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(foreign.seq, 1);

        storage.delete_message(conversation, second.id).await.unwrap();
        let third = storage.append_message(conversation, user("d")).await.unwrap();
        assert_eq!(third.seq, 3);
    }

    #[tokio::test]
    async fn nearest_message_walks_in_both_directions() {
        let storage = InMemoryStorage::new();
        let conversation = ConversationId::new_v7();
        let question = storage.append_message(conversation, user("q")).await.unwrap();
        let answer = storage
            .append_message(
                conversation,
                NewMessage::assistant_placeholder(crate::StreamId::new_v7(), "m"),
            )
            .await
            .unwrap();

        let before = storage
            .nearest_message(conversation, answer.id, MessageRole::User, Direction::Before)
            .await
            .unwrap();
        let after = storage
            .nearest_message(conversation, question.id, MessageRole::Assistant, Direction::After)
            .await
            .unwrap();

        assert_eq!(before.map(|message| message.id), Some(question.id));
        assert_eq!(after.map(|message| message.id), Some(answer.id));
    }

    #[tokio::test]
    async fn put_content_dedups_by_hash() {
        let storage = InMemoryStorage::new();
        let first = storage
            .put_content(NewContent {
                bytes: Bytes::from_static(b"png-bytes"),
                media_type: "image/png".to_string(),
                name: None,
            })
            .await
            .unwrap();
        let second = storage
            .put_content(NewContent {
                bytes: Bytes::from_static(b"png-bytes"),
                media_type: "image/jpeg".to_string(),
                name: Some("again".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second.media_type, "image/png");
        let blob = storage.content_blob(&first.hash).await.unwrap();
        assert_eq!(blob.as_deref(), Some(&b"png-bytes"[..]));
    }
}
