use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ContentHash, ConversationId, MessageId, StreamId};
pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    ContentMetadata, ContentPart, Direction, MessageContent, MessagePatch, MessageRecord,
    MessageRole, NewContent, NewMessage, PartSource,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ordered per-conversation message log.
///
/// `seq` is assigned on append and only grows; nothing here reorders rows.
pub trait MessageStore: Send + Sync {
    fn append_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;
    fn get_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>>;
    fn update_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;
    fn delete_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;
    /// Closest message with `role` strictly before or after `anchor`.
    fn nearest_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        anchor: MessageId,
        role: MessageRole,
        direction: Direction,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>>;
}

/// Content-addressed blob store. Hashing and dedup stay behind this trait.
pub trait ContentStore: Send + Sync {
    fn put_content<'a>(&'a self, input: NewContent)
    -> BoxFuture<'a, StorageResult<ContentMetadata>>;
    fn content_metadata<'a>(
        &'a self,
        hash: &'a ContentHash,
    ) -> BoxFuture<'a, StorageResult<Option<ContentMetadata>>>;
    fn content_blob<'a>(&'a self, hash: &'a ContentHash)
    -> BoxFuture<'a, StorageResult<Option<Bytes>>>;
}

pub trait Storage: MessageStore + ContentStore {}

impl<T> Storage for T where T: MessageStore + ContentStore {}
