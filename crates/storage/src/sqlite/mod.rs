use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeColumnSnafu, EncodeColumnSnafu, InvariantViolationSnafu,
    NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ContentHash, ConversationId, MessageId, StreamId};
use super::types::{
    ContentMetadata, Direction, MessageContent, MessagePatch, MessageRecord, MessageRole,
    NewContent, NewMessage,
};
use super::{BoxFuture, ContentStore, MessageStore};

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, role, content_json, stream_id, attachments_json, reasoning_text, pending, error, model";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(if in_memory {
                SqliteJournalMode::Memory
            } else {
                SqliteJournalMode::Wal
            })
            .busy_timeout(Duration::from_millis(5_000));

        // An in-memory database lives exactly as long as its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite storage ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        stage: &'static str,
    ) -> StorageResult<Option<MessageRecord>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? AND id = ?"
        ))
        .bind(conversation_id.to_string())
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })?;

        row.map(message_row_to_record).transpose()
    }
}

impl MessageStore for SqliteStorage {
    fn append_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let content_json = serde_json::to_string(&input.content).context(EncodeColumnSnafu {
                stage: "message-append-encode-content",
            })?;
            let attachments_json =
                serde_json::to_string(&input.attachments).context(EncodeColumnSnafu {
                    stage: "message-append-encode-attachments",
                })?;

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            // Sequence numbers come from a counter row so deleted tails never get reused.
            let next_seq = sqlx::query_scalar::<_, i64>(
                "INSERT INTO conversation_sequences (conversation_id, last_seq) VALUES (?, 1) \
                 ON CONFLICT (conversation_id) DO UPDATE SET last_seq = last_seq + 1 \
                 RETURNING last_seq",
            )
            .bind(conversation_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-next-seq",
            })?;

            let now = unix_timestamp_seconds();
            let message_id = MessageId::new_v7();

            sqlx::query(
                "INSERT INTO messages (id, conversation_id, seq, role, content_json, stream_id, attachments_json, reasoning_text, pending, error, model, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(conversation_id.to_string())
            .bind(next_seq)
            .bind(input.role.as_str())
            .bind(content_json)
            .bind(input.stream_id.map(|id| id.to_string()))
            .bind(attachments_json)
            .bind(input.reasoning_text.clone())
            .bind(input.pending)
            .bind(input.model.clone())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            Ok(MessageRecord {
                id: message_id,
                conversation_id,
                seq: i64_to_u64(next_seq, "message-append-seq")?,
                role: input.role,
                content: input.content,
                stream_id: input.stream_id,
                attachments: input.attachments,
                reasoning_text: input.reasoning_text,
                pending: input.pending,
                error: None,
                model: input.model,
            })
        })
    }

    fn get_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>> {
        Box::pin(self.load_message(conversation_id, message_id, "message-get-query"))
    }

    fn update_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut record = self
                .load_message(conversation_id, message_id, "message-update-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "message-update-missing",
                    entity: "message",
                    id: message_id.to_string(),
                })?;
            patch.apply_to(&mut record);

            let content_json = serde_json::to_string(&record.content).context(EncodeColumnSnafu {
                stage: "message-update-encode-content",
            })?;
            let attachments_json =
                serde_json::to_string(&record.attachments).context(EncodeColumnSnafu {
                    stage: "message-update-encode-attachments",
                })?;

            let update_result = sqlx::query(
                "UPDATE messages SET content_json = ?, attachments_json = ?, reasoning_text = ?, pending = ?, error = ?, updated_at = ? \
                 WHERE conversation_id = ? AND id = ?",
            )
            .bind(content_json)
            .bind(attachments_json)
            .bind(record.reasoning_text.clone())
            .bind(record.pending)
            .bind(record.error.clone())
            .bind(unix_timestamp_seconds())
            .bind(conversation_id.to_string())
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-update-vanished",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            Ok(record)
        })
    }

    fn delete_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM messages WHERE conversation_id = ? AND id = ?")
                .bind(conversation_id.to_string())
                .bind(message_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-delete-missing",
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
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY seq ASC"
            ))
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
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
            let anchor_seq = sqlx::query_scalar::<_, i64>(
                "SELECT seq FROM messages WHERE conversation_id = ? AND id = ?",
            )
            .bind(conversation_id.to_string())
            .bind(anchor.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-nearest-anchor",
            })?
            .context(NotFoundSnafu {
                stage: "message-nearest-anchor-missing",
                entity: "message",
                id: anchor.to_string(),
            })?;

            let filter = match direction {
                Direction::Before => "seq < ? ORDER BY seq DESC",
                Direction::After => "seq > ? ORDER BY seq ASC",
            };
            let row = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? AND role = ? AND {filter} LIMIT 1"
            ))
            .bind(conversation_id.to_string())
            .bind(role.as_str())
            .bind(anchor_seq)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-nearest-query",
            })?;

            row.map(message_row_to_record).transpose()
        })
    }
}

impl ContentStore for SqliteStorage {
    fn put_content<'a>(
        &'a self,
        input: NewContent,
    ) -> BoxFuture<'a, StorageResult<ContentMetadata>> {
        Box::pin(async move {
            let hash = ContentHash::digest(&input.bytes);
            let size_bytes = input.bytes.len() as i64;

            // First writer wins; later puts of the same bytes keep the original metadata.
            sqlx::query(
                "INSERT INTO contents (hash, media_type, size_bytes, name, bytes, created_at) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (hash) DO NOTHING",
            )
            .bind(hash.as_str())
            .bind(input.media_type)
            .bind(size_bytes)
            .bind(input.name)
            .bind(input.bytes.to_vec())
            .bind(unix_timestamp_seconds())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "content-put-insert",
            })?;

            self.content_metadata(&hash)
                .await?
                .context(InvariantViolationSnafu {
                    stage: "content-put-reload",
                    details: format!("content '{hash}' missing right after insert"),
                })
        })
    }

    fn content_metadata<'a>(
        &'a self,
        hash: &'a ContentHash,
    ) -> BoxFuture<'a, StorageResult<Option<ContentMetadata>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ContentRow>(
                "SELECT hash, media_type, size_bytes, name FROM contents WHERE hash = ?",
            )
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "content-metadata-query",
            })?;

            row.map(content_row_to_metadata).transpose()
        })
    }

    fn content_blob<'a>(
        &'a self,
        hash: &'a ContentHash,
    ) -> BoxFuture<'a, StorageResult<Option<Bytes>>> {
        Box::pin(async move {
            let blob = sqlx::query_scalar::<_, Vec<u8>>("SELECT bytes FROM contents WHERE hash = ?")
                .bind(hash.as_str())
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "content-blob-query",
                })?;

            Ok(blob.map(Bytes::from))
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    seq: i64,
    role: String,
    content_json: String,
    stream_id: Option<String>,
    attachments_json: String,
    reasoning_text: Option<String>,
    pending: bool,
    error: Option<String>,
    model: Option<String>,
}

#[derive(Debug, FromRow)]
struct ContentRow {
    hash: String,
    media_type: String,
    size_bytes: i64,
    name: Option<String>,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let content: MessageContent =
        serde_json::from_str(&row.content_json).context(DecodeColumnSnafu {
            stage: "message-row-content",
        })?;
    let attachments: Vec<ContentHash> =
        serde_json::from_str(&row.attachments_json).context(DecodeColumnSnafu {
            stage: "message-row-attachments",
        })?;

    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content,
        stream_id: row.stream_id.as_deref().map(StreamId::parse).transpose()?,
        attachments,
        reasoning_text: row.reasoning_text,
        pending: row.pending,
        error: row.error,
        model: row.model,
    })
}

fn content_row_to_metadata(row: ContentRow) -> StorageResult<ContentMetadata> {
    Ok(ContentMetadata {
        hash: ContentHash::parse(&row.hash)?,
        media_type: row.media_type,
        size_bytes: i64_to_u64(row.size_bytes, "content-row-size-bytes")?,
        name: row.name,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    MessageRole::parse(raw).context(InvariantViolationSnafu {
        stage: "message-role-from-sql",
        details: format!("unknown message role '{raw}'"),
    })
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
