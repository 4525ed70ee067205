use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{InvalidContentHashSnafu, InvalidIdSnafu, StorageError, StorageResult};

// Macro keeps all ID wrappers structurally identical, so future migrations stay predictable.
macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
                    stage: "parse-storage-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_id!(ConversationId, "conversation-id");
define_storage_id!(MessageId, "message-id");
define_storage_id!(StreamId, "stream-id");

const SHA256_HEX_LEN: usize = 64;

/// Content-addressed reference: lower-case sha256 hex of the stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub fn digest(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let candidate = raw.trim();
        ensure!(
            Self::looks_like_hash(candidate),
            InvalidContentHashSnafu {
                stage: "parse-content-hash",
                raw: raw.to_string(),
            }
        );
        Ok(Self(candidate.to_ascii_lowercase()))
    }

    /// Cheap shape check used to tell hashes apart from other opaque references.
    pub fn looks_like_hash(raw: &str) -> bool {
        raw.len() == SHA256_HEX_LEN && raw.bytes().all(|byte| byte.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = StorageError;

    fn try_from(value: String) -> StorageResult<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_round_trips_through_display() {
        let id = MessageId::new_v7();
        let parsed: MessageId = id.to_string().parse().expect("valid id");
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_conversation_id_is_rejected() {
        assert!(ConversationId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn content_hash_digest_is_stable_hex() {
        let hash = ContentHash::digest(b"hello");
        assert_eq!(
            hash.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(ContentHash::parse(&hash.as_str().to_uppercase()).ok(), Some(hash));
    }

    #[test]
    fn content_hash_rejects_urls() {
        assert!(!ContentHash::looks_like_hash("https://example.com/a.png"));
        assert!(ContentHash::parse("file:///tmp/a.png").is_err());
    }
}
