//! Builds the outgoing wire request from stored conversation history.
//!
//! Text of every message is always sent. Attachments are windowed, filtered,
//! budgeted and hydrated; any attachment that cannot be turned into a usable inline
//! value is dropped without failing the turn.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chatline_llm::{ResponseModality, WireMessage, WirePart, WireRole};
use chatline_storage::{
    ContentPart, ContentStore, MessageContent, MessageId, MessageRecord, MessageRole,
};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use crate::hooks::ChatHooks;
use crate::hydration::{Hydrated, Hydrator};
use crate::media::is_image_media_type;

pub const DEFAULT_MAX_IMAGE_INPUTS: usize = 4;
pub const DEFAULT_RECENT_WINDOW: usize = 6;

const IMAGE_GENERATION_CUES: &[&str] = &[
    "generate an image",
    "generate a picture",
    "generate image",
    "create an image",
    "create a picture",
    "make an image",
    "make a picture",
    "draw ",
    "paint ",
    "sketch ",
    "illustrate",
    "render an image",
    "edit this image",
    "edit the image",
];

/// Which messages may contribute attachments to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageInclusionPolicy {
    All,
    #[default]
    Recent,
    RecentUser,
    RecentAssistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyOptions {
    pub max_image_inputs: usize,
    pub dedupe_images: bool,
    pub image_inclusion_policy: ImageInclusionPolicy,
    pub recent_window: usize,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            max_image_inputs: DEFAULT_MAX_IMAGE_INPUTS,
            dedupe_images: true,
            image_inclusion_policy: ImageInclusionPolicy::default(),
            recent_window: DEFAULT_RECENT_WINDOW,
        }
    }
}

/// One image reference offered to [`ChatHooks::filter_images`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub message_id: MessageId,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledRequest {
    pub messages: Vec<WireMessage>,
    pub modalities: Vec<ResponseModality>,
}

pub type AssemblyResult<T> = Result<T, AssemblyError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AssemblyError {
    #[snafu(display("outgoing message has no text and no usable attachments"))]
    EmptyTurn { stage: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttachmentKind {
    Image,
    File { name: String },
}

#[derive(Debug, Clone)]
struct Attachment {
    message_index: usize,
    reference: String,
    kind: AttachmentKind,
}

pub struct RequestAssembler {
    hydrator: Arc<Hydrator>,
    content: Arc<dyn ContentStore>,
}

impl RequestAssembler {
    pub fn new(hydrator: Arc<Hydrator>, content: Arc<dyn ContentStore>) -> Self {
        Self { hydrator, content }
    }

    /// Assembles `history` (oldest first, outgoing user message last).
    pub async fn assemble(
        &self,
        history: &[MessageRecord],
        options: &AssemblyOptions,
        model: &str,
        hooks: &dyn ChatHooks,
        cancel: &CancellationToken,
    ) -> AssemblyResult<AssembledRequest> {
        let window = candidate_window(history, options);
        let attachments = self.collect_attachments(history, &window).await;
        let selected = select_attachments(history, &attachments, options, hooks);

        let references = selected
            .iter()
            .map(|&index| attachments[index].reference.as_str())
            .collect::<HashSet<_>>();
        let hydrated = futures::future::join_all(references.into_iter().map(|reference| async move {
            (reference, self.hydrator.hydrate(reference, cancel).await)
        }))
        .await
        .into_iter()
        .collect::<BTreeMap<_, _>>();

        let mut grouped: BTreeMap<usize, Vec<&Attachment>> = BTreeMap::new();
        let mut ordered = selected.into_iter().collect::<Vec<_>>();
        ordered.sort_unstable();
        for index in ordered {
            let attachment = &attachments[index];
            grouped
                .entry(attachment.message_index)
                .or_default()
                .push(attachment);
        }

        let mut messages = Vec::with_capacity(history.len());
        let mut outgoing_has_parts = false;
        for (message_index, record) in history.iter().enumerate() {
            let mut parts = Vec::new();
            let text = record.content.text();
            if !text.is_empty() {
                parts.push(WirePart::text(text));
            }

            for attachment in grouped.get(&message_index).into_iter().flatten() {
                let resolved = hydrated
                    .get(attachment.reference.as_str())
                    .and_then(Hydrated::resolved);
                let Some(resolved) = resolved else {
                    tracing::debug!(
                        message_id = %record.id,
                        "dropping attachment that did not hydrate"
                    );
                    continue;
                };

                match &attachment.kind {
                    AttachmentKind::Image if is_image_media_type(&resolved.media_type) => {
                        parts.push(WirePart::image_url(resolved.data_uri.as_ref()));
                    }
                    AttachmentKind::Image => {
                        tracing::debug!(
                            message_id = %record.id,
                            media_type = %resolved.media_type,
                            "dropping image attachment with non-image media type"
                        );
                    }
                    AttachmentKind::File { name } => {
                        parts.push(WirePart::file(name.as_str(), resolved.data_uri.as_ref()));
                    }
                }
            }

            if message_index + 1 == history.len() {
                outgoing_has_parts = !parts.is_empty();
            }
            if parts.is_empty() {
                tracing::trace!(message_id = %record.id, "skipping message with no sendable parts");
                continue;
            }
            messages.push(WireMessage::new(wire_role(record.role), parts));
        }

        snafu::ensure!(
            outgoing_has_parts,
            EmptyTurnSnafu {
                stage: "assemble-outgoing-turn",
            }
        );

        let has_input_images = messages
            .iter()
            .any(|message| message.content.iter().any(WirePart::is_image));
        let outgoing_text = history
            .last()
            .map(|record| record.content.text())
            .unwrap_or_default();
        let modalities = if has_input_images || wants_image_output(&outgoing_text, model) {
            vec![ResponseModality::Text, ResponseModality::Image]
        } else {
            vec![ResponseModality::Text]
        };

        tracing::debug!(
            message_count = messages.len(),
            attachment_candidates = attachments.len(),
            ?modalities,
            "assembled completion request"
        );
        Ok(AssembledRequest {
            messages,
            modalities,
        })
    }

    async fn collect_attachments(
        &self,
        history: &[MessageRecord],
        window: &HashSet<usize>,
    ) -> Vec<Attachment> {
        let mut attachments = Vec::new();

        for (message_index, record) in history.iter().enumerate() {
            if !window.contains(&message_index) {
                continue;
            }

            if let MessageContent::Parts(parts) = &record.content {
                for part in parts {
                    let (reference, kind) = match part {
                        ContentPart::Text { .. } => continue,
                        ContentPart::Image { source, .. } => {
                            (source.as_str().to_string(), AttachmentKind::Image)
                        }
                        ContentPart::File { source, name, .. } => (
                            source.as_str().to_string(),
                            AttachmentKind::File { name: name.clone() },
                        ),
                    };
                    attachments.push(Attachment {
                        message_index,
                        reference,
                        kind,
                    });
                }
            }

            for hash in &record.attachments {
                let metadata = match self.content.content_metadata(hash).await {
                    Ok(Some(metadata)) => metadata,
                    Ok(None) => {
                        tracing::debug!(hash = %hash, "attachment metadata missing; skipping");
                        continue;
                    }
                    Err(error) => {
                        tracing::warn!(hash = %hash, error = %error, "attachment metadata lookup failed");
                        continue;
                    }
                };

                let kind = if is_image_media_type(&metadata.media_type) {
                    AttachmentKind::Image
                } else {
                    AttachmentKind::File {
                        name: metadata.name.unwrap_or_else(|| hash.to_string()),
                    }
                };
                attachments.push(Attachment {
                    message_index,
                    reference: hash.to_string(),
                    kind,
                });
            }
        }

        attachments
    }
}

fn candidate_window(history: &[MessageRecord], options: &AssemblyOptions) -> HashSet<usize> {
    let start = match options.image_inclusion_policy {
        ImageInclusionPolicy::All => 0,
        _ => history.len().saturating_sub(options.recent_window),
    };
    let role = match options.image_inclusion_policy {
        ImageInclusionPolicy::RecentUser => Some(MessageRole::User),
        ImageInclusionPolicy::RecentAssistant => Some(MessageRole::Assistant),
        ImageInclusionPolicy::All | ImageInclusionPolicy::Recent => None,
    };

    (start..history.len())
        .filter(|&index| role.is_none_or(|role| history[index].role == role))
        .collect()
}

/// Picks attachment indices that survive the hook filter, dedup and image budget.
///
/// Image priority is newest message first, original part order within a message.
/// Non-image files in the window are not budgeted. Duplicates are dropped before the
/// budget is applied, so a repeated image never costs a slot.
fn select_attachments(
    history: &[MessageRecord],
    attachments: &[Attachment],
    options: &AssemblyOptions,
    hooks: &dyn ChatHooks,
) -> HashSet<usize> {
    let mut selected = attachments
        .iter()
        .enumerate()
        .filter(|(_, attachment)| matches!(attachment.kind, AttachmentKind::File { .. }))
        .map(|(index, _)| index)
        .collect::<HashSet<_>>();

    let mut image_indices = attachments
        .iter()
        .enumerate()
        .filter(|(_, attachment)| attachment.kind == AttachmentKind::Image)
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    image_indices.sort_by_key(|&index| std::cmp::Reverse(attachments[index].message_index));

    let candidates = image_indices
        .iter()
        .map(|&index| ImageCandidate {
            message_id: history[attachments[index].message_index].id,
            reference: attachments[index].reference.clone(),
        })
        .collect::<Vec<_>>();
    let filtered = hooks.filter_images(candidates);

    let mut claimed = HashSet::new();
    let mut seen_references = HashSet::new();
    let mut budget = options.max_image_inputs;
    for candidate in filtered {
        if budget == 0 {
            break;
        }
        let slot = image_indices.iter().copied().find(|&index| {
            !claimed.contains(&index)
                && attachments[index].reference == candidate.reference
                && history[attachments[index].message_index].id == candidate.message_id
        });
        let Some(index) = slot else {
            tracing::debug!("ignoring image candidate that was not offered to the filter");
            continue;
        };
        claimed.insert(index);

        if options.dedupe_images && !seen_references.insert(candidate.reference) {
            continue;
        }
        selected.insert(index);
        budget -= 1;
    }

    selected
}

fn wire_role(role: MessageRole) -> WireRole {
    match role {
        MessageRole::System => WireRole::System,
        MessageRole::User => WireRole::User,
        MessageRole::Assistant => WireRole::Assistant,
    }
}

/// Cheap intent check for image output; input images are detected separately.
fn wants_image_output(text: &str, model: &str) -> bool {
    if model.to_ascii_lowercase().contains("image") {
        return true;
    }
    let text = format!("{} ", text.to_lowercase());
    IMAGE_GENERATION_CUES.iter().any(|cue| text.contains(cue))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chatline_storage::{ContentHash, ConversationId, InMemoryStorage, NewContent, PartSource};

    use super::*;
    use crate::hooks::NoopHooks;
    use crate::hydration::{HydrationCache, HydrationOptions};

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        assembler: RequestAssembler,
        conversation_id: ConversationId,
        history: Vec<MessageRecord>,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = Arc::new(InMemoryStorage::new());
            let hydrator = Hydrator::new(
                Arc::new(HydrationCache::new()),
                storage.clone(),
                HydrationOptions::default(),
            )
            .expect("client builds");
            Self {
                assembler: RequestAssembler::new(Arc::new(hydrator), storage.clone()),
                storage,
                conversation_id: ConversationId::new_v7(),
                history: Vec::new(),
            }
        }

        fn push(&mut self, role: MessageRole, content: MessageContent, attachments: Vec<ContentHash>) {
            self.history.push(MessageRecord {
                id: MessageId::new_v7(),
                conversation_id: self.conversation_id,
                seq: self.history.len() as u64 + 1,
                role,
                content,
                stream_id: None,
                attachments,
                reasoning_text: None,
                pending: false,
                error: None,
                model: None,
            });
        }

        fn push_text(&mut self, role: MessageRole, text: &str) {
            self.push(role, MessageContent::Text(text.to_string()), Vec::new());
        }

        async fn store(&self, bytes: &'static [u8], media_type: &str, name: Option<&str>) -> ContentHash {
            self.storage
                .put_content(NewContent {
                    bytes: Bytes::from_static(bytes),
                    media_type: media_type.to_string(),
                    name: name.map(str::to_string),
                })
                .await
                .expect("content stored")
                .hash
        }

        async fn assemble(&self, options: &AssemblyOptions) -> AssemblyResult<AssembledRequest> {
            self.assembler
                .assemble(
                    &self.history,
                    options,
                    "test-model",
                    &NoopHooks,
                    &CancellationToken::new(),
                )
                .await
        }
    }

    fn image_urls(request: &AssembledRequest) -> Vec<String> {
        request
            .messages
            .iter()
            .flat_map(|message| message.content.iter())
            .filter_map(|part| match part {
                WirePart::ImageUrl { image_url } => Some(image_url.url.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn text_only_history_round_trips_in_order() {
        let mut fixture = Fixture::new();
        fixture.push_text(MessageRole::System, "be brief");
        fixture.push_text(MessageRole::User, "hello");
        fixture.push_text(MessageRole::Assistant, "hi there");
        fixture.push(
            MessageRole::User,
            MessageContent::Parts(vec![ContentPart::text("how "), ContentPart::text("are you?")]),
            Vec::new(),
        );

        let request = fixture
            .assemble(&AssemblyOptions::default())
            .await
            .expect("assembles");

        assert_eq!(
            request.messages,
            vec![
                WireMessage::new(WireRole::System, vec![WirePart::text("be brief")]),
                WireMessage::new(WireRole::User, vec![WirePart::text("hello")]),
                WireMessage::new(WireRole::Assistant, vec![WirePart::text("hi there")]),
                WireMessage::new(WireRole::User, vec![WirePart::text("how are you?")]),
            ]
        );
        assert_eq!(request.modalities, vec![ResponseModality::Text]);
    }

    #[tokio::test]
    async fn image_budget_keeps_newest_candidates() {
        const IMAGES: [&[u8]; 10] = [b"i0", b"i1", b"i2", b"i3", b"i4", b"i5", b"i6", b"i7", b"i8", b"i9"];
        let mut fixture = Fixture::new();
        let mut hashes = Vec::new();
        for bytes in IMAGES {
            hashes.push(fixture.store(bytes, "image/png", None).await);
        }
        for (index, hash) in hashes.iter().enumerate() {
            fixture.push(
                MessageRole::User,
                MessageContent::Text(format!("image {index}")),
                vec![hash.clone()],
            );
        }
        let options = AssemblyOptions {
            max_image_inputs: 3,
            image_inclusion_policy: ImageInclusionPolicy::All,
            ..AssemblyOptions::default()
        };

        let request = fixture.assemble(&options).await.expect("assembles");

        let expected = IMAGES[7..]
            .iter()
            .map(|bytes| crate::media::encode_data_uri("image/png", bytes))
            .collect::<Vec<_>>();
        assert_eq!(image_urls(&request), expected);
        assert_eq!(request.messages.len(), 10);
        assert_eq!(
            request.modalities,
            vec![ResponseModality::Text, ResponseModality::Image]
        );
    }

    #[tokio::test]
    async fn duplicate_images_are_sent_once_when_deduped() {
        let mut fixture = Fixture::new();
        let hash = fixture.store(b"same", "image/jpeg", None).await;
        fixture.push(MessageRole::User, MessageContent::Text("first".into()), vec![hash.clone()]);
        fixture.push_text(MessageRole::Assistant, "nice");
        fixture.push(MessageRole::User, MessageContent::Text("again".into()), vec![hash.clone()]);

        let deduped = fixture
            .assemble(&AssemblyOptions::default())
            .await
            .expect("assembles");
        let kept_twice = fixture
            .assemble(&AssemblyOptions {
                dedupe_images: false,
                ..AssemblyOptions::default()
            })
            .await
            .expect("assembles");

        assert_eq!(image_urls(&deduped).len(), 1);
        assert_eq!(deduped.messages[2].content.len(), 2);
        assert_eq!(deduped.messages[0].content.len(), 1);
        assert_eq!(image_urls(&kept_twice).len(), 2);
    }

    #[tokio::test]
    async fn recent_user_policy_ignores_assistant_images_and_old_messages() {
        let mut fixture = Fixture::new();
        let old = fixture.store(b"old", "image/png", None).await;
        let generated = fixture.store(b"generated", "image/png", None).await;
        let fresh = fixture.store(b"fresh", "image/png", None).await;
        fixture.push(MessageRole::User, MessageContent::Text("old".into()), vec![old]);
        fixture.push(MessageRole::Assistant, MessageContent::Text("made".into()), vec![generated]);
        fixture.push(MessageRole::User, MessageContent::Text("fresh".into()), vec![fresh]);
        let options = AssemblyOptions {
            image_inclusion_policy: ImageInclusionPolicy::RecentUser,
            recent_window: 2,
            ..AssemblyOptions::default()
        };

        let request = fixture.assemble(&options).await.expect("assembles");

        assert_eq!(
            image_urls(&request),
            vec![crate::media::encode_data_uri("image/png", b"fresh")]
        );
    }

    #[tokio::test]
    async fn files_and_unusable_references_are_handled_per_attachment() {
        let mut fixture = Fixture::new();
        let report = fixture.store(b"%PDF", "application/pdf", Some("report.pdf")).await;
        fixture.push(
            MessageRole::User,
            MessageContent::Parts(vec![
                ContentPart::text("summarize"),
                ContentPart::Image {
                    source: PartSource::Reference("file:///private/cat.png".into()),
                    media_type: Some("image/png".into()),
                },
                ContentPart::Image {
                    source: PartSource::Inline("data:text/plain;base64,aGk=".into()),
                    media_type: None,
                },
            ]),
            vec![report],
        );

        let request = fixture
            .assemble(&AssemblyOptions::default())
            .await
            .expect("assembles");

        assert_eq!(
            request.messages,
            vec![WireMessage::new(
                WireRole::User,
                vec![
                    WirePart::text("summarize"),
                    WirePart::file(
                        "report.pdf",
                        crate::media::encode_data_uri("application/pdf", b"%PDF")
                    ),
                ],
            )]
        );
        assert_eq!(request.modalities, vec![ResponseModality::Text]);
    }

    #[tokio::test]
    async fn outgoing_turn_without_text_or_usable_attachments_fails() {
        let mut fixture = Fixture::new();
        fixture.push_text(MessageRole::User, "earlier");
        fixture.push(
            MessageRole::User,
            MessageContent::Parts(vec![ContentPart::Image {
                source: PartSource::Reference("file:///private/cat.png".into()),
                media_type: None,
            }]),
            Vec::new(),
        );

        let result = fixture.assemble(&AssemblyOptions::default()).await;

        assert!(matches!(result, Err(AssemblyError::EmptyTurn { .. })));
    }

    #[tokio::test]
    async fn filter_hook_defines_priority() {
        struct OldestFirst;
        impl ChatHooks for OldestFirst {
            fn filter_images(&self, mut candidates: Vec<ImageCandidate>) -> Vec<ImageCandidate> {
                candidates.reverse();
                candidates
            }
        }

        let mut fixture = Fixture::new();
        for bytes in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            let hash = fixture.store(bytes, "image/png", None).await;
            fixture.push(MessageRole::User, MessageContent::Text("pic".into()), vec![hash]);
        }
        let options = AssemblyOptions {
            max_image_inputs: 1,
            ..AssemblyOptions::default()
        };

        let request = fixture
            .assembler
            .assemble(
                &fixture.history,
                &options,
                "test-model",
                &OldestFirst,
                &CancellationToken::new(),
            )
            .await
            .expect("assembles");

        assert_eq!(
            image_urls(&request),
            vec![crate::media::encode_data_uri("image/png", b"a")]
        );
    }

    #[test]
    fn image_generation_intent_is_detected() {
        assert!(wants_image_output("Please draw a red fox", "text-model"));
        assert!(wants_image_output("hi", "google/gemini-2.5-flash-image-preview"));
        assert!(!wants_image_output("what is a withdrawal limit?", "text-model"));
    }
}
