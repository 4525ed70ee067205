//! Turns a raw `data: <json>` completion stream into ordered [`StreamEvent`]s.
//!
//! Providers disagree on where text, reasoning and images live inside a chunk. The
//! normalizer parses every record permissively as JSON and checks each known shape;
//! anything it does not recognise is skipped, never treated as an error.

use std::collections::{HashSet, VecDeque};
use std::pin::Pin;

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde_json::Value;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use super::event::StreamEvent;

pub const DONE_SENTINEL: &str = "[DONE]";
const DEFAULT_IMAGE_MEDIA_TYPE: &str = "image/png";

pub type NormalizeResult<T> = Result<T, NormalizeError>;
pub type StreamEventStream = Pin<Box<dyn Stream<Item = NormalizeResult<StreamEvent>> + Send>>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum NormalizeError {
    #[snafu(display("provider reported a stream error: {message}"))]
    Provider {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("completion stream transport failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Per-turn record interpreter.
///
/// Holds the set of image identities already emitted so a picture that shows up
/// as a delta and again in the terminal message surfaces exactly once.
#[derive(Debug, Default)]
pub struct EventNormalizer {
    emitted_images: HashSet<String>,
    images_emitted: usize,
    finished: bool,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Interprets one record payload (the text after `data:`).
    ///
    /// Only an explicit provider error record fails; unparsable input yields no events.
    pub fn push_record(&mut self, data: &str) -> NormalizeResult<Vec<StreamEvent>> {
        let data = data.trim();
        if self.finished || data.is_empty() {
            return Ok(Vec::new());
        }
        if data == DONE_SENTINEL {
            return Ok(self.finish().into_iter().collect());
        }

        let record: Value = match serde_json::from_str(data) {
            Ok(record) => record,
            Err(error) => {
                tracing::debug!(error = %error, "skipping malformed stream record");
                return Ok(Vec::new());
            }
        };

        if let Some(message) = provider_error_message(&record) {
            return ProviderSnafu {
                stage: "normalize-provider-error-record",
                message,
            }
            .fail();
        }

        let mut events = Vec::new();
        let choices = record.get("choices").and_then(Value::as_array);
        for choice in choices.into_iter().flatten() {
            if let Some(delta) = choice.get("delta") {
                self.collect_delta(delta, &mut events);
            }
            if let Some(message) = choice.get("message") {
                self.collect_final_message(message, &mut events);
            }
        }
        Ok(events)
    }

    /// Emits `done` once; later calls return `None`.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(StreamEvent::Done)
    }

    fn collect_delta(&mut self, delta: &Value, events: &mut Vec<StreamEvent>) {
        for fragment in reasoning_fragments(delta) {
            events.push(StreamEvent::Reasoning(fragment));
        }

        match delta.get("content") {
            Some(Value::String(text)) if !text.is_empty() => {
                events.push(StreamEvent::Text(text.clone()));
            }
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = text_part(part) {
                        events.push(StreamEvent::Text(text));
                    } else if is_image_part(part)
                        && let Some(url) = image_reference(part)
                    {
                        self.emit_image(url, false, events);
                    }
                }
            }
            _ => {}
        }

        self.collect_image_list(delta.get("images"), false, events);
    }

    // Terminal records may repeat the whole message; only its images are new information.
    fn collect_final_message(&mut self, message: &Value, events: &mut Vec<StreamEvent>) {
        self.collect_image_list(message.get("images"), true, events);

        if let Some(Value::Array(parts)) = message.get("content") {
            for part in parts.iter().filter(|part| is_image_part(part)) {
                if let Some(url) = image_reference(part) {
                    self.emit_image(url, true, events);
                }
            }
        }
    }

    fn collect_image_list(
        &mut self,
        images: Option<&Value>,
        is_final: bool,
        events: &mut Vec<StreamEvent>,
    ) {
        let Some(Value::Array(images)) = images else {
            return;
        };
        for image in images {
            if let Some(url) = image_reference(image) {
                self.emit_image(url, is_final, events);
            }
        }
    }

    fn emit_image(&mut self, url: String, is_final: bool, events: &mut Vec<StreamEvent>) {
        if !self.emitted_images.insert(url.clone()) {
            tracing::trace!(is_final, "suppressing already emitted image");
            return;
        }
        events.push(StreamEvent::Image {
            url,
            is_final,
            index: self.images_emitted,
        });
        self.images_emitted += 1;
    }
}

fn provider_error_message(record: &Value) -> Option<String> {
    let error = record.get("error")?;
    if error.is_null() {
        return None;
    }
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("provider returned an error during streaming".to_string())
}

fn reasoning_fragments(delta: &Value) -> Vec<String> {
    // Detailed entries win: some providers mirror the same text into `reasoning`.
    let detailed = match delta.get("reasoning_details") {
        Some(Value::Array(details)) => details.iter().filter_map(reasoning_detail_text).collect(),
        Some(detail @ Value::Object(_)) => reasoning_detail_text(detail).into_iter().collect(),
        _ => Vec::new(),
    };
    if !detailed.is_empty() {
        return detailed;
    }

    ["reasoning", "reasoning_content"]
        .iter()
        .filter_map(|key| delta.get(*key).and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .take(1)
        .collect()
}

fn reasoning_detail_text(detail: &Value) -> Option<String> {
    let kind = detail.get("type").and_then(Value::as_str).unwrap_or_default();
    if kind.ends_with("encrypted") {
        return None;
    }

    let text = match detail.get("text").or_else(|| detail.get("summary")) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().or_else(|| item.get("text")?.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn text_part(part: &Value) -> Option<String> {
    let kind = part.get("type").and_then(Value::as_str);
    if !matches!(kind, None | Some("text") | Some("output_text")) {
        return None;
    }
    part.get("text")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn is_image_part(part: &Value) -> bool {
    match part.get("type").and_then(Value::as_str) {
        Some(kind) => matches!(kind, "image_url" | "image" | "output_image" | "input_image"),
        None => part.get("image_url").is_some() || inline_payload(part).is_some(),
    }
}

/// Resolves one image-shaped value to a URL or synthesized data URI.
fn image_reference(value: &Value) -> Option<String> {
    if let Some(url) = value.as_str() {
        return usable_image_url(url);
    }

    if let Some(image_url) = value.get("image_url") {
        let url = image_url
            .as_str()
            .or_else(|| image_url.get("url").and_then(Value::as_str));
        if let Some(url) = url {
            return usable_image_url(url);
        }
    }

    if let Some(url) = value.get("url").and_then(Value::as_str) {
        return usable_image_url(url);
    }

    if let Some(nested) = inline_payload(value) {
        return image_reference(nested);
    }

    let data = ["b64_json", "data", "base64"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))?
        .trim();
    if data.is_empty() {
        return None;
    }
    if data.starts_with("data:") {
        return Some(data.to_string());
    }

    let media_type = ["mime_type", "media_type", "mimeType"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or(DEFAULT_IMAGE_MEDIA_TYPE);
    Some(format!("data:{media_type};base64,{data}"))
}

fn inline_payload(value: &Value) -> Option<&Value> {
    ["inline_data", "inlineData", "source"]
        .iter()
        .find_map(|key| value.get(*key).filter(|nested| nested.is_object()))
}

fn usable_image_url(url: &str) -> Option<String> {
    let url = url.trim();
    (!url.is_empty()).then(|| url.to_string())
}

struct NormalizerState {
    records: Pin<Box<dyn Stream<Item = Result<Event, Box<dyn std::error::Error + Send + Sync>>> + Send>>,
    normalizer: EventNormalizer,
    queue: VecDeque<StreamEvent>,
    cancel: CancellationToken,
    terminated: bool,
}

/// Lazily normalizes a response body.
///
/// Nothing is read until the returned stream is polled. Cancelling `cancel` or
/// dropping the stream stops reading the body immediately; a cancelled stream ends
/// without `done`. A body that ends without the sentinel still finishes with `done`.
pub fn normalize_stream<S, B, E>(body: S, cancel: CancellationToken) -> StreamEventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let records = body.eventsource().map(|record| {
        record.map_err(|error| -> Box<dyn std::error::Error + Send + Sync> {
            match error {
                EventStreamError::Transport(source) => Box::new(TransportFailure(source)),
                other => other.to_string().into(),
            }
        })
    });

    let state = NormalizerState {
        records: Box::pin(records),
        normalizer: EventNormalizer::new(),
        queue: VecDeque::new(),
        cancel,
        terminated: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((Ok(event), state));
            }
            if state.terminated {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => {
                    tracing::debug!("completion stream cancelled by caller");
                    return None;
                }
                next = state.records.next() => next,
            };

            match next {
                Some(Ok(record)) => match state.normalizer.push_record(&record.data) {
                    Ok(events) => {
                        state.queue.extend(events);
                        if state.normalizer.is_finished() {
                            state.terminated = true;
                        }
                    }
                    Err(error) => {
                        state.terminated = true;
                        return Some((Err(error), state));
                    }
                },
                Some(Err(error)) if error.is::<TransportFailure<E>>() => {
                    state.terminated = true;
                    let error = NormalizeError::Transport {
                        stage: "normalize-read-body",
                        source: error,
                    };
                    return Some((Err(error), state));
                }
                Some(Err(error)) => {
                    tracing::warn!(error = %error, "skipping undecodable stream record");
                }
                None => {
                    state.terminated = true;
                    state.queue.extend(state.normalizer.finish());
                }
            }
        }
    }))
}

/// Marks errors that came from the byte source rather than SSE framing.
#[derive(Debug)]
struct TransportFailure<E>(E);

impl<E: std::fmt::Display> std::fmt::Display for TransportFailure<E> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(formatter)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for TransportFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}
