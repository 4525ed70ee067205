use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFile {
    pub filename: String,
    #[serde(rename = "file_data")]
    pub data: String,
}

/// One request-side content part.
///
/// Every `url` / `data` is a resolved http(s) URL or inline data URI by the time a
/// part is built; local references are hydrated (or dropped) before this point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: WireFile },
}

impl WirePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }

    pub fn file(filename: impl Into<String>, data: impl Into<String>) -> Self {
        Self::File {
            file: WireFile {
                filename: filename.into(),
                data: data.into(),
            },
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::ImageUrl { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: WireRole,
    pub content: Vec<WirePart>,
}

impl WireMessage {
    pub fn new(role: WireRole, content: Vec<WirePart>) -> Self {
        Self { role, content }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseModality {
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub modalities: Vec<ResponseModality>,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn streaming(
        model: impl Into<String>,
        messages: Vec<WireMessage>,
        modalities: Vec<ResponseModality>,
    ) -> Self {
        Self {
            model: model.into(),
            messages,
            modalities,
            stream: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_to_openai_compatible_shape() {
        let request = CompletionRequest::streaming(
            "vision-model",
            vec![WireMessage::new(
                WireRole::User,
                vec![
                    WirePart::text("what is this?"),
                    WirePart::image_url("data:image/png;base64,AAAA"),
                    WirePart::file("notes.pdf", "data:application/pdf;base64,BBBB"),
                ],
            )],
            vec![ResponseModality::Text, ResponseModality::Image],
        );

        let json = serde_json::to_value(&request).expect("serializable");
        assert_eq!(
            json,
            serde_json::json!({
                "model": "vision-model",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "what is this?"},
                        {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                        {"type": "file", "file": {"filename": "notes.pdf", "file_data": "data:application/pdf;base64,BBBB"}}
                    ]
                }],
                "modalities": ["text", "image"],
                "stream": true
            })
        );
    }
}
