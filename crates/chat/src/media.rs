//! Media-type helpers shared by hydration and assembly.
//!
//! Extension-based guessing lives in [`classify_media_type`] only; everything else
//! trusts stored metadata, response headers or the data URI header.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

pub const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

/// Guesses a media type from the file extension of a path or URL.
pub fn classify_media_type(reference: &str) -> Option<&'static str> {
    let path = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference)
        .rsplit('/')
        .next()
        .unwrap_or(reference);
    let (_, extension) = path.rsplit_once('.')?;

    let media_type = match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        _ => return None,
    };
    Some(media_type)
}

pub fn is_image_media_type(media_type: &str) -> bool {
    media_type
        .trim()
        .to_ascii_lowercase()
        .starts_with("image/")
}

pub fn is_data_uri(reference: &str) -> bool {
    reference
        .get(..5)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
}

pub fn is_remote_url(reference: &str) -> bool {
    let lower = reference.trim_start().to_ascii_lowercase();
    lower.starts_with("https://") || lower.starts_with("http://")
}

pub fn encode_data_uri(media_type: &str, bytes: &[u8]) -> String {
    format!("data:{media_type};base64,{}", STANDARD.encode(bytes))
}

/// Media type and payload of a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub media_type: String,
    pub bytes: Bytes,
}

pub fn parse_data_uri(uri: &str) -> Option<DataUri> {
    if !is_data_uri(uri) {
        return None;
    }
    let (header, payload) = uri[5..].split_once(',')?;

    let mut params = header.split(';');
    let media_type = params
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("text/plain")
        .to_ascii_lowercase();
    let is_base64 = params.any(|param| param.trim().eq_ignore_ascii_case("base64"));

    let bytes = if is_base64 {
        let compact = payload
            .chars()
            .filter(|character| !character.is_ascii_whitespace())
            .collect::<String>();
        Bytes::from(STANDARD.decode(compact).ok()?)
    } else {
        Bytes::copy_from_slice(payload.as_bytes())
    };

    Some(DataUri { media_type, bytes })
}

/// Media type declared in a data URI header, without decoding the payload.
pub fn data_uri_media_type(uri: &str) -> Option<String> {
    if !is_data_uri(uri) {
        return None;
    }
    let (header, _) = uri[5..].split_once(',')?;
    let media_type = header.split(';').next()?.trim();
    (!media_type.is_empty()).then(|| media_type.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_extension_ignoring_query() {
        assert_eq!(
            classify_media_type("https://cdn.test/cat.JPG?size=large#top"),
            Some("image/jpeg")
        );
        assert_eq!(classify_media_type("/tmp/report.pdf"), Some("application/pdf"));
        assert_eq!(classify_media_type("https://cdn.test/v1.2/blob"), None);
        assert_eq!(classify_media_type("no-extension"), None);
    }

    #[test]
    fn data_uri_survives_encode_and_parse() {
        let uri = encode_data_uri("image/png", b"\x89PNG");

        let parsed = parse_data_uri(&uri).expect("valid data uri");

        assert_eq!(parsed.media_type, "image/png");
        assert_eq!(parsed.bytes.as_ref(), b"\x89PNG");
        assert_eq!(data_uri_media_type(&uri).as_deref(), Some("image/png"));
    }

    #[test]
    fn plain_data_uri_keeps_raw_payload() {
        let parsed = parse_data_uri("data:,hello").expect("valid data uri");

        assert_eq!(parsed.media_type, "text/plain");
        assert_eq!(parsed.bytes.as_ref(), b"hello");
    }

    #[test]
    fn rejects_broken_base64() {
        assert!(parse_data_uri("data:image/png;base64,@@@").is_none());
        assert!(parse_data_uri("https://cdn.test/a.png").is_none());
    }

    #[test]
    fn recognises_remote_urls_and_image_types() {
        assert!(is_remote_url("HTTPS://cdn.test/a.png"));
        assert!(!is_remote_url("file:///tmp/a.png"));
        assert!(is_image_media_type(" Image/PNG"));
        assert!(!is_image_media_type("application/pdf"));
    }
}
