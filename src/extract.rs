//! Pure helpers that turn a fetched Gmail message into an [`ExtractedRecord`].
//!
//! Nothing here does I/O or holds state; every function is total. A body that
//! cannot be decoded yields an empty body plus an [`ExtractError`] so the
//! caller decides how to account for it.

use std::sync::LazyLock;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connectors::{GmailHeader, GmailMessage, GmailPayload};

const HTML_MIME_TYPE: &str = "text/html";
const MULTIPART_PREFIX: &str = "multipart/";
const URL_SCHEME_PREFIX: &str = "http";

/// Gmail hands out base64url bodies; some clients pad them and some do not.
const BODY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:[a-z][a-z0-9+.\-]*://[^\s<>"'`{}|\\^\[\]]+|mailto:[^\s<>"'`]+|www\d{0,3}\.[^\s<>"'`{}|\\^\[\]]+)"#,
    )
    .expect("compile url pattern")
});

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("base64url decode of {part} body: {source}")]
    Base64 {
        part: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("utf8 decode of {part} body: {source}")]
    Utf8 {
        part: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

/// The fields the sink displays and stores for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub urls: Vec<String>,
    /// Gmail `internalDate`, milliseconds since the epoch; drives upsert conflicts.
    pub received_at_ms: i64,
}

#[derive(Debug)]
pub struct Extraction {
    pub record: ExtractedRecord,
    pub decode_error: Option<ExtractError>,
}

pub fn extract_record(message: &GmailMessage) -> Extraction {
    let headers = message.payload.headers.as_deref().unwrap_or_default();
    let (from, subject) = header_fields(headers);

    let (body, decode_error) = match message_content(&message.payload) {
        Ok(body) => (body, None),
        Err(error) => (String::new(), Some(error)),
    };
    let urls = extract_urls(&body);

    let received_at_ms = message
        .internal_date
        .as_deref()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or_default();

    Extraction {
        record: ExtractedRecord {
            id: message.id.clone(),
            from,
            subject,
            body,
            urls,
            received_at_ms,
        },
        decode_error,
    }
}

/// Single pass over the headers returning `(from, subject)`.
///
/// Names match exactly, and a later duplicate overwrites an earlier one.
pub fn header_fields(headers: &[GmailHeader]) -> (String, String) {
    let mut from = String::new();
    let mut subject = String::new();
    for header in headers {
        match header.name.as_str() {
            "Subject" => subject = header.value.clone(),
            "From" => from = header.value.clone(),
            _ => {}
        }
    }
    (from, subject)
}

pub fn sender(headers: &[GmailHeader]) -> String {
    header_fields(headers).0
}

pub fn subject(headers: &[GmailHeader]) -> String {
    header_fields(headers).1
}

/// Decoded body of a message.
///
/// Multipart payloads contribute only their `text/html` part (the last one
/// wins); a multipart message without one has an empty body.
pub fn message_content(payload: &GmailPayload) -> Result<String, ExtractError> {
    match payload.parts.as_deref() {
        Some(parts) if !parts.is_empty() => {
            let mut content = String::new();
            collect_html_parts(parts, &mut content)?;
            Ok(content)
        }
        _ => decode_payload_body(payload, "top-level"),
    }
}

fn collect_html_parts(parts: &[GmailPayload], content: &mut String) -> Result<(), ExtractError> {
    for part in parts {
        let mime_type = part.mime_type.as_deref().unwrap_or_default();
        if mime_type.eq_ignore_ascii_case(HTML_MIME_TYPE) {
            *content = decode_payload_body(part, HTML_MIME_TYPE)?;
        } else if mime_type.to_ascii_lowercase().starts_with(MULTIPART_PREFIX) {
            if let Some(nested) = part.parts.as_deref() {
                collect_html_parts(nested, content)?;
            }
        }
    }
    Ok(())
}

fn decode_payload_body(payload: &GmailPayload, part: &str) -> Result<String, ExtractError> {
    let data = payload
        .body
        .as_ref()
        .and_then(|body| body.data.as_deref())
        .unwrap_or_default();
    decode_body_data(data, part)
}

pub fn decode_body_data(data: &str, part: &str) -> Result<String, ExtractError> {
    let bytes = BODY_ENGINE
        .decode(data.trim())
        .map_err(|source| ExtractError::Base64 {
            part: part.to_string(),
            source,
        })?;
    String::from_utf8(bytes).map_err(|source| ExtractError::Utf8 {
        part: part.to_string(),
        source,
    })
}

/// Links found in `text` that start with `http`, in order of appearance.
///
/// The matcher also recognises other schemes and bare `www.` hosts; those are
/// dropped. Duplicates are kept.
pub fn extract_urls(text: &str) -> Vec<String> {
    URL_PATTERN
        .find_iter(text)
        .map(|found| trim_trailing_punctuation(found.as_str()))
        .filter(|candidate| candidate.starts_with(URL_SCHEME_PREFIX))
        .map(str::to_string)
        .collect()
}

fn trim_trailing_punctuation(candidate: &str) -> &str {
    let mut end = candidate.len();
    loop {
        let trimmed = &candidate[..end];
        let Some(last) = trimmed.chars().last() else {
            return trimmed;
        };
        let strip = match last {
            '.' | ',' | ';' | ':' | '!' | '?' | '\'' | '"' => true,
            ')' => trimmed.matches(')').count() > trimmed.matches('(').count(),
            _ => false,
        };
        if !strip {
            return trimmed;
        }
        end -= last.len_utf8();
    }
}
