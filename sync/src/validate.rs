//! Turning untrusted remote items into cacheable content.
//!
//! Every field is cleaned with [`sanitize_field`] before it is hashed or
//! stored. Items that fail are dropped one by one; the rest still sync.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use haven_types::{CachedContent, ContentCacheEntry, FieldShape, sanitize_field};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

pub const MAX_ID_CHARS: usize = 64;
pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_BODY_CHARS: usize = 20_000;
pub const MAX_URL_CHARS: usize = 2048;

#[derive(Debug, Deserialize)]
struct RawItem {
    id: String,
    title: String,
    body: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

/// Why a remote item was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRejection {
    /// Not an object, or a required field is missing or not a string.
    Malformed,
    InvalidId,
    DuplicateId,
    EmptyTitle,
    EmptyBody,
    InvalidUrl,
    InsecureUrl,
    InvalidTimestamp,
}

impl ItemRejection {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            ItemRejection::Malformed => "malformed",
            ItemRejection::InvalidId => "invalid_id",
            ItemRejection::DuplicateId => "duplicate_id",
            ItemRejection::EmptyTitle => "empty_title",
            ItemRejection::EmptyBody => "empty_body",
            ItemRejection::InvalidUrl => "invalid_url",
            ItemRejection::InsecureUrl => "insecure_url",
            ItemRejection::InvalidTimestamp => "invalid_timestamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedItem {
    pub source_id: String,
    pub content: CachedContent,
    pub content_hash: String,
}

impl ValidatedItem {
    #[must_use]
    pub fn into_entry(self, now: DateTime<Utc>) -> ContentCacheEntry {
        ContentCacheEntry {
            source_id: self.source_id,
            fetched_at: now,
            validated_at: now,
            content: self.content,
            content_hash: self.content_hash,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    pub items: Vec<ValidatedItem>,
    /// Position in the envelope and the reason it was dropped.
    pub rejected: Vec<(usize, ItemRejection)>,
}

#[must_use]
pub fn validate_items(raw: Vec<Value>) -> Validation {
    let mut validation = Validation::default();
    let mut seen = HashSet::new();

    for (index, value) in raw.into_iter().enumerate() {
        let result = serde_json::from_value::<RawItem>(value)
            .map_err(|_| ItemRejection::Malformed)
            .and_then(validate_item);
        match result {
            Ok(item) if !seen.insert(item.source_id.clone()) => {
                validation.rejected.push((index, ItemRejection::DuplicateId));
            }
            Ok(item) => validation.items.push(item),
            Err(reason) => validation.rejected.push((index, reason)),
        }
    }

    for (index, reason) in &validation.rejected {
        tracing::debug!(index, code = reason.code(), "Dropped remote content item");
    }
    validation
}

fn validate_item(raw: RawItem) -> Result<ValidatedItem, ItemRejection> {
    if !is_valid_id(&raw.id) {
        return Err(ItemRejection::InvalidId);
    }

    let title = sanitize_field(&raw.title, FieldShape::SingleLine, MAX_TITLE_CHARS);
    if title.is_empty() {
        return Err(ItemRejection::EmptyTitle);
    }
    let body = sanitize_field(&raw.body, FieldShape::MultiLine, MAX_BODY_CHARS);
    if body.is_empty() {
        return Err(ItemRejection::EmptyBody);
    }
    let url = raw.url.as_deref().map(validate_url).transpose()?.flatten();
    let updated_at = raw
        .updated_at
        .as_deref()
        .map(|ts| {
            DateTime::parse_from_rfc3339(ts.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ItemRejection::InvalidTimestamp)
        })
        .transpose()?;

    let content = CachedContent {
        title,
        body,
        url,
        updated_at,
    };
    let content_hash = content_hash(&content);
    Ok(ValidatedItem {
        source_id: raw.id,
        content,
        content_hash,
    })
}

fn is_valid_id(id: &str) -> bool {
    (1..=MAX_ID_CHARS).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// An empty url is treated as absent. Long urls are refused, never truncated.
fn validate_url(raw: &str) -> Result<Option<String>, ItemRejection> {
    let cleaned = sanitize_field(raw, FieldShape::SingleLine, MAX_URL_CHARS + 1);
    if cleaned.is_empty() {
        return Ok(None);
    }
    if cleaned.chars().count() > MAX_URL_CHARS {
        return Err(ItemRejection::InvalidUrl);
    }
    let url = Url::parse(&cleaned).map_err(|_| ItemRejection::InvalidUrl)?;
    if url.scheme() != "https" {
        return Err(ItemRejection::InsecureUrl);
    }
    if url.host().is_none() || !url.username().is_empty() || url.password().is_some() {
        return Err(ItemRejection::InvalidUrl);
    }
    Ok(Some(url.to_string()))
}

/// Hex SHA-256 over the sanitized fields, each framed so that moving text
/// between fields changes the hash.
#[must_use]
pub fn content_hash(content: &CachedContent) -> String {
    let updated_at = content.updated_at.map(|ts| ts.to_rfc3339());
    let mut hasher = Sha256::new();
    for field in [
        Some(content.title.as_str()),
        Some(content.body.as_str()),
        content.url.as_deref(),
        updated_at.as_deref(),
    ] {
        match field {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
