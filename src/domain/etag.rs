//! Weak and strong etags for served features.
//!
//! A weak etag fingerprints one row version (its `xmin`). A strong etag is the
//! client-facing token: the base64 form of
//! `"<collection>-<srid>-<format>-<weakVersion>"`. The HTTP layer may wrap it
//! in double quotes; decoding tolerates quotes both around the token and
//! around the decoded text.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};

const SEGMENT_SEPARATOR: char = '-';
const SEGMENT_COUNT: usize = 4;
const KEY_SEPARATOR: char = ':';

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Decoded strong etag did not have the expected shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EtagError {
    #[error("malformed etag `{candidate}`: not valid base64")]
    InvalidBase64 { candidate: String },
    #[error("malformed etag `{candidate}`: expected 4 non-empty segments, found {found}")]
    SegmentCount { candidate: String, found: usize },
}

/// Server-side fingerprint of one feature row version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakEtag {
    pub collection: String,
    pub feature_id: String,
    /// Row version marker (`xmin`).
    pub version: String,
    /// HTTP date the etag was produced at, used for `Last-Modified`.
    pub last_modified: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl WeakEtag {
    pub fn new(
        collection: impl Into<String>,
        feature_id: impl Into<String>,
        version: impl Into<String>,
        last_modified: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            feature_id: feature_id.into(),
            version: version.into(),
            last_modified: last_modified.into(),
            data: None,
        }
    }

    /// Weak etag known only by its version, as delete notifications describe rows.
    pub fn from_version(version: impl Into<String>) -> Self {
        Self::new("", "", version, "")
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    /// Identity key: collection, feature id and version.
    pub fn cache_key(&self) -> String {
        format!(
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.collection, self.feature_id, self.version
        )
    }

    /// Version-only key. Strong etag lookups and delete events resolve through it.
    pub fn alternate_cache_key(&self) -> String {
        self.version.clone()
    }

    /// Strong etag for one representation of this feature.
    pub fn strong_etag(&self, srid: impl fmt::Display, format: &str) -> StrongEtag {
        StrongEtag::encode(&self.collection, &srid.to_string(), format, &self.version)
    }
}

impl fmt::Display for WeakEtag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W/\"{}\"", self.version)
    }
}

/// Base64 wire token handed to clients in the `ETag` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrongEtag(String);

impl StrongEtag {
    pub fn encode(collection: &str, srid: &str, format: &str, weak_version: &str) -> Self {
        let raw = [collection, srid, format, weak_version].join("-");
        Self(STANDARD.encode(raw))
    }

    pub fn decode(candidate: &str) -> Result<DecodedEtag, EtagError> {
        let unquoted = strip_quotes(candidate);
        let bytes = STANDARD
            .decode(unquoted.as_bytes())
            .map_err(|_| EtagError::InvalidBase64 {
                candidate: candidate.to_string(),
            })?;
        let text = String::from_utf8(bytes).map_err(|_| EtagError::InvalidBase64 {
            candidate: candidate.to_string(),
        })?;
        let text = strip_quotes(&text);

        let segments: Vec<&str> = text.split(SEGMENT_SEPARATOR).collect();
        if segments.len() != SEGMENT_COUNT || segments.iter().any(|segment| segment.is_empty()) {
            return Err(EtagError::SegmentCount {
                candidate: candidate.to_string(),
                found: segments.len(),
            });
        }

        Ok(DecodedEtag {
            collection: segments[0].to_string(),
            srid: segments[1].to_string(),
            format: segments[2].to_string(),
            weak_version: segments[3].to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted form for response headers.
    pub fn as_header_value(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for StrongEtag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Segments recovered from a strong etag. Values are opaque strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEtag {
    pub collection: String,
    pub srid: String,
    pub format: String,
    pub weak_version: String,
}

/// Current time as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date_now() -> String {
    format_http_date(OffsetDateTime::now_utc())
}

pub fn format_http_date(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC)
        .format(HTTP_DATE)
        .unwrap_or_default()
}

fn strip_quotes(value: &str) -> String {
    value.trim().replace('"', "")
}
