//! Messages published by the trigger function on `table_update`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Row operation that fired the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// The previous row version leaves the cache.
    pub fn invalidates_previous(self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }

    /// The new row version enters the cache.
    pub fn caches_current(self) -> bool {
        matches!(self, Self::Insert | Self::Update)
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk of a change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNotification {
    /// Quoted, schema-qualified table id.
    pub id: String,
    pub schema: String,
    pub table: String,
    pub action: ChangeAction,
    #[serde(default, deserialize_with = "xid_opt")]
    pub old_xmin: Option<String>,
    #[serde(default, deserialize_with = "xid_opt")]
    pub new_xmin: Option<String>,
    /// Digest shared by every chunk of one message.
    pub md5: String,
    /// `<pageCount>:<pageIndex>:<chunk>`.
    pub raw_data: String,
}

impl EventNotification {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// `xid` values arrive as JSON strings, numbers are accepted too.
fn xid_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Xid {
        Text(String),
        Number(u64),
    }

    Ok(Option::<Xid>::deserialize(deserializer)?.map(|xid| match xid {
        Xid::Text(text) => text,
        Xid::Number(number) => number.to_string(),
    }))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PageError {
    #[error("page header missing in `{0}`")]
    MissingHeader(String),
    #[error("page numbers must be decimal digits, got `{count}:{index}`")]
    NotNumeric { count: String, index: String },
    #[error("page {index} out of range 1..={count}")]
    OutOfRange { count: u32, index: u32 },
}

/// Parsed `raw_data` header plus its chunk text. Pages are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page<'a> {
    pub count: u32,
    pub index: u32,
    pub chunk: &'a str,
}

impl<'a> Page<'a> {
    pub fn parse(raw: &'a str) -> Result<Self, PageError> {
        let mut parts = raw.splitn(3, ':');
        let (Some(count), Some(index), Some(chunk)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(PageError::MissingHeader(preview(raw)));
        };

        let numeric = |value: &str| !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit());
        let (Some(count_n), Some(index_n)) = (
            numeric(count).then(|| count.parse::<u32>().ok()).flatten(),
            numeric(index).then(|| index.parse::<u32>().ok()).flatten(),
        ) else {
            return Err(PageError::NotNumeric {
                count: count.to_string(),
                index: index.to_string(),
            });
        };

        if count_n == 0 || index_n == 0 || index_n > count_n {
            return Err(PageError::OutOfRange {
                count: count_n,
                index: index_n,
            });
        }

        Ok(Self {
            count: count_n,
            index: index_n,
            chunk,
        })
    }

    pub fn is_last(&self) -> bool {
        self.index == self.count
    }

    pub fn is_single(&self) -> bool {
        self.count == 1
    }
}

fn preview(raw: &str) -> String {
    raw.chars().take(32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trigger_payload() {
        let payload = r#"{
            "id": "public.mock_a",
            "schema": "public",
            "table": "mock_a",
            "action": "UPDATE",
            "old_xmin": "801",
            "new_xmin": 802,
            "md5": "5d41402abc4b2a76b9719d911017c592",
            "raw_data": "1:1:{\"id\":1}"
        }"#;
        let event = EventNotification::parse(payload).expect("payload");

        assert_eq!(event.action, ChangeAction::Update);
        assert_eq!(event.old_xmin.as_deref(), Some("801"));
        assert_eq!(event.new_xmin.as_deref(), Some("802"));
        let page = Page::parse(&event.raw_data).expect("page");
        assert!(page.is_single() && page.is_last());
        assert_eq!(page.chunk, r#"{"id":1}"#);
    }

    #[test]
    fn null_xmin_is_none() {
        let payload = r#"{"id":"public.t","schema":"public","table":"t","action":"INSERT",
            "old_xmin":null,"new_xmin":"9","md5":"x","raw_data":"1:1:{}"}"#;
        let event = EventNotification::parse(payload).expect("payload");
        assert_eq!(event.old_xmin, None);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let payload = r#"{"id":"public.t","schema":"public","table":"t","action":"TRUNCATE",
            "old_xmin":null,"new_xmin":null,"md5":"x","raw_data":"1:1:{}"}"#;
        assert!(EventNotification::parse(payload).is_err());
    }

    #[test]
    fn chunk_keeps_embedded_colons() {
        let page = Page::parse("3:2:\"a\":\"b:c\"").expect("page");
        assert_eq!((page.count, page.index), (3, 2));
        assert_eq!(page.chunk, "\"a\":\"b:c\"");
        assert!(!page.is_last());
    }

    #[test]
    fn empty_chunk_is_allowed() {
        let page = Page::parse("2:2:").expect("page");
        assert!(page.is_last());
        assert_eq!(page.chunk, "");
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert!(matches!(
            Page::parse("no header"),
            Err(PageError::MissingHeader(_))
        ));
        assert!(matches!(
            Page::parse("a:1:{}"),
            Err(PageError::NotNumeric { .. })
        ));
        assert!(matches!(
            Page::parse("-1:1:{}"),
            Err(PageError::NotNumeric { .. })
        ));
        assert!(matches!(
            Page::parse("2:3:{}"),
            Err(PageError::OutOfRange { .. })
        ));
        assert!(matches!(
            Page::parse("0:0:{}"),
            Err(PageError::OutOfRange { .. })
        ));
    }

    #[test]
    fn action_predicates() {
        assert!(ChangeAction::Update.invalidates_previous());
        assert!(ChangeAction::Update.caches_current());
        assert!(!ChangeAction::Insert.invalidates_previous());
        assert!(!ChangeAction::Delete.caches_current());
    }
}
