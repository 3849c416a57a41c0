//! Joins multi-page notifications back into one change event.
//!
//! Pages of one message share an md5 and arrive in order, since PostgreSQL
//! delivers the notifications of a transaction in the order they were sent.

use std::collections::HashMap;

use metrics::gauge;
use tracing::debug;

use super::events::{ChangeAction, EventNotification, Page};

const METRIC_PENDING: &str = "featuretag_listener_pending_messages";

/// A fully received change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub id: String,
    pub schema: String,
    pub table: String,
    pub action: ChangeAction,
    pub old_xmin: Option<String>,
    pub new_xmin: Option<String>,
    pub md5: String,
    /// Row serialized as JSON by the trigger function.
    pub row: String,
}

impl ChangeEvent {
    fn from_first_page(notification: EventNotification, row: String) -> Self {
        Self {
            id: notification.id,
            schema: notification.schema,
            table: notification.table,
            action: notification.action,
            old_xmin: notification.old_xmin,
            new_xmin: notification.new_xmin,
            md5: notification.md5,
            row,
        }
    }
}

/// Pending messages keyed by md5. Owned by the listener task alone.
// TODO: expire pending entries after a configurable age so a message whose
// last page never arrives does not stay buffered for the process lifetime.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<String, ChangeEvent>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one page. Returns the event once its last page has arrived.
    pub fn push(&mut self, notification: EventNotification, page: Page<'_>) -> Option<ChangeEvent> {
        if page.is_single() {
            return Some(ChangeEvent::from_first_page(
                notification,
                page.chunk.to_string(),
            ));
        }

        let chunk = page.chunk;
        let md5 = notification.md5.clone();
        self.pending
            .entry(md5.clone())
            .and_modify(|event| event.row.push_str(chunk))
            .or_insert_with(|| ChangeEvent::from_first_page(notification, chunk.to_string()));

        debug!(
            target = "featuretag::listener",
            md5 = %md5,
            page = page.index,
            pages = page.count,
            "received notification page"
        );

        let completed = page.is_last().then(|| self.pending.remove(&md5)).flatten();
        gauge!(METRIC_PENDING).set(self.pending.len() as f64);
        completed
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_notification(md5: &str, raw: &str) -> EventNotification {
        EventNotification {
            id: "public.mock_a".to_string(),
            schema: "public".to_string(),
            table: "mock_a".to_string(),
            action: ChangeAction::Insert,
            old_xmin: None,
            new_xmin: Some("900".to_string()),
            md5: md5.to_string(),
            raw_data: raw.to_string(),
        }
    }

    fn feed(reassembler: &mut Reassembler, md5: &str, raw: &str) -> Option<ChangeEvent> {
        let notification = page_notification(md5, raw);
        let raw_data = notification.raw_data.clone();
        let page = Page::parse(&raw_data).expect("page header");
        reassembler.push(notification, page)
    }

    #[test]
    fn single_page_completes_immediately() {
        let mut reassembler = Reassembler::new();
        let event = feed(&mut reassembler, "a", "1:1:{\"id\":1}").expect("complete");

        assert_eq!(event.row, "{\"id\":1}");
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn three_pages_join_in_order() {
        let mut reassembler = Reassembler::new();

        assert!(feed(&mut reassembler, "m", "3:1:{\"id\":4").is_none());
        assert!(feed(&mut reassembler, "m", "3:2:2,\"name\":").is_none());
        assert_eq!(reassembler.pending(), 1);

        let event = feed(&mut reassembler, "m", "3:3:\"x\"}").expect("complete");
        assert_eq!(event.row, "{\"id\":42,\"name\":\"x\"}");
        assert_eq!(event.new_xmin.as_deref(), Some("900"));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn interleaved_messages_stay_separate() {
        let mut reassembler = Reassembler::new();

        assert!(feed(&mut reassembler, "a", "2:1:[1,").is_none());
        assert!(feed(&mut reassembler, "b", "2:1:[3,").is_none());
        assert_eq!(reassembler.pending(), 2);

        assert_eq!(feed(&mut reassembler, "b", "2:2:4]").expect("b").row, "[3,4]");
        assert_eq!(feed(&mut reassembler, "a", "2:2:2]").expect("a").row, "[1,2]");
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn incomplete_message_stays_pending() {
        let mut reassembler = Reassembler::new();
        assert!(feed(&mut reassembler, "z", "4:1:abc").is_none());
        assert!(feed(&mut reassembler, "z", "4:2:def").is_none());
        assert_eq!(reassembler.pending(), 1);
    }
}
