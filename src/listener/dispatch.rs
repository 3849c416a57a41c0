//! Applies completed change events to the etag cache.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::EtagCache;
use crate::catalog::{Catalog, PgTypeKind, TableInfo};
use crate::domain::etag::{WeakEtag, http_date_now};

use super::ListenerError;
use super::events::EventNotification;
use super::reassembly::{ChangeEvent, Reassembler};

const METRIC_EVENTS: &str = "featuretag_listener_events_total";
const METRIC_APPLY_MS: &str = "featuretag_listener_apply_ms";

/// What happened to one completed event. Used by tests and debug logs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub removed: bool,
    pub added: bool,
}

/// Turns raw `table_update` payloads into cache mutations.
pub struct NotificationProcessor {
    cache: Arc<EtagCache>,
    catalog: Arc<dyn Catalog>,
    reassembler: Reassembler,
}

impl NotificationProcessor {
    pub fn new(cache: Arc<EtagCache>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            cache,
            catalog,
            reassembler: Reassembler::new(),
        }
    }

    /// Handle one notification payload.
    ///
    /// A payload that is not a trigger message, or whose page header does not
    /// parse, means the installed trigger function is incompatible and is
    /// reported as an error. Everything past that is logged and skipped.
    pub async fn handle_payload(&mut self, payload: &str) -> Result<Option<Outcome>, ListenerError> {
        let mut notification =
            EventNotification::parse(payload).map_err(|err| ListenerError::payload(err.to_string()))?;
        let raw = std::mem::take(&mut notification.raw_data);
        let page = super::events::Page::parse(&raw)
            .map_err(|err| ListenerError::payload(err.to_string()))?;

        match self.reassembler.push(notification, page) {
            Some(event) => Ok(Some(self.apply(event).await)),
            None => Ok(None),
        }
    }

    pub fn pending(&self) -> usize {
        self.reassembler.pending()
    }

    async fn apply(&self, event: ChangeEvent) -> Outcome {
        let started = Instant::now();
        let mut outcome = Outcome::default();
        counter!(METRIC_EVENTS, "action" => event.action.as_str()).increment(1);
        debug!(
            target = "featuretag::listener",
            table = %event.id,
            action = %event.action,
            md5 = %event.md5,
            "received complete notification"
        );

        let row = match serde_json::from_str::<Map<String, Value>>(&event.row) {
            Ok(row) => Some(row),
            Err(err) => {
                warn!(
                    target = "featuretag::listener",
                    table = %event.id,
                    error = %err,
                    "Notification row is not a JSON object; skipping cache enrichment"
                );
                None
            }
        };

        if event.action.invalidates_previous() {
            outcome.removed = self.invalidate(&event).await;
        }
        if event.action.caches_current() {
            if let Some(row) = row {
                outcome.added = self.enrich(&event, row).await;
            }
        }
        histogram!(METRIC_APPLY_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn invalidate(&self, event: &ChangeEvent) -> bool {
        let Some(old_xmin) = event.old_xmin.as_deref() else {
            warn!(
                target = "featuretag::listener",
                table = %event.id,
                action = %event.action,
                "Notification without previous row version"
            );
            return false;
        };

        let key = WeakEtag::from_version(old_xmin).alternate_cache_key();
        match self.cache.remove_weak_etag(&key).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(
                    target = "featuretag::listener",
                    key = %key,
                    error = %err,
                    "Failed to remove weak etag from cache"
                );
                false
            }
        }
    }

    async fn enrich(&self, event: &ChangeEvent, row: Map<String, Value>) -> bool {
        let Some(new_xmin) = event.new_xmin.as_deref() else {
            warn!(
                target = "featuretag::listener",
                table = %event.id,
                "Notification without new row version"
            );
            return false;
        };

        let table = match self.catalog.table_by_name(&event.id).await {
            Ok(Some(table)) => table,
            Ok(None) => {
                warn!(
                    target = "featuretag::listener",
                    table = %event.id,
                    "Notification about unknown table"
                );
                return false;
            }
            Err(err) => {
                warn!(
                    target = "featuretag::listener",
                    table = %event.id,
                    error = %err,
                    "Catalog lookup failed"
                );
                return false;
            }
        };

        let Some(feature_id) = feature_id(&table, &row) else {
            return false;
        };

        let etag = WeakEtag::new(&event.id, feature_id, new_xmin, http_date_now()).with_data(row);
        let mut added = true;
        for key in [etag.cache_key(), etag.alternate_cache_key()] {
            match self.cache.add_weak_etag(&key, etag.clone()).await {
                Ok(stored) => added &= stored,
                Err(err) => {
                    added = false;
                    warn!(
                        target = "featuretag::listener",
                        key = %key,
                        error = %err,
                        "Failed to add weak etag to cache"
                    );
                }
            }
        }
        added
    }
}

/// Six-decimal rendering. Integers are printed exactly so `int8` ids above
/// 2^53 stay distinct.
fn fixed_point(number: &serde_json::Number) -> Option<String> {
    if let Some(value) = number.as_i64() {
        return Some(format!("{value}.000000"));
    }
    if let Some(value) = number.as_u64() {
        return Some(format!("{value}.000000"));
    }
    number.as_f64().map(|value| format!("{value:.6}"))
}

/// Feature id as the read path renders it: text ids verbatim, numeric ids in
/// fixed-point with six decimals.
pub fn feature_id(table: &TableInfo, row: &Map<String, Value>) -> Option<String> {
    let (Some(column), Some(kind)) = (table.id_column.as_deref(), table.id_kind()) else {
        warn!(
            target = "featuretag::listener",
            table = %table.id,
            "Notification about table without a single-column primary key"
        );
        return None;
    };

    let converted = match (kind, row.get(column)) {
        (_, None | Some(Value::Null)) => None,
        (kind, Some(Value::String(text))) if kind.is_textual() => Some(text.clone()),
        (kind, Some(Value::Number(number))) if kind.is_numeric() => fixed_point(number),
        // numeric columns serialize as JSON numbers, but accept quoted digits
        (PgTypeKind::Numeric, Some(Value::String(text))) => text
            .parse::<serde_json::Number>()
            .ok()
            .and_then(|number| fixed_point(&number)),
        _ => None,
    };

    if converted.is_none() {
        warn!(
            target = "featuretag::listener",
            table = %table.id,
            id_column = column,
            id_kind = ?kind,
            "Notification row id missing or of an unhandled type"
        );
    }
    converted
}
