//! Keeps the etag cache in step with table mutations.
//!
//! `initialize` installs a trigger function in a dedicated schema, attaches it
//! to every catalog table admitted by the filter, subscribes to the
//! `table_update` channel and spawns one task that feeds notifications into a
//! [`NotificationProcessor`]. `close` stops the task and removes everything
//! `initialize` installed.

pub mod ddl;
mod dispatch;
mod events;
mod reassembly;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::EtagCache;
use crate::catalog::{Catalog, CatalogError, TableFilter, TableInfo};

pub use dispatch::{NotificationProcessor, Outcome, feature_id};
pub use events::{ChangeAction, EventNotification, Page, PageError};
pub use reassembly::{ChangeEvent, Reassembler};

/// Channel the trigger function notifies on.
pub const CHANNEL: &str = "table_update";

const DEFAULT_TEMP_SCHEMA: &str = "featuretag_cdc";
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CHUNK_SIZE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Uninitialized,
    Initializing,
    Listening,
    Closing,
    Closed,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Listening => "listening",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot {operation} a listener that is {state}")]
    InvalidState {
        operation: &'static str,
        state: ListenerState,
    },
    #[error("failed to {action}: {source}")]
    Ddl {
        action: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("notification connection failed: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("notification connection was lost; changes may have been missed")]
    ConnectionLost,
    #[error("incompatible notification payload: {message}")]
    Payload { message: String },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("listener task ended abnormally: {0}")]
    Task(String),
}

impl ListenerError {
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload {
            message: message.into(),
        }
    }

    fn ddl(action: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Ddl {
            action: action.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Schema holding the trigger function. Dropped with `CASCADE` on close.
    pub temp_schema: String,
    /// Upper bound on one wait for a notification; cancellation is observed
    /// at least this often.
    pub wait_timeout: Duration,
    /// Row JSON characters per notification page.
    pub chunk_size: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            temp_schema: DEFAULT_TEMP_SCHEMA.to_string(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&crate::config::ListenerSettings> for ListenerConfig {
    fn from(settings: &crate::config::ListenerSettings) -> Self {
        Self {
            temp_schema: settings.temp_schema.clone(),
            wait_timeout: settings.wait_timeout,
            chunk_size: settings.chunk_size.get(),
        }
    }
}

pub struct ChangeListener {
    pool: PgPool,
    cache: Arc<EtagCache>,
    catalog: Arc<dyn Catalog>,
    config: ListenerConfig,
    state: ListenerState,
    installed: Vec<TableInfo>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), ListenerError>>>,
}

impl ChangeListener {
    pub fn new(
        pool: PgPool,
        cache: Arc<EtagCache>,
        catalog: Arc<dyn Catalog>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            catalog,
            config,
            state: ListenerState::Uninitialized,
            installed: Vec::new(),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Tables that currently carry a notify trigger.
    pub fn installed_tables(&self) -> &[TableInfo] {
        &self.installed
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Install schema, function and triggers, subscribe, and start the task.
    ///
    /// On failure whatever was installed is removed again and the listener
    /// ends up `Closed`.
    pub async fn initialize(&mut self, filter: &TableFilter) -> Result<(), ListenerError> {
        if self.state != ListenerState::Uninitialized {
            return Err(ListenerError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }
        self.state = ListenerState::Initializing;

        match self.install_and_subscribe(filter).await {
            Ok(listener) => {
                let processor =
                    NotificationProcessor::new(Arc::clone(&self.cache), Arc::clone(&self.catalog));
                let task = tokio::spawn(listen(
                    listener,
                    processor,
                    self.config.wait_timeout,
                    self.cancel.clone(),
                ));
                self.task = Some(task);
                self.state = ListenerState::Listening;
                info!(
                    target = "featuretag::listener",
                    channel = CHANNEL,
                    schema = %self.config.temp_schema,
                    tables = self.installed.len(),
                    "Change listener started"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    target = "featuretag::listener",
                    error = %err,
                    "Change listener initialization failed; removing installed objects"
                );
                self.uninstall().await;
                self.state = ListenerState::Closed;
                Err(err)
            }
        }
    }

    async fn install_and_subscribe(
        &mut self,
        filter: &TableFilter,
    ) -> Result<PgListener, ListenerError> {
        let schema = self.config.temp_schema.clone();

        execute(&self.pool, &ddl::create_schema(&schema))
            .await
            .map_err(|err| ListenerError::ddl(format!("create schema {schema}"), err))?;
        execute(
            &self.pool,
            &ddl::create_notify_function(&schema, self.config.chunk_size),
        )
        .await
        .map_err(|err| ListenerError::ddl("create notify function", err))?;

        for table in self.catalog.tables().await? {
            if !filter.is_included(&table) {
                debug!(target = "featuretag::listener", table = %table.id, "table excluded");
                continue;
            }
            execute(&self.pool, &ddl::drop_trigger(&table))
                .await
                .map_err(|err| ListenerError::ddl(format!("drop trigger on {}", table.id), err))?;
            execute(&self.pool, &ddl::create_trigger(&table, &schema))
                .await
                .map_err(|err| ListenerError::ddl(format!("create trigger on {}", table.id), err))?;
            debug!(target = "featuretag::listener", table = %table.id, "trigger installed");
            self.installed.push(table);
        }

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(ListenerError::Connection)?;
        listener
            .listen(CHANNEL)
            .await
            .map_err(ListenerError::Connection)?;
        Ok(listener)
    }

    /// Wait for the listener task to end. Returns its error if it failed.
    ///
    /// Returns immediately when no task is running. Dropping the future leaves
    /// the task running.
    pub async fn run_until_stopped(&mut self) -> Result<(), ListenerError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        match joined {
            Ok(result) => result,
            Err(err) => Err(ListenerError::Task(err.to_string())),
        }
    }

    /// Stop listening and remove triggers and schema. A no-op unless listening.
    pub async fn close(&mut self) {
        if self.state != ListenerState::Listening {
            debug!(
                target = "featuretag::listener",
                state = %self.state,
                "close ignored"
            );
            return;
        }
        self.state = ListenerState::Closing;
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    target = "featuretag::listener",
                    error = %err,
                    "Listener task had failed before close"
                ),
                Err(err) => warn!(
                    target = "featuretag::listener",
                    error = %err,
                    "Listener task panicked"
                ),
            }
        }

        self.uninstall().await;
        self.state = ListenerState::Closed;
        info!(target = "featuretag::listener", "Change listener closed");
    }

    async fn uninstall(&mut self) {
        for table in self.installed.drain(..) {
            if let Err(err) = execute(&self.pool, &ddl::drop_trigger(&table)).await {
                warn!(
                    target = "featuretag::listener",
                    table = %table.id,
                    error = %err,
                    "Failed to drop notify trigger"
                );
            }
        }
        if let Err(err) = execute(&self.pool, &ddl::drop_schema(&self.config.temp_schema)).await {
            warn!(
                target = "featuretag::listener",
                schema = %self.config.temp_schema,
                error = %err,
                "Failed to drop notification schema"
            );
        }
    }
}

/// Drop notify triggers and the temp schema left by a listener that never
/// reached `close`. Returns the number of triggers dropped.
pub async fn remove_leftovers(pool: &PgPool, temp_schema: &str) -> Result<usize, ListenerError> {
    let triggers: Vec<(String, String)> = sqlx::query_as(ddl::INSTALLED_TRIGGERS_SQL)
        .bind(temp_schema)
        .fetch_all(pool)
        .await
        .map_err(|err| ListenerError::ddl("list notify triggers", err))?;

    for (table_id, trigger) in &triggers {
        execute(pool, &ddl::drop_trigger_named(table_id, trigger))
            .await
            .map_err(|err| ListenerError::ddl(format!("drop trigger {trigger} on {table_id}"), err))?;
        info!(
            target = "featuretag::listener",
            table = %table_id,
            trigger = %trigger,
            "Dropped leftover notify trigger"
        );
    }

    execute(pool, &ddl::drop_schema(temp_schema))
        .await
        .map_err(|err| ListenerError::ddl(format!("drop schema {temp_schema}"), err))?;
    Ok(triggers.len())
}

async fn execute(pool: &PgPool, sql: &str) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(sql).execute(pool).await.map(|_| ())
}

async fn listen(
    mut listener: PgListener,
    mut processor: NotificationProcessor,
    wait_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), ListenerError> {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target = "featuretag::listener", "listener task cancelled");
                return Ok(());
            }
            received = tokio::time::timeout(wait_timeout, listener.try_recv()) => received,
        };

        let notification = match received {
            Err(_elapsed) => continue,
            Ok(Ok(Some(notification))) => notification,
            Ok(Ok(None)) => {
                error!(
                    target = "featuretag::listener",
                    "Notification connection dropped; changes in the gap cannot be replayed"
                );
                return Err(ListenerError::ConnectionLost);
            }
            Ok(Err(err)) => {
                error!(
                    target = "featuretag::listener",
                    error = %err,
                    "Notification connection failed"
                );
                return Err(ListenerError::Connection(err));
            }
        };

        if let Err(err) = processor.handle_payload(notification.payload()).await {
            error!(
                target = "featuretag::listener",
                error = %err,
                "Stopping listener on incompatible notification"
            );
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ListenerConfig::default();
        assert_eq!(config.temp_schema, "featuretag_cdc");
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert_eq!(config.chunk_size, 1000);
    }

    #[tokio::test]
    async fn close_before_initialize_is_noop() {
        let pool = PgPool::connect_lazy("postgres://localhost/featuretag").expect("lazy pool");
        let mut listener = ChangeListener::new(
            pool,
            Arc::new(EtagCache::Disabled),
            Arc::new(crate::catalog::StaticCatalog::default()),
            ListenerConfig::default(),
        );

        listener.close().await;
        assert_eq!(listener.state(), ListenerState::Uninitialized);
        assert!(listener.run_until_stopped().await.is_ok());
    }

    #[test]
    fn invalid_state_message_names_state() {
        let err = ListenerError::InvalidState {
            operation: "initialize",
            state: ListenerState::Listening,
        };
        assert_eq!(err.to_string(), "cannot initialize a listener that is listening");
    }
}
