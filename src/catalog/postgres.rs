use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Catalog, CatalogError, PgTypeKind, TableInfo};

const TABLES_SQL: &str = r#"
SELECT
    quote_ident(n.nspname) || '.' || quote_ident(c.relname) AS id,
    n.nspname::text AS schema_name,
    c.relname::text AS table_name,
    pk.attname::text AS id_column,
    COALESCE(cols.names, ARRAY[]::text[]) AS column_names,
    COALESCE(cols.types, ARRAY[]::text[]) AS column_types
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN LATERAL (
    SELECT a.attname
    FROM pg_catalog.pg_index i
    JOIN pg_catalog.pg_attribute a
        ON a.attrelid = i.indrelid AND a.attnum = i.indkey[0]
    WHERE i.indrelid = c.oid AND i.indisprimary AND i.indnatts = 1
) pk ON true
LEFT JOIN LATERAL (
    SELECT
        array_agg(a.attname::text ORDER BY a.attnum) AS names,
        array_agg(t.typname::text ORDER BY a.attnum) AS types
    FROM pg_catalog.pg_attribute a
    JOIN pg_catalog.pg_type t ON t.oid = a.atttypid
    WHERE a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
) cols ON true
WHERE c.relkind IN ('r', 'p')
  AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
  AND n.nspname NOT LIKE 'pg_temp_%'
  AND n.nspname NOT LIKE 'pg_toast_temp_%'
ORDER BY n.nspname, c.relname
"#;

#[derive(sqlx::FromRow)]
struct TableRow {
    id: String,
    schema_name: String,
    table_name: String,
    id_column: Option<String>,
    column_names: Vec<String>,
    column_types: Vec<String>,
}

impl From<TableRow> for TableInfo {
    fn from(row: TableRow) -> Self {
        let column_types = row
            .column_names
            .into_iter()
            .zip(row.column_types.iter().map(|name| PgTypeKind::from_type_name(name)))
            .collect();
        Self {
            id: row.id,
            schema: row.schema_name,
            table: row.table_name,
            id_column: row.id_column,
            column_types,
        }
    }
}

/// Catalog read from `pg_catalog`, snapshotted at load and on `reload`.
pub struct PgCatalog {
    pool: PgPool,
    tables: RwLock<HashMap<String, TableInfo>>,
}

impl PgCatalog {
    pub async fn load(pool: PgPool) -> Result<Self, CatalogError> {
        let catalog = Self {
            pool,
            tables: RwLock::new(HashMap::new()),
        };
        catalog.reload().await?;
        Ok(catalog)
    }

    /// Re-read table metadata, replacing the snapshot.
    pub async fn reload(&self) -> Result<usize, CatalogError> {
        let rows: Vec<TableRow> = sqlx::query_as(TABLES_SQL).fetch_all(&self.pool).await?;
        let snapshot: HashMap<String, TableInfo> = rows
            .into_iter()
            .map(TableInfo::from)
            .map(|table| (table.id.clone(), table))
            .collect();
        let count = snapshot.len();

        *self.tables.write().await = snapshot;
        info!(
            target = "featuretag::catalog",
            tables = count,
            "Loaded table catalog"
        );
        Ok(count)
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn table_by_name(&self, name: &str) -> Result<Option<TableInfo>, CatalogError> {
        let tables = self.tables.read().await;
        if let Some(table) = tables.get(name) {
            return Ok(Some(table.clone()));
        }
        let found = tables.values().find(|table| table.matches_name(name)).cloned();
        if found.is_none() {
            debug!(target = "featuretag::catalog", name, "table not in catalog");
        }
        Ok(found)
    }

    async fn tables(&self) -> Result<Vec<TableInfo>, CatalogError> {
        let mut tables: Vec<TableInfo> = self.tables.read().await.values().cloned().collect();
        tables.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tables)
    }
}
