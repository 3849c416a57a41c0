//! Table metadata the listener needs: which tables exist and how their
//! primary key is typed.

mod filter;
mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use filter::TableFilter;
pub use postgres::PgCatalog;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Column type families relevant to feature id conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgTypeKind {
    Text,
    VarChar,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Other(String),
}

impl PgTypeKind {
    /// Map a `pg_type.typname`.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "text" => Self::Text,
            "varchar" | "bpchar" => Self::VarChar,
            "int2" => Self::Int2,
            "int4" => Self::Int4,
            "int8" => Self::Int8,
            "float4" => Self::Float4,
            "float8" => Self::Float8,
            "numeric" => Self::Numeric,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, Self::Text | Self::VarChar)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Int2 | Self::Int4 | Self::Int8 | Self::Float4 | Self::Float8 | Self::Numeric
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    /// `quote_ident(schema).quote_ident(table)`, the form trigger payloads carry.
    pub id: String,
    pub schema: String,
    pub table: String,
    /// Single-column primary key, if the table has one.
    pub id_column: Option<String>,
    pub column_types: HashMap<String, PgTypeKind>,
}

impl TableInfo {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        let schema = schema.into();
        let table = table.into();
        Self {
            id: format!("{}.{}", quote_ident(&schema), quote_ident(&table)),
            schema,
            table,
            id_column: None,
            column_types: HashMap::new(),
        }
    }

    pub fn with_id_column(mut self, column: impl Into<String>, kind: PgTypeKind) -> Self {
        let column = column.into();
        self.column_types.insert(column.clone(), kind);
        self.id_column = Some(column);
        self
    }

    pub fn with_column(mut self, column: impl Into<String>, kind: PgTypeKind) -> Self {
        self.column_types.insert(column.into(), kind);
        self
    }

    pub fn id_kind(&self) -> Option<&PgTypeKind> {
        self.id_column
            .as_ref()
            .and_then(|column| self.column_types.get(column))
    }

    /// Unquoted `schema.table`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    fn matches_name(&self, name: &str) -> bool {
        self.id == name || self.qualified_name() == name
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Look a table up by its quoted id or plain `schema.table` name.
    async fn table_by_name(&self, name: &str) -> Result<Option<TableInfo>, CatalogError>;

    async fn tables(&self) -> Result<Vec<TableInfo>, CatalogError>;
}

/// Fixed table list, for tests and for embedding without a live catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tables: Vec<TableInfo>,
}

impl StaticCatalog {
    pub fn new(tables: Vec<TableInfo>) -> Self {
        Self { tables }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn table_by_name(&self, name: &str) -> Result<Option<TableInfo>, CatalogError> {
        Ok(self
            .tables
            .iter()
            .find(|table| table.matches_name(name))
            .cloned())
    }

    async fn tables(&self) -> Result<Vec<TableInfo>, CatalogError> {
        Ok(self.tables.clone())
    }
}

/// PostgreSQL `quote_ident`: leave plain lowercase identifiers bare, otherwise
/// double-quote and escape embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    let plain = !ident.is_empty()
        && ident
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_lowercase() || first == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$');
    if plain && !is_reserved(ident) {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// Keywords that PostgreSQL's `quote_ident` quotes: every reserved,
/// type/function-name and column-name keyword. Sorted for binary search.
const QUOTED_KEYWORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
    "authorization", "between", "bigint", "binary", "bit", "boolean", "both", "case",
    "cast", "char", "character", "check", "coalesce", "collate", "collation", "column",
    "concurrently", "constraint", "create", "cross", "current_catalog", "current_date",
    "current_role", "current_schema", "current_time", "current_timestamp", "current_user",
    "dec", "decimal", "default", "deferrable", "desc", "distinct", "do", "else", "end",
    "except", "exists", "extract", "false", "fetch", "float", "for", "foreign", "freeze",
    "from", "full", "grant", "greatest", "group", "grouping", "having", "ilike", "in",
    "initially", "inner", "inout", "int", "integer", "intersect", "interval", "into", "is",
    "isnull", "join", "json", "json_array", "json_arrayagg", "json_exists", "json_object",
    "json_objectagg", "json_query", "json_scalar", "json_serialize", "json_table",
    "json_value", "lateral", "leading", "least", "left", "like", "limit", "localtime",
    "localtimestamp", "merge_action", "national", "natural", "nchar", "none", "normalize",
    "not", "notnull", "null", "nullif", "numeric", "offset", "on", "only", "or", "order",
    "out", "outer", "overlaps", "overlay", "placing", "position", "precision", "primary",
    "real", "references", "returning", "right", "row", "select", "session_user", "setof",
    "similar", "smallint", "some", "substring", "symmetric", "system_user", "table",
    "tablesample", "then", "time", "timestamp", "to", "trailing", "treat", "trim", "true",
    "union", "unique", "user", "using", "values", "varchar", "variadic", "verbose", "when",
    "where", "window", "with", "xmlattributes", "xmlconcat", "xmlelement", "xmlexists",
    "xmlforest", "xmlnamespaces", "xmlparse", "xmlpi", "xmlroot", "xmlserialize",
    "xmltable",
];

fn is_reserved(ident: &str) -> bool {
    QUOTED_KEYWORDS.binary_search(&ident).is_ok()
}
