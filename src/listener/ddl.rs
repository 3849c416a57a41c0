//! DDL for the notification schema, its trigger function and the per-table
//! triggers. Every statement is safe to run twice.

use crate::catalog::TableInfo;

use super::CHANNEL;

/// Name of the shared trigger function inside the temp schema.
pub const FUNCTION_NAME: &str = "notify_event";

/// Largest page, in characters of row JSON, that keeps a notification under
/// the 8000-byte `pg_notify` payload limit. A character takes up to four bytes
/// once escaped, and the envelope around the page needs about 700 more.
pub const MAX_CHUNK_SIZE: u32 = 1800;

/// The temp schema is configured by name and always double-quoted, so its
/// case is kept and keywords need no special handling.
fn quote_schema(schema: &str) -> String {
    format!("\"{}\"", schema.replace('"', "\"\""))
}

pub fn create_schema(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_schema(schema))
}

pub fn drop_schema(schema: &str) -> String {
    format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_schema(schema))
}

/// Trigger function publishing each changed row on the notification channel,
/// split into pages of at most `chunk_size` characters of row JSON. The page
/// size is clamped to `1..=MAX_CHUNK_SIZE`.
///
/// `OLD.xmin` is sent for updates and deletes, `NEW.xmin` for inserts and
/// updates. All pages of one row share an md5 that also mixes in the clock and
/// transaction id, so identical rows written twice stay distinct.
pub fn create_notify_function(schema: &str, chunk_size: u32) -> String {
    let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
    format!(
        r#"CREATE OR REPLACE FUNCTION {schema}.{FUNCTION_NAME}() RETURNS trigger
LANGUAGE plpgsql AS $featuretag$
DECLARE
    row_data   text;
    old_xmin   text;
    new_xmin   text;
    digest     text;
    chunk_size constant integer := {chunk_size};
    page_count integer;
    page_index integer := 1;
BEGIN
    IF TG_OP = 'DELETE' THEN
        row_data := row_to_json(OLD)::text;
    ELSE
        row_data := row_to_json(NEW)::text;
    END IF;

    IF TG_OP IN ('UPDATE', 'DELETE') THEN
        old_xmin := OLD.xmin::text;
    END IF;
    IF TG_OP IN ('INSERT', 'UPDATE') THEN
        new_xmin := NEW.xmin::text;
    END IF;

    digest := md5(row_data || clock_timestamp()::text || txid_current()::text);
    page_count := greatest(ceil(length(row_data)::numeric / chunk_size)::integer, 1);

    WHILE page_index <= page_count LOOP
        PERFORM pg_notify('{CHANNEL}', json_build_object(
            'id', quote_ident(TG_TABLE_SCHEMA) || '.' || quote_ident(TG_TABLE_NAME),
            'schema', TG_TABLE_SCHEMA,
            'table', TG_TABLE_NAME,
            'action', TG_OP,
            'old_xmin', old_xmin,
            'new_xmin', new_xmin,
            'md5', digest,
            'raw_data', page_count || ':' || page_index || ':'
                || substr(row_data, (page_index - 1) * chunk_size + 1, chunk_size)
        )::text);
        page_index := page_index + 1;
    END LOOP;

    RETURN NULL;
END;
$featuretag$"#,
        schema = quote_schema(schema),
    )
}

/// Quoted trigger name `"<schema>_<table>_notify_event"`.
pub fn trigger_name(table: &TableInfo) -> String {
    let name = format!("{}_{}_{FUNCTION_NAME}", table.schema, table.table);
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn drop_trigger(table: &TableInfo) -> String {
    drop_trigger_named(&table.id, &trigger_name(table))
}

/// `table_id` and `trigger` must already be quoted.
pub fn drop_trigger_named(table_id: &str, trigger: &str) -> String {
    format!("DROP TRIGGER IF EXISTS {trigger} ON {table_id}")
}

pub fn create_trigger(table: &TableInfo, schema: &str) -> String {
    format!(
        "CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE PROCEDURE {schema}.{FUNCTION_NAME}()",
        trigger = trigger_name(table),
        table = table.id,
        schema = quote_schema(schema),
    )
}

/// Triggers bound to the notify function of schema `$1`, with quoted table id
/// and quoted trigger name.
pub const INSTALLED_TRIGGERS_SQL: &str = r#"
SELECT
    quote_ident(n.nspname) || '.' || quote_ident(c.relname) AS table_id,
    quote_ident(t.tgname) AS trigger_name
FROM pg_catalog.pg_trigger t
JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_proc p ON p.oid = t.tgfoid
JOIN pg_catalog.pg_namespace pn ON pn.oid = p.pronamespace
WHERE NOT t.tgisinternal
  AND p.proname = 'notify_event'
  AND pn.nspname = $1
ORDER BY 1, 2
"#;
