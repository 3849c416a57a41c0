//! Change listener against a real PostgreSQL database.
//!
//! - Needs `DATABASE_URL` pointing at a server where the test user may create
//!   databases; `sqlx::test` provisions a fresh one per test.
//! - Marked `#[ignore]`; run with `cargo test --test listener_db -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use featuretag::cache::{BoundedStore, EtagCache};
use featuretag::catalog::{Catalog, PgCatalog, TableFilter};
use featuretag::listener::{ChangeListener, ListenerConfig, ListenerState, ddl, remove_leftovers};
use sqlx::PgPool;

const POLL_ATTEMPTS: usize = 100;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn test_config(temp_schema: &str) -> ListenerConfig {
    ListenerConfig {
        temp_schema: temp_schema.to_string(),
        wait_timeout: Duration::from_millis(200),
        chunk_size: 16,
    }
}

async fn create_roads(pool: &PgPool) {
    sqlx::raw_sql(
        "CREATE TABLE public.roads (id integer PRIMARY KEY, name text NOT NULL);
         CREATE TABLE public.audit_log (id bigint PRIMARY KEY, note text);",
    )
    .execute(pool)
    .await
    .expect("create tables");
}

async fn row_version(pool: &PgPool, id: i32) -> String {
    sqlx::query_scalar("SELECT xmin::text FROM public.roads WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("row version")
}

async fn schema_exists(pool: &PgPool, schema: &str) -> bool {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
        .bind(schema)
        .fetch_one(pool)
        .await
        .expect("schema lookup")
}

async fn trigger_count(pool: &PgPool) -> i64 {
    sqlx::query_scalar(
        "SELECT count(*) FROM pg_trigger WHERE NOT tgisinternal AND tgname LIKE '%_notify_event'",
    )
    .fetch_one(pool)
    .await
    .expect("trigger count")
}

async fn wait_for_key(cache: &EtagCache, key: &str) -> bool {
    for _ in 0..POLL_ATTEMPTS {
        if cache.get_weak_etag(key).await.expect("cache lookup").is_some() {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

async fn wait_for_size(cache: &EtagCache, size: usize) -> bool {
    for _ in 0..POLL_ATTEMPTS {
        if cache.size().await == size {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

#[sqlx::test(migrations = false)]
#[ignore]
async fn mutations_flow_into_cache(pool: PgPool) {
    create_roads(&pool).await;
    let catalog: Arc<dyn Catalog> = Arc::new(PgCatalog::load(pool.clone()).await.expect("catalog"));
    let cache = Arc::new(EtagCache::Bounded(BoundedStore::new(16)));

    let mut listener = ChangeListener::new(
        pool.clone(),
        Arc::clone(&cache),
        catalog,
        test_config("featuretag_cdc_flow"),
    );
    listener
        .initialize(&TableFilter::new(["public.roads"], Vec::<String>::new()))
        .await
        .expect("initialize");
    assert_eq!(listener.state(), ListenerState::Listening);
    assert_eq!(listener.installed_tables().len(), 1);
    assert_eq!(trigger_count(&pool).await, 1);

    // row JSON is longer than one 16-character page
    sqlx::query("INSERT INTO public.roads (id, name) VALUES (1, 'Long Meadow Road')")
        .execute(&pool)
        .await
        .expect("insert");
    let inserted = row_version(&pool, 1).await;
    let identity = format!("public.roads:1.000000:{inserted}");
    assert!(
        wait_for_key(&cache, &identity).await,
        "insert was not cached"
    );
    assert!(cache.get_weak_etag(&inserted).await.unwrap().is_some());

    sqlx::query("UPDATE public.roads SET name = 'Short Lane' WHERE id = 1")
        .execute(&pool)
        .await
        .expect("update");
    let updated = row_version(&pool, 1).await;
    assert!(
        wait_for_key(&cache, &updated).await,
        "update was not cached"
    );
    assert!(cache.get_weak_etag(&inserted).await.unwrap().is_none());
    assert_eq!(cache.size().await, 1);

    sqlx::query("DELETE FROM public.roads WHERE id = 1")
        .execute(&pool)
        .await
        .expect("delete");
    assert!(
        wait_for_size(&cache, 0).await,
        "delete did not invalidate"
    );

    // excluded tables carry no trigger and never reach the cache
    sqlx::query("INSERT INTO public.audit_log (id, note) VALUES (1, 'x')")
        .execute(&pool)
        .await
        .expect("insert audit");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cache.size().await, 0);

    listener.close().await;
    assert_eq!(listener.state(), ListenerState::Closed);
    assert!(!schema_exists(&pool, "featuretag_cdc_flow").await);
    assert_eq!(trigger_count(&pool).await, 0);
}

#[sqlx::test(migrations = false)]
#[ignore]
async fn rows_written_in_one_statement_are_all_invalidated(pool: PgPool) {
    create_roads(&pool).await;
    let catalog: Arc<dyn Catalog> = Arc::new(PgCatalog::load(pool.clone()).await.expect("catalog"));
    let cache = Arc::new(EtagCache::Bounded(BoundedStore::new(16)));

    let mut listener = ChangeListener::new(
        pool.clone(),
        Arc::clone(&cache),
        catalog,
        test_config("featuretag_cdc_batch"),
    );
    listener
        .initialize(&TableFilter::new(["public.roads"], Vec::<String>::new()))
        .await
        .expect("initialize");

    sqlx::query("INSERT INTO public.roads (id, name) VALUES (1, 'a'), (2, 'b')")
        .execute(&pool)
        .await
        .expect("insert");
    assert!(wait_for_size(&cache, 2).await, "both rows were not cached");
    let shared = row_version(&pool, 1).await;
    assert_eq!(row_version(&pool, 2).await, shared);

    sqlx::query("DELETE FROM public.roads")
        .execute(&pool)
        .await
        .expect("delete");
    assert!(
        wait_for_size(&cache, 0).await,
        "rows sharing a version stayed cached"
    );
    assert!(
        cache
            .get_weak_etag(&format!("public.roads:1.000000:{shared}"))
            .await
            .unwrap()
            .is_none()
    );

    listener.close().await;
}

#[sqlx::test(migrations = false)]
#[ignore]
async fn lost_notification_session_stops_the_task(pool: PgPool) {
    create_roads(&pool).await;
    let catalog: Arc<dyn Catalog> = Arc::new(PgCatalog::load(pool.clone()).await.expect("catalog"));
    let mut listener = ChangeListener::new(
        pool.clone(),
        Arc::new(EtagCache::Disabled),
        catalog,
        test_config("featuretag_cdc_lost"),
    );
    listener
        .initialize(&TableFilter::allow_all())
        .await
        .expect("initialize");

    let terminated: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM (
             SELECT pg_terminate_backend(pid) FROM pg_stat_activity
             WHERE datname = current_database()
               AND pid <> pg_backend_pid()
               AND query ILIKE 'LISTEN%'
         ) AS killed",
    )
    .fetch_one(&pool)
    .await
    .expect("terminate listener session");
    assert_eq!(terminated, 1);

    let stopped = tokio::time::timeout(Duration::from_secs(5), listener.run_until_stopped())
        .await
        .expect("task kept running after losing its session");
    assert!(stopped.is_err());

    listener.close().await;
    assert_eq!(listener.state(), ListenerState::Closed);
    assert_eq!(trigger_count(&pool).await, 0);
}

#[sqlx::test(migrations = false)]
#[ignore]
async fn initialize_twice_is_rejected(pool: PgPool) {
    create_roads(&pool).await;
    let catalog: Arc<dyn Catalog> = Arc::new(PgCatalog::load(pool.clone()).await.expect("catalog"));

    let mut listener = ChangeListener::new(
        pool.clone(),
        Arc::new(EtagCache::Disabled),
        catalog,
        test_config("featuretag_cdc_twice"),
    );
    listener
        .initialize(&TableFilter::allow_all())
        .await
        .expect("initialize");
    assert_eq!(listener.installed_tables().len(), 2);

    let err = listener
        .initialize(&TableFilter::allow_all())
        .await
        .expect_err("second initialize");
    assert!(err.to_string().contains("listening"));

    listener.close().await;
    listener.close().await;
    assert_eq!(listener.state(), ListenerState::Closed);
}

#[sqlx::test(migrations = false)]
#[ignore]
async fn leftovers_are_removed(pool: PgPool) {
    create_roads(&pool).await;
    let catalog = PgCatalog::load(pool.clone()).await.expect("catalog");
    let schema = "featuretag_cdc_crashed";

    // what a listener that never reached close leaves behind
    sqlx::raw_sql(&ddl::create_schema(schema))
        .execute(&pool)
        .await
        .expect("schema");
    sqlx::raw_sql(&ddl::create_notify_function(schema, 1000))
        .execute(&pool)
        .await
        .expect("function");
    for table in catalog.tables().await.expect("tables") {
        sqlx::raw_sql(&ddl::create_trigger(&table, schema))
            .execute(&pool)
            .await
            .expect("trigger");
    }
    assert_eq!(trigger_count(&pool).await, 2);

    let dropped = remove_leftovers(&pool, schema).await.expect("cleanup");
    assert_eq!(dropped, 2);
    assert_eq!(trigger_count(&pool).await, 0);
    assert!(!schema_exists(&pool, schema).await);

    let again = remove_leftovers(&pool, schema)
        .await
        .expect("cleanup is repeatable");
    assert_eq!(again, 0);
}
