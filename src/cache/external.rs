//! Redis-backed weak etag storage, shared between service instances.
//!
//! Layout under the configured prefix:
//!
//! | key                           | type   | holds                                |
//! |-------------------------------|--------|--------------------------------------|
//! | `<prefix>:key:<lookup>`       | set    | identities (`WeakEtag::cache_key`)   |
//! | `<prefix>:etag:<identity>`    | string | JSON encoded `WeakEtag`              |
//! | `<prefix>:aliases:<identity>` | set    | lookup keys pointing at the identity |
//! | `<prefix>:etags`              | set    | every stored identity                |
//!
//! A version-only lookup key holds every row written by one transaction.
//! Adds and removes run as Lua scripts so the alias bookkeeping never becomes
//! visible half-applied.

use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::domain::etag::WeakEtag;

use super::CacheError;
use super::config::RedisConfig;

const ADD_SCRIPT: &str = r"
local prefix = ARGV[1]
local lookup = ARGV[2]
local identity = ARGV[3]
redis.call('SADD', prefix .. ':key:' .. lookup, identity)
redis.call('SET', prefix .. ':etag:' .. identity, ARGV[4])
redis.call('SADD', prefix .. ':aliases:' .. identity, lookup)
redis.call('SADD', prefix .. ':etags', identity)
return 1
";

const REMOVE_SCRIPT: &str = r"
local prefix = ARGV[1]
local lookup = prefix .. ':key:' .. ARGV[2]
local identities = redis.call('SMEMBERS', lookup)
if #identities == 0 then
  return 0
end
for _, identity in ipairs(identities) do
  local aliases = redis.call('SMEMBERS', prefix .. ':aliases:' .. identity)
  for _, alias in ipairs(aliases) do
    redis.call('SREM', prefix .. ':key:' .. alias, identity)
  end
  redis.call('DEL', prefix .. ':aliases:' .. identity, prefix .. ':etag:' .. identity)
  redis.call('SREM', prefix .. ':etags', identity)
end
redis.call('DEL', lookup)
return 1
";

pub struct ExternalStore {
    pool: Pool,
    keys: KeySpace,
    add_script: Script,
    remove_script: Script,
}

impl ExternalStore {
    /// Build the pool and check the server answers before returning.
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let url = url_with_password(&config.url, config.password.as_deref());
        let mut redis_config = Config::from_url(url);
        let mut pool_config = redis_config.get_pool_config();
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(config.timeout);
        pool_config.timeouts.create = Some(config.timeout);
        pool_config.timeouts.recycle = Some(config.timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| CacheError::unavailable(format!("invalid redis configuration: {err}")))?;

        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(
            target = "featuretag::cache::external",
            pool_size = config.pool_size,
            key_prefix = %config.key_prefix,
            "Connected to redis etag store"
        );

        Ok(Self {
            pool,
            keys: KeySpace::new(&config.key_prefix),
            add_script: Script::new(ADD_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        })
    }

    pub async fn add(&self, key: &str, value: &WeakEtag) -> Result<bool, CacheError> {
        let encoded = serde_json::to_string(value)?;
        let mut conn = self.pool.get().await?;
        let _: i64 = self
            .add_script
            .arg(self.keys.prefix())
            .arg(key)
            .arg(value.cache_key())
            .arg(encoded)
            .invoke_async(&mut conn)
            .await?;
        debug!(target = "featuretag::cache::external", key, "stored weak etag");
        Ok(true)
    }

    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = self
            .remove_script
            .arg(self.keys.prefix())
            .arg(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    pub async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.pool.get().await?;
        let exists: bool = conn.exists(self.keys.lookup(key)).await?;
        Ok(exists)
    }

    /// One of the values reachable through `key`.
    pub async fn get(&self, key: &str) -> Result<Option<WeakEtag>, CacheError> {
        let mut conn = self.pool.get().await?;
        let identity: Option<String> = conn.srandmember(self.keys.lookup(key)).await?;
        let Some(identity) = identity else {
            return Ok(None);
        };
        let encoded: Option<String> = conn.get(self.keys.value(&identity)).await?;
        encoded
            .map(|json| serde_json::from_str(&json).map_err(CacheError::from))
            .transpose()
    }

    pub async fn len(&self) -> Result<usize, CacheError> {
        let mut conn = self.pool.get().await?;
        let size: usize = conn.scard(self.keys.index()).await?;
        Ok(size)
    }
}

/// Key naming under one prefix.
#[derive(Debug, Clone)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn lookup(&self, key: &str) -> String {
        format!("{}:key:{key}", self.prefix)
    }

    fn value(&self, identity: &str) -> String {
        format!("{}:etag:{identity}", self.prefix)
    }

    fn index(&self) -> String {
        format!("{}:etags", self.prefix)
    }
}

/// Insert `password` as the URL credential unless the URL already carries one.
fn url_with_password(url: &str, password: Option<&str>) -> String {
    let Some(password) = password.filter(|p| !p.is_empty()) else {
        return url.to_string();
    };
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    if rest[..authority_end].contains('@') {
        return url.to_string();
    }
    format!("{scheme}://:{password}@{rest}")
}
