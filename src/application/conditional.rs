//! Conditional request helpers for feature handlers.
//!
//! Handlers answer `304 Not Modified` when any etag in `If-None-Match` names a
//! row version the cache still holds, and fill the cache whenever they serve
//! a feature so later requests can be answered without reading the row.

use tracing::debug;

use crate::cache::{CacheError, EtagCache};
use crate::domain::etag::WeakEtag;

/// Parsed `If-None-Match` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfNoneMatch {
    /// `*`: matches any current representation. The cache cannot answer it;
    /// handlers decide from the resource's existence.
    Any,
    /// Candidate strong etags, quotes preserved.
    Tags(Vec<String>),
}

impl IfNoneMatch {
    pub fn tags(&self) -> &[String] {
        match self {
            Self::Any => &[],
            Self::Tags(tags) => tags,
        }
    }
}

pub fn parse_if_none_match(header: &str) -> IfNoneMatch {
    let header = header.trim();
    if header == "*" {
        return IfNoneMatch::Any;
    }
    IfNoneMatch::Tags(
        header
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(|tag| tag.strip_prefix("W/").unwrap_or(tag).to_string())
            .collect(),
    )
}

/// Whether at least one candidate is a strong etag whose version is cached.
///
/// Stops at the first malformed candidate; callers answer that with 400.
pub async fn is_one_etag_in_cache(
    cache: &EtagCache,
    candidates: &[String],
) -> Result<bool, CacheError> {
    for candidate in candidates {
        if cache.contains_weak_etag(candidate).await? {
            debug!(
                target = "featuretag::application::conditional",
                etag = %candidate,
                "etag found in cache"
            );
            return Ok(true);
        }
    }
    Ok(false)
}

/// Record a served feature under both of its keys unless it is already cached.
///
/// Returns `true` when the etag was newly stored.
pub async fn remember_feature_etag(cache: &EtagCache, etag: &WeakEtag) -> Result<bool, CacheError> {
    if cache.get_weak_etag(&etag.cache_key()).await?.is_some() {
        return Ok(false);
    }
    let stored = cache.add_weak_etag(&etag.cache_key(), etag.clone()).await?;
    let aliased = cache
        .add_weak_etag(&etag.alternate_cache_key(), etag.clone())
        .await?;
    Ok(stored && aliased)
}
