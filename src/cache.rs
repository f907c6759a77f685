use crate::github::RateLimitInfo;
use crate::querier::MetricsQuerier;
use moka::future::Cache;
use std::time::Duration;

/// Read-through cache for the API rate limit.
///
/// Lead-time metrics are never cached; only this cheap status read is.
#[derive(Clone)]
pub struct RateLimitCache {
    cache: Cache<(), RateLimitInfo>,
}

impl RateLimitCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(1).time_to_live(ttl).build();
        Self { cache }
    }

    pub async fn get(&self, querier: &MetricsQuerier) -> anyhow::Result<RateLimitInfo> {
        if let Some(info) = self.cache.get(&()).await {
            return Ok(info);
        }

        let info = querier.get_rate_limit().await?;
        tracing::debug!(remaining = info.remaining, limit = info.limit, "Fetched rate limit");
        self.cache.insert((), info.clone()).await;

        Ok(info)
    }
}
