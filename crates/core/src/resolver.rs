use crate::catalog::CatalogCache;
use crate::config::{env_parse, env_secs};
use crate::domain::catalog::{CardLookup, CatalogEntry};
use crate::domain::contract::normalize_records;
use crate::retry::{retry_with_backoff, Backoff};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Attempts per id in the sequential fallback after a batch lookup.
    pub per_id_attempts: u32,
    /// Ids beyond this many are left unresolved rather than fetched one by one.
    pub max_sequential_fallbacks: usize,
    pub lookup_timeout: Duration,
    pub retry_base_delay: Duration,
    /// How long an individually fetched card is served without asking the source again.
    pub detail_ttl: Duration,
    pub max_details: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            per_id_attempts: 2,
            max_sequential_fallbacks: 10,
            lookup_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_millis(250),
            detail_ttl: Duration::from_secs(60 * 60),
            max_details: 1_000,
        }
    }
}

impl ResolverOptions {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Some(v) = env_parse::<u32>("RESOLVER_PER_ID_ATTEMPTS").filter(|n| *n >= 1) {
            out.per_id_attempts = v;
        }
        if let Some(v) = env_parse::<usize>("RESOLVER_MAX_SEQUENTIAL_FALLBACKS") {
            out.max_sequential_fallbacks = v;
        }
        if let Some(v) = env_secs("RESOLVER_LOOKUP_TIMEOUT_SECS") {
            out.lookup_timeout = v;
        }
        if let Some(v) = env_secs("RESOLVER_DETAIL_TTL_SECS") {
            out.detail_ttl = v;
        }
        if let Some(v) = env_parse::<usize>("RESOLVER_MAX_DETAILS").filter(|n| *n >= 1) {
            out.max_details = v;
        }
        out
    }
}

struct Detail {
    card: Arc<CatalogEntry>,
    fetched_at: Instant,
}

/// On-demand full-record lookup backed by `CatalogCache`, with its own bounded cache of cards
/// fetched individually.
///
/// Cards restored from the persisted projection are not full records; they are only served when
/// the source cannot be reached.
pub struct DetailResolver {
    cache: CatalogCache,
    opts: ResolverOptions,
    details: RwLock<HashMap<String, Detail>>,
}

impl DetailResolver {
    pub fn new(cache: CatalogCache, opts: ResolverOptions) -> Self {
        Self {
            cache,
            opts,
            details: RwLock::new(HashMap::new()),
        }
    }

    /// Id index, then the full catalog, then a targeted remote fetch. Never fails: unresolvable
    /// ids come back as a placeholder.
    pub async fn resolve(&self, id: &str) -> CardLookup {
        if let Some(card) = self.local(id) {
            return CardLookup::Resolved { card };
        }

        match self.cache.get_all_cards().await {
            Ok(_) => {
                if let Some(card) = self.cache.lookup_complete(id) {
                    return CardLookup::Resolved { card };
                }
            }
            Err(err) => tracing::warn!(id, error = %err, "catalog unavailable during detail lookup"),
        }

        match self.fetch_ids(&[id.to_string()]).await {
            Ok(mut found) => {
                if let Some(card) = found.remove(id) {
                    return CardLookup::Resolved { card };
                }
                tracing::debug!(id, "card unknown to remote source");
            }
            Err(err) => tracing::warn!(id, error = %format!("{err:#}"), "targeted card fetch failed"),
        }

        match self.cache.lookup(id) {
            Some(card) => {
                tracing::debug!(id, "serving persisted projection of card");
                CardLookup::Resolved { card }
            }
            None => CardLookup::placeholder(id),
        }
    }

    /// Resolves many ids with one remote round trip. Ids the batch misses are retried one by one
    /// (bounded); anything still unknown maps to `None`.
    pub async fn resolve_many(&self, ids: &[String]) -> BTreeMap<String, Option<Arc<CatalogEntry>>> {
        let mut out: BTreeMap<String, Option<Arc<CatalogEntry>>> = BTreeMap::new();
        let mut pending: Vec<String> = Vec::new();
        for id in ids {
            if out.contains_key(id) || pending.contains(id) {
                continue;
            }
            match self.local(id) {
                Some(card) => {
                    out.insert(id.clone(), Some(card));
                }
                None => pending.push(id.clone()),
            }
        }

        if pending.is_empty() {
            return out;
        }

        match self.fetch_ids(&pending).await {
            Ok(mut found) => {
                pending.retain(|id| match found.remove(id) {
                    Some(card) => {
                        out.insert(id.clone(), Some(card));
                        false
                    }
                    None => true,
                });
            }
            Err(err) => {
                tracing::warn!(ids = pending.len(), error = %format!("{err:#}"), "batch card fetch failed; falling back to per-id lookups");
            }
        }

        let backoff = Backoff::new(self.opts.per_id_attempts, self.opts.retry_base_delay);
        for (idx, id) in pending.into_iter().enumerate() {
            if idx >= self.opts.max_sequential_fallbacks {
                tracing::warn!(id = %id, cap = self.opts.max_sequential_fallbacks, "sequential fallback cap reached; leaving unresolved");
                let projection = self.cache.lookup(&id);
                out.insert(id, projection);
                continue;
            }

            let single = [id.clone()];
            let wanted = &single;
            let res = retry_with_backoff("card detail", backoff, move |_| async move {
                let mut found = self.fetch_ids(wanted).await?;
                found
                    .remove(&wanted[0])
                    .ok_or_else(|| anyhow::anyhow!("card {} not returned by source", wanted[0]))
            })
            .await;

            match res {
                Ok(card) => {
                    out.insert(id, Some(card));
                }
                Err(_) => {
                    let projection = self.cache.lookup(&id);
                    out.insert(id, projection);
                }
            }
        }

        out
    }

    fn local(&self, id: &str) -> Option<Arc<CatalogEntry>> {
        if let Some(card) = self.cache.lookup_complete(id) {
            return Some(card);
        }
        self.read_details()
            .get(id)
            .filter(|d| d.fetched_at.elapsed() < self.opts.detail_ttl)
            .map(|d| Arc::clone(&d.card))
    }

    /// One `get_by_ids` call under the lookup timeout; results are remembered.
    async fn fetch_ids(&self, ids: &[String]) -> anyhow::Result<HashMap<String, Arc<CatalogEntry>>> {
        let raw = tokio::time::timeout(self.opts.lookup_timeout, self.cache.source().get_by_ids(ids))
            .await
            .map_err(|_| anyhow::anyhow!("card lookup timed out after {:?}", self.opts.lookup_timeout))??;

        let found: HashMap<String, Arc<CatalogEntry>> = normalize_records(raw)
            .into_iter()
            .map(|card| (card.id.clone(), Arc::new(card)))
            .collect();

        if !found.is_empty() {
            self.remember(&found);
        }
        Ok(found)
    }

    fn remember(&self, found: &HashMap<String, Arc<CatalogEntry>>) {
        let now = Instant::now();
        let mut details = self.write_details();
        details.retain(|_, d| d.fetched_at.elapsed() < self.opts.detail_ttl);
        for (id, card) in found {
            if details.len() >= self.opts.max_details && !details.contains_key(id) {
                let oldest = details
                    .iter()
                    .min_by_key(|(_, d)| d.fetched_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    details.remove(&oldest);
                }
            }
            details.insert(
                id.clone(),
                Detail {
                    card: Arc::clone(card),
                    fetched_at: now,
                },
            );
        }
    }

    #[cfg(test)]
    fn detail_count(&self) -> usize {
        self.read_details().len()
    }

    fn read_details(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Detail>> {
        self.details.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_details(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Detail>> {
        self.details.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
