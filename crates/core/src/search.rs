//! Fuzzy card search over a disposable projection of the catalog.
//!
//! The index is rebuilt from `CatalogCache` whenever the cache holds a newer snapshot. A copy is
//! persisted for warm starts only and expires after `persisted_ttl`.

use crate::catalog::{CatalogCache, CatalogSnapshot};
use crate::config::{env_parse, env_secs};
use crate::domain::catalog::CatalogEntry;
use crate::storage::KeyValueStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

pub const INDEX_KEY: &str = "card_search_index:v1";

const EXACT_NAME: f64 = 100.0;
const EXACT_ISSUER: f64 = 90.0;
const NAME_PREFIX: f64 = 80.0;
const ISSUER_PREFIX: f64 = 70.0;
const NAME_CONTAINS: f64 = 60.0;
const ISSUER_CONTAINS: f64 = 50.0;
const NAME_FUZZY: f64 = 40.0;
const ISSUER_FUZZY: f64 = 30.0;
const MAX_FUZZY_DISTANCE: f64 = 3.0;
const FUZZY_DISTANCE_RATIO: f64 = 0.4;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub min_query_len: usize,
    pub max_results: usize,
    pub persisted_ttl: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            min_query_len: 3,
            max_results: 10,
            persisted_ttl: Duration::from_secs(20 * 60),
        }
    }
}

impl SearchOptions {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Some(v) = env_parse::<usize>("SEARCH_MIN_QUERY_LEN") {
            out.min_query_len = v;
        }
        if let Some(v) = env_parse::<usize>("SEARCH_MAX_RESULTS").filter(|n| *n >= 1) {
            out.max_results = v;
        }
        if let Some(v) = env_secs("SEARCH_INDEX_TTL_SECS") {
            out.persisted_ttl = v;
        }
        out
    }
}

/// What search returns: enough to render a result row. Full detail is a separate lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIndexEntry {
    pub key: String,
    pub name: String,
    pub issuer: String,
}

impl From<&CatalogEntry> for SearchIndexEntry {
    fn from(card: &CatalogEntry) -> Self {
        Self {
            key: card.id.clone(),
            name: card.name.clone(),
            issuer: card.issuer.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub entry: SearchIndexEntry,
    pub score: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex {
    timestamp_ms: i64,
    entries: Vec<SearchIndexEntry>,
}

struct IndexedEntry {
    entry: SearchIndexEntry,
    name: String,
    issuer: String,
    name_tokens: Vec<String>,
    issuer_tokens: Vec<String>,
}

impl IndexedEntry {
    fn new(entry: SearchIndexEntry) -> Self {
        let name = normalize(&entry.name);
        let issuer = normalize(&entry.issuer);
        Self {
            name_tokens: tokens(&name),
            issuer_tokens: tokens(&issuer),
            name,
            issuer,
            entry,
        }
    }
}

struct IndexState {
    entries: Vec<IndexedEntry>,
    built_at: Instant,
    /// Snapshot the index was built from; `None` for a warm-started index.
    snapshot: Option<CatalogSnapshot>,
}

pub struct SearchIndex {
    store: Arc<dyn KeyValueStore>,
    opts: SearchOptions,
    state: RwLock<Option<IndexState>>,
}

impl SearchIndex {
    pub fn new(store: Arc<dyn KeyValueStore>, opts: SearchOptions) -> Self {
        Self {
            store,
            opts,
            state: RwLock::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.read_state().as_ref().map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes sure the index reflects the cache. Never fails: if nothing can be loaded the index
    /// keeps whatever it had.
    pub async fn ensure_ready(&self, cache: &CatalogCache) {
        if let Some(snapshot) = cache.fresh_cards() {
            self.adopt(snapshot).await;
            return;
        }

        // Cold cache: a recent or persisted index is enough until it ages out.
        if cache.cached_cards().is_none() && (self.has_recent_state() || self.warm_start().await) {
            return;
        }

        match cache.get_all_cards().await {
            Ok(snapshot) => self.adopt(snapshot).await,
            Err(err) => {
                tracing::warn!(error = %err, entries = self.len(), "search index refresh skipped; catalog unavailable");
            }
        }
    }

    async fn adopt(&self, snapshot: CatalogSnapshot) {
        if !self.built_from(&snapshot) {
            self.rebuild(snapshot);
            self.persist().await;
        }
    }

    pub fn rebuild(&self, snapshot: CatalogSnapshot) -> usize {
        let entries: Vec<IndexedEntry> = snapshot
            .iter()
            .map(|card| IndexedEntry::new(SearchIndexEntry::from(card.as_ref())))
            .collect();
        let count = entries.len();
        *self.write_state() = Some(IndexState {
            entries,
            built_at: Instant::now(),
            snapshot: Some(snapshot),
        });
        tracing::debug!(entries = count, "search index rebuilt");
        count
    }

    /// Loads the persisted index if it is younger than `persisted_ttl`.
    pub async fn warm_start(&self) -> bool {
        let raw = match self.store.get(INDEX_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "search index read failed");
                return false;
            }
        };

        let persisted: PersistedIndex = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(error = %err, "persisted search index undecodable; discarding");
                self.discard_persisted().await;
                return false;
            }
        };

        let age_ms = Utc::now().timestamp_millis().saturating_sub(persisted.timestamp_ms);
        if age_ms < 0 || age_ms as u128 >= self.opts.persisted_ttl.as_millis() {
            tracing::debug!(age_ms, "persisted search index expired");
            self.discard_persisted().await;
            return false;
        }

        let entries: Vec<IndexedEntry> = persisted.entries.into_iter().map(IndexedEntry::new).collect();
        tracing::debug!(entries = entries.len(), age_ms, "search index warm-started");
        *self.write_state() = Some(IndexState {
            entries,
            built_at: Instant::now(),
            snapshot: None,
        });
        true
    }

    /// Best-effort write of the current index for the next warm start.
    pub async fn persist(&self) {
        let entries: Vec<SearchIndexEntry> = match self.read_state().as_ref() {
            Some(state) => state.entries.iter().map(|e| e.entry.clone()).collect(),
            None => return,
        };
        let body = PersistedIndex {
            timestamp_ms: Utc::now().timestamp_millis(),
            entries,
        };
        let raw = match serde_json::to_string(&body) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize search index");
                return;
            }
        };
        if let Err(err) = self.store.set(INDEX_KEY, raw).await {
            tracing::warn!(error = %err, "search index not persisted");
        }
    }

    pub fn search(&self, query: &str) -> Vec<SearchIndexEntry> {
        self.search_with_min_len(query, self.opts.min_query_len)
    }

    pub fn search_with_min_len(&self, query: &str, min_len: usize) -> Vec<SearchIndexEntry> {
        self.search_scored(query, min_len)
            .into_iter()
            .map(|hit| hit.entry)
            .collect()
    }

    /// Ranked hits with their scores, best first, at most `max_results`.
    pub fn search_scored(&self, query: &str, min_len: usize) -> Vec<SearchHit> {
        let query = normalize(query);
        if query.chars().count() < min_len.max(1) {
            return Vec::new();
        }

        let guard = self.read_state();
        let Some(state) = guard.as_ref() else {
            return Vec::new();
        };

        let mut hits: Vec<SearchHit> = state
            .entries
            .iter()
            .filter_map(|candidate| {
                let score = score_candidate(&query, candidate);
                (score > 0.0).then(|| SearchHit {
                    entry: candidate.entry.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.name.cmp(&b.entry.name))
                .then_with(|| a.entry.key.cmp(&b.entry.key))
        });
        hits.truncate(self.opts.max_results);
        hits
    }

    fn built_from(&self, snapshot: &CatalogSnapshot) -> bool {
        self.read_state()
            .as_ref()
            .and_then(|s| s.snapshot.as_ref())
            .is_some_and(|built| Arc::ptr_eq(built, snapshot))
    }

    fn has_recent_state(&self) -> bool {
        self.read_state()
            .as_ref()
            .is_some_and(|s| s.built_at.elapsed() < self.opts.persisted_ttl)
    }

    async fn discard_persisted(&self) {
        if let Err(err) = self.store.remove(INDEX_KEY).await {
            tracing::warn!(error = %err, "failed to remove persisted search index");
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, Option<IndexState>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, Option<IndexState>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn score_candidate(query: &str, candidate: &IndexedEntry) -> f64 {
    if candidate.name == query {
        return EXACT_NAME;
    }
    if !candidate.issuer.is_empty() && candidate.issuer == query {
        return EXACT_ISSUER;
    }
    if candidate.name.starts_with(query) {
        return NAME_PREFIX;
    }
    if !candidate.issuer.is_empty() && candidate.issuer.starts_with(query) {
        return ISSUER_PREFIX;
    }
    if candidate.name.contains(query) {
        return NAME_CONTAINS;
    }
    if !candidate.issuer.is_empty() && candidate.issuer.contains(query) {
        return ISSUER_CONTAINS;
    }

    let query_len = query.chars().count() as f64;
    let threshold = (FUZZY_DISTANCE_RATIO * query_len).min(MAX_FUZZY_DISTANCE);
    let fuzzy = |field: &str, field_tokens: &[String], weight: f64| -> f64 {
        let best = std::iter::once(field)
            .chain(field_tokens.iter().map(String::as_str))
            .filter(|s| !s.is_empty())
            .map(|s| levenshtein(query, s))
            .min();
        match best {
            Some(distance) if distance as f64 <= threshold => {
                weight * (1.0 - distance as f64 / query_len)
            }
            _ => 0.0,
        }
    };

    let name_score = fuzzy(&candidate.name, &candidate.name_tokens, NAME_FUZZY);
    let issuer_score = fuzzy(&candidate.issuer, &candidate.issuer_tokens, ISSUER_FUZZY);
    name_score.max(issuer_score)
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Character-level edit distance (insert, delete, substitute).
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{sample_records, FakeSource};
    use crate::catalog::CacheOptions;
    use crate::domain::contract::normalize_records;
    use crate::storage::memory::MemoryKeyValueStore;
    use serde_json::json;

    fn snapshot(records: Vec<serde_json::Value>) -> CatalogSnapshot {
        Arc::new(normalize_records(records).into_iter().map(Arc::new).collect())
    }

    fn index() -> SearchIndex {
        SearchIndex::new(Arc::new(MemoryKeyValueStore::new()), SearchOptions::default())
    }

    fn chase_and_amex() -> CatalogSnapshot {
        snapshot(vec![
            json!({"id": "amex-gold", "name": "Amex Gold", "issuer": "American Express"}),
            json!({"id": "csp", "name": "Chase Sapphire Preferred", "issuer": "JPMorgan Chase"}),
        ])
    }

    #[test]
    fn levenshtein_counts_edits() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("sapphier", "sapphire"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn name_prefix_outranks_issuer_substring() {
        let idx = index();
        idx.rebuild(chase_and_amex());
        let hits = idx.search_scored("chase", 3);
        assert_eq!(hits[0].entry.key, "csp");
        assert_eq!(hits[0].score, NAME_PREFIX);
        assert!(hits.iter().all(|h| h.entry.key != "amex-gold"));
    }

    #[test]
    fn tier_scores_follow_match_kind() {
        let idx = index();
        idx.rebuild(chase_and_amex());
        assert_eq!(idx.search_scored("amex gold", 3)[0].score, EXACT_NAME);
        assert_eq!(idx.search_scored("american express", 3)[0].score, EXACT_ISSUER);
        assert_eq!(idx.search_scored("american", 3)[0].score, ISSUER_PREFIX);
        assert_eq!(idx.search_scored("sapphire", 3)[0].score, NAME_CONTAINS);
        assert_eq!(idx.search_scored("morgan", 3)[0].score, ISSUER_CONTAINS);
    }

    #[test]
    fn typo_is_found_through_fuzzy_path() {
        let idx = index();
        idx.rebuild(chase_and_amex());
        let hits = idx.search_scored("sapphier", 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.name, "Chase Sapphire Preferred");
        assert!((hits[0].score - 30.0).abs() < 1e-9);
    }

    #[test]
    fn short_queries_and_distant_strings_return_nothing() {
        let idx = index();
        idx.rebuild(chase_and_amex());
        assert!(idx.search("ch").is_empty());
        assert!(idx.search("zzzzzzzz").is_empty());
        assert_eq!(idx.search_with_min_len("ch", 2).len(), 1);
    }

    #[test]
    fn results_are_capped_at_ten() {
        let records = (0..15)
            .map(|i| json!({"id": format!("card-{i:02}"), "name": format!("Cash Card {i:02}"), "issuer": "Bank"}))
            .collect();
        let idx = index();
        idx.rebuild(snapshot(records));
        let hits = idx.search("cash");
        assert_eq!(hits.len(), 10);
        assert_eq!(hits[0].key, "card-00");
    }

    #[tokio::test]
    async fn ensure_ready_builds_from_cache_and_persists_for_warm_start() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let cache = CatalogCache::new(
            Arc::new(FakeSource::new(sample_records())),
            store.clone(),
            CacheOptions::default(),
        );
        let idx = SearchIndex::new(store.clone(), SearchOptions::default());
        idx.ensure_ready(&cache).await;
        assert_eq!(idx.len(), 3);
        assert!(store.get(INDEX_KEY).await.unwrap().is_some());

        // A fresh process warm-starts without touching the catalog.
        let source = Arc::new(FakeSource::new(sample_records()));
        let cold_cache = CatalogCache::new(source.clone(), Arc::new(MemoryKeyValueStore::new()), CacheOptions::default());
        let warm = SearchIndex::new(store.clone(), SearchOptions::default());
        warm.ensure_ready(&cold_cache).await;
        assert_eq!(warm.len(), 3);
        assert_eq!(source.all_calls(), 0);
        assert_eq!(warm.search("amex")[0].key, "amex-gold");
    }

    #[tokio::test]
    async fn stale_cache_is_reloaded_before_searching() {
        let source = Arc::new(FakeSource::new(sample_records()));
        let cache = CatalogCache::new(
            source.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            CacheOptions {
                memory_ttl: Duration::ZERO,
                persisted_max_age: Duration::ZERO,
                ..CacheOptions::default()
            },
        );
        let idx = SearchIndex::new(Arc::new(MemoryKeyValueStore::new()), SearchOptions::default());

        for _ in 0..3 {
            idx.ensure_ready(&cache).await;
            assert_eq!(idx.search("amex")[0].key, "amex-gold");
        }
        assert_eq!(source.all_calls(), 3);
    }

    #[tokio::test]
    async fn expired_persisted_index_is_ignored() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let body = PersistedIndex {
            timestamp_ms: Utc::now().timestamp_millis() - 21 * 60 * 1000,
            entries: vec![SearchIndexEntry {
                key: "old".to_string(),
                name: "Old Card".to_string(),
                issuer: "Bank".to_string(),
            }],
        };
        store
            .set(INDEX_KEY, serde_json::to_string(&body).unwrap())
            .await
            .unwrap();

        let idx = SearchIndex::new(store.clone(), SearchOptions::default());
        assert!(!idx.warm_start().await);
        assert!(store.get(INDEX_KEY).await.unwrap().is_none());
    }
}
