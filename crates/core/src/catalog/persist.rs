//! Chunked persistence of the catalog in a versioned envelope.
//!
//! Layout: `card_catalog:chunk:{i}` holds a JSON array of at most `chunk_size` projected
//! cards; `card_catalog:meta` holds the envelope header and is written last, so a reader never
//! sees a header for chunks that were not fully written. The header checksum is SHA-256 over
//! the stored chunk bodies in order.

use crate::domain::catalog::{BonusType, CardType, Category, CatalogEntry, CreditTier, SignupBonus};
use crate::storage::{KeyValueStore, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const FORMAT_VERSION: u32 = 2;
pub const META_KEY: &str = "card_catalog:meta";
const CHUNK_KEY_PREFIX: &str = "card_catalog:chunk:";
// Upper bound when sweeping orphaned chunks without a readable header.
const MAX_ORPHAN_SWEEP: usize = 10_000;
/// Consecutive absent chunk keys after which the orphan sweep stops.
const ORPHAN_GAP_TOLERANCE: usize = 8;

pub fn chunk_key(index: usize) -> String {
    format!("{CHUNK_KEY_PREFIX}{index}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub format_version: u32,
    pub timestamp_ms: i64,
    pub chunk_size: usize,
    pub total_chunks: usize,
    pub total_count: usize,
    pub checksum: String,
}

/// Reduced card record written to storage: no description, capped lists, no bonus text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCard {
    pub id: String,
    pub name: String,
    pub issuer: String,
    pub reward_rates: BTreeMap<Category, f64>,
    pub annual_fee: f64,
    pub credit_score_required: CreditTier,
    pub perks: Vec<String>,
    pub foreign_transaction_fee: bool,
    pub categories: Vec<String>,
    pub card_type: CardType,
    pub signup_bonus: Option<PersistedBonus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedBonus {
    pub amount: f64,
    pub bonus_type: BonusType,
    pub spend_required: f64,
    pub timeframe: u32,
}

impl PersistedCard {
    pub fn project(entry: &CatalogEntry, list_cap: usize) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            issuer: entry.issuer.clone(),
            reward_rates: entry.reward_rates.clone(),
            annual_fee: entry.annual_fee,
            credit_score_required: entry.credit_score_required,
            perks: entry.perks.iter().take(list_cap).cloned().collect(),
            foreign_transaction_fee: entry.foreign_transaction_fee,
            categories: entry.categories.iter().take(list_cap).cloned().collect(),
            card_type: entry.card_type,
            signup_bonus: entry.signup_bonus.as_ref().map(|b| PersistedBonus {
                amount: b.amount,
                bonus_type: b.bonus_type,
                spend_required: b.spend_required,
                timeframe: b.timeframe,
            }),
        }
    }

    pub fn into_entry(self) -> CatalogEntry {
        CatalogEntry {
            id: self.id,
            name: self.name,
            issuer: self.issuer,
            reward_rates: crate::domain::catalog::fill_reward_rates(self.reward_rates),
            annual_fee: self.annual_fee,
            credit_score_required: self.credit_score_required,
            perks: self.perks,
            foreign_transaction_fee: self.foreign_transaction_fee,
            categories: self.categories,
            description: String::new(),
            card_type: self.card_type,
            signup_bonus: self.signup_bonus.map(|b| SignupBonus {
                amount: b.amount,
                bonus_type: b.bonus_type,
                spend_required: b.spend_required,
                timeframe: b.timeframe,
                description: String::new(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded {
        entries: Vec<CatalogEntry>,
        saved_at: DateTime<Utc>,
    },
    Missing,
    /// Envelope was present but rejected; it has been cleared from the store.
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Written { chunks: usize, chunk_size: usize },
    /// Nothing persisted this cycle; the catalog stays memory-only.
    Skipped(String),
}

#[derive(Clone)]
pub struct ChunkedCatalogStore {
    store: Arc<dyn KeyValueStore>,
    max_age: Duration,
    list_cap: usize,
}

impl ChunkedCatalogStore {
    pub fn new(store: Arc<dyn KeyValueStore>, max_age: Duration, list_cap: usize) -> Self {
        Self {
            store,
            max_age,
            list_cap,
        }
    }

    pub async fn load(&self, now: DateTime<Utc>) -> LoadOutcome {
        match self.try_load(now).await {
            Ok(Some((entries, saved_at))) => LoadOutcome::Loaded { entries, saved_at },
            Ok(None) => LoadOutcome::Missing,
            Err(reason) => {
                tracing::warn!(%reason, "persisted catalog rejected; clearing");
                if let Err(err) = self.clear().await {
                    tracing::warn!(error = %err, "failed to clear rejected catalog envelope");
                }
                LoadOutcome::Invalid(reason)
            }
        }
    }

    async fn try_load(&self, now: DateTime<Utc>) -> Result<Option<(Vec<CatalogEntry>, DateTime<Utc>)>, String> {
        let meta_raw = match self.store.get(META_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(err) => return Err(format!("metadata read failed: {err}")),
        };

        let meta: EnvelopeMeta =
            serde_json::from_str(&meta_raw).map_err(|e| format!("metadata undecodable: {e}"))?;

        if meta.format_version != FORMAT_VERSION {
            return Err(format!(
                "format version {} (expected {FORMAT_VERSION})",
                meta.format_version
            ));
        }

        let age_ms = now.timestamp_millis().saturating_sub(meta.timestamp_ms);
        if age_ms < 0 || age_ms as u128 >= self.max_age.as_millis() {
            return Err(format!("envelope stale (age_ms={age_ms})"));
        }

        if meta.total_chunks > MAX_ORPHAN_SWEEP {
            return Err(format!("implausible chunk count {}", meta.total_chunks));
        }
        if meta.total_count > meta.total_chunks.saturating_mul(meta.chunk_size) {
            return Err(format!(
                "header count {} exceeds {} chunks of {}",
                meta.total_count, meta.total_chunks, meta.chunk_size
            ));
        }

        let mut hasher = Sha256::new();
        let mut entries = Vec::new();
        for index in 0..meta.total_chunks {
            let body = match self.store.get(&chunk_key(index)).await {
                Ok(Some(body)) => body,
                Ok(None) => return Err(format!("chunk {index} missing")),
                Err(err) => return Err(format!("chunk {index} read failed: {err}")),
            };
            hasher.update(body.as_bytes());
            let cards: Vec<PersistedCard> = serde_json::from_str(&body)
                .map_err(|e| format!("chunk {index} undecodable: {e}"))?;
            entries.extend(cards.into_iter().map(PersistedCard::into_entry));
        }

        let checksum = hex::encode(hasher.finalize());
        if checksum != meta.checksum {
            return Err("checksum mismatch".to_string());
        }
        if entries.len() != meta.total_count {
            return Err(format!(
                "count mismatch: header says {}, chunks hold {}",
                meta.total_count,
                entries.len()
            ));
        }

        let saved_at = DateTime::<Utc>::from_timestamp_millis(meta.timestamp_ms).unwrap_or(now);
        Ok(Some((entries, saved_at)))
    }

    /// Writes `entries`, halving the chunk size once if the first attempt fails. Partial state is
    /// cleared after every failure.
    pub async fn save(&self, entries: &[Arc<CatalogEntry>], chunk_size: usize, now: DateTime<Utc>) -> PersistOutcome {
        if entries.is_empty() {
            return PersistOutcome::Skipped("empty catalog".to_string());
        }

        let projected: Vec<PersistedCard> = entries
            .iter()
            .map(|e| PersistedCard::project(e, self.list_cap))
            .collect();

        if let Err(err) = self.clear().await {
            tracing::warn!(error = %err, "failed to clear previous catalog envelope before write");
        }

        let first = chunk_size.max(1);
        let mut last_err = match self.write(&projected, first, now).await {
            Ok(chunks) => {
                return PersistOutcome::Written {
                    chunks,
                    chunk_size: first,
                }
            }
            Err(err) => err,
        };

        let smaller = (first / 2).max(1);
        if smaller < first {
            tracing::warn!(error = %last_err, from = first, to = smaller, "catalog write failed; retrying with smaller chunks");
            self.clear_quietly().await;
            match self.write(&projected, smaller, now).await {
                Ok(chunks) => {
                    return PersistOutcome::Written {
                        chunks,
                        chunk_size: smaller,
                    }
                }
                Err(err) => last_err = err,
            }
        }

        self.clear_quietly().await;
        tracing::warn!(error = %last_err, "skipping catalog persistence; continuing in memory");
        PersistOutcome::Skipped(last_err.to_string())
    }

    async fn write(&self, cards: &[PersistedCard], chunk_size: usize, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut hasher = Sha256::new();
        let mut total_chunks = 0usize;
        for (index, chunk) in cards.chunks(chunk_size).enumerate() {
            let body = serde_json::to_string(chunk)
                .map_err(|e| StorageError::Backend(format!("serialize chunk {index} failed: {e}")))?;
            hasher.update(body.as_bytes());
            self.store.set(&chunk_key(index), body).await?;
            total_chunks += 1;
        }

        let meta = EnvelopeMeta {
            format_version: FORMAT_VERSION,
            timestamp_ms: now.timestamp_millis(),
            chunk_size,
            total_chunks,
            total_count: cards.len(),
            checksum: hex::encode(hasher.finalize()),
        };
        let meta_raw = serde_json::to_string(&meta)
            .map_err(|e| StorageError::Backend(format!("serialize metadata failed: {e}")))?;
        self.store.set(META_KEY, meta_raw).await?;

        tracing::debug!(total_chunks, chunk_size, total_count = cards.len(), "catalog envelope written");
        Ok(total_chunks)
    }

    /// Removes the header and every chunk, including orphans left without a header.
    ///
    /// Chunks the header knows about are removed unconditionally. Past that, the sweep continues
    /// over gaps and stops after `ORPHAN_GAP_TOLERANCE` consecutive absent keys.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let known = match self.store.get(META_KEY).await? {
            Some(raw) => serde_json::from_str::<EnvelopeMeta>(&raw)
                .map(|m| m.total_chunks.min(MAX_ORPHAN_SWEEP))
                .unwrap_or(0),
            None => 0,
        };
        self.store.remove(META_KEY).await?;

        for index in 0..known {
            self.store.remove(&chunk_key(index)).await?;
        }

        let mut misses = 0;
        for index in known..MAX_ORPHAN_SWEEP {
            let key = chunk_key(index);
            if self.store.get(&key).await?.is_none() {
                misses += 1;
                if misses >= ORPHAN_GAP_TOLERANCE {
                    break;
                }
                continue;
            }
            misses = 0;
            self.store.remove(&key).await?;
        }
        Ok(())
    }

    async fn clear_quietly(&self) {
        if let Err(err) = self.clear().await {
            tracing::warn!(error = %err, "failed to clear partial catalog envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryKeyValueStore;
    use chrono::TimeZone;

    fn entries(n: usize) -> Vec<Arc<CatalogEntry>> {
        (0..n)
            .map(|i| {
                Arc::new(CatalogEntry {
                    id: format!("card-{i:03}"),
                    name: format!("Card {i}"),
                    issuer: "Bank".to_string(),
                    reward_rates: crate::domain::catalog::fill_reward_rates(BTreeMap::new()),
                    annual_fee: 0.0,
                    credit_score_required: CreditTier::Good,
                    perks: (0..8).map(|p| format!("perk {p}")).collect(),
                    foreign_transaction_fee: false,
                    categories: vec!["cashback".to_string()],
                    description: "a long marketing description".repeat(4),
                    card_type: CardType::Personal,
                    signup_bonus: None,
                })
            })
            .collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn chunked(store: Arc<MemoryKeyValueStore>) -> ChunkedCatalogStore {
        ChunkedCatalogStore::new(store, Duration::from_secs(24 * 3600), 5)
    }

    #[tokio::test]
    async fn round_trip_returns_essential_projection() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let chunked = chunked(store.clone());
        let cards = entries(60);

        let outcome = chunked.save(&cards, 25, now()).await;
        assert_eq!(outcome, PersistOutcome::Written { chunks: 3, chunk_size: 25 });

        let LoadOutcome::Loaded { entries: loaded, .. } = chunked.load(now()).await else {
            panic!("expected loaded envelope");
        };
        assert_eq!(loaded.len(), 60);
        assert_eq!(loaded[59].id, "card-059");
        assert_eq!(loaded[0].perks.len(), 5);
        assert!(loaded[0].description.is_empty());
    }

    #[tokio::test]
    async fn missing_chunk_invalidates_and_clears() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let chunked = chunked(store.clone());
        chunked.save(&entries(60), 25, now()).await;

        store.remove(&chunk_key(1)).await.unwrap();
        assert!(matches!(chunked.load(now()).await, LoadOutcome::Invalid(_)));
        assert!(store.keys().is_empty());
        assert_eq!(chunked.load(now()).await, LoadOutcome::Missing);
    }

    #[tokio::test]
    async fn clear_sweeps_orphans_past_gaps_without_a_header() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let chunked = chunked(store.clone());
        chunked.save(&entries(100), 10, now()).await;

        store.remove(META_KEY).await.unwrap();
        store.remove(&chunk_key(0)).await.unwrap();
        store.remove(&chunk_key(3)).await.unwrap();
        store.remove(&chunk_key(4)).await.unwrap();

        chunked.clear().await.unwrap();
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn forged_header_count_is_rejected_without_reading_chunks() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let chunked = chunked(store.clone());
        let forged = EnvelopeMeta {
            format_version: FORMAT_VERSION,
            timestamp_ms: now().timestamp_millis(),
            chunk_size: 25,
            total_chunks: 0,
            total_count: 1 << 62,
            checksum: "x".to_string(),
        };
        store
            .set(META_KEY, serde_json::to_string(&forged).unwrap())
            .await
            .unwrap();

        match chunked.load(now()).await {
            LoadOutcome::Invalid(reason) => assert!(reason.contains("exceeds")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn empty_catalog_is_not_persisted() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let chunked = chunked(store.clone());
        chunked.save(&entries(3), 25, now()).await;

        let outcome = chunked.save(&[], 25, now()).await;
        assert!(matches!(outcome, PersistOutcome::Skipped(_)));
        assert!(matches!(chunked.load(now()).await, LoadOutcome::Loaded { .. }));
    }

    #[tokio::test]
    async fn tampered_chunk_fails_checksum() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let chunked = chunked(store.clone());
        chunked.save(&entries(3), 25, now()).await;

        let body = store.get(&chunk_key(0)).await.unwrap().unwrap();
        store
            .set(&chunk_key(0), body.replace("Card 1", "Card X"))
            .await
            .unwrap();
        match chunked.load(now()).await {
            LoadOutcome::Invalid(reason) => assert!(reason.contains("checksum")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_or_foreign_version_envelopes_are_rejected() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let chunked = chunked(store.clone());
        chunked.save(&entries(3), 25, now()).await;
        let later = now() + chrono::Duration::hours(25);
        assert!(matches!(chunked.load(later).await, LoadOutcome::Invalid(_)));

        chunked.save(&entries(3), 25, now()).await;
        let mut meta: EnvelopeMeta =
            serde_json::from_str(&store.get(META_KEY).await.unwrap().unwrap()).unwrap();
        meta.format_version = 1;
        store
            .set(META_KEY, serde_json::to_string(&meta).unwrap())
            .await
            .unwrap();
        assert!(matches!(chunked.load(now()).await, LoadOutcome::Invalid(_)));
    }

    #[tokio::test]
    async fn oversized_chunks_retry_smaller_once() {
        let thirteen = serde_json::to_string(
            &entries(13)
                .iter()
                .map(|e| PersistedCard::project(e, 5))
                .collect::<Vec<_>>(),
        )
        .unwrap();
        // Room for a 13-card chunk but not a 25-card one.
        let store = Arc::new(MemoryKeyValueStore::with_max_value_bytes(thirteen.len() + 16));
        let chunked = chunked(store.clone());

        let outcome = chunked.save(&entries(30), 25, now()).await;
        assert_eq!(outcome, PersistOutcome::Written { chunks: 3, chunk_size: 12 });
        assert!(matches!(chunked.load(now()).await, LoadOutcome::Loaded { .. }));
    }

    #[tokio::test]
    async fn persistence_is_skipped_when_even_small_chunks_fail() {
        let store = Arc::new(MemoryKeyValueStore::with_max_value_bytes(64));
        let chunked = chunked(store.clone());
        let outcome = chunked.save(&entries(30), 25, now()).await;
        assert!(matches!(outcome, PersistOutcome::Skipped(_)));
        assert!(store.keys().is_empty());
    }
}
