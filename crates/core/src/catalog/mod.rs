//! Multi-tier mirror of the remote card catalog.
//!
//! Tiers, checked in order: the in-memory map (fresh for `memory_ttl`), the chunked persisted
//! envelope (fresh for `persisted_max_age`), then the remote source. Concurrent loads share one
//! in-flight future; the marker is cleared when that future finishes, whatever the outcome.

pub mod error;
pub mod persist;
pub mod source;

use crate::config::{env_parse, env_secs};
use crate::domain::catalog::{CardLookup, CatalogEntry};
use crate::domain::contract::normalize_records;
use crate::storage::KeyValueStore;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

pub use error::CatalogError;
pub use persist::{LoadOutcome, PersistOutcome};
pub use source::RemoteCatalogSource;

use persist::ChunkedCatalogStore;

/// Immutable view of the catalog in source order.
pub type CatalogSnapshot = Arc<Vec<Arc<CatalogEntry>>>;

type LoadFuture = Shared<BoxFuture<'static, Result<CatalogSnapshot, CatalogError>>>;

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub memory_ttl: Duration,
    pub persisted_max_age: Duration,
    pub chunk_size: usize,
    pub fetch_timeout: Duration,
    /// Max perks/categories kept per card in the persisted projection.
    pub persist_list_cap: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            memory_ttl: Duration::from_secs(60 * 60),
            persisted_max_age: Duration::from_secs(24 * 60 * 60),
            chunk_size: 25,
            fetch_timeout: Duration::from_secs(30),
            persist_list_cap: 5,
        }
    }
}

impl CacheOptions {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Some(v) = env_secs("CATALOG_MEMORY_TTL_SECS") {
            out.memory_ttl = v;
        }
        if let Some(v) = env_secs("CATALOG_PERSIST_MAX_AGE_SECS") {
            out.persisted_max_age = v;
        }
        if let Some(v) = env_parse::<usize>("CATALOG_CHUNK_SIZE").filter(|n| *n >= 1) {
            out.chunk_size = v;
        }
        if let Some(v) = env_secs("CATALOG_FETCH_TIMEOUT_SECS") {
            out.fetch_timeout = v;
        }
        if let Some(v) = env_parse::<usize>("CATALOG_PERSIST_LIST_CAP") {
            out.persist_list_cap = v;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// Persisted tier first, then remote.
    Warm,
    /// Remote only.
    Remote,
}

struct MemoryTier {
    cards: CatalogSnapshot,
    by_id: HashMap<String, Arc<CatalogEntry>>,
    loaded_at: Instant,
    /// False when restored from the reduced persisted projection.
    complete: bool,
}

struct InFlight {
    generation: u64,
    mode: LoadMode,
    fut: LoadFuture,
}

enum Joined {
    Ready(u64, LoadFuture),
    /// A load of a weaker mode is running; wait for it, then try again.
    Busy(LoadFuture),
}

struct Inner {
    source: Arc<dyn RemoteCatalogSource>,
    persisted: ChunkedCatalogStore,
    opts: CacheOptions,
    memory: RwLock<Option<MemoryTier>>,
    in_flight: Mutex<Option<InFlight>>,
    generation: AtomicU64,
}

/// Owns the canonical catalog and its persisted keys. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CatalogCache {
    inner: Arc<Inner>,
}

impl CatalogCache {
    pub fn new(source: Arc<dyn RemoteCatalogSource>, store: Arc<dyn KeyValueStore>, opts: CacheOptions) -> Self {
        let persisted = ChunkedCatalogStore::new(store, opts.persisted_max_age, opts.persist_list_cap);
        Self {
            inner: Arc::new(Inner {
                source,
                persisted,
                opts,
                memory: RwLock::new(None),
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn source(&self) -> &Arc<dyn RemoteCatalogSource> {
        &self.inner.source
    }

    /// Full catalog. Fresh memory is returned immediately; otherwise one shared load runs. When
    /// the load fails and an older snapshot is in memory, that snapshot is returned instead.
    pub async fn get_all_cards(&self) -> Result<CatalogSnapshot, CatalogError> {
        if let Some(cards) = self.fresh_memory() {
            return Ok(cards);
        }
        let (_, fut) = self.join(LoadMode::Warm).await;
        self.or_last_known_good(fut.await)
    }

    /// `get_all_cards` bounded by a caller deadline. On expiry the in-flight marker is dropped so
    /// the next call starts a new load.
    pub async fn get_all_cards_within(&self, deadline: Duration) -> Result<CatalogSnapshot, CatalogError> {
        if let Some(cards) = self.fresh_memory() {
            return Ok(cards);
        }
        let (generation, fut) = self.join(LoadMode::Warm).await;
        match tokio::time::timeout(deadline, fut).await {
            Ok(res) => self.or_last_known_good(res),
            Err(_) => {
                self.inner.finish(generation);
                tracing::warn!(deadline_ms = deadline.as_millis(), "catalog load exceeded caller deadline");
                self.or_last_known_good(Err(CatalogError::Timeout {
                    after_ms: deadline.as_millis(),
                }))
            }
        }
    }

    /// Forces a remote fetch, sharing one already in flight.
    pub async fn refresh(&self) -> Result<CatalogSnapshot, CatalogError> {
        let (_, fut) = self.join(LoadMode::Remote).await;
        fut.await
    }

    /// Replaces the catalog wholesale and persists it.
    pub async fn set_all_cards(&self, entries: Vec<CatalogEntry>) -> PersistOutcome {
        let snapshot = self.inner.install(entries, true);
        self.inner.persist(&snapshot).await
    }

    /// O(1) lookup in the memory tier. Misses yield a placeholder keyed by `id`.
    pub fn get_card(&self, id: &str) -> CardLookup {
        match self.lookup(id) {
            Some(card) => CardLookup::Resolved { card },
            None => {
                tracing::debug!(id, "card not in memory tier; returning placeholder");
                CardLookup::placeholder(id)
            }
        }
    }

    /// Memory-tier lookup regardless of freshness.
    pub fn lookup(&self, id: &str) -> Option<Arc<CatalogEntry>> {
        let guard = self.inner.read_memory();
        guard.as_ref().and_then(|tier| tier.by_id.get(id).cloned())
    }

    /// Like `lookup`, but only when the memory tier holds full records rather than the persisted
    /// projection.
    pub fn lookup_complete(&self, id: &str) -> Option<Arc<CatalogEntry>> {
        let guard = self.inner.read_memory();
        guard
            .as_ref()
            .filter(|tier| tier.complete)
            .and_then(|tier| tier.by_id.get(id).cloned())
    }

    /// The memory tier if it is still within `memory_ttl`.
    pub fn fresh_cards(&self) -> Option<CatalogSnapshot> {
        self.fresh_memory()
    }

    /// Whatever the memory tier holds, fresh or not.
    pub fn cached_cards(&self) -> Option<CatalogSnapshot> {
        let guard = self.inner.read_memory();
        guard.as_ref().map(|tier| Arc::clone(&tier.cards))
    }

    /// Drops the memory tier and the persisted envelope.
    pub async fn invalidate(&self) -> Result<(), CatalogError> {
        *self.inner.write_memory() = None;
        self.inner.persisted.clear().await?;
        Ok(())
    }

    fn fresh_memory(&self) -> Option<CatalogSnapshot> {
        let guard = self.inner.read_memory();
        let tier = guard.as_ref()?;
        if tier.loaded_at.elapsed() < self.inner.opts.memory_ttl {
            Some(Arc::clone(&tier.cards))
        } else {
            None
        }
    }

    fn or_last_known_good(&self, res: Result<CatalogSnapshot, CatalogError>) -> Result<CatalogSnapshot, CatalogError> {
        match res {
            Ok(cards) => Ok(cards),
            Err(err) => match self.cached_cards() {
                Some(stale) => {
                    tracing::warn!(error = %err, cards = stale.len(), "catalog load failed; serving last known good");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    async fn join(&self, mode: LoadMode) -> (u64, LoadFuture) {
        loop {
            match self.join_or_start(mode) {
                Joined::Ready(generation, fut) => return (generation, fut),
                Joined::Busy(fut) => {
                    let _ = fut.await;
                }
            }
        }
    }

    fn join_or_start(&self, mode: LoadMode) -> Joined {
        let mut guard = self.inner.lock_in_flight();
        if let Some(in_flight) = guard.as_ref() {
            if in_flight.mode == mode || in_flight.mode == LoadMode::Remote {
                return Joined::Ready(in_flight.generation, in_flight.fut.clone());
            }
            return Joined::Busy(in_flight.fut.clone());
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let fut = Inner::load(Arc::clone(&self.inner), generation, mode)
            .boxed()
            .shared();
        *guard = Some(InFlight {
            generation,
            mode,
            fut: fut.clone(),
        });
        tracing::debug!(generation, ?mode, "catalog load started");
        Joined::Ready(generation, fut)
    }
}

impl Inner {
    async fn load(self: Arc<Self>, generation: u64, mode: LoadMode) -> Result<CatalogSnapshot, CatalogError> {
        let res = AssertUnwindSafe(self.load_tiers(mode))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(generation, "catalog load panicked");
                Err(CatalogError::Unavailable("catalog load panicked".to_string()))
            });
        self.finish(generation);
        res
    }

    async fn load_tiers(&self, mode: LoadMode) -> Result<CatalogSnapshot, CatalogError> {
        if mode == LoadMode::Warm {
            match self.persisted.load(Utc::now()).await {
                LoadOutcome::Loaded { entries, saved_at } => {
                    tracing::debug!(cards = entries.len(), %saved_at, "catalog restored from persisted tier");
                    return Ok(self.install(entries, false));
                }
                LoadOutcome::Missing => tracing::debug!("no persisted catalog"),
                LoadOutcome::Invalid(reason) => {
                    tracing::warn!(%reason, "persisted catalog invalid; fetching remote")
                }
            }
        }

        let timeout = self.opts.fetch_timeout;
        let raw = tokio::time::timeout(timeout, self.source.get_all())
            .await
            .map_err(|_| {
                tracing::warn!(timeout_ms = timeout.as_millis(), source = self.source.source_name(), "remote catalog fetch timed out");
                CatalogError::Timeout {
                    after_ms: timeout.as_millis(),
                }
            })?
            .map_err(|err| {
                tracing::warn!(error = %format!("{err:#}"), source = self.source.source_name(), "remote catalog fetch failed");
                CatalogError::unavailable(&err)
            })?;

        let entries = normalize_records(raw);
        tracing::info!(cards = entries.len(), source = self.source.source_name(), "catalog fetched from remote");
        let snapshot = self.install(entries, true);
        if !snapshot.is_empty() {
            self.persist(&snapshot).await;
        }
        Ok(snapshot)
    }

    fn install(&self, entries: Vec<CatalogEntry>, complete: bool) -> CatalogSnapshot {
        let cards: CatalogSnapshot = Arc::new(entries.into_iter().map(Arc::new).collect());
        let by_id = cards
            .iter()
            .map(|c| (c.id.clone(), Arc::clone(c)))
            .collect();
        *self.write_memory() = Some(MemoryTier {
            cards: Arc::clone(&cards),
            by_id,
            loaded_at: Instant::now(),
            complete,
        });
        cards
    }

    async fn persist(&self, cards: &[Arc<CatalogEntry>]) -> PersistOutcome {
        let outcome = self.persisted.save(cards, self.opts.chunk_size, Utc::now()).await;
        if let PersistOutcome::Written { chunks, chunk_size } = &outcome {
            tracing::debug!(chunks, chunk_size, "catalog persisted");
        }
        outcome
    }

    /// Clears the in-flight marker if it still belongs to `generation`.
    fn finish(&self, generation: u64) {
        let mut guard = self.lock_in_flight();
        if guard.as_ref().map(|f| f.generation) == Some(generation) {
            *guard = None;
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_memory(&self) -> std::sync::RwLockReadGuard<'_, Option<MemoryTier>> {
        self.memory.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_memory(&self) -> std::sync::RwLockWriteGuard<'_, Option<MemoryTier>> {
        self.memory.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
