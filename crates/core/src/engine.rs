//! The service object callers hold: one catalog cache plus everything derived from it.

use crate::analyzer::{AnalyzerOptions, SpendingAnalyzer};
use crate::catalog::{CacheOptions, CatalogCache, RemoteCatalogSource};
use crate::domain::catalog::{CardLookup, CatalogEntry, CreditTier};
use crate::domain::expense::{ExpenseRecord, SpendingProfile};
use crate::domain::recommendation::ScoredRecommendation;
use crate::resolver::{DetailResolver, ResolverOptions};
use crate::scoring::{RecommendationRequest, RecommendationScorer, ScoringOptions};
use crate::search::{SearchIndex, SearchIndexEntry, SearchOptions};
use crate::storage::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub cache: CacheOptions,
    pub search: SearchOptions,
    pub resolver: ResolverOptions,
    pub scoring: ScoringOptions,
    pub analyzer: AnalyzerOptions,
}

impl EngineOptions {
    pub fn from_env() -> Self {
        Self {
            cache: CacheOptions::from_env(),
            search: SearchOptions::from_env(),
            resolver: ResolverOptions::from_env(),
            scoring: ScoringOptions::from_env(),
            analyzer: AnalyzerOptions::from_env(),
        }
    }
}

/// User-side inputs to a recommendation besides the expenses themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationParams {
    #[serde(default)]
    pub owned_card_ids: Vec<String>,
    #[serde(default)]
    pub not_interested_ids: Vec<String>,
    #[serde(default)]
    pub preference: String,
    #[serde(default = "default_credit_tier")]
    pub credit_tier: CreditTier,
}

fn default_credit_tier() -> CreditTier {
    CreditTier::Good
}

#[derive(Debug, Clone, Serialize)]
pub struct RecommendationOutcome {
    pub profile: SpendingProfile,
    pub recommendations: Vec<ScoredRecommendation>,
    /// False when no catalog could be loaded and `recommendations` is empty for that reason.
    pub catalog_available: bool,
}

pub struct CardEngine {
    cache: CatalogCache,
    search: SearchIndex,
    resolver: DetailResolver,
    scorer: RecommendationScorer,
    analyzer: SpendingAnalyzer,
}

impl CardEngine {
    pub fn new(source: Arc<dyn RemoteCatalogSource>, store: Arc<dyn KeyValueStore>, opts: EngineOptions) -> Self {
        let cache = CatalogCache::new(source, Arc::clone(&store), opts.cache);
        Self {
            search: SearchIndex::new(store, opts.search),
            resolver: DetailResolver::new(cache.clone(), opts.resolver),
            scorer: RecommendationScorer::new(opts.scoring),
            analyzer: SpendingAnalyzer::new(opts.analyzer),
            cache,
        }
    }

    pub fn cache(&self) -> &CatalogCache {
        &self.cache
    }

    pub fn search_index(&self) -> &SearchIndex {
        &self.search
    }

    pub async fn search(&self, query: &str) -> Vec<SearchIndexEntry> {
        self.search.ensure_ready(&self.cache).await;
        self.search.search(query)
    }

    pub async fn resolve(&self, id: &str) -> CardLookup {
        self.resolver.resolve(id).await
    }

    pub async fn resolve_many(&self, ids: &[String]) -> BTreeMap<String, Option<Arc<CatalogEntry>>> {
        self.resolver.resolve_many(ids).await
    }

    pub fn analyze(&self, expenses: &[ExpenseRecord]) -> SpendingProfile {
        self.analyzer.analyze(expenses)
    }

    /// Profile plus top-N recommendations. A catalog outage yields an empty list, never an error.
    pub async fn recommend_for(&self, expenses: &[ExpenseRecord], params: &RecommendationParams) -> RecommendationOutcome {
        let profile = self.analyzer.analyze(expenses);

        let candidates = match self.cache.get_all_cards().await {
            Ok(cards) => cards,
            Err(err) => {
                tracing::warn!(error = %err, "catalog unavailable; returning no recommendations");
                return RecommendationOutcome {
                    profile,
                    recommendations: Vec::new(),
                    catalog_available: false,
                };
            }
        };

        let request = RecommendationRequest {
            profile: &profile,
            owned_card_ids: &params.owned_card_ids,
            not_interested_ids: &params.not_interested_ids,
            preference: &params.preference,
            credit_tier: params.credit_tier,
        };
        let recommendations = self.scorer.recommend(&request, &candidates);
        tracing::debug!(
            candidates = candidates.len(),
            returned = recommendations.len(),
            preference = %params.preference,
            "recommendations scored"
        );

        RecommendationOutcome {
            profile,
            recommendations,
            catalog_available: true,
        }
    }
}
