use crate::domain::catalog::{CatalogEntry, CreditTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Score assigned to cards the user is not eligible for. Sorts below any additive score.
pub const DISQUALIFIED_SCORE: f64 = -1000.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecommendation {
    pub card: Arc<CatalogEntry>,
    pub reason: String,
    pub score: f64,
    pub match_percentage: f64,
    pub potential_annual_value: f64,
}

impl ScoredRecommendation {
    pub fn is_disqualified(&self) -> bool {
        self.score == DISQUALIFIED_SCORE
    }
}

/// Stored record of one recommendation request.
#[derive(Debug, Clone, Serialize)]
pub struct RecommendationRun {
    pub id: uuid::Uuid,
    pub user_id: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub preference: String,
    pub credit_tier: CreditTier,
    pub items: Vec<RecommendationRunItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRunItem {
    pub rank: i32,
    pub card_id: String,
    pub card_name: String,
    pub reason: String,
    pub score: f64,
    pub match_percentage: f64,
}

impl RecommendationRun {
    pub fn new(
        user_id: Option<String>,
        preference: &str,
        credit_tier: CreditTier,
        recommendations: &[ScoredRecommendation],
    ) -> Self {
        let items = recommendations
            .iter()
            .enumerate()
            .map(|(idx, r)| RecommendationRunItem {
                rank: idx as i32 + 1,
                card_id: r.card.id.clone(),
                card_name: r.card.name.clone(),
                reason: r.reason.clone(),
                score: r.score,
                match_percentage: r.match_percentage,
            })
            .collect();

        Self {
            id: uuid::Uuid::new_v4(),
            user_id,
            generated_at: Utc::now(),
            preference: preference.to_string(),
            credit_tier,
            items,
        }
    }
}
