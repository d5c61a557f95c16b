use crate::config::env_parse;
use crate::domain::catalog::{CatalogEntry, Category, CreditTier};
use crate::domain::expense::SpendingProfile;
use crate::domain::recommendation::{ScoredRecommendation, DISQUALIFIED_SCORE};
use std::collections::HashSet;
use std::sync::Arc;

const PREFERENCE_WEIGHT: f64 = 30.0;
const CATEGORY_WEIGHT: f64 = 40.0;
const VALUE_WEIGHT: f64 = 20.0;
const BONUS_WEIGHT: f64 = 10.0;

/// Number of additive factors a card can trigger. The eligibility gate is not one of them.
const MATCH_FACTORS: f64 = 4.0;

const DISQUALIFIED_REASON: &str = "Requires a higher credit score than you currently have";
const GENERIC_REASON: &str = "General-purpose card for everyday spending";

#[derive(Debug, Clone)]
pub struct ScoringOptions {
    pub top_n: usize,
    /// Reward rate treated as "no bonus"; a category aligns when the card earns more than
    /// twice this.
    pub baseline_reward_rate: f64,
    /// Dollar value of one point or mile.
    pub points_value: f64,
    pub min_signup_bonus_value: f64,
}

impl Default for ScoringOptions {
    fn default() -> Self {
        Self {
            top_n: 3,
            baseline_reward_rate: 1.0,
            points_value: 0.015,
            min_signup_bonus_value: 500.0,
        }
    }
}

impl ScoringOptions {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Some(v) = env_parse::<usize>("RECOMMENDATION_TOP_N") {
            out.top_n = v;
        }
        if let Some(v) = env_parse::<f64>("RECOMMENDATION_POINTS_VALUE") {
            out.points_value = v;
        }
        if let Some(v) = env_parse::<f64>("RECOMMENDATION_MIN_BONUS_VALUE") {
            out.min_signup_bonus_value = v;
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct RecommendationRequest<'a> {
    pub profile: &'a SpendingProfile,
    pub owned_card_ids: &'a [String],
    pub not_interested_ids: &'a [String],
    pub preference: &'a str,
    pub credit_tier: CreditTier,
}

#[derive(Debug, Clone, Default)]
pub struct RecommendationScorer {
    opts: ScoringOptions,
}

impl RecommendationScorer {
    pub fn new(opts: ScoringOptions) -> Self {
        Self { opts }
    }

    /// Top-N eligible recommendations. Disqualified cards are ranked by `score_all` but never
    /// returned here.
    pub fn recommend(
        &self,
        request: &RecommendationRequest<'_>,
        candidates: &[Arc<CatalogEntry>],
    ) -> Vec<ScoredRecommendation> {
        self.score_all(request, candidates)
            .into_iter()
            .filter(|r| !r.is_disqualified())
            .take(self.opts.top_n)
            .collect()
    }

    /// Scores every candidate not owned or dismissed, sorted by score descending then id.
    pub fn score_all(
        &self,
        request: &RecommendationRequest<'_>,
        candidates: &[Arc<CatalogEntry>],
    ) -> Vec<ScoredRecommendation> {
        let excluded: HashSet<&str> = request
            .owned_card_ids
            .iter()
            .chain(request.not_interested_ids.iter())
            .map(|s| s.as_str())
            .collect();

        let mut scored: Vec<ScoredRecommendation> = candidates
            .iter()
            .filter(|c| !excluded.contains(c.id.as_str()))
            .map(|c| self.score_card(request, c))
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.card.id.cmp(&b.card.id))
        });

        scored
    }

    pub fn score_card(
        &self,
        request: &RecommendationRequest<'_>,
        card: &Arc<CatalogEntry>,
    ) -> ScoredRecommendation {
        if request.credit_tier < card.credit_score_required {
            return ScoredRecommendation {
                card: Arc::clone(card),
                reason: DISQUALIFIED_REASON.to_string(),
                score: DISQUALIFIED_SCORE,
                match_percentage: 0.0,
                potential_annual_value: 0.0,
            };
        }

        let profile = request.profile;
        let mut score = 0.0;
        let mut triggered = 0usize;
        let mut reasons: Vec<String> = Vec::new();

        if card.has_tag(request.preference) {
            score += PREFERENCE_WEIGHT;
            triggered += 1;
            reasons.push(format!(
                "Matches your preference for {}",
                request.preference.trim().to_ascii_lowercase()
            ));
        }

        let aligned: Vec<Category> = profile
            .high_spend_categories
            .iter()
            .copied()
            .filter(|c| card.reward_rate(*c) > 2.0 * self.opts.baseline_reward_rate)
            .collect();
        if !aligned.is_empty() {
            score += CATEGORY_WEIGHT * aligned.len() as f64
                / profile.high_spend_categories.len() as f64;
            triggered += 1;
            let names: Vec<&str> = aligned.iter().map(|c| c.as_str()).collect();
            reasons.push(format!(
                "Strong rewards in your top spending categories: {}",
                names.join(", ")
            ));
        }

        let projected_rewards = projected_annual_rewards(profile, card);
        if card.annual_fee == 0.0 {
            score += VALUE_WEIGHT;
            triggered += 1;
            reasons.push("No annual fee".to_string());
        } else if projected_rewards > 2.0 * card.annual_fee {
            score += VALUE_WEIGHT;
            triggered += 1;
            reasons.push(format!(
                "Projected rewards of ${projected_rewards:.0} outweigh the ${:.0} annual fee",
                card.annual_fee
            ));
        }

        if let Some(bonus) = &card.signup_bonus {
            let value = bonus.dollar_value(self.opts.points_value);
            if value > self.opts.min_signup_bonus_value && profile.can_meet_signup_bonus {
                score += BONUS_WEIGHT;
                triggered += 1;
                reasons.push(format!("Signup bonus worth about ${value:.0}"));
            }
        }

        let reason = if reasons.is_empty() {
            GENERIC_REASON.to_string()
        } else {
            reasons.into_iter().take(2).collect::<Vec<_>>().join("; ")
        };

        ScoredRecommendation {
            card: Arc::clone(card),
            reason,
            score,
            match_percentage: triggered as f64 / MATCH_FACTORS * 100.0,
            potential_annual_value: projected_rewards - card.annual_fee,
        }
    }
}

/// Annualized spend per category times the card's rate for that category.
pub fn projected_annual_rewards(profile: &SpendingProfile, card: &CatalogEntry) -> f64 {
    Category::ALL
        .into_iter()
        .map(|c| profile.annualized_spend(c) * card.reward_rate(c) / 100.0)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::SpendingAnalyzer;
    use crate::domain::catalog::{fill_reward_rates, BonusType, CardType, SignupBonus};
    use crate::domain::expense::ExpenseRecord;
    use crate::time::dates::RawDate;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn card(id: &str, rates: &[(Category, f64)], fee: f64, tier: CreditTier, tags: &[&str]) -> Arc<CatalogEntry> {
        Arc::new(CatalogEntry {
            id: id.to_string(),
            name: id.to_string(),
            issuer: "Test Bank".to_string(),
            reward_rates: fill_reward_rates(rates.iter().copied().collect::<BTreeMap<_, _>>()),
            annual_fee: fee,
            credit_score_required: tier,
            perks: Vec::new(),
            foreign_transaction_fee: false,
            categories: tags.iter().map(|s| s.to_string()).collect(),
            description: String::new(),
            card_type: CardType::Personal,
            signup_bonus: None,
        })
    }

    fn profile_from(expenses: &[(f64, &str)]) -> SpendingProfile {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let records: Vec<ExpenseRecord> = expenses
            .iter()
            .enumerate()
            .map(|(i, (amount, category))| ExpenseRecord {
                id: format!("e{i}"),
                amount: *amount,
                category: category.to_string(),
                date: RawDate::Native(now),
            })
            .collect();
        SpendingAnalyzer::default().analyze_at(&records, now)
    }

    fn request<'a>(profile: &'a SpendingProfile, owned: &'a [String], tier: CreditTier) -> RecommendationRequest<'a> {
        RecommendationRequest {
            profile,
            owned_card_ids: owned,
            not_interested_ids: &[],
            preference: "points",
            credit_tier: tier,
        }
    }

    #[test]
    fn ineligible_cards_score_exactly_the_sentinel() {
        let profile = profile_from(&[(500.0, "dining")]);
        let premium = card("premium", &[(Category::Dining, 10.0)], 0.0, CreditTier::Excellent, &["points"]);
        let scorer = RecommendationScorer::default();
        let scored = scorer.score_card(&request(&profile, &[], CreditTier::Good), &premium);
        assert_eq!(scored.score, DISQUALIFIED_SCORE);
        assert_eq!(scored.match_percentage, 0.0);
        assert_eq!(scored.reason, DISQUALIFIED_REASON);
    }

    #[test]
    fn end_to_end_dining_card_beats_disqualified_premium_card() {
        let profile = profile_from(&[(500.0, "dining"), (400.0, "travel")]);
        let dining = card("dining-plus", &[(Category::Dining, 4.0)], 0.0, CreditTier::Fair, &["points", "dining"]);
        let premium = card(
            "premium-travel",
            &[(Category::Travel, 5.0), (Category::Dining, 3.0)],
            550.0,
            CreditTier::Excellent,
            &["travel", "points"],
        );
        let candidates = vec![premium.clone(), dining.clone()];
        let scorer = RecommendationScorer::default();
        let req = request(&profile, &[], CreditTier::Good);

        let all = scorer.score_all(&req, &candidates);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].card.id, "dining-plus");
        assert_eq!(all[1].card.id, "premium-travel");
        assert_eq!(all[1].score, DISQUALIFIED_SCORE);

        let top = scorer.recommend(&req, &candidates);
        assert_eq!(top.len(), 1);
        let best = &top[0];
        // preference 30 + half the categories 20 + no fee 20
        assert!((best.score - 70.0).abs() < 1e-9);
        assert!(best.reason.contains("preference") || best.reason.contains("categories"));
        assert_eq!(best.match_percentage, 75.0);
    }

    #[test]
    fn owned_and_dismissed_cards_are_never_returned() {
        let profile = profile_from(&[(500.0, "dining")]);
        let a = card("a", &[], 0.0, CreditTier::Poor, &[]);
        let b = card("b", &[], 0.0, CreditTier::Poor, &[]);
        let c = card("c", &[], 0.0, CreditTier::Poor, &[]);
        let owned = vec!["a".to_string()];
        let dismissed = vec!["c".to_string()];
        let req = RecommendationRequest {
            not_interested_ids: &dismissed,
            ..request(&profile, &owned, CreditTier::Excellent)
        };
        let out = RecommendationScorer::default().recommend(&req, &[a, b, c]);
        let ids: Vec<&str> = out.iter().map(|r| r.card.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn ties_break_by_id_and_results_truncate_to_top_n() {
        let profile = profile_from(&[(500.0, "dining")]);
        let cards: Vec<_> = ["d", "b", "a", "c"]
            .iter()
            .map(|id| card(id, &[], 0.0, CreditTier::Poor, &[]))
            .collect();
        let out = RecommendationScorer::default().recommend(&request(&profile, &[], CreditTier::Good), &cards);
        let ids: Vec<&str> = out.iter().map(|r| r.card.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(out.iter().all(|r| r.reason == "No annual fee"));
    }

    #[test]
    fn value_factor_requires_rewards_above_twice_the_fee() {
        // 3000/month in dining -> 36000/year; 4% -> 1440 in rewards.
        let profile = profile_from(&[(3000.0, "dining")]);
        let cheap = card("cheap-fee", &[(Category::Dining, 4.0)], 95.0, CreditTier::Poor, &[]);
        let pricey = card("pricey-fee", &[(Category::Dining, 4.0)], 895.0, CreditTier::Poor, &[]);
        let scorer = RecommendationScorer::default();
        let req = request(&profile, &[], CreditTier::Good);

        let cheap_scored = scorer.score_card(&req, &cheap);
        assert!((cheap_scored.score - 60.0).abs() < 1e-9);
        assert!((cheap_scored.potential_annual_value - (1440.0 - 95.0)).abs() < 1e-6);

        let pricey_scored = scorer.score_card(&req, &pricey);
        assert!((pricey_scored.score - 40.0).abs() < 1e-9);
    }

    #[test]
    fn signup_bonus_needs_value_and_reachable_spend() {
        let mut bonus_card = (*card("bonus", &[], 95.0, CreditTier::Poor, &[])).clone();
        bonus_card.signup_bonus = Some(SignupBonus {
            amount: 60_000.0,
            bonus_type: BonusType::Points,
            spend_required: 4000.0,
            timeframe: 3,
            description: String::new(),
        });
        let bonus_card = Arc::new(bonus_card);
        let scorer = RecommendationScorer::default();

        let big = profile_from(&[(2000.0, "other")]);
        let scored = scorer.score_card(&request(&big, &[], CreditTier::Good), &bonus_card);
        assert!(scored.reason.contains("Signup bonus"));
        assert_eq!(scored.match_percentage, 50.0);

        let small = profile_from(&[(200.0, "other")]);
        let scored = scorer.score_card(&request(&small, &[], CreditTier::Good), &bonus_card);
        assert_eq!(scored.score, 0.0);
        assert_eq!(scored.reason, GENERIC_REASON);
    }
}
