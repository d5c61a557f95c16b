use crate::config::env_parse;
use crate::domain::catalog::Category;
use crate::domain::expense::{ExpenseRecord, SpendingPattern, SpendingProfile};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

const DAYS_PER_MONTH: f64 = 30.0;
// Months over which the signup bonus spend is assumed achievable.
const SIGNUP_WINDOW_MONTHS: f64 = 3.0;

#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    /// Share (percent) above which a category counts as high-spend.
    pub high_spend_share: f64,
    pub high_monthly_spend: f64,
    pub low_monthly_spend: f64,
    /// Minimum spend a signup bonus is assumed to require over three months.
    pub min_signup_spend: f64,
    /// Bucket expenses with unrecognized categories into `other` instead of dropping
    /// them from category totals.
    pub fold_unknown_into_other: bool,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            high_spend_share: 15.0,
            high_monthly_spend: 5000.0,
            low_monthly_spend: 1000.0,
            min_signup_spend: 4000.0,
            fold_unknown_into_other: false,
        }
    }
}

impl AnalyzerOptions {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Some(v) = env_parse::<f64>("ANALYZER_HIGH_SPEND_SHARE") {
            out.high_spend_share = v;
        }
        if let Some(v) = env_parse::<f64>("CARD_MIN_SIGNUP_SPEND") {
            out.min_signup_spend = v;
        }
        if let Some(v) = env_parse::<bool>("ANALYZER_FOLD_UNKNOWN_INTO_OTHER") {
            out.fold_unknown_into_other = v;
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpendingAnalyzer {
    opts: AnalyzerOptions,
}

struct ValidExpense {
    amount: f64,
    category: Option<Category>,
    date: DateTime<Utc>,
}

impl SpendingAnalyzer {
    pub fn new(opts: AnalyzerOptions) -> Self {
        Self { opts }
    }

    pub fn analyze(&self, expenses: &[ExpenseRecord]) -> SpendingProfile {
        self.analyze_at(expenses, Utc::now())
    }

    /// Same as `analyze`, with an explicit clock for the month span.
    pub fn analyze_at(&self, expenses: &[ExpenseRecord], now: DateTime<Utc>) -> SpendingProfile {
        let valid: Vec<ValidExpense> = expenses
            .iter()
            .filter_map(|e| self.validate(e))
            .collect();

        if valid.is_empty() {
            if !expenses.is_empty() {
                tracing::warn!(total = expenses.len(), "no valid expenses; returning zero profile");
            }
            return SpendingProfile::zero();
        }

        let total_spend: f64 = valid.iter().map(|e| e.amount).sum();

        let mut category_totals: BTreeMap<Category, f64> =
            Category::ALL.into_iter().map(|c| (c, 0.0)).collect();
        for e in &valid {
            if let Some(c) = e.category {
                *category_totals.entry(c).or_insert(0.0) += e.amount;
            }
        }

        let category_percentages: BTreeMap<Category, f64> = category_totals
            .iter()
            .map(|(c, amount)| {
                let pct = if total_spend > 0.0 {
                    amount / total_spend * 100.0
                } else {
                    0.0
                };
                (*c, pct)
            })
            .collect();

        let oldest = valid.iter().map(|e| e.date).min().unwrap_or(now);
        let days = (now - oldest).num_seconds().max(0) as f64 / 86_400.0;
        let months = (days / DAYS_PER_MONTH).ceil().max(1.0);
        let monthly_average = total_spend / months;

        let mut high_spend_categories: Vec<Category> = category_percentages
            .iter()
            .filter(|(_, pct)| **pct > self.opts.high_spend_share)
            .map(|(c, _)| *c)
            .collect();
        high_spend_categories.sort_by(|a, b| {
            category_percentages[b]
                .partial_cmp(&category_percentages[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });

        let spending_pattern = if monthly_average > self.opts.high_monthly_spend {
            SpendingPattern::HighSpend
        } else if monthly_average < self.opts.low_monthly_spend {
            SpendingPattern::LowSpend
        } else if high_spend_categories.len() > 2 {
            SpendingPattern::Balanced
        } else {
            SpendingPattern::CategoryFocused
        };

        let can_meet_signup_bonus =
            monthly_average * SIGNUP_WINDOW_MONTHS >= self.opts.min_signup_spend;

        tracing::debug!(
            expenses = valid.len(),
            dropped = expenses.len() - valid.len(),
            total_spend,
            monthly_average,
            ?spending_pattern,
            "spending profile computed"
        );

        SpendingProfile {
            total_spend,
            category_percentages,
            category_totals,
            monthly_average,
            high_spend_categories,
            spending_pattern,
            can_meet_signup_bonus,
            expense_count: valid.len(),
        }
    }

    fn validate(&self, expense: &ExpenseRecord) -> Option<ValidExpense> {
        if !expense.amount.is_finite() || expense.amount < 0.0 {
            tracing::warn!(id = %expense.id, amount = expense.amount, "dropping expense with invalid amount");
            return None;
        }

        let raw_category = expense.category.trim();
        if raw_category.is_empty() {
            tracing::warn!(id = %expense.id, "dropping expense with empty category");
            return None;
        }

        let Some(date) = expense.date.normalize() else {
            tracing::warn!(id = %expense.id, date = ?expense.date, "dropping expense with unparsable date");
            return None;
        };

        let category = match raw_category.parse::<Category>() {
            Ok(c) => Some(c),
            Err(_) if self.opts.fold_unknown_into_other => Some(Category::Other),
            Err(_) => {
                tracing::debug!(id = %expense.id, category = raw_category, "category outside the fixed set; not aggregated");
                None
            }
        };

        Some(ValidExpense {
            amount: expense.amount,
            category,
            date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::dates::RawDate;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn expense(amount: f64, category: &str, date: &str) -> ExpenseRecord {
        ExpenseRecord {
            id: format!("{category}-{amount}"),
            amount,
            category: category.to_string(),
            date: RawDate::Text(date.to_string()),
        }
    }

    fn percent_sum(p: &SpendingProfile) -> f64 {
        p.category_percentages.values().sum()
    }

    #[test]
    fn empty_and_all_invalid_inputs_return_zero_profile() {
        let analyzer = SpendingAnalyzer::default();
        assert_eq!(analyzer.analyze_at(&[], now()), SpendingProfile::zero());

        let invalid = vec![
            expense(-10.0, "dining", "2026-02-20"),
            expense(f64::NAN, "dining", "2026-02-20"),
            expense(10.0, "  ", "2026-02-20"),
            expense(10.0, "dining", "not a date"),
        ];
        assert_eq!(analyzer.analyze_at(&invalid, now()), SpendingProfile::zero());
    }

    #[test]
    fn percentages_sum_to_100_when_all_categories_known() {
        let analyzer = SpendingAnalyzer::default();
        let p = analyzer.analyze_at(
            &[
                expense(500.0, "dining", "2026-02-20"),
                expense(400.0, "Travel", "2026-02-21"),
                expense(100.0, "gas", "2026-02-22"),
            ],
            now(),
        );
        assert!((percent_sum(&p) - 100.0).abs() < 1e-9);
        assert_eq!(p.total_spend, 1000.0);
        assert_eq!(p.high_spend_categories, vec![Category::Dining, Category::Travel]);
    }

    #[test]
    fn unknown_categories_count_toward_total_but_not_shares() {
        let analyzer = SpendingAnalyzer::default();
        let p = analyzer.analyze_at(
            &[
                expense(500.0, "dining", "2026-02-20"),
                expense(500.0, "crypto", "2026-02-20"),
            ],
            now(),
        );
        assert_eq!(p.total_spend, 1000.0);
        assert!((percent_sum(&p) - 50.0).abs() < 1e-9);
        assert_eq!(p.share(Category::Other), 0.0);

        let folding = SpendingAnalyzer::new(AnalyzerOptions {
            fold_unknown_into_other: true,
            ..AnalyzerOptions::default()
        });
        let p = folding.analyze_at(
            &[
                expense(500.0, "dining", "2026-02-20"),
                expense(500.0, "crypto", "2026-02-20"),
            ],
            now(),
        );
        assert!((p.share(Category::Other) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn monthly_average_uses_ceil_of_thirty_day_spans() {
        let analyzer = SpendingAnalyzer::default();
        // 2025-12-01 -> 2026-03-01 is 90 days: three months.
        let p = analyzer.analyze_at(
            &[
                expense(3000.0, "rent", "2025-12-01"),
                expense(3000.0, "rent", "2026-02-01"),
            ],
            now(),
        );
        assert!((p.monthly_average - 2000.0).abs() < 1e-9);
        assert_eq!(p.spending_pattern, SpendingPattern::CategoryFocused);
        assert!(p.can_meet_signup_bonus);

        // Expenses dated today still span one month.
        let p = analyzer.analyze_at(&[expense(300.0, "gas", "2026-03-01")], now());
        assert_eq!(p.monthly_average, 300.0);
        assert_eq!(p.spending_pattern, SpendingPattern::LowSpend);
        assert!(!p.can_meet_signup_bonus);
    }

    #[test]
    fn patterns_follow_thresholds() {
        let analyzer = SpendingAnalyzer::default();
        let high = analyzer.analyze_at(&[expense(6000.0, "travel", "2026-02-28")], now());
        assert_eq!(high.spending_pattern, SpendingPattern::HighSpend);

        let balanced = analyzer.analyze_at(
            &[
                expense(1000.0, "dining", "2026-02-28"),
                expense(1000.0, "grocery", "2026-02-28"),
                expense(1000.0, "gas", "2026-02-28"),
            ],
            now(),
        );
        assert_eq!(balanced.high_spend_categories.len(), 3);
        assert_eq!(balanced.spending_pattern, SpendingPattern::Balanced);
    }

    #[test]
    fn invalid_records_are_dropped_not_fatal() {
        let analyzer = SpendingAnalyzer::default();
        let p = analyzer.analyze_at(
            &[
                expense(200.0, "dining", "2026-02-20"),
                expense(-1.0, "dining", "2026-02-20"),
            ],
            now(),
        );
        assert_eq!(p.expense_count, 1);
        assert_eq!(p.total_spend, 200.0);
    }

    #[test]
    fn batch_with_one_bad_date_keeps_the_good_records() {
        let batch: Vec<ExpenseRecord> = serde_json::from_value(serde_json::json!([
            {"id": "a", "amount": 120.0, "category": "dining", "date": "2026-02-20"},
            {"id": "b", "amount": 80.0, "category": "gas", "date": {"seconds": 1771545600, "nanoseconds": 0}},
            {"id": "c", "amount": 50.0, "category": "travel", "date": null},
            {"id": "d", "amount": 40.0, "category": "travel", "date": {"when": "soon"}},
            {"id": "e", "amount": 30.0, "category": "travel"},
        ]))
        .unwrap();
        assert_eq!(batch.len(), 5);

        let p = SpendingAnalyzer::default().analyze_at(&batch, now());
        assert_eq!(p.expense_count, 2);
        assert_eq!(p.total_spend, 200.0);
    }
}
