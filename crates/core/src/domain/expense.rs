use crate::domain::catalog::Category;
use crate::time::dates::RawDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRecord {
    #[serde(default)]
    pub id: String,
    pub amount: f64,
    pub category: String,
    #[serde(default)]
    pub date: RawDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpendingPattern {
    HighSpend,
    LowSpend,
    Balanced,
    CategoryFocused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingProfile {
    pub total_spend: f64,
    /// Share of `total_spend` per fixed category, 0..=100.
    pub category_percentages: BTreeMap<Category, f64>,
    pub category_totals: BTreeMap<Category, f64>,
    pub monthly_average: f64,
    /// Ordered by descending share, then category order.
    pub high_spend_categories: Vec<Category>,
    pub spending_pattern: SpendingPattern,
    pub can_meet_signup_bonus: bool,
    pub expense_count: usize,
}

impl SpendingProfile {
    /// Profile returned when there is nothing valid to analyze: zero totals over every
    /// category, no high-spend categories, low-spend pattern, no signup bonus eligibility.
    pub fn zero() -> Self {
        let zeros: BTreeMap<Category, f64> = Category::ALL.into_iter().map(|c| (c, 0.0)).collect();
        Self {
            total_spend: 0.0,
            category_percentages: zeros.clone(),
            category_totals: zeros,
            monthly_average: 0.0,
            high_spend_categories: Vec::new(),
            spending_pattern: SpendingPattern::LowSpend,
            can_meet_signup_bonus: false,
            expense_count: 0,
        }
    }

    pub fn share(&self, category: Category) -> f64 {
        self.category_percentages.get(&category).copied().unwrap_or(0.0)
    }

    /// Spend in `category` projected over twelve months.
    pub fn annualized_spend(&self, category: Category) -> f64 {
        self.monthly_average * 12.0 * self.share(category) / 100.0
    }
}
