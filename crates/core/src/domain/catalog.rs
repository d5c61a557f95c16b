use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Reward rate assumed for any category a card does not model explicitly.
pub const DEFAULT_REWARD_RATE: f64 = 1.0;

/// The fixed spending category set. Aggregation and reward rates are keyed by these only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Dining,
    Travel,
    Grocery,
    Gas,
    Entertainment,
    Rent,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Dining,
        Category::Travel,
        Category::Grocery,
        Category::Gas,
        Category::Entertainment,
        Category::Rent,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Dining => "dining",
            Category::Travel => "travel",
            Category::Grocery => "grocery",
            Category::Gas => "gas",
            Category::Entertainment => "entertainment",
            Category::Rent => "rent",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| anyhow::anyhow!("unknown spending category: {s}"))
    }
}

/// Ordinal credit standing. Comparison follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl CreditTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CreditTier::Poor => "poor",
            CreditTier::Fair => "fair",
            CreditTier::Good => "good",
            CreditTier::Excellent => "excellent",
        }
    }
}

impl fmt::Display for CreditTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poor" => Ok(CreditTier::Poor),
            "fair" => Ok(CreditTier::Fair),
            "good" => Ok(CreditTier::Good),
            "excellent" => Ok(CreditTier::Excellent),
            other => anyhow::bail!("unknown credit tier: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardType {
    #[default]
    Personal,
    Business,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BonusType {
    Cashback,
    Points,
    Miles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignupBonus {
    pub amount: f64,
    pub bonus_type: BonusType,
    pub spend_required: f64,
    /// Months allowed to reach `spend_required`.
    pub timeframe: u32,
    #[serde(default)]
    pub description: String,
}

impl SignupBonus {
    /// Dollar equivalent: cashback at face value, points and miles at `value_per_unit`.
    pub fn dollar_value(&self, value_per_unit: f64) -> f64 {
        match self.bonus_type {
            BonusType::Cashback => self.amount,
            BonusType::Points | BonusType::Miles => self.amount * value_per_unit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub issuer: String,
    /// Always holds every `Category`; see `fill_reward_rates`.
    pub reward_rates: BTreeMap<Category, f64>,
    pub annual_fee: f64,
    pub credit_score_required: CreditTier,
    #[serde(default)]
    pub perks: Vec<String>,
    #[serde(default)]
    pub foreign_transaction_fee: bool,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub card_type: CardType,
    #[serde(default)]
    pub signup_bonus: Option<SignupBonus>,
}

impl CatalogEntry {
    pub fn reward_rate(&self, category: Category) -> f64 {
        self.reward_rates
            .get(&category)
            .copied()
            .unwrap_or(DEFAULT_REWARD_RATE)
    }

    /// Case-insensitive membership in the card's tag list.
    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.trim();
        !tag.is_empty() && self.categories.iter().any(|t| t.trim().eq_ignore_ascii_case(tag))
    }
}

/// Returns a rate map covering the whole category set, defaulting missing entries.
pub fn fill_reward_rates(partial: BTreeMap<Category, f64>) -> BTreeMap<Category, f64> {
    Category::ALL
        .into_iter()
        .map(|c| (c, partial.get(&c).copied().unwrap_or(DEFAULT_REWARD_RATE)))
        .collect()
}

/// Minimal placeholder for an id the catalog could not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderCard {
    pub id: String,
    pub name: String,
}

impl PlaceholderCard {
    pub fn for_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: humanize_id(id),
        }
    }
}

/// Result of a single-card lookup. Misses are a variant, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CardLookup {
    Resolved { card: std::sync::Arc<CatalogEntry> },
    Placeholder { card: PlaceholderCard },
}

impl CardLookup {
    pub fn placeholder(id: &str) -> Self {
        CardLookup::Placeholder {
            card: PlaceholderCard::for_id(id),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CardLookup::Resolved { card } => &card.id,
            CardLookup::Placeholder { card } => &card.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CardLookup::Resolved { card } => &card.name,
            CardLookup::Placeholder { card } => &card.name,
        }
    }

    pub fn entry(&self) -> Option<&std::sync::Arc<CatalogEntry>> {
        match self {
            CardLookup::Resolved { card } => Some(card),
            CardLookup::Placeholder { .. } => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, CardLookup::Placeholder { .. })
    }
}

/// "chase-sapphire_preferred" -> "Chase Sapphire Preferred".
pub fn humanize_id(id: &str) -> String {
    let words: Vec<String> = id
        .split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();

    if words.is_empty() {
        "Unknown Card".to_string()
    } else {
        words.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_tiers_are_ordinal() {
        assert!(CreditTier::Poor < CreditTier::Fair);
        assert!(CreditTier::Good < CreditTier::Excellent);
        assert_eq!("Excellent".parse::<CreditTier>().unwrap(), CreditTier::Excellent);
        assert!("platinum".parse::<CreditTier>().is_err());
    }

    #[test]
    fn fill_reward_rates_covers_every_category() {
        let mut partial = BTreeMap::new();
        partial.insert(Category::Dining, 4.0);
        let full = fill_reward_rates(partial);
        assert_eq!(full.len(), Category::ALL.len());
        assert_eq!(full[&Category::Dining], 4.0);
        assert_eq!(full[&Category::Rent], DEFAULT_REWARD_RATE);
    }

    #[test]
    fn humanize_id_title_cases_words() {
        assert_eq!(humanize_id("chase-sapphire_preferred"), "Chase Sapphire Preferred");
        assert_eq!(humanize_id("--"), "Unknown Card");
    }

    #[test]
    fn placeholder_is_tagged_and_keyed_by_id() {
        let lookup = CardLookup::placeholder("amex-gold");
        assert!(lookup.is_placeholder());
        assert_eq!(lookup.id(), "amex-gold");
        assert_eq!(lookup.name(), "Amex Gold");
        assert!(lookup.entry().is_none());

        let v = serde_json::to_value(&lookup).unwrap();
        assert_eq!(v["status"], "placeholder");
    }

    #[test]
    fn signup_bonus_dollar_value_depends_on_type() {
        let cash = SignupBonus {
            amount: 200.0,
            bonus_type: BonusType::Cashback,
            spend_required: 500.0,
            timeframe: 3,
            description: String::new(),
        };
        assert_eq!(cash.dollar_value(0.015), 200.0);

        let points = SignupBonus {
            bonus_type: BonusType::Points,
            amount: 60_000.0,
            ..cash
        };
        assert!((points.dollar_value(0.015) - 900.0).abs() < 1e-9);
    }
}
