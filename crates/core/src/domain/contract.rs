use crate::domain::catalog::{
    fill_reward_rates, BonusType, CardType, Category, CatalogEntry, CreditTier, SignupBonus,
};
use anyhow::{ensure, Context};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Remote catalog record as delivered by the catalog source. Field names may be snake or
/// camel case and most fields are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCatalogRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default, alias = "rewardRates")]
    pub reward_rates: BTreeMap<String, f64>,
    #[serde(default, alias = "annualFee")]
    pub annual_fee: Option<f64>,
    #[serde(default, alias = "creditScoreRequired")]
    pub credit_score_required: Option<String>,
    #[serde(default)]
    pub perks: Vec<String>,
    #[serde(default, alias = "foreignTransactionFee")]
    pub foreign_transaction_fee: Option<bool>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "cardType")]
    pub card_type: Option<String>,
    #[serde(default, alias = "signupBonus")]
    pub signup_bonus: Option<RawSignupBonus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSignupBonus {
    pub amount: f64,
    #[serde(rename = "type", alias = "bonus_type")]
    pub bonus_type: String,
    #[serde(default, alias = "spendRequired")]
    pub spend_required: f64,
    #[serde(default)]
    pub timeframe: u32,
    #[serde(default)]
    pub description: String,
}

impl RawCatalogRecord {
    pub fn validate_and_into_entry(self) -> anyhow::Result<CatalogEntry> {
        let id = self.id.trim().to_string();
        ensure!(!id.is_empty(), "card id must be non-empty");

        let name = self.name.trim().to_string();
        ensure!(!name.is_empty(), "card name must be non-empty (id={id})");

        let annual_fee = self.annual_fee.unwrap_or(0.0);
        ensure!(
            annual_fee.is_finite() && annual_fee >= 0.0,
            "annual fee must be a non-negative number (id={id}, got {annual_fee})"
        );

        let mut rates = BTreeMap::new();
        for (key, rate) in self.reward_rates {
            let Ok(category) = key.parse::<Category>() else {
                continue;
            };
            ensure!(
                rate.is_finite() && rate >= 0.0,
                "reward rate for {category} must be non-negative (id={id})"
            );
            rates.insert(category, rate);
        }

        let credit_score_required = self
            .credit_score_required
            .as_deref()
            .and_then(|s| s.parse::<CreditTier>().ok())
            .unwrap_or(CreditTier::Good);

        let card_type = match self.card_type.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
            Some(t) if t == "business" => CardType::Business,
            _ => CardType::Personal,
        };

        let signup_bonus = match self.signup_bonus {
            Some(raw) => Some(
                raw.validate_and_into_bonus()
                    .with_context(|| format!("invalid signup bonus (id={id})"))?,
            ),
            None => None,
        };

        Ok(CatalogEntry {
            issuer: self.issuer.map(|s| s.trim().to_string()).unwrap_or_default(),
            reward_rates: fill_reward_rates(rates),
            annual_fee,
            credit_score_required,
            perks: self.perks,
            foreign_transaction_fee: self.foreign_transaction_fee.unwrap_or(false),
            categories: self.categories,
            description: self.description.unwrap_or_default(),
            card_type,
            signup_bonus,
            id,
            name,
        })
    }
}

impl RawSignupBonus {
    fn validate_and_into_bonus(self) -> anyhow::Result<SignupBonus> {
        ensure!(
            self.amount.is_finite() && self.amount >= 0.0,
            "bonus amount must be non-negative"
        );
        let bonus_type = match self.bonus_type.trim().to_ascii_lowercase().as_str() {
            "cashback" | "cash" => BonusType::Cashback,
            "points" => BonusType::Points,
            "miles" => BonusType::Miles,
            other => anyhow::bail!("unknown bonus type: {other}"),
        };
        Ok(SignupBonus {
            amount: self.amount,
            bonus_type,
            spend_required: self.spend_required.max(0.0),
            timeframe: self.timeframe,
            description: self.description,
        })
    }
}

pub fn parse_record(value: Value) -> anyhow::Result<CatalogEntry> {
    let raw = serde_json::from_value::<RawCatalogRecord>(value)
        .context("catalog record does not match the expected shape")?;
    raw.validate_and_into_entry()
}

/// Converts raw records, dropping (and logging) the ones that fail validation.
pub fn normalize_records(values: Vec<Value>) -> Vec<CatalogEntry> {
    let total = values.len();
    let mut out = Vec::with_capacity(total);
    for (idx, value) in values.into_iter().enumerate() {
        match parse_record(value) {
            Ok(entry) => out.push(entry),
            Err(err) => tracing::warn!(idx, error = %format!("{err:#}"), "dropping invalid catalog record"),
        }
    }
    if out.len() != total {
        tracing::warn!(total, kept = out.len(), "some catalog records were invalid");
    }
    out
}
