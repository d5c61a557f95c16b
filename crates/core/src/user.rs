//! Per-user inputs to the recommender: expenses and card relationships.

use crate::domain::expense::ExpenseRecord;
use crate::retry::{retry_with_backoff, Backoff};
use anyhow::Context;
use chrono::{DateTime, Utc};

#[async_trait::async_trait]
pub trait UserDataSource: Send + Sync {
    async fn fetch_expenses(&self, user_id: &str) -> anyhow::Result<Vec<ExpenseRecord>>;

    async fn fetch_owned_cards(&self, user_id: &str) -> anyhow::Result<Vec<String>>;

    async fn fetch_not_interested_cards(&self, _user_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Terminal failure after the retry budget is spent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("user data unavailable ({what} for {user_id}) after {attempts} attempts: {message}")]
pub struct UserDataUnavailable {
    pub what: &'static str,
    pub user_id: String,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserData {
    pub expenses: Vec<ExpenseRecord>,
    pub owned_card_ids: Vec<String>,
    pub not_interested_ids: Vec<String>,
}

/// Wraps a source with bounded exponential backoff on every read.
pub struct BackoffUserData<S> {
    inner: S,
    backoff: Backoff,
}

impl<S: UserDataSource> BackoffUserData<S> {
    pub fn new(inner: S) -> Self {
        Self::with_backoff(inner, Backoff::default())
    }

    pub fn with_backoff(inner: S, backoff: Backoff) -> Self {
        Self {
            inner,
            backoff: Backoff::new(backoff.max_attempts.min(3), backoff.base_delay),
        }
    }

    pub async fn expenses(&self, user_id: &str) -> Result<Vec<ExpenseRecord>, UserDataUnavailable> {
        let res = retry_with_backoff("user expenses", self.backoff, |_| self.inner.fetch_expenses(user_id)).await;
        res.map_err(|err| self.unavailable("expenses", user_id, err))
    }

    pub async fn owned_cards(&self, user_id: &str) -> Result<Vec<String>, UserDataUnavailable> {
        let res = retry_with_backoff("user owned cards", self.backoff, |_| self.inner.fetch_owned_cards(user_id)).await;
        res.map_err(|err| self.unavailable("owned cards", user_id, err))
    }

    pub async fn not_interested_cards(&self, user_id: &str) -> Result<Vec<String>, UserDataUnavailable> {
        let res = retry_with_backoff("user dismissed cards", self.backoff, |_| {
            self.inner.fetch_not_interested_cards(user_id)
        })
        .await;
        res.map_err(|err| self.unavailable("dismissed cards", user_id, err))
    }

    /// All three reads; the first terminal failure wins.
    pub async fn load(&self, user_id: &str) -> Result<UserData, UserDataUnavailable> {
        let (expenses, owned_card_ids, not_interested_ids) = tokio::try_join!(
            self.expenses(user_id),
            self.owned_cards(user_id),
            self.not_interested_cards(user_id),
        )?;
        Ok(UserData {
            expenses,
            owned_card_ids,
            not_interested_ids,
        })
    }

    fn unavailable(&self, what: &'static str, user_id: &str, err: anyhow::Error) -> UserDataUnavailable {
        UserDataUnavailable {
            what,
            user_id: user_id.to_string(),
            attempts: self.backoff.max_attempts,
            message: format!("{err:#}"),
        }
    }
}

/// Reads `user_expenses` and `user_cards`.
#[derive(Debug, Clone)]
pub struct PgUserDataSource {
    pool: sqlx::PgPool,
}

impl PgUserDataSource {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    async fn card_ids(&self, user_id: &str, status: &str) -> anyhow::Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT card_id FROM user_cards WHERE user_id = $1 AND status = $2 ORDER BY added_at, card_id",
        )
        .persistent(false)
        .bind(user_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("select user_cards ({status}) failed"))
    }
}

#[async_trait::async_trait]
impl UserDataSource for PgUserDataSource {
    async fn fetch_expenses(&self, user_id: &str) -> anyhow::Result<Vec<ExpenseRecord>> {
        let rows = sqlx::query_as::<_, (String, f64, String, DateTime<Utc>)>(
            "SELECT id, amount, category, spent_at FROM user_expenses WHERE user_id = $1 ORDER BY spent_at",
        )
        .persistent(false)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("select user_expenses failed")?;

        Ok(rows
            .into_iter()
            .map(|(id, amount, category, spent_at)| ExpenseRecord {
                id,
                amount,
                category,
                date: spent_at.into(),
            })
            .collect())
    }

    async fn fetch_owned_cards(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        self.card_ids(user_id, "owned").await
    }

    async fn fetch_not_interested_cards(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        self.card_ids(user_id, "not_interested").await
    }
}
