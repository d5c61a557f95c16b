use crate::domain::recommendation::RecommendationRun;
use anyhow::Context;

pub async fn persist_run(pool: &sqlx::PgPool, run: &RecommendationRun) -> anyhow::Result<uuid::Uuid> {
    let items = serde_json::to_value(&run.items).context("serialize recommendation items failed")?;

    sqlx::query(
        "INSERT INTO recommendation_runs (id, user_id, generated_at, preference, credit_tier, items) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .persistent(false)
    .bind(run.id)
    .bind(run.user_id.as_deref())
    .bind(run.generated_at)
    .bind(&run.preference)
    .bind(run.credit_tier.as_str())
    .bind(items)
    .execute(pool)
    .await
    .context("insert recommendation_runs failed")?;

    Ok(run.id)
}
