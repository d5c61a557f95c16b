use anyhow::Context;

// Advisory locks are scoped to the Postgres session. Used as a best-effort guard against
// concurrent catalog refresh runs.
const LOCK_NAMESPACE: i64 = 0x4341_5244_5749; // "CARDWI" as hex-ish namespace.

fn lock_key_for(scope: &str) -> i64 {
    // FNV-1a; stable across processes unlike the std hasher.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in scope.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    LOCK_NAMESPACE ^ (hash as i64)
}

pub async fn try_acquire_refresh_lock(pool: &sqlx::PgPool, scope: &str) -> anyhow::Result<bool> {
    let key = lock_key_for(scope);
    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(key)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to acquire advisory lock (scope={scope}, key={key})"))?;
    Ok(acquired.0)
}

pub async fn release_refresh_lock(pool: &sqlx::PgPool, scope: &str) -> anyhow::Result<()> {
    let key = lock_key_for(scope);
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .persistent(false)
        .bind(key)
        .execute(pool)
        .await
        .with_context(|| format!("failed to release advisory lock (scope={scope}, key={key})"))?;
    Ok(())
}
