use crate::config::Settings;
use crate::storage::{KeyValueStore, StorageError};

/// `kv_entries`-backed store, keyed by namespace. Honors an optional per-value byte limit
/// the same way `MemoryKeyValueStore` does.
#[derive(Debug, Clone)]
pub struct PgKeyValueStore {
    pool: sqlx::PgPool,
    namespace: String,
    max_value_bytes: Option<usize>,
}

impl PgKeyValueStore {
    pub fn new(pool: sqlx::PgPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            max_value_bytes: None,
        }
    }

    pub fn from_settings(pool: sqlx::PgPool, settings: &Settings) -> Self {
        let store = Self::new(pool, settings.kv_namespace.clone());
        match settings.kv_max_value_bytes {
            Some(limit) => store.with_max_value_bytes(limit),
            None => store,
        }
    }

    pub fn with_max_value_bytes(mut self, limit: usize) -> Self {
        self.max_value_bytes = Some(limit);
        self
    }
}

fn backend(context: &str, err: sqlx::Error) -> StorageError {
    StorageError::Backend(format!("{context}: {err}"))
}

#[async_trait::async_trait]
impl KeyValueStore for PgKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_entries WHERE namespace = $1 AND key = $2",
        )
        .persistent(false)
        .bind(&self.namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("select kv_entries failed", e))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        if let Some(limit) = self.max_value_bytes {
            if value.len() > limit {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    size: value.len(),
                    limit,
                });
            }
        }

        sqlx::query(
            "INSERT INTO kv_entries (namespace, key, value, updated_at) VALUES ($1, $2, $3, now()) \
             ON CONFLICT (namespace, key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .persistent(false)
        .bind(&self.namespace)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("upsert kv_entries failed", e))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_entries WHERE namespace = $1 AND key = $2")
            .persistent(false)
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| backend("delete kv_entries failed", e))?;
        Ok(())
    }
}
