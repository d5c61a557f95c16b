use crate::storage::StorageError;

/// Failure of a catalog load. `Clone` so one outcome can be handed to every coalesced waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),

    #[error("catalog fetch timed out after {after_ms}ms")]
    Timeout { after_ms: u128 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CatalogError {
    pub fn unavailable(err: &anyhow::Error) -> Self {
        CatalogError::Unavailable(format!("{err:#}"))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::Unavailable(_) | CatalogError::Timeout { .. }
        )
    }
}
