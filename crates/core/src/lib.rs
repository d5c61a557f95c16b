pub mod analyzer;
pub mod catalog;
pub mod domain;
pub mod engine;
pub mod resolver;
pub mod retry;
pub mod scoring;
pub mod search;
pub mod storage;
pub mod time;
pub mod user;

pub mod config {
    use anyhow::Context;
    use std::str::FromStr;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub catalog_base_url: Option<String>,
        pub catalog_api_key: Option<String>,
        pub port: u16,
        /// Namespace for this deployment's rows in `kv_entries`.
        pub kv_namespace: String,
        pub kv_max_value_bytes: Option<usize>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                catalog_base_url: std::env::var("CATALOG_BASE_URL").ok(),
                catalog_api_key: std::env::var("CATALOG_API_KEY").ok(),
                port: env_parse("PORT").unwrap_or(3000),
                kv_namespace: std::env::var("KV_NAMESPACE")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "cardwise".to_string()),
                kv_max_value_bytes: env_parse("KV_MAX_VALUE_BYTES"),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_catalog_base_url(&self) -> anyhow::Result<&str> {
            self.catalog_base_url
                .as_deref()
                .context("CATALOG_BASE_URL is required")
        }
    }

    /// Parses `key` from the environment; missing or unparsable values yield `None`.
    pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
        std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
    }

    pub fn env_secs(key: &str) -> Option<Duration> {
        env_parse::<u64>(key).map(Duration::from_secs)
    }
}
