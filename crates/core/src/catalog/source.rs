use crate::config::{env_parse, Settings};
use crate::retry::{retry_with_backoff, Backoff};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PATH: &str = "/v1/cards";
const DEFAULT_RETRIES: u32 = 3;

/// Remote product catalog. Records are returned raw; `domain::contract` validates them.
#[async_trait::async_trait]
pub trait RemoteCatalogSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn get_all(&self) -> Result<Vec<Value>>;

    /// May return fewer records than requested; unknown ids are simply absent.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Value>>;
}

#[derive(Debug, Clone)]
pub struct HttpCatalogSource {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    path: String,
    backoff: Backoff,
}

impl HttpCatalogSource {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_catalog_base_url()?.to_string();
        let api_key = settings.catalog_api_key.clone();

        let timeout_secs = env_parse::<u64>("CATALOG_HTTP_TIMEOUT_SECS").unwrap_or(DEFAULT_TIMEOUT_SECS);
        let retries = env_parse::<u32>("CATALOG_HTTP_RETRIES").unwrap_or(DEFAULT_RETRIES);

        let path = std::env::var("CATALOG_CARDS_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build catalog http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            path,
            backoff: Backoff::new(retries, Duration::from_secs(1)),
        })
    }

    fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }

    async fn fetch_once(&self, ids: Option<&[String]>) -> Result<Vec<Value>> {
        let mut req = self.http.get(self.url()).headers(self.headers()?);
        if let Some(ids) = ids {
            req = req.query(&[("ids", ids.join(","))]);
        }

        let res = req.send().await.context("catalog request failed")?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read catalog response")?;
        let raw_json = serde_json::from_str::<Value>(&text)
            .with_context(|| format!("catalog response is not valid JSON: {text}"))?;

        if !status.is_success() {
            anyhow::bail!("catalog HTTP {status}: {raw_json}");
        }

        records_from_body(raw_json)
    }
}

/// Accepts either a bare array or `{"cards": [...]}`.
fn records_from_body(body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => match obj.remove("cards") {
            Some(Value::Array(items)) => Ok(items),
            _ => anyhow::bail!("catalog response object has no `cards` array"),
        },
        other => anyhow::bail!("unexpected catalog response shape: {other}"),
    }
}

#[async_trait::async_trait]
impl RemoteCatalogSource for HttpCatalogSource {
    fn source_name(&self) -> &'static str {
        "http_json"
    }

    async fn get_all(&self) -> Result<Vec<Value>> {
        retry_with_backoff("catalog get_all", self.backoff, |_| self.fetch_once(None)).await
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        retry_with_backoff("catalog get_by_ids", self.backoff, |_| self.fetch_once(Some(ids))).await
    }
}
