use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config;

/// Failure classes of a single feed request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Remote says the resource does not exist (not yet published).
    #[error("forecast not found at {url}")]
    NotFound { url: String },
    /// Transport failure or a non-404 error status.
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    /// 200 response whose body is not a feature collection.
    #[error("invalid feature collection from {url}: {message}")]
    Decode { url: String, message: String },
}

/// GeoJSON-like collection as served by the forecast feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeatureCollection {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub features: Vec<Feature>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Feature>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Feature>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(default)]
    pub geometry: Option<Value>,
}

impl Feature {
    /// Property lookup that treats JSON null like an absent key.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties
            .as_ref()
            .and_then(|p| p.get(key))
            .filter(|v| !v.is_null())
    }
}

impl FeatureCollection {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Decode a response body; `null` and blank bodies are an empty collection.
    pub fn from_body(body: &str) -> Result<Self, serde_json::Error> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(body)? {
            Value::Null => Ok(Self::default()),
            other => serde_json::from_value(other),
        }
    }
}

/// Fetches one day's forecast collection. No retries: a failed fetch is
/// reported and the next scheduled run tries again.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FeatureCollection, FetchError>;
}

#[derive(Clone)]
pub struct HttpForecastSource {
    http: Client,
    verify_tls: bool,
}

impl fmt::Debug for HttpForecastSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpForecastSource")
            .field("verify_tls", &self.verify_tls)
            .finish_non_exhaustive()
    }
}

impl HttpForecastSource {
    pub fn from_config(cfg: &config::Source) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(concat!("dustwarning/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!cfg.verify_tls);
        if let Some(timeout) = cfg.timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build HTTP client")?;
        Ok(Self {
            http,
            verify_tls: cfg.verify_tls,
        })
    }
}

#[async_trait]
impl ForecastSource for HttpForecastSource {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<FeatureCollection, FetchError> {
        let request_err = |message: String| FetchError::Request {
            url: url.to_string(),
            message,
        };

        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| request_err(e.to_string()))?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(request_err(format!("status {status}: {body}")));
        }

        let body = res
            .text()
            .await
            .map_err(|e| request_err(format!("failed to read body: {e}")))?;
        debug!(bytes = body.len(), "forecast body received");

        FeatureCollection::from_body(&body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}
