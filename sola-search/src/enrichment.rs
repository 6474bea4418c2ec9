//! Best-effort anime metadata lookup (AniList GraphQL)
//!
//! Failures never fail a search: the caller keeps the numeric ids.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

const MEDIA_QUERY: &str = r#"query ($ids: [Int]) {
  Page(page: 1, perPage: 50) {
    media(id_in: $ids, type: ANIME) {
      id
      idMal
      title {
        native
        romaji
        english
      }
      synonyms
      isAdult
    }
  }
}"#;

/// Metadata lookup keyed by media id
#[async_trait]
pub trait MetadataEnricher: Send + Sync {
    /// `None` when the lookup failed as a whole
    async fn enrich(&self, ids: &[u64]) -> Option<HashMap<u64, Value>>;
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<PageData>,
}

#[derive(Debug, Deserialize)]
struct PageData {
    #[serde(rename = "Page")]
    page: MediaPage,
}

#[derive(Debug, Deserialize)]
struct MediaPage {
    #[serde(default)]
    media: Vec<Value>,
}

pub struct AnilistClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl AnilistClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, per_minute: u32) -> sola_common::Result<Self> {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| sola_common::Error::Config(format!("Failed to build AniList client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
            rate_limiter: RateLimiter::direct(quota),
        })
    }

    async fn fetch(&self, ids: &[u64]) -> Result<HashMap<u64, Value>, String> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "query": MEDIA_QUERY,
                "variables": { "ids": ids },
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().as_u16() >= 400 {
            return Err(format!("AniList returned {}", response.status()));
        }

        let body: GraphQlResponse = response.json().await.map_err(|e| e.to_string())?;
        let media = body.data.map(|d| d.page.media).unwrap_or_default();

        Ok(media
            .into_iter()
            .filter_map(|entry| Some((entry.get("id")?.as_u64()?, entry)))
            .collect())
    }
}

#[async_trait]
impl MetadataEnricher for AnilistClient {
    async fn enrich(&self, ids: &[u64]) -> Option<HashMap<u64, Value>> {
        if ids.is_empty() {
            return Some(HashMap::new());
        }

        // The deadline also covers waiting for the rate limiter
        match tokio::time::timeout(self.timeout, self.fetch(ids)).await {
            Ok(Ok(found)) => {
                debug!(requested = ids.len(), found = found.len(), "Metadata enrichment done");
                Some(found)
            }
            Ok(Err(e)) => {
                warn!("Metadata enrichment failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Metadata enrichment timed out after {:?}", self.timeout);
                None
            }
        }
    }
}
