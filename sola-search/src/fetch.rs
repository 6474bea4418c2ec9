//! Query image download
//!
//! Allow-listed hosts are fetched directly; every other URL goes through the
//! image proxy.

use crate::error::SearchError;
use crate::signing::encode_component;
use bytes::{Bytes, BytesMut};
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

pub struct ImageFetcher {
    client: reqwest::Client,
    proxy_url: String,
    direct_hosts: Vec<String>,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(
        proxy_url: impl Into<String>,
        direct_hosts: Vec<String>,
        timeout: Duration,
        max_bytes: usize,
    ) -> sola_common::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| sola_common::Error::Config(format!("Failed to build image client: {}", e)))?;
        Ok(Self {
            client,
            proxy_url: proxy_url.into(),
            direct_hosts,
            max_bytes,
        })
    }

    /// Address actually requested for a user-supplied image URL
    pub fn resolve_fetch_url(&self, image_url: &str) -> Result<String, SearchError> {
        let parsed = Url::parse(image_url)
            .map_err(|_| SearchError::BadInput(format!("Invalid image url {}", image_url)))?;

        let direct = parsed
            .host_str()
            .map_or(false, |host| self.direct_hosts.iter().any(|h| h == host));
        if direct {
            Ok(image_url.to_string())
        } else {
            Ok(format!("{}?url={}", self.proxy_url, encode_component(image_url)))
        }
    }

    pub async fn fetch(&self, image_url: &str) -> Result<Bytes, SearchError> {
        let target = self.resolve_fetch_url(image_url)?;
        debug!(url = %image_url, via = %target, "Fetching query image");

        let failed = |detail: String| {
            SearchError::BadInput(format!("Failed to fetch image {} ({})", image_url, detail))
        };

        let mut response = self
            .client
            .get(&target)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(SearchError::ImageFetchFailed {
                status: status.as_u16(),
                message: format!("Failed to fetch image {} (HTTP {})", image_url, status.as_u16()),
            });
        }

        let too_large = || failed(format!("larger than {} bytes", self.max_bytes));
        if response
            .content_length()
            .map_or(false, |len| len > self.max_bytes as u64)
        {
            return Err(too_large());
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| failed(e.to_string()))? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}
