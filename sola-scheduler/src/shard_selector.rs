//! Target shard selection for load jobs
//!
//! Two strategies: a round-robin cursor over the configured shards, and a
//! probe of every search server's admin status that picks the core holding
//! the fewest documents.

use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use sola_common::ShardTarget;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Endless cycle over a fixed shard list
///
/// Yields `None` only when the list is empty.
#[derive(Debug, Clone)]
pub struct RoundRobin {
    targets: Vec<ShardTarget>,
    cursor: usize,
}

impl RoundRobin {
    pub fn new(targets: Vec<ShardTarget>) -> Self {
        Self::starting_at(targets, 0)
    }

    /// Cursor positioned at `offset` (modulo the list length)
    pub fn starting_at(targets: Vec<ShardTarget>, offset: usize) -> Self {
        let cursor = if targets.is_empty() {
            0
        } else {
            offset % targets.len()
        };
        Self { targets, cursor }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Iterator for RoundRobin {
    type Item = ShardTarget;

    fn next(&mut self) -> Option<ShardTarget> {
        let target = self.targets.get(self.cursor)?.clone();
        self.cursor = (self.cursor + 1) % self.targets.len();
        Some(target)
    }
}

/// Document count of one core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreStats {
    pub core: ShardTarget,
    pub num_docs: u64,
}

#[async_trait]
pub trait ShardProbe: Send + Sync {
    /// Document counts of every reachable core
    async fn core_stats(&self) -> Result<Vec<CoreStats>>;
}

/// Core with the fewest documents; the first one wins ties
pub async fn least_populated(probe: &dyn ShardProbe) -> Result<ShardTarget> {
    probe
        .core_stats()
        .await?
        .into_iter()
        .min_by_key(|stats| stats.num_docs)
        .map(|stats| stats.core)
        .ok_or_else(|| SchedulerError::Probe("no cores reported".to_string()))
}

#[derive(Debug, Deserialize)]
struct AdminStatus {
    #[serde(default)]
    status: BTreeMap<String, AdminCore>,
}

#[derive(Debug, Deserialize)]
struct AdminCore {
    name: String,
    #[serde(default)]
    index: AdminIndex,
}

#[derive(Debug, Default, Deserialize)]
struct AdminIndex {
    #[serde(rename = "numDocs", default)]
    num_docs: u64,
}

/// Probe over the search servers' admin status endpoint
pub struct HttpShardProbe {
    client: reqwest::Client,
    servers: Vec<String>,
    admin_path: String,
}

impl HttpShardProbe {
    /// `servers` are search server roots such as `http://solr-a:8983/solr/`
    pub fn new(servers: Vec<String>, admin_path: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::Probe(format!("Failed to build probe client: {}", e)))?;
        let servers = servers
            .into_iter()
            .map(|s| if s.ends_with('/') { s } else { format!("{}/", s) })
            .collect();
        Ok(Self {
            client,
            servers,
            admin_path: admin_path.into().trim_start_matches('/').to_string(),
        })
    }

    async fn probe_server(&self, server: &str) -> Result<Vec<CoreStats>> {
        let url = format!("{}{}", server, self.admin_path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SchedulerError::Probe(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(SchedulerError::Probe(format!("{}: HTTP {}", url, response.status())));
        }
        let admin: AdminStatus = response
            .json()
            .await
            .map_err(|e| SchedulerError::Probe(format!("{}: {}", url, e)))?;

        Ok(admin
            .status
            .into_values()
            .map(|core| CoreStats {
                core: ShardTarget::new(format!("{}{}", server, core.name)),
                num_docs: core.index.num_docs,
            })
            .collect())
    }
}

#[async_trait]
impl ShardProbe for HttpShardProbe {
    async fn core_stats(&self) -> Result<Vec<CoreStats>> {
        let results = join_all(self.servers.iter().map(|s| self.probe_server(s))).await;

        let mut stats = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(cores) => stats.extend(cores),
                Err(e) => {
                    warn!("{}", e);
                    failures.push(e.to_string());
                }
            }
        }

        if stats.is_empty() && !failures.is_empty() {
            return Err(SchedulerError::Probe(failures.join("; ")));
        }
        debug!(cores = stats.len(), "Probed shard document counts");
        Ok(stats)
    }
}
