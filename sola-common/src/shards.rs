//! Search shard addressing
//!
//! The shard set is static configuration: an ordered list of base URLs, one
//! per independently queryable search core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Base address of one search shard (e.g. `http://solr-a:8983/solr/cl_0`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ShardTarget(String);

impl ShardTarget {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self(url.trim().trim_end_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a path (and optional query) below this shard's base address
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.0, path.trim_start_matches('/'))
    }
}

impl From<String> for ShardTarget {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

impl From<ShardTarget> for String {
    fn from(shard: ShardTarget) -> Self {
        shard.0
    }
}

impl fmt::Display for ShardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a comma separated shard list, skipping blank entries
pub fn parse_shard_list(list: &str) -> Vec<ShardTarget> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ShardTarget::new)
        .collect()
}
