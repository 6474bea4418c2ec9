//! HTTP client for the search shards
//!
//! Each shard exposes one query handler that takes the frame as the request
//! body and returns ranked documents plus candidate statistics. Shards report
//! their numeric statistics either as JSON numbers or as strings, so those
//! fields are parsed leniently (unparseable values read as zero).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sola_common::{Error, Result, ShardTarget};
use std::time::Duration;
use tracing::debug;

/// Parameters of one query round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardQuery {
    pub candidates: u64,
    pub media_filter: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShardDoc {
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub d: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShardDocs {
    #[serde(default)]
    pub docs: Vec<ShardDoc>,
}

/// Body of a successful shard reply
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShardResponse {
    #[serde(rename = "RawDocsCount", default, deserialize_with = "lenient_u64")]
    pub raw_docs_count: u64,
    #[serde(rename = "RawDocsSearchTime", default, deserialize_with = "lenient_u64")]
    pub raw_docs_search_time: u64,
    #[serde(rename = "ReRankSearchTime", default, deserialize_with = "lenient_u64")]
    pub rerank_search_time: u64,
    #[serde(default)]
    pub response: ShardDocs,
    /// Engine-side failure reported inside an otherwise successful reply
    #[serde(rename = "Error", default)]
    pub error: Option<Value>,
}

impl ShardResponse {
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Outcome of querying one shard
#[derive(Debug, Clone)]
pub enum ShardReply {
    Ok(ShardResponse),
    /// Non-success HTTP status
    Status(u16),
    /// No response (connect failure, timeout)
    Unreachable(String),
    /// Success status with an unreadable body
    Malformed(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenientNumber {
    Number(f64),
    Text(String),
}

impl LenientNumber {
    fn value(self) -> f64 {
        match self {
            LenientNumber::Number(n) => n,
            LenientNumber::Text(s) => s.trim().parse().unwrap_or(0.0),
        }
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    Ok(Option::<LenientNumber>::deserialize(deserializer)?
        .map(LenientNumber::value)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    let value = lenient_f64(deserializer)?;
    Ok(if value > 0.0 { value as u64 } else { 0 })
}

/// Query seam between the orchestrator and the shard cluster
#[async_trait]
pub trait ShardClient: Send + Sync {
    fn shards(&self) -> &[ShardTarget];

    async fn query(&self, shard: &ShardTarget, frame: Bytes, query: ShardQuery) -> ShardReply;
}

/// Settings fixed for the lifetime of the client
#[derive(Debug, Clone)]
pub struct ShardClientConfig {
    pub shards: Vec<ShardTarget>,
    pub handler: String,
    pub accuracy: u32,
    pub rows: u32,
    pub timeout: Duration,
}

pub struct HttpShardClient {
    http_client: reqwest::Client,
    config: ShardClientConfig,
}

impl HttpShardClient {
    pub fn new(config: ShardClientConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build shard HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            config,
        })
    }

    /// Full query URL for one shard
    pub fn query_url(&self, shard: &ShardTarget, query: ShardQuery) -> String {
        let mut url = format!(
            "{}?field=cl_ha&ms=false&accuracy={}&candidates={}&rows={}",
            shard.endpoint(&self.config.handler),
            self.config.accuracy,
            query.candidates,
            self.config.rows
        );
        if let Some(media_id) = query.media_filter {
            url.push_str(&format!("&fq=id:{}/*", media_id));
        }
        url
    }
}

#[async_trait]
impl ShardClient for HttpShardClient {
    fn shards(&self) -> &[ShardTarget] {
        &self.config.shards
    }

    async fn query(&self, shard: &ShardTarget, frame: Bytes, query: ShardQuery) -> ShardReply {
        let url = self.query_url(shard, query);
        debug!(shard = %shard, candidates = query.candidates, "Querying shard");

        let response = match self.http_client.post(&url).body(frame).send().await {
            Ok(response) => response,
            Err(e) => return ShardReply::Unreachable(e.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            return ShardReply::Status(status.as_u16());
        }

        match response.json::<ShardResponse>().await {
            Ok(body) => ShardReply::Ok(body),
            Err(e) => ShardReply::Malformed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_bytes, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> (HttpShardClient, ShardTarget) {
        let shard = ShardTarget::new(format!("{}/solr/cl_0", server.uri()));
        let client = HttpShardClient::new(ShardClientConfig {
            shards: vec![shard.clone()],
            handler: "lireq".to_string(),
            accuracy: 100,
            rows: 30,
            timeout: Duration::from_millis(500),
        })
        .unwrap();
        (client, shard)
    }

    #[test]
    fn test_lenient_numbers() {
        let parsed: ShardResponse = serde_json::from_value(json!({
            "RawDocsCount": "1200",
            "RawDocsSearchTime": 35,
            "ReRankSearchTime": "oops",
            "response": {"docs": [{"id": "1/a/2", "d": "3.5"}]}
        }))
        .unwrap();
        assert_eq!(parsed.raw_docs_count, 1200);
        assert_eq!(parsed.raw_docs_search_time, 35);
        assert_eq!(parsed.rerank_search_time, 0);
        assert_eq!(parsed.response.docs[0].d, 3.5);
        assert!(parsed.error_message().is_none());
    }

    #[test]
    fn test_embedded_error_message() {
        let parsed: ShardResponse =
            serde_json::from_value(json!({"Error": "index corrupted"})).unwrap();
        assert_eq!(parsed.error_message().as_deref(), Some("index corrupted"));
        assert!(parsed.response.docs.is_empty());
    }

    #[tokio::test]
    async fn test_query_sends_frame_and_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/solr/cl_0/lireq"))
            .and(query_param("field", "cl_ha"))
            .and(query_param("ms", "false"))
            .and(query_param("accuracy", "100"))
            .and(query_param("candidates", "1000000"))
            .and(query_param("rows", "30"))
            .and(query_param("fq", "id:21034/*"))
            .and(body_bytes(b"jpeg".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "RawDocsCount": 4,
                "RawDocsSearchTime": 10,
                "ReRankSearchTime": 2,
                "response": {"docs": [{"id": "21034/ep1.mp4/12.5", "d": 4.2}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (client, shard) = client(&server);
        let query = ShardQuery {
            candidates: 1_000_000,
            media_filter: Some(21034),
        };
        match client.query(&shard, Bytes::from_static(b"jpeg"), query).await {
            ShardReply::Ok(body) => {
                assert_eq!(body.raw_docs_count, 4);
                assert_eq!(body.response.docs[0].id, "21034/ep1.mp4/12.5");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_without_filter_omits_fq() {
        let server = MockServer::start().await;
        let (client, shard) = client(&server);
        let url = client.query_url(
            &shard,
            ShardQuery {
                candidates: 10,
                media_filter: None,
            },
        );
        assert!(url.ends_with("/solr/cl_0/lireq?field=cl_ha&ms=false&accuracy=100&candidates=10&rows=30"));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(504))
            .mount(&server)
            .await;

        let (client, shard) = client(&server);
        let query = ShardQuery {
            candidates: 1,
            media_filter: None,
        };
        assert!(matches!(
            client.query(&shard, Bytes::new(), query).await,
            ShardReply::Status(504)
        ));
    }

    #[tokio::test]
    async fn test_unparseable_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let (client, shard) = client(&server);
        let query = ShardQuery {
            candidates: 1,
            media_filter: None,
        };
        assert!(matches!(
            client.query(&shard, Bytes::new(), query).await,
            ShardReply::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_shard() {
        let shard = ShardTarget::new("http://127.0.0.1:9/solr/cl_0");
        let client = HttpShardClient::new(ShardClientConfig {
            shards: vec![shard.clone()],
            handler: "lireq".to_string(),
            accuracy: 100,
            rows: 30,
            timeout: Duration::from_millis(500),
        })
        .unwrap();
        let query = ShardQuery {
            candidates: 1,
            media_filter: None,
        };
        assert!(matches!(
            client.query(&shard, Bytes::new(), query).await,
            ShardReply::Unreachable(_)
        ));
    }
}
