//! Fan-out search across the shard cluster
//!
//! One search is one or two query rounds. Every round queries all shards
//! concurrently and waits for all of them. When a shard reports more raw
//! candidates than the round's budget, the query is reissued exactly once
//! with the budget raised to that count; the second round is final.

use crate::enrichment::MetadataEnricher;
use crate::error::SearchError;
use crate::merge::{merge_hits, top_matches, Hit};
use crate::shard_client::{ShardClient, ShardQuery, ShardReply, ShardResponse};
use crate::signing::{MediaKind, MediaSigner};
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub initial_candidates: u64,
    pub merge_window_secs: f64,
    pub top_k: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            initial_candidates: 1_000_000,
            merge_window_secs: 5.0,
            top_k: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Normalized query frame
    pub frame: Bytes,
    /// Restrict matches to one media id
    pub media_filter: Option<u64>,
    /// Replace media ids with metadata objects when available
    pub enrich: bool,
}

/// One scene match in the response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Media id, or its metadata object after enrichment
    pub anilist: Value,
    pub filename: String,
    pub episode: String,
    pub from: f64,
    pub to: f64,
    pub similarity: f64,
    pub video: String,
    pub image: String,
    #[serde(skip)]
    pub media_id: u64,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// Raw candidates summed over the shards of the final round
    pub frame_count: u64,
    /// First fan-out to end of the last round
    pub search_time_ms: u64,
    pub results: Vec<SearchResult>,
}

pub struct SearchOrchestrator {
    shards: Arc<dyn ShardClient>,
    signer: MediaSigner,
    enricher: Option<Arc<dyn MetadataEnricher>>,
    config: OrchestratorConfig,
}

impl SearchOrchestrator {
    pub fn new(
        shards: Arc<dyn ShardClient>,
        signer: MediaSigner,
        enricher: Option<Arc<dyn MetadataEnricher>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            shards,
            signer,
            enricher,
            config,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome, SearchError> {
        let started = Instant::now();
        let mut query = ShardQuery {
            candidates: self.config.initial_candidates,
            media_filter: request.media_filter,
        };

        let mut responses = self.round(&request.frame, query).await?;
        let max_raw = responses.iter().map(|r| r.raw_docs_count).max().unwrap_or(0);
        if max_raw > query.candidates {
            info!(
                budget = query.candidates,
                raw_docs = max_raw,
                "Candidate cluster larger than budget, searching again"
            );
            query.candidates = max_raw;
            responses = self.round(&request.frame, query).await?;
        }
        let search_time_ms = started.elapsed().as_millis() as u64;

        if let Some(message) = responses.iter().find_map(ShardResponse::error_message) {
            error!(error = %message, "Shard reported an error");
            return Err(SearchError::UpstreamLogicError(message));
        }

        let frame_count: u64 = responses.iter().map(|r| r.raw_docs_count).sum();
        let raw_docs_search_time: u64 = responses.iter().map(|r| r.raw_docs_search_time).sum();
        let rerank_search_time: u64 = responses.iter().map(|r| r.rerank_search_time).sum();
        debug!(
            frame_count,
            raw_docs_search_time,
            rerank_search_time,
            search_time_ms,
            "Shard rounds complete"
        );

        let hits = responses
            .into_iter()
            .flat_map(|r| r.response.docs)
            .filter_map(|doc| {
                let hit = Hit::parse(&doc.id, doc.d);
                if hit.is_none() {
                    warn!(id = %doc.id, "Skipping document with unparseable id");
                }
                hit
            });
        let clusters = top_matches(
            merge_hits(hits, self.config.merge_window_secs),
            self.config.top_k,
        );

        let mut results: Vec<SearchResult> = clusters
            .into_iter()
            .map(|cluster| {
                let anchor = cluster.midpoint();
                trace!(
                    media_id = cluster.media_id,
                    file = %cluster.file_id,
                    from = cluster.from,
                    to = cluster.to,
                    best_frame = cluster.anchor_time,
                    distance = cluster.distance,
                    "Match"
                );
                SearchResult {
                    anilist: Value::from(cluster.media_id),
                    video: self.signer.link(MediaKind::Video, cluster.media_id, &cluster.file_id, anchor),
                    image: self.signer.link(MediaKind::Image, cluster.media_id, &cluster.file_id, anchor),
                    episode: cluster.file_id.clone(),
                    filename: cluster.file_id,
                    from: cluster.from,
                    to: cluster.to,
                    similarity: (100.0 - cluster.distance) / 100.0,
                    media_id: cluster.media_id,
                }
            })
            .collect();

        if request.enrich {
            self.enrich(&mut results).await;
        }

        Ok(SearchOutcome {
            frame_count,
            search_time_ms,
            results,
        })
    }

    async fn round(&self, frame: &Bytes, query: ShardQuery) -> Result<Vec<ShardResponse>, SearchError> {
        let shards = self.shards.shards();
        let replies = join_all(
            shards
                .iter()
                .map(|shard| self.shards.query(shard, frame.clone(), query)),
        )
        .await;
        check_round(replies)
    }

    async fn enrich(&self, results: &mut [SearchResult]) {
        let Some(enricher) = &self.enricher else {
            return;
        };

        let mut ids: Vec<u64> = results.iter().map(|r| r.media_id).collect();
        ids.sort_unstable();
        ids.dedup();

        if let Some(found) = enricher.enrich(&ids).await {
            for result in results.iter_mut() {
                if let Some(meta) = found.get(&result.media_id) {
                    result.anilist = meta.clone();
                }
            }
        }
    }
}

/// Reduce one round of replies to its responses or the error that aborts it
///
/// A 5xx status wins over a missing reply, which wins over other failures.
pub fn check_round(replies: Vec<ShardReply>) -> Result<Vec<ShardResponse>, SearchError> {
    let server_error = replies.iter().find_map(|reply| match reply {
        ShardReply::Status(code) if *code >= 500 => Some(*code),
        _ => None,
    });
    if let Some(code) = server_error {
        warn!(status = code, "Shard returned server error");
        return Err(if code == 504 {
            SearchError::UpstreamOverloaded
        } else {
            SearchError::UpstreamDown { status: code }
        });
    }

    let mut responses = Vec::with_capacity(replies.len());
    let mut failure = None;
    for reply in replies {
        match reply {
            ShardReply::Ok(body) => responses.push(body),
            ShardReply::Unreachable(reason) => {
                warn!(reason = %reason, "Shard did not respond");
                return Err(SearchError::UpstreamDown { status: 503 });
            }
            ShardReply::Status(code) => {
                failure.get_or_insert_with(|| format!("Database returned HTTP {}", code));
            }
            ShardReply::Malformed(reason) => {
                failure.get_or_insert_with(|| format!("Database returned an unreadable reply: {}", reason));
            }
        }
    }

    match failure {
        Some(message) => Err(SearchError::UpstreamLogicError(message)),
        None => Ok(responses),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard_client::{ShardDoc, ShardDocs};
    use async_trait::async_trait;
    use serde_json::json;
    use sola_common::ShardTarget;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Script = Box<dyn Fn(usize, ShardQuery) -> ShardReply + Send + Sync>;

    struct ScriptedShards {
        shards: Vec<ShardTarget>,
        script: Script,
        calls: Mutex<Vec<(usize, ShardQuery)>>,
    }

    impl ScriptedShards {
        fn new(count: usize, script: impl Fn(usize, ShardQuery) -> ShardReply + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                shards: (0..count)
                    .map(|i| ShardTarget::new(format!("http://shard-{}/solr/cl_{}", i, i)))
                    .collect(),
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(usize, ShardQuery)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ShardClient for ScriptedShards {
        fn shards(&self) -> &[ShardTarget] {
            &self.shards
        }

        async fn query(&self, shard: &ShardTarget, _frame: Bytes, query: ShardQuery) -> ShardReply {
            let index = self.shards.iter().position(|s| s == shard).unwrap();
            self.calls.lock().unwrap().push((index, query));
            (self.script)(index, query)
        }
    }

    struct FixedEnricher(Option<HashMap<u64, Value>>);

    #[async_trait]
    impl MetadataEnricher for FixedEnricher {
        async fn enrich(&self, _ids: &[u64]) -> Option<HashMap<u64, Value>> {
            self.0.clone()
        }
    }

    fn response(raw: u64, docs: &[(&str, f64)]) -> ShardReply {
        ShardReply::Ok(ShardResponse {
            raw_docs_count: raw,
            raw_docs_search_time: 10,
            rerank_search_time: 1,
            response: ShardDocs {
                docs: docs
                    .iter()
                    .map(|(id, d)| ShardDoc {
                        id: id.to_string(),
                        d: *d,
                    })
                    .collect(),
            },
            error: None,
        })
    }

    fn orchestrator(
        shards: Arc<ScriptedShards>,
        enricher: Option<Arc<dyn MetadataEnricher>>,
    ) -> SearchOrchestrator {
        SearchOrchestrator::new(
            shards,
            MediaSigner::new("https://media.example", "salt"),
            enricher,
            OrchestratorConfig::default(),
        )
    }

    fn request() -> SearchRequest {
        SearchRequest {
            frame: Bytes::from_static(b"frame"),
            media_filter: None,
            enrich: false,
        }
    }

    #[tokio::test]
    async fn test_overlapping_hits_become_one_result() {
        let shards = ScriptedShards::new(1, |_, _| {
            response(20, &[("1/a/10", 5.0), ("1/a/12", 3.0)])
        });
        let outcome = orchestrator(shards, None).search(&request()).await.unwrap();

        assert_eq!(outcome.results.len(), 1);
        let result = &outcome.results[0];
        assert_eq!(result.anilist, json!(1));
        assert_eq!(result.filename, "a");
        assert_eq!(result.episode, "a");
        assert_eq!((result.from, result.to), (10.0, 12.0));
        assert_eq!(result.similarity, 0.97);

        let signer = MediaSigner::new("https://media.example", "salt");
        assert_eq!(result.video, signer.link(MediaKind::Video, 1, "a", 11.0));
        assert_eq!(result.image, signer.link(MediaKind::Image, 1, "a", 11.0));
    }

    #[tokio::test]
    async fn test_results_aggregated_across_shards_and_limited() {
        let shards = ScriptedShards::new(2, |index, _| {
            let docs: Vec<(String, f64)> = (0..8)
                .map(|i| (format!("{}/ep{}/{}", index + 1, i, i * 100), (index * 10 + i) as f64))
                .collect();
            let docs: Vec<(&str, f64)> = docs.iter().map(|(id, d)| (id.as_str(), *d)).collect();
            response(100, &docs)
        });
        let outcome = orchestrator(shards, None).search(&request()).await.unwrap();

        assert_eq!(outcome.frame_count, 200);
        assert_eq!(outcome.results.len(), 10);
        assert!(outcome
            .results
            .windows(2)
            .all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn test_retries_exactly_once_with_raised_budget() {
        let shards = ScriptedShards::new(2, |index, query| match (index, query.candidates) {
            (0, 1_000_000) => response(2_500_000, &[]),
            (_, 1_000_000) => response(10, &[]),
            // still above the raised budget; must not trigger a third round
            (0, _) => response(3_000_000, &[("5/x/1", 1.0)]),
            _ => response(20, &[]),
        });
        let outcome = orchestrator(shards.clone(), None)
            .search(&request())
            .await
            .unwrap();

        let calls = shards.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[..2].iter().all(|(_, q)| q.candidates == 1_000_000));
        assert!(calls[2..].iter().all(|(_, q)| q.candidates == 2_500_000));
        assert_eq!(outcome.frame_count, 3_000_020);
        assert_eq!(outcome.results.len(), 1);
    }

    #[tokio::test]
    async fn test_no_retry_within_budget() {
        let shards = ScriptedShards::new(3, |_, _| response(1_000_000, &[]));
        orchestrator(shards.clone(), None)
            .search(&request())
            .await
            .unwrap();
        assert_eq!(shards.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_media_filter_forwarded() {
        let shards = ScriptedShards::new(1, |_, _| response(0, &[]));
        let mut req = request();
        req.media_filter = Some(21034);
        orchestrator(shards.clone(), None).search(&req).await.unwrap();
        assert_eq!(shards.calls()[0].1.media_filter, Some(21034));
    }

    #[tokio::test]
    async fn test_gateway_timeout_is_overloaded() {
        let shards = ScriptedShards::new(2, |index, _| {
            if index == 1 {
                ShardReply::Status(504)
            } else {
                response(1, &[])
            }
        });
        let err = orchestrator(shards, None).search(&request()).await.unwrap_err();
        assert!(matches!(err, SearchError::UpstreamOverloaded));
        assert_eq!(err.status_code(), 504);
        assert_eq!(err.to_string(), "Database is overloaded");
    }

    #[tokio::test]
    async fn test_other_server_error_is_down_with_shard_status() {
        let shards = ScriptedShards::new(1, |_, _| ShardReply::Status(502));
        let err = orchestrator(shards, None).search(&request()).await.unwrap_err();
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.to_string(), "Database is offline");
    }

    #[tokio::test]
    async fn test_unreachable_shard_is_down_503() {
        let shards = ScriptedShards::new(2, |index, _| {
            if index == 0 {
                ShardReply::Unreachable("connection refused".to_string())
            } else {
                response(1, &[])
            }
        });
        let err = orchestrator(shards, None).search(&request()).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_server_error_in_retry_round_aborts() {
        let shards = ScriptedShards::new(1, |_, query| {
            if query.candidates == 1_000_000 {
                response(5_000_000, &[])
            } else {
                ShardReply::Status(500)
            }
        });
        let err = orchestrator(shards, None).search(&request()).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(matches!(err, SearchError::UpstreamDown { status: 500 }));
    }

    #[tokio::test]
    async fn test_embedded_error_is_logic_error() {
        let shards = ScriptedShards::new(1, |_, _| {
            ShardReply::Ok(ShardResponse {
                error: Some(json!("too many clauses")),
                ..Default::default()
            })
        });
        let err = orchestrator(shards, None).search(&request()).await.unwrap_err();
        assert!(matches!(err, SearchError::UpstreamLogicError(ref m) if m == "too many clauses"));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_client_error_status_is_logic_error() {
        let shards = ScriptedShards::new(1, |_, _| ShardReply::Status(400));
        let err = orchestrator(shards, None).search(&request()).await.unwrap_err();
        assert!(matches!(err, SearchError::UpstreamLogicError(_)));
    }

    #[tokio::test]
    async fn test_enrichment_replaces_known_ids() {
        let shards = ScriptedShards::new(1, |_, _| {
            response(2, &[("21/ep1/10", 2.0), ("99/ep2/50", 4.0)])
        });
        let mut found = HashMap::new();
        found.insert(21, json!({"id": 21, "title": {"romaji": "One Piece"}}));
        let enricher: Arc<dyn MetadataEnricher> = Arc::new(FixedEnricher(Some(found)));

        let mut req = request();
        req.enrich = true;
        let outcome = orchestrator(shards, Some(enricher)).search(&req).await.unwrap();

        assert_eq!(outcome.results[0].anilist["title"]["romaji"], "One Piece");
        assert_eq!(outcome.results[1].anilist, json!(99));
    }

    #[tokio::test]
    async fn test_enrichment_failure_keeps_ids() {
        let shards = ScriptedShards::new(1, |_, _| response(1, &[("21/ep1/10", 2.0)]));
        let enricher: Arc<dyn MetadataEnricher> = Arc::new(FixedEnricher(None));

        let mut req = request();
        req.enrich = true;
        let outcome = orchestrator(shards, Some(enricher)).search(&req).await.unwrap();
        assert_eq!(outcome.results[0].anilist, json!(21));
    }

    #[test]
    fn test_result_serialization_shape() {
        let result = SearchResult {
            anilist: json!(1),
            filename: "a.mp4".to_string(),
            episode: "a.mp4".to_string(),
            from: 1.0,
            to: 2.0,
            similarity: 0.9,
            video: "v".to_string(),
            image: "i".to_string(),
            media_id: 1,
        };
        let value = serde_json::to_value(&result).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys.len(), 8);
        assert!(value.get("media_id").is_none());
    }
}
