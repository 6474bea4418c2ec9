//! Search endpoint
//!
//! `GET|POST /search?url=&key=&uid=&anilistID=&cutBorders&anilistInfo`
//!
//! The query image is either the raw request body or fetched from `url`.
//! `cutBorders` and `anilistInfo` are presence flags.

use axum::{
    extract::{ConnectInfo, Query, State},
    http::HeaderMap,
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::admission::AdmissionRequest;
use crate::error::SearchError;
use crate::orchestrator::SearchResult;
use crate::service::SearchInput;
use crate::AppState;

/// Header carrying the API key when it is not in the query string
pub const API_KEY_HEADER: &str = "x-trace-key";

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub url: Option<String>,
    pub key: Option<String>,
    pub uid: Option<String>,
    #[serde(rename = "anilistID")]
    pub anilist_id: Option<String>,
    #[serde(rename = "cutBorders")]
    pub cut_borders: Option<String>,
    #[serde(rename = "anilistInfo")]
    pub anilist_info: Option<String>,
}

impl SearchParams {
    /// Media filter; absent, zero and non-numeric values mean no filter
    pub fn media_filter(&self) -> Option<u64> {
        self.anilist_id
            .as_deref()
            .and_then(|id| id.trim().parse::<u64>().ok())
            .filter(|id| *id > 0)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub frame_count: u64,
    pub error: String,
    pub result: Vec<SearchResult>,
}

/// First `x-forwarded-for` hop, else the socket peer
fn client_addr(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// GET|POST /search
pub async fn search(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
    body: Bytes,
) -> Result<Json<SearchResponse>, SearchError> {
    let api_key = params.key.clone().or_else(|| {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let input = SearchInput {
        identity: AdmissionRequest {
            api_key,
            uid: params.uid.clone(),
            client_addr: client_addr(&headers, connect_info.map(|ConnectInfo(addr)| addr)),
        },
        image_url: params.url.clone(),
        upload: (!body.is_empty()).then_some(body),
        media_filter: params.media_filter(),
        cut_borders: params.cut_borders.is_some(),
        enrich: params.anilist_info.is_some(),
    };

    let outcome = state.service.handle(input).await?;
    Ok(Json(SearchResponse {
        frame_count: outcome.frame_count,
        error: String::new(),
        result: outcome.results,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_media_filter_parsing() {
        let mut params = SearchParams::default();
        assert_eq!(params.media_filter(), None);

        params.anilist_id = Some("21034".to_string());
        assert_eq!(params.media_filter(), Some(21034));

        params.anilist_id = Some("0".to_string());
        assert_eq!(params.media_filter(), None);

        params.anilist_id = Some("abc".to_string());
        assert_eq!(params.media_filter(), None);
    }

    #[test]
    fn test_client_addr_prefers_forwarded_header() {
        let peer: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_addr(&headers, Some(peer)), "10.0.0.2");
        assert_eq!(client_addr(&headers, None), "unknown");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_addr(&headers, Some(peer)), "203.0.113.7");
    }
}
