//! Request pipeline: admission, frame acquisition, search, release
//!
//! Once admitted, every outcome (success or error) is handed back to the
//! permit so the counters are released and exactly one log row is written.

use crate::admission::{AdmissionController, AdmissionRequest};
use crate::error::SearchError;
use crate::fetch::ImageFetcher;
use crate::frame::{BorderCropper, FrameExtractor};
use crate::orchestrator::{SearchOrchestrator, SearchOutcome, SearchRequest};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the HTTP layer extracted from one search request
#[derive(Debug, Clone, Default)]
pub struct SearchInput {
    pub identity: AdmissionRequest,
    pub image_url: Option<String>,
    pub upload: Option<Bytes>,
    pub media_filter: Option<u64>,
    pub cut_borders: bool,
    pub enrich: bool,
}

pub struct SearchService {
    admission: AdmissionController,
    fetcher: ImageFetcher,
    extractor: Arc<dyn FrameExtractor>,
    cropper: Arc<dyn BorderCropper>,
    orchestrator: SearchOrchestrator,
}

impl SearchService {
    pub fn new(
        admission: AdmissionController,
        fetcher: ImageFetcher,
        extractor: Arc<dyn FrameExtractor>,
        cropper: Arc<dyn BorderCropper>,
        orchestrator: SearchOrchestrator,
    ) -> Self {
        Self {
            admission,
            fetcher,
            extractor,
            cropper,
            orchestrator,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub async fn handle(&self, input: SearchInput) -> Result<SearchOutcome, SearchError> {
        let permit = self.admission.admit(&input.identity).await?;
        let uid = permit.account().uid.clone();

        match self.run(&input).await {
            Ok(outcome) => {
                info!(
                    uid = %uid,
                    frame_count = outcome.frame_count,
                    results = outcome.results.len(),
                    search_time_ms = outcome.search_time_ms,
                    "Search completed"
                );
                permit.finish(200, Some(outcome.search_time_ms)).await;
                Ok(outcome)
            }
            Err(err) => {
                info!(uid = %uid, status = err.log_status(), "Search failed: {}", err);
                permit.finish(err.log_status(), None).await;
                Err(err)
            }
        }
    }

    async fn run(&self, input: &SearchInput) -> Result<SearchOutcome, SearchError> {
        let media = self.acquire_media(input).await?;
        let mut frame = self.extractor.extract(media).await?;
        if input.cut_borders {
            frame = self.cropper.crop_borders(frame).await?;
        }
        debug!(frame_bytes = frame.len(), "Query frame ready");

        self.orchestrator
            .search(&SearchRequest {
                frame,
                media_filter: input.media_filter,
                enrich: input.enrich,
            })
            .await
    }

    /// The image URL takes precedence over an uploaded body
    async fn acquire_media(&self, input: &SearchInput) -> Result<Bytes, SearchError> {
        if let Some(url) = input.image_url.as_deref().filter(|u| !u.is_empty()) {
            return self.fetcher.fetch(url).await;
        }
        match &input.upload {
            Some(body) if !body.is_empty() => Ok(body.clone()),
            _ => Err(SearchError::MethodNotAllowed),
        }
    }
}
