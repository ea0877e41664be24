use crate::data_model::{ClaimToken, Document};
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::query::Query;
use crate::server::{
    ArtifactResponse, ClaimRef, ClaimResponse, DeployResponse, ErrorBody, HeartbeatResponse,
    IdRequest, InsertResponse,
};
use crate::status::PipelineStatus;
use crate::store::{AttachmentInfo, CommitReceipt};
use crate::utils::backoff_delay;
use crate::utils::prometheus_metrics::WORKER_PROTOCOL_RETRIES_TOTAL;
use reqwest::{header, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Client side of the coordination protocol.
///
/// Transient failures (connection errors, timeouts, 503) are retried with
/// exponential backoff and jitter up to `max_attempts`; everything else is
/// returned to the caller immediately.
#[derive(Debug, Clone)]
pub struct RemotePipeline {
    http: reqwest::Client,
    base_url: String,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl RemotePipeline {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(RemotePipeline {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_attempts: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, base: Duration, max: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `/documents/<id>/files[/<name>]` with both parts escaped as single path segments.
    fn files_url(&self, id: &str, name: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| PipelineError::ConfigError(format!("Invalid node URL: {}", e)))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                PipelineError::ConfigError(format!("Node URL '{}' cannot carry a path", self.base_url))
            })?;
            segments.pop_if_empty().push("documents").push(id).push("files");
            if let Some(name) = name {
                segments.push(name);
            }
        }
        Ok(url)
    }

    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(PipelineError::from_wire(&body.kind, body.error)),
            Err(_) if status == StatusCode::SERVICE_UNAVAILABLE => {
                Err(PipelineError::StoreUnavailable(text))
            }
            Err(_) => Err(PipelineError::ProtocolError(format!(
                "HTTP {}: {}",
                status, text
            ))),
        }
    }

    async fn execute<F>(&self, what: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match build().send().await {
                Ok(resp) => Self::check(resp).await,
                Err(e) => Err(PipelineError::from(e)),
            };
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = backoff_delay(attempt, self.backoff_base, self.backoff_max);
                    WORKER_PROTOCOL_RETRIES_TOTAL.inc();
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed. Retrying...",
                        what
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn json<T: DeserializeOwned, F>(&self, what: &str, build: F) -> Result<T>
    where
        F: Fn() -> RequestBuilder,
    {
        let resp = self.execute(what, build).await?;
        resp.json::<T>()
            .await
            .map_err(|e| PipelineError::ProtocolError(format!("{}: bad response body: {}", what, e)))
    }

    /// `Ok(None)` on 404 instead of an error.
    async fn json_opt<T: DeserializeOwned, F>(&self, what: &str, build: F) -> Result<Option<T>>
    where
        F: Fn() -> RequestBuilder,
    {
        match self.json(what, build).await {
            Ok(v) => Ok(Some(v)),
            Err(PipelineError::DocumentNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // --- Stage-scoped calls ---

    pub async fn claim(&self, stage: &str, query: &Query) -> Result<Option<Document>> {
        let resp: ClaimResponse = self
            .json("claim", || {
                self.http
                    .post(self.url("/documents/claim"))
                    .query(&[("stage", stage)])
                    .json(query)
            })
            .await?;
        if let Some(doc) = &resp.document {
            debug!(doc_id = %doc.id, stage = %stage, "Claimed document");
        }
        Ok(resp.document)
    }

    /// Claims fresh work first, then documents this stage last claimed at least `interval` ago.
    pub async fn claim_recurring(
        &self,
        stage: &str,
        query: &Query,
        interval: Duration,
    ) -> Result<Option<Document>> {
        let interval_ms = interval.as_millis().to_string();
        let resp: ClaimResponse = self
            .json("recurring claim", || {
                self.http
                    .post(self.url("/documents/claim"))
                    .query(&[("stage", stage), ("recurring_interval_ms", interval_ms.as_str())])
                    .json(query)
            })
            .await?;
        Ok(resp.document)
    }

    /// Stores the contents of `doc` without ending the claim it carries.
    pub async fn write_partial(&self, stage: &str, doc: &Document) -> Result<()> {
        self.execute("partial write", || {
            self.http
                .post(self.url("/documents/write"))
                .query(&[("stage", stage)])
                .json(doc)
        })
        .await?;
        Ok(())
    }

    pub async fn mark_pending(&self, stage: &str, id: &str, token: ClaimToken) -> Result<()> {
        let body = ClaimRef {
            id: id.to_string(),
            token,
        };
        self.execute("mark pending", || {
            self.http
                .post(self.url("/documents/pending"))
                .query(&[("stage", stage)])
                .json(&body)
        })
        .await?;
        Ok(())
    }

    pub async fn commit(&self, stage: &str, doc: &Document) -> Result<CommitReceipt> {
        self.json("commit", || {
            self.http
                .post(self.url("/documents/commit"))
                .query(&[("stage", stage)])
                .json(doc)
        })
        .await
    }

    pub async fn release(&self, stage: &str, id: &str, token: ClaimToken) -> Result<()> {
        let body = ClaimRef {
            id: id.to_string(),
            token,
        };
        self.execute("release", || {
            self.http
                .post(self.url("/documents/release"))
                .query(&[("stage", stage)])
                .json(&body)
        })
        .await?;
        Ok(())
    }

    pub async fn touch(&self, stage: &str, id: &str) -> Result<()> {
        let body = IdRequest { id: id.to_string() };
        self.execute("touch", || {
            self.http
                .post(self.url("/documents/touch"))
                .query(&[("stage", stage)])
                .json(&body)
        })
        .await?;
        Ok(())
    }

    pub async fn discard(&self, stage: &str, doc: &Document) -> Result<()> {
        self.execute("discard", || {
            self.http
                .post(self.url("/documents/discard"))
                .query(&[("stage", stage)])
                .json(doc)
        })
        .await?;
        Ok(())
    }

    pub async fn fail(&self, stage: &str, doc: &Document) -> Result<()> {
        self.execute("fail", || {
            self.http
                .post(self.url("/documents/fail"))
                .query(&[("stage", stage)])
                .json(doc)
        })
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, stage: &str) -> Result<HeartbeatResponse> {
        self.json("heartbeat", || {
            self.http
                .post(self.url("/heartbeat"))
                .query(&[("stage", stage)])
        })
        .await
    }

    pub async fn stage_properties(&self, stage: &str) -> Result<Map<String, Value>> {
        self.json("stage properties", || {
            self.http
                .get(self.url(&format!("/stages/{}/properties", stage)))
        })
        .await
    }

    // --- Documents, artifacts, pipeline ---

    pub async fn insert(&self, doc: &Document) -> Result<String> {
        let resp: InsertResponse = self
            .json("insert", || self.http.post(self.url("/documents")).json(doc))
            .await?;
        Ok(resp.id)
    }

    pub async fn query(&self, query: &Query, limit: usize, skip: usize) -> Result<Vec<Document>> {
        self.json("query", || {
            self.http
                .post(self.url("/documents/query"))
                .query(&[("limit", limit), ("skip", skip)])
                .json(query)
        })
        .await
    }

    pub async fn get_document(&self, id: &str, include_archived: bool) -> Result<Option<Document>> {
        self.json_opt("get document", || {
            self.http
                .get(self.url(&format!("/documents/{}", id)))
                .query(&[("include_archived", include_archived)])
        })
        .await
    }

    pub async fn upload_artifact(&self, bytes: Vec<u8>) -> Result<String> {
        let resp: ArtifactResponse = self
            .json("upload artifact", || {
                self.http.post(self.url("/artifacts")).body(bytes.clone())
            })
            .await?;
        Ok(resp.id)
    }

    pub async fn fetch_artifact(&self, id: &str) -> Result<Vec<u8>> {
        let resp = self
            .execute("fetch artifact", || {
                self.http.get(self.url(&format!("/artifacts/{}", id)))
            })
            .await?;
        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }

    pub async fn put_attachment(
        &self,
        stage: &str,
        id: &str,
        name: &str,
        bytes: Vec<u8>,
        mimetype: Option<&str>,
    ) -> Result<AttachmentInfo> {
        let url = self.files_url(id, Some(name))?;
        self.json("put attachment", || {
            let req = self
                .http
                .put(url.clone())
                .query(&[("stage", stage)])
                .body(bytes.clone());
            match mimetype {
                Some(m) => req.header(header::CONTENT_TYPE, m),
                None => req,
            }
        })
        .await
    }

    pub async fn attachments(&self, id: &str) -> Result<Vec<AttachmentInfo>> {
        let url = self.files_url(id, None)?;
        self.json("list attachments", || self.http.get(url.clone()))
            .await
    }

    pub async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>> {
        let url = self.files_url(id, Some(name))?;
        let resp = self
            .execute("get attachment", || self.http.get(url.clone()))
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    pub async fn delete_attachment(&self, stage: &str, id: &str, name: &str) -> Result<()> {
        let url = self.files_url(id, Some(name))?;
        self.execute("delete attachment", || {
            self.http.delete(url.clone()).query(&[("stage", stage)])
        })
        .await?;
        Ok(())
    }

    pub async fn pipeline(&self) -> Result<Option<Pipeline>> {
        self.json_opt("get pipeline", || self.http.get(self.url("/pipeline")))
            .await
    }

    pub async fn deploy_pipeline(&self, pipeline: &Pipeline) -> Result<u64> {
        let resp: DeployResponse = self
            .json("deploy pipeline", || {
                self.http.put(self.url("/pipeline")).json(pipeline)
            })
            .await?;
        Ok(resp.version)
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        self.json("status", || self.http.get(self.url("/status")))
            .await
    }
}
