use super::{AnalysisService, ProgressFn, ServiceError, UploadFile};
use crate::model::{ClientConfig, FileStatus, GroupingReply, GroupingResult, Readiness, SessionSeed};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chunk size for the upload body stream (64 KB)
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HttpService {
    http: reqwest::Client,
    base: Url,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file_id: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    total_rows: Option<u64>,
    #[serde(default)]
    processed: Option<bool>,
    #[serde(default)]
    status: Option<String>,
}

impl UploadResponse {
    fn into_seed(self, fallback_name: &str) -> SessionSeed {
        // Older servers only send `status`; "processing" means analysis continues in the background.
        let processed = self
            .processed
            .unwrap_or_else(|| self.status.as_deref() != Some("processing"));
        let readiness = if processed {
            Readiness::Ready
        } else {
            Readiness::Analyzing
        };
        SessionSeed {
            file_id: self.file_id,
            filename: self.filename.or_else(|| Some(fallback_name.to_string())),
            // A placeholder count of 0 is sent while analyzing; it is not a real total.
            total_rows: if processed { self.total_rows } else { None },
            summary: self.summary,
            readiness,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FilesResponse {
    files: Vec<FileStatus>,
}

#[derive(Debug, Serialize)]
struct GroupingRequest<'a> {
    file_id: &'a str,
    instructions: &'a str,
}

impl HttpService {
    pub fn new(cfg: &ClientConfig) -> Result<Self> {
        let mut base = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid service URL: {}", cfg.base_url))?;
        // Url::join drops the last path segment unless the base ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        // Only connects are capped client-wide; an upload may outlast `request_timeout`.
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.request_timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            http,
            base,
            request_timeout: cfg.request_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.base
            .join(path)
            .map_err(|e| ServiceError::Transport(format!("invalid endpoint {path}: {e}")))
    }
}

/// Pull the `detail` field out of an error body, whatever its JSON type.
fn extract_detail(body: &[u8]) -> Option<String> {
    let v: serde_json::Value = serde_json::from_slice(body).ok()?;
    match v.get("detail")? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ServiceError> {
    let status = resp.status();
    let body = resp.bytes().await.map_err(ServiceError::from_reqwest)?;
    if !status.is_success() {
        return Err(ServiceError::Rejected {
            status: status.as_u16(),
            detail: extract_detail(&body),
        });
    }
    serde_json::from_slice(&body).map_err(|e| ServiceError::Malformed(e.to_string()))
}

fn parse_grouping_reply(v: serde_json::Value) -> Result<GroupingReply, ServiceError> {
    if v.get("status").and_then(|s| s.as_str()) == Some("processing") {
        return Ok(GroupingReply::Processing);
    }
    serde_json::from_value::<GroupingResult>(v)
        .map(GroupingReply::Grouped)
        .map_err(|e| ServiceError::Malformed(e.to_string()))
}

#[async_trait]
impl AnalysisService for HttpService {
    async fn upload_file(
        &self,
        file: &UploadFile,
        progress: ProgressFn,
    ) -> Result<SessionSeed, ServiceError> {
        let url = self.endpoint("upload")?;
        let data = file.bytes.clone();
        let len = data.len();

        // Bytes are counted as chunks are produced for reqwest, which tracks what
        // has been handed to the wire closely enough for a progress display.
        let chunks = (0..len)
            .step_by(UPLOAD_CHUNK_SIZE)
            .map(move |start| data.slice(start..(start + UPLOAD_CHUNK_SIZE).min(len)));
        let mut sent = 0u64;
        let body_stream = stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            progress(sent);
            Ok::<Bytes, std::io::Error>(chunk)
        });

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(body_stream), len as u64)
            .file_name(file.name.clone());
        let form = Form::new().part("file", part);

        tracing::debug!(file = %file.name, bytes = len, "uploading");
        let resp = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let body: UploadResponse = read_json(resp).await?;
        Ok(body.into_seed(&file.name))
    }

    async fn list_file_statuses(&self) -> Result<Vec<FileStatus>, ServiceError> {
        let url = self.endpoint("files")?;
        let resp = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let body: FilesResponse = read_json(resp).await?;
        Ok(body.files)
    }

    async fn submit_grouping(
        &self,
        file_id: &str,
        instructions: &str,
    ) -> Result<GroupingReply, ServiceError> {
        let url = self.endpoint("group")?;
        tracing::debug!(file_id, "submitting grouping instructions");
        let resp = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(&GroupingRequest {
                file_id,
                instructions,
            })
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let body: serde_json::Value = read_json(resp).await?;
        parse_grouping_reply(body)
    }
}
