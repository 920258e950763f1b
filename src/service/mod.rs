//! Boundary to the remote analysis and grouping service.
//!
//! The session core only talks to [`AnalysisService`]; [`HttpService`] is the
//! production implementation over HTTP.

mod client;

pub use client::HttpService;

use crate::model::{FileStatus, GroupingReply, SessionSeed};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Callback receiving the cumulative number of body bytes handed to the transport.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// A file queued for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    /// The request never produced a response (connection refused, reset, DNS...).
    #[error("{0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    /// The service answered with a non-success status.
    #[error("service returned HTTP {status}{}", detail_suffix(.detail))]
    Rejected { status: u16, detail: Option<String> },

    /// The service answered, but not with anything we understand.
    #[error("malformed response: {0}")]
    Malformed(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
}

impl ServiceError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ServiceError::Timeout
        } else if e.is_decode() {
            ServiceError::Malformed(e.to_string())
        } else {
            ServiceError::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Transfer one file. `progress` is called as body bytes are produced.
    async fn upload_file(
        &self,
        file: &UploadFile,
        progress: ProgressFn,
    ) -> Result<SessionSeed, ServiceError>;

    /// Status of every file the service knows about; not filtered server-side.
    async fn list_file_statuses(&self) -> Result<Vec<FileStatus>, ServiceError>;

    async fn submit_grouping(
        &self,
        file_id: &str,
        instructions: &str,
    ) -> Result<GroupingReply, ServiceError>;
}
