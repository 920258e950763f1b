//! Concurrent file uploads with per-file progress.

use crate::model::{SessionSeed, UploadEvent};
use crate::service::{AnalysisService, ProgressFn, ServiceError, UploadFile};
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tokio::sync::mpsc::UnboundedSender;

/// In-flight progress stops here; 100 is reserved for a confirmed success.
const MAX_IN_FLIGHT_PERCENT: u8 = 99;

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Pending,
    Succeeded(SessionSeed),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    pub name: String,
    pub progress_percent: u8,
    pub outcome: UploadOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAggregate {
    AllSucceeded,
    PartialFailure,
    AllFailed,
}

/// Result of one `submit` call, one task per file in submission order.
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub tasks: Vec<UploadTask>,
}

impl UploadReport {
    pub fn aggregate(&self) -> UploadAggregate {
        let ok = self.seeds().count();
        match ok {
            0 => UploadAggregate::AllFailed,
            n if n == self.tasks.len() => UploadAggregate::AllSucceeded,
            _ => UploadAggregate::PartialFailure,
        }
    }

    pub fn seeds(&self) -> impl Iterator<Item = &SessionSeed> {
        self.tasks.iter().filter_map(|t| match &t.outcome {
            UploadOutcome::Succeeded(seed) => Some(seed),
            _ => None,
        })
    }

    /// `(file name, reason)` for every failed transfer.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tasks.iter().filter_map(|t| match &t.outcome {
            UploadOutcome::Failed(reason) => Some((t.name.as_str(), reason.as_str())),
            _ => None,
        })
    }
}

/// Human-readable reason for a failed transfer.
pub fn failure_reason(e: &ServiceError) -> String {
    match e {
        ServiceError::Rejected {
            detail: Some(d), ..
        } => d.clone(),
        ServiceError::Rejected { status, .. } => format!("Upload failed (HTTP {status})"),
        ServiceError::Malformed(_) => "Upload failed: unexpected response from the service".into(),
        ServiceError::Transport(_) | ServiceError::Timeout => {
            "Network error: could not reach the analysis service".into()
        }
    }
}

/// Keeps one file's reported progress monotonic.
struct ProgressGauge {
    total: u64,
    last: AtomicU8,
}

impl ProgressGauge {
    fn new(total: u64) -> Self {
        Self {
            total,
            last: AtomicU8::new(0),
        }
    }

    /// Returns the new percentage if it moved forward.
    fn advance(&self, sent: u64) -> Option<u8> {
        let pct = if self.total == 0 {
            MAX_IN_FLIGHT_PERCENT
        } else {
            ((sent.min(self.total) * 100) / self.total).min(MAX_IN_FLIGHT_PERCENT as u64) as u8
        };
        let prev = self.last.fetch_max(pct, Ordering::Relaxed);
        (pct > prev).then_some(pct)
    }

    fn complete(&self) {
        self.last.store(100, Ordering::Relaxed);
    }

    fn current(&self) -> u8 {
        self.last.load(Ordering::Relaxed)
    }
}

pub struct UploadTracker {
    service: Arc<dyn AnalysisService>,
    event_tx: Option<UnboundedSender<UploadEvent>>,
}

impl UploadTracker {
    pub fn new(service: Arc<dyn AnalysisService>) -> Self {
        Self {
            service,
            event_tx: None,
        }
    }

    /// Stream progress and completion events to `tx` while uploads run.
    pub fn with_events(mut self, tx: UnboundedSender<UploadEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Upload every file concurrently; one failure never aborts the others.
    pub async fn submit(&self, files: Vec<UploadFile>) -> UploadReport {
        let mut handles = Vec::with_capacity(files.len());
        let mut names = Vec::with_capacity(files.len());

        for (index, file) in files.into_iter().enumerate() {
            let service = self.service.clone();
            let event_tx = self.event_tx.clone();
            let gauge = Arc::new(ProgressGauge::new(file.len()));
            names.push(file.name.clone());

            let gauge2 = gauge.clone();
            let progress_tx = event_tx.clone();
            let progress_name = file.name.clone();
            let progress: ProgressFn = Arc::new(move |sent: u64| {
                if let (Some(pct), Some(tx)) = (gauge2.advance(sent), progress_tx.as_ref()) {
                    let _ = tx.send(UploadEvent::Progress {
                        index,
                        name: progress_name.clone(),
                        percent: pct,
                    });
                }
            });

            handles.push(tokio::spawn(async move {
                let res = service.upload_file(&file, progress).await;
                if res.is_ok() {
                    gauge.complete();
                    if let Some(tx) = event_tx.as_ref() {
                        let _ = tx.send(UploadEvent::Progress {
                            index,
                            name: file.name.clone(),
                            percent: 100,
                        });
                    }
                }
                if let Some(tx) = event_tx.as_ref() {
                    let _ = tx.send(UploadEvent::Finished {
                        index,
                        name: file.name.clone(),
                        ok: res.is_ok(),
                    });
                }
                (res, gauge.current())
            }));
        }

        let mut tasks = Vec::with_capacity(handles.len());
        for (handle, name) in handles.into_iter().zip(names) {
            let task = match handle.await {
                Ok((Ok(seed), pct)) => {
                    tracing::info!(file = %name, file_id = %seed.file_id, readiness = ?seed.readiness, "upload succeeded");
                    UploadTask {
                        name,
                        progress_percent: pct,
                        outcome: UploadOutcome::Succeeded(seed),
                    }
                }
                Ok((Err(e), pct)) => {
                    tracing::warn!(file = %name, error = %e, "upload failed");
                    UploadTask {
                        name,
                        progress_percent: pct,
                        outcome: UploadOutcome::Failed(failure_reason(&e)),
                    }
                }
                Err(e) => UploadTask {
                    name,
                    progress_percent: 0,
                    outcome: UploadOutcome::Failed(format!("Upload task failed: {e}")),
                },
            };
            tasks.push(task);
        }

        UploadReport { tasks }
    }
}
