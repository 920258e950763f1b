//! Readiness polling for one uploaded file.
//!
//! A timer fires every `poll_interval`; each fire issues one status query and the
//! loop awaits it before looking at the timer again, so queries never overlap.
//! Ticks missed while a query is slow are skipped, not queued.

use crate::model::ClientConfig;
use crate::service::{AnalysisService, ServiceError};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Ready,
    Failed,
    Cancelled,
}

/// Terminal notification, delivered at most once per poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Ready { total_rows: Option<u64> },
    Failed { attempts: u32, last_error: String },
}

pub struct ReadinessPoller {
    service: Arc<dyn AnalysisService>,
    file_id: String,
    interval: Duration,
    timeout: Duration,
    retry_budget: u32,
}

/// Handle to a running poll. Dropping it cancels the poll.
pub struct PollHandle {
    file_id: String,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<PollState>>,
}

impl PollHandle {
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop polling. No outcome is delivered after this returns.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.as_ref() {
            h.abort();
        }
    }

    /// Wait for the poll task and return the state it ended in.
    pub async fn join(mut self) -> PollState {
        match self.handle.take() {
            Some(h) => h.await.unwrap_or(PollState::Cancelled),
            None => PollState::Idle,
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        // Dropping a JoinHandle does not stop the task; abort it explicitly.
        self.cancel();
    }
}

impl ReadinessPoller {
    pub fn new(service: Arc<dyn AnalysisService>, file_id: impl Into<String>, cfg: &ClientConfig) -> Self {
        Self {
            service,
            file_id: file_id.into(),
            interval: cfg.poll_interval.max(Duration::from_millis(1)),
            timeout: cfg.request_timeout,
            retry_budget: cfg.poll_retry_budget,
        }
    }

    /// Start polling in the background. `on_outcome` runs at most once, and never
    /// after the returned handle has been cancelled.
    pub fn spawn<F>(self, on_outcome: F) -> PollHandle
    where
        F: FnOnce(PollOutcome) + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel2 = cancel.clone();
        let file_id = self.file_id.clone();
        let handle = tokio::spawn(async move {
            let (state, outcome) = self.run(&cancel2).await;
            if let Some(outcome) = outcome {
                if !cancel2.load(Ordering::Relaxed) {
                    on_outcome(outcome);
                }
            }
            state
        });
        PollHandle {
            file_id,
            cancel,
            handle: Some(handle),
        }
    }

    async fn run(self, cancel: &AtomicBool) -> (PollState, Option<PollOutcome>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = 0u32;

        tracing::debug!(file_id = %self.file_id, interval = ?self.interval, "polling for readiness");
        loop {
            ticker.tick().await;
            if cancel.load(Ordering::Relaxed) {
                return (PollState::Cancelled, None);
            }

            let res = tokio::time::timeout(self.timeout, self.service.list_file_statuses())
                .await
                .unwrap_or(Err(ServiceError::Timeout));
            if cancel.load(Ordering::Relaxed) {
                return (PollState::Cancelled, None);
            }

            match res {
                Ok(files) => {
                    failures = 0;
                    let done = files
                        .into_iter()
                        .find(|f| f.file_id == self.file_id && f.processed);
                    if let Some(file) = done {
                        tracing::info!(file_id = %self.file_id, total_rows = ?file.total_rows, "analysis complete");
                        return (
                            PollState::Ready,
                            Some(PollOutcome::Ready {
                                total_rows: file.total_rows,
                            }),
                        );
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.retry_budget {
                        tracing::warn!(file_id = %self.file_id, attempts = failures, error = %e, "giving up on status polling");
                        return (
                            PollState::Failed,
                            Some(PollOutcome::Failed {
                                attempts: failures,
                                last_error: e.to_string(),
                            }),
                        );
                    }
                    tracing::warn!(file_id = %self.file_id, attempt = failures, error = %e, "status query failed, retrying");
                }
            }
        }
    }
}
