//! Session lifecycle controller.
//!
//! Owns the active session, its transcript and groups. Background work (readiness
//! polling, grouping requests) reports back over one channel and every change is
//! applied here through `&mut self`, so transcript order is the order events are
//! processed. Each background task carries the epoch of the session that started
//! it; events from an older epoch are dropped.

use super::poller::{PollHandle, PollOutcome, PollState, ReadinessPoller};
use super::transcript::{self, Transcript};
use crate::model::{ClientConfig, Group, GroupingReply, Readiness, Role, SessionSeed};
use crate::prompt_store::PromptStore;
use crate::service::{AnalysisService, ServiceError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Live state for one uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    file_id: String,
    filename: Option<String>,
    summary: Option<String>,
    readiness: Readiness,
    total_rows: Option<u64>,
    transcript: Transcript,
    groups: Vec<Group>,
}

impl Session {
    fn from_seed(seed: SessionSeed) -> Self {
        let mut transcript = Transcript::default();
        let welcome = match seed.readiness {
            Readiness::Analyzing => transcript::welcome_analyzing(),
            Readiness::Ready => transcript::welcome_ready(seed.total_rows),
        };
        transcript.push(Role::System, welcome);
        Self {
            file_id: seed.file_id,
            filename: seed.filename,
            summary: seed.summary,
            readiness: seed.readiness,
            total_rows: seed.total_rows,
            transcript,
            groups: Vec::new(),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn total_rows(&self) -> Option<u64> {
        self.total_rows
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }
}

/// Messages from background tasks back to the controller.
#[derive(Debug)]
pub enum SessionEvent {
    Readiness {
        epoch: u64,
        outcome: PollOutcome,
    },
    Grouping {
        epoch: u64,
        request_id: u64,
        reply: Result<GroupingReply, ServiceError>,
    },
}

/// What applying one event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// The event belonged to a discarded session, or was a repeat; nothing changed.
    Stale,
    Ready { total_rows: Option<u64> },
    PollFailed,
    Processing { request_id: u64 },
    Grouped {
        request_id: u64,
        groups: usize,
        /// First non-empty grouping for a user who has never been asked for feedback.
        prompt_feedback: bool,
    },
    RequestFailed { request_id: u64 },
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("no active session; upload a file first")]
    NoActiveSession,
    #[error("instruction is empty")]
    EmptyInstruction,
}

pub struct SessionController {
    service: Arc<dyn AnalysisService>,
    cfg: ClientConfig,
    prompt_store: Box<dyn PromptStore>,
    already_prompted: bool,
    session: Option<Session>,
    epoch: u64,
    poll: Option<PollHandle>,
    poll_state: PollState,
    in_flight: HashMap<u64, JoinHandle<()>>,
    next_request_id: u64,
    event_tx: UnboundedSender<SessionEvent>,
    event_rx: UnboundedReceiver<SessionEvent>,
}

impl SessionController {
    pub fn new(
        service: Arc<dyn AnalysisService>,
        cfg: ClientConfig,
        prompt_store: Box<dyn PromptStore>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let already_prompted = prompt_store.already_prompted();
        Self {
            service,
            cfg,
            prompt_store,
            already_prompted,
            session: None,
            epoch: 0,
            poll: None,
            poll_state: PollState::Idle,
            in_flight: HashMap::new(),
            next_request_id: 1,
            event_tx,
            event_rx,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn poll_state(&self) -> PollState {
        match &self.poll {
            Some(p) if !p.is_finished() => PollState::Polling,
            _ => self.poll_state,
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.in_flight.len()
    }

    pub fn already_prompted(&self) -> bool {
        self.already_prompted
    }

    /// True when no background work can still produce an event.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.poll_state() != PollState::Polling
    }

    /// Replace the current session (if any) with a new one built from `seed`.
    pub fn start_session(&mut self, seed: SessionSeed) -> &Session {
        self.discard_session();
        tracing::info!(file_id = %seed.file_id, readiness = ?seed.readiness, "session started");
        let session = Session::from_seed(seed);
        if session.readiness == Readiness::Analyzing {
            self.spawn_poll(session.file_id.clone());
        }
        self.session.insert(session)
    }

    /// Drop the current session. Its poll and pending requests are cancelled and
    /// anything they might still send is ignored.
    pub fn discard_session(&mut self) -> Option<Session> {
        self.epoch += 1;
        if let Some(poll) = self.poll.take() {
            poll.cancel();
        }
        self.poll_state = PollState::Idle;
        for (_, handle) in self.in_flight.drain() {
            handle.abort();
        }
        let old = self.session.take();
        if let Some(s) = old.as_ref() {
            tracing::info!(file_id = %s.file_id, "session discarded");
        }
        old
    }

    /// Start polling for readiness. Ignored when a poll is already running or the
    /// session is already ready; returns whether a new poll was started.
    pub fn start_polling(&mut self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if session.readiness == Readiness::Ready {
            return false;
        }
        if self.poll_state() == PollState::Polling {
            tracing::debug!(file_id = %session.file_id, "poll already active, ignoring start");
            return false;
        }

        let file_id = session.file_id.clone();
        self.spawn_poll(file_id);
        true
    }

    fn spawn_poll(&mut self, file_id: String) {
        let tx = self.event_tx.clone();
        let epoch = self.epoch;
        let poller = ReadinessPoller::new(self.service.clone(), file_id, &self.cfg);
        self.poll = Some(poller.spawn(move |outcome| {
            let _ = tx.send(SessionEvent::Readiness { epoch, outcome });
        }));
        self.poll_state = PollState::Polling;
    }

    /// Record the instruction in the transcript and send it to the service.
    /// Returns the request id that the eventual response will carry.
    pub fn submit_instruction(&mut self, text: &str) -> Result<u64, SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::NoActiveSession)?;
        if text.trim().is_empty() {
            return Err(SessionError::EmptyInstruction);
        }
        session.transcript.push(Role::User, text);
        let file_id = session.file_id.clone();

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let tx = self.event_tx.clone();
        let service = self.service.clone();
        let epoch = self.epoch;
        let timeout = self.cfg.request_timeout;
        let instructions = text.to_string();
        tracing::debug!(%file_id, request_id, "dispatching grouping request");
        let handle = tokio::spawn(async move {
            let reply = tokio::time::timeout(timeout, service.submit_grouping(&file_id, &instructions))
                .await
                .unwrap_or(Err(ServiceError::Timeout));
            let _ = tx.send(SessionEvent::Grouping {
                epoch,
                request_id,
                reply,
            });
        });
        self.in_flight.insert(request_id, handle);
        Ok(request_id)
    }

    /// Wait for the next background event and apply it. Only returns `None` if
    /// the event channel closes; callers should check [`Self::is_idle`] first.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        let ev = self.event_rx.recv().await?;
        Some(self.apply(ev))
    }

    pub fn apply(&mut self, ev: SessionEvent) -> SessionUpdate {
        match ev {
            SessionEvent::Readiness { epoch, outcome } => {
                if epoch != self.epoch {
                    return SessionUpdate::Stale;
                }
                self.apply_readiness(outcome)
            }
            SessionEvent::Grouping {
                epoch,
                request_id,
                reply,
            } => {
                if epoch != self.epoch {
                    return SessionUpdate::Stale;
                }
                if self.in_flight.remove(&request_id).is_none() {
                    return SessionUpdate::Stale;
                }
                self.apply_grouping(request_id, reply)
            }
        }
    }

    fn apply_readiness(&mut self, outcome: PollOutcome) -> SessionUpdate {
        let Some(session) = self.session.as_mut() else {
            return SessionUpdate::Stale;
        };
        if session.readiness == Readiness::Ready {
            return SessionUpdate::Stale;
        }
        self.poll = None;
        match outcome {
            PollOutcome::Ready { total_rows } => {
                session.readiness = Readiness::Ready;
                session.total_rows = total_rows;
                session
                    .transcript
                    .push(Role::System, transcript::analysis_complete(total_rows));
                self.poll_state = PollState::Ready;
                SessionUpdate::Ready { total_rows }
            }
            PollOutcome::Failed {
                attempts,
                last_error,
            } => {
                session
                    .transcript
                    .push(Role::Error, transcript::analysis_lost(attempts, &last_error));
                self.poll_state = PollState::Failed;
                SessionUpdate::PollFailed
            }
        }
    }

    fn apply_grouping(
        &mut self,
        request_id: u64,
        reply: Result<GroupingReply, ServiceError>,
    ) -> SessionUpdate {
        let Some(session) = self.session.as_mut() else {
            return SessionUpdate::Stale;
        };
        match reply {
            Ok(GroupingReply::Processing) => {
                // The instruction is dropped, not queued; the user re-sends it after readiness.
                session
                    .transcript
                    .push(Role::System, transcript::still_processing());
                SessionUpdate::Processing { request_id }
            }
            Ok(GroupingReply::Grouped(result)) => {
                session
                    .transcript
                    .push(Role::Assistant, transcript::grouping_summary(&result));
                session.groups = result.groups;
                let groups = session.groups.len();
                tracing::info!(file_id = %session.file_id, request_id, groups, "groups updated");

                let prompt_feedback = groups > 0 && !self.already_prompted;
                if prompt_feedback {
                    self.already_prompted = true;
                    if let Err(e) = self.prompt_store.mark_prompted() {
                        tracing::warn!(error = %format!("{e:#}"), "could not persist feedback prompt state");
                    }
                }
                SessionUpdate::Grouped {
                    request_id,
                    groups,
                    prompt_feedback,
                }
            }
            Err(e) => {
                tracing::warn!(file_id = %session.file_id, request_id, error = %e, "grouping request failed");
                session
                    .transcript
                    .push(Role::Error, transcript::grouping_error(&e));
                SessionUpdate::RequestFailed { request_id }
            }
        }
    }
}
