//! Session orchestration.
//!
//! Uploads, readiness polling and the session lifecycle live here. The CLI layer
//! calls into this module and renders what it reports; nothing in here prints.

mod controller;
mod poller;
mod transcript;
mod upload;

pub use controller::{Session, SessionController, SessionError, SessionEvent, SessionUpdate};
pub use poller::{PollHandle, PollOutcome, PollState, ReadinessPoller};
pub use transcript::Transcript;
pub use upload::{
    failure_reason, UploadAggregate, UploadOutcome, UploadReport, UploadTask, UploadTracker,
};
