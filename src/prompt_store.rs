//! Persistence for the one-time feedback prompt.
//!
//! The session core only reads and writes this flag through [`PromptStore`]; it
//! never touches the filesystem itself.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub trait PromptStore: Send {
    fn already_prompted(&self) -> bool;
    fn mark_prompted(&mut self) -> Result<()>;
}

/// Process-local store; forgets everything on exit.
#[derive(Debug, Default)]
pub struct MemoryPromptStore {
    prompted: bool,
}

impl MemoryPromptStore {
    pub fn new(prompted: bool) -> Self {
        Self { prompted }
    }
}

impl PromptStore for MemoryPromptStore {
    fn already_prompted(&self) -> bool {
        self.prompted
    }

    fn mark_prompted(&mut self) -> Result<()> {
        self.prompted = true;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PromptState {
    #[serde(default)]
    feedback_requested: bool,
}

/// JSON file under the user's data directory.
#[derive(Debug)]
pub struct FilePromptStore {
    path: PathBuf,
    state: PromptState,
}

/// Default location: `<data dir>/sortify-cli/prompt_state.json`.
pub fn default_path() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .context("no data directory available for prompt state")?;
    Ok(base.join("sortify-cli").join("prompt_state.json"))
}

impl FilePromptStore {
    /// Load the store; a missing or unreadable file counts as "never prompted".
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = std::fs::read(&path)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default();
        Self { path, state }
    }
}

impl PromptStore for FilePromptStore {
    fn already_prompted(&self) -> bool {
        self.state.feedback_requested
    }

    fn mark_prompted(&mut self) -> Result<()> {
        self.state.feedback_requested = true;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(&self.state)?;
        std::fs::write(&self.path, body)
            .with_context(|| format!("write {}", self.path.display()))?;
        Ok(())
    }
}
