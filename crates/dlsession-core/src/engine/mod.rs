//! Engine capability interface
//!
//! The coordinator never transfers bytes itself. It is handed an [`Engine`]
//! at construction and drives it through this trait:
//! - start / pause / resume / remove a transfer by gid
//! - a probe run once at construction, so a broken engine is a
//!   configuration error instead of a per-call surprise
//!
//! Engines push progress and failures back through an [`EngineReporter`],
//! which feeds a channel drained on its own task.

mod simulated;

#[cfg(test)]
pub(crate) mod mock;

pub use simulated::*;

use async_trait::async_trait;
use dlsession_types::{ErrorDescriptor, Gid, Options};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by an engine call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{message} (code {code})")]
    Failed { code: i32, message: String },

    #[error("Not supported by this engine: {0}")]
    Unsupported(String),

    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

impl From<EngineError> for ErrorDescriptor {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Failed { code, message } => ErrorDescriptor::with_code(code, message),
            other => ErrorDescriptor::new(other.to_string()),
        }
    }
}

/// A transfer engine the coordinator can drive
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Checked once when the service is built
    async fn probe(&self) -> Result<(), EngineError>;

    /// Hand the engine its reporting channel. Called once, before any start.
    fn attach(&self, reporter: EngineReporter);

    async fn start(&self, gid: &Gid, uri: &str, options: &Options) -> Result<(), EngineError>;

    async fn pause(&self, gid: &Gid, force: bool) -> Result<(), EngineError>;

    async fn resume(&self, gid: &Gid) -> Result<(), EngineError>;

    async fn remove(&self, gid: &Gid, force: bool) -> Result<(), EngineError>;
}

/// Something the engine observed about a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineReport {
    Progress {
        gid: Gid,
        downloaded: u64,
        total: Option<u64>,
    },
    Failed {
        gid: Gid,
        error: ErrorDescriptor,
    },
}

/// Cloneable handle an engine uses to report back
#[derive(Debug, Clone)]
pub struct EngineReporter {
    tx: mpsc::UnboundedSender<EngineReport>,
}

impl EngineReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the service has shut down
    pub fn progress(&self, gid: &Gid, downloaded: u64, total: Option<u64>) -> bool {
        self.tx
            .send(EngineReport::Progress {
                gid: gid.clone(),
                downloaded,
                total,
            })
            .is_ok()
    }

    pub fn failed(&self, gid: &Gid, error: ErrorDescriptor) -> bool {
        self.tx
            .send(EngineReport::Failed {
                gid: gid.clone(),
                error,
            })
            .is_ok()
    }
}
