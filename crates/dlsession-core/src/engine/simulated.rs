//! Simulated engine
//!
//! Stands in for the native transfer library. Each started gid gets a task
//! that advances a byte counter on a timer and reports it, honouring pause,
//! resume and remove through shared flags.

use super::{Engine, EngineError, EngineReporter};
use async_trait::async_trait;
use dlsession_types::{Gid, Options};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// aria2 reports most failures as "unknown error"
const UNKNOWN_ERROR_CODE: i32 = 1;

const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "ftp", "sftp", "magnet"];

/// Shape of every simulated transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulatedConfig {
    pub total_bytes: u64,
    pub chunk_bytes: u64,
    pub tick_ms: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            total_bytes: 4 * 1024 * 1024,
            chunk_bytes: 256 * 1024,
            tick_ms: 100,
        }
    }
}

/// Handle to a running simulated transfer
struct TransferHandle {
    _task: tokio::task::JoinHandle<()>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// In-process engine that fakes transfers with timers
pub struct SimulatedEngine {
    config: SimulatedConfig,
    reporter: Mutex<Option<EngineReporter>>,
    /// Running transfers; a task removes itself when it finishes
    active_tasks: Arc<Mutex<HashMap<Gid, TransferHandle>>>,
    shutdown: CancellationToken,
}

impl SimulatedEngine {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            reporter: Mutex::new(None),
            active_tasks: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of transfers still ticking
    pub fn active_count(&self) -> usize {
        self.active_tasks.lock().len()
    }

    pub fn is_active(&self, gid: &Gid) -> bool {
        self.active_tasks.lock().contains_key(gid)
    }

    fn no_transfer(gid: &Gid) -> EngineError {
        EngineError::Failed {
            code: UNKNOWN_ERROR_CODE,
            message: format!("no active transfer for {}", gid),
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Engine for SimulatedEngine {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn probe(&self) -> Result<(), EngineError> {
        if self.config.chunk_bytes == 0 || self.config.tick_ms == 0 {
            return Err(EngineError::Unavailable(
                "chunk size and tick interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn attach(&self, reporter: EngineReporter) {
        *self.reporter.lock() = Some(reporter);
    }

    async fn start(&self, gid: &Gid, uri: &str, _options: &Options) -> Result<(), EngineError> {
        let parsed = url::Url::parse(uri).map_err(|e| EngineError::Failed {
            code: UNKNOWN_ERROR_CODE,
            message: format!("invalid URI {}: {}", uri, e),
        })?;
        if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
            return Err(EngineError::Failed {
                code: UNKNOWN_ERROR_CODE,
                message: format!("unsupported protocol: {}", parsed.scheme()),
            });
        }

        let reporter = self
            .reporter
            .lock()
            .clone()
            .ok_or_else(|| EngineError::Unavailable("engine not attached".to_string()))?;

        // Held across spawn + insert so a short transfer cannot remove its
        // entry before it exists
        let mut tasks = self.active_tasks.lock();
        if tasks.contains_key(gid) {
            warn!(%gid, "Transfer is already running");
            return Ok(());
        }

        let paused = Arc::new(AtomicBool::new(false));
        let cancel = self.shutdown.child_token();
        let total = self.config.total_bytes;
        let chunk = self.config.chunk_bytes;
        let tick = Duration::from_millis(self.config.tick_ms);

        info!(%gid, uri, total, "Starting simulated transfer");

        let task = {
            let gid = gid.clone();
            let paused = paused.clone();
            let cancel = cancel.clone();
            let active_tasks = self.active_tasks.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(tick);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;

                let mut downloaded = 0u64;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(%gid, "Simulated transfer cancelled");
                            break;
                        }
                        _ = ticker.tick() => {}
                    }

                    if paused.load(Ordering::Acquire) {
                        continue;
                    }

                    downloaded = downloaded.saturating_add(chunk).min(total);
                    if !reporter.progress(&gid, downloaded, Some(total)) {
                        break;
                    }
                    if downloaded >= total {
                        info!(%gid, "Simulated transfer finished");
                        break;
                    }
                }

                active_tasks.lock().remove(&gid);
            })
        };

        tasks.insert(
            gid.clone(),
            TransferHandle {
                _task: task,
                paused,
                cancel,
            },
        );

        Ok(())
    }

    async fn pause(&self, gid: &Gid, force: bool) -> Result<(), EngineError> {
        let tasks = self.active_tasks.lock();
        let handle = tasks.get(gid).ok_or_else(|| Self::no_transfer(gid))?;
        handle.paused.store(true, Ordering::Release);
        debug!(%gid, force, "Signaled pause");
        Ok(())
    }

    async fn resume(&self, gid: &Gid) -> Result<(), EngineError> {
        let tasks = self.active_tasks.lock();
        let handle = tasks.get(gid).ok_or_else(|| Self::no_transfer(gid))?;
        handle.paused.store(false, Ordering::Release);
        debug!(%gid, "Signaled resume");
        Ok(())
    }

    async fn remove(&self, gid: &Gid, force: bool) -> Result<(), EngineError> {
        if let Some(handle) = self.active_tasks.lock().remove(gid) {
            handle.cancel.cancel();
            debug!(%gid, force, "Cancelled simulated transfer");
        }
        Ok(())
    }
}
