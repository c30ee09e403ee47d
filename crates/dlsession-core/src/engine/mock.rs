//! Scriptable engine for tests

use super::{Engine, EngineError, EngineReporter};
use async_trait::async_trait;
use dlsession_types::{Gid, Options};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub(crate) struct MockEngine {
    pub fail_start: AtomicBool,
    pub fail_pause: AtomicBool,
    pub fail_remove: AtomicBool,
    pub unsupported_resume: AtomicBool,
    pub start_delay_ms: AtomicU64,
    pub pause_delay_ms: AtomicU64,
    pub probe_error: Mutex<Option<EngineError>>,
    calls: Mutex<Vec<String>>,
    reporter: Mutex<Option<EngineReporter>>,
}

impl MockEngine {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn reporter(&self) -> Option<EngineReporter> {
        self.reporter.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

async fn delay(millis: &AtomicU64) {
    let millis = millis.load(Ordering::Acquire);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn probe(&self) -> Result<(), EngineError> {
        match self.probe_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn attach(&self, reporter: EngineReporter) {
        *self.reporter.lock() = Some(reporter);
    }

    async fn start(&self, gid: &Gid, uri: &str, _options: &Options) -> Result<(), EngineError> {
        self.record(format!("start {} {}", gid, uri));
        delay(&self.start_delay_ms).await;
        if self.fail_start.load(Ordering::Acquire) {
            return Err(EngineError::Failed {
                code: 3,
                message: "resource not found".to_string(),
            });
        }
        Ok(())
    }

    async fn pause(&self, gid: &Gid, force: bool) -> Result<(), EngineError> {
        self.record(format!("pause {} {}", gid, force));
        delay(&self.pause_delay_ms).await;
        if self.fail_pause.load(Ordering::Acquire) {
            return Err(EngineError::Failed {
                code: 1,
                message: "pause rejected".to_string(),
            });
        }
        Ok(())
    }

    async fn resume(&self, gid: &Gid) -> Result<(), EngineError> {
        self.record(format!("resume {}", gid));
        if self.unsupported_resume.load(Ordering::Acquire) {
            return Err(EngineError::Unsupported("unpause".to_string()));
        }
        Ok(())
    }

    async fn remove(&self, gid: &Gid, force: bool) -> Result<(), EngineError> {
        self.record(format!("remove {} {}", gid, force));
        if self.fail_remove.load(Ordering::Acquire) {
            return Err(EngineError::Unavailable("session closed".to_string()));
        }
        Ok(())
    }
}
