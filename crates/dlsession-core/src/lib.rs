//! dlsession core - download session coordination
//!
//! This crate tracks concurrent download sessions, validates lifecycle
//! commands against their state, drives a pluggable transfer [`Engine`], and
//! delivers ordered status events to a single subscriber.

mod bus;
mod config;
mod coordinator;
mod dispatcher;
pub mod engine;
mod error;
mod reaper;
mod registry;

pub use bus::*;
pub use config::*;
pub use coordinator::*;
pub use dispatcher::*;
pub use engine::{
    Engine, EngineError, EngineReport, EngineReporter, SimulatedConfig, SimulatedEngine,
};
pub use error::*;
pub use reaper::*;
pub use registry::*;

use dlsession_types::Event;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The main service instance
///
/// Owns the registry, event bus and background tasks. Cloning is cheap and
/// every clone drives the same sessions.
#[derive(Clone)]
pub struct DownloadService {
    coordinator: Arc<Coordinator>,
    dispatcher: Arc<CommandDispatcher>,
    bus: EventBus,
    engine: Arc<dyn Engine>,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DownloadService {
    /// Probe `engine` and start the service on the current tokio runtime
    pub async fn new(config: CoreConfig, engine: Arc<dyn Engine>) -> Result<Self, CoreError> {
        match tokio::time::timeout(config.engine_timeout(), engine.probe()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(CoreError::Init(format!(
                    "engine {} is unusable: {}",
                    engine.name(),
                    e
                )))
            }
            Err(_) => {
                return Err(CoreError::Init(format!(
                    "engine {} did not answer its probe within {:?}",
                    engine.name(),
                    config.engine_timeout()
                )))
            }
        }

        let shutdown = CancellationToken::new();
        let bus = EventBus::new(shutdown.clone())?;
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(SessionRegistry::new()),
            bus.clone(),
            engine.clone(),
            &config,
        ));

        // Engine reports are applied on their own task, apart from commands
        let (reporter, reports) = EngineReporter::channel();
        engine.attach(reporter);
        let mut tasks = vec![tokio::spawn(pump_reports(
            coordinator.clone(),
            reports,
            shutdown.clone(),
        ))];

        if let Some(retention) = config.terminal_retention() {
            tasks.push(
                Reaper::new(coordinator.clone(), retention, config.reap_interval())
                    .spawn(shutdown.clone()),
            );
        }

        let dispatcher = Arc::new(CommandDispatcher::new(
            coordinator.clone(),
            config.command_timeout(),
        ));

        info!(engine = engine.name(), "Download service ready");

        Ok(Self {
            coordinator,
            dispatcher,
            bus,
            engine,
            shutdown,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Replace the current event sink
    pub fn subscribe(&self, sink: impl EventSink) -> SubscriptionId {
        self.bus.subscribe(sink)
    }

    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        self.bus.subscribe_channel()
    }

    pub fn unsubscribe(&self) {
        self.bus.unsubscribe()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Run one boundary call, see [`CommandDispatcher::dispatch`]
    pub async fn dispatch(&self, method: &str, args: &Value) -> Result<Value, CoreError> {
        self.dispatcher.dispatch(method, args).await
    }

    /// Typed access for in-process callers
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Stop background tasks. Later events are no longer delivered.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down download service");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shut down and wait for the report pump and reaper to exit
    pub async fn stop(&self) {
        self.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

async fn pump_reports(
    coordinator: Arc<Coordinator>,
    mut reports: mpsc::UnboundedReceiver<EngineReport>,
    shutdown: CancellationToken,
) {
    loop {
        let report = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            report = reports.recv() => report,
        };
        let Some(report) = report else {
            break;
        };

        match report {
            EngineReport::Progress {
                gid,
                downloaded,
                total,
            } => {
                coordinator.on_progress(&gid, downloaded, total);
            }
            EngineReport::Failed { gid, error } => {
                coordinator.on_engine_error(&gid, error);
            }
        }
    }

    debug!("Engine report pump stopped");
}
