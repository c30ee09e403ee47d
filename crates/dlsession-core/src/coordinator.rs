//! Coordinator - the download lifecycle state machine
//!
//! ```text
//! Pending -> Active -> Paused | Complete | Error
//! Paused  -> Active
//! Pending | Paused -> Complete     (engine finished before the command landed)
//! any live state -> Removed
//! ```
//!
//! Commands check their guard, await the engine without holding any session
//! lock, then re-check the guard before applying the transition. Events for a
//! gid are published while its session lock is held, so subscribers see them
//! in transition order. Once a session is Removed every later engine callback
//! for it is discarded.

use crate::bus::EventBus;
use crate::config::CoreConfig;
use crate::engine::{Engine, EngineError};
use crate::error::CoreError;
use crate::registry::SessionRegistry;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use dlsession_types::{
    DownloadSession, ErrorDescriptor, Event, EventKind, Gid, GlobalStat, OptionValue, Options,
    SessionState,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Validates commands against session state and drives the engine
pub struct Coordinator {
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    engine: Arc<dyn Engine>,
    engine_timeout: Duration,
    /// Defaults merged under the options of every new session
    global_options: RwLock<Options>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bus: EventBus,
        engine: Arc<dyn Engine>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            engine,
            engine_timeout: config.engine_timeout(),
            global_options: RwLock::new(Options::new()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Create a session and ask the engine to start it.
    ///
    /// The gid is returned even when the engine refuses; the session is then
    /// left in Error and stays queryable. `options` override the global ones.
    pub async fn add(&self, uri: &str, options: Options) -> Result<Gid, CoreError> {
        let mut effective = self.global_options.read().clone();
        effective.extend(options);

        let gid = self.registry.create(uri, effective.clone());
        info!(%gid, uri, "Download added");

        let started = self
            .call_engine("engine start", self.engine.start(&gid, uri, &effective))
            .await;
        let timed_out = matches!(started, Err(CoreError::Timeout { .. }));

        let applied = self.registry.update(&gid, |session| {
            // An engine error callback may have landed while start was pending
            if session.state != SessionState::Pending {
                return;
            }
            match started {
                Ok(()) => {
                    session.set_state(SessionState::Active);
                    self.bus.publish(Event::new(EventKind::Started, gid.clone()));
                    info!(%gid, "Download started");
                }
                Err(error) => {
                    let descriptor = descriptor_for(error);
                    warn!(%gid, error = %descriptor, "Engine failed to start download");
                    self.fail(session, descriptor);
                }
            }
        });

        if applied.is_err() {
            debug!(%gid, "Download removed before its start completed");
        }
        // The engine may have started the transfer after all
        if timed_out {
            self.release(&gid, true).await;
        }
        Ok(gid)
    }

    /// Active -> Paused
    pub async fn pause(&self, gid: &Gid, force: bool) -> Result<(), CoreError> {
        self.require(gid, SessionState::Active, "pause")?;
        if let Err(error) = self
            .call_engine("engine pause", self.engine.pause(gid, force))
            .await
        {
            return Err(self.settle_failed_call(gid, SessionState::Active, error).await);
        }

        self.registry.update(gid, |session| {
            if session.state != SessionState::Active {
                return Err(illegal(gid, session.state, "pause"));
            }
            session.set_state(SessionState::Paused);
            self.bus.publish(Event::new(EventKind::Paused, gid.clone()));
            info!(%gid, force, "Download paused");
            Ok(())
        })?
    }

    /// Paused -> Active
    pub async fn resume(&self, gid: &Gid) -> Result<(), CoreError> {
        self.require(gid, SessionState::Paused, "resume")?;
        if let Err(error) = self
            .call_engine("engine resume", self.engine.resume(gid))
            .await
        {
            return Err(self.settle_failed_call(gid, SessionState::Paused, error).await);
        }

        self.registry.update(gid, |session| {
            if session.state != SessionState::Paused {
                return Err(illegal(gid, session.state, "resume"));
            }
            session.set_state(SessionState::Active);
            self.bus.publish(Event::new(EventKind::Resumed, gid.clone()));
            info!(%gid, "Download resumed");
            Ok(())
        })?
    }

    /// Remove a session from any live state. Always succeeds for a known gid.
    pub async fn remove(&self, gid: &Gid, force: bool) -> Result<(), CoreError> {
        let previous = self
            .mark_removed(gid, |_| true)?
            .ok_or_else(|| CoreError::NotFound(gid.clone()))?;
        info!(%gid, from = %previous, "Download removed");

        // A finished transfer has nothing left in the engine. A failed one
        // may still hold resources.
        if previous != SessionState::Complete {
            self.release(gid, force).await;
        }
        Ok(())
    }

    // ========================================================================
    // Engine callbacks
    // ========================================================================

    /// Apply a progress report. Returns whether an event was emitted.
    ///
    /// Counters are merged in any live state. A report that completes the
    /// transfer moves the session to Complete and emits only Complete. Other
    /// reports emit Progress while Active and are recorded quietly while
    /// Pending or Paused. Complete and Error sessions ignore reports.
    pub fn on_progress(&self, gid: &Gid, downloaded: u64, total: Option<u64>) -> bool {
        let result = self.registry.update(gid, |session| {
            let state = session.state;
            if state.is_terminal() {
                debug!(%gid, %state, "Progress ignored");
                return false;
            }

            let progress = session.progress.merged(downloaded, total);
            if progress == session.progress {
                return false;
            }
            session.progress = progress;
            session.updated_at = Utc::now();

            if progress.is_complete() {
                session.set_state(SessionState::Complete);
                self.bus
                    .publish(Event::new(EventKind::Complete, gid.clone()).with_progress(progress));
                info!(%gid, bytes = progress.downloaded, from = %state, "Download complete");
                true
            } else if state == SessionState::Active {
                self.bus
                    .publish(Event::new(EventKind::Progress, gid.clone()).with_progress(progress));
                true
            } else {
                debug!(%gid, %state, "Progress recorded without event");
                false
            }
        });

        result.unwrap_or_else(|_| {
            debug!(%gid, "Progress for unknown or removed download discarded");
            false
        })
    }

    /// Move a live session to Error. Returns whether an event was emitted.
    pub fn on_engine_error(&self, gid: &Gid, descriptor: ErrorDescriptor) -> bool {
        let result = self.registry.update(gid, |session| match session.state {
            SessionState::Pending | SessionState::Active | SessionState::Paused => {
                warn!(%gid, error = %descriptor, "Engine reported failure");
                self.fail(session, descriptor);
                true
            }
            state => {
                debug!(%gid, %state, "Engine error ignored");
                false
            }
        });

        result.unwrap_or_else(|_| {
            debug!(%gid, "Engine error for unknown or removed download discarded");
            false
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn query(&self, gid: &Gid) -> Result<DownloadSession, CoreError> {
        self.registry.get(gid)
    }

    pub fn list(&self) -> Vec<DownloadSession> {
        self.registry.list()
    }

    pub fn active_gids(&self) -> Vec<Gid> {
        self.registry
            .snapshot_where(|s| s.state == SessionState::Active)
            .into_iter()
            .map(|s| s.gid)
            .collect()
    }

    pub fn global_stat(&self) -> GlobalStat {
        self.registry
            .list()
            .iter()
            .fold(GlobalStat::default(), |mut stat, session| {
                match session.state {
                    SessionState::Active => stat.num_active += 1,
                    SessionState::Pending | SessionState::Paused => stat.num_waiting += 1,
                    SessionState::Complete | SessionState::Error => stat.num_stopped += 1,
                    SessionState::Removed => {}
                }
                stat
            })
    }

    pub fn option(&self, gid: &Gid, name: &str) -> Result<Option<OptionValue>, CoreError> {
        self.registry
            .update(gid, |session| session.options.get(name).cloned())
    }

    pub fn options(&self, gid: &Gid) -> Result<Options, CoreError> {
        self.registry.update(gid, |session| session.options.clone())
    }

    // ========================================================================
    // Global options
    // ========================================================================

    pub fn global_option(&self, name: &str) -> Option<OptionValue> {
        self.global_options.read().get(name).cloned()
    }

    pub fn global_options(&self) -> Options {
        self.global_options.read().clone()
    }

    /// Merge `options` into the global defaults. Existing sessions keep the
    /// options they were created with.
    pub fn change_global_options(&self, options: Options) {
        info!(count = options.len(), "Global options changed");
        self.global_options.write().extend(options);
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Remove every Complete/Error session. Returns how many were removed.
    pub fn purge(&self) -> usize {
        self.evict_terminal(|_| true)
    }

    /// Remove Complete/Error sessions that finished at least `retention`
    /// before `now`
    pub fn reap(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        self.evict_terminal(|session| {
            session
                .finished_at
                .is_some_and(|finished| finished + retention <= now)
        })
    }

    fn evict_terminal(&self, filter: impl Fn(&DownloadSession) -> bool) -> usize {
        let candidates = self
            .registry
            .snapshot_where(|s| s.state.is_terminal() && filter(s));

        candidates
            .iter()
            .filter(|candidate| {
                // Re-checked under the session lock
                let evicted = self.mark_removed(&candidate.gid, |session| {
                    session.state.is_terminal() && filter(session)
                });
                matches!(evicted, Ok(Some(_)))
            })
            .inspect(|candidate| debug!(gid = %candidate.gid, "Evicted finished download"))
            .count()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Mark the session Removed if `guard` allows it, publish Removed and
    /// unlink it. Returns the state it was in, or `None` if the guard refused.
    fn mark_removed(
        &self,
        gid: &Gid,
        guard: impl FnOnce(&DownloadSession) -> bool,
    ) -> Result<Option<SessionState>, CoreError> {
        let previous = self.registry.update(gid, |session| {
            if !guard(session) {
                return None;
            }
            let previous = session.state;
            session.set_state(SessionState::Removed);
            self.bus.publish(Event::new(EventKind::Removed, gid.clone()));
            Some(previous)
        })?;

        if previous.is_some() {
            self.registry.remove(gid)?;
        }
        Ok(previous)
    }

    /// A pause or resume that timed out leaves the engine in an unknown
    /// state, so the session is failed and the engine asked to drop it. Any
    /// other engine failure leaves the session as it was.
    async fn settle_failed_call(
        &self,
        gid: &Gid,
        expected: SessionState,
        error: CoreError,
    ) -> CoreError {
        if !matches!(error, CoreError::Timeout { .. }) {
            return error;
        }

        let descriptor = ErrorDescriptor::new(error.to_string());
        let failed = self.registry.update(gid, |session| {
            if session.state != expected {
                return false;
            }
            warn!(%gid, error = %descriptor, "Engine state unknown, failing download");
            self.fail(session, descriptor);
            true
        });
        if matches!(failed, Ok(true)) {
            self.release(gid, true).await;
        }
        error
    }

    /// Best-effort engine cleanup
    async fn release(&self, gid: &Gid, force: bool) {
        if let Err(e) = self
            .call_engine("engine remove", self.engine.remove(gid, force))
            .await
        {
            warn!(%gid, "Engine cleanup failed: {}", e);
        }
    }

    fn fail(&self, session: &mut DownloadSession, descriptor: ErrorDescriptor) {
        session.set_state(SessionState::Error);
        session.last_error = Some(descriptor.clone());
        self.bus
            .publish(Event::new(EventKind::Error, session.gid.clone()).with_error(descriptor));
    }

    fn require(
        &self,
        gid: &Gid,
        expected: SessionState,
        action: &'static str,
    ) -> Result<(), CoreError> {
        let state = self.registry.update(gid, |session| session.state)?;
        if state != expected {
            return Err(illegal(gid, state, action));
        }
        Ok(())
    }

    async fn call_engine<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, CoreError> {
        match tokio::time::timeout(self.engine_timeout, call).await {
            Ok(result) => result.map_err(CoreError::from),
            Err(_) => Err(CoreError::Timeout {
                operation,
                after: self.engine_timeout,
            }),
        }
    }
}

fn illegal(gid: &Gid, state: SessionState, action: &'static str) -> CoreError {
    CoreError::IllegalState {
        gid: gid.clone(),
        state,
        action,
    }
}

fn descriptor_for(error: CoreError) -> ErrorDescriptor {
    match error {
        CoreError::Engine(engine) => engine.into(),
        other => ErrorDescriptor::new(other.to_string()),
    }
}
