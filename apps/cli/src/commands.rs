//! CLI command implementations

use crate::output::{format_progress, print_output};
use crate::progress::DownloadProgress;
use crate::OutputFormat;
use anyhow::Result;
use console::style;
use dlsession_core::DownloadService;
use dlsession_types::{DownloadSession, EventKind, Gid, Options, SessionState};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Final state of every download started by `get`
#[derive(Serialize)]
#[serde(transparent)]
struct Summary(Vec<DownloadSession>);

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for session in &self.0 {
            let mark = match session.state {
                SessionState::Complete => style("✓").green().bold(),
                SessionState::Error => style("✗").red().bold(),
                _ => style("○").dim(),
            };
            write!(
                f,
                "{} {} {} ({})",
                mark,
                style(&session.gid).dim(),
                session.source_uri,
                format_progress(session.progress.downloaded, session.progress.total)
            )?;
            if let Some(error) = &session.last_error {
                write!(f, "\n    {}", style(error).red())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ============================================================================
// Download Commands
// ============================================================================

/// Add every URL and wait until each one completes or fails.
///
/// Ctrl-C removes whatever is still running.
pub async fn get(service: &DownloadService, urls: Vec<String>, format: OutputFormat) -> Result<()> {
    let (_, mut events) = service.subscribe_channel();
    let coordinator = service.coordinator();
    let mut progress = DownloadProgress::new();

    let mut gids = Vec::with_capacity(urls.len());
    for url in &urls {
        let gid = coordinator.add(url, Options::new()).await?;
        if matches!(format, OutputFormat::Human) {
            progress.add_download(&gid, url);
        }
        gids.push(gid);
    }

    let mut pending: HashSet<Gid> = gids.iter().cloned().collect();
    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                progress.handle_event(&event);
                if matches!(event.kind, EventKind::Complete | EventKind::Error | EventKind::Removed) {
                    pending.remove(&event.gid);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                for gid in pending.drain() {
                    if let Err(e) = coordinator.remove(&gid, true).await {
                        tracing::warn!(%gid, "Failed to remove download: {}", e);
                    }
                }
            }
        }
    }
    progress.clear();

    // Removed sessions are gone from the registry
    let finished: Vec<DownloadSession> = gids
        .iter()
        .filter_map(|gid| coordinator.query(gid).ok())
        .collect();
    let failed = finished
        .iter()
        .filter(|s| s.state == SessionState::Error)
        .count();

    print_output(&Summary(finished), format)?;
    if failed > 0 {
        anyhow::bail!("{} of {} downloads failed", failed, urls.len());
    }
    Ok(())
}
