//! Progress bar utilities for CLI downloads

use console::style;
use dlsession_types::{Event, EventKind, Gid};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";

/// Manages progress bars for multiple downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<Gid, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a download
    pub fn add_download(&mut self, gid: &Gid, uri: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(0));

        if let Ok(bar_style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }
        pb.set_message(uri.to_string());

        self.bars.insert(gid.clone(), pb.clone());
        pb
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &Event) {
        let Some(pb) = self.bars.get(&event.gid) else {
            return;
        };

        if let Some(progress) = event.progress {
            if let Some(total) = progress.total {
                pb.set_length(total);
            }
            pb.set_position(progress.downloaded);
        }

        match event.kind {
            EventKind::Complete => {
                pb.finish_with_message(format!("{} Download complete", style("✓").green().bold()));
            }
            EventKind::Error => {
                pb.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    event
                        .error
                        .as_ref()
                        .map(|e| e.message.as_str())
                        .unwrap_or("Unknown error")
                ));
            }
            EventKind::Paused => {
                pb.set_message(format!("{} Paused", style("⏸").yellow()));
            }
            EventKind::Removed => {
                pb.abandon_with_message(format!("{} Removed", style("○").dim()));
            }
            EventKind::Started | EventKind::Resumed | EventKind::Progress => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
