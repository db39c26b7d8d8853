//! Progress bar utilities for CLI transfers

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Arc;
use swarmsync_types::{FileVersion, TransferEvent, TransferId, TransferState};
use tokio::sync::RwLock;

/// Manages progress bars for running transfers
pub struct TransferProgress {
    multi: MultiProgress,
    bars: Arc<RwLock<HashMap<TransferId, ProgressBar>>>,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a progress bar for a transfer
    pub async fn add_transfer(&self, id: TransferId, version: &FileVersion) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(version.size));

        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ");
        pb.set_style(style);
        pb.set_message(version.file_name().to_string());

        self.bars.write().await.insert(id, pb.clone());
        pb
    }

    /// Update a progress bar from an event
    pub async fn handle_event(&self, event: &TransferEvent) {
        let Some(id) = event.transfer_id() else {
            return;
        };
        let bars = self.bars.read().await;
        let Some(pb) = bars.get(&id) else {
            return;
        };

        match event {
            TransferEvent::Progress {
                transferred, total, ..
            } => {
                pb.set_length(*total);
                pb.set_position(*transferred);
            }

            TransferEvent::SourceAdded { peer, .. } => {
                pb.println(format!("  {} source {}", style("+").green(), peer));
            }

            TransferEvent::SourceRemoved { peer, .. } => {
                pb.println(format!("  {} source {}", style("-").yellow(), peer));
            }

            TransferEvent::StateChanged { state, .. } => match state {
                TransferState::Matching => pb.set_message("matching local blocks"),
                TransferState::Copying => pb.set_message("copying local blocks"),
                TransferState::Verifying => pb.set_message("verifying"),
                _ => {}
            },

            TransferEvent::Completed { .. } => {
                pb.set_position(pb.length().unwrap_or(0));
                pb.finish_with_message(format!("{} Download complete", style("✓").green().bold()));
            }

            TransferEvent::Broken { problem, info, .. } => {
                pb.abandon_with_message(format!(
                    "{} Broken: {}",
                    style("✗").red().bold(),
                    info.clone().unwrap_or_else(|| problem.to_string())
                ));
            }

            TransferEvent::Aborted { problem, .. } => {
                pb.abandon_with_message(format!(
                    "{} Aborted{}",
                    style("○").dim(),
                    problem.map(|p| format!(": {}", p)).unwrap_or_default()
                ));
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub async fn clear(&self) {
        for (_, pb) in self.bars.write().await.drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}
