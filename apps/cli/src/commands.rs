//! CLI command implementations

use crate::output::{format_bytes, format_speed, problem_text, shorten_path, state_icon};
use crate::progress::TransferProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Result};
use console::style;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use swarmsync_core::{HttpPeer, SharedPeer, TransferCore};
use swarmsync_types::{
    FileVersion, Priority, Settings, TrafficClass, TransferEvent, TransferState, TransferSummary,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use url::Url;

// ============================================================================
// Download Commands
// ============================================================================

/// Arguments of `swarmsync get`
pub struct GetRequest {
    pub path: String,
    pub sources: Vec<Url>,
    pub size: Option<u64>,
    pub hash: Option<String>,
    pub version: u64,
    pub priority: Priority,
    pub rate: Option<u64>,
}

pub async fn get_file(core: &TransferCore, request: GetRequest, format: OutputFormat) -> Result<()> {
    core.start().await?;
    if let Some(rate) = request.rate {
        // Only for this run, settings stay untouched
        for class in [TrafficClass::LanInput, TrafficClass::WanInput] {
            core.governor().set_rate(class, rate);
        }
    }

    let (sources, probed_size) = probe_sources(&request.sources).await;
    if sources.is_empty() {
        bail!("No usable source for {}", request.path);
    }
    let size = request
        .size
        .or(probed_size)
        .ok_or_else(|| anyhow!("Size of {} is unknown, pass --size", request.path))?;
    let version = resume_version(core, &request, size).await?;

    let mut events = core.subscribe();
    let id = core
        .request_download(version.clone(), sources, Some(request.priority))
        .await?;

    let progress = TransferProgress::new();
    if matches!(format, OutputFormat::Human) {
        progress.add_transfer(id, &version).await;
    }
    let result = follow_download(core, id, &mut events, &progress).await;
    progress.clear().await;

    match format {
        OutputFormat::Json => {
            if let Some(summary) = core.get(id) {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        OutputFormat::Human | OutputFormat::Table => match &result {
            Ok(()) => println!(
                "{} Saved {} ({})",
                style("✓").green().bold(),
                style(&version.path).cyan(),
                format_bytes(version.size)
            ),
            Err(e) => println!("{} {}", style("✗").red().bold(), e),
        },
    }

    core.shutdown().await;
    result
}

/// Probe every source; the first advertised size wins and sources that
/// disagree with it are skipped
async fn probe_sources(urls: &[Url]) -> (Vec<SharedPeer>, Option<u64>) {
    let mut sources: Vec<SharedPeer> = Vec::new();
    let mut size = None;
    for url in urls {
        let peer = match HttpPeer::new(url.clone()) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Skipping {}: {}", url, e);
                continue;
            }
        };
        match peer.probe().await {
            Ok(info) => {
                if let (Some(known), Some(offered)) = (size, info.size) {
                    if known != offered {
                        warn!("Skipping {}: size {} differs from {}", url, offered, known);
                        continue;
                    }
                }
                size = size.or(info.size);
                info!(
                    "Source {} ({})",
                    url,
                    if info.accepts_ranges { "ranges" } else { "whole file" }
                );
                sources.push(Arc::new(peer));
            }
            Err(e) => warn!("Skipping {}: {}", url, e),
        }
    }
    (sources, size)
}

/// Version to request. An earlier run of the same version left resume data
/// stamped with its origin time, reuse it so the partial still matches.
async fn resume_version(core: &TransferCore, request: &GetRequest, size: u64) -> Result<FileVersion> {
    let version = FileVersion::new(request.path.clone(), size, request.version)
        .with_hash(request.hash.clone().unwrap_or_default());
    let meta = core.partials().load_meta(&request.path).await?;
    Ok(match meta {
        Some(meta)
            if meta.origin.version == version.version
                && meta.origin.size == version.size
                && meta.origin.content_hash == version.content_hash =>
        {
            info!("Resuming {} from an earlier run", request.path);
            version.modified(meta.origin.modified_by, meta.origin.modified_at)
        }
        _ => version,
    })
}

/// Feed events to the progress bars until the download ends. Ctrl-C aborts
/// it and keeps the partial file.
async fn follow_download(
    core: &TransferCore,
    id: swarmsync_types::TransferId,
    events: &mut broadcast::Receiver<TransferEvent>,
    progress: &TransferProgress,
) -> Result<()> {
    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("Interrupted, aborting download");
                core.abort(id).await?;
                continue;
            }
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => bail!("Event stream closed"),
        };
        progress.handle_event(&event).await;

        match event {
            TransferEvent::Completed { id: done } if done == id => return Ok(()),
            TransferEvent::Broken {
                id: broken,
                problem,
                info,
            } if broken == id => {
                bail!(
                    "Download broke: {}. Run the same command again to resume.",
                    info.unwrap_or_else(|| problem.to_string())
                )
            }
            TransferEvent::Aborted { id: aborted, problem } if aborted == id => {
                bail!(
                    "Download aborted{}",
                    problem.map(|p| format!(": {}", p)).unwrap_or_default()
                )
            }
            _ => {}
        }
    }
}

// ============================================================================
// History Commands
// ============================================================================

pub async fn list_transfers(
    core: &TransferCore,
    completed_only: bool,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let mut transfers = core.database().load_all_transfers().await?;
    if completed_only {
        transfers.retain(|t| t.state == TransferState::Completed);
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&transfers)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct TransferRow {
                id: String,
                direction: String,
                path: String,
                version: u64,
                size: String,
                progress: String,
                state: String,
            }

            let rows: Vec<TransferRow> = transfers
                .iter()
                .map(|t| TransferRow {
                    id: t.id.to_string()[..8].to_string(),
                    direction: t.direction.as_str().to_string(),
                    path: shorten_path(&t.version.path, 30),
                    version: t.version.version,
                    size: format_bytes(t.version.size),
                    progress: format!("{:.1}%", t.progress()),
                    state: t.state.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if transfers.is_empty() {
                println!("{}", style("No transfers found").dim());
                return Ok(());
            }

            for transfer in &transfers {
                print_transfer_summary(transfer, show_all);
            }
            println!();
            println!("{} transfer(s) total", style(transfers.len()).bold());
        }
    }

    Ok(())
}

fn print_transfer_summary(transfer: &TransferSummary, detailed: bool) {
    let progress = format!("{:.1}%", transfer.progress());

    println!(
        "{} {} {} [{} {}]",
        state_icon(transfer.state),
        style(&transfer.version.path).bold(),
        style(&progress).dim(),
        style(transfer.direction.as_str()).dim(),
        style(transfer.state).dim()
    );

    if detailed {
        println!("    ID: {}", transfer.id);
        println!("    Version: {}", transfer.version.version);
        println!(
            "    Size: {} / {}",
            format_bytes(transfer.transferred),
            format_bytes(transfer.version.size)
        );
        if !transfer.peers.is_empty() {
            let peers: Vec<&str> = transfer.peers.iter().map(|p| p.as_str()).collect();
            println!("    Peers: {}", peers.join(", "));
        }
        if transfer.retry_count > 0 {
            println!("    Retries: {}", transfer.retry_count);
        }
        if let Some(problem) = problem_text(transfer) {
            println!("    Problem: {}", style(problem).red());
        }
        println!();
    }
}

pub async fn clear_completed(core: &TransferCore, format: OutputFormat) -> Result<()> {
    core.start().await?;
    let cleared = core.clear_completed().await?;
    core.shutdown().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "cleared": cleared })),
        _ => println!(
            "{} Cleared {} completed transfer(s)",
            style("✓").green().bold(),
            cleared
        ),
    }
    Ok(())
}

// ============================================================================
// Resume Data Commands
// ============================================================================

#[derive(Serialize, tabled::Tabled)]
struct PartialRow {
    path: String,
    version: u64,
    chunks: String,
    updated: String,
}

pub async fn show_partials(core: &TransferCore, gc: bool, format: OutputFormat) -> Result<()> {
    if gc {
        // The startup scan does the collection
        let report = core.start().await?.partials;
        core.shutdown().await;
        if !matches!(format, OutputFormat::Json) {
            println!(
                "{} Removed {} file(s) and {} stale entr{}",
                style("✓").green().bold(),
                report.removed_files.len(),
                report.removed_entries.len(),
                if report.removed_entries.len() == 1 { "y" } else { "ies" }
            );
        }
    }

    let rows: Vec<PartialRow> = core
        .database()
        .load_all_partials()
        .await?
        .into_iter()
        .map(|meta| {
            let done = meta.chunk_bitmap.chars().filter(|c| *c == '1').count();
            PartialRow {
                path: meta.origin.path,
                version: meta.origin.version,
                chunks: format!("{}/{}", done, meta.chunk_bitmap.len()),
                updated: meta.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            }
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Table => println!("{}", tabled::Table::new(rows)),
        OutputFormat::Human => {
            if rows.is_empty() {
                println!("{}", style("No incomplete downloads").dim());
            }
            for row in &rows {
                println!(
                    "{} {} {} chunks, v{} (saved {})",
                    style("·").dim(),
                    style(&row.path).bold(),
                    row.chunks,
                    row.version,
                    style(&row.updated).dim()
                );
            }
        }
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    core: &TransferCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.settings();

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("SwarmSync Configuration:");
                    println!();
                    println!("  Download root: {}", settings.download_root.display());
                    println!(
                        "  Max concurrent: {} down / {} up",
                        settings.max_concurrent_downloads, settings.max_concurrent_uploads
                    );
                    println!("  Chunk size: {}", format_bytes(settings.chunk_size));
                    println!("  Requests per source: {}", settings.max_requests_per_source);
                    println!("  Stall timeout: {}s", settings.stall_timeout_secs);
                    for class in TrafficClass::ALL {
                        println!(
                            "  {} rate: {}",
                            class.as_str(),
                            format_speed(settings.rate_for(class))
                        );
                    }
                    println!(
                        "  Retries: {} (after {}s)",
                        settings.max_retries, settings.retry_delay_secs
                    );
                    println!(
                        "  Partial files: kept {}h, kept on abort: {}",
                        settings.partial_grace_period_hours, settings.keep_partial_on_abort
                    );
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = serde_json::to_value(core.settings())?;
            match settings.get(&key) {
                Some(Value::String(s)) => println!("{}", s),
                Some(value) => println!("{}", value),
                None => bail!("Unknown config key: {}", key),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = with_value(core.settings(), &key, &value)?;
            core.update_settings(settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                core.update_settings(Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

/// Replace one settings field. Values are read as JSON, falling back to a
/// plain string.
fn with_value(settings: Settings, key: &str, value: &str) -> Result<Settings> {
    let mut json = serde_json::to_value(settings)?;
    let fields = json
        .as_object_mut()
        .ok_or_else(|| anyhow!("Settings are not an object"))?;
    if !fields.contains_key(key) {
        bail!("Unknown config key: {}", key);
    }
    let parsed = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    fields.insert(key.to_string(), parsed);
    serde_json::from_value(json).map_err(|e| anyhow!("Invalid value for {}: {}", key, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_numeric_and_path_values() {
        let settings = with_value(Settings::default(), "wan_download_rate", "65536").unwrap();
        assert_eq!(settings.wan_download_rate, 65536);

        let settings = with_value(settings, "download_root", "/srv/sync").unwrap();
        assert_eq!(settings.download_root, std::path::PathBuf::from("/srv/sync"));
        assert_eq!(settings.wan_download_rate, 65536);
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_values() {
        assert!(with_value(Settings::default(), "theme", "dark").is_err());
        assert!(with_value(Settings::default(), "max_retries", "many").is_err());
    }
}
