//! Output formatting utilities

use console::{style, StyledObject};
use swarmsync_types::{TransferState, TransferSummary};

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 {
        return "unlimited".to_string();
    }
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Format duration as human-readable
pub fn format_eta(seconds: u64) -> String {
    if seconds == 0 {
        return "-".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

pub fn state_icon(state: TransferState) -> StyledObject<&'static str> {
    match state {
        TransferState::Completed => style("✓").green(),
        TransferState::Started
        | TransferState::Matching
        | TransferState::Copying
        | TransferState::Verifying => style("↓").cyan(),
        TransferState::Queued | TransferState::Requested => style("·").dim(),
        TransferState::Broken => style("✗").red(),
        TransferState::Aborted => style("○").dim(),
    }
}

/// Cut long paths from the left so the file name stays visible
pub fn shorten_path(path: &str, max: usize) -> String {
    let chars = path.chars().count();
    if chars <= max {
        return path.to_string();
    }
    let tail: String = path.chars().skip(chars - max.saturating_sub(3)).collect();
    format!("...{}", tail)
}

pub fn problem_text(summary: &TransferSummary) -> Option<String> {
    let problem = summary.problem?;
    Some(match &summary.problem_info {
        Some(info) => format!("{} ({})", problem, info),
        None => problem.to_string(),
    })
}
