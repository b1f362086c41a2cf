//! Status color mapping for CLI output.
//!
//! `console` disables styling automatically when stdout is not a terminal or
//! `NO_COLOR` is set.

use console::{style, StyledObject};

/// Color for a task status or listener state.
///
/// - Green: completed, enabled
/// - Yellow: processing
/// - Blue: pending
/// - Red: failed
/// - Dim: disabled
pub fn colorize_status(status: &str) -> StyledObject<&str> {
    match status.to_lowercase().as_str() {
        "completed" | "enabled" => style(status).green().bold(),
        "processing" => style(status).yellow(),
        "pending" => style(status).blue(),
        "failed" => style(status).red().bold(),
        "disabled" => style(status).dim(),
        _ => style(status),
    }
}

/// Styled label for detail views (bold + dimmed colon).
pub fn label(name: &str) -> String {
    format!("{}{}", style(name).bold(), style(":").dim())
}
