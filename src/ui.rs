// UI layer: human-friendly sizes and ratios for the log lines, spinners
// around slow transfers, and the prompt shown before browser authorization.
// Spinners draw to stderr and stay hidden when it is not a terminal.

use anyhow::Result;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const SI_UNITS: [(u64, &str); 6] = [
    (1_000_000_000_000_000, "P"),
    (1_000_000_000_000, "T"),
    (1_000_000_000, "G"),
    (1_000_000, "M"),
    (1_000, "K"),
    (1, "B"),
];

/// Format a byte count with 1000-based prefixes, rounding down to a whole
/// number of units: `999B`, `1K`, `12M`.
pub fn format_size(bytes: u64) -> String {
    let (factor, suffix) = SI_UNITS
        .iter()
        .find(|(factor, _)| bytes >= *factor)
        .copied()
        .unwrap_or((1, "B"));
    format!("{}{}", bytes / factor, suffix)
}

/// Compressed size as a percentage of the original, two decimals.
pub fn format_ratio(compressed: u64, original: u64) -> String {
    if original == 0 {
        return "n/a".into();
    }
    let percent = compressed as f64 / original as f64 * 100.0;
    format!("{:.2}%", percent)
}

/// Start a spinner with `msg`. Callers finish it with `finish_and_clear`.
pub fn spinner(msg: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(msg.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

/// Ask before starting the interactive browser flow.
pub fn confirm_authorization() -> Result<bool> {
    let answer = Confirm::new()
        .with_prompt("No usable credentials found. Authorize access in your browser now?")
        .default(true)
        .interact()?;
    Ok(answer)
}
