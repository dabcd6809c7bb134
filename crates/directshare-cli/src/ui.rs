//! UI utilities for the DirectShare CLI.

use std::io::{self, Write};
use std::time::Duration;

use directshare_core::file::{format_size, format_speed};
use directshare_core::transfer::{TransferProgress, TransferResult};

const BOX_WIDTH: usize = 33;
const BAR_WIDTH: usize = 24;

/// A formatted box for displaying the address joiners should use.
pub struct AddressBox<'a> {
    address: &'a str,
    device: Option<&'a str>,
}

impl<'a> AddressBox<'a> {
    /// Create a new address box.
    #[must_use]
    pub const fn new(address: &'a str) -> Self {
        Self {
            address,
            device: None,
        }
    }

    /// Add the hosting device name to the box.
    #[must_use]
    pub const fn with_device(mut self, device: &'a str) -> Self {
        self.device = Some(device);
        self
    }

    /// Display the address box to stdout.
    pub fn display(&self) {
        println!("  ┌{}┐", "─".repeat(BOX_WIDTH));
        println!("  │{}│", " ".repeat(BOX_WIDTH));
        println!("  │{}│", center_in_box(self.address, BOX_WIDTH));
        println!("  │{}│", " ".repeat(BOX_WIDTH));

        if let Some(device) = self.device {
            println!("  │{}│", center_in_box(device, BOX_WIDTH));
            println!("  │{}│", " ".repeat(BOX_WIDTH));
        }

        println!("  └{}┘", "─".repeat(BOX_WIDTH));
    }
}

fn center_in_box(content: &str, width: usize) -> String {
    let content_len = content.chars().count();
    let padding = width.saturating_sub(content_len);
    let left = padding / 2;
    let right = padding - left;
    format!("{}{}{}", " ".repeat(left), content, " ".repeat(right))
}

/// Parse a duration string like "5m", "30s", or "1h".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(num_str) = s.strip_suffix('m') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num * 60))
    } else if let Some(num_str) = s.strip_suffix('s') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num))
    } else if let Some(num_str) = s.strip_suffix('h') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num * 3600))
    } else {
        None
    }
}

/// Render a progress bar for a percentage in 0..=100.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn progress_bar(percentage: f64, width: usize) -> String {
    let filled = ((percentage.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

/// One-line summary of a transfer in flight.
pub fn progress_line(progress: &TransferProgress) -> String {
    let name = progress.file_name().unwrap_or_else(|| "…".to_string());
    format!(
        "  {:20} [{}] {:5.1}%  {} / {}  {}",
        truncate_string(&name, 20),
        progress_bar(progress.progress_percentage, BAR_WIDTH),
        progress.progress_percentage,
        format_size(progress.bytes_transferred),
        format_size(progress.total_bytes),
        format_speed(progress.speed),
    )
}

/// Redraw the progress line in place.
pub fn print_progress(progress: &TransferProgress) {
    print!("\r{}", progress_line(progress));
    let _ = io::stdout().flush();
}

/// Print the final line for a finished transfer.
pub fn print_result(result: &TransferResult) {
    let name = result
        .file_path
        .as_ref()
        .and_then(|p| p.file_name())
        .map_or_else(|| result.transfer_id.clone(), |n| n.to_string_lossy().into_owned());

    println!();
    if result.success {
        println!("  ✓ {} ({})", name, format_size(result.bytes_transferred));
    } else {
        println!(
            "  ✗ {}: {}",
            name,
            result.error_message.as_deref().unwrap_or("failed")
        );
    }
}

/// Truncate a string to a maximum display width.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
