//! Transfer progress display.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const PIECE_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} pieces ({eta})";

/// Piece acknowledgement progress for one upload
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a tracker for `total_pieces` pieces of `filename`
    #[must_use]
    pub fn new(total_pieces: u64, filename: &str) -> Self {
        let bar = ProgressBar::new(total_pieces);
        let style = ProgressStyle::default_bar()
            .template(PIECE_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(format!("Uploading: {filename}"));
        Self { bar }
    }

    /// Spinner for work of unknown length
    #[must_use]
    pub fn spinner(msg: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(msg.to_string());
        Self { bar }
    }

    /// Record `acked` of `total` pieces
    pub fn update(&self, acked: u32, total: u32) {
        self.bar.set_length(u64::from(total));
        self.bar.set_position(u64::from(acked));
    }

    /// Replace the message line
    pub fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self, msg: String) {
        self.bar.abandon_with_message(msg);
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(1024_u64.pow(4)), "1.00 TB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m");
    }

    #[test]
    fn test_progress_updates_length() {
        let progress = TransferProgress::new(0, "notes.txt");
        progress.update(2, 4);
        assert_eq!(progress.bar.length(), Some(4));
        assert_eq!(progress.bar.position(), 2);
        progress.finish_with_message("done".to_string());
    }
}
