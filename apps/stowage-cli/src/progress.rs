//! Terminal progress reporting.

use std::io::Write;
use std::sync::Mutex;

use stowage_transfer::{TransferError, TransferId, TransferListener, TransferState};

/// Prints state changes and progress of one transfer to stderr.
pub struct ProgressPrinter {
    label: String,
    /// Last whole percentage printed, to keep output short.
    last_percent: Mutex<Option<u64>>,
}

impl ProgressPrinter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_percent: Mutex::new(None),
        }
    }
}

impl TransferListener for ProgressPrinter {
    fn on_state_changed(&self, id: TransferId, state: TransferState) {
        eprintln!("\n[{id}] {}: {state}", self.label);
    }

    fn on_progress_changed(&self, id: TransferId, bytes_current: u64, bytes_total: u64) {
        let percent = percent(bytes_current, bytes_total);
        if let Ok(mut last) = self.last_percent.lock() {
            if *last == Some(percent) {
                return;
            }
            *last = Some(percent);
        }
        eprint!(
            "\r[{id}] {}: {} / {} ({percent}%)",
            self.label,
            format_bytes(bytes_current),
            format_bytes(bytes_total)
        );
        let _ = std::io::stderr().flush();
    }

    fn on_error(&self, id: TransferId, error: &TransferError) {
        eprintln!("\n[{id}] {}: error: {error}", self.label);
    }
}

fn percent(current: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        current.saturating_mul(100) / total
    }
}

/// Formats bytes in human-readable form.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.2} {}", UNITS[unit_idx])
    }
}
