//! 📊 progress.rs: "Are we there yet?", asked once per chunk.
//!
//! 🚀 Tracks bytes moved against the object size, keeps a sliding window for
//! throughput, and paints it on an `indicatif` bar with a small `comfy-table`
//! underneath. When nobody is watching (tests, pipes, `--json`), the bar is
//! hidden but the numbers are still kept for the final summary.
//!
//! ⚠️ Watching the bar will not make the transfer faster. We checked.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

// -- 📏 one mebibyte. not a megabyte. there is a difference and this is the hill.
const MIB: u64 = 1024 * 1024;
const KIB: u64 = 1024;

/// 📦 Bytes, scaled to whatever unit keeps the number readable.
pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

/// ⏱️ MM:SS, or HH:MM:SS for the long hauls.
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 🚀 Average throughput over a whole transfer, in MiB/s. Zero when no time passed.
pub(crate) fn mib_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / MIB as f64) / secs
    } else {
        0.0
    }
}

/// 📊 Bytes moved, rates, and the bar that shows them.
pub(crate) struct TransferProgress {
    /// 🏷️ what's moving, e.g. `get data/2024.csv`
    label: String,
    /// 📏 0 when we don't know in advance (uploads from a pipe, prefix downloads)
    total_size: u64,
    total_bytes: u64,
    progress_bar: ProgressBar,
    /// 🔄 (when, bytes so far); five seconds deep
    rate_samples: VecDeque<(Instant, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- ProgressBar doesn't derive Debug, and printing one would be a choice anyway
        f.debug_struct("TransferProgress")
            .field("label", &self.label)
            .field("total_size", &self.total_size)
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

impl TransferProgress {
    /// 🚀 `visible = false` keeps the bookkeeping and skips the drawing.
    pub(crate) fn new(label: String, total_size: u64, visible: bool) -> Self {
        let progress_bar = if visible {
            ProgressBar::new(total_size)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}]") {
            progress_bar.set_style(style.progress_chars("=>-"));
        }

        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64));

        Self {
            label,
            total_size,
            total_bytes: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 Another `bytes` went through.
    pub(crate) fn update(&mut self, bytes: u64) {
        self.total_bytes += bytes;
        let rate = self.windowed_mib_per_sec();
        self.render(rate);
        self.progress_bar.set_position(self.total_bytes);
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// ✅ Done. The bar stays on screen at its final position.
    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    /// 💀 Gave up. The bar goes away instead of pretending.
    pub(crate) fn abandon(&self) {
        self.progress_bar.abandon();
    }

    /// 📈 MiB/s over the last five seconds, so one slow chunk doesn't read like a stall.
    fn windowed_mib_per_sec(&mut self) -> f64 {
        let now = Instant::now();
        let window = Duration::from_secs(5);
        while let Some(&(timestamp, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > window {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, self.total_bytes));

        match self.rate_samples.front() {
            Some(&(oldest_time, oldest_bytes)) => mib_per_sec(
                self.total_bytes.saturating_sub(oldest_bytes),
                now.duration_since(oldest_time),
            ),
            None => 0.0,
        }
    }

    fn render(&self, rate: f64) {
        let percent = if self.total_size > 0 {
            (self.total_bytes as f64 / self.total_size as f64) * 100.0
        } else {
            0.0
        };
        let elapsed = self.start_time.elapsed();
        let remaining = if percent > 0.0 && percent < 100.0 {
            // 🔮 linear extrapolation; the future looks like the past until it doesn't
            let total_estimated = elapsed.as_secs_f64() / (percent / 100.0);
            format_duration(Duration::from_secs_f64(
                (total_estimated - elapsed.as_secs_f64()).max(0.0),
            ))
        } else {
            "--:--".to_string()
        };
        let moved = if self.total_size > 0 {
            format!(
                "{} / {}",
                format_bytes(self.total_bytes),
                format_bytes(self.total_size)
            )
        } else {
            format_bytes(self.total_bytes)
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{rate:.2} MiB/s")).set_alignment(CellAlignment::Right),
            Cell::new(moved).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{percent:.2}% / {remaining} remaining"))
                .set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar
            .set_message(format!("{}\n{table}", self.label));
    }
}
