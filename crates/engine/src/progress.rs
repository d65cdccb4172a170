//! Progress fan-in across upload workers.
//!
//! Each worker owns one slot of atomic counters; the renderer snapshots
//! them with relaxed loads. Occasional visual glitches are acceptable, the
//! totals are not: `total_sent` advances by exact deltas.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use stowage_core::format::human_bytes;

const BAR_WIDTH: usize = 20;

struct WorkerSlot {
    /// Bytes sent for the block currently in flight.
    sent: AtomicU64,
    /// Size of that block.
    block_size: AtomicU64,
    block_number: AtomicI64,
}

/// Shared per-worker progress counters plus the global accumulator.
pub struct ProgressBook {
    file_size: u64,
    total_sent: AtomicU64,
    workers: Vec<WorkerSlot>,
}

impl ProgressBook {
    /// `initial_sent` seeds the accumulator with the bytes of blocks that
    /// completed in earlier runs, so a resumed upload starts at the right
    /// percentage.
    pub fn new(workers: usize, file_size: u64, initial_sent: u64) -> Self {
        Self {
            file_size,
            total_sent: AtomicU64::new(initial_sent),
            workers: (0..workers)
                .map(|_| WorkerSlot {
                    sent: AtomicU64::new(0),
                    block_size: AtomicU64::new(0),
                    block_number: AtomicI64::new(0),
                })
                .collect(),
        }
    }

    /// Record that worker `worker_id` (1-based) has sent `sent` bytes of
    /// block `block_number` so far.
    ///
    /// The accumulator advances by `sent - prev`; a negative delta means
    /// the worker moved on to a fresh block whose counter restarted, so
    /// the whole running total of the new block is the delta.
    pub fn record(&self, worker_id: usize, block_number: i64, block_size: u64, sent: u64) {
        let slot = &self.workers[worker_id - 1];
        let prev = slot.sent.swap(sent, Ordering::Relaxed);
        slot.block_number.store(block_number, Ordering::Relaxed);
        slot.block_size.store(block_size, Ordering::Relaxed);

        let delta = if sent >= prev { sent - prev } else { sent };
        self.total_sent.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    pub fn percent(&self) -> f64 {
        if self.file_size == 0 {
            return 100.0;
        }
        self.total_sent() as f64 * 100.0 / self.file_size as f64
    }

    /// One `[CNi: bytes]` cell per worker with a block in flight.
    fn worker_cells(&self) -> String {
        let mut cells = Vec::new();
        for (i, slot) in self.workers.iter().enumerate() {
            let sent = slot.sent.load(Ordering::Relaxed);
            let size = slot.block_size.load(Ordering::Relaxed);
            if sent == 0 || sent == size {
                continue;
            }
            cells.push(format!("[CN{}: {}]", i + 1, human_bytes(sent, 1)));
        }
        cells.join(" ")
    }

    /// The full footer line.
    pub fn render_line(&self) -> String {
        let percent = self.percent().min(100.0);
        let line = format!(
            "Uploading: {:.1}% {} [{} sent]",
            percent,
            progress_bar(percent, BAR_WIDTH),
            human_bytes(self.total_sent(), 1),
        );
        let cells = self.worker_cells();
        if cells.is_empty() {
            line
        } else {
            format!("{line} | {cells}")
        }
    }
}

fn progress_bar(percent: f64, width: usize) -> String {
    let filled = ((percent / 100.0) * width as f64).round() as usize;
    let filled = filled.min(width);
    let mut bar = String::with_capacity(width * 3);
    for _ in 0..filled {
        bar.push('█');
    }
    for _ in filled..width {
        bar.push('░');
    }
    bar
}

/// Throttled terminal renderer: rewrites one footer line in place.
pub struct ProgressRenderer {
    last: Mutex<Instant>,
    interval: Duration,
    enabled: bool,
}

impl ProgressRenderer {
    pub fn new(enabled: bool) -> Self {
        Self {
            last: Mutex::new(
                Instant::now()
                    .checked_sub(Duration::from_secs(1))
                    .unwrap_or_else(Instant::now),
            ),
            interval: Duration::from_millis(100),
            enabled,
        }
    }

    /// Redraw the footer if the throttle window has elapsed (or `force`).
    pub fn render(&self, book: &ProgressBook, force: bool) {
        if !self.enabled {
            return;
        }
        {
            let mut last = match self.last.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if !force && last.elapsed() < self.interval {
                return;
            }
            *last = Instant::now();
        }
        eprint!("\r\x1b[2K{}", book.render_line());
    }

    /// Terminate the footer line after the run.
    pub fn finish(&self, book: &ProgressBook) {
        if self.enabled {
            eprintln!("\r\x1b[2K{}", book.render_line());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_accumulate_within_a_block() {
        let book = ProgressBook::new(2, 100, 0);
        book.record(1, 1, 50, 10);
        book.record(1, 1, 50, 25);
        book.record(1, 1, 50, 50);
        assert_eq!(book.total_sent(), 50);
        assert!((book.percent() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counter_reset_means_fresh_block() {
        let book = ProgressBook::new(1, 100, 0);
        book.record(1, 1, 50, 50);
        // Worker starts block 2; its per-worker counter restarted.
        book.record(1, 2, 50, 8);
        assert_eq!(book.total_sent(), 58);
        book.record(1, 2, 50, 50);
        assert_eq!(book.total_sent(), 100);
    }

    #[test]
    fn workers_accumulate_independently() {
        let book = ProgressBook::new(2, 200, 0);
        book.record(1, 1, 100, 40);
        book.record(2, 2, 100, 60);
        book.record(1, 1, 100, 100);
        assert_eq!(book.total_sent(), 160);
    }

    #[test]
    fn initial_seed_counts_toward_percent() {
        let book = ProgressBook::new(1, 100, 75);
        assert_eq!(book.total_sent(), 75);
        book.record(1, 4, 25, 25);
        assert!((book.percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn render_line_shows_in_flight_workers_only() {
        let book = ProgressBook::new(3, 300, 0);
        book.record(1, 1, 100, 100); // finished its block, hidden
        book.record(2, 2, 100, 30); // in flight, shown
        let line = book.render_line();
        assert!(line.starts_with("Uploading: "));
        assert!(line.contains("[CN2: 30 B]"));
        assert!(!line.contains("CN1"));
        assert!(!line.contains("CN3"));
    }

    #[test]
    fn bar_is_fixed_width() {
        for percent in [0.0, 33.3, 100.0] {
            assert_eq!(progress_bar(percent, 20).chars().count(), 20);
        }
        assert_eq!(progress_bar(100.0, 4), "████");
        assert_eq!(progress_bar(0.0, 4), "░░░░");
    }
}
