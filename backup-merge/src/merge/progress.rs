//! Progress tracking for the merge executor.
//!
//! Counters are shared by all workers of one run and only ever increase.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Progress of one executor run
#[derive(Debug)]
pub struct MergeProgress {
    total_files: usize,
    files_processed: AtomicUsize,
    bytes_written: AtomicU64,
    start_time: Instant,
    /// Log every processed file
    verbose: bool,
}

impl MergeProgress {
    pub fn new(total_files: usize, verbose: bool) -> Self {
        Self {
            total_files,
            files_processed: AtomicUsize::new(0),
            bytes_written: AtomicU64::new(0),
            start_time: Instant::now(),
            verbose,
        }
    }

    /// Announce the entry at manifest position `index`.
    pub fn file_started(&self, index: usize, path: &str) {
        if self.verbose {
            info!("Progress: ({}/{}). Process file \"{}\"", index + 1, self.total_files, path);
        }
    }

    pub fn file_done(&self, bytes: u64) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn files_processed(&self) -> usize {
        self.files_processed.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.bytes_written() as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn log_summary(&self) {
        info!(
            "Merged {} of {} files, {} in {} ({})",
            self.files_processed(),
            self.total_files,
            format_bytes(self.bytes_written()),
            format_duration(self.elapsed().as_secs()),
            format_speed(self.average_speed())
        );
    }
}

/// Binary multiples, two decimals: `24576` is `"24.00 KB"`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let exponent = (0..UNITS.len() - 1)
        .take_while(|&e| bytes >= 1u64 << (10 * (e + 1)))
        .count();
    let scaled = bytes as f64 / (1u64 << (10 * exponent)) as f64;
    format!("{:.2} {}", scaled, UNITS[exponent])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Two most significant units of an elapsed time in seconds.
pub fn format_duration(seconds: u64) -> String {
    let (hours, minutes, secs) = (seconds / 3600, seconds / 60 % 60, seconds % 60);
    match (hours, minutes) {
        (0, 0) => format!("{secs}s"),
        (0, _) => format!("{minutes}m {secs}s"),
        _ => format!("{hours}h {minutes}m"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_across_threads() {
        let progress = MergeProgress::new(100, false);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        progress.file_done(10);
                    }
                });
            }
        });
        assert_eq!(progress.files_processed(), 100);
        assert_eq!(progress.bytes_written(), 1000);
    }

    #[test]
    fn test_summary_units() {
        // one relation segment, one WAL segment per second, a long merge
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
        assert_eq!(format_speed(16 * 1024 * 1024), "16.00 MB/s");
        assert_eq!(format_bytes(8192 * 3), "24.00 KB");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(7322), "2h 2m");
    }
}
