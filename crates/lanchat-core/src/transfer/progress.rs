//! File transfer progress tracking
//!
//! [`ProgressMeter`] samples the running byte count and derives throughput
//! over a short rolling window; [`TransferProgress`] is the snapshot handed
//! to UIs.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::TransferKey;
use super::state::{TransferDirection, TransferState};

/// Integer percent complete, clamped to 100. An empty file is always 100%.
pub fn percent_complete(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (u128::from(bytes) * 100 / u128::from(total)).min(100);
    percent as u8
}

/// Rolling-window throughput meter that also rate-limits progress reports
#[derive(Debug)]
pub struct ProgressMeter {
    window: Duration,
    interval: Duration,
    samples: VecDeque<(Instant, u64)>,
    last_report: Option<Instant>,
}

impl ProgressMeter {
    /// Create a meter averaging over `window` and reporting at most every
    /// `interval`
    pub fn new(window: Duration, interval: Duration) -> Self {
        Self {
            window,
            interval,
            samples: VecDeque::new(),
            last_report: None,
        }
    }

    /// Record the running total at `now`.
    ///
    /// Returns the current speed when a progress report is due.
    pub fn record(&mut self, now: Instant, total_bytes: u64) -> Option<f64> {
        self.samples.push_back((now, total_bytes));
        while let Some(&(at, _)) = self.samples.front() {
            if self.samples.len() > 2 && now.duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let due = self
            .last_report
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            self.last_report = Some(now);
            Some(self.speed())
        } else {
            None
        }
    }

    /// Bytes per second across the samples in the window
    pub fn speed(&self) -> f64 {
        let (Some(&(first_at, first_bytes)), Some(&(last_at, last_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };

        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        last_bytes.saturating_sub(first_bytes) as f64 / elapsed
    }
}

/// Progress snapshot of one transfer
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Transfer key
    pub key: TransferKey,

    /// Direction
    pub direction: TransferDirection,

    /// Current state
    pub state: TransferState,

    /// Bytes moved so far
    pub bytes_transferred: u64,

    /// Total bytes
    pub bytes_total: u64,

    /// Last sampled speed in bytes/second
    pub speed_bytes_per_sec: f64,

    /// Estimated time remaining
    pub eta: Option<Duration>,

    /// Integer percent complete
    pub percent: u8,
}

impl TransferProgress {
    /// Build a snapshot, deriving percent and ETA
    pub fn new(
        key: TransferKey,
        direction: TransferDirection,
        state: TransferState,
        bytes_transferred: u64,
        bytes_total: u64,
        speed_bytes_per_sec: f64,
    ) -> Self {
        let eta = if speed_bytes_per_sec > 0.0 && bytes_transferred < bytes_total {
            let remaining = (bytes_total - bytes_transferred) as f64;
            Some(Duration::from_secs_f64(remaining / speed_bytes_per_sec))
        } else {
            None
        };

        Self {
            key,
            direction,
            state,
            bytes_transferred,
            bytes_total,
            speed_bytes_per_sec,
            eta,
            percent: percent_complete(bytes_transferred, bytes_total),
        }
    }

    /// Check if transfer is complete
    pub fn is_complete(&self) -> bool {
        matches!(self.state, TransferState::Completed)
    }

    /// Check if transfer has failed
    pub fn is_failed(&self) -> bool {
        matches!(self.state, TransferState::Failed)
    }

    /// Get human-readable ETA string
    pub fn eta_string(&self) -> String {
        match self.eta {
            Some(duration) => {
                let seconds = duration.as_secs();
                if seconds < 60 {
                    format!("{seconds}s")
                } else if seconds < 3600 {
                    format!("{}m {}s", seconds / 60, seconds % 60)
                } else {
                    format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
                }
            }
            None if self.is_complete() => "Complete".to_string(),
            None if self.is_failed() => "Failed".to_string(),
            None => "Calculating...".to_string(),
        }
    }

    /// Get human-readable speed string
    pub fn speed_string(&self) -> String {
        let speed = self.speed_bytes_per_sec;
        if speed < 1024.0 {
            format!("{speed:.2} B/s")
        } else if speed < 1024.0 * 1024.0 {
            format!("{:.2} KiB/s", speed / 1024.0)
        } else if speed < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MiB/s", speed / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GiB/s", speed / (1024.0 * 1024.0 * 1024.0))
        }
    }
}
