//! Transcode statistics and the throttled progress publisher.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::context::StreamStats;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscodeStats {
    pub packets_read: u64,
    pub frames_decoded: u64,
    pub frames_encoded: u64,
    /// Packets written, keyed by output stream index.
    pub packets_written: BTreeMap<usize, u64>,
    /// Input position reached, in µs.
    pub position_us: i64,
    pub duration_us: i64,
    pub elapsed_ms: u64,
    /// Average encoded frames per second over the run.
    pub fps: f64,
}

impl TranscodeStats {
    /// Completion percentage in [0, 100]; 0 when the duration is unknown.
    pub fn progress(&self) -> f64 {
        if self.duration_us <= 0 {
            return 0.0;
        }
        (self.position_us as f64 / self.duration_us as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn total_packets_written(&self) -> u64 {
        self.packets_written.values().sum()
    }

    /// Ratio of media time processed to wall time.
    pub fn speed(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.position_us as f64 / 1_000.0 / self.elapsed_ms as f64
    }
}

/// Accumulates per-stream counters and decides when progress is due.
pub struct ProgressTracker {
    started: Instant,
    interval: Duration,
    last_report: Option<Instant>,
    stats: TranscodeStats,
}

impl ProgressTracker {
    pub fn new(duration_us: i64, interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            interval,
            last_report: None,
            stats: TranscodeStats {
                duration_us,
                ..TranscodeStats::default()
            },
        }
    }

    pub fn advance(&mut self, position_us: i64) {
        self.stats.position_us = self.stats.position_us.max(position_us);
    }

    /// Recompute totals from the streams' own counters.
    pub fn update(&mut self, streams: impl IntoIterator<Item = (usize, StreamStats)>) {
        let mut packets_read = 0;
        let mut frames_decoded = 0;
        let mut frames_encoded = 0;
        self.stats.packets_written.clear();
        for (output, stream) in streams {
            packets_read += stream.packets_read;
            frames_decoded += stream.frames_decoded;
            frames_encoded += stream.frames_encoded;
            self.stats.packets_written.insert(output, stream.packets_written);
        }
        self.stats.packets_read = packets_read;
        self.stats.frames_decoded = frames_decoded;
        self.stats.frames_encoded = frames_encoded;

        let elapsed = self.started.elapsed();
        self.stats.elapsed_ms = elapsed.as_millis() as u64;
        let secs = elapsed.as_secs_f64();
        self.stats.fps = if secs > 0.0 { frames_encoded as f64 / secs } else { 0.0 };
    }

    /// True at most once per interval.
    pub fn due(&mut self) -> bool {
        let now = Instant::now();
        match self.last_report {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_report = Some(now);
                true
            }
        }
    }

    pub fn stats(&self) -> &TranscodeStats {
        &self.stats
    }

    pub fn into_stats(self) -> TranscodeStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let mut stats = TranscodeStats {
            duration_us: 2_000_000,
            ..TranscodeStats::default()
        };
        assert_eq!(stats.progress(), 0.0);
        stats.position_us = 500_000;
        assert_eq!(stats.progress(), 25.0);
        stats.position_us = 3_000_000;
        assert_eq!(stats.progress(), 100.0);
        stats.duration_us = 0;
        assert_eq!(stats.progress(), 0.0);
    }

    #[test]
    fn test_tracker_totals_and_throttle() {
        let mut tracker = ProgressTracker::new(1_000_000, Duration::from_secs(60));
        let video = StreamStats {
            packets_read: 10,
            frames_decoded: 10,
            frames_encoded: 10,
            packets_written: 9,
        };
        let audio = StreamStats {
            packets_read: 4,
            frames_decoded: 4,
            frames_encoded: 2,
            packets_written: 2,
        };
        tracker.update([(0, video), (1, audio)]);
        tracker.advance(400_000);
        tracker.advance(300_000);

        let stats = tracker.stats();
        assert_eq!(stats.packets_read, 14);
        assert_eq!(stats.frames_encoded, 12);
        assert_eq!(stats.total_packets_written(), 11);
        assert_eq!(stats.packets_written.get(&1), Some(&2));
        assert_eq!(stats.position_us, 400_000);

        assert!(tracker.due());
        assert!(!tracker.due());
    }
}
