//! # Engine Configuration
//!
//! Every tunable of the engine in one serde tree. All fields default, so a
//! JSON file only needs the keys it wants to change:
//!
//! ```json
//! { "queue": { "video_frames": 12 }, "sync": { "threshold_us": 40000 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::MediaType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Which side of a stream pipeline a queue feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Demux -> packet decoder.
    Packet,
    /// Packet decoder -> display consumer.
    Frame,
}

// ============================================================================
// Queue Configuration
// ============================================================================

/// Per-media-type queue capacities.
///
/// Audio queues are deeper than video ones: lossless audio arrives in bursts
/// of many small packets and would otherwise stall the demuxer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub audio_packets: usize,
    pub video_packets: usize,
    pub subtitle_packets: usize,
    pub audio_frames: usize,
    pub video_frames: usize,
    pub subtitle_frames: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            audio_packets: 256,
            video_packets: 64,
            subtitle_packets: 64,
            audio_frames: 64,
            video_frames: 8,
            subtitle_frames: 16,
        }
    }
}

impl QueueConfig {
    pub fn capacity(&self, stage: Stage, media_type: MediaType) -> usize {
        match (stage, media_type) {
            (Stage::Packet, MediaType::Audio) => self.audio_packets,
            (Stage::Packet, MediaType::Video) => self.video_packets,
            (Stage::Packet, _) => self.subtitle_packets,
            (Stage::Frame, MediaType::Audio) => self.audio_frames,
            (Stage::Frame, MediaType::Video) => self.video_frames,
            (Stage::Frame, _) => self.subtitle_frames,
        }
    }
}

// ============================================================================
// Sync Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Units within this distance of the master are presented immediately.
    pub threshold_us: i64,
    pub min_speed: f64,
    pub max_speed: f64,
    pub speed_step: f64,
    /// Upper bound for a single pacing wait.
    pub max_wait_us: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            threshold_us: 50_000,
            min_speed: 0.5,
            max_speed: 3.0,
            speed_step: 0.5,
            max_wait_us: 1_000_000,
        }
    }
}

// ============================================================================
// Player Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// How long a seek initiator waits for every decoder to acknowledge.
    pub seek_timeout_ms: u64,
    pub notification_capacity: usize,
    pub position_interval_ms: u64,
    pub cache_speed_interval_ms: u64,
    /// Last-resort back-off when a demuxer reports no data.
    pub idle_sleep_ms: u64,
    pub volume: f32,
    pub gpu_decode: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            seek_timeout_ms: 2_000,
            notification_capacity: 256,
            position_interval_ms: 100,
            cache_speed_interval_ms: 1_000,
            idle_sleep_ms: 5,
            volume: 1.0,
            gpu_decode: false,
        }
    }
}

// ============================================================================
// Transcode Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Threads in the preview/parse pool.
    pub worker_threads: usize,
    pub notification_capacity: usize,
    pub progress_interval_ms: u64,
    pub preview_count: usize,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            notification_capacity: 256,
            progress_interval_ms: 500,
            preview_count: 10,
        }
    }
}

// ============================================================================
// Engine Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub sync: SyncConfig,
    pub player: PlayerConfig,
    pub transcode: TranscodeConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queue;
        let capacities = [
            q.audio_packets,
            q.video_packets,
            q.subtitle_packets,
            q.audio_frames,
            q.video_frames,
            q.subtitle_frames,
        ];
        if capacities.iter().any(|&c| c == 0) {
            return Err(ConfigError::Invalid("queue capacities must be non-zero".into()));
        }

        let s = &self.sync;
        if s.threshold_us < 0 {
            return Err(ConfigError::Invalid("sync threshold must not be negative".into()));
        }
        if !(s.min_speed > 0.0 && s.min_speed <= s.max_speed) {
            return Err(ConfigError::Invalid(format!(
                "speed range [{}, {}] is empty",
                s.min_speed, s.max_speed
            )));
        }
        if s.speed_step <= 0.0 {
            return Err(ConfigError::Invalid("speed step must be positive".into()));
        }

        if !(0.0..=1.0).contains(&self.player.volume) {
            return Err(ConfigError::Invalid("volume must be within 0.0..=1.0".into()));
        }
        if self.player.notification_capacity == 0 || self.transcode.notification_capacity == 0 {
            return Err(ConfigError::Invalid("notification capacity must be non-zero".into()));
        }
        if self.transcode.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker pool needs at least one thread".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(
            config.queue.capacity(Stage::Frame, MediaType::Audio)
                > config.queue.capacity(Stage::Frame, MediaType::Video)
        );
        assert!(
            config.queue.capacity(Stage::Packet, MediaType::Audio)
                > config.queue.capacity(Stage::Packet, MediaType::Video)
        );
    }

    #[test]
    fn test_partial_json() {
        let config =
            EngineConfig::from_json_str(r#"{ "queue": { "video_frames": 3 }, "sync": { "threshold_us": 40000 } }"#)
                .unwrap();
        assert_eq!(config.queue.video_frames, 3);
        assert_eq!(config.queue.audio_frames, QueueConfig::default().audio_frames);
        assert_eq!(config.sync.threshold_us, 40_000);
    }

    #[test]
    fn test_invalid_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "queue": { "audio_frames": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kino.json");
        std::fs::write(&path, r#"{ "player": { "seek_timeout_ms": 500 } }"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.player.seek_timeout_ms, 500);
    }
}
