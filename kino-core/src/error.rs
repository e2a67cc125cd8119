//! # Errors
//!
//! Engine-wide error taxonomy plus the process-wide error recorder.
//!
//! Every failure coming out of the codec boundary is funnelled through
//! [`recorder()`], which keeps a bounded ring of recent errors so the UI can
//! always show the most recent message. Transient "no output yet" results
//! never reach this module; they are plain values of [`CodecError::Again`].
//!
//! [`CodecError::Again`]: crate::codec::CodecError::Again

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("Decode failed on stream {stream}: {reason}")]
    Decode { stream: usize, reason: String },
    #[error("Encode failed on stream {stream}: {reason}")]
    Encode { stream: usize, reason: String },
    #[error("Filter init failed on stream {stream}: {reason}")]
    FilterInit { stream: usize, reason: String },
    #[error("Filtering failed on stream {stream}: {reason}")]
    Filter { stream: usize, reason: String },
    #[error("Hardware transfer failed on stream {stream}: {reason}")]
    HardwareTransfer { stream: usize, reason: String },
    #[error("Hardware device unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("Codec not found: {0}")]
    CodecNotFound(String),
    #[error("Stream {0} not found")]
    StreamNotFound(usize),
    #[error("Mux error: {0}")]
    Mux(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    pub fn open(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Open {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Open { .. } | Self::Io(_) => ErrorKind::Open,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Encode { .. } => ErrorKind::Encode,
            Self::FilterInit { .. } | Self::Filter { .. } => ErrorKind::FilterInit,
            Self::HardwareTransfer { .. } | Self::HardwareUnavailable(_) => ErrorKind::Hardware,
            Self::CodecNotFound(_) => ErrorKind::Open,
            Self::StreamNotFound(_) | Self::InvalidState(_) | Self::Config(_) => ErrorKind::Usage,
            Self::Mux(_) => ErrorKind::Mux,
        }
    }

    /// Stream the error is scoped to, when it does not concern the whole session.
    pub fn stream(&self) -> Option<usize> {
        match self {
            Self::Decode { stream, .. }
            | Self::Encode { stream, .. }
            | Self::FilterInit { stream, .. }
            | Self::Filter { stream, .. }
            | Self::HardwareTransfer { stream, .. } => Some(*stream),
            Self::StreamNotFound(stream) => Some(*stream),
            _ => None,
        }
    }

    /// Errors that abort the whole session or transcode run.
    /// Everything else fails a single stream while its siblings continue.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::Open { .. } | Self::Io(_) | Self::Mux(_) | Self::Config(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Open,
    Decode,
    Encode,
    FilterInit,
    Hardware,
    Mux,
    Usage,
}

// ============================================================================
// Error Recorder
// ============================================================================

/// One entry in the recorder ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub stream: Option<usize>,
    pub message: String,
    pub at: SystemTime,
}

pub const RECORDER_CAPACITY: usize = 64;

/// Bounded ring of recent errors shared by every session in the process.
pub struct ErrorRecorder {
    ring: Mutex<VecDeque<RecordedError>>,
    capacity: usize,
}

impl ErrorRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Record an error and return the message that should be surfaced.
    pub fn record(&self, error: &MediaError) -> String {
        let message = error.to_string();
        let entry = RecordedError {
            kind: error.kind(),
            stream: error.stream(),
            message: message.clone(),
            at: SystemTime::now(),
        };

        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
        drop(ring);

        tracing::warn!("{}", message);
        message
    }

    pub fn last(&self) -> Option<RecordedError> {
        self.ring.lock().back().cloned()
    }

    pub fn recent(&self) -> Vec<RecordedError> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn clear(&self) {
        self.ring.lock().clear();
    }
}

static RECORDER: Lazy<ErrorRecorder> = Lazy::new(|| ErrorRecorder::new(RECORDER_CAPACITY));

/// The process-wide recorder.
pub fn recorder() -> &'static ErrorRecorder {
    &RECORDER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded() {
        let recorder = ErrorRecorder::new(3);
        for stream in 0..5 {
            recorder.record(&MediaError::Decode {
                stream,
                reason: "corrupt".into(),
            });
        }

        let recent = recorder.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].stream, Some(2));
        assert_eq!(recorder.last().and_then(|e| e.stream), Some(4));
    }

    #[test]
    fn test_error_scope() {
        let open = MediaError::open("/nope.kraw", "not found");
        assert!(open.is_fatal_to_session());
        assert_eq!(open.kind(), ErrorKind::Open);

        let transfer = MediaError::HardwareTransfer {
            stream: 1,
            reason: "lost surface".into(),
        };
        assert!(!transfer.is_fatal_to_session());
        assert_eq!(transfer.stream(), Some(1));
    }

    #[test]
    fn test_record_returns_message() {
        let recorder = ErrorRecorder::new(4);
        let msg = recorder.record(&MediaError::CodecNotFound("h266".into()));
        assert_eq!(msg, "Codec not found: h266");
        recorder.clear();
        assert!(recorder.is_empty());
    }
}
