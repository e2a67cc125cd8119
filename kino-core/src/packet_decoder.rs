//! Packet stage: decodes one stream's packets and forwards the frames to
//! that stream's display stage.
//!
//! A fatal decode error invalidates the stage: the error is recorded and
//! notified once, later packets are discarded and sibling streams keep
//! playing.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::{decode_error, or_empty, CodecError, FrameDecoder};
use crate::decoder::{AppendError, DecoderHandle, DecoderStrategy, StageContext};
use crate::error::recorder;
use crate::event::{Event, Notification, NotificationQueue};
use crate::latch::CountdownLatch;
use crate::media::{Frame, Packet};

pub struct PacketStage {
    decoder: Box<dyn FrameDecoder>,
    display: DecoderHandle<Frame>,
    notifications: NotificationQueue<Notification>,
    seek_timeout: Duration,
    valid: bool,
}

impl PacketStage {
    pub fn new(
        decoder: Box<dyn FrameDecoder>,
        display: DecoderHandle<Frame>,
        notifications: NotificationQueue<Notification>,
        seek_timeout: Duration,
    ) -> Self {
        Self {
            decoder,
            display,
            notifications,
            seek_timeout,
            valid: true,
        }
    }

    /// Hand a frame to the display stage. Gives up if this stage is told to
    /// seek or stop while blocked.
    fn forward(&self, stage: &StageContext, mut frame: Frame) -> bool {
        loop {
            let cancelled = || !stage.is_running() || stage.has_pending_seek();
            match self.display.append_unless(frame, &cancelled) {
                Ok(()) => return true,
                Err(AppendError::Closed(_)) => return false,
                Err(AppendError::Interrupted(back)) => {
                    if cancelled() {
                        return false;
                    }
                    frame = back;
                }
            }
        }
    }
}

impl DecoderStrategy<Packet> for PacketStage {
    fn on_seek(&mut self, stage: &StageContext, position_us: i64) {
        self.decoder.flush();

        let latch = Arc::new(CountdownLatch::new(1));
        self.display.add_event(Event::Seek {
            position_us,
            latch: Some(latch.clone()),
        });
        if !latch.wait_timeout(self.seek_timeout) {
            tracing::warn!("{}: display stage did not acknowledge seek", stage.name());
        }
    }

    fn handle_unit(&mut self, stage: &StageContext, packet: Packet) {
        if !self.valid {
            return;
        }

        let result = if packet.is_drain() {
            self.decoder.drain()
        } else {
            self.decoder.decode(&packet)
        };

        match or_empty(result) {
            Ok(frames) => {
                for frame in frames {
                    if !self.forward(stage, frame) {
                        break;
                    }
                }
            }
            Err(CodecError::EndOfStream) => {}
            Err(e) => {
                self.valid = false;
                let error = decode_error(stage.stream().index, e);
                let message = recorder().record(&error);
                self.notifications.publish(Notification::Error(message));
            }
        }
    }
}
