//! Video display consumer: paces decoded pictures against the clock and
//! hands them to the registered [`VideoSink`]s.
//!
//! [`VideoSink`]: crate::render::VideoSink

use std::sync::Arc;

use crate::codec::HwDevice;
use crate::decoder::{DecoderStrategy, StageContext};
use crate::error::recorder;
use crate::event::{Event, Notification, NotificationQueue};
use crate::hwaccel;
use crate::media::Frame;
use crate::presenter::{Pace, Pacer};
use crate::render::VideoSinks;

pub struct VideoOutput {
    pacer: Pacer,
    sinks: Arc<VideoSinks>,
    device: Option<Arc<dyn HwDevice>>,
    notifications: NotificationQueue<Notification>,
    paused: bool,
}

impl VideoOutput {
    pub fn new(
        pacer: Pacer,
        sinks: Arc<VideoSinks>,
        device: Option<Arc<dyn HwDevice>>,
        notifications: NotificationQueue<Notification>,
    ) -> Self {
        Self {
            pacer,
            sinks,
            device,
            notifications,
            paused: false,
        }
    }
}

impl DecoderStrategy<Frame> for VideoOutput {
    fn handle_event(&mut self, _stage: &StageContext, event: &Event) {
        if let Event::Pause(paused) = event {
            self.paused = *paused;
            self.pacer.set_paused(*paused);
        }
    }

    fn on_seek(&mut self, _stage: &StageContext, position_us: i64) {
        self.pacer.on_seek(position_us);
    }

    fn handle_unit(&mut self, stage: &StageContext, frame: Frame) {
        match self.pacer.pace(stage, frame.pts_us()) {
            Pace::Present => {}
            Pace::Late(delay) => {
                tracing::trace!("video: dropped frame at {}us ({}us late)", frame.pts_us(), -delay);
                self.pacer.stats().dropped();
                return;
            }
            Pace::Stale | Pace::Cancelled => {
                self.pacer.stats().dropped();
                return;
            }
        }

        let frame = match hwaccel::to_host(stage.stream().index, self.device.as_ref(), frame) {
            Ok(frame) => frame,
            Err(e) => {
                let message = recorder().record(&e);
                self.notifications.publish(Notification::Error(message));
                self.pacer.stats().dropped();
                return;
            }
        };

        self.sinks.for_each(|sink| sink.render(&frame));
        self.pacer.stats().rendered();
        self.pacer.report_position();
    }

    fn is_paused(&self) -> bool {
        self.paused
    }
}
