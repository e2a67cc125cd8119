//! Pacing shared by the display consumers: clock reset on the first unit,
//! clock update, delay against the master, drop or wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SyncContext};
use crate::decoder::StageContext;
use crate::event::{Notification, NotificationQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    Present,
    /// Too late to show; carries the rejected delay.
    Late(i64),
    /// Clock belongs to an older seek generation.
    Stale,
    /// Waiting was interrupted by a seek or shutdown.
    Cancelled,
}

/// Rendered/dropped counters of one display consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    rendered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerCounts {
    pub rendered: u64,
    pub dropped: u64,
}

impl ConsumerStats {
    pub fn rendered(&self) {
        self.rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counts(&self) -> ConsumerCounts {
        ConsumerCounts {
            rendered: self.rendered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct Pacer {
    clock: Arc<Clock>,
    sync: Arc<SyncContext>,
    first_unit: bool,
    stats: Arc<ConsumerStats>,
    reporter: Option<PositionReporter>,
}

impl Pacer {
    pub fn new(clock: Arc<Clock>, sync: Arc<SyncContext>, stats: Arc<ConsumerStats>) -> Self {
        Self {
            clock,
            sync,
            first_unit: true,
            stats,
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, notifications: NotificationQueue<Notification>, interval: Duration) -> Self {
        self.reporter = Some(PositionReporter {
            notifications,
            interval_us: interval.as_micros() as i64,
            last_report: None,
        });
        self
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn speed(&self) -> f64 {
        self.sync.speed()
    }

    /// Run the pacing steps for a unit at `pts_us`.
    pub fn pace(&mut self, stage: &StageContext, pts_us: i64) -> Pace {
        let now = self.sync.now_us();
        if self.first_unit {
            self.clock.reset_at(&self.sync, pts_us, now);
            self.first_unit = false;
        }
        self.clock.update(&self.sync, pts_us, now);

        let Some(delay) = self.clock.delay_with_master(&self.sync) else {
            return Pace::Stale;
        };
        let Some(wait_us) = self.clock.adjust_delay(&self.sync, delay) else {
            return Pace::Late(delay);
        };

        let wait_us = wait_us.min(self.sync.config().max_wait_us);
        if wait_us > 0 && !stage.wait_unless_seek(Duration::from_micros(wait_us as u64)) {
            return Pace::Cancelled;
        }
        Pace::Present
    }

    /// After a seek: the next unit restarts the clock.
    pub fn on_seek(&mut self, position_us: i64) {
        self.clock.reset(&self.sync, position_us);
        self.first_unit = true;
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.last_report = None;
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.clock.set_paused(paused, self.sync.now_us());
    }

    /// Publish the playback position if this consumer drives the master clock.
    pub fn report_position(&mut self) {
        let Some(reporter) = self.reporter.as_mut() else {
            return;
        };
        if !self.sync.is_master(&self.clock) {
            return;
        }
        let now = self.sync.now_us();
        if let Some(last) = reporter.last_report {
            if now - last < reporter.interval_us {
                return;
            }
        }
        reporter.last_report = Some(now);
        if let Some(position) = self.sync.position_us() {
            reporter.notifications.publish(Notification::Position(position));
        }
    }
}

struct PositionReporter {
    notifications: NotificationQueue<Notification>,
    interval_us: i64,
    last_report: Option<i64>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::event::{Event, EventChannel};
    use crate::media::{MediaType, Rational, StreamInfo};
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    /// A stage context detached from any decoder thread.
    pub(crate) fn stage(media_type: MediaType) -> (StageContext, Arc<EventChannel>, Arc<AtomicBool>) {
        let events = Arc::new(EventChannel::new());
        let running = Arc::new(AtomicBool::new(true));
        let stream = StreamInfo::new(0, media_type, "test", Rational::new(1, 1_000_000));
        let ctx = StageContext::new("test", stream, events.clone(), running.clone());
        (ctx, events, running)
    }

    /// Audio master pinned at `master_pts` now, plus a video pacer.
    fn video_against_audio(master_pts: i64) -> (Arc<SyncContext>, Arc<Clock>, Pacer) {
        let sync = SyncContext::new(SyncConfig::default());
        let audio = Clock::new(MediaType::Audio);
        sync.set_master(Some(audio.clone()));
        audio.reset(&sync, master_pts);
        let pacer = Pacer::new(Clock::new(MediaType::Video), sync.clone(), Arc::new(ConsumerStats::default()));
        (sync, audio, pacer)
    }

    #[test]
    fn test_late_unit_is_rejected() {
        let (_sync, _audio, mut pacer) = video_against_audio(10_000_000);
        let (stage, _, _) = stage(MediaType::Video);
        assert!(matches!(pacer.pace(&stage, 0), Pace::Late(d) if d <= -10_000_000));
    }

    #[test]
    fn test_small_lag_dropped_only_when_fast() {
        let (sync, _audio, mut pacer) = video_against_audio(1_000_000);
        let (stage, _, _) = stage(MediaType::Video);
        assert_eq!(pacer.pace(&stage, 990_000), Pace::Present);

        assert_eq!(sync.set_speed(1.5), 1.5);
        assert!(matches!(pacer.pace(&stage, 995_000), Pace::Late(_)));
    }

    #[test]
    fn test_stale_until_seek_resets_clock() {
        let (sync, audio, mut pacer) = video_against_audio(0);
        let (stage, _, _) = stage(MediaType::Video);
        assert_eq!(pacer.pace(&stage, 0), Pace::Present);

        sync.serial_ref();
        assert_eq!(pacer.pace(&stage, 40_000), Pace::Stale);

        audio.reset(&sync, 5_000_000);
        pacer.on_seek(5_000_000);
        assert_eq!(pacer.clock().serial(), sync.serial());
        assert_eq!(pacer.pace(&stage, 5_000_000), Pace::Present);
    }

    #[test]
    fn test_early_unit_waits_through_other_events() {
        let (_sync, _audio, mut pacer) = video_against_audio(0);
        let (stage, events, _) = stage(MediaType::Video);
        assert_eq!(pacer.pace(&stage, 0), Pace::Present);

        events.push(Event::Volume(0.5)).unwrap();
        let start = Instant::now();
        // 300ms early, 50ms of it inside the threshold
        assert_eq!(pacer.pace(&stage, 300_000), Pace::Present);
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(events.has_pending());
    }

    #[test]
    fn test_seek_or_stop_cancels_wait() {
        let (_sync, _audio, mut pacer) = video_against_audio(0);
        let (stage, events, running) = stage(MediaType::Video);
        assert_eq!(pacer.pace(&stage, 0), Pace::Present);

        events.push(Event::seek(0)).unwrap();
        let start = Instant::now();
        assert_eq!(pacer.pace(&stage, 800_000), Pace::Cancelled);
        assert!(start.elapsed() < Duration::from_millis(500));

        events.drain();
        running.store(false, Ordering::SeqCst);
        events.close();
        assert_eq!(pacer.pace(&stage, 800_000), Pace::Cancelled);
    }

    #[test]
    fn test_position_reported_by_master_only_and_throttled() {
        let sync = SyncContext::new(SyncConfig::default());
        let notifications = NotificationQueue::new(16);
        let audio = Clock::new(MediaType::Audio);
        let video = Clock::new(MediaType::Video);
        sync.set_master(Some(audio.clone()));
        audio.reset(&sync, 0);

        let interval = Duration::from_secs(60);
        let mut master = Pacer::new(audio, sync.clone(), Arc::new(ConsumerStats::default()))
            .with_reporter(notifications.clone(), interval);
        let mut slave = Pacer::new(video, sync.clone(), Arc::new(ConsumerStats::default()))
            .with_reporter(notifications.clone(), interval);

        slave.report_position();
        assert!(notifications.is_empty());

        master.report_position();
        master.report_position();
        let published = notifications.poll();
        assert_eq!(published.len(), 1);
        assert!(matches!(published[0], Notification::Position(_)));

        master.on_seek(2_000_000);
        master.report_position();
        assert!(matches!(
            notifications.poll().as_slice(),
            [Notification::Position(p)] if *p >= 2_000_000
        ));
    }
}
