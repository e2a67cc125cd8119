//! # Presentation Clock
//!
//! Per-stream clocks with drift correction against one master clock.
//!
//! Every clock samples `(pts, now)` pairs. The master clock tracks how far
//! its own stream has run ahead of wall time; every other clock measures its
//! drift against the master's latest sample rather than its own history, so
//! the value is directly the skew between the two streams.
//!
//! Session-wide state (seek serial, speed multiplier, master pointer) lives
//! in a [`SyncContext`] that is passed explicitly to every clock operation.
//! The master is written once per session by the orchestrator.
//!
//! All times are integer microseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::config::SyncConfig;
use crate::media::MediaType;

// ============================================================================
// Sync Context
// ============================================================================

pub struct SyncContext {
    serial: AtomicU64,
    speed_bits: AtomicU64,
    master: RwLock<Option<Arc<Clock>>>,
    epoch: Instant,
    config: SyncConfig,
}

impl SyncContext {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            serial: AtomicU64::new(0),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            master: RwLock::new(None),
            epoch: Instant::now(),
            config,
        })
    }

    /// Wall time since the context was created.
    pub fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn threshold_us(&self) -> i64 {
        self.config.threshold_us
    }

    // ------------------------------------------------------------------------
    // Seek serial
    // ------------------------------------------------------------------------

    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::SeqCst)
    }

    /// Start a new seek generation. Delays computed by clocks of an older
    /// generation are discarded from now on.
    pub fn serial_ref(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn serial_reset(&self) {
        self.serial.store(0, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Speed
    // ------------------------------------------------------------------------

    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::SeqCst))
    }

    /// Clamp to the configured range and snap to the step. Returns the
    /// speed actually applied.
    pub fn set_speed(&self, speed: f64) -> f64 {
        if !speed.is_finite() {
            return self.speed();
        }
        let cfg = &self.config;
        let steps = ((speed - cfg.min_speed) / cfg.speed_step).round();
        let snapped = (cfg.min_speed + steps * cfg.speed_step).clamp(cfg.min_speed, cfg.max_speed);
        self.speed_bits.store(snapped.to_bits(), Ordering::SeqCst);
        snapped
    }

    // ------------------------------------------------------------------------
    // Master
    // ------------------------------------------------------------------------

    pub fn set_master(&self, clock: Option<Arc<Clock>>) {
        if let Some(clock) = &clock {
            tracing::debug!("Master clock: {}", clock.media_type().label());
        }
        *self.master.write() = clock;
    }

    pub fn master(&self) -> Option<Arc<Clock>> {
        self.master.read().clone()
    }

    pub fn is_master(&self, clock: &Clock) -> bool {
        match &*self.master.read() {
            Some(master) => std::ptr::eq(Arc::as_ptr(master), clock),
            None => false,
        }
    }

    /// Extrapolated playback position of the master clock.
    pub fn position_us(&self) -> Option<i64> {
        self.master().map(|m| m.position_at(self.speed(), self.now_us()))
    }
}

// ============================================================================
// Clock
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSnapshot {
    pub pts: i64,
    pub drift: i64,
    pub last_updated: i64,
    pub serial: u64,
    pub paused: bool,
}

pub struct Clock {
    media_type: MediaType,
    state: Mutex<ClockSnapshot>,
}

impl Clock {
    pub fn new(media_type: MediaType) -> Arc<Self> {
        Arc::new(Self {
            media_type,
            state: Mutex::new(ClockSnapshot {
                pts: 0,
                drift: 0,
                last_updated: 0,
                serial: 0,
                paused: false,
            }),
        })
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        *self.state.lock()
    }

    pub fn serial(&self) -> u64 {
        self.state.lock().serial
    }

    pub fn pts(&self) -> i64 {
        self.state.lock().pts
    }

    pub fn reset(&self, ctx: &SyncContext, pts: i64) {
        self.reset_at(ctx, pts, ctx.now_us());
    }

    /// Reinitialise to `pts` at `now` under the current seek generation.
    pub fn reset_at(&self, ctx: &SyncContext, pts: i64, now: i64) {
        let serial = ctx.serial();
        let mut state = self.state.lock();
        state.pts = pts;
        state.drift = 0;
        state.last_updated = now;
        state.serial = serial;
    }

    /// Feed a presented unit's pts sampled at wall time `now`.
    pub fn update(&self, ctx: &SyncContext, pts: i64, now: i64) {
        let speed = ctx.speed();
        let master = ctx.master().filter(|m| !std::ptr::eq(Arc::as_ptr(m), self));

        match master {
            None => {
                let mut state = self.state.lock();
                let elapsed = if state.paused { 0 } else { now - state.last_updated };
                let timediff = (elapsed as f64 * speed) as i64;
                state.drift += pts - state.pts - timediff;
                state.pts = pts;
                state.last_updated = now;
            }
            Some(master) => {
                // Master state is sampled before taking our own lock.
                let m = master.snapshot();
                let master_pts = m.pts - m.drift;
                let elapsed = if m.paused { 0 } else { now - m.last_updated };
                let timediff = (elapsed as f64 * speed) as i64;

                let mut state = self.state.lock();
                state.drift = pts - master_pts - timediff;
                state.pts = pts;
                state.last_updated = now;
            }
        }
    }

    /// Current drift, or `None` if this clock belongs to a stale seek generation.
    pub fn delay_with_master(&self, ctx: &SyncContext) -> Option<i64> {
        let state = self.state.lock();
        if state.serial != ctx.serial() {
            return None;
        }
        Some(state.drift)
    }

    /// Turn a drift into a wait, or `None` when the unit must be dropped.
    pub fn adjust_delay(&self, ctx: &SyncContext, delay: i64) -> Option<i64> {
        adjust_delay(delay, ctx.threshold_us(), ctx.speed())
    }

    pub fn set_paused(&self, paused: bool, now: i64) {
        let mut state = self.state.lock();
        if state.paused == paused {
            return;
        }
        if !paused {
            state.last_updated = now;
        }
        state.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Position this clock would present at `now`.
    pub fn position_at(&self, speed: f64, now: i64) -> i64 {
        let state = self.state.lock();
        let base = state.pts - state.drift;
        if state.paused {
            return base;
        }
        base + ((now - state.last_updated) as f64 * speed) as i64
    }
}

/// Pacing rule shared by every consumer.
///
/// Late units beyond the threshold are dropped, units within it are shown
/// at once, early units wait for the part of the drift beyond the threshold.
/// While playing faster than real time any late unit is dropped.
pub fn adjust_delay(delay: i64, threshold: i64, speed: f64) -> Option<i64> {
    if speed > 1.0 && delay < 0 {
        return None;
    }
    if delay < -threshold {
        return None;
    }
    if delay.abs() <= threshold {
        return Some(0);
    }
    Some(delay - threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<SyncContext> {
        SyncContext::new(SyncConfig::default())
    }

    #[test]
    fn test_self_master_reset_update_zero_delay() {
        let ctx = ctx();
        let clock = Clock::new(MediaType::Audio);
        ctx.set_master(Some(clock.clone()));
        assert!(ctx.is_master(&clock));

        clock.reset_at(&ctx, 1_000_000, 250);
        clock.update(&ctx, 1_000_000, 250);
        assert_eq!(clock.delay_with_master(&ctx), Some(0));
    }

    #[test]
    fn test_master_drift_accumulates() {
        let ctx = ctx();
        let clock = Clock::new(MediaType::Audio);
        ctx.set_master(Some(clock.clone()));
        clock.reset_at(&ctx, 0, 0);
        // 40ms of media presented after 10ms of wall time
        clock.update(&ctx, 40_000, 10_000);
        assert_eq!(clock.delay_with_master(&ctx), Some(30_000));
        clock.update(&ctx, 50_000, 50_000);
        assert_eq!(clock.delay_with_master(&ctx), Some(0));
    }

    #[test]
    fn test_slave_measures_against_master() {
        let ctx = ctx();
        let audio = Clock::new(MediaType::Audio);
        let video = Clock::new(MediaType::Video);
        ctx.set_master(Some(audio.clone()));

        audio.reset_at(&ctx, 0, 0);
        video.reset_at(&ctx, 0, 0);
        video.update(&ctx, 150_000, 100_000);
        assert_eq!(video.delay_with_master(&ctx), Some(50_000));

        video.update(&ctx, 20_000, 100_000);
        assert_eq!(video.delay_with_master(&ctx), Some(-80_000));
    }

    #[test]
    fn test_stale_serial_is_rejected() {
        let ctx = ctx();
        let clock = Clock::new(MediaType::Video);
        clock.reset_at(&ctx, 0, 0);
        assert!(clock.delay_with_master(&ctx).is_some());

        let serial = ctx.serial_ref();
        assert_eq!(serial, 1);
        assert_eq!(clock.delay_with_master(&ctx), None);

        clock.reset_at(&ctx, 5_000_000, 0);
        assert_eq!(clock.serial(), ctx.serial());
        assert_eq!(clock.delay_with_master(&ctx), Some(0));
    }

    #[test]
    fn test_adjust_delay_boundaries() {
        let thr = 50_000;
        assert_eq!(adjust_delay(thr, thr, 1.0), Some(0));
        assert_eq!(adjust_delay(-thr, thr, 1.0), Some(0));
        assert_eq!(adjust_delay(-thr - 1, thr, 1.0), None);
        assert_eq!(adjust_delay(thr + 1, thr, 1.0), Some(1));
        assert_eq!(adjust_delay(200_000, thr, 1.0), Some(150_000));
        // faster than real time drops any late unit
        assert_eq!(adjust_delay(-1, thr, 1.5), None);
        assert_eq!(adjust_delay(0, thr, 1.5), Some(0));
    }

    #[test]
    fn test_pause_freezes_elapsed_time() {
        let ctx = ctx();
        let clock = Clock::new(MediaType::Audio);
        ctx.set_master(Some(clock.clone()));
        clock.reset_at(&ctx, 0, 0);

        clock.set_paused(true, 10);
        assert_eq!(clock.position_at(1.0, 5_000_000), 0);
        clock.set_paused(false, 1_000_000);
        clock.update(&ctx, 10, 1_000_010);
        assert_eq!(clock.delay_with_master(&ctx), Some(0));
    }

    #[test]
    fn test_speed_clamp_and_snap() {
        let ctx = ctx();
        assert_eq!(ctx.speed(), 1.0);
        assert_eq!(ctx.set_speed(1.2), 1.0);
        assert_eq!(ctx.set_speed(1.8), 2.0);
        assert_eq!(ctx.set_speed(9.0), 3.0);
        assert_eq!(ctx.set_speed(0.1), 0.5);
        assert_eq!(ctx.set_speed(f64::NAN), 0.5);
    }

    #[test]
    fn test_speed_scales_timediff() {
        let ctx = ctx();
        let clock = Clock::new(MediaType::Audio);
        ctx.set_master(Some(clock.clone()));
        ctx.set_speed(2.0);
        clock.reset_at(&ctx, 0, 0);
        clock.update(&ctx, 200_000, 100_000);
        assert_eq!(clock.delay_with_master(&ctx), Some(0));
        assert_eq!(ctx.position_us().map(|_| ()), Some(()));
    }
}
