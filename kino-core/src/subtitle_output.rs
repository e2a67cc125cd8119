//! # Subtitle Output
//!
//! Subtitle display consumer. Units are text events (ASS dialogue or plain
//! text); an accumulator keeps the set of currently visible events and
//! republishes it to every [`SubtitleSink`] when it changes.
//!
//! After showing an event the stage keeps waiting for the event's own
//! display duration so it is not retired before its window ends.
//!
//! [`SubtitleSink`]: crate::render::SubtitleSink

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::decoder::{DecoderStrategy, StageContext};
use crate::event::Event;
use crate::media::Frame;
use crate::presenter::{Pace, Pacer};
use crate::render::SubtitleSinks;

// ============================================================================
// Subtitle Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleEvent {
    pub start_us: i64,
    pub end_us: i64,
    pub layer: i32,
    pub style: Option<String>,
    /// Display text with override codes removed.
    pub text: String,
}

static ASS_OVERRIDE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\{[^}]*\}").ok());

fn clean_text(text: &str) -> String {
    let text = text.replace("\\N", "\n").replace("\\n", "\n").replace("\\h", " ");
    match ASS_OVERRIDE.as_ref() {
        Some(re) => re.replace_all(&text, "").into_owned(),
        None => text,
    }
}

impl SubtitleEvent {
    /// Parse a subtitle unit.
    ///
    /// Accepted payloads:
    /// - `Dialogue: Layer,Start,End,Style,Name,MarginL,MarginR,MarginV,Effect,Text`
    /// - `ReadOrder,Layer,Style,Name,MarginL,MarginR,MarginV,Effect,Text` (ASS in Matroska)
    /// - anything else is plain text
    ///
    /// Timing always comes from the unit itself.
    pub fn parse(payload: &str, start_us: i64, end_us: i64) -> Self {
        let payload = payload.trim_end_matches(&['\r', '\n'][..]);
        let mut event = Self {
            start_us,
            end_us,
            layer: 0,
            style: None,
            text: String::new(),
        };

        if let Some(dialogue) = payload.strip_prefix("Dialogue:") {
            let parts: Vec<&str> = dialogue.splitn(10, ',').collect();
            if parts.len() == 10 {
                event.layer = parts[0].trim().parse().unwrap_or(0);
                event.style = Some(parts[3].trim().to_string()).filter(|s| !s.is_empty());
                event.text = clean_text(parts[9]);
                return event;
            }
        }

        let parts: Vec<&str> = payload.splitn(9, ',').collect();
        if parts.len() == 9 && parts[0].trim().parse::<u64>().is_ok() && parts[1].trim().parse::<i32>().is_ok() {
            event.layer = parts[1].trim().parse().unwrap_or(0);
            event.style = Some(parts[2].trim().to_string()).filter(|s| !s.is_empty());
            event.text = clean_text(parts[8]);
            return event;
        }

        event.text = clean_text(payload);
        event
    }

    pub fn duration_us(&self) -> i64 {
        (self.end_us - self.start_us).max(0)
    }
}

/// Set of currently visible events.
#[derive(Debug, Default)]
pub struct SubtitleAccumulator {
    active: Vec<SubtitleEvent>,
}

impl SubtitleAccumulator {
    pub fn add(&mut self, event: SubtitleEvent) {
        self.active.push(event);
        self.active.sort_by_key(|e| (e.layer, e.start_us));
    }

    /// Drop events that ended at or before `position_us`. Returns true if
    /// anything changed.
    pub fn retire(&mut self, position_us: i64) -> bool {
        let before = self.active.len();
        self.active.retain(|e| e.end_us > position_us);
        before != self.active.len()
    }

    pub fn flush(&mut self) {
        self.active.clear();
    }

    pub fn active(&self) -> &[SubtitleEvent] {
        &self.active
    }
}

// ============================================================================
// Subtitle Display Stage
// ============================================================================

pub struct SubtitleOutput {
    pacer: Pacer,
    sinks: Arc<SubtitleSinks>,
    accumulator: SubtitleAccumulator,
    paused: bool,
}

impl SubtitleOutput {
    pub fn new(pacer: Pacer, sinks: Arc<SubtitleSinks>) -> Self {
        Self {
            pacer,
            sinks,
            accumulator: SubtitleAccumulator::default(),
            paused: false,
        }
    }

    fn publish(&self) {
        let active = self.accumulator.active();
        self.sinks.for_each(|sink| sink.show(active));
    }
}

impl DecoderStrategy<Frame> for SubtitleOutput {
    fn handle_event(&mut self, _stage: &StageContext, event: &Event) {
        if let Event::Pause(paused) = event {
            self.paused = *paused;
            self.pacer.set_paused(*paused);
        }
    }

    fn on_seek(&mut self, _stage: &StageContext, position_us: i64) {
        self.accumulator.flush();
        self.publish();
        self.pacer.on_seek(position_us);
    }

    fn handle_unit(&mut self, stage: &StageContext, frame: Frame) {
        let start = frame.pts_us();
        let end = start + frame.duration_us();
        let event = SubtitleEvent::parse(frame.text().unwrap_or_default(), start, end);

        match self.pacer.pace(stage, start) {
            Pace::Present => {}
            // A late event is still shown for what remains of its window.
            Pace::Late(delay) if delay + event.duration_us() > 0 => {}
            Pace::Late(_) | Pace::Stale | Pace::Cancelled => {
                self.pacer.stats().dropped();
                return;
            }
        }

        self.accumulator.retire(start);
        self.accumulator.add(event);
        self.publish();
        self.pacer.stats().rendered();

        // Held in wall time, so the window shrinks with the playback speed.
        let hold = Duration::from_micros(((end - start).max(0) as f64 / self.pacer.speed()) as u64);
        if stage.wait(hold) && self.accumulator.retire(end) {
            self.publish();
        }
    }

    fn is_paused(&self) -> bool {
        self.paused
    }
}
