use std::time::{Duration, Instant};

use serde::Serialize;
use utoipa::ToSchema;

/// How often each room's virtual clock is refreshed. The tick never
/// broadcasts, it only keeps `current_time` fresh for samplers.
pub const TICKER_PERIOD: Duration = Duration::from_secs(5);

/// A room's authoritative playback clock.
///
/// While playing, the real position at wall time T is
/// `current_time + (T - last_update)`; while paused it is `current_time`.
/// Every mutation advances the clock first, so the invariant holds across
/// any interleaving of commands and ticks.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current_time: f64,
    pub last_update: Instant,
    pub audio_track: i32,
    pub subtitle_track: i32,
}

/// The broadcast form of [PlaybackState], sent as a `sync` event.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub is_playing: bool,
    pub current_time: f64,
    pub audio_track: i32,
    pub subtitle_track: i32,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            current_time: 0.0,
            last_update: Instant::now(),
            audio_track: 0,
            subtitle_track: -1,
        }
    }
}

impl PlaybackState {
    /// Folds elapsed wall time into `current_time`.
    pub fn advance(&mut self, now: Instant) {
        if self.is_playing {
            self.current_time += now.duration_since(self.last_update).as_secs_f64();
        }

        self.last_update = now;
    }

    /// The position a viewer should be at right now, without mutating.
    pub fn projected(&self, now: Instant) -> f64 {
        if self.is_playing {
            self.current_time + now.duration_since(self.last_update).as_secs_f64()
        } else {
            self.current_time
        }
    }

    pub fn set_playing(&mut self, playing: bool, now: Instant) {
        self.advance(now);
        self.is_playing = playing;
    }

    pub fn seek(&mut self, seconds: f64, now: Instant) {
        self.current_time = seconds.max(0.0);
        self.last_update = now;
    }

    /// Seeks relative to the projected position, clamping at zero.
    pub fn skip(&mut self, delta: f64, now: Instant) {
        let target = self.projected(now) + delta;
        self.seek(target, now);
    }

    /// Rewinds to the start of the current entry.
    pub fn reset(&mut self, now: Instant) {
        self.current_time = 0.0;
        self.last_update = now;
    }

    pub fn snapshot(&self, now: Instant) -> PlaybackSnapshot {
        PlaybackSnapshot {
            is_playing: self.is_playing,
            current_time: self.projected(now),
            audio_track: self.audio_track,
            subtitle_track: self.subtitle_track,
        }
    }
}
