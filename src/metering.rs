//! Per-bus level metering: peak with ballistics and hold, windowed RMS,
//! stereo correlation, and the published snapshot readers poll.
//!
//! Producers publish a fresh `MeterReading` per processed block; readers
//! (UI, render compliance checks) copy the latest snapshot and never hold a
//! lock the audio thread could wait on.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;

use crate::audio_utils::linear_to_db;
use crate::bus::BusId;
use crate::constants::{DEFAULT_RMS_WINDOW_MS, METER_RELEASE_PER_SEC, PEAK_HOLD_SECONDS};
use crate::loudness::LoudnessReading;

/// Derived, non-owning snapshot of a bus's latest block. No identity beyond
/// "latest for this bus".
#[derive(Debug, Clone, Copy)]
pub struct MeterReading {
    pub peak_l: f32,
    pub peak_r: f32,
    pub peak_hold_l: f32,
    pub peak_hold_r: f32,
    pub rms_db: f32,
    /// Normalized stereo cross-correlation in [-1, 1].
    pub correlation: f32,
    pub loudness: Option<LoudnessReading>,
}

impl Default for MeterReading {
    fn default() -> Self {
        Self {
            peak_l: 0.0,
            peak_r: 0.0,
            peak_hold_l: 0.0,
            peak_hold_r: 0.0,
            rms_db: -120.0,
            correlation: 0.0,
            loudness: None,
        }
    }
}

impl MeterReading {
    pub fn peak_db(&self) -> f32 {
        linear_to_db(self.peak_l.max(self.peak_r))
    }
}

/// Shared map of latest readings keyed by bus, copy-on-read for consumers.
pub type MeterBank = Arc<DashMap<BusId, MeterReading>>;

#[derive(Debug, Clone, Copy)]
struct ChannelPeak {
    current: f32,
    hold: f32,
    hold_remaining: f32,
}

impl ChannelPeak {
    fn new() -> Self {
        Self { current: 0.0, hold: 0.0, hold_remaining: 0.0 }
    }

    /// Instant attack, exponential release.
    fn update(&mut self, block_max: f32, dt: f32) {
        let release = 10.0f32.powf(-(METER_RELEASE_PER_SEC * dt) / 20.0);
        self.current = block_max.max(self.current * release);

        if block_max >= self.hold {
            self.hold = block_max;
            self.hold_remaining = PEAK_HOLD_SECONDS;
        } else {
            self.hold_remaining -= dt;
            if self.hold_remaining <= 0.0 {
                self.hold = self.current;
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Metering state for one bus. Pure function of the sample history it has
/// been fed; never mutates audio data.
pub struct BusMeter {
    peak_l: ChannelPeak,
    peak_r: ChannelPeak,
    /// Per-block (sum of squares, frame count) entries covering the window.
    rms_blocks: VecDeque<(f64, usize)>,
    rms_window_frames: usize,
    rms_sum: f64,
    rms_frames: usize,
    correlation: f32,
    sample_rate: f32,
}

impl BusMeter {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            peak_l: ChannelPeak::new(),
            peak_r: ChannelPeak::new(),
            rms_blocks: VecDeque::new(),
            rms_window_frames: (sample_rate * DEFAULT_RMS_WINDOW_MS / 1000.0) as usize,
            rms_sum: 0.0,
            rms_frames: 0,
            correlation: 0.0,
            sample_rate,
        }
    }

    pub fn update(&mut self, left: &[f32], right: &[f32], frames: usize) {
        let dt = frames as f32 / self.sample_rate;

        let max_l = left[..frames].iter().fold(0.0f32, |a, s| a.max(s.abs()));
        let max_r = right[..frames].iter().fold(0.0f32, |a, s| a.max(s.abs()));
        self.peak_l.update(max_l, dt);
        self.peak_r.update(max_r, dt);

        let mut sum_sq = 0.0f64;
        let mut cross = 0.0f64;
        let mut sum_l2 = 0.0f64;
        let mut sum_r2 = 0.0f64;
        for i in 0..frames {
            let l = left[i] as f64;
            let r = right[i] as f64;
            sum_sq += (l * l + r * r) / 2.0;
            cross += l * r;
            sum_l2 += l * l;
            sum_r2 += r * r;
        }

        self.rms_blocks.push_back((sum_sq, frames));
        self.rms_sum += sum_sq;
        self.rms_frames += frames;
        while self.rms_frames > self.rms_window_frames {
            match self.rms_blocks.front() {
                Some(&(sq, n)) if self.rms_frames - n >= self.rms_window_frames / 2 => {
                    self.rms_blocks.pop_front();
                    self.rms_sum -= sq;
                    self.rms_frames -= n;
                }
                _ => break,
            }
        }

        let denom = (sum_l2 * sum_r2).sqrt();
        self.correlation = if denom > 1e-12 {
            (cross / denom).clamp(-1.0, 1.0) as f32
        } else {
            0.0
        };
    }

    /// Cheap path for idle buses: history decays as if silence were fed.
    pub fn update_silent(&mut self, frames: usize) {
        let dt = frames as f32 / self.sample_rate;
        self.peak_l.update(0.0, dt);
        self.peak_r.update(0.0, dt);
        self.rms_blocks.push_back((0.0, frames));
        self.rms_frames += frames;
        while self.rms_frames > self.rms_window_frames {
            match self.rms_blocks.front() {
                Some(&(sq, n)) if self.rms_frames - n >= self.rms_window_frames / 2 => {
                    self.rms_blocks.pop_front();
                    self.rms_sum -= sq;
                    self.rms_frames -= n;
                }
                _ => break,
            }
        }
        self.correlation = 0.0;
    }

    pub fn reading(&self, loudness: Option<LoudnessReading>) -> MeterReading {
        let rms = if self.rms_frames > 0 {
            (self.rms_sum / self.rms_frames as f64).sqrt() as f32
        } else {
            0.0
        };
        MeterReading {
            peak_l: self.peak_l.current,
            peak_r: self.peak_r.current,
            peak_hold_l: self.peak_l.hold,
            peak_hold_r: self.peak_r.hold,
            rms_db: linear_to_db(rms),
            correlation: self.correlation,
            loudness,
        }
    }

    pub fn reset(&mut self) {
        self.peak_l.reset();
        self.peak_r.reset();
        self.rms_blocks.clear();
        self.rms_sum = 0.0;
        self.rms_frames = 0;
        self.correlation = 0.0;
    }
}
