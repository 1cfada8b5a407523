use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::atomic::AtomicCell;

use crate::time_utils::TimeConverter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

/// Lock-free transport shared between the control surface and whichever
/// thread is driving blocks (live callback or a render worker). Positions
/// are in seconds of session time.
pub struct Transport {
    playing: AtomicBool,
    paused: AtomicBool,
    position: AtomicU64,
    sample_rate: AtomicCell<f64>,
    bpm: AtomicCell<f64>,
    loop_enabled: AtomicBool,
    loop_start: AtomicCell<f64>,
    loop_end: AtomicCell<f64>,
    /// Set on seek/stop; consumed by the engine to flush plugin and graph
    /// state before the next block.
    repositioned: AtomicBool,
}

impl Transport {
    pub fn new(sample_rate: f64, bpm: f64) -> Self {
        Self {
            playing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            position: AtomicU64::new(0.0f64.to_bits()),
            sample_rate: AtomicCell::new(sample_rate),
            bpm: AtomicCell::new(bpm),
            loop_enabled: AtomicBool::new(false),
            loop_start: AtomicCell::new(0.0),
            loop_end: AtomicCell::new(0.0),
            repositioned: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TransportState {
        if self.playing.load(Ordering::Relaxed) {
            TransportState::Playing
        } else if self.paused.load(Ordering::Relaxed) {
            TransportState::Paused
        } else {
            TransportState::Stopped
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn play(&self) {
        self.paused.store(false, Ordering::Relaxed);
        self.playing.store(true, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.playing.store(false, Ordering::Relaxed);
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Stop returns the playhead to zero, which is a reposition.
    pub fn stop(&self) {
        self.playing.store(false, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
        self.set_position(0.0);
    }

    pub fn position(&self) -> f64 {
        f64::from_bits(self.position.load(Ordering::Relaxed))
    }

    pub fn set_position(&self, seconds: f64) {
        self.position.store(seconds.max(0.0).to_bits(), Ordering::Relaxed);
        self.repositioned.store(true, Ordering::Release);
    }

    /// Advance by one processed block; wraps at the loop point when looping.
    pub fn advance(&self, frames: usize) {
        let dt = frames as f64 / self.sample_rate.load();
        let mut pos = self.position() + dt;
        if self.loop_enabled.load(Ordering::Relaxed) {
            let end = self.loop_end.load();
            let start = self.loop_start.load();
            if end > start && pos >= end {
                pos = start + (pos - end);
                self.repositioned.store(true, Ordering::Release);
            }
        }
        self.position.store(pos.to_bits(), Ordering::Relaxed);
    }

    /// True once per seek; the caller flushes playback state in response.
    pub fn take_reposition(&self) -> bool {
        self.repositioned.swap(false, Ordering::AcqRel)
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate.load()
    }

    pub fn bpm(&self) -> f64 {
        self.bpm.load()
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.bpm.store(bpm.clamp(10.0, 999.0));
    }

    pub fn set_loop(&self, start: f64, end: f64) {
        self.loop_start.store(start);
        self.loop_end.store(end);
    }

    pub fn set_loop_enabled(&self, enabled: bool) {
        self.loop_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn converter(&self) -> TimeConverter {
        TimeConverter::new(self.sample_rate.load(), self.bpm.load())
    }
}
