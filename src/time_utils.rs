/// Time conversion utilities shared by the transport, automation and render
/// paths. All engine-internal positions are in samples; the control surface
/// talks in seconds or beats.
#[derive(Debug, Clone, Copy)]
pub struct TimeConverter {
    sample_rate: f64,
    bpm: f64,
}

impl TimeConverter {
    pub fn new(sample_rate: f64, bpm: f64) -> Self {
        Self { sample_rate, bpm }
    }

    #[inline]
    pub fn samples_to_seconds(&self, samples: f64) -> f64 {
        samples / self.sample_rate
    }

    #[inline]
    pub fn seconds_to_samples(&self, seconds: f64) -> f64 {
        seconds * self.sample_rate
    }

    #[inline]
    pub fn samples_to_beats(&self, samples: f64) -> f64 {
        (samples / self.sample_rate) * (self.bpm / 60.0)
    }

    #[inline]
    pub fn beats_to_samples(&self, beats: f64) -> f64 {
        (beats * 60.0 / self.bpm) * self.sample_rate
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
    }
}

/// Quantize a time position to the nearest grid point
#[inline]
pub fn quantize_to_grid(time: f64, grid_size: f64) -> f64 {
    if grid_size > 0.0 {
        (time / grid_size).round() * grid_size
    } else {
        time
    }
}

/// Format time in minutes:seconds.milliseconds
pub fn format_minutes_seconds(seconds: f64) -> String {
    let minutes = (seconds / 60.0) as i32;
    let secs = seconds % 60.0;
    format!("{:02}:{:06.3}", minutes, secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_samples_round_trip() {
        let tc = TimeConverter::new(48000.0, 120.0);
        let s = tc.seconds_to_samples(2.5);
        assert_eq!(s, 120000.0);
        assert!((tc.samples_to_seconds(s) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn quantize_snaps_to_multiples() {
        assert_eq!(quantize_to_grid(1.13, 0.25), 1.25);
        assert_eq!(quantize_to_grid(1.12, 0.25), 1.0);
        assert_eq!(quantize_to_grid(3.7, 0.0), 3.7);
    }
}
