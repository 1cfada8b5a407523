//! EBU R128 / ITU-R BS.1770-4 loudness measurement: K-weighted mean-square
//! power over overlapping windows with two-stage gating, loudness range from
//! the gated short-term distribution, and 4x-oversampled true peak.
//!
//! All measurements are pure functions of the fed sample history; queries
//! never stall the feeding thread.

use crate::audio_utils::linear_to_db_f64;
use crate::constants::{
    ABSOLUTE_GATE_LUFS, GATING_BLOCK_OVERLAP, MOMENTARY_WINDOW_MS, RELATIVE_GATE_LU,
    SHORT_TERM_WINDOW_MS, TRUE_PEAK_OVERSAMPLE,
};

/// Offset that maps K-weighted mean-square power to LUFS (the K filter has
/// roughly +0.691 dB of gain at 1 kHz).
const LUFS_OFFSET: f64 = -0.691;

/// Gating blocks are 400 ms at 75 % overlap, i.e. one per 100 ms step.
const STEPS_PER_GATING_BLOCK: usize = 4;

/// Relative gate for loudness range per EBU Tech 3342.
const LRA_RELATIVE_GATE_LU: f64 = -20.0;

#[derive(Debug, Clone, Copy)]
pub struct LoudnessReading {
    pub momentary_lufs: f64,
    pub short_term_lufs: f64,
    pub integrated_lufs: f64,
    pub loudness_range_lu: f64,
    pub true_peak_db: f64,
}

impl Default for LoudnessReading {
    fn default() -> Self {
        Self {
            momentary_lufs: f64::NEG_INFINITY,
            short_term_lufs: f64::NEG_INFINITY,
            integrated_lufs: f64::NEG_INFINITY,
            loudness_range_lu: 0.0,
            true_peak_db: f64::NEG_INFINITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    z1: f64,
    z2: f64,
}

#[derive(Debug, Clone, Copy)]
struct BiquadCoeffs {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl BiquadCoeffs {
    #[inline]
    fn process(&self, state: &mut BiquadState, x: f64) -> f64 {
        // Transposed direct form II.
        let y = self.b0 * x + state.z1;
        state.z1 = self.b1 * x - self.a1 * y + state.z2;
        state.z2 = self.b2 * x - self.a2 * y;
        y
    }
}

/// Two-stage K-weighting prefilter: high-frequency shelf followed by a
/// high-pass, with the published filter targets recomputed for the active
/// sample rate.
#[derive(Debug, Clone)]
struct KWeighting {
    shelf: BiquadCoeffs,
    highpass: BiquadCoeffs,
    shelf_state: BiquadState,
    highpass_state: BiquadState,
}

impl KWeighting {
    fn new(sample_rate: f64) -> Self {
        // Stage 1: high-frequency shelf (+4 dB above ~1.5 kHz).
        let f0 = 1681.974450955533;
        let gain_db = 3.999843853973347;
        let q = 0.7071752369554196;
        let k = (std::f64::consts::PI * f0 / sample_rate).tan();
        let vh = 10.0f64.powf(gain_db / 20.0);
        let vb = vh.powf(0.4996667741545416);
        let a0 = 1.0 + k / q + k * k;
        let shelf = BiquadCoeffs {
            b0: (vh + vb * k / q + k * k) / a0,
            b1: 2.0 * (k * k - vh) / a0,
            b2: (vh - vb * k / q + k * k) / a0,
            a1: 2.0 * (k * k - 1.0) / a0,
            a2: (1.0 - k / q + k * k) / a0,
        };

        // Stage 2: high-pass at ~38 Hz.
        let f0 = 38.13547087602444;
        let q = 0.5003270373238773;
        let k = (std::f64::consts::PI * f0 / sample_rate).tan();
        let a0 = 1.0 + k / q + k * k;
        let highpass = BiquadCoeffs {
            b0: 1.0,
            b1: -2.0,
            b2: 1.0,
            a1: 2.0 * (k * k - 1.0) / a0,
            a2: (1.0 - k / q + k * k) / a0,
        };

        Self {
            shelf,
            highpass,
            shelf_state: BiquadState::default(),
            highpass_state: BiquadState::default(),
        }
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let shelved = self.shelf.process(&mut self.shelf_state, x);
        self.highpass.process(&mut self.highpass_state, shelved)
    }

    fn reset(&mut self) {
        self.shelf_state = BiquadState::default();
        self.highpass_state = BiquadState::default();
    }
}

/// Inter-sample peak estimation by 4x linear-interpolation oversampling.
#[derive(Debug, Clone, Copy, Default)]
struct TruePeakDetector {
    previous: f64,
    peak: f64,
}

impl TruePeakDetector {
    #[inline]
    fn feed(&mut self, sample: f64) {
        for phase in 1..=TRUE_PEAK_OVERSAMPLE {
            let t = phase as f64 / TRUE_PEAK_OVERSAMPLE as f64;
            let interpolated = self.previous + (sample - self.previous) * t;
            let magnitude = interpolated.abs();
            if magnitude > self.peak {
                self.peak = magnitude;
            }
        }
        self.previous = sample;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

fn power_to_lufs(power: f64) -> f64 {
    if power <= 0.0 {
        f64::NEG_INFINITY
    } else {
        LUFS_OFFSET + 10.0 * power.log10()
    }
}

pub struct LoudnessAnalyzer {
    filters: [KWeighting; 2],
    true_peak: [TruePeakDetector; 2],
    /// Mean-square power of completed 100 ms steps.
    steps: Vec<f64>,
    step_len: usize,
    step_fill: usize,
    step_sum: f64,
    /// 400 ms gating-block powers (one per step once warmed up).
    gating_blocks: Vec<f64>,
    /// Short-term powers sampled once per step, for loudness range.
    short_term_history: Vec<f64>,
    short_term_steps: usize,
}

impl LoudnessAnalyzer {
    pub fn new(sample_rate: f64) -> Self {
        // 400 ms gating blocks at 75 % overlap advance in 100 ms steps.
        let step_ms = MOMENTARY_WINDOW_MS * (1.0 - GATING_BLOCK_OVERLAP);
        Self {
            filters: [KWeighting::new(sample_rate), KWeighting::new(sample_rate)],
            true_peak: [TruePeakDetector::default(); 2],
            steps: Vec::new(),
            step_len: (sample_rate * step_ms / 1000.0).round() as usize,
            step_fill: 0,
            step_sum: 0.0,
            gating_blocks: Vec::new(),
            short_term_history: Vec::new(),
            short_term_steps: (SHORT_TERM_WINDOW_MS / step_ms) as usize,
        }
    }

    pub fn process(&mut self, left: &[f32], right: &[f32], frames: usize) {
        for i in 0..frames {
            let l = left[i] as f64;
            let r = right[i] as f64;
            self.true_peak[0].feed(l);
            self.true_peak[1].feed(r);

            let wl = self.filters[0].process(l);
            let wr = self.filters[1].process(r);
            self.step_sum += wl * wl + wr * wr;
            self.step_fill += 1;

            if self.step_fill == self.step_len {
                self.complete_step();
            }
        }
    }

    fn complete_step(&mut self) {
        self.steps.push(self.step_sum / self.step_len as f64);
        self.step_sum = 0.0;
        self.step_fill = 0;

        if self.steps.len() >= STEPS_PER_GATING_BLOCK {
            let tail = &self.steps[self.steps.len() - STEPS_PER_GATING_BLOCK..];
            let block_power = tail.iter().sum::<f64>() / STEPS_PER_GATING_BLOCK as f64;
            self.gating_blocks.push(block_power);
        }
        if self.steps.len() >= self.short_term_steps {
            let tail = &self.steps[self.steps.len() - self.short_term_steps..];
            let st_power = tail.iter().sum::<f64>() / self.short_term_steps as f64;
            self.short_term_history.push(st_power);
        }
    }

    /// Momentary loudness: latest 400 ms window.
    pub fn momentary_lufs(&self) -> f64 {
        power_to_lufs(self.gating_blocks.last().copied().unwrap_or(0.0))
    }

    /// Short-term loudness: latest 3 s window.
    pub fn short_term_lufs(&self) -> f64 {
        power_to_lufs(self.short_term_history.last().copied().unwrap_or(0.0))
    }

    /// Integrated loudness with the two-stage gate: drop blocks below the
    /// absolute threshold, then drop blocks more than 10 LU below the
    /// ungated mean of the survivors.
    pub fn integrated_lufs(&self) -> f64 {
        let absolute: Vec<f64> = self
            .gating_blocks
            .iter()
            .copied()
            .filter(|p| power_to_lufs(*p) > ABSOLUTE_GATE_LUFS)
            .collect();
        if absolute.is_empty() {
            return f64::NEG_INFINITY;
        }
        let ungated_mean = absolute.iter().sum::<f64>() / absolute.len() as f64;
        let threshold = power_to_lufs(ungated_mean) + RELATIVE_GATE_LU;

        let gated: Vec<f64> = absolute
            .into_iter()
            .filter(|p| power_to_lufs(*p) > threshold)
            .collect();
        if gated.is_empty() {
            return f64::NEG_INFINITY;
        }
        power_to_lufs(gated.iter().sum::<f64>() / gated.len() as f64)
    }

    /// Loudness range: 10th to 95th percentile spread of the gated
    /// short-term distribution.
    pub fn loudness_range_lu(&self) -> f64 {
        let absolute: Vec<f64> = self
            .short_term_history
            .iter()
            .copied()
            .filter(|p| power_to_lufs(*p) > ABSOLUTE_GATE_LUFS)
            .collect();
        if absolute.len() < 2 {
            return 0.0;
        }
        let mean = absolute.iter().sum::<f64>() / absolute.len() as f64;
        let threshold = power_to_lufs(mean) + LRA_RELATIVE_GATE_LU;
        let mut gated: Vec<f64> = absolute
            .into_iter()
            .map(power_to_lufs)
            .filter(|l| *l > threshold)
            .collect();
        if gated.len() < 2 {
            return 0.0;
        }
        gated.sort_by(|a, b| a.total_cmp(b));
        let lo = percentile(&gated, 0.10);
        let hi = percentile(&gated, 0.95);
        hi - lo
    }

    pub fn true_peak_db(&self) -> f64 {
        let peak = self.true_peak[0].peak.max(self.true_peak[1].peak);
        linear_to_db_f64(peak)
    }

    pub fn true_peak_linear(&self) -> f64 {
        self.true_peak[0].peak.max(self.true_peak[1].peak)
    }

    pub fn reading(&self) -> LoudnessReading {
        LoudnessReading {
            momentary_lufs: self.momentary_lufs(),
            short_term_lufs: self.short_term_lufs(),
            integrated_lufs: self.integrated_lufs(),
            loudness_range_lu: self.loudness_range_lu(),
            true_peak_db: self.true_peak_db(),
        }
    }

    pub fn reset(&mut self) {
        for f in &mut self.filters {
            f.reset();
        }
        for tp in &mut self.true_peak {
            tp.reset();
        }
        self.steps.clear();
        self.step_fill = 0;
        self.step_sum = 0.0;
        self.gating_blocks.clear();
        self.short_term_history.clear();
    }
}

fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    let pos = fraction * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
    }
}

/// Measure the integrated loudness and true peak of a finished stereo
/// buffer, as the render normalization pass does.
pub fn measure_buffer(left: &[f32], right: &[f32], sample_rate: f64) -> LoudnessReading {
    let mut analyzer = LoudnessAnalyzer::new(sample_rate);
    analyzer.process(left, right, left.len().min(right.len()));
    analyzer.reading()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, amplitude: f64, seconds: f64, sample_rate: f64) -> Vec<f32> {
        (0..(seconds * sample_rate) as usize)
            .map(|i| {
                (amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate).sin())
                    as f32
            })
            .collect()
    }

    #[test]
    fn full_scale_sine_left_only_matches_reference() {
        // A 0 dBFS 1 kHz tone in a single channel of a stereo pair reads
        // -3.01 LUFS under BS.1770-4.
        let sample_rate = 48000.0;
        let left = sine(1000.0, 1.0, 4.0, sample_rate);
        let right = vec![0.0f32; left.len()];
        let reading = measure_buffer(&left, &right, sample_rate);
        assert!(
            (reading.integrated_lufs - (-3.01)).abs() < 0.5,
            "integrated {} LUFS",
            reading.integrated_lufs
        );
    }

    #[test]
    fn measurement_is_sample_rate_invariant() {
        for sample_rate in [44100.0, 48000.0, 96000.0] {
            let left = sine(1000.0, 0.5, 4.0, sample_rate);
            let right = left.clone();
            let reading = measure_buffer(&left, &right, sample_rate);
            // Stereo -6 dBFS tone: -3.01 (left-only full scale) - 6 + 3 dB
            // for the second channel.
            let expected = -6.02;
            assert!(
                (reading.integrated_lufs - expected).abs() < 0.6,
                "at {sample_rate} Hz got {}",
                reading.integrated_lufs
            );
        }
    }

    #[test]
    fn silence_gates_to_negative_infinity() {
        let silence = vec![0.0f32; 48000 * 4];
        let reading = measure_buffer(&silence, &silence, 48000.0);
        assert!(reading.integrated_lufs.is_infinite());
        assert!(reading.momentary_lufs.is_infinite());
    }

    #[test]
    fn gating_ignores_long_silent_stretch() {
        // Tone then silence: gating should keep integrated near the tone's
        // loudness instead of averaging the silence in.
        let sample_rate = 48000.0;
        let mut left = sine(1000.0, 0.5, 2.0, sample_rate);
        left.extend(std::iter::repeat_n(0.0f32, (sample_rate * 6.0) as usize));
        let right = left.clone();
        let reading = measure_buffer(&left, &right, sample_rate);
        assert!(
            (reading.integrated_lufs - (-6.02)).abs() < 0.7,
            "integrated {} LUFS",
            reading.integrated_lufs
        );
    }

    #[test]
    fn momentary_tracks_recent_signal() {
        let sample_rate = 48000.0;
        let mut analyzer = LoudnessAnalyzer::new(sample_rate);
        let loud = sine(1000.0, 0.5, 1.0, sample_rate);
        analyzer.process(&loud, &loud, loud.len());
        let during = analyzer.momentary_lufs();

        let quiet = vec![0.0f32; (sample_rate * 1.0) as usize];
        analyzer.process(&quiet, &quiet, quiet.len());
        let after = analyzer.momentary_lufs();
        assert!(during > -10.0);
        assert!(after < during - 30.0 || after.is_infinite());
    }

    #[test]
    fn true_peak_at_least_sample_peak() {
        let sample_rate = 48000.0;
        let left = sine(997.0, 0.9, 0.5, sample_rate);
        let right = left.clone();
        let reading = measure_buffer(&left, &right, sample_rate);
        let sample_peak_db = 20.0 * 0.9f64.log10();
        assert!(reading.true_peak_db >= sample_peak_db - 0.2);
        assert!(reading.true_peak_db < sample_peak_db + 3.0);
    }

    #[test]
    fn loudness_range_of_steady_tone_is_small() {
        let sample_rate = 48000.0;
        let tone = sine(1000.0, 0.5, 8.0, sample_rate);
        let reading = measure_buffer(&tone, &tone, sample_rate);
        assert!(reading.loudness_range_lu < 1.0, "LRA {}", reading.loudness_range_lu);
    }
}
