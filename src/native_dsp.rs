//! Built-in processor kinds behind the native plugin format. These are the
//! units a bare engine ships with; external formats plug in through the same
//! `PluginFormat` / `PluginProcessor` pair.

use serde::Deserialize;

use crate::audio_utils::db_to_linear;
use crate::error::PluginLoadError;
use crate::midi::{MidiEvent, MidiMessage};
use crate::plugin_api::{
    ParamInfo, PluginCategory, PluginFormat, PluginManifest, PluginProcessor, PortLayout,
};

pub struct NativeFormat;

impl PluginFormat for NativeFormat {
    fn format_name(&self) -> &'static str {
        "native"
    }

    fn can_load(&self, manifest: &PluginManifest) -> bool {
        matches!(manifest.kind.as_str(), "gain" | "delay" | "filter" | "sine")
    }

    fn instantiate(
        &self,
        manifest: &PluginManifest,
    ) -> Result<Box<dyn PluginProcessor>, PluginLoadError> {
        match manifest.kind.as_str() {
            "gain" => Ok(Box::new(GainDsp::new())),
            "delay" => {
                let settings: DelaySettings = serde_json::from_value(manifest.settings.clone())
                    .map_err(|e| PluginLoadError::InitFailure(format!("delay settings: {e}")))?;
                if settings.samples == 0 || settings.samples > 1 << 20 {
                    return Err(PluginLoadError::InitFailure(format!(
                        "delay of {} samples out of range",
                        settings.samples
                    )));
                }
                Ok(Box::new(FixedDelayDsp::new(settings.samples as usize)))
            }
            "filter" => {
                let settings: FilterSettings = serde_json::from_value(manifest.settings.clone())
                    .map_err(|e| PluginLoadError::InitFailure(format!("filter settings: {e}")))?;
                Ok(Box::new(FilterDsp::new(settings.mode)))
            }
            "sine" => Ok(Box::new(SineSynth::new())),
            other => Err(PluginLoadError::IncompatibleFormat(format!(
                "unknown native processor kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DelaySettings {
    samples: u32,
}

#[derive(Debug, Deserialize)]
struct FilterSettings {
    #[serde(default)]
    mode: FilterMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    Lowpass,
    Highpass,
}

// ---------------------------------------------------------------------------
// Gain

pub struct GainDsp {
    gain_db: f32,
    current_gain: f32,
}

impl GainDsp {
    pub fn new() -> Self {
        Self { gain_db: 0.0, current_gain: 1.0 }
    }
}

impl PluginProcessor for GainDsp {
    fn params(&self) -> Vec<ParamInfo> {
        vec![ParamInfo {
            id: "gain_db".into(),
            name: "Gain".into(),
            min: -60.0,
            max: 12.0,
            default: 0.0,
            unit: Some("dB".into()),
        }]
    }

    fn ports(&self) -> PortLayout {
        PortLayout { audio_inputs: 2, audio_outputs: 2, ..Default::default() }
    }

    fn set_param(&mut self, id: &str, value: f32) {
        if id == "gain_db" {
            self.gain_db = value;
        }
    }

    fn activate(&mut self, _sample_rate: f64, _max_block_size: usize) -> anyhow::Result<()> {
        Ok(())
    }

    fn reset(&mut self) {
        self.current_gain = db_to_linear(self.gain_db);
    }

    fn process(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
        _midi: &[MidiEvent],
        frames: usize,
    ) {
        let target = db_to_linear(self.gain_db);
        let start = self.current_gain;
        let step = (target - start) / frames.max(1) as f32;
        let mut g = start;
        for i in 0..frames {
            g += step;
            output_l[i] = input_l[i] * g;
            output_r[i] = input_r[i] * g;
        }
        self.current_gain = target;
    }
}

// ---------------------------------------------------------------------------
// Fixed delay — a stand-in for look-ahead processors; its whole purpose is a
// nonzero reported latency for the compensation machinery.

pub struct FixedDelayDsp {
    delay: usize,
    buf_l: Vec<f32>,
    buf_r: Vec<f32>,
    write_pos: usize,
}

impl FixedDelayDsp {
    pub fn new(delay: usize) -> Self {
        Self { delay, buf_l: Vec::new(), buf_r: Vec::new(), write_pos: 0 }
    }
}

impl PluginProcessor for FixedDelayDsp {
    fn params(&self) -> Vec<ParamInfo> {
        Vec::new()
    }

    fn ports(&self) -> PortLayout {
        PortLayout { audio_inputs: 2, audio_outputs: 2, ..Default::default() }
    }

    fn set_param(&mut self, _id: &str, _value: f32) {}

    fn activate(&mut self, _sample_rate: f64, _max_block_size: usize) -> anyhow::Result<()> {
        self.buf_l = vec![0.0; self.delay.max(1)];
        self.buf_r = vec![0.0; self.delay.max(1)];
        self.write_pos = 0;
        Ok(())
    }

    fn reset(&mut self) {
        self.buf_l.fill(0.0);
        self.buf_r.fill(0.0);
        self.write_pos = 0;
    }

    fn latency_samples(&self) -> usize {
        self.delay
    }

    fn process(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
        _midi: &[MidiEvent],
        frames: usize,
    ) {
        if self.delay == 0 {
            output_l[..frames].copy_from_slice(&input_l[..frames]);
            output_r[..frames].copy_from_slice(&input_r[..frames]);
            return;
        }
        let len = self.buf_l.len();
        for i in 0..frames {
            output_l[i] = self.buf_l[self.write_pos];
            output_r[i] = self.buf_r[self.write_pos];
            self.buf_l[self.write_pos] = input_l[i];
            self.buf_r[self.write_pos] = input_r[i];
            self.write_pos = (self.write_pos + 1) % len;
        }
    }
}

// ---------------------------------------------------------------------------
// Filter

#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadState {
    #[inline]
    fn run(&mut self, c: &BiquadCoeffs, x: f32) -> f32 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

#[derive(Debug, Clone, Copy)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl BiquadCoeffs {
    fn design(mode: FilterMode, cutoff_hz: f32, q: f32, sample_rate: f32) -> Self {
        let w0 = 2.0 * std::f32::consts::PI * (cutoff_hz / sample_rate).min(0.499);
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q.max(0.05));
        let a0 = 1.0 + alpha;
        match mode {
            FilterMode::Lowpass => Self {
                b0: (1.0 - cos_w0) / (2.0 * a0),
                b1: (1.0 - cos_w0) / a0,
                b2: (1.0 - cos_w0) / (2.0 * a0),
                a1: -2.0 * cos_w0 / a0,
                a2: (1.0 - alpha) / a0,
            },
            FilterMode::Highpass => Self {
                b0: (1.0 + cos_w0) / (2.0 * a0),
                b1: -(1.0 + cos_w0) / a0,
                b2: (1.0 + cos_w0) / (2.0 * a0),
                a1: -2.0 * cos_w0 / a0,
                a2: (1.0 - alpha) / a0,
            },
        }
    }
}

pub struct FilterDsp {
    mode: FilterMode,
    cutoff_hz: f32,
    resonance: f32,
    sample_rate: f32,
    coeffs: BiquadCoeffs,
    state_l: BiquadState,
    state_r: BiquadState,
}

impl FilterDsp {
    pub fn new(mode: FilterMode) -> Self {
        Self {
            mode,
            cutoff_hz: 1000.0,
            resonance: 0.707,
            sample_rate: 44100.0,
            coeffs: BiquadCoeffs::design(mode, 1000.0, 0.707, 44100.0),
            state_l: BiquadState::default(),
            state_r: BiquadState::default(),
        }
    }

    fn redesign(&mut self) {
        self.coeffs =
            BiquadCoeffs::design(self.mode, self.cutoff_hz, self.resonance, self.sample_rate);
    }
}

impl PluginProcessor for FilterDsp {
    fn params(&self) -> Vec<ParamInfo> {
        vec![
            ParamInfo {
                id: "cutoff_hz".into(),
                name: "Cutoff".into(),
                min: 20.0,
                max: 20000.0,
                default: 1000.0,
                unit: Some("Hz".into()),
            },
            ParamInfo {
                id: "resonance".into(),
                name: "Resonance".into(),
                min: 0.1,
                max: 10.0,
                default: 0.707,
                unit: None,
            },
        ]
    }

    fn ports(&self) -> PortLayout {
        PortLayout { audio_inputs: 2, audio_outputs: 2, ..Default::default() }
    }

    fn set_param(&mut self, id: &str, value: f32) {
        match id {
            "cutoff_hz" => self.cutoff_hz = value,
            "resonance" => self.resonance = value,
            _ => return,
        }
        self.redesign();
    }

    fn activate(&mut self, sample_rate: f64, _max_block_size: usize) -> anyhow::Result<()> {
        self.sample_rate = sample_rate as f32;
        self.redesign();
        Ok(())
    }

    fn reset(&mut self) {
        self.state_l = BiquadState::default();
        self.state_r = BiquadState::default();
    }

    fn process(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
        _midi: &[MidiEvent],
        frames: usize,
    ) {
        for i in 0..frames {
            output_l[i] = self.state_l.run(&self.coeffs, input_l[i]);
            output_r[i] = self.state_r.run(&self.coeffs, input_r[i]);
        }
    }
}

// ---------------------------------------------------------------------------
// Sine synth — minimal polyphonic instrument so MIDI tracks make sound.

const MAX_VOICES: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    active: bool,
    pitch: u8,
    phase: f32,
    amp: f32,
}

pub struct SineSynth {
    voices: [Voice; MAX_VOICES],
    level: f32,
    sample_rate: f32,
}

impl SineSynth {
    pub fn new() -> Self {
        Self { voices: [Voice::default(); MAX_VOICES], level: 0.5, sample_rate: 44100.0 }
    }

    fn note_on(&mut self, pitch: u8, velocity: u8) {
        let idx = self
            .voices
            .iter()
            .position(|v| !v.active)
            .or_else(|| {
                self.voices
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.amp.total_cmp(&b.amp))
                    .map(|(i, _)| i)
            });
        if let Some(i) = idx {
            self.voices[i] =
                Voice { active: true, pitch, phase: 0.0, amp: velocity as f32 / 127.0 };
        }
    }

    fn note_off(&mut self, pitch: u8) {
        for v in self.voices.iter_mut().filter(|v| v.active && v.pitch == pitch) {
            v.active = false;
        }
    }
}

#[inline]
fn pitch_to_hz(pitch: u8) -> f32 {
    440.0 * 2.0_f32.powf((pitch as f32 - 69.0) / 12.0)
}

impl PluginProcessor for SineSynth {
    fn params(&self) -> Vec<ParamInfo> {
        vec![ParamInfo {
            id: "level".into(),
            name: "Level".into(),
            min: 0.0,
            max: 1.0,
            default: 0.5,
            unit: None,
        }]
    }

    fn ports(&self) -> PortLayout {
        PortLayout { audio_inputs: 0, audio_outputs: 2, midi_input: true, midi_output: false }
    }

    fn category(&self) -> PluginCategory {
        PluginCategory::Instrument
    }

    fn set_param(&mut self, id: &str, value: f32) {
        if id == "level" {
            self.level = value;
        }
    }

    fn activate(&mut self, sample_rate: f64, _max_block_size: usize) -> anyhow::Result<()> {
        self.sample_rate = sample_rate as f32;
        Ok(())
    }

    fn reset(&mut self) {
        self.voices = [Voice::default(); MAX_VOICES];
    }

    fn process(
        &mut self,
        _input_l: &[f32],
        _input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
        midi: &[MidiEvent],
        frames: usize,
    ) {
        let mut next_event = 0;
        for i in 0..frames {
            while next_event < midi.len() && midi[next_event].frame as usize <= i {
                match midi[next_event].message {
                    MidiMessage::NoteOn { pitch, velocity, .. } if velocity > 0 => {
                        self.note_on(pitch, velocity)
                    }
                    MidiMessage::NoteOn { pitch, .. } | MidiMessage::NoteOff { pitch, .. } => {
                        self.note_off(pitch)
                    }
                    _ => {}
                }
                next_event += 1;
            }
            let mut sample = 0.0;
            for v in self.voices.iter_mut().filter(|v| v.active) {
                sample += v.phase.sin() * v.amp;
                v.phase += 2.0 * std::f32::consts::PI * pitch_to_hz(v.pitch) / self.sample_rate;
                if v.phase > 2.0 * std::f32::consts::PI {
                    v.phase -= 2.0 * std::f32::consts::PI;
                }
            }
            let out = sample * self.level;
            output_l[i] = out;
            output_r[i] = out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusId;

    fn manifest(kind: &str, settings: serde_json::Value) -> PluginManifest {
        PluginManifest {
            name: format!("test {kind}"),
            kind: kind.into(),
            version: "1.0".into(),
            settings,
        }
    }

    #[test]
    fn factory_rejects_unknown_kind() {
        let fmt = NativeFormat;
        assert!(!fmt.can_load(&manifest("reverb9000", serde_json::Value::Null)));
    }

    #[test]
    fn delay_reports_and_honors_latency() {
        let fmt = NativeFormat;
        let mut dsp = fmt
            .instantiate(&manifest("delay", serde_json::json!({ "samples": 4 })))
            .unwrap();
        dsp.activate(44100.0, 64).unwrap();
        assert_eq!(dsp.latency_samples(), 4);

        let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let mut out_l = vec![0.0; 16];
        let mut out_r = vec![0.0; 16];
        dsp.process(&input, &input, &mut out_l, &mut out_r, &[], 16);
        assert_eq!(&out_l[..4], &[0.0, 0.0, 0.0, 0.0]);
        assert_eq!(out_l[4], 0.0);
        assert_eq!(out_l[5], 1.0);
        assert_eq!(out_l[15], 11.0);
    }

    #[test]
    fn delay_settings_validated() {
        let fmt = NativeFormat;
        assert!(matches!(
            fmt.instantiate(&manifest("delay", serde_json::json!({ "samples": 0 }))),
            Err(PluginLoadError::InitFailure(_))
        ));
    }

    #[test]
    fn gain_at_unity_passes_audio() {
        let fmt = NativeFormat;
        let mut dsp = fmt.instantiate(&manifest("gain", serde_json::Value::Null)).unwrap();
        dsp.activate(44100.0, 8).unwrap();
        dsp.reset();
        let input = vec![0.5f32; 8];
        let mut out_l = vec![0.0; 8];
        let mut out_r = vec![0.0; 8];
        dsp.process(&input, &input, &mut out_l, &mut out_r, &[], 8);
        for s in &out_l {
            assert!((s - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn synth_produces_audio_after_note_on() {
        let mut synth = SineSynth::new();
        synth.activate(44100.0, 128).unwrap();
        let midi = [MidiEvent {
            frame: 0,
            track: BusId(0),
            message: MidiMessage::NoteOn { channel: 0, pitch: 69, velocity: 100 },
        }];
        let mut out_l = vec![0.0; 128];
        let mut out_r = vec![0.0; 128];
        synth.process(&[], &[], &mut out_l, &mut out_r, &midi, 128);
        assert!(out_l.iter().any(|s| s.abs() > 0.01));
    }
}
