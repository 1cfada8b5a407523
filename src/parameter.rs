use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bus::BusId;
use crate::constants::DEFAULT_SMOOTHING_MS;
use crate::plugin_api::PluginId;

/// Identifies one automatable value in the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKey {
    Plugin { plugin: PluginId, param: String },
    TrackControl { bus: BusId, control: TrackControl },
    MidiCcOut { bus: BusId, controller: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackControl {
    Volume,
    Pan,
    SendLevel(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl ParamRange {
    pub fn new(min: f32, max: f32, default: f32) -> Self {
        Self { min, max, default }
    }

    pub fn unit() -> Self {
        Self { min: 0.0, max: 1.0, default: 0.0 }
    }

    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

/// A named, ranged, automatable value. Control-domain writers store into the
/// pending cell; the audio thread latches it at the next block boundary, so
/// mid-block processing never observes a torn or half-applied change.
pub struct Parameter {
    key: ParamKey,
    name: String,
    unit_label: Option<String>,
    range: ParamRange,
    value: AtomicCell<f32>,
    pending: AtomicCell<f32>,
    dirty: AtomicBool,
    smoothing_ms: AtomicCell<f32>,
}

impl Parameter {
    pub fn new(key: ParamKey, name: impl Into<String>, range: ParamRange) -> Self {
        Self {
            key,
            name: name.into(),
            unit_label: None,
            range,
            value: AtomicCell::new(range.default),
            pending: AtomicCell::new(range.default),
            dirty: AtomicBool::new(false),
            smoothing_ms: AtomicCell::new(DEFAULT_SMOOTHING_MS),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_label = Some(unit.into());
        self
    }

    pub fn key(&self) -> &ParamKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_label(&self) -> Option<&str> {
        self.unit_label.as_deref()
    }

    pub fn range(&self) -> ParamRange {
        self.range
    }

    /// Control-domain write. Clamps, never blocks, takes effect at the next
    /// processed block boundary.
    pub fn set(&self, value: f32) {
        self.pending.store(self.range.clamp(value));
        self.dirty.store(true, Ordering::Release);
    }

    /// Audio-thread call at a block boundary: applies any pending write and
    /// returns the current target value.
    pub fn latch_block(&self) -> f32 {
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.value.store(self.pending.load());
        }
        self.value.load()
    }

    /// Latest applied value, safe from any thread.
    pub fn get(&self) -> f32 {
        self.value.load()
    }

    pub fn smoothing_ms(&self) -> f32 {
        self.smoothing_ms.load()
    }

    pub fn set_smoothing_ms(&self, ms: f32) {
        self.smoothing_ms.store(ms.max(0.0));
    }
}

/// Single-pole smoother toward a target value, stepped once per block.
/// Used on the audio side to avoid zipper noise on parameter jumps.
#[derive(Debug, Clone, Copy)]
pub struct SmoothedValue {
    current: f32,
    sample_rate: f32,
}

impl SmoothedValue {
    pub fn new(initial: f32, sample_rate: f32) -> Self {
        Self { current: initial, sample_rate }
    }

    /// Advance by one block of `frames` toward `target`, returning the value
    /// at the end of the block. Callers ramp linearly across the block from
    /// the previous value to the returned one.
    pub fn advance(&mut self, target: f32, frames: usize, time_constant_ms: f32) -> f32 {
        if time_constant_ms <= 0.0 {
            self.current = target;
            return self.current;
        }
        let block_secs = frames as f32 / self.sample_rate;
        let tau = time_constant_ms / 1000.0;
        let coeff = 1.0 - (-block_secs / tau).exp();
        self.current += (target - self.current) * coeff;
        // Snap once the residual is inaudible so tails do not linger forever.
        if (target - self.current).abs() < 1e-6 {
            self.current = target;
        }
        self.current
    }

    pub fn snap(&mut self, value: f32) {
        self.current = value;
    }

    pub fn value(&self) -> f32 {
        self.current
    }
}

/// Registry of every parameter exposed by the session: bus strips, sends and
/// loaded plugin instances all publish theirs here so that automation and the
/// control surface address them uniformly.
#[derive(Default)]
pub struct ParameterSet {
    params: DashMap<ParamKey, Arc<Parameter>>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self { params: DashMap::new() }
    }

    pub fn register(&self, param: Parameter) -> Arc<Parameter> {
        let arc = Arc::new(param);
        self.params.insert(arc.key().clone(), arc.clone());
        arc
    }

    pub fn unregister(&self, key: &ParamKey) {
        self.params.remove(key);
    }

    /// Drop every parameter owned by the given plugin instance.
    pub fn unregister_plugin(&self, plugin: PluginId) {
        self.params
            .retain(|key, _| !matches!(key, ParamKey::Plugin { plugin: p, .. } if *p == plugin));
    }

    pub fn get(&self, key: &ParamKey) -> Option<Arc<Parameter>> {
        self.params.get(key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<ParamKey> {
        self.params.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_key() -> ParamKey {
        ParamKey::TrackControl { bus: BusId(1), control: TrackControl::Volume }
    }

    #[test]
    fn writes_take_effect_at_block_boundary() {
        let p = Parameter::new(volume_key(), "Volume", ParamRange::new(0.0, 1.0, 0.7));
        assert_eq!(p.get(), 0.7);

        p.set(0.2);
        // Not yet visible mid-block.
        assert_eq!(p.get(), 0.7);
        assert_eq!(p.latch_block(), 0.2);
        assert_eq!(p.get(), 0.2);
    }

    #[test]
    fn values_clamp_to_range() {
        let p = Parameter::new(volume_key(), "Volume", ParamRange::new(0.0, 1.0, 0.5));
        p.set(7.0);
        assert_eq!(p.latch_block(), 1.0);
        p.set(-3.0);
        assert_eq!(p.latch_block(), 0.0);
    }

    #[test]
    fn smoother_converges_without_overshoot() {
        let mut s = SmoothedValue::new(0.0, 48000.0);
        let mut last = 0.0;
        for _ in 0..100 {
            let v = s.advance(1.0, 512, 10.0);
            assert!(v >= last && v <= 1.0);
            last = v;
        }
        assert!((last - 1.0).abs() < 1e-4);
    }

    #[test]
    fn registry_unregisters_plugin_params() {
        let set = ParameterSet::new();
        set.register(Parameter::new(
            ParamKey::Plugin { plugin: PluginId(9), param: "drive".into() },
            "Drive",
            ParamRange::unit(),
        ));
        set.register(Parameter::new(volume_key(), "Volume", ParamRange::unit()));
        assert_eq!(set.len(), 2);
        set.unregister_plugin(PluginId(9));
        assert_eq!(set.len(), 1);
        assert!(set.get(&volume_key()).is_some());
    }
}
