//! Automation playback, recording and lane editing.
//!
//! Playback evaluates each readable lane at the block's start time, smooths
//! the result to avoid zipper artifacts and writes it to the parameter's
//! pending cell, which consumers latch at the same block boundary. Mode
//! changes and recording state transitions are likewise only honored at
//! block boundaries.

use std::collections::HashMap;

use crate::automation::{AutomationLane, AutomationMode, AutomationPoint};
use crate::constants::UNDO_STACK_LIMIT;
use crate::parameter::{ParamKey, ParameterSet, SmoothedValue};

#[derive(Debug, Default, Clone, Copy)]
struct RecordState {
    /// Physical control currently held (touch/latch).
    touched: bool,
    /// Latch stays engaged after release until playback stops.
    engaged: bool,
    current_value: Option<f32>,
}

pub struct AutomationEngine {
    lanes: HashMap<ParamKey, AutomationLane>,
    rec: HashMap<ParamKey, RecordState>,
    smoothers: HashMap<ParamKey, SmoothedValue>,
    pending_modes: Vec<(ParamKey, AutomationMode)>,
    undo_stack: Vec<(ParamKey, AutomationLane)>,
    redo_stack: Vec<(ParamKey, AutomationLane)>,
    sample_rate: f64,
}

impl AutomationEngine {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            lanes: HashMap::new(),
            rec: HashMap::new(),
            smoothers: HashMap::new(),
            pending_modes: Vec::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            sample_rate,
        }
    }

    pub fn create_lane(&mut self, target: ParamKey) -> &mut AutomationLane {
        self.lanes.entry(target.clone()).or_insert_with(|| AutomationLane::new(target))
    }

    pub fn lane(&self, target: &ParamKey) -> Option<&AutomationLane> {
        self.lanes.get(target)
    }

    pub fn lane_mut(&mut self, target: &ParamKey) -> Option<&mut AutomationLane> {
        self.lanes.get_mut(target)
    }

    pub fn remove_lane(&mut self, target: &ParamKey) {
        self.lanes.remove(target);
        self.rec.remove(target);
        self.smoothers.remove(target);
    }

    pub fn lanes(&self) -> impl Iterator<Item = &AutomationLane> {
        self.lanes.values()
    }

    /// Replace all lanes (session load).
    pub fn set_lanes(&mut self, lanes: Vec<AutomationLane>) {
        self.lanes = lanes.into_iter().map(|l| (l.target.clone(), l)).collect();
        self.rec.clear();
        self.smoothers.clear();
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    /// Request a lane mode change; honored at the next block boundary.
    pub fn request_mode(&mut self, target: ParamKey, mode: AutomationMode) {
        self.pending_modes.push((target, mode));
    }

    // -- recording input ----------------------------------------------------

    /// Physical control grabbed (fader touched, knob turned).
    pub fn begin_touch(&mut self, target: &ParamKey) {
        let state = self.rec.entry(target.clone()).or_default();
        state.touched = true;
        state.engaged = true;
    }

    /// Physical control released. Touch lanes revert to existing automation;
    /// latch lanes keep writing their last value.
    pub fn end_touch(&mut self, target: &ParamKey) {
        if let Some(state) = self.rec.get_mut(target) {
            state.touched = false;
        }
    }

    /// Incoming control change (MIDI CC, pitch bend, aftertouch or a direct
    /// parameter edit) while recording-capable modes are active.
    pub fn record_event(&mut self, target: &ParamKey, value: f32) {
        let state = self.rec.entry(target.clone()).or_default();
        state.touched = true;
        state.engaged = true;
        state.current_value = Some(value);
    }

    /// Playback stopped: latch disengages and recorded passes are thinned.
    pub fn stop(&mut self) {
        let touched_lanes: Vec<ParamKey> = self
            .rec
            .iter()
            .filter(|(_, s)| s.engaged)
            .map(|(k, _)| k.clone())
            .collect();
        self.rec.clear();
        for key in touched_lanes {
            if let Some(lane) = self.lanes.get_mut(&key) {
                thin_lane(lane);
            }
        }
    }

    // -- per-block processing ----------------------------------------------

    /// Run one block: apply staged mode changes, record into write-armed
    /// lanes over `[block_start, block_end)` seconds, and write evaluated
    /// values for readable lanes into `params`.
    pub fn process_block(&mut self, block_start: f64, frames: usize, params: &ParameterSet) {
        for (key, mode) in self.pending_modes.drain(..) {
            if let Some(lane) = self.lanes.get_mut(&key) {
                lane.mode = mode;
            }
        }

        let block_end = block_start + frames as f64 / self.sample_rate;

        for (key, lane) in &mut self.lanes {
            let state = self.rec.entry(key.clone()).or_default();
            let writing = match lane.mode {
                AutomationMode::Off => continue,
                AutomationMode::Read => false,
                AutomationMode::Write => true,
                AutomationMode::Touch => state.touched,
                AutomationMode::Latch => state.engaged,
            };

            if writing {
                let value = state
                    .current_value
                    .or_else(|| params.get(key).map(|p| p.get()))
                    .unwrap_or_default();
                state.current_value = Some(value);
                lane.erase_range(block_start, block_end);
                lane.insert(block_start, AutomationPoint::linear(value));
                continue;
            }

            // Read path (including touch/latch lanes that are not engaged).
            let Some(target_value) = lane.value_at(block_start) else {
                continue;
            };
            let Some(param) = params.get(key) else {
                continue;
            };
            let smoother = self.smoothers.entry(key.clone()).or_insert_with(|| {
                // Start the glide from wherever the parameter currently sits.
                SmoothedValue::new(param.get(), self.sample_rate as f32)
            });
            let smoothed = smoother.advance(target_value, frames, param.smoothing_ms());
            param.set(smoothed);
        }
    }

    /// Flush smoother state after a transport reposition so values jump
    /// instead of gliding across the seek.
    pub fn reset_smoothing(&mut self) {
        self.smoothers.clear();
    }

    // -- edits with undo ----------------------------------------------------

    fn checkpoint(&mut self, target: &ParamKey) {
        if let Some(lane) = self.lanes.get(target) {
            self.undo_stack.push((target.clone(), lane.clone()));
            if self.undo_stack.len() > UNDO_STACK_LIMIT {
                self.undo_stack.remove(0);
            }
            self.redo_stack.clear();
        }
    }

    pub fn edit<F>(&mut self, target: &ParamKey, op: F) -> bool
    where
        F: FnOnce(&mut AutomationLane),
    {
        if !self.lanes.contains_key(target) {
            return false;
        }
        self.checkpoint(target);
        op(self.lanes.get_mut(target).expect("lane checked above"));
        true
    }

    pub fn undo(&mut self) -> bool {
        match self.undo_stack.pop() {
            Some((key, lane)) => {
                if let Some(current) = self.lanes.insert(key.clone(), lane) {
                    self.redo_stack.push((key, current));
                }
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        match self.redo_stack.pop() {
            Some((key, lane)) => {
                if let Some(current) = self.lanes.insert(key.clone(), lane) {
                    self.undo_stack.push((key, current));
                }
                true
            }
            None => false,
        }
    }

    /// Drop history older than the given depth. Irreversible operations call
    /// this instead of silently invalidating entries.
    pub fn prune_history(&mut self, keep: usize) {
        let len = self.undo_stack.len();
        if len > keep {
            self.undo_stack.drain(..len - keep);
        }
        self.redo_stack.clear();
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }
}

/// Collapse points a straight line through their neighbors already explains.
/// Keeps gesture shape while dropping redundant per-block samples.
fn thin_lane(lane: &mut AutomationLane) {
    const TOLERANCE: f32 = 0.01;
    let points = lane.as_points();
    if points.len() <= 2 {
        return;
    }
    let mut keep = vec![points[0]];
    let mut last_kept = 0;
    for i in 1..points.len() - 1 {
        let (t0, v0) = points[last_kept];
        let (t2, v2) = points[i + 1];
        let (t1, v1) = points[i];
        let span = t2 - t0;
        let predicted = if span.abs() < f64::EPSILON {
            v0
        } else {
            v0 + (v2 - v0) * ((t1 - t0) / span) as f32
        };
        if (v1 - predicted).abs() > TOLERANCE {
            keep.push(points[i]);
            last_kept = i;
        }
    }
    keep.push(*points.last().expect("len > 2"));

    let curves: HashMap<u64, AutomationPoint> = lane
        .points
        .iter()
        .map(|(k, p)| (k.to_secs().to_bits(), *p))
        .collect();
    lane.points.clear();
    for (t, v) in keep {
        let point = curves
            .get(&t.to_bits())
            .copied()
            .unwrap_or(AutomationPoint::linear(v));
        lane.insert(t, point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusId;
    use crate::parameter::{ParamRange, Parameter, TrackControl};

    fn key() -> ParamKey {
        ParamKey::TrackControl { bus: BusId(1), control: TrackControl::Volume }
    }

    fn engine_with_params() -> (AutomationEngine, ParameterSet) {
        let engine = AutomationEngine::new(1000.0); // 1 kHz: 100 frames = 0.1 s
        let params = ParameterSet::new();
        params.register(Parameter::new(key(), "Volume", ParamRange::new(0.0, 1.0, 0.0)));
        (engine, params)
    }

    #[test]
    fn read_mode_applies_lane_value() {
        let (mut engine, params) = engine_with_params();
        let lane = engine.create_lane(key());
        lane.insert(0.0, AutomationPoint::linear(0.0));
        lane.insert(2.0, AutomationPoint::linear(1.0));

        let param = params.get(&key()).unwrap();
        param.set_smoothing_ms(0.0);

        engine.process_block(1.0, 100, &params);
        assert!((param.latch_block() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn smoothing_approaches_target_gradually() {
        let (mut engine, params) = engine_with_params();
        let lane = engine.create_lane(key());
        lane.insert(0.0, AutomationPoint::step(1.0));

        let param = params.get(&key()).unwrap();
        param.set_smoothing_ms(500.0);

        engine.process_block(0.0, 100, &params);
        let first = param.latch_block();
        assert!(first > 0.0 && first < 1.0, "expected partial approach, got {first}");
        for _ in 0..100 {
            engine.process_block(0.0, 100, &params);
        }
        assert!((param.latch_block() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn write_mode_overwrites_as_head_passes() {
        let (mut engine, params) = engine_with_params();
        {
            let lane = engine.create_lane(key());
            lane.insert(0.05, AutomationPoint::linear(0.9));
            lane.mode = AutomationMode::Write;
        }
        engine.record_event(&key(), 0.3);
        engine.process_block(0.0, 100, &params); // covers [0, 0.1)

        let lane = engine.lane(&key()).unwrap();
        assert_eq!(lane.as_points(), vec![(0.0, 0.3)]);
    }

    #[test]
    fn touch_reverts_after_release() {
        let (mut engine, params) = engine_with_params();
        {
            let lane = engine.create_lane(key());
            lane.insert(10.0, AutomationPoint::linear(0.8));
            lane.mode = AutomationMode::Touch;
        }
        engine.record_event(&key(), 0.4);
        engine.process_block(0.0, 100, &params);
        assert_eq!(engine.lane(&key()).unwrap().len(), 2);

        engine.end_touch(&key());
        engine.process_block(0.1, 100, &params);
        // Released: no further points written.
        assert_eq!(engine.lane(&key()).unwrap().len(), 2);
    }

    #[test]
    fn latch_keeps_writing_after_release() {
        let (mut engine, params) = engine_with_params();
        engine.create_lane(key()).mode = AutomationMode::Latch;

        engine.record_event(&key(), 0.6);
        engine.process_block(0.0, 100, &params);
        engine.end_touch(&key());
        engine.process_block(0.1, 100, &params);
        let lane = engine.lane(&key()).unwrap();
        assert_eq!(lane.len(), 2);
        assert!(lane.as_points().iter().all(|(_, v)| (*v - 0.6).abs() < 1e-6));

        engine.stop();
        engine.process_block(0.2, 100, &params);
        // Disengaged after stop: thinned, no new points.
        assert!(engine.lane(&key()).unwrap().len() <= 2);
    }

    #[test]
    fn mode_changes_wait_for_block_boundary() {
        let (mut engine, params) = engine_with_params();
        engine.create_lane(key());
        engine.request_mode(key(), AutomationMode::Off);
        assert_eq!(engine.lane(&key()).unwrap().mode, AutomationMode::Read);
        engine.process_block(0.0, 100, &params);
        assert_eq!(engine.lane(&key()).unwrap().mode, AutomationMode::Off);
    }

    #[test]
    fn undo_redo_round_trip() {
        let (mut engine, _params) = engine_with_params();
        engine.create_lane(key()).insert(0.0, AutomationPoint::linear(0.5));

        engine.edit(&key(), |lane| lane.insert(1.0, AutomationPoint::linear(0.9)));
        assert_eq!(engine.lane(&key()).unwrap().len(), 2);

        assert!(engine.undo());
        assert_eq!(engine.lane(&key()).unwrap().len(), 1);
        assert!(engine.redo());
        assert_eq!(engine.lane(&key()).unwrap().len(), 2);
    }

    #[test]
    fn history_is_bounded_and_prunable() {
        let (mut engine, _params) = engine_with_params();
        engine.create_lane(key());
        for i in 0..UNDO_STACK_LIMIT + 20 {
            engine.edit(&key(), |lane| {
                lane.insert(i as f64 * 0.01, AutomationPoint::linear(0.1));
            });
        }
        assert_eq!(engine.undo_depth(), UNDO_STACK_LIMIT);
        engine.prune_history(3);
        assert_eq!(engine.undo_depth(), 3);
    }
}
