use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::parameter::ParamKey;
use crate::time_utils::quantize_to_grid;

/// Seconds as a totally ordered map key. Only non-negative times are valid,
/// for which the IEEE bit pattern orders the same way the value does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeKey(u64);

impl TimeKey {
    pub fn from_secs(secs: f64) -> Self {
        debug_assert!(secs >= 0.0 && secs.is_finite());
        TimeKey(secs.max(0.0).to_bits())
    }

    pub fn to_secs(self) -> f64 {
        f64::from_bits(self.0)
    }
}

/// Shape of the segment from a point to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CurveType {
    Step,
    Linear,
    Exponential,
    Bezier,
}

/// Control values for a cubic bezier segment, pinned at one-third and
/// two-thirds of the segment's duration so evaluation stays closed-form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BezierHandles {
    pub out_value: f32,
    pub in_value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    pub value: f32,
    pub curve: CurveType,
    pub handles: Option<BezierHandles>,
}

impl AutomationPoint {
    pub fn linear(value: f32) -> Self {
        Self { value, curve: CurveType::Linear, handles: None }
    }

    pub fn step(value: f32) -> Self {
        Self { value, curve: CurveType::Step, handles: None }
    }
}

/// Gates whether playback or user input controls the parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AutomationMode {
    Off,
    #[default]
    Read,
    Touch,
    Latch,
    Write,
}

/// Time-indexed curve for exactly one parameter. The map keeps times
/// strictly increasing by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationLane {
    pub target: ParamKey,
    pub points: BTreeMap<TimeKey, AutomationPoint>,
    pub mode: AutomationMode,
}

impl AutomationLane {
    pub fn new(target: ParamKey) -> Self {
        Self { target, points: BTreeMap::new(), mode: AutomationMode::Read }
    }

    pub fn insert(&mut self, time: f64, point: AutomationPoint) {
        self.points.insert(TimeKey::from_secs(time), point);
    }

    pub fn remove(&mut self, time: f64) -> Option<AutomationPoint> {
        self.points.remove(&TimeKey::from_secs(time))
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Evaluate the lane at a transport time. Returns `None` for an empty
    /// lane; before the first / after the last point the boundary value
    /// holds.
    pub fn value_at(&self, time: f64) -> Option<f32> {
        if self.points.is_empty() {
            return None;
        }
        let key = TimeKey::from_secs(time);
        let before = self.points.range(..=key).next_back();
        let after = self.points.range(key..).next();

        match (before, after) {
            (Some((t0, p0)), Some((t1, p1))) => {
                if t0 == t1 {
                    return Some(p0.value);
                }
                let start = t0.to_secs();
                let end = t1.to_secs();
                let t = ((time - start) / (end - start)) as f32;
                Some(evaluate_segment(p0, p1.value, t))
            }
            (Some((_, p)), None) | (None, Some((_, p))) => Some(p.value),
            (None, None) => None,
        }
    }

    /// Erase every point with `start <= time < end`.
    pub fn erase_range(&mut self, start: f64, end: f64) {
        let from = TimeKey::from_secs(start);
        let to = TimeKey::from_secs(end);
        let doomed: Vec<TimeKey> = self.points.range(from..to).map(|(k, _)| *k).collect();
        for k in doomed {
            self.points.remove(&k);
        }
    }

    /// Keep only points inside `[start, end]`.
    pub fn trim(&mut self, start: f64, end: f64) {
        self.points.retain(|k, _| {
            let t = k.to_secs();
            t >= start && t <= end
        });
    }

    /// Rescale values so the lane spans `[lo, hi]`.
    pub fn normalize(&mut self, lo: f32, hi: f32) {
        let (min, max) = match self
            .points
            .values()
            .map(|p| p.value)
            .fold(None, |acc: Option<(f32, f32)>, v| {
                Some(acc.map_or((v, v), |(lo, hi)| (lo.min(v), hi.max(v))))
            }) {
            Some(range) => range,
            None => return,
        };
        let span = max - min;
        for p in self.points.values_mut() {
            p.value = if span.abs() < f32::EPSILON {
                lo
            } else {
                lo + (p.value - min) / span * (hi - lo)
            };
        }
    }

    /// Reflect values around the midpoint of `[lo, hi]`.
    pub fn invert(&mut self, lo: f32, hi: f32) {
        for p in self.points.values_mut() {
            p.value = (lo + hi - p.value).clamp(lo.min(hi), hi.max(lo));
        }
    }

    /// Three-point moving average over values; times are untouched.
    pub fn smooth(&mut self) {
        if self.points.len() < 3 {
            return;
        }
        let values: Vec<f32> = self.points.values().map(|p| p.value).collect();
        let smoothed: Vec<f32> = (0..values.len())
            .map(|i| {
                if i == 0 || i == values.len() - 1 {
                    values[i]
                } else {
                    (values[i - 1] + values[i] + values[i + 1]) / 3.0
                }
            })
            .collect();
        for (p, v) in self.points.values_mut().zip(smoothed) {
            p.value = v;
        }
    }

    /// Snap point times to the nearest multiple of `grid`. Point count and
    /// relative order are preserved; colliding snaps are pushed to the next
    /// free grid slot.
    pub fn quantize(&mut self, grid: f64) {
        if grid <= 0.0 || self.points.is_empty() {
            return;
        }
        let old = std::mem::take(&mut self.points);
        let mut last: Option<f64> = None;
        for (key, point) in old {
            let mut snapped = quantize_to_grid(key.to_secs(), grid);
            if let Some(prev) = last {
                if snapped <= prev {
                    snapped = prev + grid;
                }
            }
            last = Some(snapped);
            self.points.insert(TimeKey::from_secs(snapped), point);
        }
    }

    /// Copy the points inside `[start, end)`, times relative to `start`.
    pub fn copy_range(&self, start: f64, end: f64) -> Vec<(f64, AutomationPoint)> {
        self.points
            .range(TimeKey::from_secs(start)..TimeKey::from_secs(end))
            .map(|(k, p)| (k.to_secs() - start, *p))
            .collect()
    }

    /// Paste previously copied points at `at`, overwriting the pasted span.
    pub fn paste(&mut self, at: f64, clip: &[(f64, AutomationPoint)]) {
        if let Some((last, _)) = clip.last() {
            self.erase_range(at, at + last + f64::EPSILON);
        }
        for (offset, point) in clip {
            self.insert(at + offset, *point);
        }
    }

    /// Ordered (time, value) view, cheap enough for tests and serialization
    /// checks.
    pub fn as_points(&self) -> Vec<(f64, f32)> {
        self.points.iter().map(|(k, p)| (k.to_secs(), p.value)).collect()
    }
}

const LOG_DOMAIN_FLOOR: f32 = 1e-6;

fn evaluate_segment(from: &AutomationPoint, to_value: f32, t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    let start = from.value;
    match from.curve {
        CurveType::Step => {
            if t < 1.0 {
                start
            } else {
                to_value
            }
        }
        CurveType::Linear => start + (to_value - start) * t,
        CurveType::Exponential => {
            // Interpolate in the log domain, clamped away from zero.
            let a = start.max(LOG_DOMAIN_FLOOR).ln();
            let b = to_value.max(LOG_DOMAIN_FLOOR).ln();
            (a + (b - a) * t).exp()
        }
        CurveType::Bezier => {
            let (c1, c2) = match from.handles {
                Some(h) => (h.out_value, h.in_value),
                None => {
                    let third = (to_value - start) / 3.0;
                    (start + third, to_value - third)
                }
            };
            let mt = 1.0 - t;
            mt * mt * mt * start
                + 3.0 * mt * mt * t * c1
                + 3.0 * mt * t * t * c2
                + t * t * t * to_value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusId;
    use crate::parameter::TrackControl;

    fn lane() -> AutomationLane {
        AutomationLane::new(ParamKey::TrackControl {
            bus: BusId(0),
            control: TrackControl::Volume,
        })
    }

    #[test]
    fn insertion_order_does_not_matter_for_readback() {
        let mut l = lane();
        l.insert(2.0, AutomationPoint::linear(0.2));
        l.insert(0.5, AutomationPoint::linear(0.5));
        l.insert(1.0, AutomationPoint::linear(1.0));
        assert_eq!(l.as_points(), vec![(0.5, 0.5), (1.0, 1.0), (2.0, 0.2)]);
    }

    #[test]
    fn linear_midpoint() {
        let mut l = lane();
        l.insert(0.0, AutomationPoint::linear(0.0));
        l.insert(2.0, AutomationPoint::linear(1.0));
        assert_eq!(l.value_at(1.0), Some(0.5));
    }

    #[test]
    fn linear_interpolation_stays_between_endpoints() {
        let mut l = lane();
        l.insert(1.0, AutomationPoint::linear(0.25));
        l.insert(3.0, AutomationPoint::linear(0.75));
        for i in 1..20 {
            let t = 1.0 + 2.0 * i as f64 / 20.0;
            let v = l.value_at(t).unwrap();
            assert!(v > 0.25 && v < 0.75, "value {v} at {t} escaped endpoints");
        }
    }

    #[test]
    fn boundary_values_hold_outside_the_lane() {
        let mut l = lane();
        l.insert(1.0, AutomationPoint::linear(0.3));
        l.insert(2.0, AutomationPoint::linear(0.9));
        assert_eq!(l.value_at(0.0), Some(0.3));
        assert_eq!(l.value_at(5.0), Some(0.9));
        assert_eq!(lane().value_at(1.0), None);
    }

    #[test]
    fn step_holds_until_next_point() {
        let mut l = lane();
        l.insert(0.0, AutomationPoint::step(0.1));
        l.insert(1.0, AutomationPoint::step(0.8));
        assert_eq!(l.value_at(0.999), Some(0.1));
        assert_eq!(l.value_at(1.0), Some(0.8));
    }

    #[test]
    fn exponential_is_clamped_away_from_zero() {
        let mut l = lane();
        l.insert(0.0, AutomationPoint { value: 0.0, curve: CurveType::Exponential, handles: None });
        l.insert(1.0, AutomationPoint::linear(1.0));
        let v = l.value_at(0.5).unwrap();
        assert!(v.is_finite() && v > 0.0);
    }

    #[test]
    fn bezier_respects_endpoints() {
        let mut l = lane();
        l.insert(
            0.0,
            AutomationPoint {
                value: 0.0,
                curve: CurveType::Bezier,
                handles: Some(BezierHandles { out_value: 0.9, in_value: 0.1 }),
            },
        );
        l.insert(1.0, AutomationPoint::linear(1.0));
        assert_eq!(l.value_at(0.0), Some(0.0));
        assert_eq!(l.value_at(1.0), Some(1.0));
        let mid = l.value_at(0.5).unwrap();
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn quantize_preserves_count_and_snaps_to_grid() {
        let mut l = lane();
        for (t, v) in [(0.11, 0.1), (0.52, 0.2), (0.61, 0.3), (1.92, 0.4)] {
            l.insert(t, AutomationPoint::linear(v));
        }
        l.quantize(0.25);
        let points = l.as_points();
        assert_eq!(points.len(), 4);
        for (t, _) in &points {
            let steps = t / 0.25;
            assert!((steps - steps.round()).abs() < 1e-9, "{t} is off-grid");
        }
        // Order (by value identity) is preserved.
        let values: Vec<f32> = points.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn copy_paste_round_trip() {
        let mut l = lane();
        l.insert(1.0, AutomationPoint::linear(0.1));
        l.insert(1.5, AutomationPoint::linear(0.9));
        let clip = l.copy_range(1.0, 2.0);
        l.paste(4.0, &clip);
        assert_eq!(l.value_at(4.0), Some(0.1));
        assert_eq!(l.value_at(4.5), Some(0.9));
        assert_eq!(l.len(), 4);
    }

    #[test]
    fn normalize_and_invert() {
        let mut l = lane();
        l.insert(0.0, AutomationPoint::linear(0.2));
        l.insert(1.0, AutomationPoint::linear(0.6));
        l.normalize(0.0, 1.0);
        assert_eq!(l.as_points(), vec![(0.0, 0.0), (1.0, 1.0)]);
        l.invert(0.0, 1.0);
        assert_eq!(l.as_points(), vec![(0.0, 1.0), (1.0, 0.0)]);
    }
}
