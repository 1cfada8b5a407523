//! Plugin delay compensation primitives: fixed delay lines inserted on the
//! shorter paths of the routing graph so every signal reaching a common
//! downstream bus arrives time-aligned with the longest-latency path.

/// Stereo fixed delay line. Length changes reallocate and are therefore only
/// performed when routing or chain latencies change, never mid-block.
#[derive(Debug, Clone)]
pub struct DelayLine {
    delay: usize,
    buf_l: Vec<f32>,
    buf_r: Vec<f32>,
    pos: usize,
}

impl DelayLine {
    pub fn new(delay: usize) -> Self {
        Self {
            delay,
            buf_l: vec![0.0; delay.max(1)],
            buf_r: vec![0.0; delay.max(1)],
            pos: 0,
        }
    }

    pub fn delay_samples(&self) -> usize {
        self.delay
    }

    pub fn set_delay(&mut self, delay: usize) {
        if delay != self.delay {
            *self = DelayLine::new(delay);
        }
    }

    pub fn clear(&mut self) {
        self.buf_l.fill(0.0);
        self.buf_r.fill(0.0);
        self.pos = 0;
    }

    /// Delay both channels in place.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32], frames: usize) {
        if self.delay == 0 {
            return;
        }
        let len = self.buf_l.len();
        for i in 0..frames {
            let out_l = self.buf_l[self.pos];
            let out_r = self.buf_r[self.pos];
            self.buf_l[self.pos] = left[i];
            self.buf_r[self.pos] = right[i];
            left[i] = out_l;
            right[i] = out_r;
            self.pos = (self.pos + 1) % len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_by_exactly_n_samples() {
        let mut dl = DelayLine::new(3);
        let mut l: Vec<f32> = (1..=8).map(|i| i as f32).collect();
        let mut r = l.clone();
        dl.process(&mut l, &mut r, 8);
        assert_eq!(l, vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn zero_delay_is_transparent() {
        let mut dl = DelayLine::new(0);
        let mut l = vec![0.5f32; 4];
        let mut r = vec![0.25f32; 4];
        dl.process(&mut l, &mut r, 4);
        assert_eq!(l, vec![0.5; 4]);
        assert_eq!(r, vec![0.25; 4]);
    }

    #[test]
    fn resizing_resets_state() {
        let mut dl = DelayLine::new(2);
        let mut l = vec![1.0f32; 2];
        let mut r = vec![1.0f32; 2];
        dl.process(&mut l, &mut r, 2);
        dl.set_delay(4);
        assert_eq!(dl.delay_samples(), 4);
        let mut l2 = vec![0.0f32; 4];
        let mut r2 = vec![0.0f32; 4];
        dl.process(&mut l2, &mut r2, 4);
        assert_eq!(l2, vec![0.0; 4]);
    }
}
