/// Calculate stereo gain values from volume and pan using equal-power panning
#[inline]
pub fn calculate_stereo_gains(volume: f32, pan: f32) -> (f32, f32) {
    let pan_normalized = (pan.clamp(-1.0, 1.0) + 1.0) / 2.0;
    let angle = pan_normalized * std::f32::consts::FRAC_PI_2;
    (volume * angle.cos(), volume * angle.sin())
}

/// Convert linear gain to decibels
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.max(0.0001).log10()
}

/// Convert decibels to linear gain
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

#[inline]
pub fn linear_to_db_f64(linear: f64) -> f64 {
    20.0 * linear.max(1e-10).log10()
}

#[inline]
pub fn db_to_linear_f64(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Apply soft clipping to prevent harsh distortion
#[inline]
pub fn soft_clip(x: f32) -> f32 {
    if x.abs() <= 0.5 {
        x
    } else {
        let sign = x.signum();
        sign * (0.5 + (x.abs() - 0.5).tanh() * 0.5)
    }
}

/// True if every sample in the buffer is below the given magnitude.
#[inline]
pub fn is_silent(samples: &[f32], threshold: f32) -> bool {
    samples.iter().all(|s| s.abs() < threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pan_center_is_equal_power() {
        let (l, r) = calculate_stereo_gains(1.0, 0.0);
        assert!((l - r).abs() < 1e-6);
        assert!((l * l + r * r - 1.0).abs() < 1e-5);
    }

    #[test]
    fn db_round_trip() {
        for db in [-60.0f32, -12.0, -3.0, 0.0, 6.0] {
            assert!((linear_to_db(db_to_linear(db)) - db).abs() < 1e-3);
        }
    }

    #[test]
    fn soft_clip_is_bounded() {
        for x in [-10.0f32, -1.5, -0.3, 0.0, 0.3, 1.5, 10.0] {
            assert!(soft_clip(x).abs() <= 1.0);
        }
    }
}
