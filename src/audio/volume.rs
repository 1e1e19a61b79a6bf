//! Logical volume to decoder attenuation mapping.

/// Levels at or below this percentage of full scale are silent.
pub const VOL_THRESHOLD: f32 = 40.0;

/// Usable dynamic range above [`VOL_THRESHOLD`].
pub const VOL_RANGE: f32 = 100.0 - VOL_THRESHOLD;

/// Highest attenuation code the driver will write. 0xFF powers the DAC down.
pub const MAX_ATTENUATION: u8 = 0xFE;

const CURVE_LEN: usize = 0xFF;

/// Descending lookup table of representable attenuation steps.
///
/// Entry `i` holds `top - i` until it reaches zero, where `top` is the
/// attenuation index matching the bottom of the usable range.
#[derive(Debug, Clone)]
pub struct VolumeCurve {
    steps: Vec<f32>,
    range: f32,
}

/// Result of mapping a logical volume onto the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attenuation {
    /// Value written to both channel bytes of the volume register.
    pub code: u8,
    /// Whether the codec mute line must be asserted.
    pub muted: bool,
}

impl VolumeCurve {
    pub fn new(range: f32) -> Self {
        let top = (range * 255.0 / 100.0) as i32;
        let steps = (0..CURVE_LEN as i32)
            .map(|i| (top - i).max(0) as f32)
            .collect();
        Self { steps, range }
    }

    /// Largest attenuation index on the curve.
    pub fn top(&self) -> f32 {
        self.steps[0]
    }

    /// Picks the curve entry closest to `target`.
    ///
    /// Exact ties go to the smaller attenuation (the louder step).
    pub fn nearest(&self, target: f32) -> u8 {
        if target as i32 == self.steps[0] as i32 {
            return self.steps[0] as u8;
        }
        if target <= 0.0 {
            return 0;
        }
        for pair in self.steps.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            if left >= target && target >= right {
                let diff_left = left - target;
                let diff_right = target - right;
                return if diff_left < diff_right {
                    left as u8
                } else {
                    right as u8
                };
            }
        }
        0
    }

    /// Maps a logical 0..=100 volume onto an attenuation code.
    pub fn attenuation(&self, level: f32) -> Attenuation {
        let level = if level.is_finite() {
            level.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let threshold = 100.0 - self.range;
        let scaled = level * self.range / 100.0 + threshold;
        let target = (100.0 - scaled) * 255.0 / 100.0;
        Attenuation {
            code: self.nearest(target).min(MAX_ATTENUATION),
            muted: scaled <= threshold,
        }
    }
}

impl Default for VolumeCurve {
    fn default() -> Self {
        Self::new(VOL_RANGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve_top_matches_usable_range() {
        let curve = VolumeCurve::default();
        assert_eq!(curve.top(), 153.0);
    }

    #[test]
    fn test_full_volume_is_loudest_code() {
        let att = VolumeCurve::default().attenuation(100.0);
        assert_eq!(att, Attenuation { code: 0, muted: false });
    }

    #[test]
    fn test_zero_volume_is_muted_at_curve_top() {
        let att = VolumeCurve::default().attenuation(0.0);
        assert_eq!(att.code, 153);
        assert!(att.muted);
    }

    #[test]
    fn test_louder_volume_never_attenuates_more() {
        let curve = VolumeCurve::default();
        let mut previous = curve.attenuation(0.0).code;
        for step in 1..=1000 {
            let code = curve.attenuation(step as f32 / 10.0).code;
            assert!(code <= previous, "volume {} raised attenuation", step as f32 / 10.0);
            previous = code;
        }
    }

    #[test]
    fn test_tie_favours_louder_step() {
        let curve = VolumeCurve::default();
        assert_eq!(curve.nearest(10.5), 10);
        assert_eq!(curve.nearest(10.4), 10);
        assert_eq!(curve.nearest(10.6), 11);
    }

    #[test]
    fn test_out_of_range_levels_clamp() {
        let curve = VolumeCurve::default();
        assert_eq!(curve.attenuation(250.0), curve.attenuation(100.0));
        assert_eq!(curve.attenuation(-5.0), curve.attenuation(0.0));
        assert_eq!(curve.attenuation(f32::NAN), curve.attenuation(0.0));
    }

    #[test]
    fn test_code_never_reaches_power_down_value() {
        let curve = VolumeCurve::new(100.0);
        assert_eq!(curve.nearest(255.0), 0xFF);
        let att = curve.attenuation(0.0);
        assert_eq!(att.code, MAX_ATTENUATION);
        assert!(att.muted);
    }
}
