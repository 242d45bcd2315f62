//! Linear 8-bit quantization.
//!
//! A [`CvtParam`] describes how one NHWC tensor maps between float and
//! `u8`: per channel `u8 = clamp(round(x * scale + shift))` and back
//! `x = u8 * i_scale + i_shift`. It is derived from per-channel min/max
//! statistics and the accumulation policy.

use multiversion::multiversion;

use crate::error::{Error, Result};
use crate::param::Compatibility;

pub const U8_PRECISE_MAX: i32 = 255;
pub const U8_NARROWED_MAX: i32 = 180;
pub const I8_PRECISE_MIN: i32 = -128;
pub const I8_PRECISE_MAX: i32 = 127;
pub const I8_NARROWED_MIN: i32 = -90;
pub const I8_NARROWED_MAX: i32 = 90;

/// `clamp(round(value * norm) + zero, min, max)`, ties to even.
#[inline(always)]
pub fn quantize_linear(value: f32, norm: f32, zero: i32, min: i32, max: i32) -> i32 {
    ((value * norm).round_ties_even() as i32 + zero).clamp(min, max)
}

/// `(value + bias) * norm`; `bias` is the negated zero point.
#[inline(always)]
pub fn dequantize_linear(value: i32, bias: i32, norm: f32) -> f32 {
    (value + bias) as f32 * norm
}

/// Float <-> u8 conversion tables for one tensor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CvtParam {
    /// Some channel can be negative, so values are stored with an offset.
    pub neg: bool,
    pub scale: Vec<f32>,
    pub shift: Vec<f32>,
    pub i_scale: Vec<f32>,
    pub i_shift: Vec<f32>,
    /// Byte that decodes to 0.0, per channel.
    pub zero: Vec<u8>,
    pub u_min: i32,
    pub u_max: i32,
    pub i_min: i32,
    pub i_max: i32,
}

impl CvtParam {
    pub fn new(min: &[f32], max: &[f32], channels: usize, compatibility: Compatibility) -> Result<Self> {
        crate::error::check_len("stats min", min.len(), channels)?;
        crate::error::check_len("stats max", max.len(), channels)?;
        let narrowed = compatibility.narrowed();
        let u_max = if narrowed { U8_NARROWED_MAX } else { U8_PRECISE_MAX };
        let (i_min, i_max) = if narrowed {
            (I8_NARROWED_MIN, I8_NARROWED_MAX)
        } else {
            (I8_PRECISE_MIN, I8_PRECISE_MAX)
        };
        let neg = min[..channels].iter().any(|&m| m < 0.0);
        let mut param = Self {
            neg,
            scale: Vec::with_capacity(channels),
            shift: Vec::with_capacity(channels),
            i_scale: Vec::with_capacity(channels),
            i_shift: Vec::with_capacity(channels),
            zero: Vec::with_capacity(channels),
            u_min: 0,
            u_max,
            i_min,
            i_max,
        };
        for c in 0..channels {
            if !min[c].is_finite() || !max[c].is_finite() || min[c] > max[c] {
                return Err(Error::InvalidQuantization("statistics must be finite with min <= max"));
            }
            let mut abs = min[c].abs().max(max[c].abs());
            if abs < f32::MIN_POSITIVE {
                abs = 1.0;
            }
            let (scale, shift) = if neg {
                (i_max as f32 / abs, -i_min as f32)
            } else {
                (u_max as f32 / abs, 0.0)
            };
            param.scale.push(scale);
            param.shift.push(shift);
            param.i_scale.push(1.0 / scale);
            param.i_shift.push(-shift / scale);
            param.zero.push(shift as u8);
        }
        Ok(param)
    }

    pub fn channels(&self) -> usize {
        self.scale.len()
    }

    /// Same zero byte for every channel, which the convolution kernels rely on.
    pub fn uniform_zero(&self) -> u8 {
        self.zero.first().copied().unwrap_or(0)
    }

    #[inline(always)]
    pub fn quantize(&self, value: f32, channel: usize) -> u8 {
        let q = (value * self.scale[channel] + self.shift[channel]).round_ties_even() as i32;
        q.clamp(self.u_min, self.u_max) as u8
    }

    #[inline(always)]
    pub fn dequantize(&self, value: u8, channel: usize) -> f32 {
        f32::from(value) * self.i_scale[channel] + self.i_shift[channel]
    }
}

/// Quantizes NHWC pixels; `scale` and `shift` hold one entry per channel.
#[multiversion(targets("x86_64+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub fn quantize_pixels(src: &[f32], scale: &[f32], shift: &[f32], min: i32, max: i32, dst: &mut [u8]) {
    let channels = scale.len();
    for (s, d) in src.chunks_exact(channels).zip(dst.chunks_exact_mut(channels)) {
        for c in 0..channels {
            let q = (s[c] * scale[c] + shift[c]).round_ties_even() as i32;
            d[c] = q.clamp(min, max) as u8;
        }
    }
}

/// Dequantizes NHWC pixels; `scale` and `shift` hold one entry per channel.
#[multiversion(targets("x86_64+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub fn dequantize_pixels(src: &[u8], scale: &[f32], shift: &[f32], dst: &mut [f32]) {
    let channels = scale.len();
    for (s, d) in src.chunks_exact(channels).zip(dst.chunks_exact_mut(channels)) {
        for c in 0..channels {
            d[c] = f32::from(s[c]) * scale[c] + shift[c];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_tensor() {
        let cvt = CvtParam::new(&[0.0, 0.0], &[1.0, 4.0], 2, Compatibility::PRECISE).unwrap();
        assert!(!cvt.neg);
        assert_eq!(cvt.zero, vec![0, 0]);
        assert_eq!(cvt.quantize(1.0, 0), 255);
        assert_eq!(cvt.quantize(2.0, 1), 128);
        assert_eq!(cvt.quantize(-1.0, 1), 0);
    }

    #[test]
    fn test_signed_tensor_is_offset() {
        let cvt = CvtParam::new(&[-2.0], &[1.0], 1, Compatibility::PRECISE).unwrap();
        assert!(cvt.neg);
        assert_eq!(cvt.zero, vec![128]);
        assert_eq!(cvt.quantize(0.0, 0), 128);
        assert_eq!(cvt.quantize(2.0, 0), 255);
        assert_eq!(cvt.quantize(-2.0, 0), 1);
        let narrowed = CvtParam::new(&[-2.0], &[1.0], 1, Compatibility::NARROWED).unwrap();
        assert_eq!(narrowed.u_max, 180);
        assert_eq!(narrowed.quantize(2.0, 0), 180);
        assert_eq!(narrowed.quantize(-2.0, 0), 0);
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let cvt = CvtParam::new(&[-3.0], &[5.0], 1, Compatibility::PRECISE).unwrap();
        let step = cvt.i_scale[0];
        for i in 0..=200 {
            let x = -5.0 + i as f32 * 0.05;
            let y = cvt.dequantize(cvt.quantize(x, 0), 0);
            assert!((x - y).abs() <= step, "{} -> {}", x, y);
        }
    }

    #[test]
    fn test_linear_primitives() {
        assert_eq!(quantize_linear(1.25, 4.0, 10, 0, 255), 15);
        assert_eq!(quantize_linear(-100.0, 4.0, 10, 0, 255), 0);
        assert_eq!(dequantize_linear(15, -10, 0.25), 1.25);
    }

    #[test]
    fn test_invalid_stats() {
        assert!(CvtParam::new(&[f32::NAN], &[1.0], 1, Compatibility::PRECISE).is_err());
        assert!(CvtParam::new(&[0.0], &[1.0], 2, Compatibility::PRECISE).is_err());
    }

    #[test]
    fn test_pixel_rows() {
        let cvt = CvtParam::new(&[0.0, -1.0], &[2.0, 1.0], 2, Compatibility::PRECISE).unwrap();
        let src = [0.0, 0.0, 2.0, 1.0, 1.0, -1.0];
        let mut q = [0u8; 6];
        quantize_pixels(&src, &cvt.scale, &cvt.shift, cvt.u_min, cvt.u_max, &mut q);
        let mut back = [0f32; 6];
        dequantize_pixels(&q, &cvt.i_scale, &cvt.i_shift, &mut back);
        for (a, b) in src.iter().zip(back) {
            assert!((a - b).abs() < 0.02, "{} vs {}", a, b);
        }
    }
}
