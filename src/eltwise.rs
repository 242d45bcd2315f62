//! Elementwise operators on u8 tensors with per-tensor linear quantization.
//!
//! Inputs are dequantized with [`dequantize_linear`], combined in float,
//! activated and requantized with [`quantize_linear`]. The dequantization is
//! folded into one multiplier and one offset per input at construction.

use multiversion::multiversion;

use crate::activation::{activate_scalar, expand_params};
use crate::error::{check_buffer, check_len, Error, Result};
use crate::param::ActivationKind;
use crate::quant::{dequantize_linear, quantize_linear, U8_PRECISE_MAX};

/// Per-tensor quantization: `x = (u8 - zero) * scale`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantParam {
    pub scale: f32,
    pub zero: i32,
}

impl QuantParam {
    pub fn new(scale: f32, zero: i32) -> Self {
        Self { scale, zero }
    }

    /// Maps `[min, max]` (widened to include 0) onto the whole u8 range.
    pub fn from_range(min: f32, max: f32) -> Self {
        let (min, max) = (min.min(0.0), max.max(0.0));
        let span = max - min;
        if span <= 0.0 {
            return Self::new(1.0, 0);
        }
        let scale = span / U8_PRECISE_MAX as f32;
        Self::new(scale, (-min / scale).round() as i32)
    }

    fn validate(&self) -> Result<()> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(Error::InvalidQuantization("scale must be finite and positive"));
        }
        if !(0..=U8_PRECISE_MAX).contains(&self.zero) {
            return Err(Error::InvalidQuantization("zero point must fit in u8"));
        }
        Ok(())
    }

    #[inline(always)]
    pub fn dequantize(&self, value: u8) -> f32 {
        dequantize_linear(i32::from(value), -self.zero, self.scale)
    }

    #[inline(always)]
    pub fn quantize(&self, value: f32) -> u8 {
        quantize_linear(value, 1.0 / self.scale, self.zero, 0, U8_PRECISE_MAX) as u8
    }
}

#[derive(Clone, Debug)]
struct Requantize {
    kind: ActivationKind,
    params: Vec<f32>,
    norm: f32,
    zero: i32,
}

impl Requantize {
    fn new(dst: QuantParam, kind: ActivationKind, params: &[f32], channels: usize) -> Result<Self> {
        dst.validate()?;
        Ok(Self {
            kind,
            params: expand_params(kind, params, channels)?,
            norm: 1.0 / dst.scale,
            zero: dst.zero,
        })
    }

    #[inline(always)]
    fn apply(&self, value: f32, channel: usize) -> u8 {
        let v = activate_scalar(self.kind, value, &self.params, channel);
        quantize_linear(v, self.norm, self.zero, 0, U8_PRECISE_MAX) as u8
    }
}

#[multiversion(targets("x86_64+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
fn add_rows(a: &[u8], b: &[u8], scale: [f32; 2], bias: f32, out: &Requantize, dst: &mut [u8]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        let v = f32::from(x) * scale[0] + f32::from(y) * scale[1] + bias;
        *d = out.apply(v, 0);
    }
}

#[multiversion(targets("x86_64+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
fn scale_rows(src: &[u8], norm: &[f32], bias: &[f32], out: &Requantize, dst: &mut [u8]) {
    let channels = norm.len();
    for (s, d) in src.chunks_exact(channels).zip(dst.chunks_exact_mut(channels)) {
        for (c, (d, &s)) in d.iter_mut().zip(s).enumerate() {
            *d = out.apply(f32::from(s) * norm[c] + bias[c], c);
        }
    }
}

/// `dst = quantize(act(deq(a) + deq(b)))`.
///
/// Any tensor layout works since every element is independent. Per-channel
/// activations (Prelu) use their first parameter.
#[derive(Clone, Debug)]
pub struct QuantizedAdd {
    scale: [f32; 2],
    bias: f32,
    out: Requantize,
}

impl QuantizedAdd {
    pub fn new(
        a: QuantParam,
        b: QuantParam,
        dst: QuantParam,
        activation: ActivationKind,
        params: &[f32],
    ) -> Result<Self> {
        a.validate()?;
        b.validate()?;
        Ok(Self {
            scale: [a.scale, b.scale],
            bias: dequantize_linear(0, -a.zero, a.scale) + dequantize_linear(0, -b.zero, b.scale),
            out: Requantize::new(dst, activation, params, 1)?,
        })
    }

    pub fn forward(&self, a: &[u8], b: &[u8], dst: &mut [u8]) -> Result<()> {
        check_buffer("b", b.len(), a.len())?;
        check_buffer("dst", dst.len(), a.len())?;
        add_rows(a, &b[..a.len()], self.scale, self.bias, &self.out, &mut dst[..a.len()]);
        Ok(())
    }
}

/// Per-channel affine transform of an NHWC tensor:
/// `dst = quantize(act(deq(src) * scale[c] + bias[c]))`.
#[derive(Clone, Debug)]
pub struct QuantizedScale {
    norm: Vec<f32>,
    bias: Vec<f32>,
    out: Requantize,
}

impl QuantizedScale {
    pub fn new(
        src: QuantParam,
        scale: &[f32],
        bias: Option<&[f32]>,
        dst: QuantParam,
        activation: ActivationKind,
        params: &[f32],
    ) -> Result<Self> {
        src.validate()?;
        let channels = scale.len();
        if channels == 0 {
            return Err(Error::ParamLength {
                name: "scale",
                expected: 1,
                actual: 0,
            });
        }
        if let Some(bias) = bias {
            check_len("bias", bias.len(), channels)?;
        }
        let norm: Vec<f32> = scale.iter().map(|&s| s * src.scale).collect();
        let bias = (0..channels)
            .map(|c| bias.map_or(0.0, |b| b[c]) - src.zero as f32 * norm[c])
            .collect();
        Ok(Self {
            norm,
            bias,
            out: Requantize::new(dst, activation, params, channels)?,
        })
    }

    pub fn channels(&self) -> usize {
        self.norm.len()
    }

    /// `src` holds whole pixels; a trailing partial pixel is ignored.
    pub fn forward(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let len = src.len() - src.len() % self.channels();
        check_buffer("dst", dst.len(), len)?;
        scale_rows(&src[..len], &self.norm, &self.bias, &self.out, &mut dst[..len]);
        Ok(())
    }
}
