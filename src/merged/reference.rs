//! Whole-image path: every convolution runs over the full tensor with the
//! same quantized weights the merged stages use, but without ring buffers,
//! tiling or saturating accumulation.

use super::{Model, TensorMut, TensorRef};
use crate::activation::activate_scalar;
use crate::param::{ConvParam, MergConvParam};
use crate::quant::{dequantize_pixels, quantize_pixels, CvtParam};

use super::weights::QuantizedDense;

enum Plane {
    U8(Vec<u8>),
    F32(Vec<f32>),
}

fn quantize(src: &[f32], cvt: &CvtParam) -> Vec<u8> {
    let mut dst = vec![0u8; src.len()];
    quantize_pixels(src, &cvt.scale, &cvt.shift, cvt.u_min, cvt.u_max, &mut dst);
    dst
}

fn dequantize(src: &[u8], cvt: &CvtParam) -> Vec<f32> {
    let mut dst = vec![0f32; src.len()];
    dequantize_pixels(src, &cvt.i_scale, &cvt.i_shift, &mut dst);
    dst
}

/// Dense convolution of a u8 image: im2row with the per-channel zero byte
/// in the padding, an exact int32 product, then `sum * norm + bias` and the
/// activation.
pub(crate) fn dense(src: &[u8], p: &ConvParam, zero: &[u8], q: &QuantizedDense, params: &[f32]) -> Vec<f32> {
    let depth = p.kernel_size() * p.src_c;
    let mut row = vec![0u8; depth];
    let mut dst = vec![0f32; p.dst_size()];
    for dy in 0..p.dst_h {
        for dx in 0..p.dst_w {
            for ky in 0..p.kernel_y {
                let sy = (dy * p.stride_y + ky * p.dilation_y).wrapping_sub(p.pad_y);
                for kx in 0..p.kernel_x {
                    let sx = (dx * p.stride_x + kx * p.dilation_x).wrapping_sub(p.pad_x);
                    let at = (ky * p.kernel_x + kx) * p.src_c;
                    let cell = &mut row[at..at + p.src_c];
                    if sy < p.src_h && sx < p.src_w {
                        let pix = (sy * p.src_w + sx) * p.src_c;
                        cell.copy_from_slice(&src[pix..pix + p.src_c]);
                    } else {
                        cell.copy_from_slice(&zero[..p.src_c]);
                    }
                }
            }
            let out = &mut dst[(dy * p.dst_w + dx) * p.dst_c..][..p.dst_c];
            for (d, o) in out.iter_mut().enumerate() {
                let sum: i32 = row
                    .iter()
                    .enumerate()
                    .map(|(kc, &s)| i32::from(s) * i32::from(q.weight[kc * p.dst_c + d]))
                    .sum();
                let v = sum as f32 * q.norm[d] + q.bias[d];
                *o = activate_scalar(p.activation, v, params, d);
            }
        }
    }
    dst
}

/// Depthwise convolution in float, taps in row-major order.
pub(crate) fn depthwise(src: &[f32], p: &ConvParam, weight: &[f32], bias: &[f32], params: &[f32], nofma: bool) -> Vec<f32> {
    let mut dst = vec![0f32; p.dst_size()];
    for dy in 0..p.dst_h {
        for dx in 0..p.dst_w {
            for c in 0..p.dst_c {
                let mut sum = bias[c];
                for ky in 0..p.kernel_y {
                    let sy = (dy * p.stride_y + ky * p.dilation_y).wrapping_sub(p.pad_y);
                    if sy >= p.src_h {
                        continue;
                    }
                    for kx in 0..p.kernel_x {
                        let sx = (dx * p.stride_x + kx * p.dilation_x).wrapping_sub(p.pad_x);
                        if sx >= p.src_w {
                            continue;
                        }
                        let s = src[(sy * p.src_w + sx) * p.src_c + c];
                        let w = weight[(ky * p.kernel_x + kx) * p.src_c + c];
                        sum = if nofma { s * w + sum } else { s.mul_add(w, sum) };
                    }
                }
                dst[(dy * p.dst_w + dx) * p.dst_c + c] = activate_scalar(p.activation, sum, params, c);
            }
        }
    }
    dst
}

/// Runs one batch item through every convolution of the block.
pub(crate) fn forward(param: &MergConvParam, model: &Model, src: TensorRef<'_>, dst: TensorMut<'_>) {
    let nofma = param.compatibility.fma_avoid();
    let last = param.count() - 1;
    let mut plane = match src {
        TensorRef::U8(s) => Plane::U8(s.to_vec()),
        TensorRef::F32(s) => Plane::F32(s.to_vec()),
    };
    for (i, (p, conv)) in param.conv.iter().zip(&model.conv).enumerate() {
        // dense stages read u8, the depthwise stage reads floats
        let cvt = &model.cvt[if i == 0 { 0 } else { 1 }];
        let out = if p.is_depthwise() {
            let input = match plane {
                Plane::U8(u) => dequantize(&u, cvt),
                Plane::F32(f) => f,
            };
            depthwise(&input, p, &conv.raw, &conv.bias, &conv.params, nofma)
        } else {
            let input = match plane {
                Plane::U8(u) => u,
                Plane::F32(f) => quantize(&f, cvt),
            };
            dense(&input, p, &cvt.zero, &conv.dense, &conv.params)
        };
        plane = if i == last {
            Plane::F32(out)
        } else if p.is_depthwise() {
            // feeds the trailing dense convolution
            Plane::U8(quantize(&out, &model.cvt[1]))
        } else {
            Plane::F32(out)
        };
    }
    match (plane, dst) {
        (Plane::F32(v), TensorMut::F32(d)) => d[..v.len()].copy_from_slice(&v),
        (Plane::F32(v), TensorMut::U8(d)) => {
            let cvt = &model.cvt[2];
            quantize_pixels(&v, &cvt.scale, &cvt.shift, cvt.u_min, cvt.u_max, &mut d[..v.len()]);
        }
        (Plane::U8(_), _) => unreachable!("the last stage always yields floats"),
    }
}
