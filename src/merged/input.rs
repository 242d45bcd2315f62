//! Input stage: dense convolution of the quantized source into the float
//! ring buffer of the depthwise stage.
//!
//! Destination channels go in `2F` tiles so one broadcast source quad feeds
//! two weight vectors; destination columns go in micro tiles of
//! `L::MICRO_W` positions. The ring buffer is laid out
//! `[channel block][row & (buf_h - 1)][x][F]`.

use super::term::{Tables, TileConsts};
use super::AlgParam;
use crate::activation::Activation;
use crate::param::ConvParam;
use crate::simd::Lanes;

pub(crate) const MAX_MICRO: usize = 32;

pub(crate) type InputFn = fn(
    src: &[u8],
    p: &ConvParam,
    a: &AlgParam,
    ma_c: usize,
    y_beg: usize,
    y_end: usize,
    t: &Tables<'_, i8>,
    dst: &mut [f32],
);

/// Four consecutive source channels starting at `offset`, zero padded past
/// the pixel's last channel.
#[inline(always)]
pub(crate) fn quad(src: &[u8], offset: usize, remain: usize) -> [u8; 4] {
    if remain >= 4 {
        [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]]
    } else {
        let mut q = [0u8; 4];
        q[..remain].copy_from_slice(&src[offset..offset + remain]);
        q
    }
}

#[inline(always)]
fn save_tile<L: Lanes, A: Activation>(
    sums: &[[L::I32; 2]],
    consts: &TileConsts<L>,
    channels: usize,
    block: usize,
    offset: usize,
    dst: &mut [f32],
) {
    let f = L::F;
    for (i, sum) in sums.iter().enumerate() {
        let x = offset + i * f;
        for half in 0..2 {
            if half * f >= channels {
                break;
            }
            let v = A::activate::<L>(consts.dequantize(sum[half], half), &consts.params[half]);
            let at = half * block + x;
            L::store(v, &mut dst[at..at + f]);
        }
    }
}

/// Generic K×K convolution with stride, dilation and padding.
pub(crate) fn input_convolution<L: Lanes, A: Activation, const OVERFLOW: bool>(
    src: &[u8],
    p: &ConvParam,
    a: &AlgParam,
    ma_c: usize,
    y_beg: usize,
    y_end: usize,
    t: &Tables<'_, i8>,
    dst: &mut [f32],
) {
    let (f, df) = (L::F, 2 * L::F);
    let quads = p.src_c.div_ceil(4);
    let tile = df * 4;
    let s_mask = a.buf_h[0].wrapping_sub(1);
    let s_row = p.src_w * p.src_c;
    let d_mask = a.buf_h[1] - 1;
    let d_row = p.dst_w * f;
    let d_block = a.buf_h[1] * d_row;
    let (nose, body) = (p.nose_w(), p.body_w());
    let fill = (a.zero != 0).then_some([a.zero; 4]);

    for dc in (0..ma_c).step_by(df) {
        let channels = (ma_c - dc).min(df);
        let weight = &t.weight[dc * a.dw[0]..];
        let consts = TileConsts::<L>::new::<A, i8>(t, dc);
        let block = (dc / f) * d_block;
        for dy in y_beg..y_end {
            let sy0 = (dy * p.stride_y).wrapping_sub(p.pad_y);
            let d_off = block + (dy & d_mask) * d_row;
            let mut dx = 0;
            while dx < p.dst_w {
                let inner = dx >= nose && dx < body;
                let m = if inner { (body - dx).min(L::MICRO_W) } else { 1 };
                let mut sums = [[L::isplat(0); 2]; MAX_MICRO];
                for ky in 0..p.kernel_y {
                    let sy = sy0.wrapping_add(ky * p.dilation_y);
                    let row_in = sy < p.src_h;
                    if !row_in && fill.is_none() {
                        continue;
                    }
                    let row = if row_in { (sy & s_mask) * s_row } else { 0 };
                    for kx in 0..p.kernel_x {
                        let k = ky * p.kernel_x + kx;
                        let sx0 = (dx * p.stride_x)
                            .wrapping_sub(p.pad_x)
                            .wrapping_add(kx * p.dilation_x);
                        for q in 0..quads {
                            let wo = (k * quads + q) * tile;
                            let w0 = L::weights4(&weight[wo..wo + f * 4]);
                            let w1 = L::weights4(&weight[wo + f * 4..wo + tile]);
                            for (i, sum) in sums[..m].iter_mut().enumerate() {
                                let sx = sx0.wrapping_add(i * p.stride_x);
                                let s = if row_in && (inner || sx < p.src_w) {
                                    quad(src, row + sx * p.src_c + q * 4, p.src_c - q * 4)
                                } else if let Some(zero) = fill {
                                    zero
                                } else {
                                    continue;
                                };
                                sum[0] = L::madd4::<OVERFLOW>(sum[0], s, &w0);
                                if channels > f {
                                    sum[1] = L::madd4::<OVERFLOW>(sum[1], s, &w1);
                                }
                            }
                        }
                    }
                }
                save_tile::<L, A>(&sums[..m], &consts, channels, d_block, d_off + dx * f, dst);
                dx += m;
            }
        }
    }
}

/// 1×1 convolution: a pure channel reduction with no window to check.
pub(crate) fn input_convolution_1x1<L: Lanes, A: Activation, const OVERFLOW: bool>(
    src: &[u8],
    p: &ConvParam,
    a: &AlgParam,
    ma_c: usize,
    y_beg: usize,
    y_end: usize,
    t: &Tables<'_, i8>,
    dst: &mut [f32],
) {
    let (f, df) = (L::F, 2 * L::F);
    let quads = p.src_c.div_ceil(4);
    let tile = df * 4;
    let s_mask = a.buf_h[0].wrapping_sub(1);
    let s_row = p.src_w * p.src_c;
    let d_mask = a.buf_h[1] - 1;
    let d_row = p.dst_w * f;
    let d_block = a.buf_h[1] * d_row;

    for dc in (0..ma_c).step_by(df) {
        let channels = (ma_c - dc).min(df);
        let weight = &t.weight[dc * a.dw[0]..];
        let consts = TileConsts::<L>::new::<A, i8>(t, dc);
        let block = (dc / f) * d_block;
        for dy in y_beg..y_end {
            let row = (dy & s_mask) * s_row;
            let d_off = block + (dy & d_mask) * d_row;
            let mut dx = 0;
            while dx < p.dst_w {
                let m = (p.dst_w - dx).min(L::MICRO_W);
                let mut sums = [[L::isplat(0); 2]; MAX_MICRO];
                for q in 0..quads {
                    let wo = q * tile;
                    let w0 = L::weights4(&weight[wo..wo + f * 4]);
                    let w1 = L::weights4(&weight[wo + f * 4..wo + tile]);
                    let remain = p.src_c - q * 4;
                    for (i, sum) in sums[..m].iter_mut().enumerate() {
                        let s = quad(src, row + (dx + i) * p.src_c + q * 4, remain);
                        sum[0] = L::madd4::<OVERFLOW>(sum[0], s, &w0);
                        if channels > f {
                            sum[1] = L::madd4::<OVERFLOW>(sum[1], s, &w1);
                        }
                    }
                }
                save_tile::<L, A>(&sums[..m], &consts, channels, d_block, d_off + dx * f, dst);
                dx += m;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{expand_params, RestrictRange};
    use crate::merged::weights::{quantize_dense, reorder_input};
    use crate::param::{ActivationKind, Compatibility};
    use crate::quant::CvtParam;
    use crate::simd::{Avx2, Sse41};

    fn setup(p: &ConvParam, df: usize) -> (Vec<u8>, Vec<i8>, AlgParam, Vec<f32>, Vec<f32>, Vec<f32>) {
        let cvt = CvtParam::new(&vec![0.0; p.src_c], &vec![1.0; p.src_c], p.src_c, Compatibility::PRECISE).unwrap();
        let len = p.kernel_size() * p.src_c * p.dst_c;
        let weight: Vec<f32> = (0..len).map(|i| ((i * 29 % 23) as f32 - 11.0) / 11.0).collect();
        let q = quantize_dense(&weight, None, p, &cvt, false);
        let (packed, dw) = reorder_input(&q, p, df);
        let src: Vec<u8> = (0..p.src_size()).map(|i| (i * 53 % 251) as u8).collect();
        let a = AlgParam {
            f: df / 2,
            ma_c: p.dst_c.next_multiple_of(df),
            buf_h: [0, p.dst_h.next_power_of_two(), 0],
            dw: [dw, 0, 0],
            ..AlgParam::default()
        };
        let params = expand_params(ActivationKind::Identity, &[], p.dst_c).unwrap();
        (src, packed, a, q.norm, q.bias, params)
    }

    fn tables<'a>(w: &'a [i8], norm: &'a [f32], bias: &'a [f32], params: &'a [f32]) -> Tables<'a, i8> {
        Tables {
            weight: w,
            norm,
            bias,
            params,
            scale: &[],
            shift: &[],
            upper: 255,
            offset: 0,
        }
    }

    #[test]
    fn test_1x1_matches_generic() {
        let p = ConvParam::dense(6, 4, 13, 20);
        let (src, w, a, norm, bias, params) = setup(&p, 8);
        let t = tables(&w, &norm, &bias, &params);
        let ring = a.ma_c * a.buf_h[1] * p.dst_w;
        let mut generic = vec![0f32; ring];
        let mut special = vec![0f32; ring];
        input_convolution::<Sse41, RestrictRange, false>(&src, &p, &a, p.dst_c, 0, p.dst_h, &t, &mut generic);
        input_convolution_1x1::<Sse41, RestrictRange, false>(&src, &p, &a, p.dst_c, 0, p.dst_h, &t, &mut special);
        assert_eq!(generic, special);
    }

    #[test]
    fn test_ring_layout_holds_float_result() {
        let p = ConvParam::dense(3, 3, 4, 5).kernel(3, 3).pad(1, 1, 1, 1);
        let (src, w, a, norm, bias, params) = setup(&p, 16);
        let t = tables(&w, &norm, &bias, &params);
        let mut ring = vec![0f32; a.ma_c * a.buf_h[1] * p.dst_w];
        input_convolution::<Avx2, RestrictRange, false>(&src, &p, &a, p.dst_c, 0, p.dst_h, &t, &mut ring);
        let q = quantize_dense(
            &(0..p.kernel_size() * 15).map(|i| ((i * 29 % 23) as f32 - 11.0) / 11.0).collect::<Vec<_>>(),
            None,
            &p,
            &CvtParam::new(&[0.0; 3], &[1.0; 3], 3, Compatibility::PRECISE).unwrap(),
            false,
        );
        // pixel (1, 2), channel 4 through the plain formula
        let (y, x, d) = (1usize, 2usize, 4usize);
        let mut sum = 0i32;
        for ky in 0..3 {
            for kx in 0..3 {
                let (sy, sx) = (y + ky, x + kx);
                if sy < 1 || sx < 1 || sy > 3 || sx > 4 {
                    continue;
                }
                for c in 0..3 {
                    let s = src[((sy - 1) * 4 + sx - 1) * 3 + c];
                    sum += i32::from(s) * i32::from(q.weight[((ky * 3 + kx) * 3 + c) * 5 + d]);
                }
            }
        }
        let want = sum as f32 * q.norm[d] + q.bias[d];
        let got = ring[(y * p.dst_w + x) * 8 + d];
        assert!((got - want).abs() < 1e-5, "{} vs {}", got, want);
    }
}
