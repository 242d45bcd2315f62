//! Depthwise stage: one float filter per channel, fused bias, activation and
//! optional requantization to u8.
//!
//! The source is either the float ring buffer written by the input stage
//! (`buf_h[1] > 0`, layout `[channel block][row][x][F]`) or a raw NHWC float
//! tensor. The destination is either the u8 buffer of the output stage
//! (`buf_h[2] > 0`, rows relative to `y_beg`, pixel stride `ma_c`) or the
//! final NHWC tensor.

use super::term::{load_table, Element, Out, Tables};
use super::AlgParam;
use crate::activation::Activation;
use crate::param::ConvParam;
use crate::simd::Lanes;

pub(crate) type DepthwiseFn = fn(
    src: &[f32],
    p: &ConvParam,
    a: &AlgParam,
    ma_c: usize,
    y_beg: usize,
    y_end: usize,
    t: &Tables<'_, f32>,
    dst: Out<'_>,
);

#[derive(Clone, Copy)]
struct SrcLayout {
    x: usize,
    y: usize,
    block: usize,
    mask: usize,
}

impl SrcLayout {
    fn new(p: &ConvParam, a: &AlgParam, f: usize) -> Self {
        if a.buf_h[1] > 0 {
            Self {
                x: f,
                y: p.src_w * f,
                block: a.buf_h[1] * p.src_w * f,
                mask: a.buf_h[1] - 1,
            }
        } else {
            Self {
                x: p.src_c,
                y: p.src_w * p.src_c,
                block: f,
                mask: usize::MAX,
            }
        }
    }
}

/// Pixel stride and first row of the destination.
fn dst_layout(p: &ConvParam, a: &AlgParam, y_beg: usize) -> (usize, usize) {
    if a.buf_h[2] > 0 {
        (a.ma_c, y_beg)
    } else {
        (p.dst_c, 0)
    }
}

#[inline(always)]
fn load_src<L: Lanes>(src: &[f32], offset: usize) -> L::F32 {
    L::load_n(&src[offset..])
}

struct Channel<L: Lanes> {
    bias: L::F32,
    params: [L::F32; 2],
    scale: L::F32,
    shift: L::F32,
}

impl<L: Lanes> Channel<L> {
    #[inline(always)]
    fn new<A: Activation>(t: &Tables<'_, f32>, c: usize) -> Self {
        let ch = t.offset + c;
        Self {
            bias: load_table::<L>(t.bias, ch),
            params: A::params::<L>(t.params, ch),
            scale: load_table::<L>(t.scale, ch),
            shift: load_table::<L>(t.shift, ch),
        }
    }

    #[inline(always)]
    fn save<A: Activation, E: Element>(&self, sum: L::F32, upper: i32, dst: &mut [E]) {
        E::save::<L, A>(sum, &self.params, self.scale, self.shift, upper, dst);
    }
}

/// Any kernel size, stride and dilation.
///
/// Interior pixels go in batches of 8/4/2/1 columns that share each weight
/// load; border pixels check every tap.
pub(crate) fn depthwise_convolution<L: Lanes, A: Activation, E: Element, const NOFMA: bool>(
    src: &[f32],
    p: &ConvParam,
    a: &AlgParam,
    ma_c: usize,
    y_beg: usize,
    y_end: usize,
    t: &Tables<'_, f32>,
    dst: Out<'_>,
) {
    let dst = E::rows(dst);
    let f = L::F;
    let s = SrcLayout::new(p, a, f);
    let (d_x, dy0) = dst_layout(p, a, y_beg);
    let d_y = p.dst_w * d_x;
    let kernel = p.kernel_size();
    let (nose_h, body_h) = (p.nose_h(), p.body_h());
    let (nose_w, body_w) = (p.nose_w(), p.body_w());

    for c in (0..ma_c).step_by(f) {
        let n = (ma_c - c).min(f);
        let weight = &t.weight[c * kernel..];
        let ch = Channel::<L>::new::<A>(t, c);
        let base = (c / f) * s.block;
        for dy in y_beg..y_end {
            let sy0 = (dy * p.stride_y).wrapping_sub(p.pad_y);
            let d_row = (dy - dy0) * d_y + c;
            let rows_in = dy >= nose_h && dy < body_h;
            let mut dx = 0;
            while dx < p.dst_w {
                if rows_in && dx >= nose_w && dx < body_w {
                    let step = match body_w - dx {
                        8.. => 8,
                        4..=7 => 4,
                        2..=3 => 2,
                        _ => 1,
                    };
                    match step {
                        8 => body::<L, A, E, NOFMA, 8>(src, p, s, base, sy0, dx, weight, &ch, t.upper, d_row, d_x, n, dst),
                        4 => body::<L, A, E, NOFMA, 4>(src, p, s, base, sy0, dx, weight, &ch, t.upper, d_row, d_x, n, dst),
                        2 => body::<L, A, E, NOFMA, 2>(src, p, s, base, sy0, dx, weight, &ch, t.upper, d_row, d_x, n, dst),
                        _ => body::<L, A, E, NOFMA, 1>(src, p, s, base, sy0, dx, weight, &ch, t.upper, d_row, d_x, n, dst),
                    }
                    dx += step;
                } else {
                    let mut sum = ch.bias;
                    let sx0 = (dx * p.stride_x).wrapping_sub(p.pad_x);
                    for ky in 0..p.kernel_y {
                        let sy = sy0.wrapping_add(ky * p.dilation_y);
                        if sy >= p.src_h {
                            continue;
                        }
                        let row = base + (sy & s.mask) * s.y;
                        for kx in 0..p.kernel_x {
                            let sx = sx0.wrapping_add(kx * p.dilation_x);
                            if sx >= p.src_w {
                                continue;
                            }
                            let w = L::load(&weight[(ky * p.kernel_x + kx) * f..]);
                            sum = L::fmadd::<NOFMA>(load_src::<L>(src, row + sx * s.x), w, sum);
                        }
                    }
                    let at = d_row + dx * d_x;
                    ch.save::<A, E>(sum, t.upper, &mut dst[at..at + n]);
                    dx += 1;
                }
            }
        }
    }
}

#[inline(always)]
fn body<L: Lanes, A: Activation, E: Element, const NOFMA: bool, const B: usize>(
    src: &[f32],
    p: &ConvParam,
    s: SrcLayout,
    base: usize,
    sy0: usize,
    dx: usize,
    weight: &[f32],
    ch: &Channel<L>,
    upper: i32,
    d_row: usize,
    d_x: usize,
    n: usize,
    dst: &mut [E],
) {
    let f = L::F;
    let mut sums = [ch.bias; B];
    let sx0 = dx * p.stride_x - p.pad_x;
    for ky in 0..p.kernel_y {
        let row = base + ((sy0 + ky * p.dilation_y) & s.mask) * s.y;
        for kx in 0..p.kernel_x {
            let w = L::load(&weight[(ky * p.kernel_x + kx) * f..]);
            let col = row + (sx0 + kx * p.dilation_x) * s.x;
            for (i, sum) in sums.iter_mut().enumerate() {
                let v = load_src::<L>(src, col + i * p.stride_x * s.x);
                *sum = L::fmadd::<NOFMA>(v, w, *sum);
            }
        }
    }
    for (i, sum) in sums.into_iter().enumerate() {
        let at = d_row + (dx + i) * d_x;
        ch.save::<A, E>(sum, upper, &mut dst[at..at + n]);
    }
}

/// Sum of one 3×3 window; `None` rows or columns are outside the image.
///
/// With `NOFMA` the taps are chained in row-major order, matching the
/// generic kernel bit for bit. Otherwise the middle row gets its own
/// accumulator.
#[inline(always)]
fn window3x3<L: Lanes, const NOFMA: bool>(
    src: &[f32],
    rows: &[Option<usize>; 3],
    cols: &[Option<usize>; 3],
    weight: &[L::F32; 9],
    bias: L::F32,
) -> L::F32 {
    if NOFMA {
        let mut sum = bias;
        for (ky, row) in rows.iter().enumerate() {
            let Some(row) = row else { continue };
            for (kx, col) in cols.iter().enumerate() {
                if let Some(col) = col {
                    sum = L::fmadd::<true>(load_src::<L>(src, row + col), weight[ky * 3 + kx], sum);
                }
            }
        }
        sum
    } else {
        let mut outer = bias;
        let mut middle = L::splat(0.0);
        for (ky, row) in rows.iter().enumerate() {
            let Some(row) = row else { continue };
            for (kx, col) in cols.iter().enumerate() {
                if let Some(col) = col {
                    let v = load_src::<L>(src, row + col);
                    if ky == 1 {
                        middle = L::fmadd::<false>(v, weight[ky * 3 + kx], middle);
                    } else {
                        outer = L::fmadd::<false>(v, weight[ky * 3 + kx], outer);
                    }
                }
            }
        }
        outer + middle
    }
}

/// 3×3, dilation 1, any stride and padding, channel count a multiple of `F`.
///
/// The nine weight vectors stay in registers for a whole channel block and
/// interior columns skip all bounds checks.
pub(crate) fn depthwise_convolution_3x3<L: Lanes, A: Activation, E: Element, const NOFMA: bool>(
    src: &[f32],
    p: &ConvParam,
    a: &AlgParam,
    ma_c: usize,
    y_beg: usize,
    y_end: usize,
    t: &Tables<'_, f32>,
    dst: Out<'_>,
) {
    let dst = E::rows(dst);
    let f = L::F;
    let s = SrcLayout::new(p, a, f);
    let (d_x, dy0) = dst_layout(p, a, y_beg);
    let d_y = p.dst_w * d_x;
    let (nose_w, body_w) = (p.nose_w(), p.body_w());

    for c in (0..ma_c).step_by(f) {
        let n = (ma_c - c).min(f);
        let block = &t.weight[c * 9..];
        let weight: [L::F32; 9] = std::array::from_fn(|i| L::load(&block[i * f..]));
        let ch = Channel::<L>::new::<A>(t, c);
        let base = (c / f) * s.block;
        for dy in y_beg..y_end {
            let sy0 = (dy * p.stride_y).wrapping_sub(p.pad_y);
            let rows: [Option<usize>; 3] = std::array::from_fn(|ky| {
                let sy = sy0.wrapping_add(ky);
                (sy < p.src_h).then(|| base + (sy & s.mask) * s.y)
            });
            let d_row = (dy - dy0) * d_y + c;
            let edge_col = |dx: usize| -> [Option<usize>; 3] {
                let sx0 = (dx * p.stride_x).wrapping_sub(p.pad_x);
                std::array::from_fn(|kx| {
                    let sx = sx0.wrapping_add(kx);
                    (sx < p.src_w).then(|| sx * s.x)
                })
            };
            for dx in 0..nose_w {
                let sum = window3x3::<L, NOFMA>(src, &rows, &edge_col(dx), &weight, ch.bias);
                let at = d_row + dx * d_x;
                ch.save::<A, E>(sum, t.upper, &mut dst[at..at + n]);
            }
            for dx in nose_w..body_w {
                let sx = dx * p.stride_x - p.pad_x;
                let cols = [Some(sx * s.x), Some((sx + 1) * s.x), Some((sx + 2) * s.x)];
                let sum = window3x3::<L, NOFMA>(src, &rows, &cols, &weight, ch.bias);
                let at = d_row + dx * d_x;
                ch.save::<A, E>(sum, t.upper, &mut dst[at..at + n]);
            }
            for dx in body_w.max(nose_w)..p.dst_w {
                let sum = window3x3::<L, NOFMA>(src, &rows, &edge_col(dx), &weight, ch.bias);
                let at = d_row + dx * d_x;
                ch.save::<A, E>(sum, t.upper, &mut dst[at..at + n]);
            }
        }
    }
}
