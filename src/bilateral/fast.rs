//! u8 intermediates: each direction is normalized on its own and the two
//! directions are averaged.
//!
//! The horizontal pass runs the recursion on 4 rows at once, one row per
//! lane. The vertical pass walks 8-pixel column strips top to bottom and
//! back, keeping the accumulators in registers.

use multiversion::multiversion;
use wide::{f32x4, f32x8};

use super::{diff, to_u8, DiffType, RbfParam};

/// Rows filtered together by the horizontal pass.
pub(super) const ROWS: usize = 4;
/// Pixels per column strip of the vertical pass.
const COLS: usize = 8;

#[inline(always)]
fn average(a: u8, b: u8) -> u8 {
    ((u16::from(a) + u16::from(b) + 1) >> 1) as u8
}

#[inline(always)]
fn fmadd4(nofma: bool, a: f32x4, b: f32x4, c: f32x4) -> f32x4 {
    if nofma {
        a * b + c
    } else {
        a.mul_add(b, c)
    }
}

#[inline(always)]
fn fmadd8(nofma: bool, a: f32x8, b: f32x8, c: f32x8) -> f32x8 {
    if nofma {
        a * b + c
    } else {
        a.mul_add(b, c)
    }
}

#[inline(always)]
fn load4(buf: &[f32], at: usize) -> f32x4 {
    f32x4::new([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline(always)]
fn store4(buf: &mut [f32], at: usize, value: f32x4) {
    buf[at..at + ROWS].copy_from_slice(&value.to_array());
}

/// Filters the rows of `src` into the aligned internal `image`.
///
/// `buf` holds the color, factor and range rows of one 4-row block,
/// interleaved by row.
pub(super) fn horizontal(p: &RbfParam, buf: &mut [f32], src: &[u8], src_stride: usize, image: &mut [u8], stride: usize) {
    let (w, h, ch, size) = (p.width, p.height, p.channels, p.row_size());
    let nofma = p.flags.fma_avoid();
    let (colors, rest) = buf.split_at_mut(size * ROWS);
    let (factor, rest) = rest.split_at_mut(w * ROWS);
    let ranges = &mut rest[..w * ROWS];
    for y0 in (0..h).step_by(ROWS) {
        let count = (h - y0).min(ROWS);
        // a short last block repeats its final row in the spare lanes
        let rows: [&[u8]; ROWS] = std::array::from_fn(|r| &src[(y0 + r.min(count - 1)) * src_stride..][..size]);
        for (r, row) in rows.iter().enumerate() {
            ranges[r] = 0.0;
            for x in 1..w {
                let d = diff(DiffType::Avg, &row[(x - 1) * ch..x * ch], &row[x * ch..(x + 1) * ch]);
                ranges[x * ROWS + r] = p.ranges[usize::from(d)];
            }
        }
        let out = &mut image[y0 * stride..];
        filter_rows(rows, ranges, p.alpha, ch, nofma, colors, factor, out, stride, count);
    }
}

/// Left then right recursion over one block of rows.
#[multiversion(targets("x86_64+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
fn filter_rows(
    rows: [&[u8]; ROWS],
    ranges: &[f32],
    alpha: f32,
    channels: usize,
    nofma: bool,
    colors: &mut [f32],
    factor: &mut [f32],
    out: &mut [u8],
    stride: usize,
    count: usize,
) {
    let ch = channels;
    let w = factor.len() / ROWS;
    let alpha = f32x4::splat(alpha);
    let one = f32x4::splat(1.0);
    let pixel = |o: usize| f32x4::new(std::array::from_fn(|r| f32::from(rows[r][o])));

    store4(factor, 0, one);
    for o in 0..ch {
        store4(colors, o * ROWS, pixel(o));
    }
    for x in 1..w {
        let la = load4(ranges, x * ROWS);
        store4(factor, x * ROWS, fmadd4(nofma, la, load4(factor, (x - 1) * ROWS), alpha));
        for o in x * ch..(x + 1) * ch {
            let prev = load4(colors, (o - ch) * ROWS);
            store4(colors, o * ROWS, fmadd4(nofma, la, prev, alpha * pixel(o)));
        }
    }
    store_rows(colors, factor, ch, out, stride, count, false);

    let last = w - 1;
    store4(factor, last * ROWS, one);
    for o in last * ch..w * ch {
        store4(colors, o * ROWS, pixel(o));
    }
    for x in (0..last).rev() {
        let ra = load4(ranges, (x + 1) * ROWS);
        store4(factor, x * ROWS, fmadd4(nofma, ra, load4(factor, (x + 1) * ROWS), alpha));
        for o in x * ch..(x + 1) * ch {
            let next = load4(colors, (o + ch) * ROWS);
            store4(colors, o * ROWS, fmadd4(nofma, ra, next, alpha * pixel(o)));
        }
    }
    store_rows(colors, factor, ch, out, stride, count, true);
}

/// Writes `round(colors / factor)` for the first `count` lanes, averaged
/// with what is already there when `blend` is set.
#[inline(always)]
fn store_rows(colors: &[f32], factor: &[f32], channels: usize, out: &mut [u8], stride: usize, count: usize, blend: bool) {
    let size = factor.len() / ROWS * channels;
    for o in 0..size {
        let q = (load4(colors, o * ROWS) / load4(factor, o / channels * ROWS)).to_array();
        for (r, &v) in q.iter().enumerate().take(count) {
            let d = &mut out[r * stride + o];
            *d = if blend { average(*d, to_u8(v)) } else { to_u8(v) };
        }
    }
}

/// Filters the columns of `image` into `dst`. Edge ranges come from the
/// horizontal result.
pub(super) fn vertical(p: &RbfParam, image: &[u8], stride: usize, dst: &mut [u8], dst_stride: usize) {
    let nofma = p.flags.fma_avoid();
    for x0 in (0..p.width).step_by(COLS) {
        let count = (p.width - x0).min(COLS);
        let strip = Strip {
            x0,
            count,
            channels: p.channels,
            height: p.height,
        };
        filter_strip(&p.ranges, p.alpha, nofma, strip, image, stride, dst, dst_stride);
    }
}

#[derive(Clone, Copy)]
struct Strip {
    x0: usize,
    count: usize,
    channels: usize,
    height: usize,
}

/// Top-down recursion into `dst`, then bottom-up recursion averaged into it.
#[multiversion(targets("x86_64+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
fn filter_strip(
    table: &[f32; 256],
    alpha: f32,
    nofma: bool,
    strip: Strip,
    image: &[u8],
    stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
) {
    let Strip {
        x0,
        count,
        channels: ch,
        height: h,
    } = strip;
    let alpha = f32x8::splat(alpha);
    let one = f32x8::splat(1.0);
    let at = |y: usize, i: usize| y * stride + (x0 + i) * ch;
    // spare lanes of a short strip see black pixels and are never stored
    let lanes = |y: usize, c: usize| {
        f32x8::new(std::array::from_fn(|i| if i < count { f32::from(image[at(y, i) + c]) } else { 0.0 }))
    };
    let link = |a: usize, b: usize| {
        f32x8::new(std::array::from_fn(|i| {
            if i < count {
                let d = diff(DiffType::Avg, &image[at(a, i)..][..ch], &image[at(b, i)..][..ch]);
                table[usize::from(d)]
            } else {
                table[0]
            }
        }))
    };
    let store = |y: usize, colors: &[f32x8; 4], factor: f32x8, blend: bool, dst: &mut [u8]| {
        for (c, color) in colors.iter().enumerate().take(ch) {
            let q = (*color / factor).to_array();
            for (i, &v) in q.iter().enumerate().take(count) {
                let d = &mut dst[y * dst_stride + (x0 + i) * ch + c];
                *d = if blend { average(*d, to_u8(v)) } else { to_u8(v) };
            }
        }
    };

    let mut colors = [f32x8::ZERO; 4];
    let mut factor = one;
    for (c, color) in colors.iter_mut().enumerate().take(ch) {
        *color = lanes(0, c);
    }
    store(0, &colors, factor, false, &mut *dst);
    for y in 1..h {
        let r = link(y, y - 1);
        factor = fmadd8(nofma, r, factor, alpha);
        for (c, color) in colors.iter_mut().enumerate().take(ch) {
            *color = fmadd8(nofma, r, *color, alpha * lanes(y, c));
        }
        store(y, &colors, factor, false, &mut *dst);
    }

    factor = one;
    for (c, color) in colors.iter_mut().enumerate().take(ch) {
        *color = lanes(h - 1, c);
    }
    store(h - 1, &colors, factor, true, &mut *dst);
    for y in (0..h - 1).rev() {
        let r = link(y, y + 1);
        factor = fmadd8(nofma, r, factor, alpha);
        for (c, color) in colors.iter_mut().enumerate().take(ch) {
            *color = fmadd8(nofma, r, *color, alpha * lanes(y, c));
        }
        store(y, &colors, factor, true, &mut *dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bilateral::RbfFlags;

    /// One row or column at a time, scalar.
    fn row_by_row(p: &RbfParam, src: &[u8]) -> Vec<u8> {
        let (w, h, ch) = (p.width, p.height, p.channels);
        let nofma = p.flags.fma_avoid();
        let fma = |a: f32, b: f32, c: f32| if nofma { a * b + c } else { a.mul_add(b, c) };
        let mut hor = vec![0u8; w * h * ch];
        let (mut colors, mut factor) = (vec![0f32; w * ch], vec![0f32; w]);
        for y in 0..h {
            let s = &src[y * w * ch..][..w * ch];
            let d = &mut hor[y * w * ch..][..w * ch];
            let link = |x: usize| p.ranges[usize::from(diff(DiffType::Avg, &s[(x - 1) * ch..x * ch], &s[x * ch..(x + 1) * ch]))];
            factor[0] = 1.0;
            colors[..ch].iter_mut().zip(s).for_each(|(c, &v)| *c = f32::from(v));
            for x in 1..w {
                factor[x] = fma(link(x), factor[x - 1], p.alpha);
                for o in x * ch..(x + 1) * ch {
                    colors[o] = fma(link(x), colors[o - ch], p.alpha * f32::from(s[o]));
                }
            }
            for o in 0..w * ch {
                d[o] = to_u8(colors[o] / factor[o / ch]);
            }
            factor[w - 1] = 1.0;
            for o in (w - 1) * ch..w * ch {
                colors[o] = f32::from(s[o]);
            }
            for x in (0..w - 1).rev() {
                factor[x] = fma(link(x + 1), factor[x + 1], p.alpha);
                for o in x * ch..(x + 1) * ch {
                    colors[o] = fma(link(x + 1), colors[o + ch], p.alpha * f32::from(s[o]));
                }
            }
            for o in 0..w * ch {
                d[o] = average(d[o], to_u8(colors[o] / factor[o / ch]));
            }
        }
        let mut dst = vec![0u8; w * h * ch];
        let row = |y: usize| &hor[y * w * ch..][..w * ch];
        for x in 0..w {
            let px = |y: usize| &row(y)[x * ch..(x + 1) * ch];
            let mut f = 1f32;
            let mut c: Vec<f32> = px(0).iter().map(|&v| f32::from(v)).collect();
            dst[x * ch..(x + 1) * ch].copy_from_slice(px(0));
            for y in 1..h {
                let r = p.ranges[usize::from(diff(DiffType::Avg, px(y), px(y - 1)))];
                f = fma(r, f, p.alpha);
                for k in 0..ch {
                    c[k] = fma(r, c[k], p.alpha * f32::from(px(y)[k]));
                    dst[(y * w + x) * ch + k] = to_u8(c[k] / f);
                }
            }
            f = 1.0;
            c = px(h - 1).iter().map(|&v| f32::from(v)).collect();
            for y in (0..h).rev() {
                if y < h - 1 {
                    let r = p.ranges[usize::from(diff(DiffType::Avg, px(y), px(y + 1)))];
                    f = fma(r, f, p.alpha);
                    for k in 0..ch {
                        c[k] = fma(r, c[k], p.alpha * f32::from(px(y)[k]));
                    }
                }
                for k in 0..ch {
                    let d = &mut dst[(y * w + x) * ch + k];
                    *d = average(*d, to_u8(c[k] / f));
                }
            }
        }
        dst
    }

    fn blocked(p: &RbfParam, src: &[u8]) -> Vec<u8> {
        let size = p.row_size();
        let stride = size.next_multiple_of(p.align);
        let mut buf = vec![0f32; ROWS * (size + 2 * p.width)];
        let mut image = vec![0u8; stride * p.height];
        let mut dst = vec![0u8; size * p.height];
        horizontal(p, &mut buf, src, size, &mut image, stride);
        vertical(p, &image, stride, &mut dst, size);
        dst
    }

    #[test]
    fn test_blocked_matches_row_by_row() {
        // heights and widths off the 4-row and 8-column blocks
        for (w, h, ch) in [(11, 7, 3), (8, 4, 1), (3, 9, 4), (17, 5, 2), (1, 1, 3)] {
            let src: Vec<u8> = (0..w * h * ch).map(|i| ((i * 37 + i / 7 * 11) % 256) as u8).collect();
            let p = RbfParam::new(w, h, ch, 0.3, 0.2, RbfFlags::FAST | RbfFlags::FMA_AVOID, 32);
            assert_eq!(blocked(&p, &src), row_by_row(&p, &src), "{}x{}x{}", w, h, ch);
        }
    }
}
