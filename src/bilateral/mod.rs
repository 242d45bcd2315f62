//! Recursive bilateral filter for interleaved u8 images with 1 to 4 channels.
//!
//! Each pass runs a first-order recursive filter in both directions; the
//! feedback coefficient of every step is attenuated by the color distance of
//! the two neighbouring pixels, looked up in a 256-entry table. The
//! horizontal pass runs first, the vertical pass filters its result.
//!
//! Two variants exist. The precise one keeps float accumulators for both
//! directions and normalizes once. The fast one writes u8 after each
//! direction and averages the two directions.

mod fast;
mod precise;

use std::ops::BitOr;

use multiversion::multiversion;

use crate::error::{check_buffer, Error, Result};

/// Filter selection bitset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RbfFlags(u32);

impl RbfFlags {
    pub const FAST: Self = Self(0);
    pub const PRECISE: Self = Self(1);
    pub const DIFF_AVG: Self = Self(0);
    pub const DIFF_MAX: Self = Self(2);
    pub const DIFF_SUM: Self = Self(4);
    pub const FMA_AVOID: Self = Self(8);

    const MASK_DIFF: u32 = 6;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn precise(self) -> bool {
        self.0 & Self::PRECISE.0 != 0
    }

    pub const fn fma_avoid(self) -> bool {
        self.0 & Self::FMA_AVOID.0 != 0
    }

    pub const fn diff_type(self) -> DiffType {
        match self.0 & Self::MASK_DIFF {
            2 => DiffType::Max,
            4 | 6 => DiffType::Sum,
            _ => DiffType::Avg,
        }
    }
}

impl BitOr for RbfFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// How per-channel absolute differences combine into one color distance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DiffType {
    /// Rounded pairwise averages.
    #[default]
    Avg,
    Max,
    /// Saturating sum.
    Sum,
}

/// Geometry, sigmas and the derived filter coefficients.
#[derive(Clone, Debug, PartialEq)]
pub struct RbfParam {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub spatial: f32,
    pub range: f32,
    pub flags: RbfFlags,
    /// Row alignment of the internal image buffer, in bytes.
    pub align: usize,
    /// `1 - a` with `a = exp(-sqrt(2) / (spatial * 255))`.
    pub alpha: f32,
    /// `a * exp(-i / (range * 255))`.
    pub ranges: [f32; 256],
}

impl RbfParam {
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        spatial: f32,
        range: f32,
        flags: RbfFlags,
        align: usize,
    ) -> Self {
        let a = (-std::f32::consts::SQRT_2 / (spatial * 255.0)).exp();
        let r = 1.0 / (range * 255.0);
        let ranges = std::array::from_fn(|i| a * (-(i as f32) * r).exp());
        Self {
            width,
            height,
            channels,
            spatial,
            range,
            flags,
            align,
            alpha: 1.0 - a,
            ranges,
        }
    }

    pub fn valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && (1..=4).contains(&self.channels)
            && self.align >= std::mem::size_of::<f32>()
    }

    /// Bytes of one image row.
    pub fn row_size(&self) -> usize {
        self.width * self.channels
    }
}

/// Color distance of two pixels.
#[inline(always)]
pub(crate) fn diff(kind: DiffType, a: &[u8], b: &[u8]) -> u8 {
    let d = |c: usize| a[c].abs_diff(b[c]);
    let avg = |x: u8, y: u8| ((u16::from(x) + u16::from(y) + 1) >> 1) as u8;
    match (a.len(), kind) {
        (1, _) => d(0),
        (2, DiffType::Avg) => avg(d(0), d(1)),
        (2, DiffType::Max) => d(0).max(d(1)),
        (2, DiffType::Sum) => d(0).saturating_add(d(1)),
        (_, DiffType::Avg) => avg(d(1), avg(d(0), d(2))),
        (_, DiffType::Max) => d(0).max(d(1)).max(d(2)),
        (_, DiffType::Sum) => d(0).saturating_add(d(1)).saturating_add(d(2)),
    }
}

/// `dst[x] = ranges[diff(pixel x of a, pixel x of b)]`.
pub(crate) fn row_ranges(p: &RbfParam, kind: DiffType, a: &[u8], b: &[u8], dst: &mut [f32]) {
    let ch = p.channels;
    for ((d, pa), pb) in dst.iter_mut().zip(a.chunks_exact(ch)).zip(b.chunks_exact(ch)) {
        *d = p.ranges[usize::from(diff(kind, pa, pb))];
    }
}

#[inline(always)]
pub(crate) fn fmadd(nofma: bool, a: f32, b: f32, c: f32) -> f32 {
    if nofma {
        a * b + c
    } else {
        a.mul_add(b, c)
    }
}

/// Left to right recursion: `ranges[x]` links pixel `x - 1` to pixel `x`.
#[multiversion(targets("x86_64+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn sweep_left(
    src: &[u8],
    ranges: &[f32],
    alpha: f32,
    channels: usize,
    nofma: bool,
    colors: &mut [f32],
    factor: &mut [f32],
) {
    factor[0] = 1.0;
    for c in 0..channels {
        colors[c] = f32::from(src[c]);
    }
    for x in 1..factor.len() {
        let la = ranges[x];
        factor[x] = fmadd(nofma, la, factor[x - 1], alpha);
        for o in x * channels..(x + 1) * channels {
            colors[o] = fmadd(nofma, la, colors[o - channels], alpha * f32::from(src[o]));
        }
    }
}

/// Right to left recursion with the same `ranges` as [`sweep_left`].
#[multiversion(targets("x86_64+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn sweep_right(
    src: &[u8],
    ranges: &[f32],
    alpha: f32,
    channels: usize,
    nofma: bool,
    colors: &mut [f32],
    factor: &mut [f32],
) {
    let last = factor.len() - 1;
    factor[last] = 1.0;
    for o in last * channels..(last + 1) * channels {
        colors[o] = f32::from(src[o]);
    }
    for x in (0..last).rev() {
        let ra = ranges[x + 1];
        factor[x] = fmadd(nofma, ra, factor[x + 1], alpha);
        for o in x * channels..(x + 1) * channels {
            colors[o] = fmadd(nofma, ra, colors[o + channels], alpha * f32::from(src[o]));
        }
    }
}

/// One vertical recursion step, in place: the accumulator holds the
/// previous row and `ranges` links it to `src`.
#[multiversion(targets("x86_64+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn accumulate(
    src: &[u8],
    ranges: &[f32],
    alpha: f32,
    channels: usize,
    nofma: bool,
    colors: &mut [f32],
    factor: &mut [f32],
) {
    for (x, (f, &r)) in factor.iter_mut().zip(ranges).enumerate() {
        *f = fmadd(nofma, r, *f, alpha);
        for o in x * channels..(x + 1) * channels {
            colors[o] = fmadd(nofma, r, colors[o], alpha * f32::from(src[o]));
        }
    }
}

/// Rounds to nearest, not toward zero: a quotient one ulp below the input
/// must store the input back, or flat images drift down.
#[inline(always)]
fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Resets a vertical accumulator to an edge row.
pub(crate) fn set_edge(src: &[u8], factor: &mut [f32], colors: &mut [f32]) {
    factor.fill(1.0);
    for (c, &s) in colors.iter_mut().zip(src) {
        *c = f32::from(s);
    }
}

/// An edge-preserving smoothing filter with fixed geometry.
///
/// ```
/// use synet_simd::{RbfFlags, RecursiveBilateralFilter};
///
/// let (w, h) = (16, 8);
/// let src = vec![200u8; w * h * 3];
/// let mut dst = vec![0u8; w * h * 3];
/// let mut filter = RecursiveBilateralFilter::new(w, h, 3, 0.2, 0.1, RbfFlags::PRECISE)?;
/// filter.run(&src, w * 3, &mut dst, w * 3)?;
/// assert!(dst.iter().all(|&v| v == 200));
/// # Ok::<(), synet_simd::Error>(())
/// ```
pub struct RecursiveBilateralFilter {
    param: RbfParam,
    work: Vec<f32>,
    image: Vec<u8>,
    stride: usize,
}

impl RecursiveBilateralFilter {
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        sigma_spatial: f32,
        sigma_range: f32,
        flags: RbfFlags,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidImageSize { width, height });
        }
        if !(1..=4).contains(&channels) {
            return Err(Error::InvalidChannels(channels));
        }
        let sigma_ok = |s: f32| s.is_finite() && s > 0.0;
        if !sigma_ok(sigma_spatial) || !sigma_ok(sigma_range) {
            return Err(Error::InvalidSigma);
        }
        let param = RbfParam::new(width, height, channels, sigma_spatial, sigma_range, flags, 32);
        if !flags.precise() && flags.diff_type() != DiffType::Avg {
            log::warn!(
                "synet-simd: fast bilateral filter measures color distance with {:?}; it falls back to Avg",
                flags.diff_type()
            );
        }
        let size = param.row_size();
        let (work, image, stride) = if flags.precise() {
            let floats = height * width * (channels + 1) + width * (2 * channels + 3);
            (vec![0f32; floats], Vec::new(), 0)
        } else {
            let stride = size.next_multiple_of(param.align);
            (vec![0f32; fast::ROWS * (size + 2 * width)], vec![0u8; stride * height], stride)
        };
        log::debug!(
            "synet-simd: {} bilateral filter {}x{}x{}",
            if flags.precise() { "precise" } else { "fast" },
            width,
            height,
            channels
        );
        Ok(Self {
            param,
            work,
            image,
            stride,
        })
    }

    pub fn param(&self) -> &RbfParam {
        &self.param
    }

    /// Bytes of internal scratch the filter owns.
    pub fn buffer_size(&self) -> usize {
        self.work.len() * std::mem::size_of::<f32>() + self.image.len()
    }

    /// Filters `src` into `dst`. Strides are in bytes and may exceed the
    /// row size.
    pub fn run(&mut self, src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize) -> Result<()> {
        let p = &self.param;
        let size = p.row_size();
        if src_stride < size || dst_stride < size {
            return Err(Error::InvalidImageSize {
                width: p.width,
                height: p.height,
            });
        }
        let need = |stride: usize| (p.height - 1) * stride + size;
        check_buffer("src", src.len(), need(src_stride))?;
        check_buffer("dst", dst.len(), need(dst_stride))?;
        if p.flags.precise() {
            precise::horizontal(p, &mut self.work, src, src_stride, dst, dst_stride);
            precise::vertical(p, &mut self.work, src, src_stride, dst, dst_stride);
        } else {
            fast::horizontal(p, &mut self.work, src, src_stride, &mut self.image, self.stride);
            fast::vertical(p, &self.image, self.stride, dst, dst_stride);
        }
        Ok(())
    }
}
