//! Vector lane abstraction the convolution kernels are written against.
//!
//! Every kernel is one generic function over [`Lanes`]. The tier markers
//! ([`Sse41`], [`Avx2`], [`Avx512bw`], [`Avx512vnni`], [`Amx`]) fix the lane
//! count, the micro tile width and the int8 accumulation behaviour, and are
//! backed by the `wide` vector types.

pub mod dispatch;

pub use dispatch::{cpu_features, detect, CpuFeatures, KernelConfig, Tier};

use std::ops::{Add, Div, Mul, Sub};

use wide::{f32x16, f32x4, f32x8, i32x16, i32x4, i32x8};

/// One instruction-set tier seen as a bundle of vector operations.
pub trait Lanes: Copy + Send + Sync + 'static {
    const TIER: Tier;
    /// f32 lanes per vector.
    const F: usize;
    /// Output positions per micro tile.
    const MICRO_W: usize;
    /// int8 dot products never saturate, whatever the overflow policy says.
    const EXACT_DOT: bool;

    type F32: Copy
        + Add<Output = Self::F32>
        + Sub<Output = Self::F32>
        + Mul<Output = Self::F32>
        + Div<Output = Self::F32>;
    type I32: Copy + Add<Output = Self::I32> + Mul<Output = Self::I32>;

    fn splat(value: f32) -> Self::F32;
    /// Loads exactly `F` values.
    fn load(src: &[f32]) -> Self::F32;
    /// Loads up to `F` values, missing lanes are zero.
    fn load_n(src: &[f32]) -> Self::F32;
    /// Stores `min(F, dst.len())` lanes.
    fn store(value: Self::F32, dst: &mut [f32]);
    fn max(a: Self::F32, b: Self::F32) -> Self::F32;
    fn min(a: Self::F32, b: Self::F32) -> Self::F32;
    fn mul_add(a: Self::F32, b: Self::F32, c: Self::F32) -> Self::F32;
    /// Applies a scalar function lane by lane.
    fn map(value: Self::F32, f: impl Fn(f32) -> f32) -> Self::F32;

    fn isplat(value: i32) -> Self::I32;
    /// Loads up to `F` values, missing lanes are zero.
    fn iload(src: &[i32]) -> Self::I32;
    /// Stores `min(F, dst.len())` lanes.
    fn istore(value: Self::I32, dst: &mut [i32]);
    fn imax(a: Self::I32, b: Self::I32) -> Self::I32;
    fn imin(a: Self::I32, b: Self::I32) -> Self::I32;
    fn to_f32(value: Self::I32) -> Self::F32;
    /// Round to nearest, ties to even.
    fn round(value: Self::F32) -> Self::I32;
    /// Saturates to `u8` and stores `min(F, dst.len())` lanes.
    fn store_u8(value: Self::I32, dst: &mut [u8]);
    /// Splits `F` interleaved weight quads into one vector per quad position.
    fn weights4(weight: &[i8]) -> [Self::I32; 4];

    /// `a * b + c`, with the product rounded first when `NOFMA` is set.
    #[inline(always)]
    fn fmadd<const NOFMA: bool>(a: Self::F32, b: Self::F32, c: Self::F32) -> Self::F32 {
        if NOFMA {
            a * b + c
        } else {
            Self::mul_add(a, b, c)
        }
    }

    /// Accumulates the dot product of one source quad with `F` weight quads.
    ///
    /// With `OVERFLOW` the two pair sums saturate to 16 bits before they are
    /// added, as `maddubs` does.
    #[inline(always)]
    fn madd4<const OVERFLOW: bool>(sum: Self::I32, src: [u8; 4], weight: &[Self::I32; 4]) -> Self::I32 {
        let s0 = Self::isplat(i32::from(src[0]));
        let s1 = Self::isplat(i32::from(src[1]));
        let s2 = Self::isplat(i32::from(src[2]));
        let s3 = Self::isplat(i32::from(src[3]));
        if OVERFLOW && !Self::EXACT_DOT {
            let lo = Self::isplat(i32::from(i16::MIN));
            let hi = Self::isplat(i32::from(i16::MAX));
            let p0 = Self::imin(Self::imax(s0 * weight[0] + s1 * weight[1], lo), hi);
            let p1 = Self::imin(Self::imax(s2 * weight[2] + s3 * weight[3], lo), hi);
            sum + p0 + p1
        } else {
            sum + s0 * weight[0] + s1 * weight[1] + s2 * weight[2] + s3 * weight[3]
        }
    }
}

macro_rules! impl_lanes {
    ($tier:ident, $f32:ident, $i32:ident, $f:expr, $micro:expr, $exact:expr) => {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $tier;

        impl Lanes for $tier {
            const TIER: Tier = Tier::$tier;
            const F: usize = $f;
            const MICRO_W: usize = $micro;
            const EXACT_DOT: bool = $exact;

            type F32 = $f32;
            type I32 = $i32;

            #[inline(always)]
            fn splat(value: f32) -> $f32 {
                $f32::splat(value)
            }

            #[inline(always)]
            fn load(src: &[f32]) -> $f32 {
                let mut lanes = [0f32; $f];
                lanes.copy_from_slice(&src[..$f]);
                $f32::new(lanes)
            }

            #[inline(always)]
            fn load_n(src: &[f32]) -> $f32 {
                let n = src.len().min($f);
                let mut lanes = [0f32; $f];
                lanes[..n].copy_from_slice(&src[..n]);
                $f32::new(lanes)
            }

            #[inline(always)]
            fn store(value: $f32, dst: &mut [f32]) {
                let n = dst.len().min($f);
                dst[..n].copy_from_slice(&value.to_array()[..n]);
            }

            #[inline(always)]
            fn max(a: $f32, b: $f32) -> $f32 {
                a.max(b)
            }

            #[inline(always)]
            fn min(a: $f32, b: $f32) -> $f32 {
                a.min(b)
            }

            #[inline(always)]
            fn mul_add(a: $f32, b: $f32, c: $f32) -> $f32 {
                a.mul_add(b, c)
            }

            #[inline(always)]
            fn map(value: $f32, f: impl Fn(f32) -> f32) -> $f32 {
                let mut lanes = value.to_array();
                for lane in lanes.iter_mut() {
                    *lane = f(*lane);
                }
                $f32::new(lanes)
            }

            #[inline(always)]
            fn isplat(value: i32) -> $i32 {
                $i32::splat(value)
            }

            #[inline(always)]
            fn iload(src: &[i32]) -> $i32 {
                let n = src.len().min($f);
                let mut lanes = [0i32; $f];
                lanes[..n].copy_from_slice(&src[..n]);
                $i32::new(lanes)
            }

            #[inline(always)]
            fn istore(value: $i32, dst: &mut [i32]) {
                let n = dst.len().min($f);
                dst[..n].copy_from_slice(&value.to_array()[..n]);
            }

            #[inline(always)]
            fn imax(a: $i32, b: $i32) -> $i32 {
                a.max(b)
            }

            #[inline(always)]
            fn imin(a: $i32, b: $i32) -> $i32 {
                a.min(b)
            }

            #[inline(always)]
            fn to_f32(value: $i32) -> $f32 {
                value.round_float()
            }

            #[inline(always)]
            fn round(value: $f32) -> $i32 {
                value.round_int()
            }

            #[inline(always)]
            fn store_u8(value: $i32, dst: &mut [u8]) {
                for (d, s) in dst.iter_mut().zip(value.to_array()) {
                    *d = s.clamp(0, 255) as u8;
                }
            }

            #[inline(always)]
            fn weights4(weight: &[i8]) -> [$i32; 4] {
                let mut split = [[0i32; $f]; 4];
                for (lane, quad) in weight.chunks_exact(4).take($f).enumerate() {
                    for (k, &w) in quad.iter().enumerate() {
                        split[k][lane] = i32::from(w);
                    }
                }
                split.map($i32::new)
            }
        }
    };
}

impl_lanes!(Sse41, f32x4, i32x4, 4, 5, false);
impl_lanes!(Avx2, f32x8, i32x8, 8, 5, false);
impl_lanes!(Avx512bw, f32x16, i32x16, 16, 12, false);
impl_lanes!(Avx512vnni, f32x16, i32x16, 16, 12, true);
impl_lanes!(Amx, f32x16, i32x16, 16, 32, true);
