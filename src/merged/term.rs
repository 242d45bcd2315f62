//! Store formats shared by the three stages.

use crate::activation::Activation;
use crate::simd::Lanes;

/// Result of a stage that is complete: activation then store.
pub(crate) const SINGLE: u8 = 0;
/// First partial pass of the output stage: raw int32 sums.
pub(crate) const FIRST: u8 = 1;
/// Middle partial pass: sums added into the int32 buffer.
pub(crate) const INTERIM: u8 = 2;
/// Final pass: buffered sums added, then stored like [`SINGLE`].
pub(crate) const LAST: u8 = 3;

/// Destination of a stage call.
pub(crate) enum Out<'a> {
    U8(&'a mut [u8]),
    F32(&'a mut [f32]),
    /// Only the int32 partial buffer is written.
    Sum,
}

/// Per-channel tables a stage reads, plus the channel they start at.
///
/// `weight` is already positioned at the current channel block, while the
/// per-channel tables are indexed with `offset + channel`.
#[derive(Clone, Copy)]
pub(crate) struct Tables<'a, W> {
    pub weight: &'a [W],
    pub norm: &'a [f32],
    pub bias: &'a [f32],
    pub params: &'a [f32],
    pub scale: &'a [f32],
    pub shift: &'a [f32],
    pub upper: i32,
    pub offset: usize,
}

/// Loads up to `F` entries of a per-channel table starting at `channel`.
#[inline(always)]
pub(crate) fn load_table<L: Lanes>(table: &[f32], channel: usize) -> L::F32 {
    L::load_n(table.get(channel..).unwrap_or(&[]))
}

/// Final element type of a stage.
pub(crate) trait Element: Copy + Default + Send + Sync + 'static {
    fn rows<'a>(out: Out<'a>) -> &'a mut [Self];

    /// Activates `value` and writes `dst.len()` lanes (at most `F`).
    fn save<L: Lanes, A: Activation>(
        value: L::F32,
        params: &[L::F32; 2],
        scale: L::F32,
        shift: L::F32,
        upper: i32,
        dst: &mut [Self],
    );
}

impl Element for u8 {
    #[inline(always)]
    fn rows<'a>(out: Out<'a>) -> &'a mut [u8] {
        match out {
            Out::U8(dst) => dst,
            _ => {
                debug_assert!(false, "u8 stage bound to a non-u8 destination");
                &mut []
            }
        }
    }

    #[inline(always)]
    fn save<L: Lanes, A: Activation>(
        value: L::F32,
        params: &[L::F32; 2],
        scale: L::F32,
        shift: L::F32,
        upper: i32,
        dst: &mut [u8],
    ) {
        let activated = A::activate::<L>(value, params);
        let q = L::round(L::mul_add(activated, scale, shift));
        L::store_u8(L::imin(L::imax(q, L::isplat(0)), L::isplat(upper)), dst);
    }
}

impl Element for f32 {
    #[inline(always)]
    fn rows<'a>(out: Out<'a>) -> &'a mut [f32] {
        match out {
            Out::F32(dst) => dst,
            _ => {
                debug_assert!(false, "f32 stage bound to a non-f32 destination");
                &mut []
            }
        }
    }

    #[inline(always)]
    fn save<L: Lanes, A: Activation>(
        value: L::F32,
        params: &[L::F32; 2],
        _scale: L::F32,
        _shift: L::F32,
        _upper: i32,
        dst: &mut [f32],
    ) {
        L::store(A::activate::<L>(value, params), dst);
    }
}

/// Requantization constants for the two `F`-wide halves of a `2F` tile.
pub(crate) struct TileConsts<L: Lanes> {
    pub norm: [L::F32; 2],
    pub bias: [L::F32; 2],
    pub params: [[L::F32; 2]; 2],
}

impl<L: Lanes> TileConsts<L> {
    #[inline(always)]
    pub fn new<A: Activation, W>(t: &Tables<'_, W>, dc: usize) -> Self {
        let c = t.offset + dc;
        Self {
            norm: [load_table::<L>(t.norm, c), load_table::<L>(t.norm, c + L::F)],
            bias: [load_table::<L>(t.bias, c), load_table::<L>(t.bias, c + L::F)],
            params: [A::params::<L>(t.params, c), A::params::<L>(t.params, c + L::F)],
        }
    }

    /// `sum * norm + bias` for one half.
    #[inline(always)]
    pub fn dequantize(&self, sum: L::I32, half: usize) -> L::F32 {
        L::mul_add(L::to_f32(sum), self.norm[half], self.bias[half])
    }
}
