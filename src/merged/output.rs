//! Output stage: 1×1 dense convolution of the u8 depthwise result into the
//! final tensor.
//!
//! When the source channels are split into several macro blocks the int32
//! sums are carried between calls in a partial buffer covering the whole
//! destination: [`FIRST`] stores them, [`INTERIM`] adds into them and [`LAST`]
//! adds them before dequantizing.

use super::input::{quad, MAX_MICRO};
use super::term::{load_table, Element, Out, Tables, TileConsts, FIRST, INTERIM, LAST};
use super::AlgParam;
use crate::activation::Activation;
use crate::param::ConvParam;
use crate::simd::Lanes;

pub(crate) type OutputFn = fn(
    src: &[u8],
    p: &ConvParam,
    a: &AlgParam,
    ma_c: usize,
    y_beg: usize,
    y_end: usize,
    t: &Tables<'_, i8>,
    sum: &mut [i32],
    dst: Out<'_>,
);

/// Weight layout inside one macro block: `[dst block][quad][2F][4]`, with
/// `a.ma_c / 4` quads per destination block.
pub(crate) fn output_convolution<L: Lanes, A: Activation, E: Element, const TERM: u8, const OVERFLOW: bool>(
    src: &[u8],
    p: &ConvParam,
    a: &AlgParam,
    ma_c: usize,
    y_beg: usize,
    y_end: usize,
    t: &Tables<'_, i8>,
    sum_buf: &mut [i32],
    dst: Out<'_>,
) {
    let dst: &mut [E] = match TERM {
        FIRST | INTERIM => &mut [],
        _ => E::rows(dst),
    };
    let (f, df) = (L::F, 2 * L::F);
    let quads = ma_c.div_ceil(4);
    let tile = df * 4;
    let d_block = a.ma_c * df;
    let s_row = p.src_w * a.ma_c;

    for dc in (0..p.dst_c).step_by(df) {
        let channels = (p.dst_c - dc).min(df);
        let weight = &t.weight[(dc / df) * d_block..];
        let consts = TileConsts::<L>::new::<A, i8>(t, dc);
        let scale = [load_table::<L>(t.scale, dc), load_table::<L>(t.scale, dc + f)];
        let shift = [load_table::<L>(t.shift, dc), load_table::<L>(t.shift, dc + f)];
        for dy in y_beg..y_end {
            let row = (dy - y_beg) * s_row;
            let mut dx = 0;
            while dx < p.dst_w {
                let m = (p.dst_w - dx).min(L::MICRO_W);
                let mut sums = [[L::isplat(0); 2]; MAX_MICRO];
                for q in 0..quads {
                    let wo = q * tile;
                    let w0 = L::weights4(&weight[wo..wo + f * 4]);
                    let w1 = L::weights4(&weight[wo + f * 4..wo + tile]);
                    let remain = ma_c - q * 4;
                    for (i, sum) in sums[..m].iter_mut().enumerate() {
                        let s = quad(src, row + (dx + i) * a.ma_c + q * 4, remain);
                        sum[0] = L::madd4::<OVERFLOW>(sum[0], s, &w0);
                        if channels > f {
                            sum[1] = L::madd4::<OVERFLOW>(sum[1], s, &w1);
                        }
                    }
                }
                for (i, sum) in sums[..m].iter().enumerate() {
                    let at = ((dy * p.dst_w) + dx + i) * p.dst_c + dc;
                    for half in 0..2 {
                        if half * f >= channels {
                            break;
                        }
                        let n = (channels - half * f).min(f);
                        let o = at + half * f;
                        let mut s = sum[half];
                        if TERM == INTERIM || TERM == LAST {
                            s = s + L::iload(&sum_buf[o..o + n]);
                        }
                        if TERM == FIRST || TERM == INTERIM {
                            L::istore(s, &mut sum_buf[o..o + n]);
                        } else {
                            E::save::<L, A>(
                                consts.dequantize(s, half),
                                &consts.params[half],
                                scale[half],
                                shift[half],
                                t.upper,
                                &mut dst[o..o + n],
                            );
                        }
                    }
                }
                dx += m;
            }
        }
    }
}
