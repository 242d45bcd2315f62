//! Float accumulators for both directions, normalized once per pass.

use super::{accumulate, row_ranges, set_edge, sweep_left, sweep_right, to_u8, RbfParam};

/// Filters every row of `src` into `dst`.
///
/// `buf` holds two color rows, two factor rows and the range row.
pub(super) fn horizontal(p: &RbfParam, buf: &mut [f32], src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize) {
    let (w, ch, size) = (p.width, p.channels, p.row_size());
    let nofma = p.flags.fma_avoid();
    let kind = p.flags.diff_type();
    let (cb0, rest) = buf.split_at_mut(size);
    let (cb1, rest) = rest.split_at_mut(size);
    let (fb0, rest) = rest.split_at_mut(w);
    let (fb1, rest) = rest.split_at_mut(w);
    let rb = &mut rest[..w];
    for y in 0..p.height {
        let s = &src[y * src_stride..][..size];
        rb[0] = 0.0;
        row_ranges(p, kind, &s[..size - ch], &s[ch..], &mut rb[1..]);
        sweep_left(s, rb, p.alpha, ch, nofma, cb0, fb0);
        sweep_right(s, rb, p.alpha, ch, nofma, cb1, fb1);
        let d = &mut dst[y * dst_stride..][..size];
        for (o, v) in d.iter_mut().enumerate() {
            let x = o / ch;
            *v = to_u8((cb0[o] + cb1[o]) / (fb0[x] + fb1[x]));
        }
    }
}

/// Filters the columns of the horizontal result held in `dst`, in place.
///
/// Edge ranges come from the unfiltered `src`. The upward sweep keeps every
/// row, the downward sweep keeps one and combines as it goes.
pub(super) fn vertical(p: &RbfParam, buf: &mut [f32], src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize) {
    let (w, h, ch, size) = (p.width, p.height, p.channels, p.row_size());
    let nofma = p.flags.fma_avoid();
    let kind = p.flags.diff_type();
    let (rb, rest) = buf.split_at_mut(w);
    let (dcb, rest) = rest.split_at_mut(size);
    let (dfb, rest) = rest.split_at_mut(w);
    let (ucb, rest) = rest.split_at_mut(size * h);
    let ufb = &mut rest[..w * h];
    let src_row = |y: usize| &src[y * src_stride..][..size];

    set_edge(&dst[(h - 1) * dst_stride..][..size], &mut ufb[(h - 1) * w..], &mut ucb[(h - 1) * size..]);
    for y in (0..h - 1).rev() {
        row_ranges(p, kind, src_row(y), src_row(y + 1), rb);
        let (uc, uc_next) = ucb.split_at_mut((y + 1) * size);
        let (uf, uf_next) = ufb.split_at_mut((y + 1) * w);
        let (uc, uf) = (&mut uc[y * size..], &mut uf[y * w..]);
        uc.copy_from_slice(&uc_next[..size]);
        uf.copy_from_slice(&uf_next[..w]);
        accumulate(&dst[y * dst_stride..][..size], rb, p.alpha, ch, nofma, uc, uf);
    }

    for y in 0..h {
        let d = &mut dst[y * dst_stride..][..size];
        if y == 0 {
            set_edge(d, dfb, dcb);
        } else {
            row_ranges(p, kind, src_row(y), src_row(y - 1), rb);
            accumulate(d, rb, p.alpha, ch, nofma, dcb, dfb);
        }
        let (uc, uf) = (&ucb[y * size..][..size], &ufb[y * w..][..w]);
        for (o, v) in d.iter_mut().enumerate() {
            let x = o / ch;
            *v = to_u8((dcb[o] + uc[o]) / (dfb[x] + uf[x]));
        }
    }
}
