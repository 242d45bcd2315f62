//! Conversions between the caller's tensors and the stage ring buffers.

use crate::param::ConvParam;
use crate::quant::{dequantize_pixels, quantize_pixels, CvtParam};

/// Quantizes source rows `[y_beg, y_end)` into the u8 ring of the input
/// stage.
pub(crate) fn quantize_rows(
    src: &[f32],
    p: &ConvParam,
    cvt: &CvtParam,
    buf_h: usize,
    y_beg: usize,
    y_end: usize,
    dst: &mut [u8],
) {
    let row = p.src_w * p.src_c;
    let mask = buf_h - 1;
    for y in y_beg..y_end {
        let d = (y & mask) * row;
        quantize_pixels(
            &src[y * row..(y + 1) * row],
            &cvt.scale,
            &cvt.shift,
            cvt.u_min,
            cvt.u_max,
            &mut dst[d..d + row],
        );
    }
}

/// Dequantizes channels `[c, c + ma_c)` of u8 source rows into a float ring
/// laid out like the input stage output, `[c/F][row][x][F]`.
pub(crate) fn dequantize_rows(
    src: &[u8],
    p: &ConvParam,
    cvt: &CvtParam,
    f: usize,
    c: usize,
    ma_c: usize,
    buf_h: usize,
    y_beg: usize,
    y_end: usize,
    dst: &mut [f32],
) {
    let mask = buf_h - 1;
    let block = buf_h * p.src_w * f;
    let scale = &cvt.i_scale[c..c + ma_c];
    let shift = &cvt.i_shift[c..c + ma_c];
    let mut lanes = vec![0f32; ma_c];
    for y in y_beg..y_end {
        let ring = (y & mask) * p.src_w;
        for x in 0..p.src_w {
            let pix = (y * p.src_w + x) * p.src_c + c;
            dequantize_pixels(&src[pix..pix + ma_c], scale, shift, &mut lanes);
            for (i, &v) in lanes.iter().enumerate() {
                dst[(i / f) * block + (ring + x) * f + i % f] = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Compatibility;

    #[test]
    fn test_ring_wraps_rows() {
        let p = ConvParam::dense(2, 5, 3, 4);
        let cvt = CvtParam::new(&[0.0, 0.0], &[1.0, 1.0], 2, Compatibility::PRECISE).unwrap();
        let src: Vec<f32> = (0..p.src_size()).map(|i| (i % 2) as f32).collect();
        let mut ring = vec![9u8; 2 * 3 * 2];
        quantize_rows(&src, &p, &cvt, 2, 3, 5, &mut ring);
        // rows 3 and 4 land in slots 1 and 0
        assert_eq!(ring, [0, 255, 0, 255, 0, 255, 0, 255, 0, 255, 0, 255]);
    }

    #[test]
    fn test_dequantize_channel_blocks() {
        let p = ConvParam::depthwise(6, 2, 2);
        let cvt = CvtParam::new(&[0.0; 6], &[255.0; 6], 6, Compatibility::PRECISE).unwrap();
        let src: Vec<u8> = (0..p.src_size() as u8).collect();
        let mut ring = vec![0f32; 2 * 2 * 2 * 4];
        dequantize_rows(&src, &p, &cvt, 4, 0, 6, 2, 0, 2, &mut ring);
        // pixel (1, 1), channel 5 is block 1, lane 1
        let block = 2 * 2 * 4;
        assert_eq!(ring[block + 3 * 4 + 1], f32::from(src[3 * 6 + 5]));
        assert_eq!(ring[2 * 4 + 3], f32::from(src[2 * 6 + 3]));
    }
}
