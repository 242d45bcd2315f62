//! Weight quantization and reordering, run once per `set_params`.

use crate::param::ConvParam;
use crate::quant::CvtParam;

/// A dense convolution with int8 weights in source order `[k][c][d]` and the
/// float tables that turn its int32 sums back into floats:
/// `y = sum * norm[d] + bias[d]`.
#[derive(Clone, Debug, Default)]
pub(crate) struct QuantizedDense {
    pub weight: Vec<i8>,
    pub norm: Vec<f32>,
    pub bias: Vec<f32>,
    /// Weights were halved to keep 16-bit pair sums in range.
    pub halved: bool,
}

/// Quantizes float weights `[k][c][d]` against the source conversion `cvt`.
///
/// Each output channel gets its own scale so that its largest weight maps to
/// `cvt.i_max`. The source shift is folded into the bias.
pub(crate) fn quantize_dense(
    weight: &[f32],
    bias: Option<&[f32]>,
    p: &ConvParam,
    cvt: &CvtParam,
    overflow: bool,
) -> QuantizedDense {
    let (kc, d_count) = (p.kernel_size() * p.src_c, p.dst_c);
    let halved = cvt.neg && overflow;
    let mut out = QuantizedDense {
        weight: vec![0; kc * d_count],
        norm: vec![0.0; d_count],
        bias: vec![0.0; d_count],
        halved,
    };
    let mut norm_w = vec![0f32; kc];
    for d in 0..d_count {
        let mut max = 0f32;
        for (i, w) in norm_w.iter_mut().enumerate() {
            *w = weight[i * d_count + d] / cvt.scale[i % p.src_c];
            max = max.max(w.abs());
        }
        let scale = if max > 0.0 { cvt.i_max as f32 / max } else { 1.0 };
        let mut shift_sum = 0f32;
        for (i, &w) in norm_w.iter().enumerate() {
            let mut q = ((w * scale).round_ties_even() as i32).clamp(cvt.i_min, cvt.i_max);
            if halved {
                if q & 1 != 0 {
                    q = (q as f32 * 0.25).round_ties_even() as i32 * 4;
                }
                q /= 2;
            }
            shift_sum += q as f32 * cvt.shift[i % p.src_c];
            out.weight[i * d_count + d] = q as i8;
        }
        let norm = if halved { 2.0 } else { 1.0 } / scale;
        out.norm[d] = norm;
        out.bias[d] = bias.map_or(0.0, |b| b[d]) - shift_sum * norm;
    }
    out
}

/// Input stage layout: per `2F` output block `[k][c/4][2F][4]`, zero padded
/// in both channel directions. Returns the weights and the per-channel
/// stride `dw[0]`.
pub(crate) fn reorder_input(q: &QuantizedDense, p: &ConvParam, df: usize) -> (Vec<i8>, usize) {
    let kernel = p.kernel_size();
    let quads = p.src_c.div_ceil(4);
    let dw = kernel * quads * 4;
    let blocks = p.dst_c.div_ceil(df);
    let mut dst = vec![0i8; blocks * df * dw];
    let mut o = 0;
    for block in 0..blocks {
        for k in 0..kernel {
            for quad in 0..quads {
                for lane in 0..df {
                    for i in 0..4 {
                        let (c, d) = (quad * 4 + i, block * df + lane);
                        if c < p.src_c && d < p.dst_c {
                            dst[o] = q.weight[(k * p.src_c + c) * p.dst_c + d];
                        }
                        o += 1;
                    }
                }
            }
        }
    }
    (dst, dw)
}

/// Output stage layout: per macro block of `ma_c` source channels, per `2F`
/// output block `[c/4][2F][4]`. Returns the weights and `dw[2]`, the
/// distance between macro blocks per source channel.
pub(crate) fn reorder_output(q: &QuantizedDense, p: &ConvParam, df: usize, ma_c: usize) -> (Vec<i8>, usize) {
    let dw = p.dst_c.div_ceil(df) * df;
    let chunks = p.src_c.div_ceil(ma_c);
    let blocks = p.dst_c.div_ceil(df);
    let mut dst = vec![0i8; chunks * ma_c * dw];
    let mut o = 0;
    for chunk in 0..chunks {
        for block in 0..blocks {
            for quad in 0..ma_c / 4 {
                for lane in 0..df {
                    for i in 0..4 {
                        let (c, d) = (chunk * ma_c + quad * 4 + i, block * df + lane);
                        if c < p.src_c && d < p.dst_c {
                            dst[o] = q.weight[c * p.dst_c + d];
                        }
                        o += 1;
                    }
                }
            }
        }
    }
    (dst, dw)
}

/// Depthwise layout `[c/F][k][F]`, zero padded to whole blocks.
pub(crate) fn reorder_depthwise(weight: &[f32], p: &ConvParam, f: usize) -> Vec<f32> {
    let kernel = p.kernel_size();
    let blocks = p.src_c.div_ceil(f);
    let mut dst = vec![0f32; blocks * kernel * f];
    for block in 0..blocks {
        for k in 0..kernel {
            for lane in 0..f {
                let c = block * f + lane;
                if c < p.src_c {
                    dst[(block * kernel + k) * f + lane] = weight[k * p.src_c + c];
                }
            }
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Compatibility;

    #[test]
    fn test_quantized_dot_matches_float() {
        let p = ConvParam::dense(3, 1, 1, 2);
        let cvt = CvtParam::new(&[-1.0; 3], &[1.0; 3], 3, Compatibility::PRECISE).unwrap();
        let weight = [0.5, -0.25, 1.0, 0.75, -2.0, 0.1];
        let bias = [0.3, -0.2];
        let q = quantize_dense(&weight, Some(&bias), &p, &cvt, false);
        let x = [0.2f32, -0.9, 0.6];
        let u: Vec<u8> = x.iter().enumerate().map(|(c, &v)| cvt.quantize(v, c)).collect();
        for d in 0..2 {
            let sum: i32 = (0..3).map(|c| i32::from(u[c]) * i32::from(q.weight[c * 2 + d])).sum();
            let got = sum as f32 * q.norm[d] + q.bias[d];
            let want: f32 = bias[d] + (0..3).map(|c| x[c] * weight[c * 2 + d]).sum::<f32>();
            assert!((got - want).abs() < 0.05, "channel {}: {} vs {}", d, got, want);
        }
    }

    #[test]
    fn test_overflow_halves_signed_weights() {
        let p = ConvParam::dense(1, 1, 1, 1);
        let cvt = CvtParam::new(&[-1.0], &[1.0], 1, Compatibility::OVERFLOW).unwrap();
        let q = quantize_dense(&[1.0], None, &p, &cvt, true);
        assert!(q.halved);
        assert_eq!(q.weight, [64]);
        let u = cvt.quantize(0.5, 0);
        let got = i32::from(u) as f32 * 64.0 * q.norm[0] + q.bias[0];
        assert!((got - 0.5).abs() < 0.02, "{}", got);
    }

    #[test]
    fn test_input_layout() {
        let p = ConvParam::dense(5, 1, 1, 3);
        let q = QuantizedDense {
            weight: (0..15).map(|i| i as i8).collect(),
            ..Default::default()
        };
        let (w, dw) = reorder_input(&q, &p, 8);
        assert_eq!(dw, 8);
        // lane 2 of quad 0 holds channels 0..4 of output 2
        assert_eq!(&w[2 * 4..3 * 4], &[2, 5, 8, 11]);
        // quad 1 holds channel 4 then zero padding
        assert_eq!(&w[32 + 4..32 + 8], &[13, 0, 0, 0]);
        assert!(w[3 * 4..8 * 4].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_depthwise_layout() {
        let p = ConvParam::depthwise(3, 4, 4).kernel(1, 2).pad(0, 0, 0, 1);
        let w = reorder_depthwise(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &p, 4);
        assert_eq!(w, [1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);
    }
}
