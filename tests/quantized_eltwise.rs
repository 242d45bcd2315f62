//! Quantized add and scale against their float definitions.

use proptest::prelude::*;
use synet_simd::quant::{dequantize_linear, quantize_linear};
use synet_simd::{ActivationKind, Error, QuantParam, QuantizedAdd, QuantizedScale};

fn quant_param() -> impl Strategy<Value = QuantParam> {
    (0.001f32..0.5, 0i32..=255).prop_map(|(scale, zero)| QuantParam::new(scale, zero))
}

proptest! {
    #[test]
    fn add_matches_float_definition(
        qa in quant_param(),
        qb in quant_param(),
        qd in quant_param(),
        data in prop::collection::vec((any::<u8>(), any::<u8>()), 1..64),
    ) {
        let add = QuantizedAdd::new(qa, qb, qd, ActivationKind::Identity, &[]).unwrap();
        let (a, b): (Vec<u8>, Vec<u8>) = data.into_iter().unzip();
        let mut dst = vec![0u8; a.len()];
        add.forward(&a, &b, &mut dst).unwrap();
        for i in 0..a.len() {
            let x = dequantize_linear(i32::from(a[i]), -qa.zero, qa.scale)
                + dequantize_linear(i32::from(b[i]), -qb.zero, qb.scale);
            let want = quantize_linear(x, 1.0 / qd.scale, qd.zero, 0, 255);
            prop_assert!((i32::from(dst[i]) - want).abs() <= 1, "{} vs {}", dst[i], want);
        }
    }

    #[test]
    fn scale_is_linear_within_one_step(
        qs in quant_param(),
        scale in prop::collection::vec(-2.0f32..2.0, 1..5),
        pixels in 1usize..16,
        bytes in prop::collection::vec(any::<u8>(), 64),
    ) {
        let channels = scale.len();
        let bias: Vec<f32> = (0..channels).map(|c| c as f32 * 0.1 - 0.2).collect();
        let dst_q = QuantParam::from_range(-3.0, 3.0);
        let op = QuantizedScale::new(qs, &scale, Some(&bias), dst_q, ActivationKind::Identity, &[]).unwrap();
        let src = &bytes[..pixels * channels];
        let mut dst = vec![0u8; src.len()];
        op.forward(src, &mut dst).unwrap();
        for (i, (&s, &d)) in src.iter().zip(&dst).enumerate() {
            let c = i % channels;
            let x = qs.dequantize(s) * scale[c] + bias[c];
            let want = i32::from(dst_q.quantize(x));
            prop_assert!((i32::from(d) - want).abs() <= 1, "{} vs {}", d, want);
        }
    }
}

#[test]
fn scale_applies_per_channel_prelu() {
    let src_q = QuantParam::new(0.1, 100);
    let dst_q = QuantParam::new(0.1, 100);
    let slopes = [0.5, 0.0];
    let op = QuantizedScale::new(src_q, &[1.0, 1.0], None, dst_q, ActivationKind::Prelu, &slopes).unwrap();
    let mut dst = [0u8; 4];
    op.forward(&[80, 80, 120, 120], &mut dst).unwrap();
    // -2.0 becomes -1.0 on channel 0 and 0.0 on channel 1
    assert_eq!(dst, [90, 100, 120, 120]);
}

#[test]
fn add_clamps_with_restrict_range() {
    let q = QuantParam::new(0.05, 0);
    let add = QuantizedAdd::new(q, q, q, ActivationKind::RestrictRange, &[0.0, 6.0]).unwrap();
    let mut dst = [0u8; 3];
    add.forward(&[20, 100, 200], &[20, 100, 200], &mut dst).unwrap();
    assert_eq!(dst, [40, 120, 120]);
}

#[test]
fn short_buffers_are_rejected() {
    let q = QuantParam::new(1.0, 0);
    let add = QuantizedAdd::new(q, q, q, ActivationKind::Identity, &[]).unwrap();
    let mut dst = [0u8; 2];
    assert!(matches!(
        add.forward(&[1, 2, 3], &[1, 2, 3], &mut dst),
        Err(Error::BufferTooSmall { name: "dst", .. })
    ));
    assert!(matches!(
        add.forward(&[1, 2], &[1], &mut dst),
        Err(Error::BufferTooSmall { name: "b", .. })
    ));
    let prelu = QuantizedScale::new(q, &[1.0, 1.0, 1.0], None, q, ActivationKind::Prelu, &[0.1]);
    assert!(matches!(prelu, Err(Error::ParamLength { .. })));
}
