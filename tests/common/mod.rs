//! Shared helpers: random blocks, a plain float forward pass and statistics.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use synet_simd::activation::{activate_scalar, expand_params};
use synet_simd::{
    ActivationKind, Compatibility, ConvParam, ConvWeights, CvtParam, KernelConfig, MergedConvolution8i,
    MergedKind, TensorMut, TensorRef, TensorStats, TensorType,
};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_vec(rng: &mut StdRng, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(lo..hi)).collect()
}

/// Activation parameters the tests use for each kind.
pub fn default_params(kind: ActivationKind, channels: usize) -> Vec<f32> {
    match kind {
        ActivationKind::RestrictRange => vec![0.0, 6.0],
        ActivationKind::LeakyRelu => vec![0.1],
        ActivationKind::Prelu => (0..channels).map(|c| 0.05 * c as f32).collect(),
        ActivationKind::Elu => vec![1.0],
        ActivationKind::Hswish => vec![3.0, 1.0 / 6.0],
        ActivationKind::Mish => vec![20.0],
        ActivationKind::HardSigmoid => vec![1.0 / 6.0, 0.5],
        ActivationKind::Swish => vec![1.0],
        _ => Vec::new(),
    }
}

/// Float weights of a block plus the float result of every stage.
pub struct Block {
    pub convs: Vec<ConvParam>,
    pub weights: Vec<Vec<f32>>,
    pub biases: Vec<Vec<f32>>,
    pub params: Vec<Vec<f32>>,
}

impl Block {
    pub fn random(convs: Vec<ConvParam>, rng: &mut StdRng) -> Self {
        let mut weights = Vec::new();
        let mut biases = Vec::new();
        let mut params = Vec::new();
        for p in &convs {
            let (len, fan_in) = if p.is_depthwise() {
                (p.kernel_size() * p.src_c, p.kernel_size())
            } else {
                (p.kernel_size() * p.src_c * p.dst_c, p.kernel_size() * p.src_c)
            };
            let bound = 1.5 / (fan_in as f32).sqrt();
            weights.push(random_vec(rng, len, -bound, bound));
            biases.push(random_vec(rng, p.dst_c, -0.1, 0.1));
            params.push(default_params(p.activation, p.dst_c));
        }
        Self {
            convs,
            weights,
            biases,
            params,
        }
    }

    pub fn conv_weights(&self) -> Vec<ConvWeights<'_>> {
        (0..self.convs.len())
            .map(|i| ConvWeights {
                weight: &self.weights[i],
                bias: Some(&self.biases[i]),
                params: &self.params[i],
            })
            .collect()
    }

    /// Float outputs of every convolution for one image.
    pub fn float_forward(&self, src: &[f32]) -> Vec<Vec<f32>> {
        let mut outputs: Vec<Vec<f32>> = Vec::new();
        for (i, p) in self.convs.iter().enumerate() {
            let input = if i == 0 { src } else { &outputs[i - 1] };
            let out = conv_f32(input, p, &self.weights[i], &self.biases[i], &self.params[i]);
            outputs.push(out);
        }
        outputs
    }

    /// Statistics of the block source, last convolution source and block
    /// destination over every image of the batch.
    pub fn stats(&self, images: &[Vec<f32>]) -> [TensorStats; 3] {
        let count = self.convs.len();
        let first = &self.convs[0];
        let last = &self.convs[count - 1];
        let mut mid = Vec::new();
        let mut dst = Vec::new();
        for image in images {
            let out = self.float_forward(image);
            mid.extend_from_slice(&out[count - 2]);
            dst.extend_from_slice(&out[count - 1]);
        }
        [
            channel_stats(&images.concat(), first.src_c),
            channel_stats(&mid, last.src_c),
            channel_stats(&dst, last.dst_c),
        ]
    }
}

pub fn channel_stats(values: &[f32], channels: usize) -> TensorStats {
    let mut min = vec![f32::MAX; channels];
    let mut max = vec![f32::MIN; channels];
    for pixel in values.chunks_exact(channels) {
        for (c, &v) in pixel.iter().enumerate() {
            min[c] = min[c].min(v);
            max[c] = max[c].max(v);
        }
    }
    TensorStats::new(min, max)
}

/// Direct float convolution, dense or depthwise.
pub fn conv_f32(src: &[f32], p: &ConvParam, weight: &[f32], bias: &[f32], params: &[f32]) -> Vec<f32> {
    let params = expand_params(p.activation, params, p.dst_c).expect("activation params");
    let mut dst = vec![0f32; p.dst_size()];
    for dy in 0..p.dst_h {
        for dx in 0..p.dst_w {
            for d in 0..p.dst_c {
                let mut sum = bias[d];
                for ky in 0..p.kernel_y {
                    let sy = (dy * p.stride_y + ky * p.dilation_y) as isize - p.pad_y as isize;
                    if sy < 0 || sy >= p.src_h as isize {
                        continue;
                    }
                    for kx in 0..p.kernel_x {
                        let sx = (dx * p.stride_x + kx * p.dilation_x) as isize - p.pad_x as isize;
                        if sx < 0 || sx >= p.src_w as isize {
                            continue;
                        }
                        let pix = (sy as usize * p.src_w + sx as usize) * p.src_c;
                        let k = ky * p.kernel_x + kx;
                        if p.is_depthwise() {
                            sum += src[pix + d] * weight[k * p.src_c + d];
                        } else {
                            for c in 0..p.src_c {
                                sum += src[pix + c] * weight[(k * p.src_c + c) * p.dst_c + d];
                            }
                        }
                    }
                }
                dst[(dy * p.dst_w + dx) * p.dst_c + d] = activate_scalar(p.activation, sum, &params, d);
            }
        }
    }
    dst
}

/// Element types of the block source and destination.
#[derive(Clone, Copy, Debug)]
pub struct Io {
    pub src: TensorType,
    pub dst: TensorType,
}

pub const F32_IO: Io = Io {
    src: TensorType::F32,
    dst: TensorType::F32,
};

/// Runs `block` over `images` and returns the kind used plus the
/// destination, dequantized when it is u8.
pub fn run_block(
    block: &Block,
    images: &[Vec<f32>],
    io: Io,
    compatibility: Compatibility,
    config: KernelConfig,
) -> (MergedKind, Vec<f32>) {
    let mut convs = block.convs.clone();
    convs[0] = convs[0].src_type(io.src);
    let last = convs.len() - 1;
    convs[last] = convs[last].dst_type(io.dst);
    let stats = block.stats(images);
    let mut conv = MergedConvolution8i::new(images.len(), &convs, compatibility, config).expect("valid block");
    conv.set_params(&block.conv_weights(), &stats).expect("valid params");

    let first = &convs[0];
    let src_f32 = images.concat();
    let src_cvt = CvtParam::new(&stats[0].min, &stats[0].max, first.src_c, compatibility).expect("src stats");
    let src_u8: Vec<u8> = src_f32
        .iter()
        .enumerate()
        .map(|(i, &v)| src_cvt.quantize(v, i % first.src_c))
        .collect();
    let src = match io.src {
        TensorType::U8 => TensorRef::U8(&src_u8),
        TensorType::F32 => TensorRef::F32(&src_f32),
    };

    let p = &convs[last];
    let len = images.len() * p.dst_size();
    let out = match io.dst {
        TensorType::F32 => {
            let mut dst = vec![0f32; len];
            conv.forward(src, None, TensorMut::F32(&mut dst)).expect("forward");
            dst
        }
        TensorType::U8 => {
            let mut dst = vec![0u8; len];
            conv.forward(src, None, TensorMut::U8(&mut dst)).expect("forward");
            let cvt = CvtParam::new(&stats[2].min, &stats[2].max, p.dst_c, compatibility).expect("dst stats");
            dst.iter()
                .enumerate()
                .map(|(i, &v)| cvt.dequantize(v, i % p.dst_c))
                .collect()
        }
    };
    (conv.kind(), out)
}

pub fn max_abs(values: &[f32]) -> f32 {
    values.iter().fold(0f32, |m, v| m.max(v.abs()))
}

/// Asserts `|a - b| <= tol` everywhere, naming the first offending index.
pub fn assert_close(a: &[f32], b: &[f32], tol: f32, what: &str) {
    assert_eq!(a.len(), b.len(), "{}: length", what);
    let (mut worst, mut at) = (0f32, 0);
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let d = (x - y).abs();
        if d > worst {
            worst = d;
            at = i;
        }
    }
    assert!(
        worst <= tol,
        "{}: max error {} at {} ({} vs {}), tolerance {}",
        what,
        worst,
        at,
        a[at],
        b[at],
        tol
    );
}
