//! Merged int8 convolution of a depthwise-separable block.
//!
//! A block of two or three convolutions runs as a single pass over the image.
//! Three stages exchange data through small ring buffers:
//!
//! * input: dense convolution, u8 source, float ring output;
//! * depthwise: float in, u8 (or the final float) out;
//! * output: 1×1 dense convolution, u8 in, final tensor out.
//!
//! The compositions are CDC (all three), CD (input + depthwise) and DC
//! (depthwise + output). The destination height is cut into row ranges small
//! enough for the ring buffers to stay in L2, the intermediate channels into
//! macro blocks whose weights fit half of L3.

mod convert;
mod depthwise;
mod input;
mod output;
mod reference;
mod term;
mod weights;

use crate::activation::{expand_params, select_activation, Identity};
use crate::error::{check_buffer, check_len, Error, Result};
use crate::param::{Compatibility, ConvParam, MergConvParam, TensorType};
use crate::quant::CvtParam;
use crate::simd::{Amx, Avx2, Avx512bw, Avx512vnni, KernelConfig, Lanes, Sse41, Tier};

use depthwise::{depthwise_convolution, depthwise_convolution_3x3, DepthwiseFn};
use input::{input_convolution, input_convolution_1x1, InputFn};
use output::{output_convolution, OutputFn};
use term::{Out, Tables, FIRST, INTERIM, LAST, SINGLE};
use weights::QuantizedDense;

/// Alignment of every region carved out of the scratch buffer.
const ALIGN: usize = 64;

/// How a block is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergedKind {
    /// Dense, depthwise, dense 1×1.
    Cdc,
    /// Dense then depthwise.
    Cd,
    /// Depthwise then dense 1×1.
    Dc,
    /// Whole-image execution, one convolution after the other.
    Reference,
}

impl MergedKind {
    fn select(param: &MergConvParam, config: &KernelConfig) -> Self {
        if !config.merged {
            return Self::Reference;
        }
        let conv = &param.conv;
        match (param.count(), conv[0].is_depthwise(), conv[1].is_depthwise()) {
            (3, false, _) => Self::Cdc,
            (2, false, true) => Self::Cd,
            (2, true, false) if conv[1].is_1x1() => Self::Dc,
            _ => Self::Reference,
        }
    }

    /// Convolution index of the input, depthwise and output stage.
    fn roles(self) -> [Option<usize>; 3] {
        match self {
            Self::Cdc => [Some(0), Some(1), Some(2)],
            Self::Cd => [Some(0), Some(1), None],
            Self::Dc => [None, Some(0), Some(1)],
            Self::Reference => [None, None, None],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cdc => "CDC",
            Self::Cd => "CD",
            Self::Dc => "DC",
            Self::Reference => "reference",
        }
    }
}

/// Read-only NHWC tensor handed to [`MergedConvolution8i::forward`].
#[derive(Clone, Copy, Debug)]
pub enum TensorRef<'a> {
    U8(&'a [u8]),
    F32(&'a [f32]),
}

impl<'a> TensorRef<'a> {
    pub fn len(&self) -> usize {
        match self {
            Self::U8(s) => s.len(),
            Self::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tensor_type(&self) -> TensorType {
        match self {
            Self::U8(_) => TensorType::U8,
            Self::F32(_) => TensorType::F32,
        }
    }

    fn item(self, index: usize, size: usize) -> TensorRef<'a> {
        let range = index * size..(index + 1) * size;
        match self {
            Self::U8(s) => Self::U8(&s[range]),
            Self::F32(s) => Self::F32(&s[range]),
        }
    }
}

impl<'a> From<&'a [u8]> for TensorRef<'a> {
    fn from(s: &'a [u8]) -> Self {
        Self::U8(s)
    }
}

impl<'a> From<&'a [f32]> for TensorRef<'a> {
    fn from(s: &'a [f32]) -> Self {
        Self::F32(s)
    }
}

/// Writable NHWC tensor handed to [`MergedConvolution8i::forward`].
#[derive(Debug)]
pub enum TensorMut<'a> {
    U8(&'a mut [u8]),
    F32(&'a mut [f32]),
}

impl<'a> TensorMut<'a> {
    pub fn len(&self) -> usize {
        match self {
            Self::U8(s) => s.len(),
            Self::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tensor_type(&self) -> TensorType {
        match self {
            Self::U8(_) => TensorType::U8,
            Self::F32(_) => TensorType::F32,
        }
    }

    fn item(&mut self, index: usize, size: usize) -> TensorMut<'_> {
        let range = index * size..(index + 1) * size;
        match self {
            Self::U8(s) => TensorMut::U8(&mut s[range]),
            Self::F32(s) => TensorMut::F32(&mut s[range]),
        }
    }

    fn out(&mut self, offset: usize) -> Out<'_> {
        match self {
            Self::U8(s) => Out::U8(&mut s[offset..]),
            Self::F32(s) => Out::F32(&mut s[offset..]),
        }
    }
}

impl<'a> From<&'a mut [u8]> for TensorMut<'a> {
    fn from(s: &'a mut [u8]) -> Self {
        Self::U8(s)
    }
}

impl<'a> From<&'a mut [f32]> for TensorMut<'a> {
    fn from(s: &'a mut [f32]) -> Self {
        Self::F32(s)
    }
}

/// Float parameters of one convolution.
///
/// Dense weights are `[ky][kx][src_c][dst_c]`, depthwise weights
/// `[ky][kx][c]`. `params` are the activation parameters before expansion
/// (see [`crate::activation::param_count`]).
#[derive(Clone, Copy, Debug, Default)]
pub struct ConvWeights<'a> {
    pub weight: &'a [f32],
    pub bias: Option<&'a [f32]>,
    pub params: &'a [f32],
}

/// Per-channel value range of a tensor, used to derive its quantization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TensorStats {
    pub min: Vec<f32>,
    pub max: Vec<f32>,
}

impl TensorStats {
    pub fn new(min: Vec<f32>, max: Vec<f32>) -> Self {
        Self { min, max }
    }

    /// Same range for every channel.
    pub fn uniform(channels: usize, min: f32, max: f32) -> Self {
        Self {
            min: vec![min; channels],
            max: vec![max; channels],
        }
    }
}

/// Blocking and buffer geometry, fixed at construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct AlgParam {
    pub f: usize,
    pub micro_d: usize,
    pub micro_w: usize,
    /// Intermediate channels per macro block, a multiple of `micro_d`.
    pub ma_c: usize,
    pub y_step: [usize; 3],
    pub y_start: [usize; 3],
    /// Ring heights (powers of two, 0 when the stage reads the tensor).
    pub buf_h: [usize; 3],
    /// Weight stride per channel of the input, depthwise and output stage.
    pub dw: [usize; 3],
    /// Element size of the block source and destination.
    pub elem: [usize; 2],
    /// Source byte that decodes to zero, used for padding.
    pub zero: u8,
    pub upper: i32,
}

/// Source rows per range, source rows of the first range and the ring
/// height for a stage consuming `step` destination rows per range.
fn stage_rows(p: &ConvParam, step: usize, start: usize) -> (usize, usize, usize) {
    let reach = (p.kernel_y - 1) * p.dilation_y + 1;
    let src_step = step * p.stride_y;
    let src_start = ((start - 1) * p.stride_y + reach)
        .saturating_sub(p.pad_y)
        .max(src_step)
        .min(p.src_h);
    let span = src_start
        .max((step - 1) * p.stride_y + reach)
        .max(src_step + p.pad_y);
    (src_step, src_start, span.next_power_of_two())
}

impl AlgParam {
    fn new(param: &MergConvParam, kind: MergedKind, tier: Tier, config: &KernelConfig) -> Self {
        let f = tier.lanes();
        let df = 2 * f;
        let roles = kind.roles();
        let mut a = Self {
            f,
            micro_d: df,
            micro_w: tier.micro_w(),
            elem: [param.first().src_t.size(), param.last().dst_t.size()],
            ..Self::default()
        };
        let Some(dw_index) = roles[1] else {
            return a;
        };
        let dw = &param.conv[dw_index];
        let channels = dw.src_c;
        let weight_bytes: usize = param
            .conv
            .iter()
            .filter(|p| !p.is_depthwise())
            .map(|p| p.kernel_size() * p.src_c * p.dst_c)
            .sum();
        let count = weight_bytes / (config.l3_cache / 2).max(1) + 1;
        a.ma_c = (channels / count)
            .next_multiple_of(df)
            .clamp(df, channels.next_multiple_of(df));
        if let Some(i) = roles[0] {
            let p = &param.conv[i];
            a.dw[0] = p.kernel_size() * p.src_c.next_multiple_of(4);
        }
        a.dw[1] = dw.kernel_size();
        if let Some(i) = roles[2] {
            a.dw[2] = param.conv[i].dst_c.next_multiple_of(df);
        }

        let src_u8 = param.first().src_t == TensorType::U8;
        for y_step in (1..=dw.dst_h).rev() {
            a.y_step[2] = y_step;
            a.y_start[2] = y_step;
            a.buf_h[2] = if roles[2].is_some() { y_step } else { 0 };
            let (step1, start1, buf1) = stage_rows(dw, y_step, y_step);
            a.y_step[1] = step1;
            a.y_start[1] = start1;
            // DC reads a float source in place
            a.buf_h[1] = if roles[0].is_some() || src_u8 { buf1 } else { 0 };
            a.buf_h[0] = 0;
            if let Some(i) = roles[0] {
                let (step0, start0, buf0) = stage_rows(&param.conv[i], step1, start1);
                a.y_step[0] = step0;
                a.y_start[0] = start0;
                if !src_u8 {
                    a.buf_h[0] = buf0;
                }
            }
            if a.ring_bytes(param, roles) <= config.l2_cache {
                break;
            }
        }
        log::debug!(
            "synet-simd: {} ma_c={} y_step={:?} y_start={:?} buf_h={:?}",
            kind.name(),
            a.ma_c,
            a.y_step,
            a.y_start,
            a.buf_h
        );
        a
    }

    /// Element counts of the u8 source ring, float ring, u8 depthwise
    /// buffer and int32 partial sums.
    fn regions(&self, param: &MergConvParam, roles: [Option<usize>; 3]) -> [usize; 4] {
        let Some(dw_index) = roles[1] else {
            return [0; 4];
        };
        let dw = &param.conv[dw_index];
        let r0 = roles[0].map_or(0, |i| {
            let p = &param.conv[i];
            self.buf_h[0] * p.src_w * p.src_c
        });
        let r1 = self.ma_c * self.buf_h[1] * dw.src_w;
        let r2 = self.buf_h[2] * dw.dst_w * self.ma_c;
        let r3 = match roles[2] {
            Some(i) if dw.src_c > self.ma_c => param.conv[i].dst_size(),
            _ => 0,
        };
        [r0, r1, r2, r3]
    }

    fn ring_bytes(&self, param: &MergConvParam, roles: [Option<usize>; 3]) -> usize {
        let [r0, r1, r2, _] = self.regions(param, roles);
        r0 + r1 * std::mem::size_of::<f32>() + r2
    }
}

/// Quantized and reordered parameters of one convolution.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConvData {
    /// Dense weights in source order with their requantization tables.
    pub dense: QuantizedDense,
    /// Depthwise weights in source order.
    pub raw: Vec<f32>,
    /// Depthwise bias.
    pub bias: Vec<f32>,
    pub params: Vec<f32>,
    pub packed8: Vec<i8>,
    pub packed32: Vec<f32>,
}

/// Everything `set_params` derives.
#[derive(Clone, Debug)]
pub(crate) struct Model {
    /// Block source, trailing convolution source, block destination.
    pub cvt: [CvtParam; 3],
    pub conv: Vec<ConvData>,
}

#[derive(Clone, Copy)]
struct Kernels {
    input: Option<InputFn>,
    depthwise: Option<DepthwiseFn>,
    /// Indexed by term.
    output: Option<[OutputFn; 4]>,
}

fn input_kernel<L: Lanes>(p: &ConvParam, overflow: bool) -> InputFn {
    match (p.is_1x1(), overflow) {
        (true, true) => select_activation!(p.activation, input_convolution_1x1::<L; _; true>),
        (true, false) => select_activation!(p.activation, input_convolution_1x1::<L; _; false>),
        (false, true) => select_activation!(p.activation, input_convolution::<L; _; true>),
        (false, false) => select_activation!(p.activation, input_convolution::<L; _; false>),
    }
}

fn depthwise_kernel<L: Lanes>(p: &ConvParam, u8_out: bool, nofma: bool) -> DepthwiseFn {
    macro_rules! pick {
        ($f:ident) => {
            match (u8_out, nofma) {
                (true, true) => select_activation!(p.activation, $f::<L; _; u8; true>),
                (true, false) => select_activation!(p.activation, $f::<L; _; u8; false>),
                (false, true) => select_activation!(p.activation, $f::<L; _; f32; true>),
                (false, false) => select_activation!(p.activation, $f::<L; _; f32; false>),
            }
        };
    }
    let fast = p.is_kernel(3)
        && p.is_dilation(1)
        && p.pad_y.max(p.pad_x).max(p.pad_h).max(p.pad_w) <= 1
        && p.dst_c % L::F == 0;
    if fast {
        pick!(depthwise_convolution_3x3)
    } else {
        pick!(depthwise_convolution)
    }
}

fn output_kernels<L: Lanes>(p: &ConvParam, overflow: bool) -> [OutputFn; 4] {
    macro_rules! pick {
        ($e:ty, $overflow:tt) => {
            [
                select_activation!(p.activation, output_convolution::<L; _; $e; SINGLE; $overflow>),
                output_convolution::<L, Identity, $e, FIRST, $overflow>,
                output_convolution::<L, Identity, $e, INTERIM, $overflow>,
                select_activation!(p.activation, output_convolution::<L; _; $e; LAST; $overflow>),
            ]
        };
    }
    match (p.dst_t, overflow) {
        (TensorType::U8, true) => pick!(u8, true),
        (TensorType::U8, false) => pick!(u8, false),
        (TensorType::F32, true) => pick!(f32, true),
        (TensorType::F32, false) => pick!(f32, false),
    }
}

fn build<L: Lanes>(param: &MergConvParam, kind: MergedKind) -> Kernels {
    let compatibility = param.compatibility;
    let overflow = compatibility.overflow() || compatibility.narrowed();
    let roles = kind.roles();
    let u8_out = roles[2].is_some() || param.last().dst_t == TensorType::U8;
    Kernels {
        input: roles[0].map(|i| input_kernel::<L>(&param.conv[i], overflow)),
        depthwise: roles[1].map(|i| depthwise_kernel::<L>(&param.conv[i], u8_out, compatibility.fma_avoid())),
        output: roles[2].map(|i| output_kernels::<L>(&param.conv[i], overflow)),
    }
}

fn kernels(tier: Tier, param: &MergConvParam, kind: MergedKind) -> Kernels {
    match tier {
        Tier::Sse41 => build::<Sse41>(param, kind),
        Tier::Avx2 => build::<Avx2>(param, kind),
        Tier::Avx512bw => build::<Avx512bw>(param, kind),
        Tier::Avx512vnni => build::<Avx512vnni>(param, kind),
        Tier::Amx => build::<Amx>(param, kind),
    }
}

/// Term of the output stage for macro block `index` of `count`.
fn term(index: usize, count: usize) -> u8 {
    if count == 1 {
        SINGLE
    } else if index == 0 {
        FIRST
    } else if index + 1 == count {
        LAST
    } else {
        INTERIM
    }
}

/// Typed regions of the scratch buffer.
struct Arena<'a> {
    rest: &'a mut [u8],
}

impl<'a> Arena<'a> {
    fn take<T: bytemuck::Pod>(&mut self, len: usize) -> Result<&'a mut [T]> {
        let rest = std::mem::take(&mut self.rest);
        let skip = rest.as_ptr().align_offset(ALIGN).min(rest.len());
        let (_, rest) = rest.split_at_mut(skip);
        let bytes = len * std::mem::size_of::<T>();
        check_buffer("scratch", rest.len(), bytes)?;
        let (head, tail) = rest.split_at_mut(bytes);
        self.rest = tail;
        bytemuck::try_cast_slice_mut(head).map_err(|_| Error::BufferTooSmall {
            name: "scratch",
            expected: bytes,
            actual: 0,
        })
    }
}

struct Scratch<'a> {
    src: &'a mut [u8],
    ring: &'a mut [f32],
    mid: &'a mut [u8],
    sum: &'a mut [i32],
}

/// A depthwise-separable block of 2 or 3 convolutions running on int8
/// arithmetic.
///
/// ```no_run
/// use synet_simd::{
///     Compatibility, ConvParam, ConvWeights, KernelConfig, MergedConvolution8i, TensorMut,
///     TensorRef, TensorStats,
/// };
///
/// let convs = [
///     ConvParam::dense(16, 32, 32, 64),
///     ConvParam::depthwise(64, 32, 32),
///     ConvParam::dense(64, 32, 32, 16),
/// ];
/// let mut block =
///     MergedConvolution8i::new(1, &convs, Compatibility::PRECISE, KernelConfig::default())?;
/// # let (w0, w1, w2) = (vec![0.0; 16 * 64], vec![0.0; 9 * 64], vec![0.0; 64 * 16]);
/// let weights = [
///     ConvWeights { weight: &w0, ..Default::default() },
///     ConvWeights { weight: &w1, ..Default::default() },
///     ConvWeights { weight: &w2, ..Default::default() },
/// ];
/// let stats = [
///     TensorStats::uniform(16, -1.0, 1.0),
///     TensorStats::uniform(64, 0.0, 6.0),
///     TensorStats::uniform(16, -1.0, 1.0),
/// ];
/// block.set_params(&weights, &stats)?;
/// let src = vec![0.0f32; 32 * 32 * 16];
/// let mut dst = vec![0.0f32; 32 * 32 * 16];
/// block.forward(TensorRef::F32(&src), None, TensorMut::F32(&mut dst))?;
/// # Ok::<(), synet_simd::Error>(())
/// ```
pub struct MergedConvolution8i {
    param: MergConvParam,
    tier: Tier,
    kind: MergedKind,
    alg: AlgParam,
    kernels: Kernels,
    model: Option<Model>,
    buffer: Vec<u8>,
}

impl MergedConvolution8i {
    pub fn new(
        batch: usize,
        convs: &[ConvParam],
        compatibility: Compatibility,
        config: KernelConfig,
    ) -> Result<Self> {
        let param = MergConvParam::new(batch, convs, compatibility)?;
        let tier = config.resolve_tier();
        let kind = MergedKind::select(&param, &config);
        log::debug!(
            "synet-simd: merged convolution {} on {} (compatibility {:#x})",
            kind.name(),
            tier.name(),
            compatibility.bits()
        );
        let alg = AlgParam::new(&param, kind, tier, &config);
        let kernels = kernels(tier, &param, kind);
        Ok(Self {
            param,
            tier,
            kind,
            alg,
            kernels,
            model: None,
            buffer: Vec::new(),
        })
    }

    pub fn param(&self) -> &MergConvParam {
        &self.param
    }

    pub fn kind(&self) -> MergedKind {
        self.kind
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Bytes of scratch `forward` needs when the caller supplies it.
    pub fn external_buffer_size(&self) -> usize {
        if self.kind == MergedKind::Reference {
            return 0;
        }
        self.alg
            .regions(&self.param, self.kind.roles())
            .iter()
            .zip([1, std::mem::size_of::<f32>(), 1, std::mem::size_of::<i32>()])
            .map(|(&n, size)| n * size + ALIGN)
            .sum()
    }

    /// Quantizes and reorders the float parameters of every convolution.
    ///
    /// `stats` are the value ranges of the block source, of the source of
    /// the last convolution and of the block destination.
    pub fn set_params(&mut self, weights: &[ConvWeights<'_>], stats: &[TensorStats; 3]) -> Result<()> {
        let param = &self.param;
        check_len("weights", weights.len(), param.count())?;
        let compatibility = param.compatibility;
        let cvt = [
            CvtParam::new(&stats[0].min, &stats[0].max, param.first().src_c, compatibility)?,
            CvtParam::new(&stats[1].min, &stats[1].max, param.last().src_c, compatibility)?,
            CvtParam::new(&stats[2].min, &stats[2].max, param.last().dst_c, compatibility)?,
        ];
        let roles = self.kind.roles();
        let a = &self.alg;
        let mut conv = Vec::with_capacity(param.count());
        for (i, (p, w)) in param.conv.iter().zip(weights).enumerate() {
            let len = if p.is_depthwise() {
                p.kernel_size() * p.src_c
            } else {
                p.kernel_size() * p.src_c * p.dst_c
            };
            check_len("weight", w.weight.len(), len)?;
            if let Some(bias) = w.bias {
                check_len("bias", bias.len(), p.dst_c)?;
            }
            let mut data = ConvData {
                params: expand_params(p.activation, w.params, p.dst_c)?,
                ..ConvData::default()
            };
            if p.is_depthwise() {
                data.raw = w.weight[..len].to_vec();
                data.bias = w.bias.map_or_else(|| vec![0.0; p.dst_c], |b| b[..p.dst_c].to_vec());
                if roles[1] == Some(i) {
                    data.packed32 = weights::reorder_depthwise(&data.raw, p, a.f);
                }
            } else {
                let source = &cvt[if i == 0 { 0 } else { 1 }];
                data.dense = weights::quantize_dense(w.weight, w.bias, p, source, compatibility.overflow());
                if roles[0] == Some(i) {
                    data.packed8 = weights::reorder_input(&data.dense, p, a.micro_d).0;
                } else if roles[2] == Some(i) {
                    data.packed8 = weights::reorder_output(&data.dense, p, a.micro_d, a.ma_c).0;
                }
            }
            conv.push(data);
        }
        self.alg.zero = cvt[0].uniform_zero();
        self.alg.upper = cvt[2].u_max;
        self.model = Some(Model { cvt, conv });
        Ok(())
    }

    /// Runs the block over every batch item.
    ///
    /// Without `scratch` an internal buffer of
    /// [`external_buffer_size`](Self::external_buffer_size) bytes is used.
    pub fn forward(&mut self, src: TensorRef<'_>, scratch: Option<&mut [u8]>, mut dst: TensorMut<'_>) -> Result<()> {
        let model = self.model.as_ref().ok_or(Error::ParamsNotSet)?;
        let (first, last) = (self.param.first(), self.param.last());
        if src.tensor_type() != first.src_t {
            return Err(Error::TensorTypeMismatch { name: "src" });
        }
        if dst.tensor_type() != last.dst_t {
            return Err(Error::TensorTypeMismatch { name: "dst" });
        }
        let batch = self.param.batch;
        let (src_size, dst_size) = (first.src_size(), last.dst_size());
        check_buffer("src", src.len(), batch * src_size)?;
        check_buffer("dst", dst.len(), batch * dst_size)?;

        if self.kind == MergedKind::Reference {
            for b in 0..batch {
                reference::forward(&self.param, model, src.item(b, src_size), dst.item(b, dst_size));
            }
            return Ok(());
        }

        let need = self.external_buffer_size();
        let mut internal = std::mem::take(&mut self.buffer);
        let result = match scratch {
            Some(scratch) => self.run(model, src, scratch, dst),
            None => {
                if internal.len() < need {
                    internal.resize(need, 0);
                }
                self.run(model, src, &mut internal, dst)
            }
        };
        self.buffer = internal;
        result
    }

    fn run(&self, model: &Model, src: TensorRef<'_>, scratch: &mut [u8], mut dst: TensorMut<'_>) -> Result<()> {
        check_buffer("scratch", scratch.len(), self.external_buffer_size())?;
        let [r0, r1, r2, r3] = self.alg.regions(&self.param, self.kind.roles());
        let mut arena = Arena { rest: scratch };
        let mut buf = Scratch {
            src: arena.take(r0)?,
            ring: arena.take(r1)?,
            mid: arena.take(r2)?,
            sum: arena.take(r3)?,
        };
        let (src_size, dst_size) = (self.param.first().src_size(), self.param.last().dst_size());
        for b in 0..self.param.batch {
            let (src, dst) = (src.item(b, src_size), dst.item(b, dst_size));
            match self.kind {
                MergedKind::Cdc | MergedKind::Cd => self.forward_conv_first(model, src, &mut buf, dst),
                MergedKind::Dc => self.forward_depthwise_first(model, src, &mut buf, dst),
                MergedKind::Reference => unreachable!("handled by forward"),
            }
        }
        Ok(())
    }

    fn tables<'a, W>(
        &self,
        weight: &'a [W],
        norm: &'a [f32],
        bias: &'a [f32],
        params: &'a [f32],
        cvt: Option<&'a CvtParam>,
        offset: usize,
    ) -> Tables<'a, W> {
        Tables {
            weight,
            norm,
            bias,
            params,
            scale: cvt.map_or(&[][..], |c| &c.scale[..]),
            shift: cvt.map_or(&[][..], |c| &c.shift[..]),
            upper: self.alg.upper,
            offset,
        }
    }

    /// Tables of the output stage for the macro block starting at `c`.
    fn output_tables<'a>(&'a self, model: &'a Model, index: usize, c: usize) -> Tables<'a, i8> {
        let data = &model.conv[index];
        let cvt = (self.param.last().dst_t == TensorType::U8).then_some(&model.cvt[2]);
        self.tables(
            &data.packed8[c * self.alg.dw[2]..],
            &data.dense.norm,
            &data.dense.bias,
            &data.params,
            cvt,
            0,
        )
    }

    /// CDC and CD: source → input → depthwise (→ output).
    fn forward_conv_first(&self, model: &Model, src: TensorRef<'_>, buf: &mut Scratch<'_>, mut dst: TensorMut<'_>) {
        let (Some(input), Some(depthwise)) = (self.kernels.input, self.kernels.depthwise) else {
            unreachable!("conv-first block without input or depthwise kernel");
        };
        let a = &self.alg;
        let (c0, c1) = (&self.param.conv[0], &self.param.conv[1]);
        let output = self.kernels.output.map(|o| (o, &self.param.conv[2]));
        // CD with u8 destination quantizes in the depthwise stage
        let dw_cvt = match (output.is_some(), c1.dst_t) {
            (true, _) => Some(&model.cvt[1]),
            (false, TensorType::U8) => Some(&model.cvt[2]),
            (false, TensorType::F32) => None,
        };
        let channels = c0.dst_c;
        let count = channels.div_ceil(a.ma_c);
        for (index, c) in (0..channels).step_by(a.ma_c).enumerate() {
            let ma_c = (channels - c).min(a.ma_c);
            let d0 = &model.conv[0];
            let t0 = self.tables(
                &d0.packed8[c * a.dw[0]..],
                &d0.dense.norm,
                &d0.dense.bias,
                &d0.params,
                None,
                c,
            );
            let d1 = &model.conv[1];
            let t1 = self.tables(&d1.packed32[c * a.dw[1]..], &[], &d1.bias, &d1.params, dw_cvt, c);
            let t2 = output.map(|_| self.output_tables(model, 2, c));
            let term = term(index, count);
            let (mut y0, mut y1, mut y2) = (0, 0, 0);
            while y2 < c1.dst_h {
                let e0 = (y0 + a.y_step[0]).clamp(a.y_start[0], c0.src_h);
                let e1 = (y1 + a.y_step[1]).clamp(a.y_start[1], c1.src_h);
                let e2 = (y2 + a.y_step[2]).clamp(a.y_start[2], c1.dst_h);
                let rows: &[u8] = match src {
                    TensorRef::U8(s) => s,
                    TensorRef::F32(s) => {
                        convert::quantize_rows(s, c0, &model.cvt[0], a.buf_h[0], y0, e0, buf.src);
                        &*buf.src
                    }
                };
                input(rows, c0, a, ma_c, y1, e1, &t0, buf.ring);
                match (output, &t2) {
                    (Some((kernels, c2)), Some(t2)) => {
                        depthwise(buf.ring, c1, a, ma_c, y2, e2, &t1, Out::U8(&mut *buf.mid));
                        let out = match term {
                            FIRST | INTERIM => Out::Sum,
                            _ => dst.out(0),
                        };
                        kernels[usize::from(term)](buf.mid, c2, a, ma_c, y2, e2, t2, buf.sum, out);
                    }
                    _ => depthwise(buf.ring, c1, a, ma_c, y2, e2, &t1, dst.out(c)),
                }
                (y0, y1, y2) = (e0, e1, e2);
            }
        }
    }

    /// DC: source → depthwise → output.
    fn forward_depthwise_first(
        &self,
        model: &Model,
        src: TensorRef<'_>,
        buf: &mut Scratch<'_>,
        mut dst: TensorMut<'_>,
    ) {
        let (Some(depthwise), Some(output)) = (self.kernels.depthwise, self.kernels.output) else {
            unreachable!("depthwise-first block without depthwise or output kernel");
        };
        let a = &self.alg;
        let (c0, c1) = (&self.param.conv[0], &self.param.conv[1]);
        let channels = c0.src_c;
        let count = channels.div_ceil(a.ma_c);
        for (index, c) in (0..channels).step_by(a.ma_c).enumerate() {
            let ma_c = (channels - c).min(a.ma_c);
            let d0 = &model.conv[0];
            let t0 = self.tables(
                &d0.packed32[c * a.dw[1]..],
                &[],
                &d0.bias,
                &d0.params,
                Some(&model.cvt[1]),
                c,
            );
            let t1 = self.output_tables(model, 1, c);
            let term = term(index, count);
            let (mut y1, mut y2) = (0, 0);
            while y2 < c0.dst_h {
                let e1 = (y1 + a.y_step[1]).clamp(a.y_start[1], c0.src_h);
                let e2 = (y2 + a.y_step[2]).clamp(a.y_start[2], c0.dst_h);
                match src {
                    TensorRef::U8(s) => {
                        convert::dequantize_rows(s, c0, &model.cvt[0], a.f, c, ma_c, a.buf_h[1], y1, e1, buf.ring);
                        depthwise(buf.ring, c0, a, ma_c, y2, e2, &t0, Out::U8(&mut *buf.mid));
                    }
                    TensorRef::F32(s) => depthwise(&s[c..], c0, a, ma_c, y2, e2, &t0, Out::U8(&mut *buf.mid)),
                }
                let out = match term {
                    FIRST | INTERIM => Out::Sum,
                    _ => dst.out(0),
                };
                output[usize::from(term)](buf.mid, c1, a, ma_c, y2, e2, &t1, buf.sum, out);
                (y1, y2) = (e1, e2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ActivationKind;

    fn cdc(channels: usize, size: usize) -> Vec<ConvParam> {
        vec![
            ConvParam::dense(8, size, size, channels).activation(ActivationKind::Relu),
            ConvParam::depthwise(channels, size, size).activation(ActivationKind::Relu),
            ConvParam::dense(channels, size, size, 8),
        ]
    }

    #[test]
    fn test_kind_selection() {
        let config = KernelConfig::with_tier(Tier::Avx2);
        let block = MergedConvolution8i::new(1, &cdc(16, 8), Compatibility::PRECISE, config).unwrap();
        assert_eq!(block.kind(), MergedKind::Cdc);
        let convs = cdc(16, 8);
        let block = MergedConvolution8i::new(1, &convs[..2], Compatibility::PRECISE, config).unwrap();
        assert_eq!(block.kind(), MergedKind::Cd);
        let dc = [ConvParam::depthwise(16, 8, 8), ConvParam::dense(16, 8, 8, 4)];
        let block = MergedConvolution8i::new(1, &dc, Compatibility::PRECISE, config).unwrap();
        assert_eq!(block.kind(), MergedKind::Dc);
        let block = MergedConvolution8i::new(1, &dc, Compatibility::PRECISE, config.whole_image()).unwrap();
        assert_eq!(block.kind(), MergedKind::Reference);
        assert_eq!(block.external_buffer_size(), 0);
    }

    #[test]
    fn test_macro_block_from_l3_budget() {
        let config = KernelConfig::with_tier(Tier::Sse41).l3_cache(64);
        let block = MergedConvolution8i::new(1, &cdc(64, 4), Compatibility::PRECISE, config).unwrap();
        // the budget is far below the weights, so blocks shrink to one tile
        assert_eq!(block.alg.ma_c, 8);
        let config = KernelConfig::with_tier(Tier::Sse41);
        let block = MergedConvolution8i::new(1, &cdc(60, 4), Compatibility::PRECISE, config).unwrap();
        assert_eq!(block.alg.ma_c, 64);
    }

    #[test]
    fn test_row_step_from_l2_budget() {
        let config = KernelConfig::with_tier(Tier::Avx2);
        let big = MergedConvolution8i::new(1, &cdc(16, 32), Compatibility::PRECISE, config).unwrap();
        assert_eq!(big.alg.y_step[2], 32);
        let small = MergedConvolution8i::new(1, &cdc(16, 32), Compatibility::PRECISE, config.l2_cache(4096)).unwrap();
        let a = &small.alg;
        assert!(a.y_step[2] < 32);
        assert!(a.buf_h.iter().all(|h| *h == 0 || h.is_power_of_two()), "{:?}", a.buf_h);
        // a 3x3 depthwise needs two more rows than it produces
        assert!(a.buf_h[1] >= a.y_step[2] + 2);
    }

    #[test]
    fn test_stage_rows() {
        let p = ConvParam::depthwise(8, 16, 16);
        assert_eq!(stage_rows(&p, 4, 4), (4, 5, 8));
        let p = ConvParam::depthwise(8, 16, 16).stride(2, 2);
        assert_eq!(stage_rows(&p, 2, 2), (4, 4, 8));
        let p = ConvParam::dense(8, 16, 16, 8);
        assert_eq!(stage_rows(&p, 3, 3), (3, 3, 4));
    }

    #[test]
    fn test_terms() {
        assert_eq!(term(0, 1), SINGLE);
        assert_eq!([term(0, 3), term(1, 3), term(2, 3)], [FIRST, INTERIM, LAST]);
    }

    #[test]
    fn test_forward_requires_params() {
        let mut block =
            MergedConvolution8i::new(1, &cdc(16, 4), Compatibility::PRECISE, KernelConfig::default()).unwrap();
        let src = vec![0.0f32; 4 * 4 * 8];
        let mut dst = vec![0.0f32; 4 * 4 * 8];
        assert_eq!(
            block.forward(TensorRef::F32(&src), None, TensorMut::F32(&mut dst)),
            Err(Error::ParamsNotSet)
        );
    }
}
