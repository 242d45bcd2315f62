//! Convolution shape descriptions and the numeric policy flags.

use std::ops::BitOr;

use crate::error::{Error, Result};

/// Element type of a tensor at the boundary of a kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TensorType {
    /// Quantized unsigned 8-bit.
    U8,
    #[default]
    F32,
}

impl TensorType {
    pub const fn size(self) -> usize {
        match self {
            TensorType::U8 => 1,
            TensorType::F32 => 4,
        }
    }
}

/// Activation fused into the end of a convolution stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    #[default]
    Identity,
    Relu,
    /// One slope parameter.
    LeakyRelu,
    /// Lower and upper bound.
    RestrictRange,
    /// One slope per output channel.
    Prelu,
    /// Alpha.
    Elu,
    /// Shift and scale.
    Hswish,
    /// Threshold.
    Mish,
    /// Scale and shift.
    HardSigmoid,
    /// Slope.
    Swish,
    Gelu,
}

/// Numeric policy bitset shared by all 8-bit kernels.
///
/// The low two bits pick how int8 dot products accumulate, bits 2..4 pick
/// whether a fused multiply-add may be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Compatibility(u32);

impl Compatibility {
    /// Exact widening accumulation over the full 8-bit ranges.
    pub const PRECISE: Self = Self(0);
    /// 16-bit saturating pair sums, weights halved for signed sources.
    pub const OVERFLOW: Self = Self(1);
    /// Ranges narrowed to [0, 180] and [-90, 90] so pair sums fit in 16 bits.
    pub const NARROWED: Self = Self(2);
    pub const FMA_USE: Self = Self(0);
    pub const FMA_NO_TAIL: Self = Self(4);
    /// Round every product before the add.
    pub const FMA_AVOID: Self = Self(8);

    const MASK_8I: u32 = 3;
    const MASK_FMA: u32 = 12;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn overflow(self) -> bool {
        self.0 & Self::MASK_8I == Self::OVERFLOW.0
    }

    pub const fn narrowed(self) -> bool {
        self.0 & Self::MASK_8I == Self::NARROWED.0
    }

    pub const fn fma_avoid(self) -> bool {
        self.0 & Self::MASK_FMA == Self::FMA_AVOID.0
    }
}

impl BitOr for Compatibility {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Shape, stride, padding and activation of one convolution.
///
/// Destination height and width are derived from the rest and kept up to date
/// by the builder methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvParam {
    pub src_c: usize,
    pub src_h: usize,
    pub src_w: usize,
    pub src_t: TensorType,
    pub dst_c: usize,
    pub dst_h: usize,
    pub dst_w: usize,
    pub dst_t: TensorType,
    pub kernel_y: usize,
    pub kernel_x: usize,
    pub dilation_y: usize,
    pub dilation_x: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub pad_y: usize,
    pub pad_x: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub group: usize,
    pub activation: ActivationKind,
}

impl ConvParam {
    /// A dense 1x1 convolution with unit stride and no padding.
    pub fn dense(src_c: usize, src_h: usize, src_w: usize, dst_c: usize) -> Self {
        Self {
            src_c,
            src_h,
            src_w,
            src_t: TensorType::F32,
            dst_c,
            dst_h: src_h,
            dst_w: src_w,
            dst_t: TensorType::F32,
            kernel_y: 1,
            kernel_x: 1,
            dilation_y: 1,
            dilation_x: 1,
            stride_y: 1,
            stride_x: 1,
            pad_y: 0,
            pad_x: 0,
            pad_h: 0,
            pad_w: 0,
            group: 1,
            activation: ActivationKind::Identity,
        }
    }

    /// A depthwise 3x3 convolution with unit stride and "same" padding.
    pub fn depthwise(channels: usize, src_h: usize, src_w: usize) -> Self {
        Self {
            group: channels,
            ..Self::dense(channels, src_h, src_w, channels)
        }
        .kernel(3, 3)
        .pad(1, 1, 1, 1)
    }

    #[must_use]
    pub fn kernel(mut self, kernel_y: usize, kernel_x: usize) -> Self {
        self.kernel_y = kernel_y;
        self.kernel_x = kernel_x;
        self.update_dst()
    }

    #[must_use]
    pub fn stride(mut self, stride_y: usize, stride_x: usize) -> Self {
        self.stride_y = stride_y;
        self.stride_x = stride_x;
        self.update_dst()
    }

    #[must_use]
    pub fn dilation(mut self, dilation_y: usize, dilation_x: usize) -> Self {
        self.dilation_y = dilation_y;
        self.dilation_x = dilation_x;
        self.update_dst()
    }

    /// Paddings in top, left, bottom, right order.
    #[must_use]
    pub fn pad(mut self, pad_y: usize, pad_x: usize, pad_h: usize, pad_w: usize) -> Self {
        self.pad_y = pad_y;
        self.pad_x = pad_x;
        self.pad_h = pad_h;
        self.pad_w = pad_w;
        self.update_dst()
    }

    #[must_use]
    pub fn activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    #[must_use]
    pub fn src_type(mut self, src_t: TensorType) -> Self {
        self.src_t = src_t;
        self
    }

    #[must_use]
    pub fn dst_type(mut self, dst_t: TensorType) -> Self {
        self.dst_t = dst_t;
        self
    }

    fn update_dst(mut self) -> Self {
        let extent = |size: usize, pad: usize, kernel: usize, dilation: usize, stride: usize| {
            let window = (kernel.max(1) - 1) * dilation + 1;
            (size + pad)
                .checked_sub(window)
                .map_or(0, |free| free / stride.max(1) + 1)
        };
        self.dst_h = extent(
            self.src_h,
            self.pad_y + self.pad_h,
            self.kernel_y,
            self.dilation_y,
            self.stride_y,
        );
        self.dst_w = extent(
            self.src_w,
            self.pad_x + self.pad_w,
            self.kernel_x,
            self.dilation_x,
            self.stride_x,
        );
        self
    }

    pub fn validate(&self, index: usize) -> Result<()> {
        let fail = |reason| Err(Error::InvalidConvolution { index, reason });
        if self.src_c == 0 || self.src_h == 0 || self.src_w == 0 || self.dst_c == 0 {
            return fail("zero sized tensor");
        }
        if self.kernel_y == 0 || self.kernel_x == 0 {
            return fail("zero sized kernel");
        }
        if self.stride_y == 0 || self.stride_x == 0 || self.dilation_y == 0 || self.dilation_x == 0 {
            return fail("zero stride or dilation");
        }
        if self.dst_h == 0 || self.dst_w == 0 || *self != self.update_dst() {
            return fail("destination size does not match the window");
        }
        if self.group != 1 && !(self.group == self.src_c && self.dst_c == self.src_c) {
            return fail("group must be 1 or equal to the channel count");
        }
        Ok(())
    }

    pub fn is_depthwise(&self) -> bool {
        self.group != 1 && self.group == self.src_c && self.group == self.dst_c
    }

    pub fn is_kernel(&self, k: usize) -> bool {
        self.kernel_y == k && self.kernel_x == k
    }

    pub fn is_dilation(&self, d: usize) -> bool {
        self.dilation_y == d && self.dilation_x == d
    }

    pub fn is_stride(&self, s: usize) -> bool {
        self.stride_y == s && self.stride_x == s
    }

    pub fn is_pad(&self, p: usize) -> bool {
        self.pad_y == p && self.pad_x == p && self.pad_h == p && self.pad_w == p
    }

    pub fn is_1x1(&self) -> bool {
        self.is_kernel(1) && self.is_dilation(1) && self.is_stride(1) && self.is_pad(0)
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_y * self.kernel_x
    }

    /// First output row whose window starts inside the source.
    pub fn nose_h(&self) -> usize {
        self.pad_y.div_ceil(self.stride_y).min(self.dst_h)
    }

    /// First output column whose window starts inside the source.
    pub fn nose_w(&self) -> usize {
        self.pad_x.div_ceil(self.stride_x).min(self.dst_w)
    }

    /// One past the last output row whose window ends inside the source.
    pub fn body_h(&self) -> usize {
        let reach = (self.kernel_y - 1) * self.dilation_y + 1;
        match (self.pad_y + self.src_h).checked_sub(reach) {
            Some(free) => (free / self.stride_y + 1).clamp(self.nose_h(), self.dst_h),
            None => self.nose_h(),
        }
    }

    /// One past the last output column whose window ends inside the source.
    pub fn body_w(&self) -> usize {
        let reach = (self.kernel_x - 1) * self.dilation_x + 1;
        match (self.pad_x + self.src_w).checked_sub(reach) {
            Some(free) => (free / self.stride_x + 1).clamp(self.nose_w(), self.dst_w),
            None => self.nose_w(),
        }
    }

    pub fn src_size(&self) -> usize {
        self.src_h * self.src_w * self.src_c
    }

    pub fn dst_size(&self) -> usize {
        self.dst_h * self.dst_w * self.dst_c
    }
}

/// A depthwise-separable block of two or three convolutions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergConvParam {
    pub batch: usize,
    pub conv: Vec<ConvParam>,
    pub compatibility: Compatibility,
}

impl MergConvParam {
    pub fn new(batch: usize, convs: &[ConvParam], compatibility: Compatibility) -> Result<Self> {
        let param = Self {
            batch,
            conv: convs.to_vec(),
            compatibility,
        };
        param.validate()?;
        Ok(param)
    }

    pub fn count(&self) -> usize {
        self.conv.len()
    }

    pub fn first(&self) -> &ConvParam {
        &self.conv[0]
    }

    pub fn last(&self) -> &ConvParam {
        &self.conv[self.conv.len() - 1]
    }

    fn validate(&self) -> Result<()> {
        let count = self.conv.len();
        if !(2..=3).contains(&count) {
            return Err(Error::InvalidConvCount(count));
        }
        if self.batch == 0 {
            return Err(Error::InvalidConvolution {
                index: 0,
                reason: "batch must be positive",
            });
        }
        for (index, conv) in self.conv.iter().enumerate() {
            conv.validate(index)?;
            if index > 0 {
                let prev = &self.conv[index - 1];
                if prev.dst_c != conv.src_c || prev.dst_h != conv.src_h || prev.dst_w != conv.src_w {
                    return Err(Error::IncompatibleChain { index });
                }
                if prev.dst_t != TensorType::F32 || conv.src_t != TensorType::F32 {
                    return Err(Error::InvalidConvolution {
                        index,
                        reason: "intermediate tensors must be float",
                    });
                }
            }
        }
        let structure = |index, reason| Err(Error::InvalidConvolution { index, reason });
        if count == 3 {
            if self.conv[0].is_depthwise() {
                return structure(0, "leading convolution of a 3-block must be dense");
            }
            if !self.conv[1].is_depthwise() {
                return structure(1, "middle convolution must be depthwise");
            }
            if self.conv[2].is_depthwise() || !self.conv[2].is_1x1() {
                return structure(2, "trailing convolution must be dense 1x1");
            }
        } else {
            match (self.conv[0].is_depthwise(), self.conv[1].is_depthwise()) {
                (false, true) => {}
                (true, false) => {
                    if !self.conv[1].is_1x1() {
                        return structure(1, "trailing convolution must be dense 1x1");
                    }
                }
                _ => return structure(1, "exactly one convolution must be depthwise"),
            }
        }
        Ok(())
    }
}
