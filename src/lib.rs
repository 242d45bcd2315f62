//! SIMD kernels for quantized neural-network inference and image filtering.
//!
//! - [`MergedConvolution8i`]: a depthwise-separable block (dense, depthwise,
//!   1×1 dense) fused into one pass with int8 arithmetic and small ring
//!   buffers between the stages.
//! - [`RecursiveBilateralFilter`]: an edge-preserving recursive smoothing
//!   filter for u8 images with 1 to 4 channels.
//! - [`QuantizedAdd`] and [`QuantizedScale`]: elementwise operators on
//!   linearly quantized u8 tensors.
//!
//! Kernels are specialized per instruction-set [`Tier`] and picked at
//! construction from runtime CPU detection, or forced through
//! [`KernelConfig`]. Handles are single threaded; share them across threads
//! only for reads.
//!
//! Tensors are NHWC with the channel innermost.

pub mod activation;
pub mod bilateral;
pub mod eltwise;
mod error;
pub mod merged;
pub mod param;
pub mod quant;
pub mod simd;

pub use bilateral::{DiffType, RbfFlags, RbfParam, RecursiveBilateralFilter};
pub use eltwise::{QuantParam, QuantizedAdd, QuantizedScale};
pub use error::{Error, Result};
pub use merged::{ConvWeights, MergedConvolution8i, MergedKind, TensorMut, TensorRef, TensorStats};
pub use param::{ActivationKind, Compatibility, ConvParam, MergConvParam, TensorType};
pub use quant::CvtParam;
pub use simd::{detect, KernelConfig, Tier};
