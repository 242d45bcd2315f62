//! Error type shared by every kernel handle in the crate.

use thiserror::Error;

/// Errors reported by the merged convolution, bilateral filter and
/// quantized elementwise handles.
///
/// Configuration errors come out of constructors; call-contract errors come
/// out of `set_params`, `forward` and `run`. Nothing is reported from inside
/// the row loops.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("merged convolution needs 2 or 3 convolutions, got {0}")]
    InvalidConvCount(usize),
    #[error("convolution {index} is malformed: {reason}")]
    InvalidConvolution { index: usize, reason: &'static str },
    #[error("convolution {index} does not chain onto the previous one")]
    IncompatibleChain { index: usize },
    #[error("unsupported channel count {0}, expected 1..=4")]
    InvalidChannels(usize),
    #[error("image dimensions {width}x{height} are invalid")]
    InvalidImageSize { width: usize, height: usize },
    #[error("sigma values must be finite and positive")]
    InvalidSigma,
    #[error("quantization parameters are invalid: {0}")]
    InvalidQuantization(&'static str),
    #[error("set_params must be called before forward")]
    ParamsNotSet,
    #[error("{name} has {actual} elements, expected at least {expected}")]
    ParamLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{name} buffer too small: {actual} < {expected}")]
    BufferTooSmall {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{name} tensor has the wrong element type")]
    TensorTypeMismatch { name: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn check_len(name: &'static str, actual: usize, expected: usize) -> Result<()> {
    if actual < expected {
        return Err(Error::ParamLength {
            name,
            expected,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn check_buffer(name: &'static str, actual: usize, expected: usize) -> Result<()> {
    if actual < expected {
        return Err(Error::BufferTooSmall {
            name,
            expected,
            actual,
        });
    }
    Ok(())
}
