use bytes::Bytes;

use crate::manifest::DType;

/// Maximum rank of a tensor exchanged between stages (§6 wire format: "10
/// signed-32-bit shape dimensions padded with zeros").
pub const MAX_SHAPE_DIMS: usize = 10;

/// A tensor payload as it crosses the wire: name (for queue routing on the
/// receive side), element type, shape, and raw bytes in row-major order.
///
/// `Bool` tensors are carried as `DType::Bool` with one byte per element; the
/// 8-bit-signed wire mapping in §6 is purely a transport encoding detail and
/// does not change this representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Bytes,
}

impl Tensor {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<usize>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data,
        }
    }

    /// Number of elements implied by `shape`.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Encode `shape` as the fixed 10-dimension wire vector, zero-padded.
    pub fn encode_shape(shape: &[usize]) -> Result<[i32; MAX_SHAPE_DIMS], ShapeEncodeError> {
        if shape.len() > MAX_SHAPE_DIMS {
            return Err(ShapeEncodeError::TooManyDims(shape.len()));
        }
        let mut out = [0i32; MAX_SHAPE_DIMS];
        for (i, &dim) in shape.iter().enumerate() {
            if dim == 0 {
                return Err(ShapeEncodeError::ZeroDim);
            }
            out[i] = dim as i32;
        }
        Ok(out)
    }

    /// Decode the fixed 10-dimension wire vector back into a shape, taking
    /// the non-zero prefix.
    pub fn decode_shape(wire: &[i32; MAX_SHAPE_DIMS]) -> Vec<usize> {
        wire.iter()
            .take_while(|&&d| d != 0)
            .map(|&d| d as usize)
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShapeEncodeError {
    #[error("shape has {0} dimensions, exceeding the wire limit of {MAX_SHAPE_DIMS}")]
    TooManyDims(usize),
    #[error("shape contains a zero dimension")]
    ZeroDim,
}
