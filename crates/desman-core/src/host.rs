use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::shape::Shape;

// HostTensor — a tensor resident in host memory
//
// Plain owned data: a flat, contiguous, row-major buffer plus its shape.
// Host tensors never carry padding; the port-width padding scheme exists
// only on the accelerator side and is stripped on every host-bound transfer.

/// Flat element storage for a host tensor, one variant per [`DType`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    U32(Vec<u32>),
}

impl HostData {
    pub fn dtype(&self) -> DType {
        match self {
            HostData::F32(_) => DType::F32,
            HostData::U32(_) => DType::U32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostData::F32(v) => v.len(),
            HostData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A tensor in host memory: flat row-major data plus a logical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    data: HostData,
    shape: Shape,
}

impl HostTensor {
    /// Create an f32 tensor from a flat vec. The element count must match
    /// the shape's product.
    pub fn from_f32(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        Self::from_data(HostData::F32(data), shape.into())
    }

    /// Create a u32 tensor (index data) from a flat vec.
    pub fn from_u32(data: Vec<u32>, shape: impl Into<Shape>) -> Result<Self> {
        Self::from_data(HostData::U32(data), shape.into())
    }

    fn from_data(data: HostData, shape: Shape) -> Result<Self> {
        shape.check_operand()?;
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(HostTensor { data, shape })
    }

    /// A zero-filled tensor of the given shape and dtype.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        shape.check_operand()?;
        let n = shape.elem_count();
        let data = match dtype {
            DType::F32 => HostData::F32(vec![0.0; n]),
            DType::U32 => HostData::U32(vec![0; n]),
        };
        Ok(HostTensor { data, shape })
    }

    /// A rank-1, single-element f32 tensor. Scalar operands to the operator
    /// surface are passed this way.
    pub fn scalar(v: f32) -> Self {
        HostTensor {
            data: HostData::F32(vec![v]),
            shape: Shape::from(1),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn elem_count(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &HostData {
        &self.data
    }

    /// Borrow the f32 payload, or fail with `DTypeMismatch`.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            HostData::F32(v) => Ok(v),
            HostData::U32(_) => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::U32,
            }),
        }
    }

    /// Borrow the u32 payload, or fail with `DTypeMismatch`.
    pub fn as_u32(&self) -> Result<&[u32]> {
        match &self.data {
            HostData::U32(v) => Ok(v),
            HostData::F32(_) => Err(Error::DTypeMismatch {
                expected: DType::U32,
                got: DType::F32,
            }),
        }
    }

    /// The same data reinterpreted under a new shape with an equal element
    /// count. Used when undoing rank normalization on results.
    pub fn reshaped(mut self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        shape.check_operand()?;
        if shape.elem_count() != self.data.len() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: self.data.len(),
                shape,
            });
        }
        self.shape = shape;
        Ok(self)
    }

    /// Raw little-endian bytes of the payload, generic over the element type.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        fn bytes<T: WithDType>(v: &[T]) -> Vec<u8> {
            let mut out = Vec::with_capacity(v.len() * 4);
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
            out
        }
        match &self.data {
            HostData::F32(v) => bytes(v),
            HostData::U32(v) => bytes(v),
        }
    }
}

/// Exact comparison of two host tensors: same shape, same dtype, and
/// bit-identical elements. This is the check the end-to-end local-vs-
/// accelerator scenarios use, so no tolerance is applied.
pub fn compare_tensors(a: &HostTensor, b: &HostTensor) -> bool {
    if a.shape() != b.shape() || a.dtype() != b.dtype() {
        return false;
    }
    match (a.data(), b.data()) {
        (HostData::F32(x), HostData::F32(y)) => {
            x.iter().zip(y).all(|(p, q)| p.to_bits() == q.to_bits())
        }
        (HostData::U32(x), HostData::U32(y)) => x == y,
        _ => false,
    }
}
