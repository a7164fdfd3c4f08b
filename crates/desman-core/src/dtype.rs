use std::fmt;

// DType — element types the accelerator understands
//
// The device's memory ports move 32-bit lanes, so exactly two element types
// exist end to end:
//
//   F32 — the compute type for every arithmetic operator
//   U32 — index data (gather tables, classifier outputs)

/// Enum of the supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    U32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        4
    }

    /// Whether this dtype carries floating-point data.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::U32 => "u32",
        };
        write!(f, "{}", s)
    }
}

/// Trait implemented by the Rust types that can live in a tensor.
///
/// Bridges the concrete element type to the runtime [`DType`] tag so generic
/// helpers (padding, file IO, comparisons) can be written once.
pub trait WithDType: Copy + Send + Sync + Default + PartialEq + fmt::Debug + 'static {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// The zero value used to fill padding lanes.
    fn zero() -> Self;

    /// Little-endian byte encoding, for the weight-file format.
    fn to_le_bytes(self) -> [u8; 4];

    /// Inverse of [`to_le_bytes`](WithDType::to_le_bytes).
    fn from_le_bytes(b: [u8; 4]) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn zero() -> Self {
        0.0
    }
    fn to_le_bytes(self) -> [u8; 4] {
        f32::to_le_bytes(self)
    }
    fn from_le_bytes(b: [u8; 4]) -> Self {
        f32::from_le_bytes(b)
    }
}

impl WithDType for u32 {
    const DTYPE: DType = DType::U32;
    fn zero() -> Self {
        0
    }
    fn to_le_bytes(self) -> [u8; 4] {
        u32::to_le_bytes(self)
    }
    fn from_le_bytes(b: [u8; 4]) -> Self {
        u32::from_le_bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::U32.size_in_bytes(), 4);
    }

    #[test]
    fn test_le_roundtrip() {
        let v = 3.25f32;
        assert_eq!(f32::from_le_bytes(v.to_le_bytes()), v);
        let u = 0xdead_beefu32;
        assert_eq!(u32::from_le_bytes(WithDType::to_le_bytes(u)), u);
    }
}
