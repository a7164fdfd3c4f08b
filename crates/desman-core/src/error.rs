use crate::shape::Shape;

/// All errors that can occur within Desman.
///
/// Validation errors (`UnsupportedShape`, `InvalidBank`, `UnknownWeight`,
/// the shape/rank/dtype mismatches) are recoverable at the call site and
/// never disturb device state. `CapacityExceeded` means the static broker
/// sizing is too small for the workload. `Device` is only surfaced for
/// conditions the process can still report on — an unrecoverable device
/// failure goes through the fatal path and terminates instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors, or readback of an uninitialized
    /// tensor (whose shape is the empty sentinel).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operand rank outside the supported [1, max] window.
    #[error("rank mismatch: operator supports rank up to {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors in an operation.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// An operand shape combination the operator does not enumerate.
    /// `constraint` names the precondition that failed.
    #[error("unsupported shape for {op}: {constraint}")]
    UnsupportedShape {
        op: &'static str,
        constraint: String,
    },

    /// Bank index outside [0, active_banks) or disabled by configuration.
    #[error("invalid bank {bank}: device has {active} active bank(s)")]
    InvalidBank { bank: usize, active: usize },

    /// A bank crossing larger than the broker's dummy-buffer capacity.
    /// Static configuration must be resized for the workload.
    #[error("crossing capacity exceeded: tensor needs {needed} elements, broker sized for {capacity}")]
    CapacityExceeded { needed: usize, capacity: usize },

    /// A weight name that was never loaded from the manifest.
    #[error("unknown weight: {name}")]
    UnknownWeight { name: String },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Element count mismatch when creating a tensor from a flat vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// A reportable device-side condition.
    #[error("device error: {0}")]
    Device(String),

    /// IO failure while reading weights or manifests.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Shorthand for an [`UnsupportedShape`](Error::UnsupportedShape) with a
    /// formatted constraint description.
    pub fn unsupported(op: &'static str, constraint: impl Into<String>) -> Self {
        Error::UnsupportedShape {
            op,
            constraint: constraint.into(),
        }
    }
}

/// Convenience Result type used throughout Desman.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
