//! # desman-core
//!
//! Shared tensor primitives for the Desman accelerator runtime.
//!
//! This crate provides:
//! - [`HostTensor`] — flat row-major tensor data in host memory
//! - [`Shape`] — dimension sizes, rank normalization helpers
//! - [`DType`] / [`WithDType`] — the two supported element types
//! - [`BinOp`] / [`ReduceKind`] / [`ExecKind`] — operator and target tags
//! - [`Error`] / [`Result`] — the runtime-wide error taxonomy

pub mod dtype;
pub mod error;
pub mod host;
pub mod ops;
pub mod shape;

pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use host::{compare_tensors, HostData, HostTensor};
pub use ops::{BinOp, ExecKind, ReduceKind};
pub use shape::{Shape, MAX_RANK};
