//! # Desman
//!
//! Host-side runtime for a banked tensor accelerator.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use desman::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `desman-core` | HostTensor, Shape, DType, operator enums, Error |
//! | `desman-accel` | Device model: banks, dispatcher, events, kernels |
//!
//! ## Modules
//!
//! - [`platform`] — `Platform`: routes operators to the local or accelerator path
//! - [`cpu`] — local operator set, bit-identical to the device kernels
//! - [`weights`] — binary weight files, manifests, bank-classified residency
//! - [`trace`] — nested layer/kernel spans and device-time reports
//! - [`sysmon`] — background host CPU load sampling

/// Re-export core types.
pub use desman_core::{
    compare_tensors, BinOp, DType, Error, ExecKind, HostTensor, ReduceKind, Result, Shape,
};

/// Re-export the device runtime.
pub use desman_accel::{
    AccelConfig, AccelDevice, BankPlan, BankStats, DeviceTensor, Event, KernelRecord, ProfileSink,
    MAX_BANKS,
};

/// Local operator set — same math as the device kernels.
pub mod cpu;

/// Platform — operator routing across execution kinds.
pub mod platform;

/// System monitor — host CPU load sampling.
pub mod sysmon;

/// Trace — layer/kernel span recording and reports.
pub mod trace;

/// Weights — binary tensor files, manifests, accelerator residency.
pub mod weights;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::platform::{AccelOps, CpuOps, Platform, TensorOps, Value};
    pub use crate::sysmon::HostLoadSampler;
    pub use crate::trace::{TraceRecorder, TraceReport};
    pub use crate::weights::{load_tensor, save_tensor, WeightStore};
    pub use crate::{
        AccelConfig, BankPlan, BinOp, DType, ExecKind, HostTensor, ReduceKind, Shape,
    };
}
