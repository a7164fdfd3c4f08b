//! # desman-accel
//!
//! Accelerator runtime for Desman: device bring-up, bank-resident tensors,
//! and the operation dispatcher.
//!
//! This crate provides:
//! - [`AccelDevice`] — device handle with a worker-thread command stream
//! - [`DeviceTensor`] — a tensor resident in one memory bank, row-padded
//!   to the port width
//! - [`BankBroker`] — bank-to-bank transfers through fixed relay buffers
//! - [`Dispatcher`] — operand validation, bank crossing, and kernel launch
//! - [`Event`] — signal-once completion handles with device-side spans
//! - [`InFlightRegistry`] — keeps operand storage alive until completion

pub mod broker;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod event;
mod kernels;
pub mod tensor;

pub use broker::BankBroker;
pub use config::{AccelConfig, BankPlan, MAX_BANKS};
pub use device::{AccelDevice, BankStats, DeviceBuffer};
pub use dispatch::{Dispatcher, InFlightRegistry, KernelRecord, ProfileSink, RuntimeCtx};
pub use event::Event;
pub use tensor::{pad_rows, padded_dim, strip_rows, DeviceTensor};
