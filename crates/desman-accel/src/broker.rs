use desman_core::{DType, Error, Result};

use crate::device::{AccelDevice, DeviceBuffer};
use crate::event::Event;
use crate::kernels::Kernel;
use crate::tensor::DeviceTensor;

// BankBroker — moves tensors between memory banks
//
// The board's four-way wiring routes every crossing through a fixed relay
// buffer in the destination bank, and requires a placeholder buffer to be
// wired up for every bank whether or not it participates in a given
// transfer. The placeholders are allocated once at bring-up, sized from
// configuration; their capacity bounds the largest tensor that can cross.

/// Broker for bank-to-bank transfers. One per dispatcher, built at
/// device bring-up.
pub struct BankBroker {
    device: AccelDevice,
    /// One relay placeholder per active bank, `crossing_capacity` lanes each.
    relays: Vec<DeviceBuffer>,
    capacity: usize,
    log_crossings: bool,
}

impl BankBroker {
    pub fn new(device: &AccelDevice) -> Result<Self> {
        let capacity = device.config().crossing_capacity;
        let relays = (0..device.active_banks())
            .map(|bank| device.alloc(bank, DType::U32, capacity))
            .collect::<Result<Vec<_>>>()?;
        Ok(BankBroker {
            device: device.clone(),
            relays,
            capacity,
            log_crossings: device.config().log_crossings,
        })
    }

    /// Largest physical length (in lanes) a single crossing can move.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Produce an equivalent tensor resident in `dest`.
    ///
    /// Identity fast path: a tensor already resident in `dest` is returned
    /// unchanged (same buffer, same event) — callers must not assume a new
    /// object. Otherwise the broker allocates fresh storage in `dest` and
    /// enqueues a relay transfer of exactly the physical length, dependent
    /// on the source's completion handle.
    pub fn cross_to_bank(&self, tensor: &DeviceTensor, dest: usize) -> Result<DeviceTensor> {
        self.device.check_bank(tensor.bank())?;
        self.device.check_bank(dest)?;
        if tensor.bank() == dest {
            return Ok(tensor.clone());
        }
        let lanes = tensor.physical_len();
        if lanes > self.capacity {
            return Err(Error::CapacityExceeded {
                needed: lanes,
                capacity: self.capacity,
            });
        }
        if self.log_crossings {
            log::debug!(
                "bank crossing: {} -> {} ({} lane(s), shape {})",
                tensor.bank(),
                dest,
                lanes,
                tensor.shape()
            );
        }
        let buffer = self.device.alloc(dest, tensor.dtype(), lanes)?;
        let out = DeviceTensor::from_parts(
            buffer,
            tensor.shape().clone(),
            tensor.padded_last(),
            Event::ready(),
        );
        let done = self.device.submit_simple(
            Kernel::Relay {
                src: tensor.clone(),
                dst: out.clone(),
                via: self.relays[dest].clone(),
            },
            vec![tensor.event().clone()],
        );
        Ok(out.with_event(done))
    }
}
