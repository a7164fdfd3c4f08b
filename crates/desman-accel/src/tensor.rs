use desman_core::{DType, Error, HostData, HostTensor, Result, Shape, WithDType};

use crate::device::AccelDevice;
use crate::device::DeviceBuffer;
use crate::event::Event;
use crate::kernels::Kernel;

// DeviceTensor — a tensor resident in accelerator memory
//
// Carries the logical shape plus the padded physical layout: the last
// dimension is rounded up to the port width W, and the padding tail of every
// row is zero-filled. The padding exists only on the device; host-bound
// transfers strip it.
//
// A tensor also carries the completion handle of the operation that last
// wrote it. Reading the tensor (to_host, or as an operand of a later
// dispatch) is only valid once that handle signals; the dispatch machinery
// declares it as a dependency automatically.

/// Round a last dimension up to the nearest multiple of the port width.
pub fn padded_dim(last: usize, port_width: usize) -> usize {
    last.div_ceil(port_width) * port_width
}

/// Pad flat row-major data from `last` to `padded` elements per row,
/// zero-filling each row's tail.
pub fn pad_rows<T: WithDType>(data: &[T], last: usize, padded: usize) -> Vec<T> {
    if last == padded {
        return data.to_vec();
    }
    let rows = if last == 0 { 0 } else { data.len() / last };
    let mut out = Vec::with_capacity(rows * padded);
    for r in 0..rows {
        out.extend_from_slice(&data[r * last..r * last + last]);
        out.resize(out.len() + (padded - last), T::zero());
    }
    out
}

/// Drop the padding tail of every row, the exact inverse of [`pad_rows`].
pub fn strip_rows<T: WithDType>(data: &[T], padded: usize, last: usize) -> Vec<T> {
    if last == padded {
        return data.to_vec();
    }
    let rows = if padded == 0 { 0 } else { data.len() / padded };
    let mut out = Vec::with_capacity(rows * last);
    for r in 0..rows {
        out.extend_from_slice(&data[r * padded..r * padded + last]);
    }
    out
}

/// A tensor resident in one bank of accelerator memory.
///
/// Clones share the physical bytes; the buffer is freed when the last
/// handle (including any bookkeeping-registry entry) drops.
#[derive(Clone)]
pub struct DeviceTensor {
    buffer: DeviceBuffer,
    shape: Shape,
    padded_last: usize,
    event: Event,
    tag: Option<String>,
}

impl DeviceTensor {
    /// Upload a host tensor into `bank`, padding each row to the port width.
    /// The write is enqueued asynchronously; the returned tensor's event
    /// signals when it lands.
    pub fn from_host(device: &AccelDevice, host: &HostTensor, bank: usize) -> Result<Self> {
        host.shape().check_operand()?;
        let last = host.shape().last_dim();
        let padded_last = padded_dim(last, device.port_width());
        let plen = host.shape().row_count() * padded_last;
        let buffer = device.alloc(bank, host.dtype(), plen)?;
        let padded = match host.data() {
            HostData::F32(v) => HostData::F32(pad_rows(v, last, padded_last)),
            HostData::U32(v) => HostData::U32(pad_rows(v, last, padded_last)),
        };
        let tensor = DeviceTensor {
            buffer,
            shape: host.shape().clone(),
            padded_last,
            event: Event::ready(),
            tag: None,
        };
        let done = device.submit_simple(
            Kernel::HostWrite {
                dst: tensor.clone(),
                data: padded,
            },
            Vec::new(),
        );
        Ok(tensor.with_event(done))
    }

    /// Allocate a tensor and enqueue an asynchronous zero-fill. This is the
    /// non-blocking fast path for scratch buffers: the caller must not read
    /// or overwrite the tensor before its event signals.
    pub fn zeros(
        device: &AccelDevice,
        shape: impl Into<Shape>,
        dtype: DType,
        bank: usize,
    ) -> Result<Self> {
        let shape = shape.into();
        shape.check_operand()?;
        let padded_last = padded_dim(shape.last_dim(), device.port_width());
        let plen = shape.row_count() * padded_last;
        let buffer = device.alloc(bank, dtype, plen)?;
        let tensor = DeviceTensor {
            buffer,
            shape,
            padded_last,
            event: Event::ready(),
            tag: None,
        };
        let done = device.submit_simple(
            Kernel::ZeroFill {
                dst: tensor.clone(),
            },
            Vec::new(),
        );
        Ok(tensor.with_event(done))
    }

    /// An uninitialized tensor: the empty-shape sentinel. Readback fails
    /// until the handle is replaced by a real tensor.
    pub fn uninit(device: &AccelDevice) -> Result<Self> {
        let buffer = device.alloc(0, DType::F32, 0)?;
        Ok(DeviceTensor {
            buffer,
            shape: Shape::empty(),
            padded_last: 0,
            event: Event::ready(),
            tag: None,
        })
    }

    /// Blocking readback: waits for the last write, copies the padded bytes
    /// out, strips the per-row padding tail, and rebuilds a host tensor with
    /// the logical shape.
    pub fn to_host(&self) -> Result<HostTensor> {
        if self.shape.is_empty() {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(1),
                got: Shape::empty(),
            });
        }
        self.event.wait();
        let last = self.shape.last_dim();
        match self.buffer.snapshot() {
            HostData::F32(v) => {
                HostTensor::from_f32(strip_rows(&v, self.padded_last, last), self.shape.clone())
            }
            HostData::U32(v) => {
                HostTensor::from_u32(strip_rows(&v, self.padded_last, last), self.shape.clone())
            }
        }
    }

    /// The logical shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    pub fn bank(&self) -> usize {
        self.buffer.bank()
    }

    /// Completion handle of the operation that last wrote this tensor.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// The padded physical shape: logical shape with the last dimension
    /// rounded up to the port width.
    pub fn physical_shape(&self) -> Shape {
        self.shape.with_last_dim(self.padded_last)
    }

    /// Element count of the physical storage (rows × padded last dim).
    pub fn physical_len(&self) -> usize {
        self.shape.row_count() * self.padded_last
    }

    /// Padded size of the last dimension.
    pub fn padded_last(&self) -> usize {
        self.padded_last
    }

    /// Diagnostic tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Attach a diagnostic tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Whether two handles refer to the same physical bytes. The identity
    /// fast path of bank crossing preserves this.
    pub fn shares_buffer(&self, other: &DeviceTensor) -> bool {
        self.buffer.shares_storage(&other.buffer)
    }

    pub(crate) fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub(crate) fn from_parts(
        buffer: DeviceBuffer,
        shape: Shape,
        padded_last: usize,
        event: Event,
    ) -> Self {
        DeviceTensor {
            buffer,
            shape,
            padded_last,
            event,
            tag: None,
        }
    }

    pub(crate) fn with_event(mut self, event: Event) -> Self {
        self.event = event;
        self
    }

    /// The same bytes under a different logical shape. Rank normalization
    /// only alters leading dimensions, so the last dimension (and with it
    /// the padded layout) must be unchanged.
    pub(crate) fn with_shape(&self, shape: Shape) -> Self {
        debug_assert_eq!(shape.last_dim(), self.shape.last_dim());
        debug_assert_eq!(shape.elem_count(), self.shape.elem_count());
        let mut t = self.clone();
        t.shape = shape;
        t
    }
}

impl std::fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("shape", &self.shape)
            .field("physical", &self.physical_shape())
            .field("dtype", &self.dtype())
            .field("bank", &self.bank())
            .field("tag", &self.tag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccelConfig;

    fn device() -> AccelDevice {
        AccelDevice::new(AccelConfig::default().active_banks(2)).unwrap()
    }

    #[test]
    fn test_padded_dim() {
        assert_eq!(padded_dim(1, 16), 16);
        assert_eq!(padded_dim(16, 16), 16);
        assert_eq!(padded_dim(17, 16), 32);
        assert_eq!(padded_dim(5, 1), 5);
    }

    #[test]
    fn test_pad_strip_rows() {
        let data = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let padded = pad_rows(&data, 3, 8);
        assert_eq!(padded.len(), 16);
        assert_eq!(&padded[..4], &[1.0, 2.0, 3.0, 0.0]);
        assert_eq!(&padded[8..12], &[4.0, 5.0, 6.0, 0.0]);
        assert_eq!(strip_rows(&padded, 8, 3), data);
    }

    #[test]
    fn test_from_host_round_trip() {
        let dev = device();
        let host = HostTensor::from_f32((0..12).map(|v| v as f32).collect(), (3, 4)).unwrap();
        let t = DeviceTensor::from_host(&dev, &host, 1).unwrap();
        assert_eq!(t.bank(), 1);
        assert_eq!(t.physical_shape().dims(), &[3, 16]);
        assert_eq!(t.physical_len(), 48);
        let back = t.to_host().unwrap();
        assert!(desman_core::compare_tensors(&host, &back));
    }

    #[test]
    fn test_from_host_u32_round_trip() {
        let dev = device();
        let host = HostTensor::from_u32(vec![7, 8, 9], 3).unwrap();
        let t = DeviceTensor::from_host(&dev, &host, 0).unwrap();
        let back = t.to_host().unwrap();
        assert!(desman_core::compare_tensors(&host, &back));
    }

    #[test]
    fn test_zeros_fast_path() {
        let dev = device();
        let t = DeviceTensor::zeros(&dev, (2, 5), DType::F32, 0).unwrap();
        t.event().wait();
        let host = t.to_host().unwrap();
        assert_eq!(host.as_f32().unwrap(), &[0.0; 10]);
    }

    #[test]
    fn test_uninit_readback_fails() {
        let dev = device();
        let t = DeviceTensor::uninit(&dev).unwrap();
        assert!(t.to_host().is_err());
    }

    #[test]
    fn test_invalid_bank() {
        let dev = device();
        let host = HostTensor::from_f32(vec![1.0], 1).unwrap();
        assert!(matches!(
            DeviceTensor::from_host(&dev, &host, 5),
            Err(Error::InvalidBank { bank: 5, active: 2 })
        ));
    }
}
