use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use desman_core::{DType, Error, HostData, Result};

use crate::event::Event;
use crate::kernels::{self, Kernel};
use crate::AccelConfig;

// AccelDevice — in-process model of the attached accelerator
//
// One worker thread consumes a command queue in FIFO order: a single command
// stream, enqueue order preserved. Buffers live in numbered banks with
// per-bank byte accounting. Dropping the device closes the queue and joins
// the worker, which drains every outstanding command first.
//
// Per the runtime's error design, anything that goes wrong on the device
// side of the queue is unrecoverable: the worker logs and terminates the
// process rather than leaving a partially-issued command stream behind.

/// Log a device-side failure and terminate. Device state after a failed
/// enqueue or kernel is undefined and cannot be unwound.
pub(crate) fn fatal_device_error(context: &str, err: &Error) -> ! {
    log::error!("fatal device error in {context}: {err}");
    std::process::abort();
}

// Per-bank memory accounting

struct BankCounters {
    used: AtomicUsize,
    peak: AtomicUsize,
    allocs: AtomicU64,
}

/// Snapshot of one bank's allocation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankStats {
    pub bank: usize,
    pub used_bytes: usize,
    pub peak_bytes: usize,
    pub allocs: u64,
}

pub(crate) struct MemoryAccounting {
    banks: Vec<BankCounters>,
}

impl MemoryAccounting {
    fn new(active_banks: usize) -> Self {
        let banks = (0..active_banks)
            .map(|_| BankCounters {
                used: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                allocs: AtomicU64::new(0),
            })
            .collect();
        MemoryAccounting { banks }
    }

    fn reserve(&self, bank: usize, bytes: usize) {
        let c = &self.banks[bank];
        let used = c.used.fetch_add(bytes, Ordering::Relaxed) + bytes;
        c.peak.fetch_max(used, Ordering::Relaxed);
        c.allocs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, bank: usize, bytes: usize) {
        self.banks[bank].used.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn stats(&self) -> Vec<BankStats> {
        self.banks
            .iter()
            .enumerate()
            .map(|(bank, c)| BankStats {
                bank,
                used_bytes: c.used.load(Ordering::Relaxed),
                peak_bytes: c.peak.load(Ordering::Relaxed),
                allocs: c.allocs.load(Ordering::Relaxed),
            })
            .collect()
    }
}

// DeviceBuffer

struct BufferInner {
    id: u64,
    bank: usize,
    dtype: DType,
    len: usize,
    data: Mutex<HostData>,
    accounting: Arc<MemoryAccounting>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.accounting
            .release(self.bank, self.len * self.dtype.size_in_bytes());
    }
}

/// Physical storage for one tensor, resident in a single bank.
///
/// Shared ownership: clones refer to the same bytes. The bank's byte count
/// is released when the last handle drops.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferInner>,
}

impl DeviceBuffer {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn bank(&self) -> usize {
        self.inner.bank
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// Element count of the physical storage.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.inner.len * self.inner.dtype.size_in_bytes()
    }

    /// Whether two handles refer to the same physical bytes.
    pub fn shares_storage(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy the current contents out. Kernels snapshot their inputs so that
    /// no two buffer locks are ever held at once.
    pub(crate) fn snapshot(&self) -> HostData {
        self.inner.data.lock().unwrap().clone()
    }

    /// Replace the contents. The payload must match the buffer's dtype and
    /// physical length exactly.
    pub(crate) fn store(&self, data: HostData) -> Result<()> {
        if data.dtype() != self.inner.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.inner.dtype,
                got: data.dtype(),
            });
        }
        if data.len() != self.inner.len {
            return Err(Error::Device(format!(
                "buffer {} store of {} element(s) into physical length {}",
                self.inner.id,
                data.len(),
                self.inner.len
            )));
        }
        *self.inner.data.lock().unwrap() = data;
        Ok(())
    }

    /// The contents as raw 32-bit lanes, the unit the broker relay moves.
    pub(crate) fn snapshot_raw(&self) -> Vec<u32> {
        match self.snapshot() {
            HostData::F32(v) => v.iter().map(|x| x.to_bits()).collect(),
            HostData::U32(v) => v,
        }
    }

    /// Write raw lanes into the front of the buffer, keeping any tail.
    /// `lanes` must not exceed the physical length.
    pub(crate) fn store_raw(&self, lanes: &[u32]) -> Result<()> {
        if lanes.len() > self.inner.len {
            return Err(Error::Device(format!(
                "buffer {} raw store of {} lane(s) into physical length {}",
                self.inner.id,
                lanes.len(),
                self.inner.len
            )));
        }
        let mut guard = self.inner.data.lock().unwrap();
        match &mut *guard {
            HostData::F32(v) => {
                for (dst, &lane) in v.iter_mut().zip(lanes) {
                    *dst = f32::from_bits(lane);
                }
            }
            HostData::U32(v) => v[..lanes.len()].copy_from_slice(lanes),
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.inner.id)
            .field("bank", &self.inner.bank)
            .field("dtype", &self.inner.dtype)
            .field("len", &self.inner.len)
            .finish()
    }
}

// Command stream

/// One enqueued unit of device work.
pub(crate) struct Command {
    pub kernel: Kernel,
    /// Completion handles that must signal before the kernel starts.
    pub deps: Vec<Event>,
    /// Signaled by the worker once the kernel finishes.
    pub done: Event,
    /// Runs on the worker thread after `done` signals.
    pub callback: Option<Box<dyn FnOnce() + Send>>,
}

fn worker_loop(rx: mpsc::Receiver<Command>) {
    while let Ok(cmd) = rx.recv() {
        for dep in &cmd.deps {
            dep.wait();
        }
        let name = cmd.kernel.name();
        cmd.done.mark_start();
        if let Err(err) = kernels::exec(cmd.kernel) {
            fatal_device_error(name, &err);
        }
        cmd.done.complete();
        if let Some(cb) = cmd.callback {
            cb();
        }
    }
}

// AccelDevice

struct DeviceInner {
    config: AccelConfig,
    accounting: Arc<MemoryAccounting>,
    next_buffer_id: AtomicU64,
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish whatever is queued and
        // exit; joining it is the shutdown drain.
        drop(self.tx.lock().unwrap().take());
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Handle to one accelerator execution context.
///
/// Cloning is cheap and shares the context. The worker thread and command
/// queue live as long as any handle does.
#[derive(Clone)]
pub struct AccelDevice {
    inner: Arc<DeviceInner>,
}

impl AccelDevice {
    /// Bring up a device from a validated configuration.
    pub fn new(config: AccelConfig) -> Result<Self> {
        config.validate()?;
        let accounting = Arc::new(MemoryAccounting::new(config.active_banks));
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("desman-accel".to_string())
            .spawn(move || worker_loop(rx))?;
        log::debug!(
            "device up: image={} banks={} port_width={}",
            config.image,
            config.active_banks,
            config.port_width
        );
        Ok(AccelDevice {
            inner: Arc::new(DeviceInner {
                config,
                accounting,
                next_buffer_id: AtomicU64::new(1),
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn config(&self) -> &AccelConfig {
        &self.inner.config
    }

    pub fn active_banks(&self) -> usize {
        self.inner.config.active_banks
    }

    pub fn port_width(&self) -> usize {
        self.inner.config.port_width
    }

    /// Validate a bank index against the active-bank count.
    pub fn check_bank(&self, bank: usize) -> Result<()> {
        if bank >= self.active_banks() {
            return Err(Error::InvalidBank {
                bank,
                active: self.active_banks(),
            });
        }
        Ok(())
    }

    /// Allocate zero-initialized physical storage in a bank.
    pub(crate) fn alloc(&self, bank: usize, dtype: DType, elems: usize) -> Result<DeviceBuffer> {
        self.check_bank(bank)?;
        let data = match dtype {
            DType::F32 => HostData::F32(vec![0.0; elems]),
            DType::U32 => HostData::U32(vec![0; elems]),
        };
        self.inner
            .accounting
            .reserve(bank, elems * dtype.size_in_bytes());
        Ok(DeviceBuffer {
            inner: Arc::new(BufferInner {
                id: self.inner.next_buffer_id.fetch_add(1, Ordering::Relaxed),
                bank,
                dtype,
                len: elems,
                data: Mutex::new(data),
                accounting: self.inner.accounting.clone(),
            }),
        })
    }

    /// Enqueue a fully built command. A severed command stream is fatal.
    pub(crate) fn submit(&self, cmd: Command) {
        let sent = match &*self.inner.tx.lock().unwrap() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        };
        if !sent {
            fatal_device_error(
                "enqueue",
                &Error::Device("command stream severed".to_string()),
            );
        }
    }

    /// Enqueue a kernel with dependencies and no callback, returning its
    /// completion handle.
    pub(crate) fn submit_simple(&self, kernel: Kernel, deps: Vec<Event>) -> Event {
        let done = Event::new();
        self.submit(Command {
            kernel,
            deps,
            done: done.clone(),
            callback: None,
        });
        done
    }

    /// Block until every command enqueued so far has executed.
    pub fn drain(&self) {
        self.submit_simple(Kernel::Fence, Vec::new()).wait();
    }

    /// Per-bank allocation counters.
    pub fn bank_stats(&self) -> Vec<BankStats> {
        self.inner.accounting.stats()
    }
}

impl std::fmt::Debug for AccelDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelDevice")
            .field("image", &self.inner.config.image)
            .field("active_banks", &self.inner.config.active_banks)
            .field("port_width", &self.inner.config.port_width)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bring_up_and_drain() {
        let dev = AccelDevice::new(AccelConfig::default()).unwrap();
        dev.drain();
        assert_eq!(dev.active_banks(), 4);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(AccelDevice::new(AccelConfig::default().active_banks(9)).is_err());
    }

    #[test]
    fn test_check_bank() {
        let dev = AccelDevice::new(AccelConfig::default().active_banks(2)).unwrap();
        assert!(dev.check_bank(1).is_ok());
        assert!(matches!(
            dev.check_bank(2),
            Err(Error::InvalidBank { bank: 2, active: 2 })
        ));
    }

    #[test]
    fn test_accounting_tracks_alloc_and_drop() {
        let dev = AccelDevice::new(AccelConfig::default().active_banks(2)).unwrap();
        let buf = dev.alloc(1, DType::F32, 100).unwrap();
        let stats = dev.bank_stats();
        assert_eq!(stats[1].used_bytes, 400);
        assert_eq!(stats[1].allocs, 1);
        assert_eq!(stats[0].used_bytes, 0);
        drop(buf);
        let stats = dev.bank_stats();
        assert_eq!(stats[1].used_bytes, 0);
        assert_eq!(stats[1].peak_bytes, 400);
    }

    #[test]
    fn test_buffer_raw_lanes() {
        let dev = AccelDevice::new(AccelConfig::default()).unwrap();
        let buf = dev.alloc(0, DType::F32, 2).unwrap();
        buf.store(HostData::F32(vec![1.5, -2.0])).unwrap();
        let lanes = buf.snapshot_raw();
        assert_eq!(lanes, vec![1.5f32.to_bits(), (-2.0f32).to_bits()]);
        let other = dev.alloc(0, DType::F32, 2).unwrap();
        other.store_raw(&lanes).unwrap();
        assert_eq!(other.snapshot(), HostData::F32(vec![1.5, -2.0]));
    }

    #[test]
    fn test_store_validates_shape_and_dtype() {
        let dev = AccelDevice::new(AccelConfig::default()).unwrap();
        let buf = dev.alloc(0, DType::F32, 2).unwrap();
        assert!(buf.store(HostData::U32(vec![1, 2])).is_err());
        assert!(buf.store(HostData::F32(vec![1.0])).is_err());
        assert!(buf.store_raw(&[0, 0, 0]).is_err());
    }
}
