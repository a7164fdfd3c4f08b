use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use desman_core::{BinOp, DType, Error, ReduceKind, Result, Shape, MAX_RANK};

use crate::broker::BankBroker;
use crate::config::BankPlan;
use crate::device::{AccelDevice, Command};
use crate::event::Event;
use crate::kernels::Kernel;
use crate::tensor::{padded_dim, DeviceTensor};

// Operation dispatch
//
// Every device operator goes through the same sequence:
//
//   1. validate operand ranks/shapes/dtypes
//   2. normalize rank by prepending singleton dimensions up to the
//      operator's working rank (undone on the result)
//   3. bank-cross operands to the operator's configured bank
//   4. allocate the result tensor in that bank
//   5. enqueue the kernel with the crossed operands' events as dependencies
//      under a fresh operation id
//   6. retain {raw operands, crossed operands, result} in the in-flight
//      registry under that id, before the enqueue
//   7. on completion, record device timing into the profiling sink and clear
//      the registry entry (profiling on), or leave the entry for an explicit
//      sweep (profiling off)
//   8. hand the result back at its original rank
//
// Raw operands are retained alongside the crossed copies: a crossing that
// reads the raw operand may still be in flight when dispatch returns.

/// Matmul works on `[batch, n, k]` operands.
const MATMUL_RANK: usize = 3;

// RuntimeCtx

/// Identifier state for one runtime instance: monotonically increasing
/// operation and layer ids. Passed to every dispatcher rather than living
/// in process-wide globals, so independent runtimes can coexist.
pub struct RuntimeCtx {
    next_op: AtomicU64,
    next_layer: AtomicU64,
    current_layer: AtomicU64,
}

impl RuntimeCtx {
    pub fn new() -> Self {
        RuntimeCtx {
            next_op: AtomicU64::new(0),
            next_layer: AtomicU64::new(0),
            current_layer: AtomicU64::new(0),
        }
    }

    /// Claim the next operation id. Ids start at 1.
    pub fn next_op_id(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Open a new logical layer; subsequent dispatches are tagged with it.
    pub fn begin_layer(&self) -> u64 {
        let id = self.next_layer.fetch_add(1, Ordering::Relaxed) + 1;
        self.current_layer.store(id, Ordering::Relaxed);
        id
    }

    /// Layer id dispatches are currently tagged with. 0 before any layer.
    pub fn current_layer(&self) -> u64 {
        self.current_layer.load(Ordering::Relaxed)
    }
}

impl Default for RuntimeCtx {
    fn default() -> Self {
        RuntimeCtx::new()
    }
}

// Profiling sink

/// Completion report for one device kernel, delivered on the worker thread.
#[derive(Debug, Clone)]
pub struct KernelRecord {
    pub op_id: u64,
    pub layer_id: u64,
    /// Stable kernel name, as used in trace span labels.
    pub kernel: &'static str,
    /// Logical shapes of the raw operands, pre-normalization.
    pub shapes: Vec<Shape>,
    /// Scalar parameters, preformatted ("scalar=1.5", "k=3", ...).
    pub params: String,
    /// Device-measured execution span.
    pub device_span: Duration,
}

/// Receiver for kernel completion records. Implemented by the trace
/// recorder; called on the device worker thread, so implementations must
/// not block on dispatch-side locks.
pub trait ProfileSink: Send + Sync {
    fn kernel_complete(&self, record: KernelRecord);
}

// In-flight registry

struct RegistryEntry {
    tensors: Vec<DeviceTensor>,
    done: Event,
}

/// Keeps every tensor an in-flight operation touches alive until that
/// operation completes.
///
/// Inserted into by the dispatching thread and cleared by the completion
/// callback on the worker thread; with profiling off, entries accumulate
/// until the caller sweeps them.
pub struct InFlightRegistry {
    entries: Mutex<HashMap<u64, RegistryEntry>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        InFlightRegistry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn retain(&self, op_id: u64, tensors: Vec<DeviceTensor>, done: Event) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(op_id, RegistryEntry { tensors, done });
    }

    /// Drop the entry for `op_id`, releasing its tensor references.
    /// Returns false if no such entry exists (already cleared).
    pub fn release(&self, op_id: u64) -> bool {
        self.entries.lock().unwrap().remove(&op_id).is_some()
    }

    /// Number of operations still holding references.
    pub fn outstanding(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Ids of all retained operations, ascending.
    pub fn retained(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every entry whose operation has completed. This is the
    /// profiling-off cleanup path; returns the number of entries cleared.
    pub fn sweep_signaled(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| !e.done.is_signaled());
        before - entries.len()
    }
}

impl Default for InFlightRegistry {
    fn default() -> Self {
        InFlightRegistry::new()
    }
}

// Dispatcher

/// Dispatches device operators through the eight-step contract above.
pub struct Dispatcher {
    device: AccelDevice,
    broker: BankBroker,
    ctx: Arc<RuntimeCtx>,
    registry: Arc<InFlightRegistry>,
    sink: Option<Arc<dyn ProfileSink>>,
    plan: BankPlan,
}

fn ensure_f32(t: &DeviceTensor) -> Result<()> {
    if t.dtype() != DType::F32 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: t.dtype(),
        });
    }
    Ok(())
}

/// Undo rank normalization: drop the leading singleton dimensions that were
/// prepended for the working rank. A fully-reduced result keeps shape `[1]`.
fn unnormalized(t: DeviceTensor, added: usize) -> DeviceTensor {
    if added == 0 {
        return t;
    }
    let s = t.shape().lead_squeeze(added);
    let s = if s.is_empty() { Shape::from(1) } else { s };
    t.with_shape(s)
}

impl Dispatcher {
    /// Build a dispatcher over a device. The profiling sink receives kernel
    /// completion records when the device configuration enables profiling.
    pub fn new(
        device: &AccelDevice,
        ctx: Arc<RuntimeCtx>,
        sink: Option<Arc<dyn ProfileSink>>,
    ) -> Result<Self> {
        let broker = BankBroker::new(device)?;
        let sink = if device.config().profiling { sink } else { None };
        Ok(Dispatcher {
            device: device.clone(),
            broker,
            ctx,
            registry: Arc::new(InFlightRegistry::new()),
            sink,
            plan: device.config().banks,
        })
    }

    pub fn device(&self) -> &AccelDevice {
        &self.device
    }

    pub fn broker(&self) -> &BankBroker {
        &self.broker
    }

    pub fn ctx(&self) -> &Arc<RuntimeCtx> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    /// Move a tensor to another bank (see [`BankBroker::cross_to_bank`]).
    pub fn cross_to_bank(&self, tensor: &DeviceTensor, dest: usize) -> Result<DeviceTensor> {
        self.broker.cross_to_bank(tensor, dest)
    }

    fn alloc_result(&self, shape: Shape, dtype: DType, bank: usize) -> Result<DeviceTensor> {
        let padded_last = padded_dim(shape.last_dim(), self.device.port_width());
        let plen = shape.row_count() * padded_last;
        let buffer = self.device.alloc(bank, dtype, plen)?;
        Ok(DeviceTensor::from_parts(
            buffer,
            shape,
            padded_last,
            Event::ready(),
        ))
    }

    /// Steps 5–8: assign an operation id, retain the operand set, enqueue
    /// the kernel with its dependencies, and bind the result to the new
    /// completion handle.
    fn launch(
        &self,
        kernel: Kernel,
        raw: &[&DeviceTensor],
        crossed: Vec<DeviceTensor>,
        result: DeviceTensor,
        params: String,
    ) -> DeviceTensor {
        let op_id = self.ctx.next_op_id();
        let layer_id = self.ctx.current_layer();
        let name = kernel.name();
        let shapes: Vec<Shape> = raw.iter().map(|t| t.shape().clone()).collect();
        let deps: Vec<Event> = crossed.iter().map(|t| t.event().clone()).collect();
        let done = Event::new();

        let mut keep: Vec<DeviceTensor> = raw.iter().map(|&t| t.clone()).collect();
        keep.extend(crossed.iter().cloned());
        keep.push(result.clone());
        self.registry.retain(op_id, keep, done.clone());

        let callback: Option<Box<dyn FnOnce() + Send>> = match &self.sink {
            Some(sink) => {
                let sink = sink.clone();
                let registry = self.registry.clone();
                let ev = done.clone();
                Some(Box::new(move || {
                    sink.kernel_complete(KernelRecord {
                        op_id,
                        layer_id,
                        kernel: name,
                        shapes,
                        params,
                        device_span: ev.span().unwrap_or(Duration::ZERO),
                    });
                    registry.release(op_id);
                }))
            }
            None => None,
        };

        self.device.submit(Command {
            kernel,
            deps,
            done: done.clone(),
            callback,
        });
        result.with_event(done)
    }

    /// Elementwise binary operation on two tensors of identical shape.
    pub fn binary(&self, op: BinOp, a: &DeviceTensor, b: &DeviceTensor) -> Result<DeviceTensor> {
        ensure_f32(a)?;
        ensure_f32(b)?;
        a.shape().check_operand()?;
        if a.shape() != b.shape() {
            return Err(Error::ShapeMismatch {
                expected: a.shape().clone(),
                got: b.shape().clone(),
            });
        }
        let added = MAX_RANK - a.shape().rank();
        let na = a.with_shape(a.shape().lead_expand(MAX_RANK));
        let nb = b.with_shape(b.shape().lead_expand(MAX_RANK));
        let bank = self.plan.elementwise;
        let ca = self.broker.cross_to_bank(&na, bank)?;
        let cb = self.broker.cross_to_bank(&nb, bank)?;
        let result = self.alloc_result(na.shape().clone(), DType::F32, bank)?;
        let kernel = Kernel::Binary {
            op,
            a: ca.clone(),
            b: cb.clone(),
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[a, b], vec![ca, cb], result, String::new());
        Ok(unnormalized(out, added))
    }

    /// Elementwise binary operation against a scalar right-hand side. The
    /// scalar is bound as a kernel parameter at fixed width-1 addressing, not
    /// as a tensor operand.
    pub fn binary_scalar(&self, op: BinOp, a: &DeviceTensor, scalar: f32) -> Result<DeviceTensor> {
        ensure_f32(a)?;
        a.shape().check_operand()?;
        let added = MAX_RANK - a.shape().rank();
        let na = a.with_shape(a.shape().lead_expand(MAX_RANK));
        let bank = self.plan.elementwise;
        let ca = self.broker.cross_to_bank(&na, bank)?;
        let result = self.alloc_result(na.shape().clone(), DType::F32, bank)?;
        let kernel = Kernel::BinaryScalar {
            op,
            a: ca.clone(),
            scalar,
            dst: result.clone(),
        };
        let out = self.launch(
            kernel,
            &[a],
            vec![ca],
            result,
            format!("scalar={scalar}"),
        );
        Ok(unnormalized(out, added))
    }

    /// Batched matrix multiply: `[batch, n, k] × [batch, k, m]`.
    pub fn matmul(&self, a: &DeviceTensor, b: &DeviceTensor) -> Result<DeviceTensor> {
        ensure_f32(a)?;
        ensure_f32(b)?;
        a.shape().check_operand()?;
        b.shape().check_operand()?;
        let (ra, rb) = (a.shape().rank(), b.shape().rank());
        if ra < 2 || ra > MATMUL_RANK {
            return Err(Error::unsupported(
                "matmul",
                format!("lhs rank must be 2 or 3, got {ra}"),
            ));
        }
        if rb < 2 || rb > MATMUL_RANK {
            return Err(Error::unsupported(
                "matmul",
                format!("rhs rank must be 2 or 3, got {rb}"),
            ));
        }
        let added = MATMUL_RANK - ra.max(rb);
        let na = a.with_shape(a.shape().lead_expand(MATMUL_RANK));
        let nb = b.with_shape(b.shape().lead_expand(MATMUL_RANK));
        let (batch, n, k) = (na.shape().dim(0)?, na.shape().dim(1)?, na.shape().dim(2)?);
        let (batch_b, k2, m) = (nb.shape().dim(0)?, nb.shape().dim(1)?, nb.shape().dim(2)?);
        if batch != batch_b {
            return Err(Error::unsupported(
                "matmul",
                format!("batch mismatch: lhs {batch}, rhs {batch_b}"),
            ));
        }
        if k != k2 {
            return Err(Error::unsupported(
                "matmul",
                format!("contraction mismatch: lhs K={k}, rhs K={k2}"),
            ));
        }
        let bank = self.plan.matmul;
        let ca = self.broker.cross_to_bank(&na, bank)?;
        let cb = self.broker.cross_to_bank(&nb, bank)?;
        let result = self.alloc_result(Shape::from((batch, n, m)), DType::F32, bank)?;
        let kernel = Kernel::Matmul {
            a: ca.clone(),
            b: cb.clone(),
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[a, b], vec![ca, cb], result, String::new());
        Ok(unnormalized(out, added))
    }

    /// Valid 2-d convolution, stride 1: input `[b, c, h, w]` (or `[c, h, w]`)
    /// against weights `[oc, c, kh, kw]`.
    pub fn conv2d(&self, input: &DeviceTensor, weight: &DeviceTensor) -> Result<DeviceTensor> {
        ensure_f32(input)?;
        ensure_f32(weight)?;
        input.shape().check_operand()?;
        weight.shape().check_operand()?;
        let ri = input.shape().rank();
        if ri < 3 {
            return Err(Error::unsupported(
                "conv2d",
                format!("input rank must be 3 or 4, got {ri}"),
            ));
        }
        if weight.shape().rank() != 4 {
            return Err(Error::unsupported(
                "conv2d",
                format!("weight rank must be 4, got {}", weight.shape().rank()),
            ));
        }
        let added = MAX_RANK - ri;
        let ni = input.with_shape(input.shape().lead_expand(MAX_RANK));
        let (b, c, h, w) = (
            ni.shape().dim(0)?,
            ni.shape().dim(1)?,
            ni.shape().dim(2)?,
            ni.shape().dim(3)?,
        );
        let (oc, wc, kh, kw) = (
            weight.shape().dim(0)?,
            weight.shape().dim(1)?,
            weight.shape().dim(2)?,
            weight.shape().dim(3)?,
        );
        if c != wc {
            return Err(Error::unsupported(
                "conv2d",
                format!("channel mismatch: input has {c}, weight expects {wc}"),
            ));
        }
        if kh > h || kw > w {
            return Err(Error::unsupported(
                "conv2d",
                format!("kernel {kh}x{kw} larger than input {h}x{w}"),
            ));
        }
        let bank = self.plan.conv;
        let ci = self.broker.cross_to_bank(&ni, bank)?;
        let cw = self.broker.cross_to_bank(weight, bank)?;
        let out_shape = Shape::from((b, oc, h - kh + 1, w - kw + 1));
        let result = self.alloc_result(out_shape, DType::F32, bank)?;
        let kernel = Kernel::Conv2d {
            input: ci.clone(),
            weight: cw.clone(),
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[input, weight], vec![ci, cw], result, String::new());
        Ok(unnormalized(out, added))
    }

    /// Reduce the dimensions flagged in `mask`; they collapse and are
    /// dropped from the result shape. Reducing every dimension yields `[1]`.
    pub fn reduce(
        &self,
        kind: ReduceKind,
        t: &DeviceTensor,
        mask: &[bool],
    ) -> Result<DeviceTensor> {
        ensure_f32(t)?;
        t.shape().check_operand()?;
        if mask.len() != t.shape().rank() {
            return Err(Error::unsupported(
                kind.name(),
                format!(
                    "mask length {} does not match rank {}",
                    mask.len(),
                    t.shape().rank()
                ),
            ));
        }
        if !mask.iter().any(|&f| f) {
            return Err(Error::unsupported(
                kind.name(),
                "no dimensions flagged for reduction",
            ));
        }
        let added = MAX_RANK - t.shape().rank();
        let nt = t.with_shape(t.shape().lead_expand(MAX_RANK));
        let mut mask4 = vec![false; added];
        mask4.extend_from_slice(mask);
        let kept: Vec<usize> = nt
            .shape()
            .dims()
            .iter()
            .zip(&mask4)
            .filter(|(_, &flagged)| !flagged)
            .map(|(&d, _)| d)
            .collect();
        let out_shape = if kept.is_empty() {
            Shape::from(1)
        } else {
            Shape::new(kept)
        };
        let bank = self.plan.elementwise;
        let ct = self.broker.cross_to_bank(&nt, bank)?;
        let result = self.alloc_result(out_shape, DType::F32, bank)?;
        let params = format!(
            "mask={}",
            mask.iter().map(|&f| if f { '1' } else { '0' }).collect::<String>()
        );
        let kernel = Kernel::Reduce {
            kind,
            src: ct.clone(),
            mask: mask4,
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[t], vec![ct], result, params);
        Ok(unnormalized(out, added))
    }

    /// Select rows of `table: [v, d]` by `indices: [n]` into `[n, d]`.
    pub fn gather(&self, table: &DeviceTensor, indices: &DeviceTensor) -> Result<DeviceTensor> {
        ensure_f32(table)?;
        if indices.dtype() != DType::U32 {
            return Err(Error::DTypeMismatch {
                expected: DType::U32,
                got: indices.dtype(),
            });
        }
        table.shape().check_operand()?;
        indices.shape().check_operand()?;
        if table.shape().rank() != 2 {
            return Err(Error::unsupported(
                "gather",
                format!("table rank must be 2, got {}", table.shape().rank()),
            ));
        }
        if indices.shape().rank() != 1 {
            return Err(Error::unsupported(
                "gather",
                format!("indices rank must be 1, got {}", indices.shape().rank()),
            ));
        }
        let bank = self.plan.elementwise;
        let ct = self.broker.cross_to_bank(table, bank)?;
        let ci = self.broker.cross_to_bank(indices, bank)?;
        let out_shape = Shape::from((indices.shape().dim(0)?, table.shape().dim(1)?));
        let result = self.alloc_result(out_shape, DType::F32, bank)?;
        let kernel = Kernel::Gather {
            table: ct.clone(),
            indices: ci.clone(),
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[table, indices], vec![ct, ci], result, String::new());
        Ok(out)
    }

    /// Repeat each row's content `count` times along the last dimension.
    pub fn tile(&self, t: &DeviceTensor, count: usize) -> Result<DeviceTensor> {
        ensure_f32(t)?;
        t.shape().check_operand()?;
        if count == 0 {
            return Err(Error::unsupported("tile", "count must be at least 1"));
        }
        let added = MAX_RANK - t.shape().rank();
        let nt = t.with_shape(t.shape().lead_expand(MAX_RANK));
        let out_shape = nt.shape().with_last_dim(nt.shape().last_dim() * count);
        let bank = self.plan.elementwise;
        let ct = self.broker.cross_to_bank(&nt, bank)?;
        let result = self.alloc_result(out_shape, DType::F32, bank)?;
        let kernel = Kernel::Tile {
            src: ct.clone(),
            count,
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[t], vec![ct], result, format!("count={count}"));
        Ok(unnormalized(out, added))
    }

    /// Swap the last two dimensions.
    pub fn transpose(&self, t: &DeviceTensor) -> Result<DeviceTensor> {
        ensure_f32(t)?;
        t.shape().check_operand()?;
        let rank = t.shape().rank();
        if rank < 2 {
            return Err(Error::unsupported(
                "transpose",
                format!("rank must be at least 2, got {rank}"),
            ));
        }
        let added = MAX_RANK - rank;
        let nt = t.with_shape(t.shape().lead_expand(MAX_RANK));
        let d = nt.shape().dims();
        let out_shape = Shape::new(vec![d[0], d[1], d[3], d[2]]);
        let bank = self.plan.elementwise;
        let ct = self.broker.cross_to_bank(&nt, bank)?;
        let result = self.alloc_result(out_shape, DType::F32, bank)?;
        let kernel = Kernel::Transpose {
            src: ct.clone(),
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[t], vec![ct], result, String::new());
        Ok(unnormalized(out, added))
    }

    /// Largest `k` values per row, descending.
    pub fn top_k(&self, t: &DeviceTensor, k: usize) -> Result<DeviceTensor> {
        ensure_f32(t)?;
        t.shape().check_operand()?;
        let last = t.shape().last_dim();
        if k == 0 || k > last {
            return Err(Error::unsupported(
                "top_k",
                format!("k must be in [1, {last}], got {k}"),
            ));
        }
        let added = MAX_RANK - t.shape().rank();
        let nt = t.with_shape(t.shape().lead_expand(MAX_RANK));
        let out_shape = nt.shape().with_last_dim(k);
        let bank = self.plan.elementwise;
        let ct = self.broker.cross_to_bank(&nt, bank)?;
        let result = self.alloc_result(out_shape, DType::F32, bank)?;
        let kernel = Kernel::TopK {
            src: ct.clone(),
            k,
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[t], vec![ct], result, format!("k={k}"));
        Ok(unnormalized(out, added))
    }

    /// Extend the last dimension to `target` elements, zero-filling.
    pub fn pad_last(&self, t: &DeviceTensor, target: usize) -> Result<DeviceTensor> {
        ensure_f32(t)?;
        t.shape().check_operand()?;
        let last = t.shape().last_dim();
        if target < last {
            return Err(Error::unsupported(
                "pad",
                format!("target {target} smaller than last dimension {last}"),
            ));
        }
        let added = MAX_RANK - t.shape().rank();
        let nt = t.with_shape(t.shape().lead_expand(MAX_RANK));
        let out_shape = nt.shape().with_last_dim(target);
        let bank = self.plan.elementwise;
        let ct = self.broker.cross_to_bank(&nt, bank)?;
        let result = self.alloc_result(out_shape, DType::F32, bank)?;
        let kernel = Kernel::PadLast {
            src: ct.clone(),
            target,
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[t], vec![ct], result, format!("target={target}"));
        Ok(unnormalized(out, added))
    }

    /// Truncate the last dimension to `target` elements.
    pub fn unpad_last(&self, t: &DeviceTensor, target: usize) -> Result<DeviceTensor> {
        ensure_f32(t)?;
        t.shape().check_operand()?;
        let last = t.shape().last_dim();
        if target == 0 || target > last {
            return Err(Error::unsupported(
                "unpad",
                format!("target must be in [1, {last}], got {target}"),
            ));
        }
        let added = MAX_RANK - t.shape().rank();
        let nt = t.with_shape(t.shape().lead_expand(MAX_RANK));
        let out_shape = nt.shape().with_last_dim(target);
        let bank = self.plan.elementwise;
        let ct = self.broker.cross_to_bank(&nt, bank)?;
        let result = self.alloc_result(out_shape, DType::F32, bank)?;
        let kernel = Kernel::UnpadLast {
            src: ct.clone(),
            target,
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[t], vec![ct], result, format!("target={target}"));
        Ok(unnormalized(out, added))
    }

    /// Join two tensors along the last dimension. Every leading dimension
    /// must match; the result's last dimension is the sum of the operands'.
    pub fn concat(&self, a: &DeviceTensor, b: &DeviceTensor) -> Result<DeviceTensor> {
        ensure_f32(a)?;
        ensure_f32(b)?;
        a.shape().check_operand()?;
        b.shape().check_operand()?;
        let (ra, rb) = (a.shape().rank(), b.shape().rank());
        if ra != rb {
            return Err(Error::unsupported(
                "concat",
                format!("rank mismatch: {ra} vs {rb}"),
            ));
        }
        if a.shape().dims()[..ra - 1] != b.shape().dims()[..rb - 1] {
            return Err(Error::unsupported(
                "concat",
                format!(
                    "leading dimensions must match: {} vs {}",
                    a.shape(),
                    b.shape()
                ),
            ));
        }
        let added = MAX_RANK - ra;
        let na = a.with_shape(a.shape().lead_expand(MAX_RANK));
        let nb = b.with_shape(b.shape().lead_expand(MAX_RANK));
        let out_shape = na
            .shape()
            .with_last_dim(na.shape().last_dim() + nb.shape().last_dim());
        let bank = self.plan.elementwise;
        let ca = self.broker.cross_to_bank(&na, bank)?;
        let cb = self.broker.cross_to_bank(&nb, bank)?;
        let result = self.alloc_result(out_shape, DType::F32, bank)?;
        let kernel = Kernel::Concat {
            a: ca.clone(),
            b: cb.clone(),
            dst: result.clone(),
        };
        let out = self.launch(kernel, &[a, b], vec![ca, cb], result, String::new());
        Ok(unnormalized(out, added))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccelConfig;
    use desman_core::HostTensor;

    fn dispatcher() -> Dispatcher {
        let dev = AccelDevice::new(AccelConfig::default().active_banks(2)).unwrap();
        Dispatcher::new(&dev, Arc::new(RuntimeCtx::new()), None).unwrap()
    }

    fn upload(d: &Dispatcher, values: Vec<f32>, shape: impl Into<Shape>) -> DeviceTensor {
        let host = HostTensor::from_f32(values, shape).unwrap();
        DeviceTensor::from_host(d.device(), &host, 0).unwrap()
    }

    #[test]
    fn test_ctx_ids_are_monotonic() {
        let ctx = RuntimeCtx::new();
        assert_eq!(ctx.current_layer(), 0);
        assert_eq!(ctx.next_op_id(), 1);
        assert_eq!(ctx.next_op_id(), 2);
        assert_eq!(ctx.begin_layer(), 1);
        assert_eq!(ctx.current_layer(), 1);
    }

    #[test]
    fn test_registry_retain_release() {
        let d = dispatcher();
        let t = upload(&d, vec![1.0, 2.0], 2);
        let reg = InFlightRegistry::new();
        reg.retain(7, vec![t], Event::ready());
        assert_eq!(reg.outstanding(), 1);
        assert_eq!(reg.retained(), vec![7]);
        assert!(reg.release(7));
        assert!(!reg.release(7));
        assert_eq!(reg.outstanding(), 0);
    }

    #[test]
    fn test_registry_sweep_signaled() {
        let d = dispatcher();
        let t = upload(&d, vec![1.0], 1);
        let reg = InFlightRegistry::new();
        let pending = Event::new();
        reg.retain(1, vec![t.clone()], Event::ready());
        reg.retain(2, vec![t], pending.clone());
        assert_eq!(reg.sweep_signaled(), 1);
        assert_eq!(reg.retained(), vec![2]);
        pending.mark_start();
        pending.complete();
        assert_eq!(reg.sweep_signaled(), 1);
        assert_eq!(reg.outstanding(), 0);
    }

    #[test]
    fn test_binary_shape_mismatch() {
        let d = dispatcher();
        let a = upload(&d, vec![1.0, 2.0], 2);
        let b = upload(&d, vec![1.0, 2.0], (1, 2));
        assert!(matches!(
            d.binary(BinOp::Add, &a, &b),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_matmul_contraction_mismatch() {
        let d = dispatcher();
        let a = upload(&d, vec![0.0; 6], (2, 3));
        let b = upload(&d, vec![0.0; 8], (4, 2));
        assert!(matches!(
            d.matmul(&a, &b),
            Err(Error::UnsupportedShape { op: "matmul", .. })
        ));
    }

    #[test]
    fn test_reduce_mask_validation() {
        let d = dispatcher();
        let t = upload(&d, vec![1.0, 2.0, 3.0, 4.0], (2, 2));
        assert!(d.reduce(ReduceKind::Sum, &t, &[true]).is_err());
        assert!(d.reduce(ReduceKind::Sum, &t, &[false, false]).is_err());
    }

    #[test]
    fn test_top_k_bounds() {
        let d = dispatcher();
        let t = upload(&d, vec![1.0, 2.0, 3.0], 3);
        assert!(d.top_k(&t, 0).is_err());
        assert!(d.top_k(&t, 4).is_err());
    }

    #[test]
    fn test_registry_kept_until_sweep_without_profiling() {
        let d = dispatcher();
        let a = upload(&d, vec![1.0, 2.0], 2);
        let out = d.binary_scalar(BinOp::Add, &a, 1.0).unwrap();
        assert_eq!(d.registry().outstanding(), 1);
        out.event().wait();
        assert_eq!(d.registry().sweep_signaled(), 1);
        assert_eq!(d.registry().outstanding(), 0);
    }
}
