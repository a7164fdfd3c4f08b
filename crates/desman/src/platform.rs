use std::sync::Arc;

use desman_accel::{AccelConfig, AccelDevice, DeviceTensor, Dispatcher, ProfileSink, RuntimeCtx};
use desman_core::{BinOp, DType, Error, ExecKind, HostTensor, ReduceKind, Result, Shape};

use crate::cpu;
use crate::trace::TraceRecorder;

// Platform dispatcher
//
// The one entry point callers interact with. Each operator invocation opens
// a logical layer, routes to the operator set selected by the target
// execution kind, and kind-crosses operands that live on the other side:
// local operands are uploaded into the accelerator's io bank, accelerator
// operands are read back with a blocking transfer.

/// A tensor handle tagged with where it lives.
#[derive(Debug, Clone)]
pub enum Value {
    Host(HostTensor),
    Device(DeviceTensor),
}

impl Value {
    pub fn kind(&self) -> ExecKind {
        match self {
            Value::Host(_) => ExecKind::Local,
            Value::Device(_) => ExecKind::Accel,
        }
    }

    pub fn shape(&self) -> &Shape {
        match self {
            Value::Host(t) => t.shape(),
            Value::Device(t) => t.shape(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Value::Host(t) => t.dtype(),
            Value::Device(t) => t.dtype(),
        }
    }

    /// Kind crossing toward the host: identity for host values, a blocking
    /// readback for device values.
    pub fn to_host(&self) -> Result<HostTensor> {
        match self {
            Value::Host(t) => Ok(t.clone()),
            Value::Device(t) => t.to_host(),
        }
    }

    /// Block until the value is safe to read. Host values always are.
    pub fn wait(&self) {
        if let Value::Device(t) = self {
            t.event().wait();
        }
    }
}

impl From<HostTensor> for Value {
    fn from(t: HostTensor) -> Self {
        Value::Host(t)
    }
}

impl From<DeviceTensor> for Value {
    fn from(t: DeviceTensor) -> Self {
        Value::Device(t)
    }
}

/// The operator surface, implemented once per execution kind.
pub trait TensorOps {
    fn kind(&self) -> ExecKind;
    fn binary(&self, op: BinOp, a: &Value, b: &Value) -> Result<Value>;
    fn binary_scalar(&self, op: BinOp, a: &Value, scalar: f32) -> Result<Value>;
    fn matmul(&self, a: &Value, b: &Value) -> Result<Value>;
    fn conv2d(&self, input: &Value, weight: &Value) -> Result<Value>;
    fn reduce(&self, kind: ReduceKind, t: &Value, mask: &[bool]) -> Result<Value>;
    fn gather(&self, table: &Value, indices: &Value) -> Result<Value>;
    fn tile(&self, t: &Value, count: usize) -> Result<Value>;
    fn transpose(&self, t: &Value) -> Result<Value>;
    fn top_k(&self, t: &Value, k: usize) -> Result<Value>;
    fn pad_last(&self, t: &Value, target: usize) -> Result<Value>;
    fn unpad_last(&self, t: &Value, target: usize) -> Result<Value>;
    fn concat(&self, a: &Value, b: &Value) -> Result<Value>;
}

// CpuOps

/// Local operator set over host tensors.
pub struct CpuOps;

impl CpuOps {
    fn local(v: &Value) -> Result<HostTensor> {
        v.to_host()
    }
}

impl TensorOps for CpuOps {
    fn kind(&self) -> ExecKind {
        ExecKind::Local
    }

    fn binary(&self, op: BinOp, a: &Value, b: &Value) -> Result<Value> {
        Ok(cpu::binary(op, &Self::local(a)?, &Self::local(b)?)?.into())
    }

    fn binary_scalar(&self, op: BinOp, a: &Value, scalar: f32) -> Result<Value> {
        Ok(cpu::binary_scalar(op, &Self::local(a)?, scalar)?.into())
    }

    fn matmul(&self, a: &Value, b: &Value) -> Result<Value> {
        Ok(cpu::matmul(&Self::local(a)?, &Self::local(b)?)?.into())
    }

    fn conv2d(&self, input: &Value, weight: &Value) -> Result<Value> {
        Ok(cpu::conv2d(&Self::local(input)?, &Self::local(weight)?)?.into())
    }

    fn reduce(&self, kind: ReduceKind, t: &Value, mask: &[bool]) -> Result<Value> {
        Ok(cpu::reduce(kind, &Self::local(t)?, mask)?.into())
    }

    fn gather(&self, table: &Value, indices: &Value) -> Result<Value> {
        Ok(cpu::gather(&Self::local(table)?, &Self::local(indices)?)?.into())
    }

    fn tile(&self, t: &Value, count: usize) -> Result<Value> {
        Ok(cpu::tile(&Self::local(t)?, count)?.into())
    }

    fn transpose(&self, t: &Value) -> Result<Value> {
        Ok(cpu::transpose(&Self::local(t)?)?.into())
    }

    fn top_k(&self, t: &Value, k: usize) -> Result<Value> {
        Ok(cpu::top_k(&Self::local(t)?, k)?.into())
    }

    fn pad_last(&self, t: &Value, target: usize) -> Result<Value> {
        Ok(cpu::pad_last(&Self::local(t)?, target)?.into())
    }

    fn unpad_last(&self, t: &Value, target: usize) -> Result<Value> {
        Ok(cpu::unpad_last(&Self::local(t)?, target)?.into())
    }

    fn concat(&self, a: &Value, b: &Value) -> Result<Value> {
        Ok(cpu::concat(&Self::local(a)?, &Self::local(b)?)?.into())
    }
}

// AccelOps

/// Accelerator operator set routed through the operation dispatcher.
pub struct AccelOps {
    dispatcher: Dispatcher,
    io_bank: usize,
}

impl AccelOps {
    fn new(dispatcher: Dispatcher) -> Self {
        let io_bank = dispatcher.device().config().banks.io;
        AccelOps {
            dispatcher,
            io_bank,
        }
    }

    pub fn device(&self) -> &AccelDevice {
        self.dispatcher.device()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Kind crossing toward the accelerator: identity for device values, an
    /// upload into the io bank for host values.
    pub fn resident(&self, v: &Value) -> Result<DeviceTensor> {
        match v {
            Value::Device(t) => Ok(t.clone()),
            Value::Host(t) => DeviceTensor::from_host(self.device(), t, self.io_bank),
        }
    }
}

impl TensorOps for AccelOps {
    fn kind(&self) -> ExecKind {
        ExecKind::Accel
    }

    fn binary(&self, op: BinOp, a: &Value, b: &Value) -> Result<Value> {
        Ok(self
            .dispatcher
            .binary(op, &self.resident(a)?, &self.resident(b)?)?
            .into())
    }

    fn binary_scalar(&self, op: BinOp, a: &Value, scalar: f32) -> Result<Value> {
        Ok(self
            .dispatcher
            .binary_scalar(op, &self.resident(a)?, scalar)?
            .into())
    }

    fn matmul(&self, a: &Value, b: &Value) -> Result<Value> {
        Ok(self
            .dispatcher
            .matmul(&self.resident(a)?, &self.resident(b)?)?
            .into())
    }

    fn conv2d(&self, input: &Value, weight: &Value) -> Result<Value> {
        Ok(self
            .dispatcher
            .conv2d(&self.resident(input)?, &self.resident(weight)?)?
            .into())
    }

    fn reduce(&self, kind: ReduceKind, t: &Value, mask: &[bool]) -> Result<Value> {
        Ok(self.dispatcher.reduce(kind, &self.resident(t)?, mask)?.into())
    }

    fn gather(&self, table: &Value, indices: &Value) -> Result<Value> {
        Ok(self
            .dispatcher
            .gather(&self.resident(table)?, &self.resident(indices)?)?
            .into())
    }

    fn tile(&self, t: &Value, count: usize) -> Result<Value> {
        Ok(self.dispatcher.tile(&self.resident(t)?, count)?.into())
    }

    fn transpose(&self, t: &Value) -> Result<Value> {
        Ok(self.dispatcher.transpose(&self.resident(t)?)?.into())
    }

    fn top_k(&self, t: &Value, k: usize) -> Result<Value> {
        Ok(self.dispatcher.top_k(&self.resident(t)?, k)?.into())
    }

    fn pad_last(&self, t: &Value, target: usize) -> Result<Value> {
        Ok(self.dispatcher.pad_last(&self.resident(t)?, target)?.into())
    }

    fn unpad_last(&self, t: &Value, target: usize) -> Result<Value> {
        Ok(self.dispatcher.unpad_last(&self.resident(t)?, target)?.into())
    }

    fn concat(&self, a: &Value, b: &Value) -> Result<Value> {
        Ok(self
            .dispatcher
            .concat(&self.resident(a)?, &self.resident(b)?)?
            .into())
    }
}

// Platform

/// Runtime facade: routes operator calls to the local or accelerator
/// operator set and tags each invocation as one logical layer.
pub struct Platform {
    ctx: Arc<RuntimeCtx>,
    cpu: CpuOps,
    accel: Option<AccelOps>,
    trace: Option<Arc<TraceRecorder>>,
}

impl Platform {
    /// A host-only platform; accelerator targets are rejected.
    pub fn local() -> Self {
        Platform {
            ctx: Arc::new(RuntimeCtx::new()),
            cpu: CpuOps,
            accel: None,
            trace: None,
        }
    }

    /// Bring up an accelerator and attach both operator sets. When the
    /// configuration enables profiling, a trace recorder is wired in as the
    /// dispatcher's completion sink.
    pub fn with_accel(config: AccelConfig) -> Result<Self> {
        let ctx = Arc::new(RuntimeCtx::new());
        let trace = if config.profiling {
            Some(Arc::new(TraceRecorder::new()))
        } else {
            None
        };
        let device = AccelDevice::new(config)?;
        let sink = trace
            .as_ref()
            .map(|t| t.clone() as Arc<dyn ProfileSink>);
        let dispatcher = Dispatcher::new(&device, ctx.clone(), sink)?;
        Ok(Platform {
            ctx,
            cpu: CpuOps,
            accel: Some(AccelOps::new(dispatcher)),
            trace,
        })
    }

    pub fn ctx(&self) -> &Arc<RuntimeCtx> {
        &self.ctx
    }

    pub fn accel(&self) -> Option<&AccelOps> {
        self.accel.as_ref()
    }

    pub fn trace(&self) -> Option<&Arc<TraceRecorder>> {
        self.trace.as_ref()
    }

    /// The operator set for `target`.
    pub fn ops(&self, target: ExecKind) -> Result<&dyn TensorOps> {
        match target {
            ExecKind::Local => Ok(&self.cpu),
            ExecKind::Accel => match &self.accel {
                Some(ops) => Ok(ops),
                None => Err(Error::msg("no accelerator attached to this platform")),
            },
        }
    }

    /// Wait for all in-flight accelerator work and drop completed
    /// bookkeeping entries. No-op on a host-only platform.
    pub fn drain(&self) {
        if let Some(accel) = &self.accel {
            accel.device().drain();
            accel.dispatcher().registry().sweep_signaled();
        }
    }

    fn layered<F>(&self, name: &str, operands: &[&Value], f: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        let layer = self.ctx.begin_layer();
        if let Some(trace) = &self.trace {
            let shapes = operands.iter().map(|v| v.shape().clone()).collect();
            trace.begin_layer(layer, name, shapes);
        }
        let result = f();
        if let Some(trace) = &self.trace {
            trace.end_layer(layer);
        }
        result
    }

    pub fn binary(&self, target: ExecKind, op: BinOp, a: &Value, b: &Value) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered(op.name(), &[a, b], || ops.binary(op, a, b))
    }

    pub fn binary_scalar(
        &self,
        target: ExecKind,
        op: BinOp,
        a: &Value,
        scalar: f32,
    ) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered(op.name(), &[a], || ops.binary_scalar(op, a, scalar))
    }

    pub fn matmul(&self, target: ExecKind, a: &Value, b: &Value) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered("matmul", &[a, b], || ops.matmul(a, b))
    }

    pub fn conv2d(&self, target: ExecKind, input: &Value, weight: &Value) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered("conv2d", &[input, weight], || ops.conv2d(input, weight))
    }

    pub fn reduce(
        &self,
        target: ExecKind,
        kind: ReduceKind,
        t: &Value,
        mask: &[bool],
    ) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered(kind.name(), &[t], || ops.reduce(kind, t, mask))
    }

    pub fn gather(&self, target: ExecKind, table: &Value, indices: &Value) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered("gather", &[table, indices], || ops.gather(table, indices))
    }

    pub fn tile(&self, target: ExecKind, t: &Value, count: usize) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered("tile", &[t], || ops.tile(t, count))
    }

    pub fn transpose(&self, target: ExecKind, t: &Value) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered("transpose", &[t], || ops.transpose(t))
    }

    pub fn top_k(&self, target: ExecKind, t: &Value, k: usize) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered("top_k", &[t], || ops.top_k(t, k))
    }

    pub fn pad_last(&self, target: ExecKind, t: &Value, to: usize) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered("pad", &[t], || ops.pad_last(t, to))
    }

    pub fn unpad_last(&self, target: ExecKind, t: &Value, to: usize) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered("unpad", &[t], || ops.unpad_last(t, to))
    }

    pub fn concat(&self, target: ExecKind, a: &Value, b: &Value) -> Result<Value> {
        let ops = self.ops(target)?;
        self.layered("concat", &[a, b], || ops.concat(a, b))
    }
}
