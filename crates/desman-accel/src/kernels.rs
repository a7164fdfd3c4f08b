use desman_core::{BinOp, DType, Error, HostData, ReduceKind, Result};

use crate::device::DeviceBuffer;
use crate::tensor::{pad_rows, strip_rows, DeviceTensor};

// Device kernels
//
// Each kernel is an opaque routine with a fixed input/output contract: it
// reads already-validated operands at their working rank and writes the
// whole result buffer. Shape checking happens at dispatch time on the host;
// a violated contract here means the command stream is corrupt, which the
// worker treats as fatal.
//
// Inputs are snapshotted before any output lock is taken, so no two buffer
// locks are ever held at once. Accumulation order is fixed (row-major source
// order; ascending contraction index) so results are reproducible bit for
// bit across runs and against the local operator set.

/// One unit of device work, bound to its operand and result tensors.
pub(crate) enum Kernel {
    /// No-op used to drain the command stream.
    Fence,
    /// Overwrite the destination with zeros.
    ZeroFill { dst: DeviceTensor },
    /// Land pre-padded host data in the destination buffer.
    HostWrite { dst: DeviceTensor, data: HostData },
    /// Broker hop: move the source's physical lanes into `dst` through the
    /// relay buffer of the destination bank.
    Relay {
        src: DeviceTensor,
        dst: DeviceTensor,
        via: DeviceBuffer,
    },
    Binary {
        op: BinOp,
        a: DeviceTensor,
        b: DeviceTensor,
        dst: DeviceTensor,
    },
    BinaryScalar {
        op: BinOp,
        a: DeviceTensor,
        scalar: f32,
        dst: DeviceTensor,
    },
    /// `[batch, n, k] × [batch, k, m] -> [batch, n, m]`.
    Matmul {
        a: DeviceTensor,
        b: DeviceTensor,
        dst: DeviceTensor,
    },
    /// Valid convolution, stride 1: `[b, c, h, w] * [oc, c, kh, kw]`.
    Conv2d {
        input: DeviceTensor,
        weight: DeviceTensor,
        dst: DeviceTensor,
    },
    /// Collapse the dimensions flagged in `mask`; they are dropped from the
    /// result shape.
    Reduce {
        kind: ReduceKind,
        src: DeviceTensor,
        mask: Vec<bool>,
        dst: DeviceTensor,
    },
    /// `table: [v, d]` rows selected by `indices: [n]` -> `[n, d]`.
    Gather {
        table: DeviceTensor,
        indices: DeviceTensor,
        dst: DeviceTensor,
    },
    /// Repeat each row's content `count` times along the last dimension.
    Tile {
        src: DeviceTensor,
        count: usize,
        dst: DeviceTensor,
    },
    /// Swap the last two dimensions.
    Transpose { src: DeviceTensor, dst: DeviceTensor },
    /// Largest `k` values per row, descending.
    TopK {
        src: DeviceTensor,
        k: usize,
        dst: DeviceTensor,
    },
    /// Extend the last dimension to `target`, zero-filling.
    PadLast {
        src: DeviceTensor,
        target: usize,
        dst: DeviceTensor,
    },
    /// Truncate the last dimension to `target`.
    UnpadLast {
        src: DeviceTensor,
        target: usize,
        dst: DeviceTensor,
    },
    /// Join two tensors along the last dimension.
    Concat {
        a: DeviceTensor,
        b: DeviceTensor,
        dst: DeviceTensor,
    },
}

impl Kernel {
    /// Stable name used in trace spans and fatal-error reports.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Kernel::Fence => "fence",
            Kernel::ZeroFill { .. } => "zero_fill",
            Kernel::HostWrite { .. } => "host_write",
            Kernel::Relay { .. } => "bank_relay",
            Kernel::Binary { op, .. } => op.name(),
            Kernel::BinaryScalar { op, .. } => match op {
                BinOp::Add => "add_scalar",
                BinOp::Sub => "sub_scalar",
                BinOp::Mul => "mul_scalar",
                BinOp::Div => "div_scalar",
            },
            Kernel::Matmul { .. } => "matmul",
            Kernel::Conv2d { .. } => "conv2d",
            Kernel::Reduce { kind, .. } => kind.name(),
            Kernel::Gather { .. } => "gather",
            Kernel::Tile { .. } => "tile",
            Kernel::Transpose { .. } => "transpose",
            Kernel::TopK { .. } => "top_k",
            Kernel::PadLast { .. } => "pad",
            Kernel::UnpadLast { .. } => "unpad",
            Kernel::Concat { .. } => "concat",
        }
    }
}

/// Snapshot a tensor's f32 payload with the padding tail stripped.
fn logical_f32(t: &DeviceTensor) -> Result<Vec<f32>> {
    match t.buffer().snapshot() {
        HostData::F32(v) => Ok(strip_rows(&v, t.padded_last(), t.shape().last_dim())),
        HostData::U32(_) => Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: DType::U32,
        }),
    }
}

fn logical_u32(t: &DeviceTensor) -> Result<Vec<u32>> {
    match t.buffer().snapshot() {
        HostData::U32(v) => Ok(strip_rows(&v, t.padded_last(), t.shape().last_dim())),
        HostData::F32(_) => Err(Error::DTypeMismatch {
            expected: DType::U32,
            got: DType::F32,
        }),
    }
}

/// Re-pad a logical result and land it in the tensor's buffer.
fn write_f32(t: &DeviceTensor, vals: &[f32]) -> Result<()> {
    let padded = pad_rows(vals, t.shape().last_dim(), t.padded_last());
    t.buffer().store(HostData::F32(padded))
}

/// Execute one kernel to completion on the worker thread.
pub(crate) fn exec(kernel: Kernel) -> Result<()> {
    match kernel {
        Kernel::Fence => Ok(()),

        Kernel::ZeroFill { dst } => {
            let n = dst.buffer().len();
            let data = match dst.dtype() {
                DType::F32 => HostData::F32(vec![0.0; n]),
                DType::U32 => HostData::U32(vec![0; n]),
            };
            dst.buffer().store(data)
        }

        Kernel::HostWrite { dst, data } => dst.buffer().store(data),

        Kernel::Relay { src, dst, via } => {
            let lanes = src.buffer().snapshot_raw();
            via.store_raw(&lanes)?;
            let relayed = via.snapshot_raw();
            dst.buffer().store_raw(&relayed[..lanes.len()])
        }

        Kernel::Binary { op, a, b, dst } => {
            let av = logical_f32(&a)?;
            let bv = logical_f32(&b)?;
            let out: Vec<f32> = av.iter().zip(&bv).map(|(&x, &y)| op.apply(x, y)).collect();
            write_f32(&dst, &out)
        }

        Kernel::BinaryScalar { op, a, scalar, dst } => {
            let av = logical_f32(&a)?;
            let out: Vec<f32> = av.iter().map(|&x| op.apply(x, scalar)).collect();
            write_f32(&dst, &out)
        }

        Kernel::Matmul { a, b, dst } => {
            let av = logical_f32(&a)?;
            let bv = logical_f32(&b)?;
            let (batch, n, k) = (a.shape().dim(0)?, a.shape().dim(1)?, a.shape().dim(2)?);
            let m = b.shape().dim(2)?;
            let mut out = vec![0.0f32; batch * n * m];
            for bi in 0..batch {
                let a_base = bi * n * k;
                let b_base = bi * k * m;
                let o_base = bi * n * m;
                for i in 0..n {
                    for j in 0..m {
                        let mut acc = 0.0f32;
                        for p in 0..k {
                            acc += av[a_base + i * k + p] * bv[b_base + p * m + j];
                        }
                        out[o_base + i * m + j] = acc;
                    }
                }
            }
            write_f32(&dst, &out)
        }

        Kernel::Conv2d { input, weight, dst } => {
            let iv = logical_f32(&input)?;
            let wv = logical_f32(&weight)?;
            let (b, c, h, w) = (
                input.shape().dim(0)?,
                input.shape().dim(1)?,
                input.shape().dim(2)?,
                input.shape().dim(3)?,
            );
            let (oc, kh, kw) = (
                weight.shape().dim(0)?,
                weight.shape().dim(2)?,
                weight.shape().dim(3)?,
            );
            let (oh, ow) = (h - kh + 1, w - kw + 1);
            let mut out = vec![0.0f32; b * oc * oh * ow];
            for bi in 0..b {
                for o in 0..oc {
                    for y in 0..oh {
                        for x in 0..ow {
                            let mut acc = 0.0f32;
                            for ci in 0..c {
                                for ky in 0..kh {
                                    for kx in 0..kw {
                                        let iv_idx =
                                            ((bi * c + ci) * h + y + ky) * w + x + kx;
                                        let wv_idx = ((o * c + ci) * kh + ky) * kw + kx;
                                        acc += iv[iv_idx] * wv[wv_idx];
                                    }
                                }
                            }
                            out[((bi * oc + o) * oh + y) * ow + x] = acc;
                        }
                    }
                }
            }
            write_f32(&dst, &out)
        }

        Kernel::Reduce {
            kind,
            src,
            mask,
            dst,
        } => {
            let data = logical_f32(&src)?;
            let dims = src.shape().dims().to_vec();
            let rank = dims.len();
            let mut src_strides = vec![1usize; rank];
            for d in (0..rank.saturating_sub(1)).rev() {
                src_strides[d] = src_strides[d + 1] * dims[d + 1];
            }
            // Stride of each kept dimension in the result; flagged dims
            // contribute nothing.
            let mut dst_strides = vec![0usize; rank];
            let mut stride = 1usize;
            for d in (0..rank).rev() {
                if !mask[d] {
                    dst_strides[d] = stride;
                    stride *= dims[d];
                }
            }
            let n_out = dst.shape().elem_count();
            let init = match kind {
                ReduceKind::Sum | ReduceKind::Mean => 0.0f32,
                ReduceKind::Max => f32::NEG_INFINITY,
            };
            let mut acc = vec![init; n_out];
            for (flat, &v) in data.iter().enumerate() {
                let mut out_idx = 0usize;
                for d in 0..rank {
                    let coord = (flat / src_strides[d]) % dims[d];
                    out_idx += coord * dst_strides[d];
                }
                match kind {
                    ReduceKind::Sum | ReduceKind::Mean => acc[out_idx] += v,
                    ReduceKind::Max => {
                        if v > acc[out_idx] {
                            acc[out_idx] = v;
                        }
                    }
                }
            }
            if kind == ReduceKind::Mean {
                let count: usize = dims
                    .iter()
                    .zip(&mask)
                    .filter(|(_, &flagged)| flagged)
                    .map(|(&d, _)| d)
                    .product();
                let inv = 1.0 / count as f32;
                for a in acc.iter_mut() {
                    *a *= inv;
                }
            }
            write_f32(&dst, &acc)
        }

        Kernel::Gather {
            table,
            indices,
            dst,
        } => {
            let tv = logical_f32(&table)?;
            let idx = logical_u32(&indices)?;
            let rows = table.shape().dim(0)?;
            let d = table.shape().dim(1)?;
            let mut out = Vec::with_capacity(idx.len() * d);
            for &i in &idx {
                let i = i as usize;
                if i >= rows {
                    return Err(Error::Device(format!(
                        "gather index {i} out of range for table with {rows} row(s)"
                    )));
                }
                out.extend_from_slice(&tv[i * d..(i + 1) * d]);
            }
            write_f32(&dst, &out)
        }

        Kernel::Tile { src, count, dst } => {
            let data = logical_f32(&src)?;
            let last = src.shape().last_dim();
            let rows = src.shape().row_count();
            let mut out = Vec::with_capacity(rows * last * count);
            for r in 0..rows {
                let row = &data[r * last..(r + 1) * last];
                for _ in 0..count {
                    out.extend_from_slice(row);
                }
            }
            write_f32(&dst, &out)
        }

        Kernel::Transpose { src, dst } => {
            let data = logical_f32(&src)?;
            let rank = src.shape().rank();
            let r = src.shape().dim(rank - 2)?;
            let c = src.shape().dim(rank - 1)?;
            let batches = src.shape().elem_count() / (r * c);
            let mut out = Vec::with_capacity(data.len());
            for bi in 0..batches {
                let base = bi * r * c;
                for i in 0..c {
                    for j in 0..r {
                        out.push(data[base + j * c + i]);
                    }
                }
            }
            write_f32(&dst, &out)
        }

        Kernel::TopK { src, k, dst } => {
            let data = logical_f32(&src)?;
            let last = src.shape().last_dim();
            let rows = src.shape().row_count();
            let mut out = Vec::with_capacity(rows * k);
            for r in 0..rows {
                let mut row: Vec<f32> = data[r * last..(r + 1) * last].to_vec();
                row.sort_by(|x, y| y.total_cmp(x));
                out.extend_from_slice(&row[..k]);
            }
            write_f32(&dst, &out)
        }

        Kernel::PadLast { src, target, dst } => {
            let data = logical_f32(&src)?;
            let last = src.shape().last_dim();
            let rows = src.shape().row_count();
            let mut out = Vec::with_capacity(rows * target);
            for r in 0..rows {
                out.extend_from_slice(&data[r * last..(r + 1) * last]);
                out.resize(out.len() + (target - last), 0.0);
            }
            write_f32(&dst, &out)
        }

        Kernel::UnpadLast { src, target, dst } => {
            let data = logical_f32(&src)?;
            let last = src.shape().last_dim();
            let rows = src.shape().row_count();
            let mut out = Vec::with_capacity(rows * target);
            for r in 0..rows {
                out.extend_from_slice(&data[r * last..r * last + target]);
            }
            write_f32(&dst, &out)
        }

        Kernel::Concat { a, b, dst } => {
            let av = logical_f32(&a)?;
            let bv = logical_f32(&b)?;
            let da = a.shape().last_dim();
            let db = b.shape().last_dim();
            let rows = a.shape().row_count();
            let mut out = Vec::with_capacity(rows * (da + db));
            for r in 0..rows {
                out.extend_from_slice(&av[r * da..(r + 1) * da]);
                out.extend_from_slice(&bv[r * db..(r + 1) * db]);
            }
            write_f32(&dst, &out)
        }
    }
}
