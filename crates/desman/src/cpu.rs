use desman_core::{BinOp, DType, Error, HostTensor, ReduceKind, Result, Shape};
use rayon::prelude::*;

// Local operator set
//
// Host-side implementations of the full operator surface. Accumulation
// order matches the accelerator kernels exactly (row-major source order,
// ascending contraction index), so the two paths agree bit for bit. The
// rayon parallelism in matmul and conv2d splits over independent output
// elements only and never changes per-element order.

/// Matmul works on `[batch, n, k]` operands.
const MATMUL_RANK: usize = 3;

fn ensure_f32(t: &HostTensor) -> Result<()> {
    if t.dtype() != DType::F32 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: t.dtype(),
        });
    }
    Ok(())
}

/// Elementwise binary operation on two tensors of identical shape.
pub fn binary(op: BinOp, a: &HostTensor, b: &HostTensor) -> Result<HostTensor> {
    ensure_f32(a)?;
    ensure_f32(b)?;
    a.shape().check_operand()?;
    if a.shape() != b.shape() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().clone(),
            got: b.shape().clone(),
        });
    }
    let av = a.as_f32()?;
    let bv = b.as_f32()?;
    let out: Vec<f32> = av.iter().zip(bv).map(|(&x, &y)| op.apply(x, y)).collect();
    HostTensor::from_f32(out, a.shape().clone())
}

/// Elementwise binary operation against a scalar right-hand side.
pub fn binary_scalar(op: BinOp, a: &HostTensor, scalar: f32) -> Result<HostTensor> {
    ensure_f32(a)?;
    a.shape().check_operand()?;
    let av = a.as_f32()?;
    let out: Vec<f32> = av.iter().map(|&x| op.apply(x, scalar)).collect();
    HostTensor::from_f32(out, a.shape().clone())
}

/// Batched matrix multiply: `[batch, n, k] × [batch, k, m]`.
pub fn matmul(a: &HostTensor, b: &HostTensor) -> Result<HostTensor> {
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
    let sa = a.shape().lead_expand(MATMUL_RANK);
    let sb = b.shape().lead_expand(MATMUL_RANK);
    let (batch, n, k) = (sa.dim(0)?, sa.dim(1)?, sa.dim(2)?);
    let (batch_b, k2, m) = (sb.dim(0)?, sb.dim(1)?, sb.dim(2)?);
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
    let av = a.as_f32()?;
    let bv = b.as_f32()?;
    let mut out = vec![0.0f32; batch * n * m];
    out.par_chunks_mut(m).enumerate().for_each(|(row, chunk)| {
        let bi = row / n;
        let i = row % n;
        let a_base = bi * n * k;
        let b_base = bi * k * m;
        for (j, slot) in chunk.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += av[a_base + i * k + p] * bv[b_base + p * m + j];
            }
            *slot = acc;
        }
    });
    let out_shape = Shape::from((batch, n, m)).lead_squeeze(added);
    HostTensor::from_f32(out, out_shape)
}

/// Valid 2-d convolution, stride 1: input `[b, c, h, w]` (or `[c, h, w]`)
/// against weights `[oc, c, kh, kw]`.
pub fn conv2d(input: &HostTensor, weight: &HostTensor) -> Result<HostTensor> {
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
    let added = 4 - ri;
    let si = input.shape().lead_expand(4);
    let (b, c, h, w) = (si.dim(0)?, si.dim(1)?, si.dim(2)?, si.dim(3)?);
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
    let (oh, ow) = (h - kh + 1, w - kw + 1);
    let iv = input.as_f32()?;
    let wv = weight.as_f32()?;
    let mut out = vec![0.0f32; b * oc * oh * ow];
    out.par_chunks_mut(ow).enumerate().for_each(|(row, chunk)| {
        let y = row % oh;
        let o = (row / oh) % oc;
        let bi = row / (oh * oc);
        for (x, slot) in chunk.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for ci in 0..c {
                for ky in 0..kh {
                    for kx in 0..kw {
                        let iv_idx = ((bi * c + ci) * h + y + ky) * w + x + kx;
                        let wv_idx = ((o * c + ci) * kh + ky) * kw + kx;
                        acc += iv[iv_idx] * wv[wv_idx];
                    }
                }
            }
            *slot = acc;
        }
    });
    let out_shape = Shape::from((b, oc, oh, ow)).lead_squeeze(added);
    HostTensor::from_f32(out, out_shape)
}

/// Reduce the dimensions flagged in `mask`; they collapse and are dropped
/// from the result shape. Reducing every dimension yields `[1]`.
pub fn reduce(kind: ReduceKind, t: &HostTensor, mask: &[bool]) -> Result<HostTensor> {
    ensure_f32(t)?;
    t.shape().check_operand()?;
    let dims = t.shape().dims().to_vec();
    let rank = dims.len();
    if mask.len() != rank {
        return Err(Error::unsupported(
            kind.name(),
            format!("mask length {} does not match rank {}", mask.len(), rank),
        ));
    }
    if !mask.iter().any(|&f| f) {
        return Err(Error::unsupported(
            kind.name(),
            "no dimensions flagged for reduction",
        ));
    }
    let data = t.as_f32()?;
    let mut src_strides = vec![1usize; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        src_strides[d] = src_strides[d + 1] * dims[d + 1];
    }
    let mut dst_strides = vec![0usize; rank];
    let mut stride = 1usize;
    for d in (0..rank).rev() {
        if !mask[d] {
            dst_strides[d] = stride;
            stride *= dims[d];
        }
    }
    let kept: Vec<usize> = dims
        .iter()
        .zip(mask)
        .filter(|(_, &flagged)| !flagged)
        .map(|(&d, _)| d)
        .collect();
    let out_shape = if kept.is_empty() {
        Shape::from(1)
    } else {
        Shape::new(kept)
    };
    let init = match kind {
        ReduceKind::Sum | ReduceKind::Mean => 0.0f32,
        ReduceKind::Max => f32::NEG_INFINITY,
    };
    let mut acc = vec![init; out_shape.elem_count()];
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
            .zip(mask)
            .filter(|(_, &flagged)| flagged)
            .map(|(&d, _)| d)
            .product();
        let inv = 1.0 / count as f32;
        for a in acc.iter_mut() {
            *a *= inv;
        }
    }
    HostTensor::from_f32(acc, out_shape)
}

/// Select rows of `table: [v, d]` by `indices: [n]` into `[n, d]`.
pub fn gather(table: &HostTensor, indices: &HostTensor) -> Result<HostTensor> {
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
    let tv = table.as_f32()?;
    let idx = indices.as_u32()?;
    let rows = table.shape().dim(0)?;
    let d = table.shape().dim(1)?;
    let mut out = Vec::with_capacity(idx.len() * d);
    for &i in idx {
        let i = i as usize;
        if i >= rows {
            return Err(Error::msg(format!(
                "gather index {i} out of range for table with {rows} row(s)"
            )));
        }
        out.extend_from_slice(&tv[i * d..(i + 1) * d]);
    }
    HostTensor::from_f32(out, (idx.len(), d))
}

/// Repeat each row's content `count` times along the last dimension.
pub fn tile(t: &HostTensor, count: usize) -> Result<HostTensor> {
    ensure_f32(t)?;
    t.shape().check_operand()?;
    if count == 0 {
        return Err(Error::unsupported("tile", "count must be at least 1"));
    }
    let data = t.as_f32()?;
    let last = t.shape().last_dim();
    let rows = t.shape().row_count();
    let mut out = Vec::with_capacity(rows * last * count);
    for r in 0..rows {
        let row = &data[r * last..(r + 1) * last];
        for _ in 0..count {
            out.extend_from_slice(row);
        }
    }
    HostTensor::from_f32(out, t.shape().with_last_dim(last * count))
}

/// Swap the last two dimensions.
pub fn transpose(t: &HostTensor) -> Result<HostTensor> {
    ensure_f32(t)?;
    t.shape().check_operand()?;
    let rank = t.shape().rank();
    if rank < 2 {
        return Err(Error::unsupported(
            "transpose",
            format!("rank must be at least 2, got {rank}"),
        ));
    }
    let data = t.as_f32()?;
    let r = t.shape().dim(rank - 2)?;
    let c = t.shape().dim(rank - 1)?;
    let batches = t.shape().elem_count() / (r * c);
    let mut out = Vec::with_capacity(data.len());
    for bi in 0..batches {
        let base = bi * r * c;
        for i in 0..c {
            for j in 0..r {
                out.push(data[base + j * c + i]);
            }
        }
    }
    let mut dims = t.shape().dims().to_vec();
    dims.swap(rank - 2, rank - 1);
    HostTensor::from_f32(out, Shape::new(dims))
}

/// Largest `k` values per row, descending.
pub fn top_k(t: &HostTensor, k: usize) -> Result<HostTensor> {
    ensure_f32(t)?;
    t.shape().check_operand()?;
    let last = t.shape().last_dim();
    if k == 0 || k > last {
        return Err(Error::unsupported(
            "top_k",
            format!("k must be in [1, {last}], got {k}"),
        ));
    }
    let data = t.as_f32()?;
    let rows = t.shape().row_count();
    let mut out = Vec::with_capacity(rows * k);
    for r in 0..rows {
        let mut row: Vec<f32> = data[r * last..(r + 1) * last].to_vec();
        row.sort_by(|x, y| y.total_cmp(x));
        out.extend_from_slice(&row[..k]);
    }
    HostTensor::from_f32(out, t.shape().with_last_dim(k))
}

/// Extend the last dimension to `target` elements, zero-filling.
pub fn pad_last(t: &HostTensor, target: usize) -> Result<HostTensor> {
    ensure_f32(t)?;
    t.shape().check_operand()?;
    let last = t.shape().last_dim();
    if target < last {
        return Err(Error::unsupported(
            "pad",
            format!("target {target} smaller than last dimension {last}"),
        ));
    }
    let data = t.as_f32()?;
    let rows = t.shape().row_count();
    let mut out = Vec::with_capacity(rows * target);
    for r in 0..rows {
        out.extend_from_slice(&data[r * last..(r + 1) * last]);
        out.resize(out.len() + (target - last), 0.0);
    }
    HostTensor::from_f32(out, t.shape().with_last_dim(target))
}

/// Truncate the last dimension to `target` elements.
pub fn unpad_last(t: &HostTensor, target: usize) -> Result<HostTensor> {
    ensure_f32(t)?;
    t.shape().check_operand()?;
    let last = t.shape().last_dim();
    if target == 0 || target > last {
        return Err(Error::unsupported(
            "unpad",
            format!("target must be in [1, {last}], got {target}"),
        ));
    }
    let data = t.as_f32()?;
    let rows = t.shape().row_count();
    let mut out = Vec::with_capacity(rows * target);
    for r in 0..rows {
        out.extend_from_slice(&data[r * last..r * last + target]);
    }
    HostTensor::from_f32(out, t.shape().with_last_dim(target))
}

/// Join two tensors along the last dimension. Every leading dimension must
/// match; the result's last dimension is the sum of the operands'.
pub fn concat(a: &HostTensor, b: &HostTensor) -> Result<HostTensor> {
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
            format!("leading dimensions must match: {} vs {}", a.shape(), b.shape()),
        ));
    }
    let av = a.as_f32()?;
    let bv = b.as_f32()?;
    let da = a.shape().last_dim();
    let db = b.shape().last_dim();
    let rows = a.shape().row_count();
    let mut out = Vec::with_capacity(rows * (da + db));
    for r in 0..rows {
        out.extend_from_slice(&av[r * da..(r + 1) * da]);
        out.extend_from_slice(&bv[r * db..(r + 1) * db]);
    }
    HostTensor::from_f32(out, a.shape().with_last_dim(da + db))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(values: Vec<f32>, shape: impl Into<Shape>) -> HostTensor {
        HostTensor::from_f32(values, shape).unwrap()
    }

    #[test]
    fn test_binary_ops() {
        let a = host(vec![6.0, 8.0], 2);
        let b = host(vec![2.0, 4.0], 2);
        assert_eq!(binary(BinOp::Add, &a, &b).unwrap().as_f32().unwrap(), &[8.0, 12.0]);
        assert_eq!(binary(BinOp::Div, &a, &b).unwrap().as_f32().unwrap(), &[3.0, 2.0]);
        let c = host(vec![1.0], 1);
        assert!(binary(BinOp::Add, &a, &c).is_err());
    }

    #[test]
    fn test_matmul_rank_mixing() {
        let a = host(vec![1.0, 2.0, 3.0, 4.0], (2, 2));
        let b = host(vec![1.0, 0.0, 0.0, 1.0], (1, 2, 2));
        let out = matmul(&a, &b).unwrap();
        assert_eq!(out.shape().dims(), &[1, 2, 2]);
        assert_eq!(out.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_conv2d_window_sums() {
        let input = host((1..=9).map(|v| v as f32).collect(), (1, 3, 3));
        let weight = host(vec![1.0; 4], (1, 1, 2, 2));
        let out = conv2d(&input, &weight).unwrap();
        assert_eq!(out.shape().dims(), &[1, 2, 2]);
        assert_eq!(out.as_f32().unwrap(), &[12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn test_reduce_sum_and_mean() {
        let t = host(vec![1.0, 2.0, 3.0, 4.0], (2, 2));
        let s = reduce(ReduceKind::Sum, &t, &[true, false]).unwrap();
        assert_eq!(s.shape().dims(), &[2]);
        assert_eq!(s.as_f32().unwrap(), &[4.0, 6.0]);
        let m = reduce(ReduceKind::Mean, &t, &[true, true]).unwrap();
        assert_eq!(m.shape().dims(), &[1]);
        assert_eq!(m.as_f32().unwrap(), &[2.5]);
    }

    #[test]
    fn test_gather_checks_range() {
        let table = host(vec![0.0, 1.0, 2.0, 3.0], (2, 2));
        let ok = HostTensor::from_u32(vec![1, 0], 2).unwrap();
        let out = gather(&table, &ok).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[2.0, 3.0, 0.0, 1.0]);
        let bad = HostTensor::from_u32(vec![2], 1).unwrap();
        assert!(gather(&table, &bad).is_err());
    }

    #[test]
    fn test_tile_transpose_topk() {
        let t = host(vec![1.0, 2.0], (1, 2));
        assert_eq!(tile(&t, 2).unwrap().as_f32().unwrap(), &[1.0, 2.0, 1.0, 2.0]);
        let t2 = host(vec![1.0, 2.0, 3.0, 4.0], (2, 2));
        assert_eq!(transpose(&t2).unwrap().as_f32().unwrap(), &[1.0, 3.0, 2.0, 4.0]);
        let t3 = host(vec![5.0, 1.0, 3.0], 3);
        assert_eq!(top_k(&t3, 2).unwrap().as_f32().unwrap(), &[5.0, 3.0]);
    }

    #[test]
    fn test_pad_unpad_concat() {
        let t = host(vec![1.0, 2.0], (1, 2));
        let p = pad_last(&t, 4).unwrap();
        assert_eq!(p.as_f32().unwrap(), &[1.0, 2.0, 0.0, 0.0]);
        let u = unpad_last(&p, 2).unwrap();
        assert_eq!(u.as_f32().unwrap(), &[1.0, 2.0]);
        let c = concat(&t, &p).unwrap();
        assert_eq!(c.shape().dims(), &[1, 6]);
        assert_eq!(c.as_f32().unwrap(), &[1.0, 2.0, 1.0, 2.0, 0.0, 0.0]);
    }
}
