// CPU Backend — Reference compute backend for Vole
//
// Implements the vole-core Backend trait with plain host memory:
// - CpuStorage is an enum over a typed Vec per supported dtype
// - Kernels compute in f64 and cast back to the storage dtype, which keeps
//   every dtype path correct at the cost of some 16/32-bit throughput
// - Non-contiguous inputs are walked through Layout::strided_indices
// - matmul parallelizes over output rows with rayon
//
// USAGE:
//   let dev = CpuDevice;
//   let t = Tensor::<CpuBackend>::zeros((2, 3), DType::F32, &dev)?;

use std::fmt;

use half::{bf16, f16};
use rand::Rng;
use rayon::prelude::*;

use vole_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
use vole_core::{DType, Error, Layout, Result, Shape, Tensor};

/// The (single) CPU device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// Host-side storage: one typed Vec per supported dtype.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    U32(Vec<u32>),
    I64(Vec<i64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::U32(_) => DType::U32,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::BF16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::U32(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

impl CpuStorage {
    /// Build storage of the given dtype from f64 values.
    fn from_f64(data: &[f64], dtype: DType) -> CpuStorage {
        match dtype {
            DType::F16 => CpuStorage::F16(data.iter().map(|&v| f16::from_f64(v)).collect()),
            DType::BF16 => CpuStorage::BF16(data.iter().map(|&v| bf16::from_f64(v)).collect()),
            DType::F32 => CpuStorage::F32(data.iter().map(|&v| v as f32).collect()),
            DType::F64 => CpuStorage::F64(data.to_vec()),
            DType::U8 => CpuStorage::U8(data.iter().map(|&v| v as u8).collect()),
            DType::U32 => CpuStorage::U32(data.iter().map(|&v| v as u32).collect()),
            DType::I64 => CpuStorage::I64(data.iter().map(|&v| v as i64).collect()),
        }
    }

    /// Read one element as f64 by flat index.
    fn get_f64(&self, idx: usize) -> f64 {
        match self {
            CpuStorage::F16(v) => v[idx].to_f64(),
            CpuStorage::BF16(v) => v[idx].to_f64(),
            CpuStorage::F32(v) => v[idx] as f64,
            CpuStorage::F64(v) => v[idx],
            CpuStorage::U8(v) => v[idx] as f64,
            CpuStorage::U32(v) => v[idx] as f64,
            CpuStorage::I64(v) => v[idx] as f64,
        }
    }

    /// Gather the logical elements of `layout` into a flat f64 Vec.
    fn gather_f64(&self, layout: &Layout) -> Vec<f64> {
        layout.strided_indices().map(|i| self.get_f64(i)).collect()
    }
}

/// The CPU backend marker type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuBackend;

/// Convenience alias: a tensor on the CPU backend.
pub type CpuTensor = Tensor<CpuBackend>;

fn apply_binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
    }
}

fn apply_unary(op: UnaryOp, x: f64) -> f64 {
    match op {
        UnaryOp::Neg => -x,
        UnaryOp::Abs => x.abs(),
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Square => x * x,
    }
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(
            &vec![0.0; shape.elem_count()],
            dtype,
        ))
    }

    fn ones(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(
            &vec![1.0; shape.elem_count()],
            dtype,
        ))
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(
            &vec![val; shape.elem_count()],
            dtype,
        ))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(data, dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Ok(CpuStorage::from_f64(&data, dtype))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        // Box-Muller on pairs of uniforms.
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| {
                let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
                let u2: f64 = rng.gen::<f64>();
                (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
            })
            .collect();
        Ok(CpuStorage::from_f64(&data, dtype))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let out_shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;
        let out_count = out_shape.elem_count();

        // Gather both sides contiguously, then read through broadcast
        // strides aligned to the output shape.
        let lhs_data = lhs.gather_f64(lhs_layout);
        let rhs_data = rhs.gather_f64(rhs_layout);
        let lhs_strides = lhs_layout.shape().broadcast_strides(&out_shape);
        let rhs_strides = rhs_layout.shape().broadcast_strides(&out_shape);
        let out_strides = out_shape.stride_contiguous();
        let rank = out_shape.rank();

        let mut out = vec![0.0f64; out_count];
        for (flat, slot) in out.iter_mut().enumerate() {
            let mut rem = flat;
            let mut l_idx = 0usize;
            let mut r_idx = 0usize;
            for d in 0..rank {
                let coord = rem / out_strides[d];
                rem %= out_strides[d];
                l_idx += coord * lhs_strides[d];
                r_idx += coord * rhs_strides[d];
            }
            *slot = apply_binary(op, lhs_data[l_idx], rhs_data[r_idx]);
        }
        Ok(CpuStorage::from_f64(&out, lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = input.gather_f64(layout);
        let out: Vec<f64> = data.iter().map(|&x| apply_unary(op, x)).collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        let data = input.gather_f64(layout);
        let out: Vec<f64> = data.iter().map(|&x| x * mul + add).collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
        _keep_dim: bool,
    ) -> Result<CpuStorage> {
        let data = input.gather_f64(layout);
        let in_dims = layout.dims().to_vec();
        let rank = in_dims.len();

        if dims.is_empty() {
            // Global reduction to a scalar.
            let sum: f64 = data.iter().sum();
            let val = match op {
                ReduceOp::Sum => sum,
                ReduceOp::Mean => sum / data.len().max(1) as f64,
            };
            return Ok(CpuStorage::from_f64(&[val], input.dtype()));
        }

        // Accumulate into an output buffer with reduced dims collapsed.
        let out_dims_aligned: Vec<usize> = (0..rank)
            .map(|d| if dims.contains(&d) { 1 } else { in_dims[d] })
            .collect();
        let aligned = Shape::new(out_dims_aligned);
        let out_count = aligned.elem_count();
        let out_strides = aligned.broadcast_strides(&Shape::new(in_dims.clone()));
        let in_strides = Shape::new(in_dims.clone()).stride_contiguous();

        let mut out = vec![0.0f64; out_count];
        for (flat, &v) in data.iter().enumerate() {
            let mut rem = flat;
            let mut out_flat = 0usize;
            for d in 0..rank {
                let coord = rem / in_strides[d];
                rem %= in_strides[d];
                out_flat += coord * out_strides[d];
            }
            out[out_flat] += v;
        }

        if matches!(op, ReduceOp::Mean) {
            let count: usize = dims.iter().map(|&d| in_dims[d]).product();
            for v in out.iter_mut() {
                *v /= count as f64;
            }
        }
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let (m, k) = (lhs_layout.dims()[0], lhs_layout.dims()[1]);
        let n = rhs_layout.dims()[1];
        let a = lhs.gather_f64(lhs_layout);
        let b = rhs.gather_f64(rhs_layout);

        let mut out = vec![0.0f64; m * n];
        out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
            for p in 0..k {
                let a_val = a[i * k + p];
                if a_val == 0.0 {
                    continue;
                }
                let b_row = &b[p * n..(p + 1) * n];
                for (j, slot) in row.iter_mut().enumerate() {
                    *slot += a_val * b_row[j];
                }
            }
        });
        Ok(CpuStorage::from_f64(&out, lhs.dtype()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = input.gather_f64(layout);
        Ok(CpuStorage::from_f64(&data, input.dtype()))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(input.gather_f64(layout))
    }

    fn cat(
        inputs: &[(&CpuStorage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<CpuStorage> {
        let dtype = inputs
            .first()
            .map(|(s, _)| s.dtype())
            .ok_or_else(|| Error::msg("cat: empty input list"))?;

        let out_dims = out_shape.dims();
        let inner: usize = out_dims[dim + 1..].iter().product();
        let outer: usize = out_dims[..dim].iter().product();

        let mut out = vec![0.0f64; out_shape.elem_count()];
        // Copy block-by-block: for each outer slice, each input contributes
        // a run of (its dim extent × inner) consecutive output elements.
        let mut dim_offset = 0usize;
        for (storage, layout) in inputs {
            let data = storage.gather_f64(layout);
            let this_dim = layout.dims()[dim];
            let run = this_dim * inner;
            for o in 0..outer {
                let src = &data[o * run..(o + 1) * run];
                let dst_start = o * out_dims[dim] * inner + dim_offset * inner;
                out[dst_start..dst_start + run].copy_from_slice(src);
            }
            dim_offset += this_dim;
        }
        Ok(CpuStorage::from_f64(&out, dtype))
    }
}

impl fmt::Display for CpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::DType;

    #[test]
    fn test_zeros_ones_full() {
        let dev = CpuDevice;
        let z = CpuTensor::zeros((2, 3), DType::F32, &dev).unwrap();
        assert_eq!(z.to_f64_vec().unwrap(), vec![0.0; 6]);
        let o = CpuTensor::ones((2, 2), DType::F64, &dev).unwrap();
        assert_eq!(o.to_f64_vec().unwrap(), vec![1.0; 4]);
        let f = CpuTensor::full(3, 7.5, DType::F64, &dev).unwrap();
        assert_eq!(f.to_f64_vec().unwrap(), vec![7.5; 3]);
    }

    #[test]
    fn test_binary_broadcast() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &dev)
            .unwrap();
        let b = CpuTensor::from_f64_slice(&[10.0, 20.0, 30.0], 3, DType::F64, &dev).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(
            c.to_f64_vec().unwrap(),
            vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
        );
    }

    #[test]
    fn test_unary_and_affine() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[-1.0, 4.0], 2, DType::F64, &dev).unwrap();
        assert_eq!(a.neg().unwrap().to_f64_vec().unwrap(), vec![1.0, -4.0]);
        assert_eq!(a.abs().unwrap().to_f64_vec().unwrap(), vec![1.0, 4.0]);
        assert_eq!(a.square().unwrap().to_f64_vec().unwrap(), vec![1.0, 16.0]);
        assert_eq!(
            a.affine(2.0, 1.0).unwrap().to_f64_vec().unwrap(),
            vec![-1.0, 9.0]
        );
    }

    #[test]
    fn test_reduce() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &dev)
            .unwrap();
        assert_eq!(a.sum_all().unwrap().to_scalar_f64().unwrap(), 21.0);
        assert_eq!(a.mean_all().unwrap().to_scalar_f64().unwrap(), 3.5);
        let s0 = a.sum(0, false).unwrap();
        assert_eq!(s0.dims(), &[3]);
        assert_eq!(s0.to_f64_vec().unwrap(), vec![5.0, 7.0, 9.0]);
        let s1 = a.sum(1, true).unwrap();
        assert_eq!(s1.dims(), &[2, 1]);
        assert_eq!(s1.to_f64_vec().unwrap(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_matmul() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &dev)
            .unwrap();
        let b = CpuTensor::from_f64_slice(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], (3, 2), DType::F64, &dev)
            .unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.dims(), &[2, 2]);
        assert_eq!(c.to_f64_vec().unwrap(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_cat_dim0() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0], (1, 2), DType::F64, &dev).unwrap();
        let b = CpuTensor::from_f64_slice(&[3.0, 4.0, 5.0, 6.0], (2, 2), DType::F64, &dev).unwrap();
        let c = CpuTensor::cat(&[a, b], 0).unwrap();
        assert_eq!(c.dims(), &[3, 2]);
        assert_eq!(c.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_cat_dim1() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &dev).unwrap();
        let b = CpuTensor::from_f64_slice(&[5.0, 6.0], (2, 1), DType::F64, &dev).unwrap();
        let c = CpuTensor::cat(&[a, b], 1).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_f64_vec().unwrap(), vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
    }

    #[test]
    fn test_transpose_view_reads_strided() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &dev)
            .unwrap();
        let t = a.transpose(0, 1).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert_eq!(t.to_f64_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_dtype_cast() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.5, 2.5], 2, DType::F64, &dev).unwrap();
        let i = a.to_dtype(DType::I64).unwrap();
        assert_eq!(i.dtype(), DType::I64);
        assert_eq!(i.to_f64_vec().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_backward_through_mul_sum() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[2.0, 3.0], 2, DType::F64, &dev)
            .unwrap()
            .set_variable();
        let b = CpuTensor::from_f64_slice(&[4.0, 5.0], 2, DType::F64, &dev)
            .unwrap()
            .set_variable();
        let loss = a.mul(&b).unwrap().sum_all().unwrap();
        assert_eq!(loss.to_scalar_f64().unwrap(), 23.0);
        let grads = loss.backward().unwrap();
        assert_eq!(grads.get(&a).unwrap().to_f64_vec().unwrap(), vec![4.0, 5.0]);
        assert_eq!(grads.get(&b).unwrap().to_f64_vec().unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_backward_matmul() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &dev)
            .unwrap()
            .set_variable();
        let b = CpuTensor::from_f64_slice(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], (3, 2), DType::F64, &dev)
            .unwrap()
            .set_variable();
        let loss = a.matmul(&b).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        // grad_a = ones(2,2) @ b^T
        assert_eq!(grads.get(&a).unwrap().dims(), &[2, 3]);
        assert_eq!(
            grads.get(&a).unwrap().to_f64_vec().unwrap(),
            vec![1.0, 1.0, 2.0, 1.0, 1.0, 2.0]
        );
        // grad_b = a^T @ ones(2,2)
        assert_eq!(
            grads.get(&b).unwrap().to_f64_vec().unwrap(),
            vec![5.0, 5.0, 7.0, 7.0, 9.0, 9.0]
        );
    }

    #[test]
    fn test_backward_cat_splits_gradient() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0], (1, 2), DType::F64, &dev)
            .unwrap()
            .set_variable();
        let b = CpuTensor::from_f64_slice(&[3.0, 4.0, 5.0, 6.0], (2, 2), DType::F64, &dev)
            .unwrap()
            .set_variable();
        let cat = CpuTensor::cat(&[a.clone(), b.clone()], 0).unwrap();
        let weight =
            CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2), DType::F64, &dev)
                .unwrap();
        let loss = cat.mul(&weight).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert_eq!(grads.get(&a).unwrap().to_f64_vec().unwrap(), vec![1.0, 2.0]);
        assert_eq!(
            grads.get(&b).unwrap().to_f64_vec().unwrap(),
            vec![3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn test_backward_broadcast_reduces() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &dev)
            .unwrap()
            .set_variable();
        let b = CpuTensor::from_f64_slice(&[10.0, 20.0, 30.0], 3, DType::F64, &dev)
            .unwrap()
            .set_variable();
        let loss = a.add(&b).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert_eq!(grads.get(&a).unwrap().dims(), &[2, 3]);
        // b was broadcast over two rows: its gradient sums them.
        assert_eq!(grads.get(&b).unwrap().dims(), &[3]);
        assert_eq!(grads.get(&b).unwrap().to_f64_vec().unwrap(), vec![2.0, 2.0, 2.0]);
    }
}
