use std::any::Any;
use std::sync::{Arc, RwLock, Weak};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{GradFn, Op, TensorId};
use crate::shape::Shape;

// Tensor — The fundamental dense n-dimensional array
//
// A Tensor<B: Backend> holds data on the backend's device, has a shape, a
// dtype, and records the operation that produced it for autograd.
//
// MEMORY MODEL:
//   Tensor is a thin handle around Arc<TensorInner>; cloning is O(1) and all
//   clones share one TensorId. Storage sits behind Arc<RwLock<...>> so views
//   (transpose, narrow) can share it. Identity — not content — is what the
//   jagged registry keys on, which is exactly the clone-sharing TensorId.

/// Inner data of a tensor, shared via Arc.
struct TensorInner<B: Backend> {
    /// Identifier shared by all clones of this allocation.
    id: TensorId,
    /// The raw data on the backend's device.
    storage: Arc<RwLock<B::Storage>>,
    /// Memory layout: shape + strides + offset.
    layout: Layout,
    /// Element data type.
    dtype: DType,
    /// The device this tensor lives on.
    device: B::Device,
    /// The operation that created this tensor (None for leaves).
    op: Op<B>,
    /// Whether this tensor is a trainable variable.
    is_variable: bool,
}

/// An n-dimensional array on a specific backend.
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

// Manual Clone: Arc refcount bump only.
impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    /// Create a tensor from freshly produced storage and layout.
    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    /// Create a view sharing this tensor's storage with a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    // Accessors

    /// Identifier shared by every clone of this allocation.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    /// Element data type.
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// The device this tensor is on.
    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    /// The memory layout (shape + strides + offset).
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Whether this tensor is contiguous in memory.
    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether this tensor accumulates gradients as a trainable variable.
    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    /// Type-erased weak handle to this tensor's shared allocation.
    ///
    /// Lets non-generic identity-keyed side tables (keyed by [`TensorId`])
    /// observe liveness without extending it and without naming the backend.
    pub fn weak_handle(&self) -> Weak<dyn Any + Send + Sync> {
        let strong: Arc<dyn Any + Send + Sync> = self.inner.clone();
        Arc::downgrade(&strong)
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // Creation

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::ones(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Create a tensor filled with a constant value.
    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Create a tensor from a flat f64 slice, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        let layout = Layout::contiguous(shape);
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Create a tensor with random uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Create a tensor with random normal values (mean 0, std 1).
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// 1-D tensor with values [0, 1, ..., n-1].
    pub fn arange(n: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let data: Vec<f64> = (0..n).map(|i| i as f64).collect();
        Self::from_f64_slice(&data, n, dtype, device)
    }

    /// Zeros with the same shape, dtype, and device as `other`.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    /// Ones with the same shape, dtype, and device as `other`.
    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape().clone(), other.dtype(), other.device())
    }

    /// Mark this tensor as a trainable variable. Variables accumulate
    /// gradients during backward().
    pub fn set_variable(self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable: true,
            }),
        }
    }

    // Shape manipulation (views, no data copy)

    /// Transpose two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(dim0, dim1)?;
        let op = Op::Transpose {
            input: self.clone(),
            dim0,
            dim1,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Transpose a 2-D matrix (shorthand for transpose(0, 1)).
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Narrow (slice) along a dimension.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let new_layout = self.inner.layout.narrow(dim, start, len)?;
        let op = Op::Narrow {
            input: self.clone(),
            dim,
            start,
            len,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Reshape to a new shape with the same element count. Non-contiguous
    /// tensors are made contiguous first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let current_count = self.elem_count();
        let new_count = new_shape.elem_count();
        if current_count != new_count {
            return Err(Error::ReshapeElementMismatch {
                src: current_count,
                dst: new_count,
                dst_shape: new_shape,
            });
        }
        let tensor = if self.is_contiguous() {
            self.clone()
        } else {
            self.contiguous()?
        };
        let src_shape = tensor.shape().clone();
        let new_layout = Layout::contiguous(new_shape);
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape,
        };
        Ok(tensor.view_with_layout(new_layout, op))
    }

    /// Insert a size-1 dimension at `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim,
                rank: rank + 1,
            });
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        // The stride of a size-1 dim is never stepped along; reuse the next
        // dimension's stride (or 1 at the end) by convention.
        let stride_val = if dim < rank { new_strides[dim] } else { 1 };
        new_dims.insert(dim, 1);
        new_strides.insert(dim, stride_val);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Remove a size-1 dimension.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        if self.dims()[dim] != 1 {
            return Err(Error::msg(format!(
                "squeeze: dimension {} has size {}, expected 1",
                dim,
                self.dims()[dim]
            )));
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        new_dims.remove(dim);
        new_strides.remove(dim);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Ensure the tensor is contiguous; copies only when needed.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::to_contiguous(&storage, &self.inner.layout)?;
        let new_layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            new_storage,
            new_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    // Arithmetic

    /// Element-wise addition.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    /// Element-wise multiplication.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    /// Element-wise division.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::binary_op(
            op,
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;
        let result_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let result_layout = Layout::contiguous(result_shape);
        let result_op = Op::Binary {
            lhs: self.clone(),
            rhs: rhs.clone(),
            op,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    /// Element-wise negation.
    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    /// Element-wise absolute value.
    pub fn abs(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Abs)
    }

    /// Element-wise exponential.
    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    /// Element-wise natural logarithm.
    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    /// Element-wise square root.
    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    /// Element-wise square.
    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::unary_op(op, &storage, &self.inner.layout)?;
        let result_layout = Layout::contiguous(self.shape().clone());
        let result_op = Op::Unary {
            input: self.clone(),
            op,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    /// Affine transform: result = self * mul + add.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::affine(&storage, &self.inner.layout, mul, add)?;
        let result_layout = Layout::contiguous(self.shape().clone());
        let result_op = Op::Affine {
            input: self.clone(),
            mul,
            add,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Reductions

    /// Sum all elements into a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    /// Sum along a dimension.
    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    /// Mean of all elements into a scalar tensor.
    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    /// Mean along a dimension.
    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[dim], keep_dim)
    }

    fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        let storage = self.read_storage()?;
        let result = B::reduce_op(op, &storage, &self.inner.layout, dims, keep_dim)?;

        let result_shape = if dims.is_empty() {
            Shape::from(())
        } else if keep_dim {
            let mut new_dims = self.dims().to_vec();
            for &d in dims {
                new_dims[d] = 1;
            }
            Shape::new(new_dims)
        } else {
            let new_dims: Vec<usize> = self
                .dims()
                .iter()
                .enumerate()
                .filter(|(i, _)| !dims.contains(i))
                .map(|(_, &d)| d)
                .collect();
            Shape::new(new_dims)
        };

        let result_layout = Layout::contiguous(result_shape);
        let result_op = Op::Reduce {
            input: self.clone(),
            op,
            dims: dims.to_vec(),
            keep_dim,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Linear algebra

    /// 2-D matrix multiplication: self @ rhs.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.rank() != 2 || rhs.rank() != 2 {
            return Err(Error::msg(format!(
                "matmul: expected two rank-2 tensors, got ranks {} and {}",
                self.rank(),
                rhs.rank()
            )));
        }
        let (m, k1) = (self.dims()[0], self.dims()[1]);
        let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::matmul(
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;
        let result_layout = Layout::contiguous(Shape::from((m, n)));
        let result_op = Op::Matmul {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Concatenation

    /// Concatenate tensors along a dimension. All inputs must agree on every
    /// other dimension and on dtype.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        if tensors.is_empty() {
            return Err(Error::msg("cat: empty tensor list"));
        }
        if tensors.len() == 1 {
            return Ok(tensors[0].clone());
        }

        let first = &tensors[0];
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }

        for (i, t) in tensors.iter().enumerate().skip(1) {
            if t.rank() != rank {
                return Err(Error::msg(format!(
                    "cat: tensor {} has rank {} but expected {}",
                    i,
                    t.rank(),
                    rank
                )));
            }
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            for d in 0..rank {
                if d != dim && t.dims()[d] != first.dims()[d] {
                    return Err(Error::msg(format!(
                        "cat: tensor {} has size {} at dim {} but expected {}",
                        i,
                        t.dims()[d],
                        d,
                        first.dims()[d]
                    )));
                }
            }
        }

        let cat_size: usize = tensors.iter().map(|t| t.dims()[dim]).sum();
        let mut out_dims = first.dims().to_vec();
        out_dims[dim] = cat_size;
        let out_shape = Shape::new(out_dims);

        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[dim]).collect();

        let guards: Vec<_> = tensors
            .iter()
            .map(|t| t.read_storage())
            .collect::<Result<Vec<_>>>()?;
        let pairs: Vec<(&B::Storage, &Layout)> = tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (&*guards[i], &t.inner.layout))
            .collect();

        let storage = B::cat(&pairs, &out_shape, dim)?;
        let layout = Layout::contiguous(out_shape);
        let op = Op::Cat {
            inputs: tensors.to_vec(),
            dim,
            sizes,
        };
        Ok(Self::from_storage(
            storage,
            layout,
            first.dtype(),
            first.device().clone(),
            op,
        ))
    }

    // Dtype conversion

    /// Convert to a different dtype; a no-op clone when it already matches.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let src_dtype = self.dtype();
        let guard = self.read_storage()?;
        let storage = B::cast(&guard, &self.inner.layout, dtype, self.device())?;
        let layout = Layout::contiguous(self.shape().clone());
        let op = Op::ToDtype {
            input: self.clone(),
            src_dtype,
        };
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            self.device().clone(),
            op,
        ))
    }

    // Data extraction

    /// Extract all elements as a flat Vec<f64> in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    /// Extract a scalar value (the tensor must hold exactly one element).
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_f64_vec()?[0])
    }

    // Autograd

    /// Reverse-mode automatic differentiation from a scalar tensor.
    /// Returns a GradStore with gradients for every tensor in the graph.
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }

    /// Detached copy: same data, no gradient tracking, fresh id.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }

    /// Rewrap this tensor behind a manual gradient function.
    ///
    /// The result shares storage and layout but carries a fresh id and
    /// routes its backward pass through `f`, which receives the output
    /// gradient and produces one optional gradient per entry of `inputs`.
    pub fn with_grad_fn(&self, inputs: Vec<Tensor<B>>, f: Arc<dyn GradFn<B>>) -> Self {
        self.view_with_layout(self.layout().clone(), Op::Custom { inputs, f })
    }
}
