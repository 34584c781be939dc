// Op — Computational graph node for automatic differentiation
//
// Every tensor produced by a computation records how it was made. The Op
// variants store the actual input tensors (Arc-wrapped, cheap to clone), so
// backward() can read input values for the chain rule and the graph itself
// keeps inputs alive exactly as long as the output exists.
//
// Op::Custom is the extension point for layers outside this crate: a
// GradFn implementor receives the output gradient and returns one optional
// gradient per recorded input. The jagged layer uses it to route gradients
// across the nested/dense boundary.

use std::sync::Arc;

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::error::Result;
use crate::tensor::Tensor;

/// Unique identifier for a tensor allocation. All clones of a tensor share
/// one id; two separately constructed tensors never do. Used as the key in
/// GradStore and in identity-keyed side tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor id (global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A manual backward function registered with the autograd engine.
///
/// Implementors are recorded in `Op::Custom` together with the forward
/// inputs; during the reverse walk the engine hands them the output
/// gradient and accumulates whatever they return, one entry per input.
pub trait GradFn<B: Backend>: Send + Sync {
    /// Name of this gradient function (for Debug output).
    fn name(&self) -> &'static str;

    /// Compute gradients for each recorded input given the output gradient.
    /// `None` means the input receives no gradient.
    fn backward(&self, grad_output: &Tensor<B>) -> Result<Vec<Option<Tensor<B>>>>;
}

/// Records the operation that produced a tensor.
pub enum Op<B: Backend> {
    /// Leaf tensor (input data or trainable parameter).
    None,

    /// Element-wise binary: result = op(lhs, rhs).
    Binary {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
        op: BinaryOp,
    },

    /// Element-wise unary: result = op(input).
    Unary { input: Tensor<B>, op: UnaryOp },

    /// Reduction along dims (empty = all).
    Reduce {
        input: Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
        keep_dim: bool,
    },

    /// Matrix multiplication: result = lhs @ rhs.
    Matmul { lhs: Tensor<B>, rhs: Tensor<B> },

    /// Reshape (covers squeeze/unsqueeze); src_shape lets backward undo it.
    Reshape {
        input: Tensor<B>,
        src_shape: crate::Shape,
    },

    /// Transpose of two dimensions.
    Transpose {
        input: Tensor<B>,
        dim0: usize,
        dim1: usize,
    },

    /// Narrow/slice along a dimension.
    Narrow {
        input: Tensor<B>,
        dim: usize,
        start: usize,
        len: usize,
    },

    /// Affine transform: result = input * mul + add.
    Affine {
        input: Tensor<B>,
        mul: f64,
        add: f64,
    },

    /// Contiguous copy; gradient passes through unchanged.
    Contiguous { input: Tensor<B> },

    /// Concatenation along a dimension; `sizes` records each input's extent
    /// along `dim` so backward can slice the gradient back apart.
    Cat {
        inputs: Vec<Tensor<B>>,
        dim: usize,
        sizes: Vec<usize>,
    },

    /// Dtype conversion; backward casts the gradient back.
    ToDtype {
        input: Tensor<B>,
        src_dtype: crate::DType,
    },

    /// Manual forward/backward pair (see [`GradFn`]).
    Custom {
        inputs: Vec<Tensor<B>>,
        f: Arc<dyn GradFn<B>>,
    },
}

// Manual Clone: every field clone is an Arc refcount bump.
impl<B: Backend> Clone for Op<B> {
    fn clone(&self) -> Self {
        match self {
            Op::None => Op::None,
            Op::Binary { lhs, rhs, op } => Op::Binary {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                op: *op,
            },
            Op::Unary { input, op } => Op::Unary {
                input: input.clone(),
                op: *op,
            },
            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => Op::Reduce {
                input: input.clone(),
                op: *op,
                dims: dims.clone(),
                keep_dim: *keep_dim,
            },
            Op::Matmul { lhs, rhs } => Op::Matmul {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            Op::Reshape { input, src_shape } => Op::Reshape {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Transpose { input, dim0, dim1 } => Op::Transpose {
                input: input.clone(),
                dim0: *dim0,
                dim1: *dim1,
            },
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => Op::Narrow {
                input: input.clone(),
                dim: *dim,
                start: *start,
                len: *len,
            },
            Op::Affine { input, mul, add } => Op::Affine {
                input: input.clone(),
                mul: *mul,
                add: *add,
            },
            Op::Contiguous { input } => Op::Contiguous {
                input: input.clone(),
            },
            Op::Cat { inputs, dim, sizes } => Op::Cat {
                inputs: inputs.clone(),
                dim: *dim,
                sizes: sizes.clone(),
            },
            Op::ToDtype { input, src_dtype } => Op::ToDtype {
                input: input.clone(),
                src_dtype: *src_dtype,
            },
            Op::Custom { inputs, f } => Op::Custom {
                inputs: inputs.clone(),
                f: Arc::clone(f),
            },
        }
    }
}

// Concise Debug: op kind and tensor ids only.
impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { lhs, rhs, op } => {
                write!(f, "Binary({:?}, id={:?}, id={:?})", op, lhs.id(), rhs.id())
            }
            Op::Unary { input, op } => write!(f, "Unary({:?}, id={:?})", op, input.id()),
            Op::Reduce {
                input, op, dims, ..
            } => write!(f, "Reduce({:?}, dims={:?}, id={:?})", op, dims, input.id()),
            Op::Matmul { lhs, rhs } => write!(f, "Matmul(id={:?}, id={:?})", lhs.id(), rhs.id()),
            Op::Reshape { input, src_shape } => {
                write!(f, "Reshape({} → ?, id={:?})", src_shape, input.id())
            }
            Op::Transpose { input, dim0, dim1 } => {
                write!(f, "Transpose({}, {}, id={:?})", dim0, dim1, input.id())
            }
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => write!(
                f,
                "Narrow(dim={}, {}..{}, id={:?})",
                dim,
                start,
                start + len,
                input.id()
            ),
            Op::Affine { input, mul, add } => {
                write!(f, "Affine(*{} +{}, id={:?})", mul, add, input.id())
            }
            Op::Contiguous { input } => write!(f, "Contiguous(id={:?})", input.id()),
            Op::Cat { inputs, dim, .. } => {
                let ids: Vec<_> = inputs.iter().map(|t| t.id()).collect();
                write!(f, "Cat(dim={}, ids={:?})", dim, ids)
            }
            Op::ToDtype { input, src_dtype } => {
                write!(f, "ToDtype(from={:?}, id={:?})", src_dtype, input.id())
            }
            Op::Custom { inputs, f: func } => {
                let ids: Vec<_> = inputs.iter().map(|t| t.id()).collect();
                write!(f, "Custom({}, ids={:?})", func.name(), ids)
            }
        }
    }
}

impl<B: Backend> Op<B> {
    /// References to all input tensors of this operation, used by the
    /// topological sort in backward().
    pub fn inputs(&self) -> Vec<&Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Narrow { input, .. }
            | Op::Affine { input, .. }
            | Op::Contiguous { input }
            | Op::ToDtype { input, .. } => vec![input],
            Op::Cat { inputs, .. } | Op::Custom { inputs, .. } => inputs.iter().collect(),
        }
    }
}
