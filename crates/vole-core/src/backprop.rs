// Backpropagation — Reverse-mode automatic differentiation
//
// The forward pass builds a DAG: every tensor stores the Op that produced
// it. backward() topologically sorts that DAG from the (scalar) loss to the
// leaves and walks it in reverse, applying the chain rule per op and
// accumulating gradients — a tensor used twice receives the sum of both
// contributions.
//
// GRADIENT RULES:
//   Add:       grad_a += g,            grad_b += g
//   Sub:       grad_a += g,            grad_b += -g
//   Mul:       grad_a += g * b,        grad_b += g * a
//   Div:       grad_a += g / b,        grad_b += -g * a / b²
//   Matmul:    grad_A += g @ Bᵀ,       grad_B += Aᵀ @ g
//   Sum/Mean:  broadcast g back over the reduced dims (scaled for mean)
//   Reshape/Transpose/Contiguous: invert the view
//   Narrow:    scatter g into a zero tensor at the original position
//   Cat:       slice g back into per-input pieces
//   Custom:    delegate to the registered GradFn
//
// Binary gradients are reduced back over broadcast dimensions so each input
// receives a gradient of its own shape.

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::error::Result;
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Stores gradients for all tensors in a computation graph.
///
/// Returned by `tensor.backward()`; query with `grads.get(&tensor)`.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    /// Create an empty GradStore.
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// The gradient of a tensor, if one was accumulated.
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    /// The gradient for a tensor id, if one was accumulated.
    pub fn get_id(&self, id: TensorId) -> Option<&Tensor<B>> {
        self.grads.get(&id)
    }

    /// Accumulate a gradient, adding onto any existing contribution.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        if let Some(existing) = self.grads.get(&id) {
            let new_grad = existing.add(&grad)?;
            self.grads.insert(id, new_grad);
        } else {
            self.grads.insert(id, grad);
        }
        Ok(())
    }
}

/// Topological ordering of the graph: leaves first, root last.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    fn visit<B: Backend>(
        t: &Tensor<B>,
        visited: &mut HashSet<TensorId>,
        order: &mut Vec<Tensor<B>>,
    ) {
        if visited.contains(&t.id()) {
            return;
        }
        visited.insert(t.id());
        for input in t.op().inputs() {
            visit(input, visited, order);
        }
        order.push(t.clone());
    }

    visit(root, &mut visited, &mut order);
    order
}

/// Reduce a broadcasted gradient back to the given input shape: sum away
/// extra leading dims, then sum (keeping dims) over dims the input held at
/// size 1.
fn reduce_grad_to_shape<B: Backend>(grad: &Tensor<B>, target: &Shape) -> Result<Tensor<B>> {
    let mut g = grad.clone();
    while g.rank() > target.rank() {
        g = g.sum(0, false)?;
    }
    for d in 0..target.rank() {
        if target.dims()[d] == 1 && g.dims()[d] != 1 {
            g = g.sum(d, true)?;
        }
    }
    Ok(g)
}

/// Compute gradients of `root` with respect to every tensor in its graph.
/// `root` must be a scalar.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(crate::Error::msg(
            "backward() requires a scalar tensor. \
             Use .sum_all() or .mean_all() to reduce to a scalar first.",
        ));
    }

    let topo = build_topo(root);

    let mut grads = GradStore::new();
    let ones = Tensor::<B>::ones(root.shape().clone(), root.dtype(), root.device())?;
    grads.grads.insert(root.id(), ones);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get_id(tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => {
                grads.accumulate(input.id(), grad_output)?;
            }

            Op::Binary { lhs, rhs, op } => {
                let (raw_l, raw_r) = match op {
                    BinaryOp::Add => (grad_output.clone(), grad_output.clone()),
                    BinaryOp::Sub => (grad_output.clone(), grad_output.neg()?),
                    BinaryOp::Mul => (grad_output.mul(rhs)?, grad_output.mul(lhs)?),
                    BinaryOp::Div => {
                        let grad_l = grad_output.div(rhs)?;
                        let grad_r = grad_output.mul(lhs)?.div(&rhs.square()?)?.neg()?;
                        (grad_l, grad_r)
                    }
                };
                grads.accumulate(lhs.id(), reduce_grad_to_shape(&raw_l, lhs.shape())?)?;
                grads.accumulate(rhs.id(), reduce_grad_to_shape(&raw_r, rhs.shape())?)?;
            }

            Op::Unary { input, op } => {
                let grad = compute_unary_grad(*op, &grad_output, input)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => {
                let grad = compute_reduce_grad(*op, &grad_output, input, dims, *keep_dim)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Matmul { lhs, rhs } => {
                let grad_lhs = grad_output.matmul(&rhs.t()?.contiguous()?)?;
                let grad_rhs = lhs.t()?.contiguous()?.matmul(&grad_output)?;
                grads.accumulate(lhs.id(), grad_lhs)?;
                grads.accumulate(rhs.id(), grad_rhs)?;
            }

            Op::Reshape { input, src_shape } => {
                let grad = grad_output.reshape(src_shape.clone())?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Transpose { input, dim0, dim1 } => {
                // Transpose is its own inverse.
                let grad = grad_output.transpose(*dim0, *dim1)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => {
                let grad = scatter_narrow_grad(&grad_output, input, *dim, *start, *len)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Affine { input, mul, .. } => {
                let grad = grad_output.affine(*mul, 0.0)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Cat { inputs, dim, sizes } => {
                let mut offset = 0usize;
                for (inp, &sz) in inputs.iter().zip(sizes.iter()) {
                    let grad_slice = grad_output.narrow(*dim, offset, sz)?;
                    grads.accumulate(inp.id(), grad_slice)?;
                    offset += sz;
                }
            }

            Op::ToDtype { input, src_dtype } => {
                let grad = grad_output.to_dtype(*src_dtype)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Custom { inputs, f } => {
                let input_grads = f.backward(&grad_output)?;
                for (inp, grad) in inputs.iter().zip(input_grads) {
                    if let Some(grad) = grad {
                        grads.accumulate(inp.id(), grad)?;
                    }
                }
            }
        }
    }

    Ok(grads)
}

fn compute_unary_grad<B: Backend>(
    op: UnaryOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
) -> Result<Tensor<B>> {
    match op {
        UnaryOp::Neg => grad_output.neg(),
        UnaryOp::Abs => {
            // d|x|/dx = sign(x); zero stays zero.
            let input_data = input.to_f64_vec()?;
            let grad_data = grad_output.to_f64_vec()?;
            let out: Vec<f64> = input_data
                .iter()
                .zip(grad_data.iter())
                .map(|(&x, &g)| if x > 0.0 { g } else if x < 0.0 { -g } else { 0.0 })
                .collect();
            Tensor::from_f64_slice(&out, input.shape().clone(), input.dtype(), input.device())
        }
        UnaryOp::Exp => grad_output.mul(&input.exp()?),
        UnaryOp::Log => grad_output.div(input),
        UnaryOp::Sqrt => {
            // d√x/dx = 1 / (2√x)
            grad_output.div(&input.sqrt()?.affine(2.0, 0.0)?)
        }
        UnaryOp::Square => grad_output.mul(input)?.affine(2.0, 0.0),
    }
}

fn compute_reduce_grad<B: Backend>(
    op: ReduceOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
    _keep_dim: bool,
) -> Result<Tensor<B>> {
    let in_dims = input.dims().to_vec();
    let reduced_count: usize = if dims.is_empty() {
        input.elem_count()
    } else {
        dims.iter().map(|&d| in_dims[d]).product()
    };
    let scale = match op {
        ReduceOp::Sum => 1.0,
        ReduceOp::Mean => 1.0 / reduced_count as f64,
    };

    // Broadcast the output gradient back over the reduced dimensions.
    let grad_data = grad_output.to_f64_vec()?;
    let rank = in_dims.len();

    // Strides of the output shape, aligned to input coordinates: reduced
    // dims contribute stride 0 (their coordinate is dropped or pinned to 0).
    let out_dims_aligned: Vec<usize> = (0..rank)
        .map(|d| if dims.is_empty() || dims.contains(&d) { 1 } else { in_dims[d] })
        .collect();
    let aligned_shape = Shape::new(out_dims_aligned);
    let out_strides = aligned_shape.broadcast_strides(&Shape::new(in_dims.clone()));

    // grad_data is flat in logical order either way; keep_dim only changes
    // the logical shape, not the element order.
    let in_strides = Shape::new(in_dims.clone()).stride_contiguous();
    let total = input.elem_count();
    let mut out = vec![0.0f64; total];
    for (flat, slot) in out.iter_mut().enumerate() {
        let mut rem = flat;
        let mut out_flat = 0usize;
        for d in 0..rank {
            let coord = rem / in_strides[d];
            rem %= in_strides[d];
            out_flat += coord * out_strides[d];
        }
        *slot = grad_data[out_flat] * scale;
    }

    Tensor::from_f64_slice(&out, input.shape().clone(), input.dtype(), input.device())
}

// NOTE: backward tests need a concrete backend and therefore live in
// vole-cpu (the test_backward_* functions there).

/// Scatter the gradient of a narrow back into a zero tensor of the input's
/// shape at the original position.
fn scatter_narrow_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    dim: usize,
    start: usize,
    len: usize,
) -> Result<Tensor<B>> {
    let in_dims = input.dims().to_vec();
    let grad_data = grad_output.to_f64_vec()?;
    let mut out = vec![0.0f64; input.elem_count()];

    let in_strides = Shape::new(in_dims.clone()).stride_contiguous();
    let mut narrowed_dims = in_dims.clone();
    narrowed_dims[dim] = len;
    let narrow_strides = Shape::new(narrowed_dims.clone()).stride_contiguous();
    let rank = in_dims.len();

    for (flat, &g) in grad_data.iter().enumerate() {
        let mut rem = flat;
        let mut in_flat = 0usize;
        for d in 0..rank {
            let mut coord = rem / narrow_strides[d];
            rem %= narrow_strides[d];
            if d == dim {
                coord += start;
            }
            in_flat += coord * in_strides[d];
        }
        out[in_flat] = g;
    }

    Tensor::from_f64_slice(&out, input.shape().clone(), input.dtype(), input.device())
}
