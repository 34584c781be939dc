//! # Vole
//!
//! A small tensor runtime with first-class jagged (ragged) tensors.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `vole-core` | Tensor, Shape, DType, Layout, Backend trait, Autograd |
//! | `vole-cpu` | CPU backend |
//! | `vole-jagged` | NestedTensor, ragged symbols + registry, dispatch router, serialization hooks |

/// Re-export core types.
pub use vole_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp},
    op::{GradFn, Op, TensorId},
    DType, Error, GradStore, Layout, Result, Shape, Tensor, WithDType,
};

/// Re-export the CPU backend.
pub use vole_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export the jagged layer.
pub use vole_jagged::{
    jagged_from_list, registry, wrap_values, DispatchTables, JaggedMeta, JaggedOp, NestedTensor,
    Operand, RaggedRegistry, RaggedSym, SymDim, SymShape,
};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::{
        jagged_from_list, CpuBackend, CpuDevice, CpuTensor, DType, DispatchTables, GradStore,
        JaggedOp, NestedTensor, Operand, Shape, SymDim, Tensor,
    };
}
