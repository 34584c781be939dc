//! # vole-jagged
//!
//! Jagged (ragged) tensors for Vole: a batch of variable-length rows stored
//! as one dense values buffer plus an offsets index, presented as a tensor
//! with one symbolic ragged dimension.
//!
//! This crate provides:
//! - [`NestedTensor`] — the wrapper: values + offsets + symbolic
//!   shape/strides, constructed directly or via [`NestedTensor::from_list`]
//! - [`RaggedSym`] / [`SymDim`] / [`SymShape`] — dimension descriptors that
//!   are either concrete or an opaque ragged token; structure compatibility
//!   is token identity, never offset contents
//! - [`registry`] — the process-wide resolve-or-mint table associating each
//!   offsets buffer (by identity, weakly held) with its symbol
//! - `NestedTensor::values` / `NestedTensor::grad` — the differentiable
//!   boundary between nested and dense
//! - [`DispatchTables`] — the two-tier operation router (function-level
//!   rules with a disable-interception escape hatch, kernel-level rules
//!   that fail closed)
//! - `NestedTensor::flatten` / `NestedTensor::unflatten` — serialization
//!   hooks that carry the ragged symbol through a side channel

pub mod boundary;
pub mod dispatch;
pub mod nested;
pub mod registry;
pub mod symbol;

pub use dispatch::{wrap_values, DispatchTables, JaggedOp, Operand};
pub use nested::{jagged_from_list, JaggedMeta, NestedTensor};
pub use registry::{registry, RaggedRegistry};
pub use symbol::{RaggedSym, SymDim, SymShape};
