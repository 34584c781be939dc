use crate::shape::Shape;

/// All errors that can occur within Vole.
///
/// One enum across the whole workspace: shape and rank violations, dtype and
/// device mismatches, jagged-layout violations, and dispatch failures all
/// travel through the same type, which keeps `?` propagation uniform.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., adding [2,3] to [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors in a binary operation or list.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Device mismatch between tensors (compared by device name).
    #[error("device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: String, got: String },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Tried to read a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating a tensor from a flat slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication inner-dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}] — inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// The values slot of a nested tensor must hold a dense buffer.
    #[error("nested tensor values must be a dense tensor, not another nested tensor")]
    NestedValues,

    /// An operation reached the dispatch layer with no registered rule.
    ///
    /// Function-level rules also return this variant to decline an
    /// operation; the router treats that as "fall through", while a
    /// kernel-level miss surfaces it to the caller unchanged.
    #[error("no nested-tensor rule registered for operation '{op}'")]
    UnsupportedOp { op: String },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create the dispatch "no rule / declined" error for an operation.
    pub fn unsupported_op(op: impl Into<String>) -> Self {
        Error::UnsupportedOp { op: op.into() }
    }
}

/// Convenience Result type used throughout Vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("bad input: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
