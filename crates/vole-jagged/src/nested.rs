use std::fmt;

use vole_core::{bail, Backend, BackendDevice, DType, Error, Result, Tensor};

use crate::registry::registry;
use crate::symbol::{RaggedSym, SymDim, SymShape};

// NestedTensor — a batch of variable-length rows behind a dense buffer
//
// A nested tensor with logical shape [B, x, D_0, ..., D_N] stores one dense
// values buffer of shape [sum(x), D_0, ..., D_N] plus an offsets buffer of
// B+1 non-decreasing i64 row boundaries: row i spans
// values[offsets[i]..offsets[i+1]]. The ragged dimension always sits
// immediately after the batch dimension.
//
// The logical size and strides use a ragged symbol for "x" (see symbol.rs);
// the leading logical stride is the symbol times the values buffer's row
// stride. The wrapper never owns its buffers exclusively — values and
// offsets are Arc-shared with whatever else references them.

/// A jagged-layout tensor: dense values buffer + offsets index, presented
/// with a symbolic logical shape `[B, x, D_0, ..., D_N]`.
#[derive(Clone)]
pub struct NestedTensor<B: Backend> {
    values: Tensor<B>,
    offsets: Tensor<B>,
    size: SymShape,
    strides: Vec<SymDim>,
    /// Index of the ragged dimension in the logical shape. Always 1: the
    /// only raggedness supported is the axis adjacent to the batch axis.
    ragged_idx: usize,
    requires_grad: bool,
}

/// Side-channel context carried by flatten/unflatten.
///
/// Symbolic sizes are not serializable; they travel here instead of inside
/// any generic state capture, and unflatten uses the symbol to re-seed the
/// registry when needed.
#[derive(Debug, Clone)]
pub struct JaggedMeta {
    pub requires_grad: bool,
    pub ragged_size: SymDim,
}

impl<B: Backend> NestedTensor<B> {
    /// Construct a nested tensor from a dense values buffer and an offsets
    /// buffer. Stores both by reference (no copy).
    ///
    /// The offsets buffer must be rank 1 with at least one element; its
    /// contents are trusted to be non-decreasing. May mint a fresh ragged
    /// symbol if this offsets buffer has never been seen.
    pub fn new(values: Tensor<B>, offsets: &Tensor<B>) -> Result<Self> {
        if offsets.rank() != 1 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: offsets.rank(),
            });
        }
        if offsets.dims()[0] == 0 {
            bail!("offsets must contain at least one element");
        }

        let sym = registry().resolve(offsets, 1);
        let batch = offsets.dims()[0] - 1;

        let mut size = Vec::with_capacity(values.rank() + 1);
        size.push(SymDim::Fixed(batch));
        size.push(SymDim::Ragged(sym));
        for &d in values.dims().iter().skip(1) {
            size.push(SymDim::Fixed(d));
        }

        let value_strides = values.layout().strides();
        let mut strides = Vec::with_capacity(value_strides.len() + 1);
        if let Some(&row_stride) = value_strides.first() {
            strides.push(SymDim::Ragged(sym.scaled(row_stride)));
        }
        for &s in value_strides {
            strides.push(SymDim::Fixed(s));
        }

        Ok(NestedTensor {
            values,
            offsets: offsets.clone(),
            size: SymShape::new(size),
            strides,
            ragged_idx: 1,
            requires_grad: false,
        })
    }

    /// Mark this nested tensor as requiring gradients. The values buffer is
    /// marked as a trainable variable so backward() accumulates into it.
    pub fn set_requires_grad(mut self) -> Self {
        self.values = self.values.set_variable();
        self.requires_grad = true;
        self
    }

    // Accessors

    /// The offsets buffer marking row boundaries.
    pub fn offsets(&self) -> &Tensor<B> {
        &self.offsets
    }

    /// The dense values buffer, bypassing gradient tracking.
    ///
    /// Reserved for the dispatch layer; user code that needs gradients to
    /// flow must go through [`NestedTensor::values`] instead.
    pub(crate) fn raw_values(&self) -> &Tensor<B> {
        &self.values
    }

    pub(crate) fn into_values(self) -> Tensor<B> {
        self.values
    }

    /// The symbolic logical shape `[B, x, D_0, ..., D_N]`.
    pub fn size(&self) -> &SymShape {
        &self.size
    }

    /// The symbolic logical strides.
    pub fn strides(&self) -> &[SymDim] {
        &self.strides
    }

    /// Index of the ragged dimension (always 1).
    pub fn ragged_idx(&self) -> usize {
        self.ragged_idx
    }

    /// Number of logical rows.
    pub fn batch_size(&self) -> usize {
        self.offsets.dims()[0] - 1
    }

    /// The symbol standing in for this tensor's ragged dimension.
    pub fn ragged_sym(&self) -> RaggedSym {
        self.size.dims()[self.ragged_idx]
            .as_ragged()
            .expect("ragged dimension holds a symbol")
    }

    /// Element dtype of the values buffer.
    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    /// The device the buffers live on.
    pub fn device(&self) -> &B::Device {
        self.values.device()
    }

    /// Whether this tensor participates in gradient tracking.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Per-row lengths, read from the offsets buffer.
    pub fn row_lengths(&self) -> Result<Vec<usize>> {
        let offs = self.offsets.to_f64_vec()?;
        Ok(offs.windows(2).map(|w| (w[1] - w[0]) as usize).collect())
    }

    // Serialization hooks

    /// Decompose into the two owned buffers plus the side-channel context.
    pub fn flatten(&self) -> (Tensor<B>, Tensor<B>, JaggedMeta) {
        (
            self.values.clone(),
            self.offsets.clone(),
            JaggedMeta {
                requires_grad: self.requires_grad,
                ragged_size: self.size.dims()[self.ragged_idx],
            },
        )
    }

    /// Rebuild a nested tensor from its flattened parts.
    ///
    /// If the registry holds no symbol for this offsets buffer yet, the
    /// context's symbol is associated first, so symbol identity survives
    /// the flatten/unflatten boundary instead of a duplicate being minted.
    pub fn unflatten(values: Tensor<B>, offsets: &Tensor<B>, meta: &JaggedMeta) -> Result<Self> {
        if let SymDim::Ragged(sym) = meta.ragged_size {
            if !registry().contains(offsets) {
                registry().associate(offsets, sym);
            }
        }
        let nt = Self::new(values, offsets)?;
        Ok(if meta.requires_grad {
            nt.set_requires_grad()
        } else {
            nt
        })
    }

    // Construction from a list

    /// Build a nested tensor from a list of variable-length dense tensors.
    ///
    /// Every element may differ only in its leading axis; trailing shapes,
    /// dtype, and device must agree across the list. The values buffer is
    /// the concatenation of all elements along axis 0, converted to the
    /// requested dtype/device when given. When `offsets` is not supplied it
    /// is computed as the exclusive prefix sum of the leading lengths,
    /// stored as i64 on the values device.
    ///
    /// Returns the nested tensor together with the offsets buffer in use.
    pub fn from_list(
        tensors: &[Tensor<B>],
        offsets: Option<&Tensor<B>>,
        dtype: Option<DType>,
        device: Option<&B::Device>,
    ) -> Result<(Self, Tensor<B>)> {
        if tensors.is_empty() {
            bail!("cannot construct a nested tensor from an empty list");
        }

        let first = &tensors[0];
        for t in tensors.iter().skip(1) {
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            if t.device().name() != first.device().name() {
                return Err(Error::DeviceMismatch {
                    expected: first.device().name(),
                    got: t.device().name(),
                });
            }
        }

        // Jagged layout represents (B, *, D_0, ..., D_N): only the axis
        // right after the batch axis may vary in length.
        for t in tensors {
            if t.rank() == 0 {
                bail!("nested tensor elements must have at least one dimension");
            }
            if t.dims()[1..] != first.dims()[1..] {
                bail!(
                    "cannot represent tensor list as a jagged layout: trailing shape {:?} \
                     differs from {:?}; only the leading axis may vary",
                    &t.dims()[1..],
                    &first.dims()[1..]
                );
            }
        }

        let mut values = Tensor::cat(tensors, 0)?;
        if let Some(dt) = dtype {
            values = values.to_dtype(dt)?;
        }
        if let Some(dev) = device {
            if dev.name() != values.device().name() {
                let data = values.to_f64_vec()?;
                values = Tensor::from_f64_slice(&data, values.shape().clone(), values.dtype(), dev)?;
            }
        }

        let offsets = match offsets {
            Some(o) => o.clone(),
            None => {
                let mut running = 0i64;
                let mut data = Vec::with_capacity(tensors.len() + 1);
                data.push(0.0);
                for t in tensors {
                    running += t.dims()[0] as i64;
                    data.push(running as f64);
                }
                let len = data.len();
                Tensor::from_f64_slice(&data, len, DType::I64, values.device())?
            }
        };

        let nt = Self::new(values, &offsets)?;
        Ok((nt, offsets))
    }
}

impl<B: Backend> fmt::Display for NestedTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let offs: Vec<i64> = self
            .offsets
            .to_f64_vec()
            .unwrap_or_default()
            .iter()
            .map(|&v| v as i64)
            .collect();
        write!(f, "NestedTensor(size={}, offsets={:?}", self.size, offs)?;
        if self.requires_grad {
            write!(f, ", requires_grad=true")?;
        }
        write!(f, ")")
    }
}

impl<B: Backend> fmt::Debug for NestedTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Shorthand for [`NestedTensor::from_list`] with default offsets, dtype,
/// and device.
pub fn jagged_from_list<B: Backend>(
    tensors: &[Tensor<B>],
) -> Result<(NestedTensor<B>, Tensor<B>)> {
    NestedTensor::from_list(tensors, None, None, None)
}
