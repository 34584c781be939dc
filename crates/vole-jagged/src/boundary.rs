use std::sync::Arc;

use vole_core::{Backend, GradFn, GradStore, Result, Tensor};

use crate::nested::NestedTensor;

// Differentiable boundary
//
// Extracting the dense buffer from a nested tensor and rebuilding a nested
// tensor from a dense gradient form one forward/backward contract:
//
//   forward:  record the wrapper's offsets, hand out the values buffer
//             (no copy)
//   backward: the incoming gradient has the values buffer's shape; the
//             gradient with respect to the wrapper is that buffer rewrapped
//             with the recorded offsets
//
// The pair is registered with the autograd engine through Op::Custom, so
// a loss computed from values() flows its gradient back across the
// boundary. This is the only sanctioned way to look inside the wrapper
// when the result must stay differentiable.

/// Backward half of the values() contract: rewraps the dense gradient with
/// the offsets recorded at forward time.
struct ValuesBackward<B: Backend> {
    offsets: Tensor<B>,
}

impl<B: Backend> GradFn<B> for ValuesBackward<B> {
    fn name(&self) -> &'static str {
        "jagged_values_backward"
    }

    fn backward(&self, grad_output: &Tensor<B>) -> Result<Vec<Option<Tensor<B>>>> {
        // The gradient with respect to the nested input is itself nested:
        // rebuild the wrapper around the incoming dense gradient, then hand
        // its buffer onward to the dense graph.
        let grad_nested = NestedTensor::new(grad_output.clone(), &self.offsets)?;
        Ok(vec![Some(grad_nested.into_values())])
    }
}

impl<B: Backend> NestedTensor<B> {
    /// The dense values buffer, extracted differentiably.
    ///
    /// The returned tensor shares storage with the wrapper's buffer and
    /// records the boundary in the autograd graph, so backpropagating
    /// through it reaches this nested tensor.
    pub fn values(&self) -> Tensor<B> {
        let f = Arc::new(ValuesBackward {
            offsets: self.offsets().clone(),
        });
        let raw = self.raw_values();
        raw.with_grad_fn(vec![raw.clone()], f)
    }

    /// The gradient accumulated for this nested tensor, as a nested tensor
    /// sharing this wrapper's offsets. `None` when no gradient reached it.
    pub fn grad(&self, grads: &GradStore<B>) -> Result<Option<NestedTensor<B>>> {
        match grads.get(self.raw_values()) {
            Some(g) => Ok(Some(NestedTensor::new(g.clone(), self.offsets())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::nested::jagged_from_list;
    use vole_core::DType;
    use vole_cpu::{CpuDevice, CpuTensor};

    #[test]
    fn test_values_shares_data_without_copy() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &dev).unwrap();
        let b = CpuTensor::from_f64_slice(&[5.0, 6.0], (1, 2), DType::F64, &dev).unwrap();
        let (nt, _) = jagged_from_list(&[a, b]).unwrap();

        let v = nt.values();
        assert_eq!(v.dims(), &[3, 2]);
        assert_eq!(
            v.to_f64_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn test_differentiable_roundtrip() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0], (3, 1), DType::F64, &dev).unwrap();
        let b = CpuTensor::from_f64_slice(&[4.0, 5.0], (2, 1), DType::F64, &dev).unwrap();
        let (nt, offsets) = jagged_from_list(&[a, b]).unwrap();
        let nt = nt.set_requires_grad();

        let y = nt.values();
        let weight =
            CpuTensor::from_f64_slice(&[10.0, 20.0, 30.0, 40.0, 50.0], (5, 1), DType::F64, &dev)
                .unwrap();
        let loss = y.mul(&weight).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let g = nt.grad(&grads).unwrap().expect("gradient must reach the wrapper");
        // The gradient is itself nested and shares the wrapper's offsets.
        assert_eq!(g.offsets().id(), offsets.id());
        assert_eq!(g.ragged_sym(), nt.ragged_sym());
        assert_eq!(
            g.values().to_f64_vec().unwrap(),
            vec![10.0, 20.0, 30.0, 40.0, 50.0]
        );
    }

    #[test]
    fn test_no_grad_without_backward_path() {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0], (2, 1), DType::F64, &dev).unwrap();
        let (nt, _) = jagged_from_list(&[a]).unwrap();

        // A loss that never touches the nested tensor leaves no gradient.
        let unrelated = CpuTensor::from_f64_slice(&[3.0], 1, DType::F64, &dev).unwrap();
        let grads = unrelated.sum_all().unwrap().backward().unwrap();
        assert!(nt.grad(&grads).unwrap().is_none());
    }
}
