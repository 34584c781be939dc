// Cross-crate integration tests for the vole facade
//
// A sequence-batch workflow exercised through the public surface only:
// build a ragged batch, push it through a linear projection, train a step
// via backward, and round-trip it through the serialization hooks.

use vole::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

#[test]
fn test_sequence_batch_projection() -> vole::Result<()> {
    let dev = CpuDevice;

    // Three sequences of lengths 2, 4, 1 with 3 features each.
    let seqs: Vec<CpuTensor> = [2usize, 4, 1]
        .iter()
        .enumerate()
        .map(|(i, &len)| {
            let data: Vec<f64> = (0..len * 3).map(|k| (i + 1) as f64 + k as f64 * 0.5).collect();
            CpuTensor::from_f64_slice(&data, (len, 3), DType::F64, &dev)
        })
        .collect::<vole::Result<_>>()?;

    let (batch, offsets) = jagged_from_list(&seqs)?;
    assert_eq!(batch.batch_size(), 3);
    assert_eq!(offsets.to_f64_vec()?, vec![0.0, 2.0, 6.0, 7.0]);
    assert_eq!(batch.values().dims(), &[7, 3]);

    // Project every timestep: [3, x, 3] @ [3, 2] → [3, x, 2].
    let w = CpuTensor::from_f64_slice(
        &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        (3, 2),
        DType::F64,
        &dev,
    )?;
    let projected = batch.matmul(&w)?;
    assert_eq!(projected.size().dims()[2], SymDim::Fixed(2));
    assert_eq!(projected.offsets().id(), offsets.id());
    assert_eq!(projected.values().dims(), &[7, 2]);
    Ok(())
}

#[test]
fn test_training_step_on_ragged_batch() -> vole::Result<()> {
    let dev = CpuDevice;
    let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0], (3, 1), DType::F64, &dev)?;
    let b = CpuTensor::from_f64_slice(&[4.0], (1, 1), DType::F64, &dev)?;
    let (batch, _) = jagged_from_list(&[a, b])?;
    let batch = batch.set_requires_grad();

    // loss = 0.5 * sum(x²); gradient is x itself.
    let loss = batch
        .mul(&batch)?
        .values()
        .sum_all()?
        .affine(0.5, 0.0)?;
    assert!(approx_eq(loss.to_scalar_f64()?, 15.0, 1e-12));

    let grads = loss.backward()?;
    let g = batch.grad(&grads)?.expect("gradient flows to the batch");
    assert_eq!(g.ragged_sym(), batch.ragged_sym());
    assert_vec_approx(&g.values().to_f64_vec()?, &[1.0, 2.0, 3.0, 4.0], 1e-12);
    Ok(())
}

#[test]
fn test_router_with_custom_rule_over_prelude_types() -> vole::Result<()> {
    let dev = CpuDevice;
    let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0], (3, 1), DType::F64, &dev)?;
    let (batch, _) = jagged_from_list(&[a])?;

    let mut tables: DispatchTables<CpuBackend> = DispatchTables::default();
    tables.register_kernel(JaggedOp::MeanAll, |args| match &args[0] {
        Operand::Nested(nt) => Ok(Operand::Dense(nt.values().mean_all()?)),
        _ => Err(vole::Error::msg("expected a nested operand")),
    });

    let out = tables.dispatch(JaggedOp::MeanAll, &[Operand::Nested(batch)])?;
    let mean = out.as_dense().unwrap().to_scalar_f64()?;
    assert!(approx_eq(mean, 2.0, 1e-12));
    Ok(())
}

#[test]
fn test_flatten_unflatten_across_a_transport_boundary() -> vole::Result<()> {
    let dev = CpuDevice;
    let a = CpuTensor::from_f64_slice(&[1.0, 2.0], (2, 1), DType::F64, &dev)?;
    let b = CpuTensor::from_f64_slice(&[3.0, 4.0, 5.0], (3, 1), DType::F64, &dev)?;
    let (batch, _) = jagged_from_list(&[a, b])?;
    let sym = batch.ragged_sym();

    let (values, offsets, meta) = batch.flatten();

    // Rebuild both buffers from raw contents, as a deserializer would.
    let fresh_values =
        CpuTensor::from_f64_slice(&values.to_f64_vec()?, values.shape().clone(), values.dtype(), &dev)?;
    let fresh_offsets =
        CpuTensor::from_f64_slice(&offsets.to_f64_vec()?, offsets.dims()[0], offsets.dtype(), &dev)?;

    let rebuilt = NestedTensor::unflatten(fresh_values, &fresh_offsets, &meta)?;
    assert_eq!(rebuilt.ragged_sym(), sym);
    assert_eq!(rebuilt.row_lengths()?, vec![2, 3]);
    assert_vec_approx(
        &rebuilt.values().to_f64_vec()?,
        &[1.0, 2.0, 3.0, 4.0, 5.0],
        1e-12,
    );
    Ok(())
}
