use std::collections::HashMap;
use std::fmt;

use vole_core::backend::{BinaryOp, UnaryOp};
use vole_core::{bail, Backend, Error, Result, Tensor};

use crate::nested::NestedTensor;

// Dispatch router
//
// Every operation invoked with at least one nested operand goes through
// two rule tables, keyed by a closed, enumerable operation set:
//
//   1. Function-level rules run first. They cover conveniences that are
//      not real kernels; a rule declines by returning
//      Error::UnsupportedOp, and the router then re-runs the operation
//      with interception disabled — every nested operand replaced by its
//      plain values buffer — as the universal escape hatch.
//
//   2. Kernel-level rules understand ragged shapes and lower the logical
//      operation onto the dense buffer. A missing kernel rule is a hard
//      failure naming the operation: shape-sensitive kernels must never
//      silently run against the un-ragged dense shape.
//
// Both tables accept user registrations; the defaults cover elementwise
// arithmetic, matmul against a dense matrix, and sum_all.

/// The closed set of routable operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JaggedOp {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Square,
    Matmul,
    SumAll,
    MeanAll,
    ElemCount,
}

impl JaggedOp {
    /// Stable name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            JaggedOp::Add => "add",
            JaggedOp::Sub => "sub",
            JaggedOp::Mul => "mul",
            JaggedOp::Div => "div",
            JaggedOp::Neg => "neg",
            JaggedOp::Abs => "abs",
            JaggedOp::Exp => "exp",
            JaggedOp::Log => "log",
            JaggedOp::Sqrt => "sqrt",
            JaggedOp::Square => "square",
            JaggedOp::Matmul => "matmul",
            JaggedOp::SumAll => "sum_all",
            JaggedOp::MeanAll => "mean_all",
            JaggedOp::ElemCount => "elem_count",
        }
    }

    /// Every routable operation, in declaration order.
    pub fn all() -> &'static [JaggedOp] {
        &[
            JaggedOp::Add,
            JaggedOp::Sub,
            JaggedOp::Mul,
            JaggedOp::Div,
            JaggedOp::Neg,
            JaggedOp::Abs,
            JaggedOp::Exp,
            JaggedOp::Log,
            JaggedOp::Sqrt,
            JaggedOp::Square,
            JaggedOp::Matmul,
            JaggedOp::SumAll,
            JaggedOp::MeanAll,
            JaggedOp::ElemCount,
        ]
    }
}

impl fmt::Display for JaggedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An argument or result flowing through the router.
pub enum Operand<B: Backend> {
    Dense(Tensor<B>),
    Nested(NestedTensor<B>),
    Count(usize),
}

impl<B: Backend> Clone for Operand<B> {
    fn clone(&self) -> Self {
        match self {
            Operand::Dense(t) => Operand::Dense(t.clone()),
            Operand::Nested(nt) => Operand::Nested(nt.clone()),
            Operand::Count(n) => Operand::Count(*n),
        }
    }
}

impl<B: Backend> fmt::Debug for Operand<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Dense(t) => write!(f, "Dense({:?})", t),
            Operand::Nested(nt) => write!(f, "Nested({})", nt),
            Operand::Count(n) => write!(f, "Count({})", n),
        }
    }
}

impl<B: Backend> Operand<B> {
    /// Whether this operand is a nested tensor.
    pub fn is_nested(&self) -> bool {
        matches!(self, Operand::Nested(_))
    }

    /// The nested tensor inside, if any.
    pub fn as_nested(&self) -> Option<&NestedTensor<B>> {
        match self {
            Operand::Nested(nt) => Some(nt),
            _ => None,
        }
    }

    /// The dense tensor inside, if any.
    pub fn as_dense(&self) -> Option<&Tensor<B>> {
        match self {
            Operand::Dense(t) => Some(t),
            _ => None,
        }
    }

    /// The plain underlying tensor: a dense operand as-is, a nested operand
    /// as its values buffer. Used when interception is disabled.
    fn plain_tensor(&self) -> Result<Tensor<B>> {
        match self {
            Operand::Dense(t) => Ok(t.clone()),
            Operand::Nested(nt) => Ok(nt.raw_values().clone()),
            Operand::Count(_) => Err(Error::msg("count operand has no tensor form")),
        }
    }
}

/// Wrap a rule result as the values of a nested tensor.
///
/// The values slot must hold a dense buffer; handing a nested operand back
/// in is refused — wrappers never nest.
pub fn wrap_values<B: Backend>(
    values: Operand<B>,
    offsets: &Tensor<B>,
) -> Result<NestedTensor<B>> {
    match values {
        Operand::Dense(t) => NestedTensor::new(t, offsets),
        Operand::Nested(_) => Err(Error::NestedValues),
        Operand::Count(_) => Err(Error::msg("count operand has no tensor form")),
    }
}

/// A handler in one of the two rule tables.
pub type Rule<B> = Box<dyn Fn(&[Operand<B>]) -> Result<Operand<B>> + Send + Sync>;

/// The two-tier rule table driving the router.
pub struct DispatchTables<B: Backend> {
    kernel: HashMap<JaggedOp, Rule<B>>,
    function: HashMap<JaggedOp, Rule<B>>,
}

impl<B: Backend> Default for DispatchTables<B> {
    fn default() -> Self {
        let mut tables = Self::empty();
        tables.register_defaults();
        tables
    }
}

impl<B: Backend> DispatchTables<B> {
    /// Tables with no rules at all.
    pub fn empty() -> Self {
        DispatchTables {
            kernel: HashMap::new(),
            function: HashMap::new(),
        }
    }

    /// Register (or replace) a kernel-level rule.
    pub fn register_kernel(
        &mut self,
        op: JaggedOp,
        rule: impl Fn(&[Operand<B>]) -> Result<Operand<B>> + Send + Sync + 'static,
    ) {
        self.kernel.insert(op, Box::new(rule));
    }

    /// Register (or replace) a function-level rule.
    pub fn register_function(
        &mut self,
        op: JaggedOp,
        rule: impl Fn(&[Operand<B>]) -> Result<Operand<B>> + Send + Sync + 'static,
    ) {
        self.function.insert(op, Box::new(rule));
    }

    /// Route an operation with at least one nested operand.
    pub fn dispatch(&self, op: JaggedOp, args: &[Operand<B>]) -> Result<Operand<B>> {
        if let Some(rule) = self.function.get(&op) {
            return match rule(args) {
                // The rule declined: run with interception disabled.
                Err(Error::UnsupportedOp { .. }) => self.run_detached(op, args),
                other => other,
            };
        }
        if let Some(rule) = self.kernel.get(&op) {
            return rule(args);
        }
        Err(Error::unsupported_op(op.name()))
    }

    /// Evaluate an operation with wrapper interception disabled: nested
    /// operands become their plain values buffers and the op runs densely.
    fn run_detached(&self, op: JaggedOp, args: &[Operand<B>]) -> Result<Operand<B>> {
        let plain: Vec<Tensor<B>> = args
            .iter()
            .map(|a| a.plain_tensor())
            .collect::<Result<_>>()?;
        apply_plain(op, &plain)
    }

    fn register_defaults(&mut self) {
        for &op in &[JaggedOp::Add, JaggedOp::Sub, JaggedOp::Mul, JaggedOp::Div] {
            let bin = binary_kind(op).expect("binary op kind");
            self.register_kernel(op, move |args| k_elementwise_binary(bin, op, args));
        }
        for &op in &[
            JaggedOp::Neg,
            JaggedOp::Abs,
            JaggedOp::Exp,
            JaggedOp::Log,
            JaggedOp::Sqrt,
            JaggedOp::Square,
        ] {
            let un = unary_kind(op).expect("unary op kind");
            self.register_kernel(op, move |args| k_elementwise_unary(un, op, args));
        }
        self.register_kernel(JaggedOp::Matmul, k_matmul);
        self.register_kernel(JaggedOp::SumAll, k_sum_all);

        // elem_count is not a kernel: the logical count is symbolic, so the
        // rule declines and the escape hatch reports the plain buffer size.
        self.register_function(JaggedOp::ElemCount, |_args| {
            Err(Error::unsupported_op(JaggedOp::ElemCount.name()))
        });
    }
}

fn binary_kind(op: JaggedOp) -> Option<BinaryOp> {
    match op {
        JaggedOp::Add => Some(BinaryOp::Add),
        JaggedOp::Sub => Some(BinaryOp::Sub),
        JaggedOp::Mul => Some(BinaryOp::Mul),
        JaggedOp::Div => Some(BinaryOp::Div),
        _ => None,
    }
}

fn unary_kind(op: JaggedOp) -> Option<UnaryOp> {
    match op {
        JaggedOp::Neg => Some(UnaryOp::Neg),
        JaggedOp::Abs => Some(UnaryOp::Abs),
        JaggedOp::Exp => Some(UnaryOp::Exp),
        JaggedOp::Log => Some(UnaryOp::Log),
        JaggedOp::Sqrt => Some(UnaryOp::Sqrt),
        JaggedOp::Square => Some(UnaryOp::Square),
        _ => None,
    }
}

fn apply_binary_dense<B: Backend>(
    op: BinaryOp,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<Tensor<B>> {
    match op {
        BinaryOp::Add => lhs.add(rhs),
        BinaryOp::Sub => lhs.sub(rhs),
        BinaryOp::Mul => lhs.mul(rhs),
        BinaryOp::Div => lhs.div(rhs),
    }
}

fn apply_unary_dense<B: Backend>(op: UnaryOp, input: &Tensor<B>) -> Result<Tensor<B>> {
    match op {
        UnaryOp::Neg => input.neg(),
        UnaryOp::Abs => input.abs(),
        UnaryOp::Exp => input.exp(),
        UnaryOp::Log => input.log(),
        UnaryOp::Sqrt => input.sqrt(),
        UnaryOp::Square => input.square(),
    }
}

fn expect_args<B: Backend>(op: JaggedOp, args: &[Operand<B>], n: usize) -> Result<()> {
    if args.len() != n {
        bail!(
            "operation '{}' expects {} operand(s), got {}",
            op.name(),
            n,
            args.len()
        );
    }
    Ok(())
}

/// Shared lowering for nested elementwise arithmetic.
///
/// Two nested operands must carry token-identical ragged structure — the
/// check reads only the symbols, never the offset values. A dense operand
/// broadcasts over the rows of the nested one.
pub(crate) fn nested_binary<B: Backend>(
    op: BinaryOp,
    lhs: &Operand<B>,
    rhs: &Operand<B>,
) -> Result<Operand<B>> {
    match (lhs, rhs) {
        (Operand::Nested(l), Operand::Nested(r)) => {
            if !l.ragged_sym().same_structure(&r.ragged_sym()) {
                bail!(
                    "ragged structure mismatch: {} vs {} were built from different \
                     offsets buffers",
                    l.size(),
                    r.size()
                );
            }
            let values = apply_binary_dense(op, l.raw_values(), r.raw_values())?;
            let out = NestedTensor::new(values, l.offsets())?;
            Ok(Operand::Nested(propagate_grad(out, l.requires_grad() || r.requires_grad())))
        }
        (Operand::Nested(l), Operand::Dense(d)) => {
            let values = apply_binary_dense(op, l.raw_values(), d)?;
            let out = NestedTensor::new(values, l.offsets())?;
            Ok(Operand::Nested(propagate_grad(out, l.requires_grad())))
        }
        (Operand::Dense(d), Operand::Nested(r)) => {
            let values = apply_binary_dense(op, d, r.raw_values())?;
            let out = NestedTensor::new(values, r.offsets())?;
            Ok(Operand::Nested(propagate_grad(out, r.requires_grad())))
        }
        (Operand::Dense(l), Operand::Dense(r)) => {
            Ok(Operand::Dense(apply_binary_dense(op, l, r)?))
        }
        _ => Err(Error::msg("count operand has no tensor form")),
    }
}

pub(crate) fn nested_unary<B: Backend>(op: UnaryOp, arg: &Operand<B>) -> Result<Operand<B>> {
    match arg {
        Operand::Nested(nt) => {
            let values = apply_unary_dense(op, nt.raw_values())?;
            let out = NestedTensor::new(values, nt.offsets())?;
            Ok(Operand::Nested(propagate_grad(out, nt.requires_grad())))
        }
        Operand::Dense(t) => Ok(Operand::Dense(apply_unary_dense(op, t)?)),
        Operand::Count(_) => Err(Error::msg("count operand has no tensor form")),
    }
}

/// Logical `[B, x, D] @ [D, E]`, lowered to a dense `[sum(x), D] @ [D, E]`
/// and rewrapped with the same offsets.
pub(crate) fn nested_matmul<B: Backend>(
    nt: &NestedTensor<B>,
    rhs: &Tensor<B>,
) -> Result<NestedTensor<B>> {
    let values = nt.raw_values().matmul(rhs)?;
    let out = NestedTensor::new(values, nt.offsets())?;
    Ok(propagate_grad(out, nt.requires_grad()))
}

fn propagate_grad<B: Backend>(nt: NestedTensor<B>, requires_grad: bool) -> NestedTensor<B> {
    if requires_grad {
        nt.set_requires_grad()
    } else {
        nt
    }
}

fn k_elementwise_binary<B: Backend>(
    bin: BinaryOp,
    op: JaggedOp,
    args: &[Operand<B>],
) -> Result<Operand<B>> {
    expect_args(op, args, 2)?;
    nested_binary(bin, &args[0], &args[1])
}

fn k_elementwise_unary<B: Backend>(
    un: UnaryOp,
    op: JaggedOp,
    args: &[Operand<B>],
) -> Result<Operand<B>> {
    expect_args(op, args, 1)?;
    nested_unary(un, &args[0])
}

fn k_matmul<B: Backend>(args: &[Operand<B>]) -> Result<Operand<B>> {
    expect_args(JaggedOp::Matmul, args, 2)?;
    match (&args[0], &args[1]) {
        (Operand::Nested(nt), Operand::Dense(rhs)) => {
            Ok(Operand::Nested(nested_matmul(nt, rhs)?))
        }
        (Operand::Nested(_), Operand::Nested(_)) => {
            Err(Error::msg("matmul between two nested tensors is not supported"))
        }
        (Operand::Dense(l), Operand::Dense(r)) => Ok(Operand::Dense(l.matmul(r)?)),
        _ => Err(Error::msg("matmul expects tensor operands")),
    }
}

fn k_sum_all<B: Backend>(args: &[Operand<B>]) -> Result<Operand<B>> {
    expect_args(JaggedOp::SumAll, args, 1)?;
    match &args[0] {
        Operand::Nested(nt) => Ok(Operand::Dense(nt.raw_values().sum_all()?)),
        Operand::Dense(t) => Ok(Operand::Dense(t.sum_all()?)),
        Operand::Count(_) => Err(Error::msg("count operand has no tensor form")),
    }
}

/// Closed dense evaluator used when interception is disabled.
fn apply_plain<B: Backend>(op: JaggedOp, args: &[Tensor<B>]) -> Result<Operand<B>> {
    let need = |n: usize| -> Result<()> {
        if args.len() != n {
            bail!(
                "operation '{}' expects {} operand(s), got {}",
                op.name(),
                n,
                args.len()
            );
        }
        Ok(())
    };
    if let Some(bin) = binary_kind(op) {
        need(2)?;
        return Ok(Operand::Dense(apply_binary_dense(bin, &args[0], &args[1])?));
    }
    if let Some(un) = unary_kind(op) {
        need(1)?;
        return Ok(Operand::Dense(apply_unary_dense(un, &args[0])?));
    }
    match op {
        JaggedOp::Matmul => {
            need(2)?;
            Ok(Operand::Dense(args[0].matmul(&args[1])?))
        }
        JaggedOp::SumAll => {
            need(1)?;
            Ok(Operand::Dense(args[0].sum_all()?))
        }
        JaggedOp::MeanAll => {
            need(1)?;
            Ok(Operand::Dense(args[0].mean_all()?))
        }
        JaggedOp::ElemCount => {
            need(1)?;
            Ok(Operand::Count(args[0].elem_count()))
        }
        _ => Err(Error::unsupported_op(op.name())),
    }
}

// Convenience methods lowering through the same kernels as the router.
impl<B: Backend> NestedTensor<B> {
    /// Element-wise addition with a structure-compatible nested tensor.
    pub fn add(&self, rhs: &NestedTensor<B>) -> Result<NestedTensor<B>> {
        nested_nested(BinaryOp::Add, self, rhs)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, rhs: &NestedTensor<B>) -> Result<NestedTensor<B>> {
        nested_nested(BinaryOp::Sub, self, rhs)
    }

    /// Element-wise multiplication.
    pub fn mul(&self, rhs: &NestedTensor<B>) -> Result<NestedTensor<B>> {
        nested_nested(BinaryOp::Mul, self, rhs)
    }

    /// Element-wise division.
    pub fn div(&self, rhs: &NestedTensor<B>) -> Result<NestedTensor<B>> {
        nested_nested(BinaryOp::Div, self, rhs)
    }

    /// Element-wise negation.
    pub fn neg(&self) -> Result<NestedTensor<B>> {
        nested_unary_nested(UnaryOp::Neg, self)
    }

    /// Element-wise exponential.
    pub fn exp(&self) -> Result<NestedTensor<B>> {
        nested_unary_nested(UnaryOp::Exp, self)
    }

    /// Logical matmul against a dense `[D, E]` matrix.
    pub fn matmul(&self, rhs: &Tensor<B>) -> Result<NestedTensor<B>> {
        nested_matmul(self, rhs)
    }

    /// Sum of every element, as a dense scalar.
    pub fn sum_all(&self) -> Result<Tensor<B>> {
        self.values().sum_all()
    }
}

fn nested_nested<B: Backend>(
    op: BinaryOp,
    lhs: &NestedTensor<B>,
    rhs: &NestedTensor<B>,
) -> Result<NestedTensor<B>> {
    match nested_binary(
        op,
        &Operand::Nested(lhs.clone()),
        &Operand::Nested(rhs.clone()),
    )? {
        Operand::Nested(out) => Ok(out),
        _ => Err(Error::msg("elementwise result must be nested")),
    }
}

fn nested_unary_nested<B: Backend>(op: UnaryOp, nt: &NestedTensor<B>) -> Result<NestedTensor<B>> {
    match nested_unary(op, &Operand::Nested(nt.clone()))? {
        Operand::Nested(out) => Ok(out),
        _ => Err(Error::msg("elementwise result must be nested")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nested::jagged_from_list;
    use vole_core::DType;
    use vole_cpu::{CpuBackend, CpuDevice, CpuTensor};

    fn sample(dev: &CpuDevice) -> (NestedTensor<CpuBackend>, CpuTensor) {
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, dev).unwrap();
        let b = CpuTensor::from_f64_slice(&[5.0, 6.0], (1, 2), DType::F64, dev).unwrap();
        jagged_from_list(&[a, b]).unwrap()
    }

    #[test]
    fn test_kernel_rule_add_same_offsets() {
        let dev = CpuDevice;
        let (nt, offsets) = sample(&dev);
        let tables = DispatchTables::default();

        let out = tables
            .dispatch(
                JaggedOp::Add,
                &[Operand::Nested(nt.clone()), Operand::Nested(nt.clone())],
            )
            .unwrap();
        let out = out.as_nested().expect("add returns a nested tensor").clone();
        assert_eq!(out.offsets().id(), offsets.id());
        assert_eq!(out.ragged_sym(), nt.ragged_sym());
        assert_eq!(
            out.values().to_f64_vec().unwrap(),
            vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0]
        );
    }

    #[test]
    fn test_kernel_rule_rejects_mismatched_structure() {
        let dev = CpuDevice;
        let (nt1, _) = sample(&dev);
        // Same contents, different offsets allocation: different structure.
        let (nt2, _) = sample(&dev);
        let tables = DispatchTables::default();

        let err = tables
            .dispatch(
                JaggedOp::Add,
                &[Operand::Nested(nt1), Operand::Nested(nt2)],
            )
            .unwrap_err();
        assert!(err.to_string().contains("ragged structure mismatch"));
    }

    #[test]
    fn test_kernel_rule_broadcasts_dense_rhs() {
        let dev = CpuDevice;
        let (nt, _) = sample(&dev);
        let bias = CpuTensor::from_f64_slice(&[10.0, 20.0], 2, DType::F64, &dev).unwrap();
        let tables = DispatchTables::default();

        let out = tables
            .dispatch(
                JaggedOp::Add,
                &[Operand::Nested(nt), Operand::Dense(bias)],
            )
            .unwrap();
        let out = out.as_nested().unwrap();
        assert_eq!(
            out.values().to_f64_vec().unwrap(),
            vec![11.0, 22.0, 13.0, 24.0, 15.0, 26.0]
        );
    }

    #[test]
    fn test_kernel_rule_unary() {
        let dev = CpuDevice;
        let (nt, _) = sample(&dev);
        let tables = DispatchTables::default();

        let out = tables
            .dispatch(JaggedOp::Neg, &[Operand::Nested(nt)])
            .unwrap();
        assert_eq!(
            out.as_nested().unwrap().values().to_f64_vec().unwrap(),
            vec![-1.0, -2.0, -3.0, -4.0, -5.0, -6.0]
        );
    }

    #[test]
    fn test_kernel_rule_matmul_lowers_to_dense() {
        let dev = CpuDevice;
        let (nt, offsets) = sample(&dev);
        // [2, x, 2] @ [2, 3] → [2, x, 3]
        let w = CpuTensor::from_f64_slice(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0], (2, 3), DType::F64, &dev)
            .unwrap();
        let tables = DispatchTables::default();

        let out = tables
            .dispatch(
                JaggedOp::Matmul,
                &[Operand::Nested(nt), Operand::Dense(w)],
            )
            .unwrap();
        let out = out.as_nested().unwrap();
        assert_eq!(out.offsets().id(), offsets.id());
        assert_eq!(out.size().dims()[2], crate::symbol::SymDim::Fixed(3));
        assert_eq!(
            out.values().to_f64_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 3.0, 4.0, 7.0, 5.0, 6.0, 11.0]
        );
    }

    #[test]
    fn test_missing_rule_fails_naming_the_op() {
        let dev = CpuDevice;
        let (nt, _) = sample(&dev);
        let tables = DispatchTables::default();

        let err = tables
            .dispatch(JaggedOp::MeanAll, &[Operand::Nested(nt)])
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOp { .. }));
        assert!(err.to_string().contains("mean_all"));
    }

    #[test]
    fn test_declining_function_rule_falls_through() {
        let dev = CpuDevice;
        let (nt, _) = sample(&dev);
        let tables = DispatchTables::default();

        // elem_count's function rule declines; the escape hatch runs against
        // the plain values buffer.
        let out = tables
            .dispatch(JaggedOp::ElemCount, &[Operand::Nested(nt)])
            .unwrap();
        assert!(matches!(out, Operand::Count(6)));
    }

    #[test]
    fn test_user_registered_function_rule_declines_to_detached() {
        let dev = CpuDevice;
        let (nt, _) = sample(&dev);
        let mut tables = DispatchTables::default();
        tables.register_function(JaggedOp::MeanAll, |_args| {
            Err(Error::unsupported_op(JaggedOp::MeanAll.name()))
        });

        let out = tables
            .dispatch(JaggedOp::MeanAll, &[Operand::Nested(nt)])
            .unwrap();
        let mean = out.as_dense().unwrap().to_scalar_f64().unwrap();
        assert_eq!(mean, 3.5);
    }

    #[test]
    fn test_user_registered_kernel_rule_wins() {
        let dev = CpuDevice;
        let (nt, _) = sample(&dev);
        let mut tables = DispatchTables::default();
        tables.register_kernel(JaggedOp::MeanAll, |args| match &args[0] {
            Operand::Nested(nt) => Ok(Operand::Dense(nt.values().mean_all()?)),
            _ => Err(Error::msg("expected a nested operand")),
        });

        let out = tables
            .dispatch(JaggedOp::MeanAll, &[Operand::Nested(nt)])
            .unwrap();
        assert_eq!(out.as_dense().unwrap().to_scalar_f64().unwrap(), 3.5);
    }

    #[test]
    fn test_wrap_values_refuses_nested() {
        let dev = CpuDevice;
        let (nt, offsets) = sample(&dev);
        let err = wrap_values(Operand::Nested(nt), &offsets).unwrap_err();
        assert!(matches!(err, Error::NestedValues));
    }

    #[test]
    fn test_empty_tables_fail_closed() {
        let dev = CpuDevice;
        let (nt, _) = sample(&dev);
        let tables: DispatchTables<CpuBackend> = DispatchTables::empty();
        let err = tables
            .dispatch(JaggedOp::Add, &[Operand::Nested(nt.clone()), Operand::Nested(nt)])
            .unwrap_err();
        assert!(err.to_string().contains("add"));
    }

    #[test]
    fn test_convenience_methods_match_router() {
        let dev = CpuDevice;
        let (nt, _) = sample(&dev);
        let doubled = nt.add(&nt).unwrap();
        assert_eq!(
            doubled.values().to_f64_vec().unwrap(),
            vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0]
        );
        assert_eq!(nt.sum_all().unwrap().to_scalar_f64().unwrap(), 21.0);
    }
}
