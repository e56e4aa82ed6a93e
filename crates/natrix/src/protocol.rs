//! The capability-dispatch protocol for two-operand operations.
//!
//! Every binary operation, comparison, and in-place operation is resolved by
//! asking the operand types themselves, in a fixed order:
//!
//! 1. the left operand's forward capability;
//! 2. if it *declines* (returns [`Dispatched::NotImplemented`], which is an
//!    answer, not an error) and the right operand has a different runtime
//!    type, the right operand's reflected capability;
//! 3. if both decline, the operation fails with a `TypeError` naming both
//!    types and the operator.
//!
//! The protocol is generic over [`Operand`], which requires only a type
//! descriptor and whatever subset of capabilities a type cares to implement
//! (a capability is "implemented" by overriding the defaulted method). The
//! interpreter's `Value` is one operand type; tests exercise the same
//! algorithms with their own.

use crate::exception::{ExcType, RunResult};

/// Binary operators subject to capability dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinaryOp {
    /// The operator's source spelling, used in error messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::TrueDiv => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "** or pow()",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
        }
    }

    /// The augmented-assignment spelling (`+=`), used in error messages for
    /// the in-place path.
    #[must_use]
    pub fn inplace_symbol(self) -> &'static str {
        match self {
            Self::Add => "+=",
            Self::Sub => "-=",
            Self::Mul => "*=",
            Self::TrueDiv => "/=",
            Self::FloorDiv => "//=",
            Self::Mod => "%=",
            Self::Pow => "**=",
            Self::LShift => "<<=",
            Self::RShift => ">>=",
            Self::BitAnd => "&=",
            Self::BitOr => "|=",
            Self::BitXor => "^=",
        }
    }
}

/// Unary operators subject to capability dispatch.
///
/// `not` is absent: it is defined by truthiness for every type and never
/// declines, so the VM handles it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Pos,
    Neg,
    Invert,
}

impl UnaryOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Pos => "+",
            Self::Neg => "-",
            Self::Invert => "~",
        }
    }
}

/// Rich comparison operators at the protocol entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CmpOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// The comparison directions a type actually implements.
///
/// `>` and `>=` are synthesized by the protocol from their mirrors with
/// swapped operands, and `!=` from `==`, so exactly one canonical direction
/// exists per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonCmp {
    Lt,
    Le,
    Eq,
}

/// Outcome of a capability probe: a result, or an explicit refusal meaning
/// "try the other operand". Refusal is distinct from failure; a capability
/// that *fails* returns `Err` and dispatch stops immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched<T> {
    Done(T),
    NotImplemented,
}

/// A runtime value that can participate in capability dispatch.
///
/// `C` is the evaluation context the capabilities run against (the
/// interpreter passes its heap and interner; simpler operand types use
/// `()`). All capability methods default to declining.
pub trait Operand<C>: Sized {
    /// The type name used in error messages.
    fn type_name(&self, ctx: &C) -> &'static str;

    /// Whether both operands have the same runtime type. Reflected dispatch
    /// is skipped for same-type operands: if the type's own capability
    /// declined, asking the same type again cannot help.
    fn same_type(&self, other: &Self, ctx: &C) -> bool;

    /// Forward binary capability: `self op rhs`.
    fn binary(&self, _op: BinaryOp, _rhs: &Self, _ctx: &mut C) -> RunResult<Dispatched<Self>> {
        Ok(Dispatched::NotImplemented)
    }

    /// Reflected binary capability: `lhs op self`, asked of the right
    /// operand after the left declined.
    fn binary_reflected(&self, _op: BinaryOp, _lhs: &Self, _ctx: &mut C) -> RunResult<Dispatched<Self>> {
        Ok(Dispatched::NotImplemented)
    }

    /// In-place binary capability: `self op= rhs`. Mutating types override
    /// this; everything else falls back to the plain operation.
    fn binary_inplace(&self, _op: BinaryOp, _rhs: &Self, _ctx: &mut C) -> RunResult<Dispatched<Self>> {
        Ok(Dispatched::NotImplemented)
    }

    /// Canonical-direction comparison capability.
    fn compare(&self, _op: CanonCmp, _rhs: &Self, _ctx: &mut C) -> RunResult<Dispatched<bool>> {
        Ok(Dispatched::NotImplemented)
    }

    /// Unary capability.
    fn unary(&self, _op: UnaryOp, _ctx: &mut C) -> RunResult<Dispatched<Self>> {
        Ok(Dispatched::NotImplemented)
    }
}

/// Resolves `lhs op rhs` through forward and reflected capabilities.
pub fn binary_op<C, O: Operand<C>>(op: BinaryOp, lhs: &O, rhs: &O, ctx: &mut C) -> RunResult<O> {
    if let Dispatched::Done(v) = lhs.binary(op, rhs, ctx)? {
        return Ok(v);
    }
    if !lhs.same_type(rhs, ctx)
        && let Dispatched::Done(v) = rhs.binary_reflected(op, lhs, ctx)?
    {
        return Ok(v);
    }
    Err(ExcType::binary_type_error(
        op.symbol(),
        lhs.type_name(ctx),
        rhs.type_name(ctx),
    ))
}

/// Resolves `lhs op= rhs`: the in-place capability first, then the full
/// binary protocol. The caller rebinds the returned value either way; the
/// in-place capability only changes whether `lhs` was mutated.
pub fn inplace_op<C, O: Operand<C>>(op: BinaryOp, lhs: &O, rhs: &O, ctx: &mut C) -> RunResult<O> {
    if let Dispatched::Done(v) = lhs.binary_inplace(op, rhs, ctx)? {
        return Ok(v);
    }
    if let Dispatched::Done(v) = lhs.binary(op, rhs, ctx)? {
        return Ok(v);
    }
    if !lhs.same_type(rhs, ctx)
        && let Dispatched::Done(v) = rhs.binary_reflected(op, lhs, ctx)?
    {
        return Ok(v);
    }
    Err(ExcType::binary_type_error(
        op.inplace_symbol(),
        lhs.type_name(ctx),
        rhs.type_name(ctx),
    ))
}

/// Resolves a rich comparison.
///
/// `>`/`>=` dispatch as their mirror with swapped operands; `!=` is the
/// negation of `==`. Equality has a distinguished fallback: when neither
/// operand implements it, operands of different runtime types are unequal by
/// definition, while same-type operands fail.
pub fn compare_op<C, O: Operand<C>>(op: CmpOp, lhs: &O, rhs: &O, ctx: &mut C) -> RunResult<bool> {
    match op {
        CmpOp::Gt => ordering(CanonCmp::Lt, CmpOp::Gt, rhs, lhs, ctx),
        CmpOp::Ge => ordering(CanonCmp::Le, CmpOp::Ge, rhs, lhs, ctx),
        CmpOp::Lt => ordering(CanonCmp::Lt, CmpOp::Lt, lhs, rhs, ctx),
        CmpOp::Le => ordering(CanonCmp::Le, CmpOp::Le, lhs, rhs, ctx),
        CmpOp::Eq => equality(lhs, rhs, ctx),
        CmpOp::Ne => Ok(!equality(lhs, rhs, ctx)?),
    }
}

fn ordering<C, O: Operand<C>>(canon: CanonCmp, reported: CmpOp, lhs: &O, rhs: &O, ctx: &mut C) -> RunResult<bool> {
    match lhs.compare(canon, rhs, ctx)? {
        Dispatched::Done(b) => Ok(b),
        Dispatched::NotImplemented => {
            // Error messages name the operands in the order they were
            // written, so undo the swap for the mirrored operators.
            let (left, right) = match reported {
                CmpOp::Gt | CmpOp::Ge => (rhs, lhs),
                _ => (lhs, rhs),
            };
            Err(ExcType::compare_type_error(
                reported.symbol(),
                left.type_name(ctx),
                right.type_name(ctx),
            ))
        }
    }
}

fn equality<C, O: Operand<C>>(lhs: &O, rhs: &O, ctx: &mut C) -> RunResult<bool> {
    if let Dispatched::Done(b) = lhs.compare(CanonCmp::Eq, rhs, ctx)? {
        return Ok(b);
    }
    if !lhs.same_type(rhs, ctx) {
        if let Dispatched::Done(b) = rhs.compare(CanonCmp::Eq, lhs, ctx)? {
            return Ok(b);
        }
        // Values of different types with no opinion on each other are
        // simply unequal.
        return Ok(false);
    }
    Err(ExcType::binary_type_error(
        "==",
        lhs.type_name(ctx),
        rhs.type_name(ctx),
    ))
}

/// Resolves a unary operation.
pub fn unary_op<C, O: Operand<C>>(op: UnaryOp, operand: &O, ctx: &mut C) -> RunResult<O> {
    match operand.unary(op, ctx)? {
        Dispatched::Done(v) => Ok(v),
        Dispatched::NotImplemented => Err(ExcType::unary_type_error(op.symbol(), operand.type_name(ctx))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::RunError;

    /// Minimal operand pair: `IntLike` implements forward add (with
    /// `IntLike` only), reflected add, and the comparisons; `Unrelated`
    /// implements *only* reflected add.
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum TestValue {
        IntLike(i64),
        Unrelated,
    }

    use TestValue::{IntLike, Unrelated};

    impl Operand<()> for TestValue {
        fn type_name(&self, (): &()) -> &'static str {
            match self {
                IntLike(_) => "IntLike",
                Unrelated => "Unrelated",
            }
        }

        fn same_type(&self, other: &Self, (): &()) -> bool {
            matches!(
                (self, other),
                (IntLike(_), IntLike(_)) | (Unrelated, Unrelated)
            )
        }

        fn binary(&self, op: BinaryOp, rhs: &Self, (): &mut ()) -> RunResult<Dispatched<Self>> {
            match (op, self, rhs) {
                (BinaryOp::Add, IntLike(a), IntLike(b)) => Ok(Dispatched::Done(IntLike(a + b))),
                _ => Ok(Dispatched::NotImplemented),
            }
        }

        fn binary_reflected(&self, op: BinaryOp, lhs: &Self, (): &mut ()) -> RunResult<Dispatched<Self>> {
            let _ = lhs;
            match (op, self) {
                // lhs + IntLike(n) == IntLike(n): the right operand absorbs.
                (BinaryOp::Add, IntLike(n)) => Ok(Dispatched::Done(IntLike(*n))),
                (BinaryOp::Add, Unrelated) => Ok(Dispatched::Done(Unrelated)),
                _ => Ok(Dispatched::NotImplemented),
            }
        }

        fn compare(&self, op: CanonCmp, rhs: &Self, (): &mut ()) -> RunResult<Dispatched<bool>> {
            match (op, self, rhs) {
                (CanonCmp::Eq, IntLike(a), IntLike(b)) => Ok(Dispatched::Done(a == b)),
                (CanonCmp::Lt, IntLike(a), IntLike(b)) => Ok(Dispatched::Done(a < b)),
                (CanonCmp::Le, IntLike(a), IntLike(b)) => Ok(Dispatched::Done(a <= b)),
                _ => Ok(Dispatched::NotImplemented),
            }
        }
    }

    #[test]
    fn forward_add_wins() {
        let v = binary_op(BinaryOp::Add, &IntLike(1), &IntLike(2), &mut ()).unwrap();
        assert_eq!(v, IntLike(3));
    }

    #[test]
    fn reflected_add_when_left_declines() {
        // IntLike's forward add declines Unrelated; Unrelated's reflected
        // add resolves it.
        let v = binary_op(BinaryOp::Add, &IntLike(3), &Unrelated, &mut ()).unwrap();
        assert_eq!(v, Unrelated);
        // The swapped pair resolves through IntLike's reflected add.
        let v = binary_op(BinaryOp::Add, &Unrelated, &IntLike(3), &mut ()).unwrap();
        assert_eq!(v, IntLike(3));
    }

    #[test]
    fn same_type_skips_reflected() {
        // Unrelated + Unrelated: reflected is never consulted for same-type
        // operands, so this fails even though Unrelated's reflected add
        // could have answered.
        let err = binary_op(BinaryOp::Add, &Unrelated, &Unrelated, &mut ()).unwrap_err();
        match err {
            RunError::Exc(exc) => {
                assert_eq!(exc.exc_type(), ExcType::TypeError);
                assert!(exc.message().contains("'Unrelated' and 'Unrelated'"));
            }
            RunError::Internal(_) => panic!("expected guest TypeError"),
        }
    }

    #[test]
    fn both_decline_names_both_types() {
        let err = binary_op(BinaryOp::Sub, &IntLike(1), &Unrelated, &mut ()).unwrap_err();
        match err {
            RunError::Exc(exc) => {
                assert!(exc.message().contains("-"));
                assert!(exc.message().contains("'IntLike' and 'Unrelated'"));
            }
            RunError::Internal(_) => panic!("expected guest TypeError"),
        }
    }

    #[test]
    fn inplace_falls_back_to_binary() {
        let v = inplace_op(BinaryOp::Add, &IntLike(4), &IntLike(5), &mut ()).unwrap();
        assert_eq!(v, IntLike(9));
    }

    #[test]
    fn inplace_error_uses_augmented_symbol() {
        let err = inplace_op(BinaryOp::Sub, &IntLike(1), &Unrelated, &mut ()).unwrap_err();
        match err {
            RunError::Exc(exc) => assert!(exc.message().contains("-=")),
            RunError::Internal(_) => panic!("expected guest TypeError"),
        }
    }

    #[test]
    fn orderings_mirror_the_canonical_direction() {
        assert!(compare_op(CmpOp::Gt, &IntLike(3), &IntLike(2), &mut ()).unwrap());
        assert!(compare_op(CmpOp::Ge, &IntLike(3), &IntLike(3), &mut ()).unwrap());
        assert!(!compare_op(CmpOp::Gt, &IntLike(2), &IntLike(3), &mut ()).unwrap());
    }

    #[test]
    fn ordering_error_names_operands_in_written_order() {
        let err = compare_op(CmpOp::Gt, &IntLike(1), &Unrelated, &mut ()).unwrap_err();
        match err {
            RunError::Exc(exc) => {
                assert!(
                    exc.message().contains("'>' not supported between instances of 'IntLike' and 'Unrelated'"),
                    "unexpected message: {}",
                    exc.message()
                );
            }
            RunError::Internal(_) => panic!("expected guest TypeError"),
        }
    }

    #[test]
    fn equality_fallback_differs_by_type_identity() {
        // Different types, both decline: unequal, not an error.
        assert!(!compare_op(CmpOp::Eq, &IntLike(1), &Unrelated, &mut ()).unwrap());
        assert!(compare_op(CmpOp::Ne, &IntLike(1), &Unrelated, &mut ()).unwrap());
        // Same type, both decline: error.
        assert!(compare_op(CmpOp::Eq, &Unrelated, &Unrelated, &mut ()).is_err());
    }
}
