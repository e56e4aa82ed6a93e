//! The runtime value model and its dispatch capabilities.
//!
//! [`Value`] is a small `Copy` handle: immediates live inline, strings are
//! interner ids, and everything else is a heap id. The [`Operand`]
//! implementation at the bottom of this module is where the built-in types
//! declare which protocol capabilities they support; the generic dispatch
//! order itself lives in [`crate::protocol`].
//!
//! Integers are `i64` until an operation overflows, at which point the
//! result is promoted to a heap-allocated `BigInt`. A big result that fits
//! back into `i64` is re-normalized, so a given integer has exactly one
//! representation.

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Pow, ToPrimitive, Zero};

use crate::{
    builtins::Builtin,
    exception::{ExcType, RunResult, SimpleException},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    protocol::{self, BinaryOp, CanonCmp, CmpOp, Dispatched, Operand, UnaryOp},
};

/// Runtime type descriptor for built-in values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum Type {
    #[strum(serialize = "NoneType")]
    None,
    #[strum(serialize = "bool")]
    Bool,
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "float")]
    Float,
    #[strum(serialize = "str")]
    Str,
    #[strum(serialize = "tuple")]
    Tuple,
    #[strum(serialize = "list")]
    List,
    #[strum(serialize = "set")]
    Set,
    #[strum(serialize = "dict")]
    Dict,
    #[strum(serialize = "slice")]
    Slice,
    #[strum(serialize = "function")]
    Function,
    #[strum(serialize = "builtin_function_or_method")]
    BuiltinFunction,
    #[strum(serialize = "type")]
    Class,
    #[strum(serialize = "code")]
    Code,
    #[strum(serialize = "cell")]
    Cell,
    #[strum(serialize = "Exception")]
    Exception,
}

/// A runtime value.
///
/// `Str` is an id into the interpreter's interner; `Ref` an id into its
/// heap. Ids are only meaningful within the interpreter that created them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StringId),
    Ref(HeapId),
    /// An exception class object (callable, matchable in handlers).
    Class(ExcType),
    /// A built-in function object.
    Builtin(Builtin),
}

/// Evaluation context the value capabilities run against.
pub struct RtCtx<'a> {
    pub heap: &'a mut Heap,
    pub interns: &'a mut Interns,
}

impl Value {
    /// The value's runtime type. Heap-allocated long ints report `int`:
    /// promotion is a representation detail, not a type.
    #[must_use]
    pub(crate) fn py_type(&self, heap: &Heap) -> Type {
        match self {
            Self::None => Type::None,
            Self::Bool(_) => Type::Bool,
            Self::Int(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::Str(_) => Type::Str,
            Self::Class(_) => Type::Class,
            Self::Builtin(_) => Type::BuiltinFunction,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::LongInt(_) => Type::Int,
                HeapData::Tuple(_) => Type::Tuple,
                HeapData::List(_) => Type::List,
                HeapData::Set(_) => Type::Set,
                HeapData::Dict(_) => Type::Dict,
                HeapData::Slice { .. } => Type::Slice,
                HeapData::Function(_) => Type::Function,
                HeapData::Cell(_) => Type::Cell,
                HeapData::Code(_) => Type::Code,
                HeapData::Exception(_) => Type::Exception,
            },
        }
    }

    /// The type name used in error messages. Exception instances report
    /// their class name rather than a generic "Exception".
    #[must_use]
    pub(crate) fn type_name(&self, heap: &Heap) -> &'static str {
        if let Self::Ref(id) = self
            && let HeapData::Exception(inst) = heap.get(*id)
        {
            return inst.exc_type.into();
        }
        self.py_type(heap).into()
    }

    /// Truthiness: `None`/`False`/zero/empty are false, everything else true.
    #[must_use]
    pub(crate) fn py_truth(&self, heap: &Heap) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(id) => id.index() != crate::intern::StaticStrings::EmptyString as usize,
            Self::Class(_) | Self::Builtin(_) => true,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::LongInt(n) => !n.is_zero(),
                HeapData::Tuple(items) | HeapData::List(items) => !items.is_empty(),
                HeapData::Set(entries) => !entries.is_empty(),
                HeapData::Dict(entries) => !entries.is_empty(),
                _ => true,
            },
        }
    }

    /// Length for sized values, `None` for everything else.
    #[must_use]
    pub(crate) fn py_len(&self, heap: &Heap, interns: &Interns) -> Option<usize> {
        match self {
            Self::Str(id) => Some(interns.get_str(*id).chars().count()),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Tuple(items) | HeapData::List(items) => Some(items.len()),
                HeapData::Set(entries) => Some(entries.len()),
                HeapData::Dict(entries) => Some(entries.len()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Identity comparison (`is`). Immediates compare by value, heap values
    /// by id.
    #[must_use]
    pub fn is_identical(&self, other: &Self) -> bool {
        self == other
    }

    /// Returns the integer payload for host consumption (small ints only).
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float payload for host consumption.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the bool payload for host consumption.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Key under which a value is stored in dicts and sets.
///
/// Numeric values that compare equal must hash equal (`1`, `1.0`, and `True`
/// share a slot), so bools and integral floats normalize to the integer key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Big(Box<BigInt>),
    /// Bit pattern of a float with no integral normal form.
    FloatBits(u64),
    Str(StringId),
    Class(ExcType),
    Builtin(Builtin),
    Tuple(Box<[HashKey]>),
}

/// Computes the hash key for a value, failing for unhashable types.
pub fn hash_key(value: &Value, heap: &Heap) -> RunResult<HashKey> {
    match value {
        Value::None => Ok(HashKey::None),
        Value::Bool(b) => Ok(HashKey::Int(i64::from(*b))),
        Value::Int(i) => Ok(HashKey::Int(*i)),
        Value::Float(f) => {
            if f.fract() == 0.0 && *f >= -(2f64.powi(63)) && *f < 2f64.powi(63) {
                Ok(HashKey::Int(*f as i64))
            } else {
                Ok(HashKey::FloatBits(f.to_bits()))
            }
        }
        Value::Str(id) => Ok(HashKey::Str(*id)),
        Value::Class(exc) => Ok(HashKey::Class(*exc)),
        Value::Builtin(b) => Ok(HashKey::Builtin(*b)),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::LongInt(n) => match n.to_i64() {
                Some(small) => Ok(HashKey::Int(small)),
                None => Ok(HashKey::Big(Box::new(n.clone()))),
            },
            HeapData::Tuple(items) => {
                let keys = items
                    .iter()
                    .map(|item| hash_key(item, heap))
                    .collect::<RunResult<Vec<_>>>()?;
                Ok(HashKey::Tuple(keys.into_boxed_slice()))
            }
            _ => Err(ExcType::unhashable(value.py_type(heap))),
        },
    }
}

// ---------------------------------------------------------------------------
// Numeric tower
// ---------------------------------------------------------------------------

/// A numeric operand widened out of its value representation.
enum NumView {
    Int(i64),
    Big(BigInt),
    Float(f64),
}

fn num_view(value: &Value, heap: &Heap) -> Option<NumView> {
    match value {
        Value::Bool(b) => Some(NumView::Int(i64::from(*b))),
        Value::Int(i) => Some(NumView::Int(*i)),
        Value::Float(f) => Some(NumView::Float(*f)),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::LongInt(n) => Some(NumView::Big(n.clone())),
            _ => None,
        },
        _ => None,
    }
}

/// Stores an integer result, demoting to the inline representation when it
/// fits.
fn int_value(big: BigInt, heap: &mut Heap) -> Value {
    match big.to_i64() {
        Some(small) => Value::Int(small),
        None => Value::Ref(heap.allocate(HeapData::LongInt(big))),
    }
}

fn num_to_f64(view: &NumView) -> f64 {
    match view {
        NumView::Int(i) => *i as f64,
        NumView::Big(n) => n.to_f64().unwrap_or(f64::INFINITY),
        NumView::Float(f) => *f,
    }
}

fn to_big(view: NumView) -> BigInt {
    match view {
        NumView::Int(i) => BigInt::from(i),
        NumView::Big(n) => n,
        NumView::Float(_) => unreachable!("float operand in integer path"),
    }
}

const MAX_INT_EXPONENT: u32 = 65_536;
const MAX_SHIFT: i64 = 1 << 20;

fn numeric_binary(op: BinaryOp, lhs: NumView, rhs: NumView, heap: &mut Heap) -> RunResult<Dispatched<Value>> {
    if matches!(lhs, NumView::Float(_)) || matches!(rhs, NumView::Float(_)) {
        return float_binary(op, num_to_f64(&lhs), num_to_f64(&rhs));
    }
    // Pure integer path; keep i64 unless an operation overflows.
    let result = match (op, &lhs, &rhs) {
        (BinaryOp::Add, NumView::Int(a), NumView::Int(b)) => match a.checked_add(*b) {
            Some(v) => Value::Int(v),
            None => int_value(BigInt::from(*a) + BigInt::from(*b), heap),
        },
        (BinaryOp::Sub, NumView::Int(a), NumView::Int(b)) => match a.checked_sub(*b) {
            Some(v) => Value::Int(v),
            None => int_value(BigInt::from(*a) - BigInt::from(*b), heap),
        },
        (BinaryOp::Mul, NumView::Int(a), NumView::Int(b)) => match a.checked_mul(*b) {
            Some(v) => Value::Int(v),
            None => int_value(BigInt::from(*a) * BigInt::from(*b), heap),
        },
        (BinaryOp::Add, ..) => int_value(to_big(lhs) + to_big(rhs), heap),
        (BinaryOp::Sub, ..) => int_value(to_big(lhs) - to_big(rhs), heap),
        (BinaryOp::Mul, ..) => int_value(to_big(lhs) * to_big(rhs), heap),
        (BinaryOp::TrueDiv, ..) => {
            if is_int_zero(&rhs) {
                return Err(ExcType::zero_division());
            }
            Value::Float(num_to_f64(&lhs) / num_to_f64(&rhs))
        }
        (BinaryOp::FloorDiv, NumView::Int(a), NumView::Int(b)) => {
            if *b == 0 {
                return Err(ExcType::zero_division());
            }
            if *a == i64::MIN && *b == -1 {
                int_value(-BigInt::from(*a), heap)
            } else {
                Value::Int(Integer::div_floor(a, b))
            }
        }
        (BinaryOp::FloorDiv, ..) => {
            let b = to_big(rhs);
            if b.is_zero() {
                return Err(ExcType::zero_division());
            }
            int_value(Integer::div_floor(&to_big(lhs), &b), heap)
        }
        (BinaryOp::Mod, NumView::Int(a), NumView::Int(b)) => {
            if *b == 0 {
                return Err(ExcType::zero_division());
            }
            if *a == i64::MIN && *b == -1 {
                Value::Int(0)
            } else {
                Value::Int(Integer::mod_floor(a, b))
            }
        }
        (BinaryOp::Mod, ..) => {
            let b = to_big(rhs);
            if b.is_zero() {
                return Err(ExcType::zero_division());
            }
            int_value(Integer::mod_floor(&to_big(lhs), &b), heap)
        }
        (BinaryOp::Pow, ..) => return int_pow(lhs, rhs, heap),
        (BinaryOp::LShift | BinaryOp::RShift, ..) => return int_shift(op, lhs, rhs, heap),
        (BinaryOp::BitAnd, NumView::Int(a), NumView::Int(b)) => Value::Int(a & b),
        (BinaryOp::BitOr, NumView::Int(a), NumView::Int(b)) => Value::Int(a | b),
        (BinaryOp::BitXor, NumView::Int(a), NumView::Int(b)) => Value::Int(a ^ b),
        (BinaryOp::BitAnd, ..) => int_value(to_big(lhs) & to_big(rhs), heap),
        (BinaryOp::BitOr, ..) => int_value(to_big(lhs) | to_big(rhs), heap),
        (BinaryOp::BitXor, ..) => int_value(to_big(lhs) ^ to_big(rhs), heap),
    };
    Ok(Dispatched::Done(result))
}

fn is_int_zero(view: &NumView) -> bool {
    match view {
        NumView::Int(i) => *i == 0,
        NumView::Big(n) => n.is_zero(),
        NumView::Float(f) => *f == 0.0,
    }
}

fn int_pow(lhs: NumView, rhs: NumView, heap: &mut Heap) -> RunResult<Dispatched<Value>> {
    let exp = match &rhs {
        NumView::Int(e) => *e,
        NumView::Big(e) => match e.to_i64() {
            Some(e) => e,
            None => {
                return Err(SimpleException::new_msg(ExcType::OverflowError, "exponent too large").into());
            }
        },
        NumView::Float(_) => unreachable!("float operand in integer path"),
    };
    if exp < 0 {
        // A negative exponent produces a float result.
        let base = num_to_f64(&lhs);
        if base == 0.0 {
            return Err(SimpleException::new_msg(ExcType::ZeroDivisionError, "zero to a negative power").into());
        }
        return Ok(Dispatched::Done(Value::Float(base.powf(exp as f64))));
    }
    if let NumView::Int(base) = lhs
        && let Ok(small_exp) = u32::try_from(exp)
        && let Some(v) = base.checked_pow(small_exp)
    {
        return Ok(Dispatched::Done(Value::Int(v)));
    }
    let exp = u32::try_from(exp)
        .ok()
        .filter(|e| *e <= MAX_INT_EXPONENT)
        .ok_or_else(|| SimpleException::new_msg(ExcType::OverflowError, "exponent too large"))?;
    Ok(Dispatched::Done(int_value(Pow::pow(&to_big(lhs), exp), heap)))
}

fn int_shift(op: BinaryOp, lhs: NumView, rhs: NumView, heap: &mut Heap) -> RunResult<Dispatched<Value>> {
    let count = match &rhs {
        NumView::Int(c) => *c,
        NumView::Big(c) => c.to_i64().unwrap_or(i64::MAX),
        NumView::Float(_) => unreachable!("float operand in integer path"),
    };
    if count < 0 {
        return Err(SimpleException::new_msg(ExcType::ValueError, "negative shift count").into());
    }
    if count > MAX_SHIFT {
        return Err(
            SimpleException::new_msg(ExcType::OverflowError, "Python int too large to convert to C ssize_t").into(),
        );
    }
    let count = count as usize;
    let result = match op {
        BinaryOp::LShift => {
            if let NumView::Int(a) = lhs
                && count < 63
                && let Some(v) = a.checked_shl(count as u32).filter(|v| (v >> count) == a)
            {
                Value::Int(v)
            } else {
                int_value(to_big(lhs) << count, heap)
            }
        }
        BinaryOp::RShift => match lhs {
            NumView::Int(a) => {
                if count >= 64 {
                    Value::Int(if a < 0 { -1 } else { 0 })
                } else {
                    Value::Int(a >> count)
                }
            }
            other => int_value(to_big(other) >> count, heap),
        },
        _ => return Err(crate::exception::RunError::internal("int_shift called with non-shift opcode")),
    };
    Ok(Dispatched::Done(result))
}

fn float_binary(op: BinaryOp, a: f64, b: f64) -> RunResult<Dispatched<Value>> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::TrueDiv => {
            if b == 0.0 {
                return Err(ExcType::float_zero_division());
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(SimpleException::new_msg(ExcType::ZeroDivisionError, "float floor division by zero").into());
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(SimpleException::new_msg(ExcType::ZeroDivisionError, "float modulo").into());
            }
            let mut r = a % b;
            if r != 0.0 {
                if (r < 0.0) != (b < 0.0) {
                    r += b;
                }
            } else {
                r = 0.0f64.copysign(b);
            }
            r
        }
        BinaryOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(
                    SimpleException::new_msg(ExcType::ZeroDivisionError, "0.0 cannot be raised to a negative power")
                        .into(),
                );
            }
            a.powf(b)
        }
        // Bitwise operators have no float meaning; decline so the error
        // names the written operand types rather than the widened ones.
        BinaryOp::LShift | BinaryOp::RShift | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
            return Ok(Dispatched::NotImplemented);
        }
    };
    Ok(Dispatched::Done(Value::Float(result)))
}

fn numeric_compare(op: CanonCmp, lhs: &NumView, rhs: &NumView) -> bool {
    use std::cmp::Ordering;
    let ord: Option<Ordering> = match (lhs, rhs) {
        (NumView::Int(a), NumView::Int(b)) => Some(a.cmp(b)),
        (NumView::Float(_), _) | (_, NumView::Float(_)) => num_to_f64(lhs).partial_cmp(&num_to_f64(rhs)),
        (NumView::Big(a), NumView::Big(b)) => Some(a.cmp(b)),
        (NumView::Big(a), NumView::Int(b)) => Some(a.cmp(&BigInt::from(*b))),
        (NumView::Int(a), NumView::Big(b)) => Some(BigInt::from(*a).cmp(b)),
    };
    match ord {
        // NaN compares false against everything.
        None => false,
        Some(ord) => match op {
            CanonCmp::Lt => ord == Ordering::Less,
            CanonCmp::Le => ord != Ordering::Greater,
            CanonCmp::Eq => ord == Ordering::Equal,
        },
    }
}

// ---------------------------------------------------------------------------
// Sequence, set, and string capabilities
// ---------------------------------------------------------------------------

fn repeat_count(view: &NumView) -> RunResult<usize> {
    let n = match view {
        NumView::Int(n) => *n,
        NumView::Big(n) => n.to_i64().ok_or_else(|| {
            SimpleException::new_msg(ExcType::OverflowError, "cannot fit 'int' into an index-sized integer")
        })?,
        NumView::Float(_) => return Err(crate::exception::RunError::internal("repeat count must be an integer")),
    };
    Ok(usize::try_from(n).unwrap_or(0))
}

fn repeat_seq(items: &[Value], count: usize) -> RunResult<Vec<Value>> {
    let total = items.len().checked_mul(count).filter(|t| *t <= (1 << 28));
    match total {
        Some(total) => {
            let mut out = Vec::with_capacity(total);
            for _ in 0..count {
                out.extend_from_slice(items);
            }
            Ok(out)
        }
        None => Err(SimpleException::new_msg(ExcType::OverflowError, "repeated sequence is too long").into()),
    }
}

/// Lexicographic sequence comparison, recursing through the protocol for
/// element comparisons.
fn seq_compare(op: CanonCmp, lhs: &[Value], rhs: &[Value], ctx: &mut RtCtx<'_>) -> RunResult<bool> {
    if op == CanonCmp::Eq && lhs.len() != rhs.len() {
        return Ok(false);
    }
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        if !protocol::compare_op(CmpOp::Eq, a, b, ctx)? {
            return match op {
                CanonCmp::Eq => Ok(false),
                CanonCmp::Lt => protocol::compare_op(CmpOp::Lt, a, b, ctx),
                CanonCmp::Le => protocol::compare_op(CmpOp::Lt, a, b, ctx),
            };
        }
    }
    // One sequence is a prefix of the other.
    Ok(match op {
        CanonCmp::Eq => true,
        CanonCmp::Lt => lhs.len() < rhs.len(),
        CanonCmp::Le => lhs.len() <= rhs.len(),
    })
}

fn str_binary(op: BinaryOp, lhs: StringId, rhs: &Value, ctx: &mut RtCtx<'_>) -> RunResult<Dispatched<Value>> {
    match op {
        BinaryOp::Add => {
            if let Value::Str(rhs_id) = rhs {
                let joined = format!("{}{}", ctx.interns.get_str(lhs), ctx.interns.get_str(*rhs_id));
                Ok(Dispatched::Done(Value::Str(ctx.interns.intern_owned(joined))))
            } else {
                Ok(Dispatched::NotImplemented)
            }
        }
        BinaryOp::Mul => str_repeat(lhs, rhs, ctx),
        _ => Ok(Dispatched::NotImplemented),
    }
}

fn str_repeat(lhs: StringId, rhs: &Value, ctx: &mut RtCtx<'_>) -> RunResult<Dispatched<Value>> {
    let Some(view) = num_view(rhs, ctx.heap) else {
        return Ok(Dispatched::NotImplemented);
    };
    if matches!(view, NumView::Float(_)) {
        return Ok(Dispatched::NotImplemented);
    }
    let count = repeat_count(&view)?;
    let s = ctx.interns.get_str(lhs);
    if s.len().checked_mul(count).is_none_or(|total| total > (1 << 28)) {
        return Err(SimpleException::new_msg(ExcType::OverflowError, "repeated string is too long").into());
    }
    let repeated = s.repeat(count);
    Ok(Dispatched::Done(Value::Str(ctx.interns.intern_owned(repeated))))
}

fn seq_items(value: &Value, heap: &Heap) -> Option<(Type, Vec<Value>)> {
    if let Value::Ref(id) = value {
        match heap.get(*id) {
            HeapData::List(items) => Some((Type::List, items.clone())),
            HeapData::Tuple(items) => Some((Type::Tuple, items.clone())),
            _ => None,
        }
    } else {
        None
    }
}

fn set_entries(value: &Value, heap: &Heap) -> Option<indexmap::IndexMap<HashKey, Value>> {
    if let Value::Ref(id) = value
        && let HeapData::Set(entries) = heap.get(*id)
    {
        Some(entries.clone())
    } else {
        None
    }
}

fn set_binary(op: BinaryOp, lhs: &Value, rhs: &Value, ctx: &mut RtCtx<'_>) -> RunResult<Dispatched<Value>> {
    let (Some(a), Some(b)) = (set_entries(lhs, ctx.heap), set_entries(rhs, ctx.heap)) else {
        return Ok(Dispatched::NotImplemented);
    };
    let result = match op {
        BinaryOp::BitAnd => {
            let mut out = a;
            out.retain(|key, _| b.contains_key(key));
            out
        }
        BinaryOp::BitOr => {
            let mut out = a;
            for (key, element) in b {
                out.entry(key).or_insert(element);
            }
            out
        }
        BinaryOp::Sub => {
            let mut out = a;
            out.retain(|key, _| !b.contains_key(key));
            out
        }
        BinaryOp::BitXor => {
            let mut out = indexmap::IndexMap::new();
            for (key, element) in &a {
                if !b.contains_key(key) {
                    out.insert(key.clone(), *element);
                }
            }
            for (key, element) in b {
                if !a.contains_key(&key) {
                    out.insert(key, element);
                }
            }
            out
        }
        _ => return Ok(Dispatched::NotImplemented),
    };
    Ok(Dispatched::Done(Value::Ref(ctx.heap.allocate(HeapData::Set(result)))))
}

// ---------------------------------------------------------------------------
// Operand implementation for Value
// ---------------------------------------------------------------------------

impl<'a> Operand<RtCtx<'a>> for Value {
    fn type_name(&self, ctx: &RtCtx<'a>) -> &'static str {
        Self::type_name(self, ctx.heap)
    }

    fn same_type(&self, other: &Self, ctx: &RtCtx<'a>) -> bool {
        self.py_type(ctx.heap) == other.py_type(ctx.heap)
    }

    fn binary(&self, op: BinaryOp, rhs: &Self, ctx: &mut RtCtx<'a>) -> RunResult<Dispatched<Self>> {
        if let (Some(a), Some(b)) = (num_view(self, ctx.heap), num_view(rhs, ctx.heap)) {
            return numeric_binary(op, a, b, ctx.heap);
        }
        match self {
            Self::Str(id) => str_binary(op, *id, rhs, ctx),
            Self::Ref(_) => {
                if let Some((lhs_type, lhs_items)) = seq_items(self, ctx.heap) {
                    match op {
                        BinaryOp::Add => match seq_items(rhs, ctx.heap) {
                            Some((rhs_type, rhs_items)) if rhs_type == lhs_type => {
                                let mut out = lhs_items;
                                out.extend_from_slice(&rhs_items);
                                let data = match lhs_type {
                                    Type::List => HeapData::List(out),
                                    _ => HeapData::Tuple(out),
                                };
                                Ok(Dispatched::Done(Self::Ref(ctx.heap.allocate(data))))
                            }
                            _ => Ok(Dispatched::NotImplemented),
                        },
                        BinaryOp::Mul => {
                            let Some(view) = num_view(rhs, ctx.heap) else {
                                return Ok(Dispatched::NotImplemented);
                            };
                            if matches!(view, NumView::Float(_)) {
                                return Ok(Dispatched::NotImplemented);
                            }
                            let out = repeat_seq(&lhs_items, repeat_count(&view)?)?;
                            let data = match lhs_type {
                                Type::List => HeapData::List(out),
                                _ => HeapData::Tuple(out),
                            };
                            Ok(Dispatched::Done(Self::Ref(ctx.heap.allocate(data))))
                        }
                        _ => Ok(Dispatched::NotImplemented),
                    }
                } else {
                    set_binary(op, self, rhs, ctx)
                }
            }
            _ => Ok(Dispatched::NotImplemented),
        }
    }

    fn binary_reflected(&self, op: BinaryOp, lhs: &Self, ctx: &mut RtCtx<'a>) -> RunResult<Dispatched<Self>> {
        // `n * seq` and `n * str` resolve through the sequence's reflected
        // capability after the number declines the forward form.
        match op {
            BinaryOp::Mul => match self {
                Self::Str(id) => str_repeat(*id, lhs, ctx),
                Self::Ref(_) => {
                    let Some((seq_type, items)) = seq_items(self, ctx.heap) else {
                        return Ok(Dispatched::NotImplemented);
                    };
                    let Some(view) = num_view(lhs, ctx.heap) else {
                        return Ok(Dispatched::NotImplemented);
                    };
                    if matches!(view, NumView::Float(_)) {
                        return Ok(Dispatched::NotImplemented);
                    }
                    let out = repeat_seq(&items, repeat_count(&view)?)?;
                    let data = match seq_type {
                        Type::List => HeapData::List(out),
                        _ => HeapData::Tuple(out),
                    };
                    Ok(Dispatched::Done(Self::Ref(ctx.heap.allocate(data))))
                }
                _ => Ok(Dispatched::NotImplemented),
            },
            _ => {
                // Numeric values answer reflected forms of numeric ops so
                // foreign left operands can defer to them.
                if let (Some(a), Some(b)) = (num_view(lhs, ctx.heap), num_view(self, ctx.heap)) {
                    numeric_binary(op, a, b, ctx.heap)
                } else {
                    Ok(Dispatched::NotImplemented)
                }
            }
        }
    }

    fn binary_inplace(&self, op: BinaryOp, rhs: &Self, ctx: &mut RtCtx<'a>) -> RunResult<Dispatched<Self>> {
        // Lists are the one built-in where `+=` mutates in place.
        if op == BinaryOp::Add
            && let Self::Ref(id) = self
            && matches!(ctx.heap.get(*id), HeapData::List(_))
        {
            let Some((_, rhs_items)) = seq_items(rhs, ctx.heap) else {
                return Ok(Dispatched::NotImplemented);
            };
            if let HeapData::List(items) = ctx.heap.get_mut(*id) {
                items.extend_from_slice(&rhs_items);
            }
            return Ok(Dispatched::Done(*self));
        }
        Ok(Dispatched::NotImplemented)
    }

    fn compare(&self, op: CanonCmp, rhs: &Self, ctx: &mut RtCtx<'a>) -> RunResult<Dispatched<bool>> {
        if let (Some(a), Some(b)) = (num_view(self, ctx.heap), num_view(rhs, ctx.heap)) {
            return Ok(Dispatched::Done(numeric_compare(op, &a, &b)));
        }
        match (self, rhs) {
            (Self::None, Self::None) => match op {
                CanonCmp::Eq => Ok(Dispatched::Done(true)),
                _ => Ok(Dispatched::NotImplemented),
            },
            (Self::Str(a), Self::Str(b)) => {
                let ord = ctx.interns.get_str(*a).cmp(ctx.interns.get_str(*b));
                Ok(Dispatched::Done(match op {
                    CanonCmp::Lt => ord == std::cmp::Ordering::Less,
                    CanonCmp::Le => ord != std::cmp::Ordering::Greater,
                    CanonCmp::Eq => ord == std::cmp::Ordering::Equal,
                }))
            }
            (Self::Class(a), Self::Class(b)) => match op {
                CanonCmp::Eq => Ok(Dispatched::Done(a == b)),
                _ => Ok(Dispatched::NotImplemented),
            },
            (Self::Builtin(a), Self::Builtin(b)) => match op {
                CanonCmp::Eq => Ok(Dispatched::Done(a == b)),
                _ => Ok(Dispatched::NotImplemented),
            },
            (Self::Ref(_), Self::Ref(_)) => {
                if let (Some((lhs_type, lhs_items)), Some((rhs_type, rhs_items))) =
                    (seq_items(self, ctx.heap), seq_items(rhs, ctx.heap))
                {
                    if lhs_type != rhs_type {
                        return Ok(Dispatched::NotImplemented);
                    }
                    return Ok(Dispatched::Done(seq_compare(op, &lhs_items, &rhs_items, ctx)?));
                }
                if let (Some(a), Some(b)) = (set_entries(self, ctx.heap), set_entries(rhs, ctx.heap)) {
                    let subset = a.keys().all(|key| b.contains_key(key));
                    return Ok(Dispatched::Done(match op {
                        CanonCmp::Eq => a.len() == b.len() && subset,
                        CanonCmp::Lt => a.len() < b.len() && subset,
                        CanonCmp::Le => subset,
                    }));
                }
                if op == CanonCmp::Eq
                    && let (Value::Ref(a), Value::Ref(b)) = (self, rhs)
                    && let (HeapData::Dict(da), HeapData::Dict(db)) = (ctx.heap.get(*a), ctx.heap.get(*b))
                {
                    let (da, db) = (da.clone(), db.clone());
                    if da.len() != db.len() {
                        return Ok(Dispatched::Done(false));
                    }
                    for (key, (_, a_val)) in &da {
                        match db.get(key) {
                            Some((_, b_val)) => {
                                if !protocol::compare_op(CmpOp::Eq, a_val, b_val, ctx)? {
                                    return Ok(Dispatched::Done(false));
                                }
                            }
                            None => return Ok(Dispatched::Done(false)),
                        }
                    }
                    return Ok(Dispatched::Done(true));
                }
                Ok(Dispatched::NotImplemented)
            }
            _ => Ok(Dispatched::NotImplemented),
        }
    }

    fn unary(&self, op: UnaryOp, ctx: &mut RtCtx<'a>) -> RunResult<Dispatched<Self>> {
        let Some(view) = num_view(self, ctx.heap) else {
            return Ok(Dispatched::NotImplemented);
        };
        let result = match (op, view) {
            (UnaryOp::Pos, NumView::Int(i)) => Value::Int(i),
            (UnaryOp::Pos, NumView::Float(f)) => Value::Float(f),
            (UnaryOp::Pos, NumView::Big(n)) => int_value(n, ctx.heap),
            (UnaryOp::Neg, NumView::Int(i)) => match i.checked_neg() {
                Some(v) => Value::Int(v),
                None => int_value(-BigInt::from(i), ctx.heap),
            },
            (UnaryOp::Neg, NumView::Float(f)) => Value::Float(-f),
            (UnaryOp::Neg, NumView::Big(n)) => int_value(-n, ctx.heap),
            (UnaryOp::Invert, NumView::Int(i)) => Value::Int(!i),
            (UnaryOp::Invert, NumView::Big(n)) => int_value(-n - 1, ctx.heap),
            (UnaryOp::Invert, NumView::Float(_)) => return Ok(Dispatched::NotImplemented),
        };
        Ok(Dispatched::Done(result))
    }
}

// ---------------------------------------------------------------------------
// Membership, subscripting, attributes
// ---------------------------------------------------------------------------

/// Implements `item in container`.
pub fn py_contains(item: &Value, container: &Value, ctx: &mut RtCtx<'_>) -> RunResult<bool> {
    match container {
        Value::Str(id) => {
            let Value::Str(needle) = item else {
                return Err(ExcType::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    item.type_name(ctx.heap)
                ))
                .into());
            };
            let haystack = ctx.interns.get_str(*id);
            let needle = ctx.interns.get_str(*needle);
            Ok(haystack.contains(needle))
        }
        Value::Ref(id) => match ctx.heap.get(*id) {
            HeapData::List(items) | HeapData::Tuple(items) => {
                let items = items.clone();
                for candidate in items {
                    if protocol::compare_op(CmpOp::Eq, item, &candidate, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            HeapData::Set(_) | HeapData::Dict(_) => {
                let key = hash_key(item, ctx.heap)?;
                Ok(match ctx.heap.get(*id) {
                    HeapData::Set(entries) => entries.contains_key(&key),
                    HeapData::Dict(entries) => entries.contains_key(&key),
                    _ => false,
                })
            }
            _ => Err(not_iterable(container, ctx.heap)),
        },
        _ => Err(not_iterable(container, ctx.heap)),
    }
}

fn not_iterable(value: &Value, heap: &Heap) -> crate::exception::RunError {
    ExcType::type_error(format!("argument of type '{}' is not iterable", value.type_name(heap))).into()
}

/// Interprets a value as a sequence index, `Ok(None)` when it is not an
/// integer at all.
fn as_index(value: &Value, heap: &Heap) -> RunResult<Option<i64>> {
    match num_view(value, heap) {
        Some(NumView::Int(i)) => Ok(Some(i)),
        Some(NumView::Big(_)) => {
            Err(SimpleException::new_msg(ExcType::IndexError, "cannot fit 'int' into an index-sized integer").into())
        }
        _ => Ok(None),
    }
}

fn wrap_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let wrapped = if index < 0 { index + len } else { index };
    if (0..len).contains(&wrapped) {
        Some(wrapped as usize)
    } else {
        None
    }
}

/// Resolves `slice(start, stop, step)` against a sequence length, producing
/// the concrete index walk.
fn slice_walk(start: Value, stop: Value, step: Value, len: usize, heap: &Heap) -> RunResult<Vec<usize>> {
    let step = match as_index(&step, heap)? {
        None if step.is_none() => 1,
        Some(0) => return Err(SimpleException::new_msg(ExcType::ValueError, "slice step cannot be zero").into()),
        Some(s) => s,
        None => return Err(slice_component_error(&step, heap)),
    };
    let len_i = len as i64;
    let clamp = |idx: i64, lo: i64, hi: i64| idx.clamp(lo, hi);
    let (default_start, default_stop) = if step > 0 { (0, len_i) } else { (len_i - 1, -1) };
    let resolve = |v: &Value, default: i64| -> RunResult<i64> {
        match as_index(v, heap)? {
            Some(i) => {
                let adjusted = if i < 0 { i + len_i } else { i };
                Ok(if step > 0 {
                    clamp(adjusted, 0, len_i)
                } else {
                    clamp(adjusted, -1, len_i - 1)
                })
            }
            None if v.is_none() => Ok(default),
            None => Err(slice_component_error(v, heap)),
        }
    };
    let start = resolve(&start, default_start)?;
    let stop = resolve(&stop, default_stop)?;
    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        indices.push(i as usize);
        i += step;
    }
    Ok(indices)
}

fn slice_component_error(v: &Value, heap: &Heap) -> crate::exception::RunError {
    ExcType::type_error(format!(
        "slice indices must be integers or None, not {}",
        v.type_name(heap)
    ))
    .into()
}

/// Implements `container[index]`.
pub fn py_getitem(container: &Value, index: &Value, ctx: &mut RtCtx<'_>) -> RunResult<Value> {
    match container {
        Value::Str(id) => {
            let s = ctx.interns.get_str(*id).to_owned();
            let chars: Vec<char> = s.chars().collect();
            if let Some(i) = as_index(index, ctx.heap)? {
                let i = wrap_index(i, chars.len()).ok_or_else(|| ExcType::index_out_of_range(Type::Str))?;
                let out: String = chars[i].to_string();
                return Ok(Value::Str(ctx.interns.intern_owned(out)));
            }
            if let Value::Ref(slice_id) = index
                && let HeapData::Slice { start, stop, step } = *ctx.heap.get(*slice_id)
            {
                let walk = slice_walk(start, stop, step, chars.len(), ctx.heap)?;
                let out: String = walk.into_iter().map(|i| chars[i]).collect();
                return Ok(Value::Str(ctx.interns.intern_owned(out)));
            }
            Err(subscript_index_error(Type::Str, index, ctx.heap))
        }
        Value::Ref(id) => match ctx.heap.get(*id) {
            HeapData::List(_) | HeapData::Tuple(_) => {
                let (seq_type, items) =
                    seq_items(container, ctx.heap).expect("list or tuple payload disappeared");
                if let Some(i) = as_index(index, ctx.heap)? {
                    let i = wrap_index(i, items.len()).ok_or_else(|| ExcType::index_out_of_range(seq_type))?;
                    return Ok(items[i]);
                }
                if let Value::Ref(slice_id) = index
                    && let HeapData::Slice { start, stop, step } = *ctx.heap.get(*slice_id)
                {
                    let walk = slice_walk(start, stop, step, items.len(), ctx.heap)?;
                    let out: Vec<Value> = walk.into_iter().map(|i| items[i]).collect();
                    let data = match seq_type {
                        Type::List => HeapData::List(out),
                        _ => HeapData::Tuple(out),
                    };
                    return Ok(Value::Ref(ctx.heap.allocate(data)));
                }
                Err(subscript_index_error(seq_type, index, ctx.heap))
            }
            HeapData::Dict(_) => {
                let key = hash_key(index, ctx.heap)?;
                if let HeapData::Dict(entries) = ctx.heap.get(*id)
                    && let Some((_, value)) = entries.get(&key)
                {
                    return Ok(*value);
                }
                Err(ExcType::key_error(py_repr(index, ctx.heap, ctx.interns)))
            }
            _ => Err(not_subscriptable(container, ctx.heap)),
        },
        _ => Err(not_subscriptable(container, ctx.heap)),
    }
}

fn subscript_index_error(seq_type: Type, index: &Value, heap: &Heap) -> crate::exception::RunError {
    ExcType::type_error(format!(
        "{seq_type} indices must be integers or slices, not {}",
        index.type_name(heap)
    ))
    .into()
}

fn not_subscriptable(value: &Value, heap: &Heap) -> crate::exception::RunError {
    ExcType::type_error(format!("'{}' object is not subscriptable", value.type_name(heap))).into()
}

/// Implements `container[index] = value`.
pub fn py_setitem(container: &Value, index: &Value, value: Value, ctx: &mut RtCtx<'_>) -> RunResult<()> {
    let Value::Ref(id) = container else {
        return Err(item_assignment_error(container, ctx.heap));
    };
    match ctx.heap.get(*id) {
        HeapData::List(items) => {
            let len = items.len();
            match as_index(index, ctx.heap)? {
                Some(i) => {
                    let i = wrap_index(i, len).ok_or_else(|| {
                        SimpleException::new_msg(ExcType::IndexError, "list assignment index out of range")
                    })?;
                    if let HeapData::List(items) = ctx.heap.get_mut(*id) {
                        items[i] = value;
                    }
                    Ok(())
                }
                None => Err(
                    SimpleException::new_msg(ExcType::NotImplementedError, "slice assignment is not supported").into(),
                ),
            }
        }
        HeapData::Dict(_) => {
            let key = hash_key(index, ctx.heap)?;
            if let HeapData::Dict(entries) = ctx.heap.get_mut(*id) {
                entries.insert(key, (*index, value));
            }
            Ok(())
        }
        _ => Err(item_assignment_error(container, ctx.heap)),
    }
}

fn item_assignment_error(value: &Value, heap: &Heap) -> crate::exception::RunError {
    ExcType::type_error(format!(
        "'{}' object does not support item assignment",
        value.type_name(heap)
    ))
    .into()
}

/// Implements `del container[index]`.
pub fn py_delitem(container: &Value, index: &Value, ctx: &mut RtCtx<'_>) -> RunResult<()> {
    let Value::Ref(id) = container else {
        return Err(item_deletion_error(container, ctx.heap));
    };
    match ctx.heap.get(*id) {
        HeapData::List(items) => {
            let len = items.len();
            let i = as_index(index, ctx.heap)?
                .and_then(|i| wrap_index(i, len))
                .ok_or_else(|| SimpleException::new_msg(ExcType::IndexError, "list assignment index out of range"))?;
            if let HeapData::List(items) = ctx.heap.get_mut(*id) {
                items.remove(i);
            }
            Ok(())
        }
        HeapData::Dict(_) => {
            let key = hash_key(index, ctx.heap)?;
            let removed = if let HeapData::Dict(entries) = ctx.heap.get_mut(*id) {
                entries.shift_remove(&key).is_some()
            } else {
                false
            };
            if removed {
                Ok(())
            } else {
                Err(ExcType::key_error(py_repr(index, ctx.heap, ctx.interns)))
            }
        }
        _ => Err(item_deletion_error(container, ctx.heap)),
    }
}

fn item_deletion_error(value: &Value, heap: &Heap) -> crate::exception::RunError {
    ExcType::type_error(format!("'{}' object doesn't support item deletion", value.type_name(heap))).into()
}

/// Implements attribute loads.
///
/// Only a handful of attributes exist on built-in values; the interesting
/// part is that misses are ordinary catchable AttributeErrors.
pub fn py_getattr(value: &Value, attr: StringId, ctx: &mut RtCtx<'_>) -> RunResult<Value> {
    use crate::intern::StaticStrings;
    if let Value::Ref(id) = value {
        match ctx.heap.get(*id) {
            HeapData::Function(func) => {
                if attr == StaticStrings::DunderName.into() || attr == StaticStrings::DunderQualname.into() {
                    return Ok(Value::Str(func.qualname));
                }
            }
            HeapData::Exception(inst) => {
                if attr == StaticStrings::Args.into() {
                    let args = inst.args.clone();
                    return Ok(Value::Ref(ctx.heap.allocate(HeapData::Tuple(args))));
                }
            }
            _ => {}
        }
    }
    Err(ExcType::attribute_error(
        value.type_name(ctx.heap),
        ctx.interns.get_str(attr),
    ))
}

// ---------------------------------------------------------------------------
// repr / str
// ---------------------------------------------------------------------------

/// Formats a float the way the guest language spells it.
#[must_use]
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_owned() } else { "-inf".to_owned() };
    }
    let mut buffer = ryu::Buffer::new();
    let text = buffer.format_finite(f);
    // ryu prints `1e30`; the guest spelling is `1e+30`.
    match text.find('e') {
        Some(pos) if !text[pos + 1..].starts_with('-') => {
            format!("{}e+{}", &text[..pos], &text[pos + 1..])
        }
        _ => text.to_owned(),
    }
}

fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// The canonical printable representation of a value.
#[must_use]
pub fn py_repr(value: &Value, heap: &Heap, interns: &Interns) -> String {
    let mut seen = Vec::new();
    repr_inner(value, heap, interns, &mut seen)
}

/// The human-facing string form: bare text for strings and exception
/// messages, the repr for everything else.
#[must_use]
pub fn py_str(value: &Value, heap: &Heap, interns: &Interns) -> String {
    match value {
        Value::Str(id) => interns.get_str(*id).to_owned(),
        Value::Ref(id) => {
            if let HeapData::Exception(inst) = heap.get(*id) {
                return exc_instance_str(inst, heap, interns);
            }
            py_repr(value, heap, interns)
        }
        _ => py_repr(value, heap, interns),
    }
}

/// `str()` of an exception instance: its single argument's str, or the args
/// tuple repr for multiple arguments.
pub(crate) fn exc_instance_str(inst: &crate::heap::ExcInstance, heap: &Heap, interns: &Interns) -> String {
    match inst.args.as_slice() {
        [] => String::new(),
        [single] => py_str(single, heap, interns),
        args => {
            let parts: Vec<String> = args.iter().map(|a| py_repr(a, heap, interns)).collect();
            format!("({})", parts.join(", "))
        }
    }
}

fn repr_inner(value: &Value, heap: &Heap, interns: &Interns, seen: &mut Vec<HeapId>) -> String {
    match value {
        Value::None => "None".to_owned(),
        Value::Bool(true) => "True".to_owned(),
        Value::Bool(false) => "False".to_owned(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format_float(*f),
        Value::Str(id) => quote_str(interns.get_str(*id)),
        Value::Class(exc) => format!("<class '{exc}'>"),
        Value::Builtin(b) => format!("<built-in function {b}>"),
        Value::Ref(id) => {
            if seen.contains(id) {
                return match heap.get(*id) {
                    HeapData::List(_) => "[...]".to_owned(),
                    HeapData::Tuple(_) => "(...)".to_owned(),
                    _ => "{...}".to_owned(),
                };
            }
            seen.push(*id);
            let out = match heap.get(*id) {
                HeapData::LongInt(n) => n.to_string(),
                HeapData::List(items) => {
                    let parts: Vec<String> = items.iter().map(|v| repr_inner(v, heap, interns, seen)).collect();
                    format!("[{}]", parts.join(", "))
                }
                HeapData::Tuple(items) => {
                    let parts: Vec<String> = items.iter().map(|v| repr_inner(v, heap, interns, seen)).collect();
                    if parts.len() == 1 {
                        format!("({},)", parts[0])
                    } else {
                        format!("({})", parts.join(", "))
                    }
                }
                HeapData::Set(entries) => {
                    if entries.is_empty() {
                        "set()".to_owned()
                    } else {
                        let parts: Vec<String> =
                            entries.values().map(|v| repr_inner(v, heap, interns, seen)).collect();
                        format!("{{{}}}", parts.join(", "))
                    }
                }
                HeapData::Dict(entries) => {
                    let parts: Vec<String> = entries
                        .values()
                        .map(|(k, v)| {
                            format!(
                                "{}: {}",
                                repr_inner(k, heap, interns, seen),
                                repr_inner(v, heap, interns, seen)
                            )
                        })
                        .collect();
                    format!("{{{}}}", parts.join(", "))
                }
                HeapData::Slice { start, stop, step } => format!(
                    "slice({}, {}, {})",
                    repr_inner(start, heap, interns, seen),
                    repr_inner(stop, heap, interns, seen),
                    repr_inner(step, heap, interns, seen)
                ),
                HeapData::Function(func) => format!("<function {}>", interns.get_str(func.qualname)),
                HeapData::Cell(_) => "<cell>".to_owned(),
                HeapData::Code(code) => format!("<code object {}>", interns.get_str(code.name)),
                HeapData::Exception(inst) => {
                    let parts: Vec<String> =
                        inst.args.iter().map(|a| repr_inner(a, heap, interns, seen)).collect();
                    format!("{}({})", inst.exc_type, parts.join(", "))
                }
            };
            seen.pop();
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ExcInstance;

    fn ctx_parts() -> (Heap, Interns) {
        (Heap::new(), Interns::new())
    }

    #[test]
    fn int_overflow_promotes_to_big() {
        let (mut heap, mut interns) = ctx_parts();
        let mut ctx = RtCtx {
            heap: &mut heap,
            interns: &mut interns,
        };
        let v = protocol::binary_op(BinaryOp::Add, &Value::Int(i64::MAX), &Value::Int(1), &mut ctx).unwrap();
        let Value::Ref(id) = v else { panic!("expected heap ref, got {v:?}") };
        assert!(matches!(ctx.heap.get(id), HeapData::LongInt(n) if n == &(BigInt::from(i64::MAX) + 1)));
        // And its type is still plain int.
        assert_eq!(v.py_type(ctx.heap), Type::Int);
    }

    #[test]
    fn big_result_demotes_when_it_fits() {
        let (mut heap, mut interns) = ctx_parts();
        let big = Value::Ref(heap.allocate(HeapData::LongInt(BigInt::from(i64::MAX) + 1)));
        let mut ctx = RtCtx {
            heap: &mut heap,
            interns: &mut interns,
        };
        let v = protocol::binary_op(BinaryOp::Sub, &big, &Value::Int(1), &mut ctx).unwrap();
        assert_eq!(v, Value::Int(i64::MAX));
    }

    #[test]
    fn floor_division_follows_sign_of_divisor() {
        let (mut heap, mut interns) = ctx_parts();
        let mut ctx = RtCtx {
            heap: &mut heap,
            interns: &mut interns,
        };
        let v = protocol::binary_op(BinaryOp::FloorDiv, &Value::Int(-7), &Value::Int(2), &mut ctx).unwrap();
        assert_eq!(v, Value::Int(-4));
        let v = protocol::binary_op(BinaryOp::Mod, &Value::Int(-7), &Value::Int(2), &mut ctx).unwrap();
        assert_eq!(v, Value::Int(1));
        let v = protocol::binary_op(BinaryOp::FloorDiv, &Value::Int(-7), &Value::Int(-2), &mut ctx).unwrap();
        assert_eq!(v, Value::Int(3));
    }

    #[test]
    fn division_by_zero_is_a_guest_error() {
        let (mut heap, mut interns) = ctx_parts();
        let mut ctx = RtCtx {
            heap: &mut heap,
            interns: &mut interns,
        };
        let err = protocol::binary_op(BinaryOp::TrueDiv, &Value::Int(1), &Value::Int(0), &mut ctx).unwrap_err();
        match err {
            crate::exception::RunError::Exc(exc) => assert_eq!(exc.exc_type(), ExcType::ZeroDivisionError),
            crate::exception::RunError::Internal(_) => panic!("expected guest error"),
        }
    }

    #[test]
    fn mixed_int_float_compares() {
        let (mut heap, mut interns) = ctx_parts();
        let mut ctx = RtCtx {
            heap: &mut heap,
            interns: &mut interns,
        };
        assert!(protocol::compare_op(CmpOp::Lt, &Value::Int(1), &Value::Float(1.5), &mut ctx).unwrap());
        assert!(protocol::compare_op(CmpOp::Eq, &Value::Int(2), &Value::Float(2.0), &mut ctx).unwrap());
        assert!(protocol::compare_op(CmpOp::Eq, &Value::Bool(true), &Value::Int(1), &mut ctx).unwrap());
    }

    #[test]
    fn str_concat_and_repeat() {
        let (mut heap, mut interns) = ctx_parts();
        let a = Value::Str(interns.intern("ab"));
        let b = Value::Str(interns.intern("cd"));
        let mut ctx = RtCtx {
            heap: &mut heap,
            interns: &mut interns,
        };
        let joined = protocol::binary_op(BinaryOp::Add, &a, &b, &mut ctx).unwrap();
        let Value::Str(id) = joined else { panic!("expected str") };
        assert_eq!(ctx.interns.get_str(id), "abcd");

        let repeated = protocol::binary_op(BinaryOp::Mul, &Value::Int(3), &a, &mut ctx).unwrap();
        let Value::Str(id) = repeated else { panic!("expected str") };
        assert_eq!(ctx.interns.get_str(id), "ababab");
    }

    #[test]
    fn different_types_are_unequal_not_error() {
        let (mut heap, mut interns) = ctx_parts();
        let s = Value::Str(interns.intern("x"));
        let mut ctx = RtCtx {
            heap: &mut heap,
            interns: &mut interns,
        };
        assert!(!protocol::compare_op(CmpOp::Eq, &Value::Int(1), &s, &mut ctx).unwrap());
        assert!(protocol::compare_op(CmpOp::Ne, &Value::Int(1), &s, &mut ctx).unwrap());
    }

    #[test]
    fn hash_key_normalizes_numerics() {
        let heap = Heap::new();
        assert_eq!(hash_key(&Value::Int(1), &heap).unwrap(), hash_key(&Value::Float(1.0), &heap).unwrap());
        assert_eq!(hash_key(&Value::Int(1), &heap).unwrap(), hash_key(&Value::Bool(true), &heap).unwrap());
        assert_ne!(hash_key(&Value::Int(1), &heap).unwrap(), hash_key(&Value::Int(2), &heap).unwrap());
    }

    #[test]
    fn unhashable_types_error() {
        let mut heap = Heap::new();
        let list = Value::Ref(heap.allocate(HeapData::List(vec![])));
        assert!(hash_key(&list, &heap).is_err());
    }

    #[test]
    fn repr_output() {
        let (mut heap, mut interns) = ctx_parts();
        let s = Value::Str(interns.intern("it's"));
        assert_eq!(py_repr(&s, &heap, &interns), "\"it's\"");
        assert_eq!(py_repr(&Value::Float(1.0), &heap, &interns), "1.0");
        assert_eq!(py_repr(&Value::Bool(true), &heap, &interns), "True");
        let tup = Value::Ref(heap.allocate(HeapData::Tuple(vec![Value::Int(1)])));
        assert_eq!(py_repr(&tup, &heap, &interns), "(1,)");
        let empty_set = Value::Ref(heap.allocate(HeapData::Set(indexmap::IndexMap::new())));
        assert_eq!(py_repr(&empty_set, &heap, &interns), "set()");
    }

    #[test]
    fn self_referential_list_repr_terminates() {
        let (mut heap, interns) = ctx_parts();
        let id = heap.allocate(HeapData::List(vec![Value::Int(1)]));
        if let HeapData::List(items) = heap.get_mut(id) {
            items[0] = Value::Ref(id);
        }
        assert_eq!(py_repr(&Value::Ref(id), &heap, &interns), "[[...]]");
    }

    #[test]
    fn exception_str_forms() {
        let (mut heap, mut interns) = ctx_parts();
        let msg = Value::Str(interns.intern("bad"));
        let inst = ExcInstance {
            exc_type: ExcType::ValueError,
            args: vec![msg],
            cause: None,
        };
        let v = Value::Ref(heap.allocate(HeapData::Exception(inst)));
        assert_eq!(py_str(&v, &heap, &interns), "bad");
        assert_eq!(py_repr(&v, &heap, &interns), "ValueError('bad')");
    }

    #[test]
    fn slice_walks() {
        let heap = Heap::new();
        assert_eq!(
            slice_walk(Value::Int(1), Value::Int(4), Value::None, 6, &heap).unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(
            slice_walk(Value::None, Value::None, Value::Int(-1), 3, &heap).unwrap(),
            vec![2, 1, 0]
        );
        assert!(slice_walk(Value::None, Value::None, Value::Int(0), 3, &heap).is_err());
    }
}
