//! Built-in functions and the builtins namespace.
//!
//! Builtins are a fieldless enum dispatched synchronously by the VM's call
//! machinery: no frame is pushed for them. The builtins namespace also holds
//! the exception classes, which is how `LOAD_GLOBAL AssertionError` and
//! handler expressions like `except ValueError` resolve.

use std::borrow::Cow;

use num_bigint::BigInt;
use num_traits::Signed;
use strum::IntoEnumIterator;

use crate::{
    exception::{ExcType, RunError, RunResult, SimpleException},
    heap::HeapData,
    intern::{Interns, StaticStrings, StringId},
    io::PrintWriter,
    namespace::{NamespaceId, Namespaces},
    value::{py_repr, py_str, RtCtx, Value},
};

/// The built-in functions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Builtin {
    Print,
    Len,
    Repr,
    Abs,
}

impl Builtin {
    /// Invokes the builtin synchronously, returning the value to push.
    pub(crate) fn call<P: PrintWriter>(
        self,
        args: Vec<Value>,
        kwargs: Vec<(StringId, Value)>,
        ctx: &mut RtCtx<'_>,
        print: &mut P,
    ) -> RunResult<Value> {
        match self {
            Self::Print => builtin_print(args, kwargs, ctx, print),
            Self::Len => {
                let [value] = expect_args::<1>(self, &args, &kwargs)?;
                match value.py_len(ctx.heap, ctx.interns) {
                    Some(len) => Ok(Value::Int(len as i64)),
                    None => Err(ExcType::type_error(format!(
                        "object of type '{}' has no len()",
                        value.type_name(ctx.heap)
                    ))
                    .into()),
                }
            }
            Self::Repr => {
                let [value] = expect_args::<1>(self, &args, &kwargs)?;
                let repr = py_repr(&value, ctx.heap, ctx.interns);
                Ok(Value::Str(ctx.interns.intern_owned(repr)))
            }
            Self::Abs => {
                let [value] = expect_args::<1>(self, &args, &kwargs)?;
                builtin_abs(value, ctx)
            }
        }
    }
}

/// Checks arity for the simple single-signature builtins.
fn expect_args<const N: usize>(
    builtin: Builtin,
    args: &[Value],
    kwargs: &[(StringId, Value)],
) -> RunResult<[Value; N]> {
    if !kwargs.is_empty() {
        return Err(ExcType::type_error(format!("{builtin}() takes no keyword arguments")).into());
    }
    <[Value; N]>::try_from(args).map_err(|_| {
        SimpleException::new_msg(
            ExcType::TypeError,
            format!("{builtin}() takes exactly {N} argument{} ({} given)", if N == 1 { "" } else { "s" }, args.len()),
        )
        .into()
    })
}

fn builtin_abs(value: Value, ctx: &mut RtCtx<'_>) -> RunResult<Value> {
    match value {
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Int(i) => match i.checked_abs() {
            Some(v) => Ok(Value::Int(v)),
            None => Ok(Value::Ref(ctx.heap.allocate(HeapData::LongInt(-BigInt::from(i))))),
        },
        Value::Float(f) => Ok(Value::Float(f.abs())),
        Value::Ref(id) => {
            if let HeapData::LongInt(n) = ctx.heap.get(id) {
                let n = n.abs();
                return Ok(match n.try_into() {
                    Ok(small) => Value::Int(small),
                    Err(err) => Value::Ref(ctx.heap.allocate(HeapData::LongInt(err.into_original()))),
                });
            }
            Err(bad_abs_operand(&value, ctx))
        }
        _ => Err(bad_abs_operand(&value, ctx)),
    }
}

fn bad_abs_operand(value: &Value, ctx: &RtCtx<'_>) -> RunError {
    ExcType::type_error(format!("bad operand type for abs(): '{}'", value.type_name(ctx.heap))).into()
}

fn builtin_print<P: PrintWriter>(
    args: Vec<Value>,
    kwargs: Vec<(StringId, Value)>,
    ctx: &mut RtCtx<'_>,
    print: &mut P,
) -> RunResult<Value> {
    let mut sep: Option<StringId> = None;
    let mut end: Option<StringId> = None;
    for (name, value) in kwargs {
        let slot = if name == StaticStrings::Sep.into() {
            &mut sep
        } else if name == StaticStrings::End.into() {
            &mut end
        } else {
            return Err(ExcType::type_error(format!(
                "'{}' is an invalid keyword argument for print()",
                ctx.interns.get_str(name)
            ))
            .into());
        };
        match value {
            Value::Str(id) => *slot = Some(id),
            Value::None => {}
            other => {
                return Err(ExcType::type_error(format!(
                    "sep/end must be None or a str, not {}",
                    other.type_name(ctx.heap)
                ))
                .into());
            }
        }
    }

    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            match sep {
                Some(id) => write_str(print, ctx.interns.get_str(id).to_owned())?,
                None => push_char(print, ' ')?,
            }
        }
        let text = py_str(arg, ctx.heap, ctx.interns);
        write_str(print, text)?;
    }
    match end {
        Some(id) => write_str(print, ctx.interns.get_str(id).to_owned())?,
        None => push_char(print, '\n')?,
    }
    Ok(Value::None)
}

fn write_str<P: PrintWriter>(print: &mut P, text: String) -> RunResult<()> {
    print
        .stdout_write(Cow::Owned(text))
        .map_err(|e| SimpleException::new_msg(e.exc_type, e.message).into())
}

fn push_char<P: PrintWriter>(print: &mut P, c: char) -> RunResult<()> {
    print
        .stdout_push(c)
        .map_err(|e| SimpleException::new_msg(e.exc_type, e.message).into())
}

/// Populates the builtins namespace with the exception classes and the
/// built-in functions.
pub(crate) fn install_builtins(namespaces: &mut Namespaces, ns: NamespaceId, interns: &mut Interns) {
    for exc in ExcType::iter() {
        let name: &'static str = exc.into();
        let id = interns.intern(name);
        namespaces.set(ns, id, Value::Class(exc));
    }
    for builtin in Builtin::iter() {
        let name: &'static str = builtin.into();
        let id = interns.intern(name);
        namespaces.set(ns, id, Value::Builtin(builtin));
    }
}
