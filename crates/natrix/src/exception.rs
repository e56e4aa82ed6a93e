//! Guest exception classes and the runtime error channel.
//!
//! Guest-level failures are ordinary values flowing through `Result`, never
//! host panics: opcode handlers return [`RunError`], the VM's unwinding logic
//! walks the block stack looking for a handler, and only an error that
//! escapes the outermost frame is surfaced to the host as an [`Exception`].
//!
//! [`ExcType`] models the class hierarchy with a flat enum plus an explicit
//! subclass lattice, which is all `except`-style matching needs.

use std::{borrow::Cow, fmt};

use crate::value::Type;

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Exception classes known to the interpreter.
///
/// The string representation matches the class name exactly
/// (e.g. `ValueError` -> "ValueError").
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum ExcType {
    /// Root of the hierarchy - matches every exception.
    BaseException,
    /// Base class for all non-exiting exceptions.
    Exception,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    FloatingPointError,
    OverflowError,
    ZeroDivisionError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    NotImplementedError,
    RecursionError,

    // --- NameError hierarchy ---
    NameError,
    UnboundLocalError,

    // --- Standalone exception types ---
    AssertionError,
    AttributeError,
    ImportError,
    MemoryError,
    StopIteration,
    SyntaxError,
    SystemError,
    TypeError,
    ValueError,
}

impl ExcType {
    /// Checks if this exception class is the handler class or one of its
    /// subclasses, i.e. whether `except handler_type:` would catch it.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            Self::BaseException => true,
            Self::Exception => !matches!(self, Self::BaseException),
            Self::ArithmeticError => {
                matches!(
                    self,
                    Self::FloatingPointError | Self::OverflowError | Self::ZeroDivisionError
                )
            }
            Self::LookupError => matches!(self, Self::IndexError | Self::KeyError),
            Self::RuntimeError => matches!(self, Self::NotImplementedError | Self::RecursionError),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            _ => false,
        }
    }

    /// Creates a TypeError with the given message.
    #[must_use]
    pub(crate) fn type_error(msg: impl Into<String>) -> SimpleException {
        SimpleException::new_msg(Self::TypeError, msg.into())
    }

    /// Creates a NameError for an undefined name.
    ///
    /// Matches the original's format: `name 'x' is not defined`.
    #[must_use]
    pub(crate) fn name_error(name: &str) -> SimpleException {
        SimpleException::new_msg(Self::NameError, format!("name '{name}' is not defined"))
    }

    /// Creates an UnboundLocalError for a free variable read before its cell
    /// was filled in the enclosing scope.
    #[must_use]
    pub(crate) fn unbound_free_error(name: &str) -> SimpleException {
        SimpleException::new_msg(
            Self::NameError,
            format!("free variable '{name}' referenced before assignment in enclosing scope"),
        )
    }

    /// Creates an UnboundLocalError for a cell variable read before assignment.
    #[must_use]
    pub(crate) fn unbound_local_error(name: &str) -> SimpleException {
        SimpleException::new_msg(
            Self::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }

    /// Creates a TypeError for unsupported binary operations.
    ///
    /// Format: `unsupported operand type(s) for {op}: '{left}' and '{right}'`
    #[must_use]
    pub(crate) fn binary_type_error(op: &str, lhs_type: &str, rhs_type: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("unsupported operand type(s) for {op}: '{lhs_type}' and '{rhs_type}'"),
        )
        .into()
    }

    /// Creates a TypeError for unsupported ordering comparisons.
    ///
    /// Format: `'<' not supported between instances of 'X' and 'Y'`
    #[must_use]
    pub(crate) fn compare_type_error(op: &str, lhs_type: &str, rhs_type: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("'{op}' not supported between instances of '{lhs_type}' and '{rhs_type}'"),
        )
        .into()
    }

    /// Creates a TypeError for unsupported unary operations.
    ///
    /// Format: `bad operand type for unary {op}: '{type}'`
    #[must_use]
    pub(crate) fn unary_type_error(op: &str, value_type: &str) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("bad operand type for unary {op}: '{value_type}'")).into()
    }

    /// Creates an AttributeError for a missing attribute.
    #[must_use]
    pub(crate) fn attribute_error(value_type: &str, attr: &str) -> RunError {
        SimpleException::new_msg(
            Self::AttributeError,
            format!("'{value_type}' object has no attribute '{attr}'"),
        )
        .into()
    }

    /// Creates a TypeError for calling a non-callable value.
    #[must_use]
    pub(crate) fn not_callable(value_type: &str) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("'{value_type}' object is not callable")).into()
    }

    /// Creates a TypeError for hashing an unhashable value.
    #[must_use]
    pub(crate) fn unhashable(value_type: Type) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("unhashable type: '{value_type}'")).into()
    }

    /// Creates a ZeroDivisionError for integer division or modulo by zero.
    #[must_use]
    pub(crate) fn zero_division() -> RunError {
        SimpleException::new_msg(Self::ZeroDivisionError, "division by zero").into()
    }

    /// Creates a ZeroDivisionError for float division by zero.
    #[must_use]
    pub(crate) fn float_zero_division() -> RunError {
        SimpleException::new_msg(Self::ZeroDivisionError, "float division by zero").into()
    }

    /// Creates an IndexError for a sequence index out of range.
    #[must_use]
    pub(crate) fn index_out_of_range(seq_type: Type) -> RunError {
        SimpleException::new_msg(Self::IndexError, format!("{seq_type} index out of range")).into()
    }

    /// Creates a KeyError carrying the repr of the missing key.
    #[must_use]
    pub(crate) fn key_error(key_repr: String) -> RunError {
        SimpleException::new_msg(Self::KeyError, key_repr).into()
    }
}

/// An exception class plus its message, before it has become a heap value.
///
/// This is what native code raises; the VM materializes it into a guest
/// exception instance when it enters the unwinding machinery.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SimpleException {
    exc_type: ExcType,
    message: String,
}

impl SimpleException {
    /// Creates an exception with a message.
    #[must_use]
    pub fn new_msg(exc_type: ExcType, message: impl Into<String>) -> Self {
        Self {
            exc_type,
            message: message.into(),
        }
    }

    /// Creates an exception with no message.
    #[must_use]
    pub fn new(exc_type: ExcType) -> Self {
        Self {
            exc_type,
            message: String::new(),
        }
    }

    /// The exception class.
    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    /// The message text (possibly empty).
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.exc_type)
        } else {
            write!(f, "{}: {}", self.exc_type, self.message)
        }
    }
}

/// Runtime error types that can occur during execution.
///
/// Two variants:
/// - `Internal`: a bug in the interpreter itself (bad bytecode, an opcode
///   without a handler). Never catchable by guest code; aborts the run.
/// - `Exc`: a guest exception, catchable through the block stack.
#[derive(Debug)]
pub enum RunError {
    /// Internal interpreter error - indicates a bug in natrix, not guest code.
    Internal(Cow<'static, str>),
    /// Catchable guest exception (e.g. ValueError, TypeError).
    Exc(Box<SimpleException>),
}

impl RunError {
    /// Creates an internal error.
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(exc))
    }
}

/// One entry of the frame chain captured when an error escapes a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Qualified name of the code object (`<module>`, `f.<locals>.<lambda>`, ...).
    pub name: String,
    /// Source filename the code object was compiled from.
    pub filename: String,
    /// 1-based source line of the failing instruction.
    pub line: u32,
}

/// An uncaught guest error as surfaced to the embedding host.
///
/// Carries the exception class, the message, and the chain of frames that
/// were unwound while the exception propagated (outermost first).
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    /// The exception class.
    pub exc_type: ExcType,
    /// The exception message (possibly empty).
    pub message: String,
    /// Frames unwound while propagating, outermost first.
    pub frames: Vec<TraceFrame>,
}

impl Exception {
    pub(crate) fn new(exc: SimpleException, frames: Vec<TraceFrame>) -> Self {
        Self {
            exc_type: exc.exc_type,
            message: exc.message,
            frames,
        }
    }

    /// Creates a RuntimeError with no traceback, for host-side failures
    /// (e.g. a [`crate::io::PrintWriter`] that cannot write).
    #[must_use]
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self {
            exc_type: ExcType::RuntimeError,
            message: message.into(),
            frames: Vec::new(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.frames.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for frame in &self.frames {
                writeln!(f, "  File \"{}\", line {}, in {}", frame.filename, frame.line, frame.name)?;
            }
        }
        if self.message.is_empty() {
            write!(f, "{}", self.exc_type)
        } else {
            write!(f, "{}: {}", self.exc_type, self.message)
        }
    }
}

impl std::error::Error for Exception {}
