//! The interpreter context: one value owning every piece of runtime state.
//!
//! An [`Interpreter`] owns its interner, heap, namespaces, and builtins, so
//! independent interpreters share no mutable state and can run side by
//! side. There are no process-wide registries.

use std::{fmt, sync::Arc};

use crate::{
    builtins,
    bytecode::{Code, CompileError, CompileFlags, Frame, Vm, VmError, compile_source},
    exception::{ExcType, Exception},
    heap::Heap,
    intern::{Interns, StringId},
    io::{PrintWriter, StdPrint},
    namespace::{NamespaceId, Namespaces},
    parse::CompileMode,
    value::{self, Value},
};

/// Either a compile-time or a runtime failure from the one-shot entry
/// points.
#[derive(Debug)]
pub enum Error {
    Compile(CompileError),
    Run(Exception),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(err) => write!(f, "{err}"),
            Self::Run(exc) => write!(f, "{exc}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<CompileError> for Error {
    fn from(err: CompileError) -> Self {
        Self::Compile(err)
    }
}

impl From<Exception> for Error {
    fn from(exc: Exception) -> Self {
        Self::Run(exc)
    }
}

/// A self-contained interpreter instance.
pub struct Interpreter {
    interns: Interns,
    heap: Heap,
    namespaces: Namespaces,
    builtins_ns: NamespaceId,
    globals_ns: NamespaceId,
}

impl Interpreter {
    /// Creates an interpreter with a fresh builtins namespace and an empty
    /// module globals namespace.
    #[must_use]
    pub fn new() -> Self {
        let mut interns = Interns::new();
        let mut namespaces = Namespaces::new();
        let builtins_ns = namespaces.allocate();
        builtins::install_builtins(&mut namespaces, builtins_ns, &mut interns);
        let globals_ns = namespaces.allocate();
        Self {
            interns,
            heap: Heap::new(),
            namespaces,
            builtins_ns,
            globals_ns,
        }
    }

    /// Compiles source text into a code object without running it.
    pub fn compile(
        &mut self,
        source: &str,
        filename: &str,
        mode: CompileMode,
        flags: CompileFlags,
        dont_inherit: bool,
    ) -> Result<Arc<Code>, CompileError> {
        compile_source(source, filename, mode, flags, dont_inherit, &mut self.interns)
    }

    /// Runs a code object against this interpreter's globals, writing guest
    /// output to stdout.
    pub fn run_code(&mut self, code: &Arc<Code>) -> Result<Value, Exception> {
        let mut print = StdPrint;
        self.run_code_with_print(code, &mut print)
    }

    /// Runs a code object, routing guest output through `print`.
    pub fn run_code_with_print<P: PrintWriter>(
        &mut self,
        code: &Arc<Code>,
        print: &mut P,
    ) -> Result<Value, Exception> {
        let frame = Frame::new_module(Arc::clone(code), self.globals_ns);
        let mut vm = Vm::new(
            &mut self.heap,
            &mut self.interns,
            &mut self.namespaces,
            print,
            self.builtins_ns,
        );
        vm.run(frame).map_err(|err| match err {
            VmError::Internal(msg) => Exception {
                exc_type: ExcType::SystemError,
                message: msg.into_owned(),
                frames: Vec::new(),
            },
            VmError::Uncaught { exc, frames } => Exception::new(exc, frames),
        })
    }

    /// Compiles and runs source text in one step.
    pub fn eval(&mut self, source: &str, mode: CompileMode) -> Result<Value, Error> {
        let mut print = StdPrint;
        self.eval_with_print(source, mode, &mut print)
    }

    /// Compiles and runs source text, routing guest output through `print`.
    pub fn eval_with_print<P: PrintWriter>(
        &mut self,
        source: &str,
        mode: CompileMode,
        print: &mut P,
    ) -> Result<Value, Error> {
        let code = self.compile(source, "<string>", mode, CompileFlags::default(), false)?;
        Ok(self.run_code_with_print(&code, print)?)
    }

    /// Reads a module-level global by name.
    #[must_use]
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let id = self.interns.lookup(name)?;
        self.namespaces.get(self.globals_ns, id)
    }

    /// Binds a module-level global.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let id = self.interns.intern(name);
        self.namespaces.set(self.globals_ns, id, value);
    }

    /// Interns a string, e.g. for building code objects by hand.
    pub fn intern(&mut self, s: &str) -> StringId {
        self.interns.intern(s)
    }

    /// Returns the text of an interned string value.
    #[must_use]
    pub fn str_value(&self, value: &Value) -> Option<&str> {
        match value {
            Value::Str(id) => Some(self.interns.get_str(*id)),
            _ => None,
        }
    }

    /// The canonical printable representation of a value.
    #[must_use]
    pub fn repr(&self, value: &Value) -> String {
        value::py_repr(value, &self.heap, &self.interns)
    }

    /// The human-facing string form of a value.
    #[must_use]
    pub fn str_of(&self, value: &Value) -> String {
        value::py_str(value, &self.heap, &self.interns)
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}
