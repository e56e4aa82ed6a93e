#![doc = include_str!("../../../README.md")]

mod builtins;
mod bytecode;
mod exception;
mod heap;
mod intern;
mod io;
mod namespace;
mod parse;
mod protocol;
mod run;
mod value;

pub use crate::{
    builtins::Builtin,
    bytecode::{
        AssembleError, Assembled, CELL_NOT_AN_ARG, CO_GENERATOR, CO_NEWLOCALS, CO_NOFREE, CO_OPTIMIZED, CO_VARARGS,
        CO_VARKEYWORDS, CmpArg, Code, CompileError, CompileFlags, Const, HAVE_ARGUMENT, Instructions, LabelId,
        MAX_PASSES, Opcode,
    },
    exception::{ExcType, Exception, RunError, RunResult, SimpleException, TraceFrame},
    heap::HeapId,
    intern::StringId,
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    parse::CompileMode,
    protocol::{BinaryOp, CanonCmp, CmpOp, Dispatched, Operand, UnaryOp},
    run::{Error, Interpreter},
    value::{Type, Value},
};
