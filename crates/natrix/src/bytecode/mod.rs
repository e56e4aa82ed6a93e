//! Bytecode pipeline: opcode definitions, the instruction assembler, the
//! code object, the tree-to-bytecode compiler, and the virtual machine.
//!
//! # Module structure
//!
//! - `op` - opcode definitions and stack effects
//! - `instr` - symbolic instruction stream and the assembler
//! - `code` - the immutable code object
//! - `compiler` - AST to bytecode compiler
//! - `vm` - the frame-based virtual machine

pub use code::{
    CELL_NOT_AN_ARG, CO_GENERATOR, CO_NEWLOCALS, CO_NOFREE, CO_OPTIMIZED, CO_VARARGS, CO_VARKEYWORDS, Code, Const,
};
pub use compiler::{CompileError, CompileFlags};
pub use instr::{AssembleError, Assembled, Instructions, LabelId, MAX_PASSES};
pub use op::{CmpArg, HAVE_ARGUMENT, Opcode};
pub(crate) use compiler::compile_source;
pub(crate) use vm::{Frame, Vm, VmError};

mod code;
mod compiler;
mod instr;
mod op;
mod vm;
