//! The tree-to-bytecode compiler.
//!
//! Walks ruff AST nodes and emits symbolic instructions, one documented
//! sequence per construct, with no peephole rewriting. Every statement
//! leaves the operand stack at the depth it started, and every produced
//! code object ends in an explicit `RETURN_VALUE` (returning `None` when
//! the body fell through without a value).
//!
//! Only the supported statement and expression forms compile; anything else
//! fails with [`CompileError::NotImplemented`] naming the construct, never
//! with guessed bytecode.

use std::sync::Arc;

use ahash::AHashSet;
use indexmap::IndexSet;
use ruff_python_ast as ast;
use ruff_text_size::Ranged;

use crate::{
    intern::{Interns, StringId},
    parse::{self, CompileMode, LineIndex, ParsedAst},
};

use super::{
    code::{
        CELL_NOT_AN_ARG, CO_NEWLOCALS, CO_NOFREE, CO_OPTIMIZED, CO_VARARGS, CO_VARKEYWORDS, Code, Const,
    },
    instr::{AssembleError, Instructions, LabelId},
    op::{CmpArg, Opcode},
};

/// Compiler flags passed through the compile entry point.
///
/// Reserved for future-statement style flags; no bits are currently
/// defined, and the value is masked into the produced code object's flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileFlags {
    pub bits: u32,
}

/// Mask of compiler flags a code object inherits.
const COMPILER_FLAGS_MASK: u32 = 0;

/// Errors aborting compilation of one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// The source failed to parse, or a form is structurally invalid.
    Syntax { message: String, line: u32 },
    /// The construct is recognized but outside the supported subset.
    NotImplemented { construct: String, line: u32 },
    /// The assembler rejected the emitted stream; always a compiler defect.
    Assemble(AssembleError),
    /// An internal invariant failed; always a compiler defect.
    Internal(String),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax { message, line } => write!(f, "syntax error on line {line}: {message}"),
            Self::NotImplemented { construct, line } => {
                write!(f, "compile: {construct} is not implemented (line {line})")
            }
            Self::Assemble(err) => write!(f, "assembler error: {err}"),
            Self::Internal(msg) => write!(f, "internal compiler error: {msg}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<AssembleError> for CompileError {
    fn from(err: AssembleError) -> Self {
        Self::Assemble(err)
    }
}

/// Compiles source text to a code object.
///
/// `mode` selects module / interactive / expression compilation. The
/// `dont_inherit` parameter exists for interface parity with the classic
/// entry point; with no future statements defined it has no effect yet.
pub(crate) fn compile_source(
    source: &str,
    filename: &str,
    mode: CompileMode,
    flags: CompileFlags,
    _dont_inherit: bool,
    interns: &mut Interns,
) -> Result<Arc<Code>, CompileError> {
    let parsed = parse::parse_source(source, mode)?;
    let inherited = flags.bits & COMPILER_FLAGS_MASK;
    match parsed.ast {
        ParsedAst::Module(module) => {
            let mut compiler = Compiler::new(
                interns,
                &parsed.lines,
                filename,
                ScopeKind::Module {
                    interactive: mode == CompileMode::Single,
                },
                "<module>".to_owned(),
                Vec::new(),
            );
            compiler.flags |= inherited;
            compiler.compile_module(&module.body)
        }
        ParsedAst::Expression(expr) => {
            let mut compiler = Compiler::new(
                interns,
                &parsed.lines,
                filename,
                ScopeKind::Module { interactive: false },
                "<module>".to_owned(),
                Vec::new(),
            );
            compiler.flags |= inherited;
            compiler.compile_expression(&expr.body)
        }
    }
}

/// What kind of scope is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module { interactive: bool },
    Lambda,
}

/// Name-binding context for `name_op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameCtx {
    Load,
    Store,
}

/// State for compiling one code object.
struct Compiler<'a> {
    interns: &'a mut Interns,
    lines: &'a LineIndex,
    filename: &'a str,
    scope: ScopeKind,
    qualname: String,
    instrs: Instructions,
    consts: Vec<Const>,
    names: Vec<StringId>,
    varnames: Vec<StringId>,
    cellvars: Vec<StringId>,
    freevars: Vec<StringId>,
    cell2arg: Vec<u32>,
    argcount: u32,
    kwonlyargcount: u32,
    flags: u32,
    lineno: u32,
    /// Local-binding sets of the enclosing lambda scopes, outermost first.
    /// Used to decide whether an unbound name is a free variable or a
    /// global.
    enclosing: Vec<AHashSet<String>>,
}

impl<'a> Compiler<'a> {
    fn new(
        interns: &'a mut Interns,
        lines: &'a LineIndex,
        filename: &'a str,
        scope: ScopeKind,
        qualname: String,
        enclosing: Vec<AHashSet<String>>,
    ) -> Self {
        Self {
            interns,
            lines,
            filename,
            scope,
            qualname,
            instrs: Instructions::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            cell2arg: Vec::new(),
            argcount: 0,
            kwonlyargcount: 0,
            flags: 0,
            lineno: 1,
            enclosing,
        }
    }

    // -- small emission helpers ---------------------------------------------

    fn set_lineno(&mut self, node: &impl Ranged) {
        self.lineno = self.lines.line_of(node.range().start().to_usize());
        self.instrs.set_lineno(self.lineno);
    }

    fn op(&mut self, op: Opcode) {
        self.instrs.push_op(op);
    }

    fn op_arg(&mut self, op: Opcode, arg: u32) {
        self.instrs.push_op_arg(op, arg);
    }

    fn jump(&mut self, op: Opcode, dest: LabelId) {
        self.instrs.push_jump(op, dest);
    }

    /// Adds a constant to the pool, deduplicating by variant and value.
    fn add_const(&mut self, value: Const) -> u32 {
        if let Some(i) = self.consts.iter().position(|c| c == &value) {
            return u32::try_from(i).expect("constant pool exceeds u32");
        }
        self.consts.push(value);
        u32::try_from(self.consts.len() - 1).expect("constant pool exceeds u32")
    }

    fn load_const(&mut self, value: Const) {
        let idx = self.add_const(value);
        self.op_arg(Opcode::LoadConst, idx);
    }

    fn load_str_const(&mut self, s: &str) {
        let id = self.interns.intern(s);
        self.load_const(Const::Str(id));
    }

    /// Returns the index of a name in the names pool, growing it on a miss.
    fn name_index(&mut self, name: &str) -> u32 {
        let id = self.interns.intern(name);
        if let Some(i) = self.names.iter().position(|n| *n == id) {
            return u32::try_from(i).expect("name pool exceeds u32");
        }
        self.names.push(id);
        u32::try_from(self.names.len() - 1).expect("name pool exceeds u32")
    }

    fn not_implemented<T>(&self, construct: impl Into<String>) -> Result<T, CompileError> {
        Err(CompileError::NotImplemented {
            construct: construct.into(),
            line: self.lineno,
        })
    }

    fn syntax_error<T>(&self, message: impl Into<String>) -> Result<T, CompileError> {
        Err(CompileError::Syntax {
            message: message.into(),
            line: self.lineno,
        })
    }

    // -- name classification ------------------------------------------------

    /// Index of a name in the cell-and-free storage, cells first.
    fn deref_index(&self, id: StringId) -> Option<u32> {
        if let Some(i) = self.cellvars.iter().position(|n| *n == id) {
            return Some(i as u32);
        }
        self.freevars
            .iter()
            .position(|n| *n == id)
            .map(|i| (self.cellvars.len() + i) as u32)
    }

    /// Emits the load or store matching the name's scope classification:
    /// cells and free variables use deref opcodes, lambda parameters use
    /// fast locals, unbound names in a lambda resolve as globals, and module
    /// scope uses plain name lookup.
    fn name_op(&mut self, name: &str, ctx: NameCtx) -> Result<(), CompileError> {
        if matches!(name, "None" | "True" | "False") {
            return self.syntax_error(format!("cannot assign to {name}"));
        }
        let id = self.interns.intern(name);
        match self.scope {
            ScopeKind::Module { .. } => {
                let idx = self.name_index(name);
                let op = match ctx {
                    NameCtx::Load => Opcode::LoadName,
                    NameCtx::Store => Opcode::StoreName,
                };
                self.op_arg(op, idx);
            }
            ScopeKind::Lambda => {
                if let Some(idx) = self.deref_index(id) {
                    let op = match ctx {
                        NameCtx::Load => Opcode::LoadDeref,
                        NameCtx::Store => Opcode::StoreDeref,
                    };
                    self.op_arg(op, idx);
                } else if let Some(slot) = self.varnames.iter().position(|n| *n == id) {
                    let op = match ctx {
                        NameCtx::Load => Opcode::LoadFast,
                        NameCtx::Store => Opcode::StoreFast,
                    };
                    self.op_arg(op, slot as u32);
                } else {
                    let idx = self.name_index(name);
                    let op = match ctx {
                        NameCtx::Load => Opcode::LoadGlobal,
                        NameCtx::Store => Opcode::StoreGlobal,
                    };
                    self.op_arg(op, idx);
                }
            }
        }
        Ok(())
    }

    // -- top-level units ----------------------------------------------------

    /// Compiles a module or interactive body.
    fn compile_module(mut self, body: &[ast::Stmt]) -> Result<Arc<Code>, CompileError> {
        let body = self.module_docstring(body);
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        if !self.instrs.ends_with_return() {
            self.load_const(Const::None);
            self.op(Opcode::ReturnValue);
        }
        self.finish()
    }

    /// Compiles a bare expression (`eval` mode).
    fn compile_expression(mut self, expr: &ast::Expr) -> Result<Arc<Code>, CompileError> {
        self.compile_expr(expr)?;
        if !self.instrs.ends_with_return() {
            self.op(Opcode::ReturnValue);
        }
        self.finish()
    }

    /// Peels a leading docstring off a module body, binding it to
    /// `__doc__`. Interactive bodies keep their statements untouched.
    fn module_docstring<'s>(&mut self, body: &'s [ast::Stmt]) -> &'s [ast::Stmt] {
        if matches!(self.scope, ScopeKind::Module { interactive: true }) {
            return body;
        }
        if let Some((ast::Stmt::Expr(first), rest)) = body.split_first()
            && let ast::Expr::StringLiteral(lit) = first.value.as_ref()
        {
            let id = self.interns.intern(lit.value.to_str());
            self.load_const(Const::Str(id));
            let idx = self.name_index("__doc__");
            self.op_arg(Opcode::StoreName, idx);
            return rest;
        }
        body
    }

    /// Assembles the emitted stream into the final code object.
    fn finish(mut self) -> Result<Arc<Code>, CompileError> {
        if self.freevars.is_empty() && self.cellvars.is_empty() {
            self.flags |= CO_NOFREE;
        }
        let assembled = self.instrs.assemble(1)?;
        let name = self.interns.intern_owned(self.qualname);
        Ok(Arc::new(Code {
            argcount: self.argcount,
            kwonlyargcount: self.kwonlyargcount,
            nlocals: u32::try_from(self.varnames.len()).expect("local count exceeds u32"),
            stacksize: assembled.stacksize,
            flags: self.flags,
            code: assembled.code,
            consts: self.consts,
            names: self.names,
            varnames: self.varnames,
            freevars: self.freevars,
            cellvars: self.cellvars,
            cell2arg: self.cell2arg,
            filename: self.filename.to_owned(),
            name,
            firstlineno: 1,
            lnotab: assembled.lnotab,
        }))
    }

    // -- statements ---------------------------------------------------------

    fn compile_stmt(&mut self, stmt: &ast::Stmt) -> Result<(), CompileError> {
        self.set_lineno(stmt);
        match stmt {
            ast::Stmt::Assign(node) => {
                self.compile_expr(&node.value)?;
                for (i, target) in node.targets.iter().enumerate() {
                    if i != node.targets.len() - 1 {
                        self.op(Opcode::DupTop);
                    }
                    self.compile_target(target)?;
                }
                Ok(())
            }
            ast::Stmt::AugAssign(node) => self.compile_aug_assign(node),
            ast::Stmt::Assert(node) => {
                let end = self.instrs.new_label();
                self.compile_expr(&node.test)?;
                self.jump(Opcode::PopJumpIfTrue, end);
                let idx = self.name_index("AssertionError");
                self.op_arg(Opcode::LoadGlobal, idx);
                if let Some(msg) = &node.msg {
                    self.compile_expr(msg)?;
                    self.op_arg(Opcode::CallFunction, 1);
                }
                self.op_arg(Opcode::RaiseVarargs, 1);
                self.instrs.push_label(end);
                Ok(())
            }
            ast::Stmt::Expr(node) => {
                if matches!(self.scope, ScopeKind::Module { interactive: true }) {
                    self.compile_expr(&node.value)?;
                    self.op(Opcode::PrintExpr);
                    return Ok(());
                }
                // Statement-position literals generate no code.
                if matches!(
                    node.value.as_ref(),
                    ast::Expr::StringLiteral(_) | ast::Expr::NumberLiteral(_)
                ) {
                    return Ok(());
                }
                self.compile_expr(&node.value)?;
                self.op(Opcode::PopTop);
                Ok(())
            }
            ast::Stmt::Pass(_) => Ok(()),
            other => self.not_implemented(stmt_construct_name(other)),
        }
    }

    fn compile_aug_assign(&mut self, node: &ast::StmtAugAssign) -> Result<(), CompileError> {
        let op = self.inplace_opcode(node.op)?;
        match node.target.as_ref() {
            ast::Expr::Name(name) => {
                self.name_op(name.id.as_str(), NameCtx::Load)?;
                self.compile_expr(&node.value)?;
                self.op(op);
                self.name_op(name.id.as_str(), NameCtx::Store)
            }
            ast::Expr::Attribute(attr) => {
                self.compile_expr(&attr.value)?;
                self.op(Opcode::DupTop);
                let idx = self.name_index(attr.attr.as_str());
                self.op_arg(Opcode::LoadAttr, idx);
                self.compile_expr(&node.value)?;
                self.op(op);
                self.op(Opcode::RotTwo);
                self.op_arg(Opcode::StoreAttr, idx);
                Ok(())
            }
            ast::Expr::Subscript(sub) => {
                self.compile_expr(&sub.value)?;
                self.compile_subscript_index(&sub.slice)?;
                self.op(Opcode::DupTopTwo);
                self.op(Opcode::BinarySubscr);
                self.compile_expr(&node.value)?;
                self.op(op);
                self.op(Opcode::RotThree);
                self.op(Opcode::StoreSubscr);
                Ok(())
            }
            _ => self.syntax_error("illegal expression for augmented assignment"),
        }
    }

    /// Compiles an assignment target, consuming the value on the stack.
    fn compile_target(&mut self, target: &ast::Expr) -> Result<(), CompileError> {
        match target {
            ast::Expr::Name(name) => self.name_op(name.id.as_str(), NameCtx::Store),
            ast::Expr::Attribute(attr) => {
                self.compile_expr(&attr.value)?;
                let idx = self.name_index(attr.attr.as_str());
                self.op_arg(Opcode::StoreAttr, idx);
                Ok(())
            }
            ast::Expr::Subscript(sub) => {
                self.compile_expr(&sub.value)?;
                self.compile_subscript_index(&sub.slice)?;
                self.op(Opcode::StoreSubscr);
                Ok(())
            }
            ast::Expr::Tuple(ast::ExprTuple { elts, .. }) | ast::Expr::List(ast::ExprList { elts, .. }) => {
                if elts.iter().any(|e| matches!(e, ast::Expr::Starred(_))) {
                    return self.not_implemented("starred assignment target");
                }
                self.op_arg(
                    Opcode::UnpackSequence,
                    u32::try_from(elts.len()).expect("unpack target count exceeds u32"),
                );
                for elt in elts {
                    self.compile_target(elt)?;
                }
                Ok(())
            }
            _ => self.syntax_error(format!("cannot assign to {}", expr_construct_name(target))),
        }
    }

    // -- expressions --------------------------------------------------------

    fn compile_expr(&mut self, expr: &ast::Expr) -> Result<(), CompileError> {
        self.set_lineno(expr);
        match expr {
            ast::Expr::BoolOp(node) => {
                let op = match node.op {
                    ast::BoolOp::And => Opcode::JumpIfFalseOrPop,
                    ast::BoolOp::Or => Opcode::JumpIfTrueOrPop,
                };
                let end = self.instrs.new_label();
                for (i, value) in node.values.iter().enumerate() {
                    self.compile_expr(value)?;
                    if i != node.values.len() - 1 {
                        self.jump(op, end);
                    }
                }
                self.instrs.push_label(end);
                Ok(())
            }
            ast::Expr::BinOp(node) => {
                self.compile_expr(&node.left)?;
                self.compile_expr(&node.right)?;
                let op = self.binary_opcode(node.op)?;
                self.op(op);
                Ok(())
            }
            ast::Expr::UnaryOp(node) => {
                self.compile_expr(&node.operand)?;
                let op = match node.op {
                    ast::UnaryOp::Invert => Opcode::UnaryInvert,
                    ast::UnaryOp::Not => Opcode::UnaryNot,
                    ast::UnaryOp::UAdd => Opcode::UnaryPositive,
                    ast::UnaryOp::USub => Opcode::UnaryNegative,
                };
                self.op(op);
                Ok(())
            }
            ast::Expr::Lambda(node) => self.compile_lambda(node),
            ast::Expr::If(node) => {
                let orelse = self.instrs.new_label();
                let end = self.instrs.new_label();
                self.compile_expr(&node.test)?;
                self.jump(Opcode::PopJumpIfFalse, orelse);
                self.compile_expr(&node.body)?;
                self.jump(Opcode::JumpForward, end);
                self.instrs.push_label(orelse);
                self.compile_expr(&node.orelse)?;
                self.instrs.push_label(end);
                Ok(())
            }
            ast::Expr::Dict(node) => {
                self.op_arg(
                    Opcode::BuildMap,
                    u32::try_from(node.items.len()).expect("dict literal size exceeds u32"),
                );
                for item in &node.items {
                    let Some(key) = &item.key else {
                        return self.not_implemented("dict unpacking");
                    };
                    // Value first, then key, matching STORE_MAP's layout.
                    self.compile_expr(&item.value)?;
                    self.compile_expr(key)?;
                    self.op(Opcode::StoreMap);
                }
                Ok(())
            }
            ast::Expr::Set(node) => {
                for elt in &node.elts {
                    self.compile_expr(elt)?;
                }
                self.op_arg(
                    Opcode::BuildSet,
                    u32::try_from(node.elts.len()).expect("set literal size exceeds u32"),
                );
                Ok(())
            }
            ast::Expr::Compare(node) => self.compile_compare(node),
            ast::Expr::Call(node) => {
                self.compile_expr(&node.func)?;
                self.compile_call_tail(&node.arguments)
            }
            ast::Expr::NumberLiteral(node) => {
                let value = match &node.value {
                    ast::Number::Int(i) => match i.as_i64() {
                        Some(small) => Const::Int(small),
                        None => match parse::parse_int_literal(&i.to_string()) {
                            Some(big) => Const::BigInt(big),
                            None => return self.syntax_error(format!("invalid integer literal: {i}")),
                        },
                    },
                    ast::Number::Float(f) => Const::Float(*f),
                    ast::Number::Complex { .. } => return self.not_implemented("complex literal"),
                };
                self.load_const(value);
                Ok(())
            }
            ast::Expr::StringLiteral(node) => {
                let id = self.interns.intern(node.value.to_str());
                self.load_const(Const::Str(id));
                Ok(())
            }
            ast::Expr::BooleanLiteral(node) => {
                self.load_const(Const::Bool(node.value));
                Ok(())
            }
            ast::Expr::NoneLiteral(_) => {
                self.load_const(Const::None);
                Ok(())
            }
            ast::Expr::Attribute(node) => {
                self.compile_expr(&node.value)?;
                let idx = self.name_index(node.attr.as_str());
                self.op_arg(Opcode::LoadAttr, idx);
                Ok(())
            }
            ast::Expr::Subscript(node) => {
                self.compile_expr(&node.value)?;
                self.compile_subscript_index(&node.slice)?;
                self.op(Opcode::BinarySubscr);
                Ok(())
            }
            ast::Expr::Name(node) => self.name_op(node.id.as_str(), NameCtx::Load),
            ast::Expr::List(node) => {
                self.compile_elements(&node.elts)?;
                self.op_arg(
                    Opcode::BuildList,
                    u32::try_from(node.elts.len()).expect("list literal size exceeds u32"),
                );
                Ok(())
            }
            ast::Expr::Tuple(node) => {
                self.compile_elements(&node.elts)?;
                self.op_arg(
                    Opcode::BuildTuple,
                    u32::try_from(node.elts.len()).expect("tuple literal size exceeds u32"),
                );
                Ok(())
            }
            ast::Expr::Starred(_) => self.syntax_error("can't use starred expression here"),
            other => self.not_implemented(expr_construct_name(other)),
        }
    }

    fn compile_elements(&mut self, elts: &[ast::Expr]) -> Result<(), CompileError> {
        for elt in elts {
            if matches!(elt, ast::Expr::Starred(_)) {
                return self.not_implemented("iterable unpacking in a display");
            }
            self.compile_expr(elt)?;
        }
        Ok(())
    }

    /// Chained comparisons evaluate each inner comparator exactly once: the
    /// comparator is duplicated and rotated under the operands, and a false
    /// step short-circuits to a cleanup block that drops the duplicate.
    fn compile_compare(&mut self, node: &ast::ExprCompare) -> Result<(), CompileError> {
        if node.ops.len() != node.comparators.len() || node.ops.is_empty() {
            return Err(CompileError::Internal("malformed comparison node".to_owned()));
        }
        self.compile_expr(&node.left)?;
        let cleanup = self.instrs.new_label();
        let count = node.ops.len();
        for (i, (op, comparator)) in node.ops.iter().zip(node.comparators.iter()).enumerate() {
            let last = i == count - 1;
            self.compile_expr(comparator)?;
            if !last {
                self.op(Opcode::DupTop);
                self.op(Opcode::RotThree);
            }
            let arg = match op {
                ast::CmpOp::Eq => CmpArg::Eq,
                ast::CmpOp::NotEq => CmpArg::Ne,
                ast::CmpOp::Lt => CmpArg::Lt,
                ast::CmpOp::LtE => CmpArg::Le,
                ast::CmpOp::Gt => CmpArg::Gt,
                ast::CmpOp::GtE => CmpArg::Ge,
                ast::CmpOp::Is => CmpArg::Is,
                ast::CmpOp::IsNot => CmpArg::IsNot,
                ast::CmpOp::In => CmpArg::In,
                ast::CmpOp::NotIn => CmpArg::NotIn,
            };
            self.op_arg(Opcode::CompareOp, arg as u32);
            if !last {
                self.jump(Opcode::JumpIfFalseOrPop, cleanup);
            }
        }
        if count > 1 {
            let end = self.instrs.new_label();
            self.jump(Opcode::JumpForward, end);
            self.instrs.push_label(cleanup);
            self.op(Opcode::RotTwo);
            self.op(Opcode::PopTop);
            self.instrs.push_label(end);
        }
        Ok(())
    }

    /// Compiles the index of a subscript: a slice display becomes a slice
    /// object, anything else is an ordinary expression.
    fn compile_subscript_index(&mut self, index: &ast::Expr) -> Result<(), CompileError> {
        match index {
            ast::Expr::Slice(node) => {
                let mut n = 2;
                match &node.lower {
                    Some(lower) => self.compile_expr(lower)?,
                    None => self.load_const(Const::None),
                }
                match &node.upper {
                    Some(upper) => self.compile_expr(upper)?,
                    None => self.load_const(Const::None),
                }
                if let Some(step) = &node.step {
                    n += 1;
                    self.compile_expr(step)?;
                }
                self.op_arg(Opcode::BuildSlice, n);
                Ok(())
            }
            ast::Expr::Tuple(node) if node.elts.iter().any(|e| matches!(e, ast::Expr::Slice(_))) => {
                self.not_implemented("extended slice")
            }
            other => self.compile_expr(other),
        }
    }

    /// Compiles call arguments for a callable already on the stack,
    /// selecting the opcode variant from the presence of `*args`/`**kwargs`.
    fn compile_call_tail(&mut self, arguments: &ast::Arguments) -> Result<(), CompileError> {
        let mut star_args: Option<&ast::Expr> = None;
        let mut positional = 0u32;
        for arg in &arguments.args {
            match arg {
                ast::Expr::Starred(starred) => {
                    if star_args.is_some() {
                        return self.not_implemented("multiple *-unpackings in a call");
                    }
                    star_args = Some(&starred.value);
                }
                expr => {
                    if star_args.is_some() {
                        return self.not_implemented("positional argument after *-unpacking");
                    }
                    self.compile_expr(expr)?;
                    positional += 1;
                }
            }
        }

        let mut star_kwargs: Option<&ast::Expr> = None;
        let mut seen: AHashSet<&str> = AHashSet::new();
        let mut kw_count = 0u32;
        for keyword in &arguments.keywords {
            match &keyword.arg {
                Some(name) => {
                    if !seen.insert(name.as_str()) {
                        return self.syntax_error("keyword argument repeated");
                    }
                    self.load_str_const(name.as_str());
                    self.compile_expr(&keyword.value)?;
                    kw_count += 1;
                }
                None => {
                    if star_kwargs.is_some() {
                        return self.not_implemented("multiple **-unpackings in a call");
                    }
                    star_kwargs = Some(&keyword.value);
                }
            }
        }

        if positional > 255 || kw_count > 255 {
            return self.syntax_error("more than 255 arguments");
        }

        let op = match (star_args, star_kwargs) {
            (None, None) => Opcode::CallFunction,
            (Some(star), None) => {
                self.compile_expr(star)?;
                Opcode::CallFunctionVar
            }
            (None, Some(kwargs)) => {
                self.compile_expr(kwargs)?;
                Opcode::CallFunctionKw
            }
            (Some(star), Some(kwargs)) => {
                self.compile_expr(star)?;
                self.compile_expr(kwargs)?;
                Opcode::CallFunctionVarKw
            }
        };
        self.op_arg(op, positional | (kw_count << 8));
        Ok(())
    }

    // -- lambdas and closures -----------------------------------------------

    /// Compiles a lambda to a nested code object and materializes it at the
    /// definition site, as a plain function or a closure depending on
    /// whether the body captures enclosing state.
    fn compile_lambda(&mut self, node: &ast::ExprLambda) -> Result<(), CompileError> {
        let params = ParamInfo::from_parameters(node.parameters.as_deref());

        // Defaults are evaluated in the defining scope, positionals first,
        // then (name, value) pairs for keyword-only parameters.
        for default in &params.pos_defaults {
            self.compile_expr(default)?;
        }
        for (name, default) in &params.kw_defaults {
            self.load_str_const(name);
            self.compile_expr(default)?;
        }

        // Capture analysis over the lambda body.
        let param_set: AHashSet<String> = params.all_names.iter().cloned().collect();
        let mut free = IndexSet::new();
        let mut cells = IndexSet::new();
        scan_captures(&node.body, &param_set, &AHashSet::new(), false, &mut free, &mut cells);
        let freevars: Vec<String> = free
            .into_iter()
            .filter(|name| self.binds_in_enclosing_scope(name))
            .collect();

        let qualname = match self.scope {
            ScopeKind::Module { .. } => "<lambda>".to_owned(),
            ScopeKind::Lambda => format!("{}.<locals>.<lambda>", self.qualname),
        };

        let code = {
            let mut child_enclosing = self.enclosing.clone();
            if self.scope == ScopeKind::Lambda {
                let mut own: AHashSet<String> = AHashSet::new();
                for id in self.varnames.iter().chain(&self.cellvars).chain(&self.freevars) {
                    own.insert(self.interns.get_str(*id).to_owned());
                }
                child_enclosing.push(own);
            }
            let mut child = Compiler::new(
                &mut *self.interns,
                self.lines,
                self.filename,
                ScopeKind::Lambda,
                qualname.clone(),
                child_enclosing,
            );
            child.argcount = params.argcount;
            child.kwonlyargcount = params.kwonlyargcount;
            child.flags = CO_OPTIMIZED | CO_NEWLOCALS | params.flags;
            child.varnames = params.all_names.iter().map(|n| child.interns.intern(n)).collect();
            for cell in &cells {
                let id = child.interns.intern(cell);
                child.cellvars.push(id);
                let slot = child
                    .varnames
                    .iter()
                    .position(|n| *n == id)
                    .map_or(CELL_NOT_AN_ARG, |i| i as u32);
                child.cell2arg.push(slot);
            }
            child.freevars = freevars.iter().map(|n| child.interns.intern(n)).collect();
            // A lambda cannot carry a docstring; pin None into the first
            // constant slot regardless.
            let _ = child.add_const(Const::None);
            child.set_lineno(&*node.body);
            child.compile_expr(&node.body)?;
            child.op(Opcode::ReturnValue);
            child.finish()?
        };

        let argdesc = params.pos_defaults.len() as u32 | ((params.kw_defaults.len() as u32) << 8);
        self.make_closure(&code, argdesc, &qualname)
    }

    /// Whether a name is bound by one of the enclosing lambda scopes (i.e.
    /// resolves as a free variable rather than a global).
    fn binds_in_enclosing_scope(&self, name: &str) -> bool {
        if self.scope == ScopeKind::Lambda {
            let id = self.interns.lookup(name);
            let bound_here = id.is_some_and(|id| {
                self.varnames.contains(&id) || self.cellvars.contains(&id) || self.freevars.contains(&id)
            });
            if bound_here {
                return true;
            }
        }
        self.enclosing.iter().any(|scope| scope.contains(name))
    }

    /// Emits the function-or-closure construction for a compiled body: a
    /// plain `MAKE_FUNCTION` when the body has no free variables, otherwise
    /// the captured cells are loaded, bundled, and passed to
    /// `MAKE_CLOSURE`.
    fn make_closure(&mut self, code: &Arc<Code>, argdesc: u32, qualname: &str) -> Result<(), CompileError> {
        if code.freevars.is_empty() {
            self.load_const(Const::Code(Arc::clone(code)));
            self.load_str_const(qualname);
            self.op_arg(Opcode::MakeFunction, argdesc);
            return Ok(());
        }
        for free in &code.freevars {
            let idx = self.deref_index(*free).ok_or_else(|| {
                CompileError::Internal(format!(
                    "free variable '{}' of '{qualname}' not visible in the enclosing scope",
                    self.interns.get_str(*free)
                ))
            })?;
            self.op_arg(Opcode::LoadClosure, idx);
        }
        self.op_arg(
            Opcode::BuildTuple,
            u32::try_from(code.freevars.len()).expect("free variable count exceeds u32"),
        );
        self.load_const(Const::Code(Arc::clone(code)));
        self.load_str_const(qualname);
        self.op_arg(Opcode::MakeClosure, argdesc);
        Ok(())
    }

    // -- operator tables ----------------------------------------------------

    fn binary_opcode(&self, op: ast::Operator) -> Result<Opcode, CompileError> {
        Ok(match op {
            ast::Operator::Add => Opcode::BinaryAdd,
            ast::Operator::Sub => Opcode::BinarySubtract,
            ast::Operator::Mult => Opcode::BinaryMultiply,
            ast::Operator::Div => Opcode::BinaryTrueDivide,
            ast::Operator::Mod => Opcode::BinaryModulo,
            ast::Operator::Pow => Opcode::BinaryPower,
            ast::Operator::LShift => Opcode::BinaryLshift,
            ast::Operator::RShift => Opcode::BinaryRshift,
            ast::Operator::BitOr => Opcode::BinaryOr,
            ast::Operator::BitXor => Opcode::BinaryXor,
            ast::Operator::BitAnd => Opcode::BinaryAnd,
            ast::Operator::FloorDiv => Opcode::BinaryFloorDivide,
            ast::Operator::MatMult => return self.not_implemented("matrix multiplication"),
        })
    }

    fn inplace_opcode(&self, op: ast::Operator) -> Result<Opcode, CompileError> {
        Ok(match op {
            ast::Operator::Add => Opcode::InplaceAdd,
            ast::Operator::Sub => Opcode::InplaceSubtract,
            ast::Operator::Mult => Opcode::InplaceMultiply,
            ast::Operator::Div => Opcode::InplaceTrueDivide,
            ast::Operator::Mod => Opcode::InplaceModulo,
            ast::Operator::Pow => Opcode::InplacePower,
            ast::Operator::LShift => Opcode::InplaceLshift,
            ast::Operator::RShift => Opcode::InplaceRshift,
            ast::Operator::BitOr => Opcode::InplaceOr,
            ast::Operator::BitXor => Opcode::InplaceXor,
            ast::Operator::BitAnd => Opcode::InplaceAnd,
            ast::Operator::FloorDiv => Opcode::InplaceFloorDivide,
            ast::Operator::MatMult => return self.not_implemented("matrix multiplication"),
        })
    }
}

/// Flattened lambda parameter information.
struct ParamInfo<'a> {
    /// All local slot names: positional, keyword-only, `*args`, `**kwargs`.
    all_names: Vec<String>,
    argcount: u32,
    kwonlyargcount: u32,
    flags: u32,
    pos_defaults: Vec<&'a ast::Expr>,
    kw_defaults: Vec<(String, &'a ast::Expr)>,
}

impl<'a> ParamInfo<'a> {
    fn from_parameters(parameters: Option<&'a ast::Parameters>) -> Self {
        let mut info = Self {
            all_names: Vec::new(),
            argcount: 0,
            kwonlyargcount: 0,
            flags: 0,
            pos_defaults: Vec::new(),
            kw_defaults: Vec::new(),
        };
        let Some(parameters) = parameters else {
            return info;
        };
        for param in parameters.posonlyargs.iter().chain(&parameters.args) {
            info.all_names.push(param.parameter.name.as_str().to_owned());
            info.argcount += 1;
            if let Some(default) = &param.default {
                info.pos_defaults.push(default);
            }
        }
        for param in &parameters.kwonlyargs {
            let name = param.parameter.name.as_str().to_owned();
            if let Some(default) = &param.default {
                info.kw_defaults.push((name.clone(), default));
            }
            info.all_names.push(name);
            info.kwonlyargcount += 1;
        }
        if let Some(vararg) = &parameters.vararg {
            info.all_names.push(vararg.name.as_str().to_owned());
            info.flags |= CO_VARARGS;
        }
        if let Some(kwarg) = &parameters.kwarg {
            info.all_names.push(kwarg.name.as_str().to_owned());
            info.flags |= CO_VARKEYWORDS;
        }
        info
    }
}

/// Collects the names a lambda body needs from outside itself.
///
/// `free` receives names bound neither by the lambda's own parameters nor by
/// an intervening nested lambda; `cells` receives the lambda's own
/// parameters that a nested lambda captures.
fn scan_captures(
    expr: &ast::Expr,
    lambda_params: &AHashSet<String>,
    inner_bound: &AHashSet<String>,
    in_nested: bool,
    free: &mut IndexSet<String>,
    cells: &mut IndexSet<String>,
) {
    match expr {
        ast::Expr::Name(name) => {
            let id = name.id.as_str();
            if inner_bound.contains(id) {
                return;
            }
            if lambda_params.contains(id) {
                if in_nested {
                    cells.insert(id.to_owned());
                }
            } else {
                free.insert(id.to_owned());
            }
        }
        ast::Expr::Lambda(nested) => {
            // Defaults evaluate in the current scope, before the nested
            // parameters come into view.
            let mut nested_bound = inner_bound.clone();
            if let Some(parameters) = nested.parameters.as_deref() {
                for param in parameters.posonlyargs.iter().chain(&parameters.args).chain(&parameters.kwonlyargs) {
                    if let Some(default) = &param.default {
                        scan_captures(default, lambda_params, inner_bound, in_nested, free, cells);
                    }
                    nested_bound.insert(param.parameter.name.as_str().to_owned());
                }
                if let Some(vararg) = &parameters.vararg {
                    nested_bound.insert(vararg.name.as_str().to_owned());
                }
                if let Some(kwarg) = &parameters.kwarg {
                    nested_bound.insert(kwarg.name.as_str().to_owned());
                }
            }
            scan_captures(&nested.body, lambda_params, &nested_bound, true, free, cells);
        }
        ast::Expr::BoolOp(node) => {
            for value in &node.values {
                scan_captures(value, lambda_params, inner_bound, in_nested, free, cells);
            }
        }
        ast::Expr::BinOp(node) => {
            scan_captures(&node.left, lambda_params, inner_bound, in_nested, free, cells);
            scan_captures(&node.right, lambda_params, inner_bound, in_nested, free, cells);
        }
        ast::Expr::UnaryOp(node) => {
            scan_captures(&node.operand, lambda_params, inner_bound, in_nested, free, cells);
        }
        ast::Expr::If(node) => {
            scan_captures(&node.test, lambda_params, inner_bound, in_nested, free, cells);
            scan_captures(&node.body, lambda_params, inner_bound, in_nested, free, cells);
            scan_captures(&node.orelse, lambda_params, inner_bound, in_nested, free, cells);
        }
        ast::Expr::Dict(node) => {
            for item in &node.items {
                if let Some(key) = &item.key {
                    scan_captures(key, lambda_params, inner_bound, in_nested, free, cells);
                }
                scan_captures(&item.value, lambda_params, inner_bound, in_nested, free, cells);
            }
        }
        ast::Expr::Set(node) => {
            for elt in &node.elts {
                scan_captures(elt, lambda_params, inner_bound, in_nested, free, cells);
            }
        }
        ast::Expr::List(node) => {
            for elt in &node.elts {
                scan_captures(elt, lambda_params, inner_bound, in_nested, free, cells);
            }
        }
        ast::Expr::Tuple(node) => {
            for elt in &node.elts {
                scan_captures(elt, lambda_params, inner_bound, in_nested, free, cells);
            }
        }
        ast::Expr::Compare(node) => {
            scan_captures(&node.left, lambda_params, inner_bound, in_nested, free, cells);
            for comparator in &node.comparators {
                scan_captures(comparator, lambda_params, inner_bound, in_nested, free, cells);
            }
        }
        ast::Expr::Call(node) => {
            scan_captures(&node.func, lambda_params, inner_bound, in_nested, free, cells);
            for arg in &node.arguments.args {
                scan_captures(arg, lambda_params, inner_bound, in_nested, free, cells);
            }
            for keyword in &node.arguments.keywords {
                scan_captures(&keyword.value, lambda_params, inner_bound, in_nested, free, cells);
            }
        }
        ast::Expr::Attribute(node) => {
            scan_captures(&node.value, lambda_params, inner_bound, in_nested, free, cells);
        }
        ast::Expr::Subscript(node) => {
            scan_captures(&node.value, lambda_params, inner_bound, in_nested, free, cells);
            scan_captures(&node.slice, lambda_params, inner_bound, in_nested, free, cells);
        }
        ast::Expr::Slice(node) => {
            for part in [&node.lower, &node.upper, &node.step].into_iter().flatten() {
                scan_captures(part, lambda_params, inner_bound, in_nested, free, cells);
            }
        }
        ast::Expr::Starred(node) => {
            scan_captures(&node.value, lambda_params, inner_bound, in_nested, free, cells);
        }
        // Literals bind nothing; unsupported constructs fail compilation
        // before their names could matter.
        _ => {}
    }
}

fn stmt_construct_name(stmt: &ast::Stmt) -> String {
    let name = match stmt {
        ast::Stmt::FunctionDef(_) => "function definition",
        ast::Stmt::ClassDef(_) => "class definition",
        ast::Stmt::Return(_) => "return statement",
        ast::Stmt::Delete(_) => "del statement",
        ast::Stmt::TypeAlias(_) => "type alias statement",
        ast::Stmt::AnnAssign(_) => "annotated assignment",
        ast::Stmt::For(_) => "for loop",
        ast::Stmt::While(_) => "while loop",
        ast::Stmt::If(_) => "if statement",
        ast::Stmt::With(_) => "with statement",
        ast::Stmt::Match(_) => "match statement",
        ast::Stmt::Raise(_) => "raise statement",
        ast::Stmt::Try(_) => "try statement",
        ast::Stmt::Import(_) => "import statement",
        ast::Stmt::ImportFrom(_) => "import statement",
        ast::Stmt::Global(_) => "global statement",
        ast::Stmt::Nonlocal(_) => "nonlocal statement",
        ast::Stmt::Break(_) => "break statement",
        ast::Stmt::Continue(_) => "continue statement",
        _ => return format!("{stmt:?}"),
    };
    name.to_owned()
}

fn expr_construct_name(expr: &ast::Expr) -> String {
    let name = match expr {
        ast::Expr::Named(_) => "assignment expression",
        ast::Expr::ListComp(_) => "list comprehension",
        ast::Expr::SetComp(_) => "set comprehension",
        ast::Expr::DictComp(_) => "dict comprehension",
        ast::Expr::Generator(_) => "generator expression",
        ast::Expr::Await(_) => "await expression",
        ast::Expr::Yield(_) => "yield expression",
        ast::Expr::YieldFrom(_) => "yield from expression",
        ast::Expr::FString(_) => "f-string",
        ast::Expr::BytesLiteral(_) => "bytes literal",
        ast::Expr::EllipsisLiteral(_) => "ellipsis literal",
        ast::Expr::Starred(_) => "starred expression",
        ast::Expr::Slice(_) => "slice expression",
        ast::Expr::Call(_) => "call expression",
        ast::Expr::BoolOp(_) => "boolean expression",
        _ => return format!("{expr:?}"),
    };
    name.to_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn compile(source: &str, mode: CompileMode) -> (Arc<Code>, Interns) {
        let mut interns = Interns::new();
        let code = compile_source(source, "test.py", mode, CompileFlags::default(), false, &mut interns)
            .expect("compilation failed");
        (code, interns)
    }

    fn compile_err(source: &str, mode: CompileMode) -> CompileError {
        let mut interns = Interns::new();
        compile_source(source, "test.py", mode, CompileFlags::default(), false, &mut interns)
            .expect_err("compilation unexpectedly succeeded")
    }

    /// Splits linear bytecode back into (opcode, argument) pairs so the
    /// expected sequences stay readable.
    fn disasm(code: &Code) -> Vec<(Opcode, Option<u32>)> {
        let mut out = Vec::new();
        let mut i = 0;
        let mut ext = 0u32;
        while i < code.code.len() {
            let op = Opcode::from_repr(code.code[i]).expect("unknown opcode in bytecode");
            i += 1;
            if op.has_arg() {
                let arg = u32::from(code.code[i]) | (u32::from(code.code[i + 1]) << 8);
                i += 2;
                if op == Opcode::ExtendedArg {
                    ext = arg;
                    continue;
                }
                out.push((op, Some(arg | (ext << 16))));
                ext = 0;
            } else {
                out.push((op, None));
            }
        }
        out
    }

    fn names<'i>(code: &Code, interns: &'i Interns) -> Vec<&'i str> {
        code.names.iter().map(|id| interns.get_str(*id)).collect()
    }

    #[test]
    fn binary_add_expression() {
        let (code, _) = compile("1 + 2", CompileMode::Eval);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadConst, Some(0)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::BinaryAdd, None),
                (Opcode::ReturnValue, None),
            ]
        );
        assert_eq!(code.consts, vec![Const::Int(1), Const::Int(2)]);
        assert_eq!(code.stacksize, 2);
    }

    #[test]
    fn constant_pool_dedups_by_variant_and_value() {
        let (code, _) = compile("1 + 1", CompileMode::Eval);
        assert_eq!(code.consts, vec![Const::Int(1)]);
        assert_eq!(
            disasm(&code)[..2],
            [(Opcode::LoadConst, Some(0)), (Opcode::LoadConst, Some(0))]
        );

        // Same numeric value, three runtime types, three slots.
        let (code, _) = compile("(1, 1.0, True)", CompileMode::Eval);
        assert_eq!(
            code.consts,
            vec![Const::Int(1), Const::Float(1.0), Const::Bool(true)]
        );
    }

    #[test]
    fn assert_with_message_lowering() {
        let (code, interns) = compile("assert x, 'bad'", CompileMode::Exec);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadName, Some(0)),
                (Opcode::PopJumpIfTrue, Some(18)),
                (Opcode::LoadGlobal, Some(1)),
                (Opcode::LoadConst, Some(0)),
                (Opcode::CallFunction, Some(1)),
                (Opcode::RaiseVarargs, Some(1)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::ReturnValue, None),
            ]
        );
        assert_eq!(names(&code, &interns), vec!["x", "AssertionError"]);
        assert!(matches!(code.consts[0], Const::Str(id) if interns.get_str(id) == "bad"));
        assert_eq!(code.consts[1], Const::None);
    }

    #[test]
    fn boolean_ops_short_circuit() {
        let (code, _) = compile("a and b", CompileMode::Eval);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadName, Some(0)),
                (Opcode::JumpIfFalseOrPop, Some(9)),
                (Opcode::LoadName, Some(1)),
                (Opcode::ReturnValue, None),
            ]
        );

        let (code, _) = compile("a or b", CompileMode::Eval);
        assert_eq!(disasm(&code)[1], (Opcode::JumpIfTrueOrPop, Some(9)));
    }

    #[test]
    fn chained_comparison_reuses_the_middle_operand() {
        let (code, _) = compile("1 < 2 < 3", CompileMode::Eval);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadConst, Some(0)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::DupTop, None),
                (Opcode::RotThree, None),
                (Opcode::CompareOp, Some(CmpArg::Lt as u32)),
                (Opcode::JumpIfFalseOrPop, Some(23)),
                (Opcode::LoadConst, Some(2)),
                (Opcode::CompareOp, Some(CmpArg::Lt as u32)),
                (Opcode::JumpForward, Some(2)),
                (Opcode::RotTwo, None),
                (Opcode::PopTop, None),
                (Opcode::ReturnValue, None),
            ]
        );
        assert_eq!(code.stacksize, 3);
    }

    #[test]
    fn conditional_expression_diamond() {
        let (code, interns) = compile("a if c else b", CompileMode::Eval);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadName, Some(0)),
                (Opcode::PopJumpIfFalse, Some(12)),
                (Opcode::LoadName, Some(1)),
                (Opcode::JumpForward, Some(3)),
                (Opcode::LoadName, Some(2)),
                (Opcode::ReturnValue, None),
            ]
        );
        assert_eq!(names(&code, &interns), vec!["c", "a", "b"]);
    }

    #[test]
    fn augmented_assignment_uses_inplace_opcode() {
        let (code, _) = compile("x += 1", CompileMode::Exec);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadName, Some(0)),
                (Opcode::LoadConst, Some(0)),
                (Opcode::InplaceAdd, None),
                (Opcode::StoreName, Some(0)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::ReturnValue, None),
            ]
        );
    }

    #[test]
    fn chained_assignment_duplicates_the_value() {
        let (code, interns) = compile("a = b = 1", CompileMode::Exec);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadConst, Some(0)),
                (Opcode::DupTop, None),
                (Opcode::StoreName, Some(0)),
                (Opcode::StoreName, Some(1)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::ReturnValue, None),
            ]
        );
        assert_eq!(names(&code, &interns), vec!["a", "b"]);
    }

    #[test]
    fn tuple_target_unpacks() {
        let (code, interns) = compile("a, b = t", CompileMode::Exec);
        assert_eq!(
            disasm(&code)[..4],
            [
                (Opcode::LoadName, Some(0)),
                (Opcode::UnpackSequence, Some(2)),
                (Opcode::StoreName, Some(1)),
                (Opcode::StoreName, Some(2)),
            ]
        );
        assert_eq!(names(&code, &interns), vec!["t", "a", "b"]);
    }

    #[test]
    fn dict_literal_pushes_value_then_key() {
        let (code, _) = compile("{1: 2}", CompileMode::Eval);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::BuildMap, Some(1)),
                (Opcode::LoadConst, Some(0)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::StoreMap, None),
                (Opcode::ReturnValue, None),
            ]
        );
        // The value lands in the pool before the key.
        assert_eq!(code.consts, vec![Const::Int(2), Const::Int(1)]);
    }

    #[test]
    fn call_packs_positional_and_keyword_counts() {
        let (code, interns) = compile("f(1, x=2)", CompileMode::Eval);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadName, Some(0)),
                (Opcode::LoadConst, Some(0)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::LoadConst, Some(2)),
                (Opcode::CallFunction, Some(1 | (1 << 8))),
                (Opcode::ReturnValue, None),
            ]
        );
        assert!(matches!(code.consts[1], Const::Str(id) if interns.get_str(id) == "x"));
    }

    #[test]
    fn lambda_compiles_to_a_nested_code_object() {
        let (code, interns) = compile("lambda x: x + 1", CompileMode::Eval);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadConst, Some(0)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::MakeFunction, Some(0)),
                (Opcode::ReturnValue, None),
            ]
        );
        let Const::Code(inner) = &code.consts[0] else {
            panic!("expected a code constant, got {:?}", code.consts[0]);
        };
        assert_eq!(inner.argcount, 1);
        assert_eq!(inner.nlocals, 1);
        assert!(inner.has_flag(CO_OPTIMIZED));
        assert!(inner.has_flag(CO_NEWLOCALS));
        assert!(inner.has_flag(CO_NOFREE));
        // The docstring slot is pinned to None.
        assert_eq!(inner.consts[0], Const::None);
        assert_eq!(
            disasm(inner),
            vec![
                (Opcode::LoadFast, Some(0)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::BinaryAdd, None),
                (Opcode::ReturnValue, None),
            ]
        );
        assert_eq!(interns.get_str(inner.name), "<lambda>");
    }

    #[test]
    fn captured_parameter_becomes_a_cell() {
        let (code, interns) = compile("lambda x: lambda: x", CompileMode::Eval);
        let Const::Code(outer) = &code.consts[0] else {
            panic!("expected a code constant");
        };
        let cellvars: Vec<&str> = outer.cellvars.iter().map(|id| interns.get_str(*id)).collect();
        assert_eq!(cellvars, vec!["x"]);
        assert_eq!(outer.cell2arg, vec![0]);
        assert_eq!(
            disasm(outer),
            vec![
                (Opcode::LoadClosure, Some(0)),
                (Opcode::BuildTuple, Some(1)),
                (Opcode::LoadConst, Some(1)),
                (Opcode::LoadConst, Some(2)),
                (Opcode::MakeClosure, Some(0)),
                (Opcode::ReturnValue, None),
            ]
        );
        let Const::Code(inner) = &outer.consts[1] else {
            panic!("expected the nested body as a code constant");
        };
        let freevars: Vec<&str> = inner.freevars.iter().map(|id| interns.get_str(*id)).collect();
        assert_eq!(freevars, vec!["x"]);
        assert!(!inner.has_flag(CO_NOFREE));
        assert_eq!(
            disasm(inner),
            vec![(Opcode::LoadDeref, Some(0)), (Opcode::ReturnValue, None)]
        );
        assert_eq!(interns.get_str(inner.name), "<lambda>.<locals>.<lambda>");
    }

    #[test]
    fn module_falls_through_to_a_none_return() {
        let (code, _) = compile("x = 1", CompileMode::Exec);
        let ops = disasm(&code);
        assert_eq!(
            ops[ops.len() - 2..],
            [(Opcode::LoadConst, Some(1)), (Opcode::ReturnValue, None)]
        );
        assert_eq!(code.consts[1], Const::None);
    }

    #[test]
    fn interactive_expressions_print() {
        let (code, _) = compile("1 + 1", CompileMode::Single);
        assert_eq!(
            disasm(&code),
            vec![
                (Opcode::LoadConst, Some(0)),
                (Opcode::LoadConst, Some(0)),
                (Opcode::BinaryAdd, None),
                (Opcode::PrintExpr, None),
                (Opcode::LoadConst, Some(1)),
                (Opcode::ReturnValue, None),
            ]
        );
    }

    #[test]
    fn module_docstring_binds_dunder_doc() {
        let (code, interns) = compile("'doc'\nx = 1", CompileMode::Exec);
        assert_eq!(
            disasm(&code)[..2],
            [(Opcode::LoadConst, Some(0)), (Opcode::StoreName, Some(0))]
        );
        assert_eq!(names(&code, &interns)[0], "__doc__");
    }

    #[test]
    fn unsupported_constructs_fail_explicitly() {
        match compile_err("while x:\n    pass", CompileMode::Exec) {
            CompileError::NotImplemented { construct, line } => {
                assert_eq!(construct, "while loop");
                assert_eq!(line, 1);
            }
            other => panic!("expected NotImplemented, got {other:?}"),
        }
        match compile_err("[y for y in x]", CompileMode::Eval) {
            CompileError::NotImplemented { construct, .. } => {
                assert_eq!(construct, "list comprehension");
            }
            other => panic!("expected NotImplemented, got {other:?}"),
        }
        match compile_err("import os", CompileMode::Exec) {
            CompileError::NotImplemented { construct, .. } => assert_eq!(construct, "import statement"),
            other => panic!("expected NotImplemented, got {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        match compile_err("x = (", CompileMode::Exec) {
            CompileError::Syntax { line, .. } => assert_eq!(line, 1),
            other => panic!("expected Syntax, got {other:?}"),
        }
    }
}
