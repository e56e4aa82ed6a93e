//! The bytecode virtual machine.
//!
//! A state machine over (opcode, operand stack, frame stack, block stack).
//! The dispatch loop fetches one opcode from the active frame, decodes its
//! little-endian 16-bit argument (merging a pending `EXTENDED_ARG` high
//! word), and executes the handler. Calls into user functions push a new
//! [`Frame`] onto the VM's own frame array and let the loop continue there -
//! the loop is never re-entered recursively, which is what keeps every
//! suspended computation resumable from its frame alone.
//!
//! Guest-level failures travel as values: handlers return [`RunError`], the
//! `why` register drives block-stack unwinding within a frame, and frames
//! are popped (running pending `finally` blocks) until a handler matches or
//! the outermost frame is gone.

mod binary;
mod call;
mod collections;
mod compare;
mod exceptions;
mod frame;

use std::borrow::Cow;

pub(crate) use frame::{BlockKind, Frame, TryBlock};

use crate::{
    exception::{ExcType, RunError, RunResult, SimpleException, TraceFrame},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StaticStrings, StringId},
    io::PrintWriter,
    namespace::{NamespaceId, Namespaces},
    protocol::{BinaryOp, UnaryOp},
    value::{self, RtCtx, Value},
};

use super::op::Opcode;

/// Why the dispatch loop is unwinding, mirroring the block-stack protocol:
/// `END_FINALLY` reads these values back off the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub(crate) enum Why {
    Not = 0,
    Exception = 1,
    Return = 2,
    Break = 3,
    Continue = 4,
}

/// The exception state slots: the raised class and its instance value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExcState {
    pub kind: ExcType,
    pub value: Value,
}

/// How a VM run ends when it does not produce a value.
#[derive(Debug)]
pub(crate) enum VmError {
    /// A defect in the interpreter (bad bytecode, an opcode without a
    /// handler). Never catchable by guest code.
    Internal(Cow<'static, str>),
    /// A guest exception escaped the outermost frame.
    Uncaught {
        exc: SimpleException,
        /// Frames unwound while propagating, outermost first.
        frames: Vec<TraceFrame>,
    },
}

/// Result of one unwinding step.
enum Unwound {
    /// A handler in the current frame took over; execution continues.
    Handled,
    /// The current frame was popped; unwinding continues in the caller.
    FramePopped,
    /// The outermost frame returned a value.
    Finished(Value),
    /// An exception escaped the outermost frame.
    Uncaught,
}

/// The virtual machine: an explicit array of frames plus the decode and
/// exception-state registers. Borrowed state (heap, interns, namespaces,
/// print writer) belongs to the interpreter that drives it.
pub(crate) struct Vm<'i, P: PrintWriter> {
    pub(super) heap: &'i mut Heap,
    pub(super) interns: &'i mut Interns,
    pub(super) namespaces: &'i mut Namespaces,
    pub(super) print: &'i mut P,
    pub(super) builtins_ns: NamespaceId,
    /// The interpreter's own call stack; the active frame is the last
    /// entry.
    frames: Vec<Frame>,
    /// Pending `EXTENDED_ARG` high word.
    ext: u32,
    extended: bool,
    why: Why,
    /// Return value (or continue target) being carried by the unwind.
    retval: Value,
    /// The exception currently propagating.
    curexc: Option<ExcState>,
    /// The exception state saved on handler entry, for bare re-raise.
    prevexc: Option<ExcState>,
    /// Frames unwound so far by the propagating exception, innermost
    /// first.
    trace: Vec<TraceFrame>,
}

impl<'i, P: PrintWriter> Vm<'i, P> {
    pub(crate) fn new(
        heap: &'i mut Heap,
        interns: &'i mut Interns,
        namespaces: &'i mut Namespaces,
        print: &'i mut P,
        builtins_ns: NamespaceId,
    ) -> Self {
        Self {
            heap,
            interns,
            namespaces,
            print,
            builtins_ns,
            frames: Vec::new(),
            ext: 0,
            extended: false,
            why: Why::Not,
            retval: Value::None,
            curexc: None,
            prevexc: None,
            trace: Vec::new(),
        }
    }

    /// Runs a frame to completion.
    pub(crate) fn run(&mut self, frame: Frame) -> Result<Value, VmError> {
        self.frames.push(frame);
        loop {
            let step = self.fetch().and_then(|(op, arg)| self.exec(op, arg));
            if let Err(err) = step {
                match err {
                    RunError::Internal(msg) => return Err(VmError::Internal(msg)),
                    RunError::Exc(exc) => self.set_exception(*exc),
                }
            }
            while self.why != Why::Not {
                match self.unwind_step() {
                    Ok(Unwound::Handled | Unwound::FramePopped) => {}
                    Ok(Unwound::Finished(value)) => return Ok(value),
                    Ok(Unwound::Uncaught) => {
                        let state = self.curexc.take().expect("uncaught unwind without exception state");
                        let exc = self.exc_state_to_simple(&state);
                        let mut frames = std::mem::take(&mut self.trace);
                        frames.reverse();
                        return Err(VmError::Uncaught { exc, frames });
                    }
                    Err(RunError::Internal(msg)) => return Err(VmError::Internal(msg)),
                    Err(RunError::Exc(exc)) => {
                        // An error raised while unwinding (e.g. a bad block
                        // state) replaces the propagating exception.
                        self.set_exception(*exc);
                    }
                }
            }
        }
    }

    // -- decode -------------------------------------------------------------

    /// Fetches the opcode at the active frame's instruction pointer and
    /// decodes its argument.
    fn fetch(&mut self) -> RunResult<(Opcode, u32)> {
        let extended = std::mem::take(&mut self.extended);
        let ext = std::mem::take(&mut self.ext);
        let frame = self.frame();
        if frame.ip >= frame.code.code.len() {
            return Err(RunError::internal("instruction pointer ran off the end of the bytecode"));
        }
        frame.lasti = frame.ip;
        let byte = frame.code.code[frame.ip];
        frame.ip += 1;
        let op = Opcode::from_repr(byte).ok_or_else(|| RunError::Internal(format!("unknown opcode {byte}").into()))?;
        let mut arg = 0u32;
        if op.has_arg() {
            if frame.ip + 2 > frame.code.code.len() {
                return Err(RunError::internal("truncated instruction argument"));
            }
            let lo = u32::from(frame.code.code[frame.ip]);
            let hi = u32::from(frame.code.code[frame.ip + 1]);
            frame.ip += 2;
            arg = lo | (hi << 8);
            if extended {
                arg |= ext << 16;
            }
        }
        Ok((op, arg))
    }

    /// Executes one opcode.
    fn exec(&mut self, op: Opcode, arg: u32) -> RunResult<()> {
        match op {
            Opcode::Nop => Ok(()),
            Opcode::PopTop => {
                self.pop()?;
                Ok(())
            }
            Opcode::RotTwo => {
                let top = self.pop()?;
                let second = self.pop()?;
                self.push(top);
                self.push(second);
                Ok(())
            }
            Opcode::RotThree => {
                let top = self.pop()?;
                let second = self.pop()?;
                let third = self.pop()?;
                self.push(top);
                self.push(third);
                self.push(second);
                Ok(())
            }
            Opcode::DupTop => {
                let top = self.top()?;
                self.push(top);
                Ok(())
            }
            Opcode::DupTopTwo => {
                let top = self.top()?;
                let second = self.peek(2)?;
                self.push(second);
                self.push(top);
                Ok(())
            }

            Opcode::UnaryPositive => self.unary(UnaryOp::Pos),
            Opcode::UnaryNegative => self.unary(UnaryOp::Neg),
            Opcode::UnaryInvert => self.unary(UnaryOp::Invert),
            Opcode::UnaryNot => {
                let v = self.pop()?;
                let truth = v.py_truth(self.heap);
                self.push(Value::Bool(!truth));
                Ok(())
            }

            Opcode::BinaryPower => self.binary(BinaryOp::Pow),
            Opcode::BinaryMultiply => self.binary(BinaryOp::Mul),
            Opcode::BinaryModulo => self.binary(BinaryOp::Mod),
            Opcode::BinaryAdd => self.binary(BinaryOp::Add),
            Opcode::BinarySubtract => self.binary(BinaryOp::Sub),
            Opcode::BinaryFloorDivide => self.binary(BinaryOp::FloorDiv),
            Opcode::BinaryTrueDivide => self.binary(BinaryOp::TrueDiv),
            Opcode::BinaryLshift => self.binary(BinaryOp::LShift),
            Opcode::BinaryRshift => self.binary(BinaryOp::RShift),
            Opcode::BinaryAnd => self.binary(BinaryOp::BitAnd),
            Opcode::BinaryXor => self.binary(BinaryOp::BitXor),
            Opcode::BinaryOr => self.binary(BinaryOp::BitOr),

            Opcode::InplacePower => self.inplace(BinaryOp::Pow),
            Opcode::InplaceMultiply => self.inplace(BinaryOp::Mul),
            Opcode::InplaceModulo => self.inplace(BinaryOp::Mod),
            Opcode::InplaceAdd => self.inplace(BinaryOp::Add),
            Opcode::InplaceSubtract => self.inplace(BinaryOp::Sub),
            Opcode::InplaceFloorDivide => self.inplace(BinaryOp::FloorDiv),
            Opcode::InplaceTrueDivide => self.inplace(BinaryOp::TrueDiv),
            Opcode::InplaceLshift => self.inplace(BinaryOp::LShift),
            Opcode::InplaceRshift => self.inplace(BinaryOp::RShift),
            Opcode::InplaceAnd => self.inplace(BinaryOp::BitAnd),
            Opcode::InplaceXor => self.inplace(BinaryOp::BitXor),
            Opcode::InplaceOr => self.inplace(BinaryOp::BitOr),

            Opcode::BinarySubscr => self.binary_subscr(),
            Opcode::StoreSubscr => self.store_subscr(),
            Opcode::DeleteSubscr => self.delete_subscr(),
            Opcode::StoreMap => self.store_map(),
            Opcode::BuildTuple => self.build_tuple(arg),
            Opcode::BuildList => self.build_list(arg),
            Opcode::BuildSet => self.build_set(arg),
            Opcode::BuildMap => self.build_map(arg),
            Opcode::BuildSlice => self.build_slice(arg),
            Opcode::UnpackSequence => self.unpack_sequence(arg),

            Opcode::PrintExpr => self.print_expr(),

            Opcode::ReturnValue => {
                self.retval = self.pop()?;
                self.why = Why::Return;
                Ok(())
            }
            Opcode::BreakLoop => {
                self.why = Why::Break;
                Ok(())
            }
            Opcode::ContinueLoop => {
                self.retval = Value::Int(i64::from(arg));
                self.why = Why::Continue;
                Ok(())
            }

            Opcode::PopBlock => self.pop_block(),
            Opcode::PopExcept => self.pop_except(),
            Opcode::EndFinally => self.end_finally(),
            Opcode::SetupLoop => self.setup_block(BlockKind::Loop, arg),
            Opcode::SetupExcept => self.setup_block(BlockKind::Except, arg),
            Opcode::SetupFinally => self.setup_block(BlockKind::Finally, arg),
            Opcode::RaiseVarargs => self.raise_varargs(arg),

            Opcode::StoreName => self.store_name(arg),
            Opcode::DeleteName => self.delete_name(arg),
            Opcode::LoadName => self.load_name(arg),
            Opcode::StoreGlobal => self.store_global(arg),
            Opcode::DeleteGlobal => self.delete_global(arg),
            Opcode::LoadGlobal => self.load_global(arg),
            Opcode::LoadFast => self.load_fast(arg),
            Opcode::StoreFast => self.store_fast(arg),
            Opcode::DeleteFast => self.delete_fast(arg),
            Opcode::LoadConst => self.load_const(arg),
            Opcode::LoadAttr => self.load_attr(arg),
            Opcode::StoreAttr => self.store_attr(arg),
            Opcode::DeleteAttr => self.delete_attr(arg),

            Opcode::CompareOp => self.compare(arg),

            Opcode::JumpForward => {
                self.frame().ip += arg as usize;
                Ok(())
            }
            Opcode::JumpAbsolute => {
                self.frame().ip = arg as usize;
                Ok(())
            }
            Opcode::PopJumpIfTrue => {
                let v = self.pop()?;
                if v.py_truth(self.heap) {
                    self.frame().ip = arg as usize;
                }
                Ok(())
            }
            Opcode::PopJumpIfFalse => {
                let v = self.pop()?;
                if !v.py_truth(self.heap) {
                    self.frame().ip = arg as usize;
                }
                Ok(())
            }
            Opcode::JumpIfTrueOrPop => {
                let v = self.top()?;
                if v.py_truth(self.heap) {
                    self.frame().ip = arg as usize;
                } else {
                    self.pop()?;
                }
                Ok(())
            }
            Opcode::JumpIfFalseOrPop => {
                let v = self.top()?;
                if v.py_truth(self.heap) {
                    self.pop()?;
                } else {
                    self.frame().ip = arg as usize;
                }
                Ok(())
            }

            Opcode::CallFunction => self.call_function(arg, false, false),
            Opcode::CallFunctionVar => self.call_function(arg, true, false),
            Opcode::CallFunctionKw => self.call_function(arg, false, true),
            Opcode::CallFunctionVarKw => self.call_function(arg, true, true),
            Opcode::MakeFunction => self.make_function(arg, false),
            Opcode::MakeClosure => self.make_function(arg, true),
            Opcode::LoadClosure => self.load_closure(arg),
            Opcode::LoadDeref => self.load_deref(arg),
            Opcode::StoreDeref => self.store_deref(arg),
            Opcode::DeleteDeref => self.delete_deref(arg),

            Opcode::ExtendedArg => {
                self.ext = arg;
                self.extended = true;
                Ok(())
            }

            // Recognized numerically but not yet given a handler. This is a
            // development-time signal, not a recoverable runtime condition.
            Opcode::GetIter | Opcode::ForIter | Opcode::YieldValue | Opcode::YieldFrom => {
                Err(RunError::Internal(format!("opcode {op:?} is not implemented").into()))
            }
        }
    }

    // -- stack and frame primitives -----------------------------------------

    pub(super) fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack empty")
    }

    pub(super) fn frame_ref(&self) -> &Frame {
        self.frames.last().expect("frame stack empty")
    }

    pub(super) fn push(&mut self, value: Value) {
        self.frame().stack.push(value);
    }

    pub(super) fn pop(&mut self) -> RunResult<Value> {
        self.frame()
            .stack
            .pop()
            .ok_or_else(|| RunError::internal("operand stack underflow"))
    }

    pub(super) fn top(&self) -> RunResult<Value> {
        self.peek(1)
    }

    pub(super) fn peek(&self, n: usize) -> RunResult<Value> {
        let stack = &self.frame_ref().stack;
        stack
            .len()
            .checked_sub(n)
            .and_then(|i| stack.get(i).copied())
            .ok_or_else(|| RunError::internal("operand stack underflow"))
    }

    /// Pops the top `n` values, preserving their stack order.
    pub(super) fn pop_n(&mut self, n: usize) -> RunResult<Vec<Value>> {
        let stack = &mut self.frame().stack;
        let at = stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| RunError::internal("operand stack underflow"))?;
        Ok(stack.split_off(at))
    }

    pub(super) fn ctx(&mut self) -> RtCtx<'_> {
        RtCtx {
            heap: &mut *self.heap,
            interns: &mut *self.interns,
        }
    }

    pub(super) fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    // -- constants and names ------------------------------------------------

    fn load_const(&mut self, idx: u32) -> RunResult<()> {
        let constant = self
            .frame_ref()
            .code
            .consts
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| RunError::internal("constant index out of range"))?;
        let value = match constant {
            super::code::Const::None => Value::None,
            super::code::Const::Bool(b) => Value::Bool(b),
            super::code::Const::Int(i) => Value::Int(i),
            super::code::Const::Float(f) => Value::Float(f),
            super::code::Const::Str(id) => Value::Str(id),
            super::code::Const::BigInt(big) => Value::Ref(self.heap.allocate(HeapData::LongInt(big))),
            super::code::Const::Code(code) => Value::Ref(self.heap.allocate(HeapData::Code(code))),
        };
        self.push(value);
        Ok(())
    }

    fn code_name(&self, idx: u32) -> RunResult<StringId> {
        self.frame_ref()
            .code
            .names
            .get(idx as usize)
            .copied()
            .ok_or_else(|| RunError::internal("name index out of range"))
    }

    /// Looks a name up in locals, then globals, then builtins.
    fn lookup_name(&self, name: StringId) -> Option<Value> {
        let frame = self.frame_ref();
        self.namespaces
            .get(frame.locals, name)
            .or_else(|| self.namespaces.get(frame.globals, name))
            .or_else(|| self.namespaces.get(self.builtins_ns, name))
    }

    fn load_name(&mut self, idx: u32) -> RunResult<()> {
        let name = self.code_name(idx)?;
        match self.lookup_name(name) {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => Err(ExcType::name_error(self.interns.get_str(name)).into()),
        }
    }

    fn store_name(&mut self, idx: u32) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let value = self.pop()?;
        let locals = self.frame_ref().locals;
        self.namespaces.set(locals, name, value);
        Ok(())
    }

    fn delete_name(&mut self, idx: u32) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let locals = self.frame_ref().locals;
        if self.namespaces.remove(locals, name) {
            Ok(())
        } else {
            Err(ExcType::name_error(self.interns.get_str(name)).into())
        }
    }

    fn load_global(&mut self, idx: u32) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let globals = self.frame_ref().globals;
        let value = self
            .namespaces
            .get(globals, name)
            .or_else(|| self.namespaces.get(self.builtins_ns, name));
        match value {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => Err(ExcType::name_error(self.interns.get_str(name)).into()),
        }
    }

    fn store_global(&mut self, idx: u32) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let value = self.pop()?;
        let globals = self.frame_ref().globals;
        self.namespaces.set(globals, name, value);
        Ok(())
    }

    fn delete_global(&mut self, idx: u32) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let globals = self.frame_ref().globals;
        if self.namespaces.remove(globals, name) {
            Ok(())
        } else {
            Err(ExcType::name_error(self.interns.get_str(name)).into())
        }
    }

    fn fast_name(&self, slot: u32) -> RunResult<StringId> {
        self.frame_ref()
            .code
            .varnames
            .get(slot as usize)
            .copied()
            .ok_or_else(|| RunError::internal("fast-local slot out of range"))
    }

    fn load_fast(&mut self, slot: u32) -> RunResult<()> {
        match self.frame_ref().fast.get(slot as usize) {
            Some(Some(value)) => {
                let value = *value;
                self.push(value);
                Ok(())
            }
            Some(None) => {
                let name = self.fast_name(slot)?;
                Err(ExcType::name_error(self.interns.get_str(name)).into())
            }
            None => Err(RunError::internal("fast-local slot out of range")),
        }
    }

    fn store_fast(&mut self, slot: u32) -> RunResult<()> {
        let value = self.pop()?;
        let frame = self.frame();
        if slot as usize >= frame.fast.len() {
            return Err(RunError::internal("fast-local slot out of range"));
        }
        frame.fast[slot as usize] = Some(value);
        Ok(())
    }

    fn delete_fast(&mut self, slot: u32) -> RunResult<()> {
        let cleared = {
            let frame = self.frame();
            match frame.fast.get_mut(slot as usize) {
                Some(slot_ref @ Some(_)) => {
                    *slot_ref = None;
                    Some(true)
                }
                Some(None) => Some(false),
                None => None,
            }
        };
        match cleared {
            Some(true) => Ok(()),
            Some(false) => {
                let name = self.fast_name(slot)?;
                Err(ExcType::name_error(self.interns.get_str(name)).into())
            }
            None => Err(RunError::internal("fast-local slot out of range")),
        }
    }

    // -- attributes ---------------------------------------------------------

    fn load_attr(&mut self, idx: u32) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let obj = self.pop()?;
        let value = {
            let mut ctx = self.ctx();
            value::py_getattr(&obj, name, &mut ctx)?
        };
        self.push(value);
        Ok(())
    }

    fn store_attr(&mut self, idx: u32) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let obj = self.pop()?;
        let _value = self.pop()?;
        // No built-in type has writable attributes.
        Err(ExcType::attribute_error(obj.type_name(self.heap), self.interns.get_str(name)))
    }

    fn delete_attr(&mut self, idx: u32) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let obj = self.pop()?;
        Err(ExcType::attribute_error(obj.type_name(self.heap), self.interns.get_str(name)))
    }

    // -- cells and free variables -------------------------------------------

    fn cell_id(&self, slot: u32) -> RunResult<HeapId> {
        self.frame_ref()
            .cells
            .get(slot as usize)
            .copied()
            .ok_or_else(|| RunError::internal("cell slot out of range"))
    }

    /// Name of a cell-or-free slot and whether it is a free variable.
    fn deref_name(&self, slot: u32) -> RunResult<(StringId, bool)> {
        let code = &self.frame_ref().code;
        let slot = slot as usize;
        if slot < code.cellvars.len() {
            Ok((code.cellvars[slot], false))
        } else {
            code.freevars
                .get(slot - code.cellvars.len())
                .copied()
                .map(|name| (name, true))
                .ok_or_else(|| RunError::internal("deref slot out of range"))
        }
    }

    fn load_closure(&mut self, slot: u32) -> RunResult<()> {
        let id = self.cell_id(slot)?;
        self.push(Value::Ref(id));
        Ok(())
    }

    fn load_deref(&mut self, slot: u32) -> RunResult<()> {
        let id = self.cell_id(slot)?;
        match self.heap.get(id) {
            HeapData::Cell(Some(value)) => {
                let value = *value;
                self.push(value);
                Ok(())
            }
            HeapData::Cell(None) => {
                let (name, free) = self.deref_name(slot)?;
                let name = self.interns.get_str(name);
                if free {
                    Err(ExcType::unbound_free_error(name).into())
                } else {
                    Err(ExcType::unbound_local_error(name).into())
                }
            }
            _ => Err(RunError::internal("deref slot does not hold a cell")),
        }
    }

    fn store_deref(&mut self, slot: u32) -> RunResult<()> {
        let value = self.pop()?;
        let id = self.cell_id(slot)?;
        match self.heap.get_mut(id) {
            HeapData::Cell(slot_ref) => {
                *slot_ref = Some(value);
                Ok(())
            }
            _ => Err(RunError::internal("deref slot does not hold a cell")),
        }
    }

    fn delete_deref(&mut self, slot: u32) -> RunResult<()> {
        let id = self.cell_id(slot)?;
        let cleared = match self.heap.get_mut(id) {
            HeapData::Cell(slot_ref @ Some(_)) => {
                *slot_ref = None;
                Some(true)
            }
            HeapData::Cell(None) => Some(false),
            _ => None,
        };
        match cleared {
            Some(true) => Ok(()),
            Some(false) => {
                let (name, free) = self.deref_name(slot)?;
                let name = self.interns.get_str(name);
                if free {
                    Err(ExcType::unbound_free_error(name).into())
                } else {
                    Err(ExcType::unbound_local_error(name).into())
                }
            }
            None => Err(RunError::internal("deref slot does not hold a cell")),
        }
    }

    // -- interactive output -------------------------------------------------

    /// Prints the value of an interactive expression statement and binds it
    /// to `_`, skipping `None` values.
    fn print_expr(&mut self) -> RunResult<()> {
        let value = self.pop()?;
        let underscore: StringId = StaticStrings::Underscore.into();
        let globals = self.frame_ref().globals;
        self.namespaces.set(globals, underscore, Value::None);
        if !value.is_none() {
            let repr = value::py_repr(&value, self.heap, self.interns);
            self.print
                .stdout_write(Cow::Owned(repr))
                .and_then(|()| self.print.stdout_push('\n'))
                .map_err(|e| RunError::from(SimpleException::new_msg(e.exc_type, e.message)))?;
        }
        self.namespaces.set(globals, underscore, value);
        Ok(())
    }

    // -- exception plumbing -------------------------------------------------

    /// Materializes a native error into the exception-state slots and flags
    /// the unwind.
    fn set_exception(&mut self, exc: SimpleException) {
        let kind = exc.exc_type();
        let args = if exc.message().is_empty() {
            Vec::new()
        } else {
            vec![Value::Str(self.interns.intern(exc.message()))]
        };
        let value = Value::Ref(self.heap.allocate(HeapData::Exception(crate::heap::ExcInstance {
            exc_type: kind,
            args,
            cause: None,
        })));
        self.curexc = Some(ExcState { kind, value });
        self.why = Why::Exception;
    }

    /// Discards the trace accumulated by a propagating exception once a
    /// handler catches it.
    pub(super) fn clear_trace(&mut self) {
        self.trace.clear();
    }

    /// Converts the exception-state slots back into class + message form
    /// for surfacing to the host.
    fn exc_state_to_simple(&self, state: &ExcState) -> SimpleException {
        if let Value::Ref(id) = state.value
            && let HeapData::Exception(inst) = self.heap.get(id)
        {
            let message = value::exc_instance_str(inst, self.heap, self.interns);
            return SimpleException::new_msg(state.kind, message);
        }
        SimpleException::new(state.kind)
    }

    /// One step of unwinding: walk the active frame's block stack, and when
    /// no block applies, pop the frame.
    fn unwind_step(&mut self) -> RunResult<Unwound> {
        self.unwind_frame_blocks()?;
        if self.why == Why::Not {
            return Ok(Unwound::Handled);
        }

        let frame = self.frames.pop().expect("unwinding with no frames");
        self.trace.push(TraceFrame {
            name: self.interns.get_str(frame.code.name).to_owned(),
            filename: frame.code.filename.clone(),
            line: frame.code.addr_to_line(frame.lasti),
        });

        match self.why {
            Why::Return => {
                self.why = Why::Not;
                let value = self.retval;
                self.retval = Value::None;
                match self.frames.last_mut() {
                    Some(caller) => {
                        caller.stack.push(value);
                        Ok(Unwound::FramePopped)
                    }
                    None => Ok(Unwound::Finished(value)),
                }
            }
            Why::Exception => {
                if self.frames.is_empty() {
                    Ok(Unwound::Uncaught)
                } else {
                    Ok(Unwound::FramePopped)
                }
            }
            Why::Not => Ok(Unwound::FramePopped),
            Why::Break | Why::Continue => {
                Err(RunError::internal("loop unwind escaped its frame"))
            }
        }
    }
}
