//! The block stack and structured unwinding.
//!
//! Entering a loop or try region pushes a [`TryBlock`] recording the kind,
//! the handler target, and the operand-stack level to restore. When the
//! `why` register leaves `Not`, blocks are popped until one applies: loop
//! blocks absorb break/continue, handler blocks receive the six
//! exception-state slots and transfer control, finally blocks additionally
//! encode the unwind reason onto the operand stack for `END_FINALLY` to
//! re-dispatch.

use crate::{
    exception::{ExcType, RunError, RunResult, SimpleException},
    heap::HeapData,
    io::PrintWriter,
    value::Value,
};

use super::{BlockKind, ExcState, TryBlock, Vm, Why};

impl<P: PrintWriter> Vm<'_, P> {
    /// `SETUP_LOOP` / `SETUP_EXCEPT` / `SETUP_FINALLY`: the relative
    /// argument addresses the handler (or loop exit) from the instruction's
    /// end.
    pub(super) fn setup_block(&mut self, kind: BlockKind, delta: u32) -> RunResult<()> {
        let frame = self.frame();
        let handler = frame.ip + delta as usize;
        let level = frame.stack.len();
        frame.blocks.push(TryBlock { kind, handler, level });
        Ok(())
    }

    pub(super) fn pop_block(&mut self) -> RunResult<()> {
        self.frame()
            .blocks
            .pop()
            .map(|_| ())
            .ok_or_else(|| RunError::internal("POP_BLOCK with empty block stack"))
    }

    /// `POP_EXCEPT`: leaves an except handler, restoring the previous
    /// exception state saved on its entry.
    pub(super) fn pop_except(&mut self) -> RunResult<()> {
        let block = self
            .frame()
            .blocks
            .pop()
            .ok_or_else(|| RunError::internal("POP_EXCEPT with empty block stack"))?;
        if block.kind != BlockKind::ExceptHandler {
            return Err(SimpleException::new_msg(ExcType::SystemError, "popped block is not an except handler").into());
        }
        self.unwind_except_handler(&block)
    }

    /// `END_FINALLY`: re-dispatches whatever the finally block interrupted,
    /// encoded on the operand stack - nothing, a pending unwind reason, or
    /// a propagating exception.
    pub(super) fn end_finally(&mut self) -> RunResult<()> {
        let top = self.pop()?;
        match top {
            Value::None => Ok(()),
            Value::Int(code) => {
                let why = u8::try_from(code)
                    .ok()
                    .and_then(Why::from_repr)
                    .ok_or_else(|| RunError::internal("END_FINALLY popped a bad unwind code"))?;
                match why {
                    Why::Return | Why::Continue => {
                        self.retval = self.pop()?;
                    }
                    Why::Break => {}
                    Why::Not | Why::Exception => {
                        return Err(RunError::internal("END_FINALLY popped an impossible unwind code"));
                    }
                }
                self.why = why;
                Ok(())
            }
            Value::Class(kind) => {
                let value = self.pop()?;
                let _traceback = self.pop()?;
                self.curexc = Some(ExcState { kind, value });
                self.why = Why::Exception;
                Ok(())
            }
            _ => Err(SimpleException::new_msg(ExcType::SystemError, "'finally' pops bad exception").into()),
        }
    }

    /// `RAISE_VARARGS`: raise with 0 (bare re-raise), 1 (exception), or 2
    /// (exception from cause) operands.
    pub(super) fn raise_varargs(&mut self, argc: u32) -> RunResult<()> {
        match argc {
            0 => match self.prevexc {
                Some(state) => {
                    self.curexc = Some(state);
                    self.why = Why::Exception;
                    Ok(())
                }
                None => {
                    Err(SimpleException::new_msg(ExcType::RuntimeError, "No active exception to reraise").into())
                }
            },
            1 => {
                let exc = self.pop()?;
                let state = self.make_exc_state(exc)?;
                self.curexc = Some(state);
                self.why = Why::Exception;
                Ok(())
            }
            2 => {
                let cause = self.pop()?;
                let exc = self.pop()?;
                let cause_state = self.make_exc_state(cause)?;
                let state = self.make_exc_state(exc)?;
                if let Value::Ref(id) = state.value
                    && let HeapData::Exception(inst) = self.heap.get_mut(id)
                {
                    inst.cause = Some(cause_state.value);
                }
                self.curexc = Some(state);
                self.why = Why::Exception;
                Ok(())
            }
            _ => Err(RunError::internal("bad RAISE_VARARGS argument")),
        }
    }

    /// Normalizes a raised value: a class is instantiated with no
    /// arguments, an instance is used as-is, anything else is a TypeError.
    pub(super) fn make_exc_state(&mut self, exc: Value) -> RunResult<ExcState> {
        match exc {
            Value::Class(kind) => {
                let value = Value::Ref(self.heap.allocate(HeapData::Exception(crate::heap::ExcInstance {
                    exc_type: kind,
                    args: Vec::new(),
                    cause: None,
                })));
                Ok(ExcState { kind, value })
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Exception(inst) => Ok(ExcState {
                    kind: inst.exc_type,
                    value: exc,
                }),
                _ => Err(ExcType::type_error("exceptions must derive from BaseException").into()),
            },
            _ => Err(ExcType::type_error("exceptions must derive from BaseException").into()),
        }
    }

    /// Truncates the operand stack to a block's recorded level.
    fn unwind_block(&mut self, block: &TryBlock) {
        let frame = self.frame();
        if frame.stack.len() > block.level {
            frame.stack.truncate(block.level);
        }
    }

    /// Leaves an except-handler block: truncates the stack to just the
    /// three saved slots and restores them as the previous exception state.
    pub(super) fn unwind_except_handler(&mut self, block: &TryBlock) -> RunResult<()> {
        let frame = self.frame();
        if frame.stack.len() < block.level + 3 {
            return Err(RunError::internal("exception handler state missing from the stack"));
        }
        frame.stack.truncate(block.level + 3);
        let exc_type = self.pop()?;
        let value = self.pop()?;
        let _traceback = self.pop()?;
        self.prevexc = match exc_type {
            Value::Class(kind) => Some(ExcState { kind, value }),
            _ => None,
        };
        Ok(())
    }

    /// Pops blocks in the active frame until one absorbs the pending
    /// unwind, transferring control to its handler. Leaves `why` untouched
    /// when no block applies (the caller then pops the frame).
    pub(super) fn unwind_frame_blocks(&mut self) -> RunResult<()> {
        while self.why != Why::Not && !self.frame_ref().blocks.is_empty() {
            let block = *self
                .frame_ref()
                .blocks
                .last()
                .expect("block stack emptied during unwind");

            // `continue` transfers straight to the loop start without
            // popping the loop block.
            if block.kind == BlockKind::Loop && self.why == Why::Continue {
                self.why = Why::Not;
                let Value::Int(target) = self.retval else {
                    return Err(RunError::internal("continue unwind without a target"));
                };
                self.retval = Value::None;
                self.frame().ip = usize::try_from(target)
                    .map_err(|_| RunError::internal("continue target out of range"))?;
                break;
            }

            self.frame().blocks.pop();

            if block.kind == BlockKind::ExceptHandler {
                self.unwind_except_handler(&block)?;
                continue;
            }
            self.unwind_block(&block);

            if block.kind == BlockKind::Loop && self.why == Why::Break {
                self.why = Why::Not;
                self.frame().ip = block.handler;
                break;
            }

            if self.why == Why::Exception && matches!(block.kind, BlockKind::Except | BlockKind::Finally) {
                self.enter_exception_handler(&block);
                break;
            }

            if block.kind == BlockKind::Finally {
                if matches!(self.why, Why::Return | Why::Continue) {
                    let carried = self.retval;
                    self.push(carried);
                }
                let code = self.why as u8;
                self.push(Value::Int(i64::from(code)));
                self.why = Why::Not;
                self.frame().ip = block.handler;
                break;
            }
        }
        Ok(())
    }

    /// Transfers control to an except/finally handler with the six
    /// exception-state slots pushed: the saved previous state below the
    /// propagating exception, each as (traceback, value, type).
    fn enter_exception_handler(&mut self, block: &TryBlock) {
        let level = self.frame_ref().stack.len();
        self.frame().blocks.push(TryBlock {
            kind: BlockKind::ExceptHandler,
            handler: usize::MAX,
            level,
        });

        match self.prevexc {
            Some(prev) => {
                self.push(Value::None);
                self.push(prev.value);
                self.push(Value::Class(prev.kind));
            }
            None => {
                self.push(Value::None);
                self.push(Value::None);
                self.push(Value::None);
            }
        }

        let current = self.curexc.take().expect("exception handler entered without exception");
        self.prevexc = Some(current);
        self.push(Value::None);
        self.push(current.value);
        self.push(Value::Class(current.kind));

        self.why = Why::Not;
        self.clear_trace();
        self.frame().ip = block.handler;
    }
}
