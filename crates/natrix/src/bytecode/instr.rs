//! The instruction assembler.
//!
//! The compiler emits a symbolic stream of [`Instr`] values in which jump
//! targets are labels, not byte offsets. Assembly resolves the stream to
//! linear bytecode in two interleaved phases:
//!
//! 1. **Address fixpoint**: every pass recomputes each instruction's
//!    sequence number and byte offset from its current encoded size (1 byte
//!    for a bare opcode, 3 for an opcode with argument, 6 once the argument
//!    needs an `EXTENDED_ARG` prefix, 0 for a label). From the second pass
//!    on, jump arguments are re-resolved from their target label's offset.
//!    Assembly terminates when a pass changes no offset; failing to converge
//!    within [`MAX_PASSES`] passes is a fatal assembler error, indicating
//!    runaway argument growth from a compiler defect.
//! 2. **Stack-depth verification**: the finished stream is walked as a flow
//!    graph, tracking the operand stack depth along every reachable path and
//!    memoizing the best depth seen per block so backward edges (loops)
//!    terminate. Cycles are assumed to have no net effect on depth.
//!
//! Relative jumps must never target a position before their own end; a
//! backward "forward jump" is an invariant violation, not a guest error.

use super::op::Opcode;

/// Upper bound on address-resolution passes.
pub const MAX_PASSES: usize = 10;

/// Errors raised by the assembler. All of them indicate a defect in the
/// compiler that produced the stream, never a guest-program error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    /// Byte offsets were still changing after [`MAX_PASSES`] passes.
    NoConvergence,
    /// A relative jump's target lies before the jump itself.
    BackwardRelativeJump { instr: u32 },
    /// A label was inserted into the stream more than once.
    DuplicateLabel { label: u32 },
    /// A jump references a label that was never inserted.
    UndefinedLabel { label: u32 },
    /// The depth walk drove the operand stack below zero.
    StackUnderflow { instr: u32 },
    /// An opcode with no defined stack effect reached the depth walk.
    NoStackEffect { opcode: Opcode },
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoConvergence => write!(f, "bytecode addresses failed to converge after {MAX_PASSES} passes"),
            Self::BackwardRelativeJump { instr } => {
                write!(f, "relative jump at instruction {instr} targets an earlier position")
            }
            Self::DuplicateLabel { label } => write!(f, "label {label} inserted more than once"),
            Self::UndefinedLabel { label } => write!(f, "jump references undefined label {label}"),
            Self::StackUnderflow { instr } => {
                write!(f, "operand stack depth went negative at instruction {instr}")
            }
            Self::NoStackEffect { opcode } => write!(f, "no stack effect defined for {opcode:?}"),
        }
    }
}

impl std::error::Error for AssembleError {}

/// Handle to a jump target. Many jumps may share one label, but the label
/// must be inserted into the stream exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelId(u32);

/// Sequence number, rolling byte offset, and source line of one
/// instruction. Number and offset are recomputed on every assembly pass.
#[derive(Debug, Clone, Copy, Default)]
struct Pos {
    number: u32,
    offset: u32,
    lineno: u32,
}

/// One symbolic instruction.
#[derive(Debug, Clone)]
enum Instr {
    /// A plain opcode.
    Op { op: Opcode, pos: Pos },
    /// An opcode with argument.
    OpArg { op: Opcode, arg: u32, pos: Pos },
    /// A zero-width jump target marker.
    Label { label: LabelId, pos: Pos },
    /// An absolute jump; its argument is the target label's offset.
    JumpAbs { op: Opcode, arg: u32, dest: LabelId, pos: Pos },
    /// A relative jump; its argument is target minus its own end.
    JumpRel { op: Opcode, arg: u32, dest: LabelId, pos: Pos },
}

impl Instr {
    fn pos(&self) -> Pos {
        match self {
            Self::Op { pos, .. }
            | Self::OpArg { pos, .. }
            | Self::Label { pos, .. }
            | Self::JumpAbs { pos, .. }
            | Self::JumpRel { pos, .. } => *pos,
        }
    }

    /// Updates sequence number and offset, reporting whether the offset
    /// moved (the convergence criterion).
    fn set_pos(&mut self, number: u32, offset: u32) -> bool {
        let pos = match self {
            Self::Op { pos, .. }
            | Self::OpArg { pos, .. }
            | Self::Label { pos, .. }
            | Self::JumpAbs { pos, .. }
            | Self::JumpRel { pos, .. } => pos,
        };
        pos.number = number;
        let moved = pos.offset != offset;
        pos.offset = offset;
        moved
    }

    /// Encoded size in bytes at the instruction's current argument width.
    fn size(&self) -> u32 {
        match self {
            Self::Label { .. } => 0,
            Self::Op { .. } => 1,
            Self::OpArg { arg, .. } | Self::JumpAbs { arg, .. } | Self::JumpRel { arg, .. } => {
                if *arg <= 0xFFFF { 3 } else { 6 }
            }
        }
    }

    /// Appends the encoded bytes to `out`.
    fn output(&self, out: &mut Vec<u8>) {
        match self {
            Self::Label { .. } => {}
            Self::Op { op, .. } => out.push(*op as u8),
            Self::OpArg { op, arg, .. } | Self::JumpAbs { op, arg, .. } | Self::JumpRel { op, arg, .. } => {
                debug_assert!(op.has_arg(), "argument carried by argumentless opcode {op:?}");
                if *arg > 0xFFFF {
                    out.push(Opcode::ExtendedArg as u8);
                    out.push((*arg >> 16) as u8);
                    out.push((*arg >> 24) as u8);
                }
                out.push(*op as u8);
                out.push(*arg as u8);
                out.push((*arg >> 8) as u8);
            }
        }
    }

    fn stack_effect(&self) -> Result<i32, AssembleError> {
        match self {
            Self::Label { .. } => Ok(0),
            Self::Op { op, .. } => op.stack_effect(0).ok_or(AssembleError::NoStackEffect { opcode: *op }),
            Self::OpArg { op, arg, .. } | Self::JumpAbs { op, arg, .. } | Self::JumpRel { op, arg, .. } => {
                op.stack_effect(*arg).ok_or(AssembleError::NoStackEffect { opcode: *op })
            }
        }
    }
}

/// Per-label bookkeeping refreshed on every pass.
#[derive(Debug, Clone, Copy, Default)]
struct LabelState {
    offset: u32,
    instr_index: Option<usize>,
    defined: bool,
}

/// The bytecode and metadata produced by one successful assembly.
#[derive(Debug)]
pub struct Assembled {
    /// Linear bytecode.
    pub code: Vec<u8>,
    /// Verified maximum operand-stack depth over all reachable paths.
    pub stacksize: u32,
    /// Delta-encoded (byte-delta, line-delta) line-number table.
    pub lnotab: Vec<u8>,
}

/// A symbolic, label-addressed instruction stream under construction.
#[derive(Debug, Default)]
pub struct Instructions {
    instrs: Vec<Instr>,
    labels: Vec<LabelState>,
    duplicate_label: Option<u32>,
    lineno: u32,
}

impl Instructions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source line attached to subsequently pushed instructions.
    pub fn set_lineno(&mut self, lineno: u32) {
        self.lineno = lineno;
    }

    fn pos(&self) -> Pos {
        Pos {
            number: 0,
            offset: 0,
            lineno: self.lineno,
        }
    }

    /// Creates a fresh label, not yet inserted into the stream.
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(u32::try_from(self.labels.len()).expect("label count exceeds u32"));
        self.labels.push(LabelState::default());
        id
    }

    /// Inserts a label at the current position.
    pub fn push_label(&mut self, label: LabelId) {
        let state = &mut self.labels[label.0 as usize];
        if state.defined {
            self.duplicate_label.get_or_insert(label.0);
        }
        state.defined = true;
        self.instrs.push(Instr::Label { label, pos: self.pos() });
    }

    /// Pushes a plain opcode.
    pub fn push_op(&mut self, op: Opcode) {
        debug_assert!(!op.has_arg(), "push_op used for opcode with argument {op:?}");
        self.instrs.push(Instr::Op { op, pos: self.pos() });
    }

    /// Pushes an opcode with argument.
    pub fn push_op_arg(&mut self, op: Opcode, arg: u32) {
        debug_assert!(op.has_arg(), "push_op_arg used for argumentless opcode {op:?}");
        self.instrs.push(Instr::OpArg { op, arg, pos: self.pos() });
    }

    /// Pushes a jump to `dest`, picking absolute or relative addressing by
    /// opcode the way the instruction set defines it.
    ///
    /// # Panics
    ///
    /// Panics when called with a non-jump opcode; that is a compiler defect,
    /// not a recoverable condition.
    pub fn push_jump(&mut self, op: Opcode, dest: LabelId) {
        let pos = self.pos();
        let instr = match op {
            Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::JumpAbsolute
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::ContinueLoop => Instr::JumpAbs { op, arg: 0, dest, pos },
            Opcode::JumpForward
            | Opcode::ForIter
            | Opcode::SetupLoop
            | Opcode::SetupExcept
            | Opcode::SetupFinally => Instr::JumpRel { op, arg: 0, dest, pos },
            other => panic!("push_jump called with non-jump opcode {other:?}"),
        };
        self.instrs.push(instr);
    }

    /// Whether the stream already ends in an explicit return.
    #[must_use]
    pub fn ends_with_return(&self) -> bool {
        self.instrs
            .iter()
            .rev()
            .find(|instr| !matches!(instr, Instr::Label { .. }))
            .is_some_and(|instr| matches!(instr, Instr::Op { op: Opcode::ReturnValue, .. }))
    }

    /// One assembly pass: recompute every position, and from the second
    /// pass on re-resolve jump arguments from label offsets. Returns whether
    /// any offset moved.
    fn pass(&mut self, pass: usize) -> Result<bool, AssembleError> {
        let mut addr = 0u32;
        let mut changed = false;
        for i in 0..self.instrs.len() {
            let number = u32::try_from(i).expect("instruction count exceeds u32");
            changed |= self.instrs[i].set_pos(number, addr);
            if let Instr::Label { label, pos } = self.instrs[i] {
                let state = &mut self.labels[label.0 as usize];
                state.offset = pos.offset;
                state.instr_index = Some(i);
            }
            if pass > 0 {
                changed |= self.resolve(i)?;
            }
            addr += self.instrs[i].size();
        }
        Ok(changed)
    }

    /// Resolves one jump's argument from its destination label. Returns
    /// whether the instruction's encoded size changed, which forces another
    /// pass.
    fn resolve(&mut self, i: usize) -> Result<bool, AssembleError> {
        let dest_offset = match &self.instrs[i] {
            Instr::JumpAbs { dest, .. } | Instr::JumpRel { dest, .. } => self.labels[dest.0 as usize].offset,
            _ => return Ok(false),
        };
        match &mut self.instrs[i] {
            Instr::JumpAbs { arg, .. } => {
                let old_size = if *arg <= 0xFFFF { 3 } else { 6 };
                *arg = dest_offset;
                let new_size = if *arg <= 0xFFFF { 3 } else { 6 };
                Ok(old_size != new_size)
            }
            Instr::JumpRel { arg, pos, .. } => {
                let old_size: u32 = if *arg <= 0xFFFF { 3 } else { 6 };
                let end = pos.offset + old_size;
                if dest_offset < end {
                    return Err(AssembleError::BackwardRelativeJump { instr: pos.number });
                }
                *arg = dest_offset - end;
                let new_size = if *arg <= 0xFFFF { 3 } else { 6 };
                Ok(old_size != new_size)
            }
            _ => Ok(false),
        }
    }

    /// Assembles the stream: runs the address fixpoint, verifies the stack
    /// depth, and emits bytecode plus the line table.
    pub fn assemble(&mut self, firstlineno: u32) -> Result<Assembled, AssembleError> {
        if let Some(label) = self.duplicate_label {
            return Err(AssembleError::DuplicateLabel { label });
        }
        for instr in &self.instrs {
            if let Instr::JumpAbs { dest, .. } | Instr::JumpRel { dest, .. } = instr
                && !self.labels[dest.0 as usize].defined
            {
                return Err(AssembleError::UndefinedLabel { label: dest.0 });
            }
        }

        let mut converged = false;
        for pass in 0..MAX_PASSES {
            if !self.pass(pass)? {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(AssembleError::NoConvergence);
        }

        let stacksize = self.stack_depth()?;

        let mut code = Vec::with_capacity(3 * self.instrs.len());
        for instr in &self.instrs {
            instr.output(&mut code);
        }
        Ok(Assembled {
            code,
            stacksize,
            lnotab: self.lnotab(firstlineno),
        })
    }

    /// Finds the flow path that needs the largest stack. Cycles in the flow
    /// graph are assumed to have no net effect on the stack depth.
    pub fn stack_depth(&self) -> Result<u32, AssembleError> {
        let mut seen = vec![false; self.instrs.len()];
        let mut start_depth: Vec<Option<i32>> = vec![None; self.instrs.len()];
        let max = self.depth_walk(0, &mut seen, &mut start_depth, 0, 0)?;
        Ok(u32::try_from(max).expect("stack depth exceeds u32"))
    }

    fn depth_walk(
        &self,
        start: usize,
        seen: &mut [bool],
        start_depth: &mut [Option<i32>],
        mut depth: i32,
        mut maxdepth: i32,
    ) -> Result<i32, AssembleError> {
        if start >= self.instrs.len() {
            return Ok(maxdepth);
        }
        if seen[start] {
            // Already on the current path: a cycle, assumed depth-neutral.
            return Ok(maxdepth);
        }
        if let Some(d) = start_depth[start]
            && d >= depth
        {
            // This block was already walked at a depth at least as large.
            return Ok(maxdepth);
        }
        seen[start] = true;
        start_depth[start] = Some(depth);
        for i in start..self.instrs.len() {
            let instr = &self.instrs[i];
            depth += instr.stack_effect()?;
            maxdepth = maxdepth.max(depth);
            if depth < 0 {
                return Err(AssembleError::StackUnderflow { instr: instr.pos().number });
            }
            if let Instr::JumpAbs { op, dest, .. } | Instr::JumpRel { op, dest, .. } = instr {
                let dest_index = self.labels[dest.0 as usize]
                    .instr_index
                    .ok_or(AssembleError::UndefinedLabel { label: dest.0 })?;
                let mut target_depth = depth;
                match op {
                    // The exhausted edge has popped the iterator and not
                    // pushed a value.
                    Opcode::ForIter => target_depth = depth - 2,
                    // The handler edge enters with the exception state
                    // pushed.
                    Opcode::SetupFinally | Opcode::SetupExcept => {
                        target_depth = depth + 3;
                        maxdepth = maxdepth.max(target_depth);
                    }
                    // The fall-through edge has popped the tested value.
                    Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => depth -= 1,
                    _ => {}
                }
                maxdepth = self.depth_walk(dest_index, seen, start_depth, target_depth, maxdepth)?;
                if matches!(op, Opcode::JumpAbsolute | Opcode::JumpForward) {
                    // The bytes after an unconditional jump are unreachable
                    // along this path.
                    break;
                }
            }
        }
        seen[start] = false;
        Ok(maxdepth)
    }

    /// Emits the delta-encoded line table: pairs of (byte delta, line
    /// delta), each component chunked at 255.
    fn lnotab(&self, firstlineno: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let mut last_offset = 0u32;
        let mut last_lineno = firstlineno;
        for instr in &self.instrs {
            let pos = instr.pos();
            if pos.lineno <= last_lineno || instr.size() == 0 {
                continue;
            }
            let mut byte_delta = pos.offset - last_offset;
            let mut line_delta = pos.lineno - last_lineno;
            while byte_delta > 255 {
                out.push(255);
                out.push(0);
                byte_delta -= 255;
            }
            while line_delta > 255 {
                out.push(byte_delta as u8);
                out.push(255);
                byte_delta = 0;
                line_delta -= 255;
            }
            out.push(byte_delta as u8);
            out.push(line_delta as u8);
            last_offset = pos.offset;
            last_lineno = pos.lineno;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ops_concatenate() {
        let mut instrs = Instructions::new();
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_op(Opcode::ReturnValue);
        let assembled = instrs.assemble(1).unwrap();
        assert_eq!(
            assembled.code,
            vec![Opcode::LoadConst as u8, 0, 0, Opcode::ReturnValue as u8]
        );
        assert_eq!(assembled.stacksize, 1);
    }

    #[test]
    fn argument_encoding_is_little_endian() {
        let mut instrs = Instructions::new();
        instrs.push_op_arg(Opcode::LoadConst, 0x1234);
        instrs.push_op(Opcode::ReturnValue);
        let assembled = instrs.assemble(1).unwrap();
        assert_eq!(&assembled.code[..3], &[Opcode::LoadConst as u8, 0x34, 0x12]);
    }

    #[test]
    fn wide_argument_gains_extended_arg_prefix() {
        let mut instrs = Instructions::new();
        instrs.push_op_arg(Opcode::LoadConst, 0x0001_0002);
        instrs.push_op(Opcode::ReturnValue);
        let assembled = instrs.assemble(1).unwrap();
        assert_eq!(
            assembled.code,
            vec![
                Opcode::ExtendedArg as u8,
                0x01,
                0x00,
                Opcode::LoadConst as u8,
                0x02,
                0x00,
                Opcode::ReturnValue as u8,
            ]
        );
    }

    #[test]
    fn forward_jump_resolves_to_relative_offset() {
        let mut instrs = Instructions::new();
        let label = instrs.new_label();
        instrs.push_jump(Opcode::JumpForward, label);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_op(Opcode::PopTop);
        instrs.push_label(label);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_op(Opcode::ReturnValue);
        let assembled = instrs.assemble(1).unwrap();
        // Jump is 3 bytes, skipped section is 4 bytes: argument is 4.
        assert_eq!(&assembled.code[..3], &[Opcode::JumpForward as u8, 4, 0]);
    }

    #[test]
    fn absolute_jump_stores_target_offset() {
        let mut instrs = Instructions::new();
        let top = instrs.new_label();
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_label(top);
        instrs.push_op(Opcode::PopTop);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_jump(Opcode::JumpAbsolute, top);
        let assembled = instrs.assemble(1).unwrap();
        // The label sits after the first 3-byte LoadConst.
        let len = assembled.code.len();
        assert_eq!(&assembled.code[len - 3..], &[Opcode::JumpAbsolute as u8, 3, 0]);
    }

    #[test]
    fn backward_relative_jump_is_fatal() {
        let mut instrs = Instructions::new();
        let label = instrs.new_label();
        instrs.push_label(label);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_op(Opcode::PopTop);
        instrs.push_jump(Opcode::JumpForward, label);
        assert!(matches!(
            instrs.assemble(1),
            Err(AssembleError::BackwardRelativeJump { .. })
        ));
    }

    #[test]
    fn duplicate_label_is_fatal() {
        let mut instrs = Instructions::new();
        let label = instrs.new_label();
        instrs.push_label(label);
        instrs.push_label(label);
        assert!(matches!(instrs.assemble(1), Err(AssembleError::DuplicateLabel { .. })));
    }

    #[test]
    fn undefined_label_is_fatal() {
        let mut instrs = Instructions::new();
        let label = instrs.new_label();
        instrs.push_jump(Opcode::JumpAbsolute, label);
        assert!(matches!(instrs.assemble(1), Err(AssembleError::UndefinedLabel { .. })));
    }

    #[test]
    fn stack_depth_tracks_branches_separately() {
        // Condition, then one branch pushes two values, the other one; the
        // verified depth must cover the deeper branch.
        let mut instrs = Instructions::new();
        let orelse = instrs.new_label();
        let done = instrs.new_label();
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_jump(Opcode::PopJumpIfFalse, orelse);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_op_arg(Opcode::LoadConst, 1);
        instrs.push_op_arg(Opcode::BuildTuple, 2);
        instrs.push_jump(Opcode::JumpForward, done);
        instrs.push_label(orelse);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_label(done);
        instrs.push_op(Opcode::ReturnValue);
        let assembled = instrs.assemble(1).unwrap();
        assert_eq!(assembled.stacksize, 2);
    }

    #[test]
    fn stack_depth_handles_backward_edges() {
        // A loop shaped stream: the backward absolute jump must not recurse
        // forever, and depth stays balanced.
        let mut instrs = Instructions::new();
        let top = instrs.new_label();
        let out = instrs.new_label();
        instrs.push_label(top);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_jump(Opcode::PopJumpIfFalse, out);
        instrs.push_jump(Opcode::JumpAbsolute, top);
        instrs.push_label(out);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_op(Opcode::ReturnValue);
        let assembled = instrs.assemble(1).unwrap();
        assert_eq!(assembled.stacksize, 1);
    }

    #[test]
    fn underflow_is_fatal() {
        let mut instrs = Instructions::new();
        instrs.push_op(Opcode::PopTop);
        assert!(matches!(instrs.assemble(1), Err(AssembleError::StackUnderflow { .. })));
    }

    #[test]
    fn exception_setup_reserves_handler_slots() {
        let mut instrs = Instructions::new();
        let handler = instrs.new_label();
        instrs.push_jump(Opcode::SetupExcept, handler);
        instrs.push_op(Opcode::PopBlock);
        instrs.push_label(handler);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_op(Opcode::ReturnValue);
        let assembled = instrs.assemble(1).unwrap();
        // Fall-through reserves 6 slots, the handler edge 3 more, and the
        // handler body pushes its return value on top of those.
        assert_eq!(assembled.stacksize, 10);
    }

    #[test]
    fn lnotab_encodes_line_deltas() {
        let mut instrs = Instructions::new();
        instrs.set_lineno(1);
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.set_lineno(3);
        instrs.push_op_arg(Opcode::LoadConst, 1);
        instrs.push_op(Opcode::ReturnValue);
        let assembled = instrs.assemble(1).unwrap();
        // Second instruction starts at byte 3, two lines later.
        assert_eq!(assembled.lnotab, vec![3, 2]);
    }

    #[test]
    fn ends_with_return_sees_through_labels() {
        let mut instrs = Instructions::new();
        instrs.push_op_arg(Opcode::LoadConst, 0);
        instrs.push_op(Opcode::ReturnValue);
        let label = instrs.new_label();
        instrs.push_label(label);
        assert!(instrs.ends_with_return());
    }
}
