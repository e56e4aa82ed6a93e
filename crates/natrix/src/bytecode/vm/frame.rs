//! Runtime activation records and the per-frame block stack.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{bytecode::Code, heap::HeapId, namespace::NamespaceId, value::Value};

/// What kind of region a [`TryBlock`] guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    /// A loop body; `break`/`continue` unwind to it.
    Loop,
    /// A `try` region with except handlers.
    Except,
    /// A `try` region with a finally handler.
    Finally,
    /// Synthesized while an except handler runs, so the saved exception
    /// state can be restored on exit.
    ExceptHandler,
}

/// One entry of the per-frame block stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TryBlock {
    pub kind: BlockKind,
    /// Bytecode offset control transfers to when the block applies.
    pub handler: usize,
    /// Operand-stack depth to restore on unwind.
    pub level: usize,
}

/// One activation record of a running module or function body.
///
/// All state needed to resume the computation lives here - instruction
/// pointer, operand stack, locals - which is what keeps the frame stack
/// explicit data rather than host recursion.
#[derive(Debug)]
pub(crate) struct Frame {
    /// The code being executed, shared with its function object.
    pub code: Arc<Code>,
    /// Offset of the next instruction.
    pub ip: usize,
    /// Offset of the instruction currently executing, for line lookup.
    pub lasti: usize,
    /// Locals dictionary. Module frames alias this to `globals`.
    pub locals: NamespaceId,
    /// The enclosing module's globals dictionary.
    pub globals: NamespaceId,
    /// Fast-local slots, parameters first. `None` marks an unbound slot.
    pub fast: Vec<Option<Value>>,
    /// Cell storage: cell variables first, then captured free variables.
    pub cells: Vec<HeapId>,
    /// Operand stack.
    pub stack: Vec<Value>,
    /// Pending loop/try regions, innermost last.
    pub blocks: SmallVec<[TryBlock; 4]>,
}

impl Frame {
    /// Creates a frame for module-level code: locals and globals are the
    /// same dictionary and there are no fast locals or cells.
    pub fn new_module(code: Arc<Code>, globals: NamespaceId) -> Self {
        Self {
            code,
            ip: 0,
            lasti: 0,
            locals: globals,
            globals,
            fast: Vec::new(),
            cells: Vec::new(),
            stack: Vec::new(),
            blocks: SmallVec::new(),
        }
    }

    /// Creates a frame for a function call with bound fast locals and cells.
    pub fn new_function(
        code: Arc<Code>,
        locals: NamespaceId,
        globals: NamespaceId,
        fast: Vec<Option<Value>>,
        cells: Vec<HeapId>,
    ) -> Self {
        let stack = Vec::with_capacity(code.stacksize as usize);
        Self {
            code,
            ip: 0,
            lasti: 0,
            locals,
            globals,
            fast,
            cells,
            stack,
            blocks: SmallVec::new(),
        }
    }
}
