//! `COMPARE_OP` handling: rich comparisons through the dispatch protocol,
//! plus the protocol-external forms (identity, membership, and the
//! exception-match test used by handler blocks).

use crate::{
    exception::{ExcType, RunError, RunResult},
    heap::HeapData,
    io::PrintWriter,
    protocol::{self, CmpOp},
    value::{self, Value},
};

use super::{super::op::CmpArg, Vm};

impl<P: PrintWriter> Vm<'_, P> {
    pub(super) fn compare(&mut self, arg: u32) -> RunResult<()> {
        let arg = CmpArg::from_repr(arg).ok_or_else(|| RunError::internal("unknown COMPARE_OP operand"))?;
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let result = match arg {
            CmpArg::Lt => self.protocol_compare(CmpOp::Lt, &lhs, &rhs)?,
            CmpArg::Le => self.protocol_compare(CmpOp::Le, &lhs, &rhs)?,
            CmpArg::Eq => self.protocol_compare(CmpOp::Eq, &lhs, &rhs)?,
            CmpArg::Ne => self.protocol_compare(CmpOp::Ne, &lhs, &rhs)?,
            CmpArg::Gt => self.protocol_compare(CmpOp::Gt, &lhs, &rhs)?,
            CmpArg::Ge => self.protocol_compare(CmpOp::Ge, &lhs, &rhs)?,
            CmpArg::In => self.contains(&lhs, &rhs)?,
            CmpArg::NotIn => !self.contains(&lhs, &rhs)?,
            CmpArg::Is => lhs.is_identical(&rhs),
            CmpArg::IsNot => !lhs.is_identical(&rhs),
            CmpArg::ExcMatch => self.exc_match(&lhs, &rhs)?,
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    fn protocol_compare(&mut self, op: CmpOp, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        let mut ctx = self.ctx();
        protocol::compare_op(op, lhs, rhs, &mut ctx)
    }

    fn contains(&mut self, item: &Value, container: &Value) -> RunResult<bool> {
        let mut ctx = self.ctx();
        value::py_contains(item, container, &mut ctx)
    }

    /// The handler-block comparison: does the raised value match the
    /// handler's class (or tuple of classes)?
    fn exc_match(&mut self, exc: &Value, classes: &Value) -> RunResult<bool> {
        let raised = match exc {
            Value::Class(kind) => *kind,
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Exception(inst) => inst.exc_type,
                _ => return Ok(false),
            },
            _ => return Ok(false),
        };
        let mut kinds = Vec::new();
        match classes {
            Value::Class(kind) => kinds.push(*kind),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Tuple(items) => {
                    for item in items {
                        match item {
                            Value::Class(kind) => kinds.push(*kind),
                            other => return Err(self.cannot_catch(other)),
                        }
                    }
                }
                _ => return Err(self.cannot_catch(classes)),
            },
            other => return Err(self.cannot_catch(other)),
        }
        Ok(kinds.into_iter().any(|kind| raised.is_subclass_of(kind)))
    }

    fn cannot_catch(&self, value: &Value) -> RunError {
        ExcType::type_error(format!(
            "catching '{}' that does not inherit from BaseException is not allowed",
            value.type_name(self.heap)
        ))
        .into()
    }
}
