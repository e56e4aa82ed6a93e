//! Binary, in-place, and unary operation handlers.
//!
//! Each handler pops its operands and hands them to the dispatch protocol;
//! everything type-specific lives behind the `Operand` capabilities on
//! `Value`.

use crate::{
    exception::RunResult,
    io::PrintWriter,
    protocol::{self, BinaryOp, UnaryOp},
};

use super::Vm;

impl<P: PrintWriter> Vm<'_, P> {
    pub(super) fn binary(&mut self, op: BinaryOp) -> RunResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let result = {
            let mut ctx = self.ctx();
            protocol::binary_op(op, &lhs, &rhs, &mut ctx)?
        };
        self.push(result);
        Ok(())
    }

    /// In-place variant: tries the dedicated in-place capability first and
    /// rebinds whatever comes back.
    pub(super) fn inplace(&mut self, op: BinaryOp) -> RunResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let result = {
            let mut ctx = self.ctx();
            protocol::inplace_op(op, &lhs, &rhs, &mut ctx)?
        };
        self.push(result);
        Ok(())
    }

    pub(super) fn unary(&mut self, op: UnaryOp) -> RunResult<()> {
        let operand = self.pop()?;
        let result = {
            let mut ctx = self.ctx();
            protocol::unary_op(op, &operand, &mut ctx)?
        };
        self.push(result);
        Ok(())
    }
}
