//! Tests driving the virtual machine with hand-assembled code objects.
//!
//! The compiler subset does not emit loop or try statements, but the VM's
//! block-stack machinery is part of the execution contract; these tests
//! assemble such streams directly and run them through the public API.

use std::sync::Arc;

use natrix::{CO_NOFREE, CmpArg, Code, Const, ExcType, Instructions, Interpreter, Opcode};

/// Wraps an assembled instruction stream as a module-level code object.
fn module_code(interp: &mut Interpreter, mut instrs: Instructions, consts: Vec<Const>, names: &[&str]) -> Arc<Code> {
    let names = names.iter().map(|n| interp.intern(n)).collect();
    let assembled = instrs.assemble(1).expect("assembly failed");
    Arc::new(Code {
        argcount: 0,
        kwonlyargcount: 0,
        nlocals: 0,
        stacksize: assembled.stacksize,
        flags: CO_NOFREE,
        code: assembled.code,
        consts,
        names,
        varnames: vec![],
        freevars: vec![],
        cellvars: vec![],
        cell2arg: vec![],
        filename: "handmade.py".to_owned(),
        name: interp.intern("<module>"),
        firstlineno: 1,
        lnotab: assembled.lnotab,
    })
}

/// A NameError raised inside a SETUP_EXCEPT region transfers to the handler
/// instead of escaping, and POP_EXCEPT restores the saved exception state.
#[test]
fn except_block_catches_a_name_error() {
    let mut interp = Interpreter::new();
    let caught = interp.intern("caught");

    let mut instrs = Instructions::new();
    let handler = instrs.new_label();
    let end = instrs.new_label();
    instrs.push_jump(Opcode::SetupExcept, handler);
    instrs.push_op_arg(Opcode::LoadName, 0); // missing -> NameError
    instrs.push_op(Opcode::PopTop);
    instrs.push_op(Opcode::PopBlock);
    instrs.push_jump(Opcode::JumpForward, end);
    instrs.push_label(handler);
    instrs.push_op(Opcode::PopTop); // type
    instrs.push_op(Opcode::PopTop); // value
    instrs.push_op(Opcode::PopTop); // traceback
    instrs.push_op_arg(Opcode::LoadConst, 0);
    instrs.push_op_arg(Opcode::StoreName, 1); // result = 'caught'
    instrs.push_op(Opcode::PopExcept);
    instrs.push_label(end);
    instrs.push_op_arg(Opcode::LoadConst, 1);
    instrs.push_op(Opcode::ReturnValue);

    let code = module_code(&mut interp, instrs, vec![Const::Str(caught), Const::None], &["missing", "result"]);
    let value = interp.run_code(&code).expect("the handler should catch the NameError");
    assert!(value.is_none());
    let result = interp.get_global("result").expect("handler body did not run");
    assert_eq!(interp.str_value(&result), Some("caught"));
}

/// The exception-match comparison consults the subclass lattice: a handler
/// testing for `Exception` catches a raised NameError.
#[test]
fn exception_match_uses_the_subclass_lattice() {
    let mut interp = Interpreter::new();
    let caught = interp.intern("caught");

    let mut instrs = Instructions::new();
    let handler = instrs.new_label();
    let reraise = instrs.new_label();
    let end = instrs.new_label();
    instrs.push_jump(Opcode::SetupExcept, handler);
    instrs.push_op_arg(Opcode::LoadName, 0);
    instrs.push_op(Opcode::PopTop);
    instrs.push_op(Opcode::PopBlock);
    instrs.push_jump(Opcode::JumpForward, end);
    instrs.push_label(handler);
    instrs.push_op(Opcode::DupTop); // the raised class
    instrs.push_op_arg(Opcode::LoadName, 1); // Exception, from builtins
    instrs.push_op_arg(Opcode::CompareOp, CmpArg::ExcMatch as u32);
    instrs.push_jump(Opcode::PopJumpIfFalse, reraise);
    instrs.push_op(Opcode::PopTop);
    instrs.push_op(Opcode::PopTop);
    instrs.push_op(Opcode::PopTop);
    instrs.push_op_arg(Opcode::LoadConst, 0);
    instrs.push_op_arg(Opcode::StoreName, 2);
    instrs.push_op(Opcode::PopExcept);
    instrs.push_jump(Opcode::JumpForward, end);
    instrs.push_label(reraise);
    instrs.push_op_arg(Opcode::RaiseVarargs, 0);
    instrs.push_label(end);
    instrs.push_op_arg(Opcode::LoadConst, 1);
    instrs.push_op(Opcode::ReturnValue);

    let code = module_code(
        &mut interp,
        instrs,
        vec![Const::Str(caught), Const::None],
        &["missing", "Exception", "result"],
    );
    interp.run_code(&code).expect("the handler should match");
    let result = interp.get_global("result").expect("handler body did not run");
    assert_eq!(interp.str_value(&result), Some("caught"));
}

/// A finally block runs on normal exit.
#[test]
fn finally_runs_on_fallthrough() {
    let mut interp = Interpreter::new();

    let mut instrs = Instructions::new();
    let fin = instrs.new_label();
    instrs.push_jump(Opcode::SetupFinally, fin);
    instrs.push_op_arg(Opcode::LoadConst, 0);
    instrs.push_op_arg(Opcode::StoreName, 0); // x = 1
    instrs.push_op(Opcode::PopBlock);
    instrs.push_op_arg(Opcode::LoadConst, 2); // no pending unwind
    instrs.push_label(fin);
    instrs.push_op_arg(Opcode::LoadConst, 1);
    instrs.push_op_arg(Opcode::StoreName, 1); // y = 2
    instrs.push_op(Opcode::EndFinally);
    instrs.push_op_arg(Opcode::LoadConst, 2);
    instrs.push_op(Opcode::ReturnValue);

    let code = module_code(
        &mut interp,
        instrs,
        vec![Const::Int(1), Const::Int(2), Const::None],
        &["x", "y"],
    );
    interp.run_code(&code).expect("run failed");
    assert_eq!(interp.get_global("x").and_then(|v| v.as_int()), Some(1));
    assert_eq!(interp.get_global("y").and_then(|v| v.as_int()), Some(2));
}

/// A finally block also runs while an exception propagates, and
/// END_FINALLY re-raises it afterwards.
#[test]
fn finally_runs_on_the_exception_path() {
    let mut interp = Interpreter::new();

    let mut instrs = Instructions::new();
    let fin = instrs.new_label();
    instrs.push_jump(Opcode::SetupFinally, fin);
    instrs.push_op_arg(Opcode::LoadName, 0); // missing -> NameError
    instrs.push_op(Opcode::PopTop);
    instrs.push_op(Opcode::PopBlock);
    instrs.push_op_arg(Opcode::LoadConst, 1);
    instrs.push_label(fin);
    instrs.push_op_arg(Opcode::LoadConst, 0);
    instrs.push_op_arg(Opcode::StoreName, 1); // ran = 1
    instrs.push_op(Opcode::EndFinally);
    instrs.push_op_arg(Opcode::LoadConst, 1);
    instrs.push_op(Opcode::ReturnValue);

    let code = module_code(&mut interp, instrs, vec![Const::Int(1), Const::None], &["missing", "ran"]);
    let err = interp.run_code(&code).expect_err("the exception should escape");
    assert_eq!(err.exc_type, ExcType::NameError);
    assert_eq!(interp.get_global("ran").and_then(|v| v.as_int()), Some(1));
}

/// SETUP_LOOP / CONTINUE_LOOP / BREAK_LOOP drive a counting loop through
/// the block stack.
#[test]
fn loop_blocks_support_break_and_continue() {
    let mut interp = Interpreter::new();

    let mut instrs = Instructions::new();
    let top = instrs.new_label();
    let done = instrs.new_label();
    let out = instrs.new_label();
    instrs.push_op_arg(Opcode::LoadConst, 0);
    instrs.push_op_arg(Opcode::StoreName, 0); // i = 0
    instrs.push_jump(Opcode::SetupLoop, out);
    instrs.push_label(top);
    instrs.push_op_arg(Opcode::LoadName, 0);
    instrs.push_op_arg(Opcode::LoadConst, 1);
    instrs.push_op(Opcode::BinaryAdd);
    instrs.push_op_arg(Opcode::StoreName, 0); // i = i + 1
    instrs.push_op_arg(Opcode::LoadName, 0);
    instrs.push_op_arg(Opcode::LoadConst, 2);
    instrs.push_op_arg(Opcode::CompareOp, CmpArg::Lt as u32);
    instrs.push_jump(Opcode::PopJumpIfFalse, done);
    instrs.push_jump(Opcode::ContinueLoop, top);
    instrs.push_label(done);
    instrs.push_op(Opcode::BreakLoop);
    instrs.push_label(out);
    instrs.push_op_arg(Opcode::LoadConst, 3);
    instrs.push_op(Opcode::ReturnValue);

    let code = module_code(
        &mut interp,
        instrs,
        vec![Const::Int(0), Const::Int(1), Const::Int(5), Const::None],
        &["i"],
    );
    interp.run_code(&code).expect("run failed");
    assert_eq!(interp.get_global("i").and_then(|v| v.as_int()), Some(5));
}

/// Raising a bare exception class instantiates it.
#[test]
fn raising_a_class_instantiates_it() {
    let mut interp = Interpreter::new();

    let mut instrs = Instructions::new();
    instrs.push_op_arg(Opcode::LoadName, 0);
    instrs.push_op_arg(Opcode::RaiseVarargs, 1);
    instrs.push_op_arg(Opcode::LoadConst, 0);
    instrs.push_op(Opcode::ReturnValue);

    let code = module_code(&mut interp, instrs, vec![Const::None], &["ValueError"]);
    let err = interp.run_code(&code).expect_err("the raise should escape");
    assert_eq!(err.exc_type, ExcType::ValueError);
    assert_eq!(err.message, "");
}

/// An opcode that is recognized but has no handler halts with an internal
/// error rather than misbehaving; this is a development-time signal.
#[test]
fn unresolved_opcode_halts() {
    let mut interp = Interpreter::new();

    let mut instrs = Instructions::new();
    instrs.push_op_arg(Opcode::LoadConst, 0);
    instrs.push_op(Opcode::GetIter);
    instrs.push_op(Opcode::ReturnValue);

    let code = module_code(&mut interp, instrs, vec![Const::None], &[]);
    let err = interp.run_code(&code).expect_err("GET_ITER has no handler");
    assert_eq!(err.exc_type, ExcType::SystemError);
    assert!(err.message.contains("GetIter"), "message: {}", err.message);
}
