//! Code objects round-trip through a compact binary format.

use std::sync::Arc;

use natrix::{Code, CompileFlags, CompileMode, Const, Interpreter};
use pretty_assertions::assert_eq;

fn compile(interp: &mut Interpreter, source: &str) -> Arc<Code> {
    interp
        .compile(source, "serde.py", CompileMode::Exec, CompileFlags::default(), false)
        .expect("compilation failed")
}

#[test]
fn code_round_trips_through_postcard() {
    let mut interp = Interpreter::new();
    let code = compile(&mut interp, "x = 1 + 2.5\ny = 'text'\nz = 123456789012345678901234567890");
    let bytes = postcard::to_allocvec(code.as_ref()).expect("serialization failed");
    let back: Code = postcard::from_bytes(&bytes).expect("deserialization failed");
    assert_eq!(*code, back);
}

/// Nested lambda bodies serialize with their parent. Code constants compare
/// by identity, so the round-trip is checked field by field.
#[test]
fn nested_code_objects_serialize_with_their_parent() {
    let mut interp = Interpreter::new();
    let code = compile(&mut interp, "f = lambda x: x + 1");
    let bytes = postcard::to_allocvec(code.as_ref()).expect("serialization failed");
    let back: Code = postcard::from_bytes(&bytes).expect("deserialization failed");

    assert_eq!(back.code, code.code);
    assert_eq!(back.names, code.names);
    let Const::Code(orig_inner) = &code.consts[0] else {
        panic!("expected a code constant, got {:?}", code.consts[0]);
    };
    let Const::Code(back_inner) = &back.consts[0] else {
        panic!("expected a code constant after the round trip");
    };
    assert_eq!(back_inner.code, orig_inner.code);
    assert_eq!(back_inner.argcount, orig_inner.argcount);
    assert_eq!(back_inner.varnames, orig_inner.varnames);
    assert_eq!(back_inner.stacksize, orig_inner.stacksize);
}

/// A deserialized code object is still executable against the interpreter
/// whose interner it was compiled with.
#[test]
fn deserialized_code_still_runs() {
    let mut interp = Interpreter::new();
    let code = compile(&mut interp, "answer = 40 + 2");
    let bytes = postcard::to_allocvec(code.as_ref()).expect("serialization failed");
    let back: Code = postcard::from_bytes(&bytes).expect("deserialization failed");
    interp.run_code(&Arc::new(back)).expect("run failed");
    assert_eq!(interp.get_global("answer").and_then(|v| v.as_int()), Some(42));
}
