//! End-to-end tests driving the public compile-and-run API.

use natrix::{CollectStringPrint, CompileError, CompileMode, Error, ExcType, Interpreter, Value};

fn run(interp: &mut Interpreter, source: &str) {
    interp
        .eval(source, CompileMode::Exec)
        .unwrap_or_else(|err| panic!("running {source:?} failed: {err}"));
}

fn global_int(interp: &Interpreter, name: &str) -> i64 {
    interp
        .get_global(name)
        .unwrap_or_else(|| panic!("global '{name}' is not bound"))
        .as_int()
        .unwrap_or_else(|| panic!("global '{name}' is not an int"))
}

#[test]
fn evaluates_arithmetic() {
    let mut interp = Interpreter::new();
    let value = interp.eval("1 + 2 * 3", CompileMode::Eval).unwrap();
    assert_eq!(value.as_int(), Some(7));
}

/// `a = 1; a += 2` leaves `a == 3` via the in-place opcode.
#[test]
fn augmented_assignment_accumulates() {
    let mut interp = Interpreter::new();
    run(&mut interp, "a = 1\na += 2");
    assert_eq!(global_int(&interp, "a"), 3);
}

/// `1 < 2 < 0` short-circuits to False after the first true comparison
/// without leaking the duplicated middle operand.
#[test]
fn chained_comparison_short_circuits() {
    let mut interp = Interpreter::new();
    let value = interp.eval("1 < 2 < 0", CompileMode::Eval).unwrap();
    assert_eq!(value.as_bool(), Some(false));
    let value = interp.eval("1 < 2 < 3", CompileMode::Eval).unwrap();
    assert_eq!(value.as_bool(), Some(true));
    let value = interp.eval("3 > 2 > 1", CompileMode::Eval).unwrap();
    assert_eq!(value.as_bool(), Some(true));
}

/// The right operand of `and`/`or` is never evaluated when the left side
/// decides the result; an undefined name there must not raise.
#[test]
fn boolean_operators_short_circuit() {
    let mut interp = Interpreter::new();
    run(&mut interp, "x = 0 and missing_name\ny = 0 or 'fallback'");
    assert_eq!(global_int(&interp, "x"), 0);
    let y = interp.get_global("y").unwrap();
    assert_eq!(interp.str_value(&y), Some("fallback"));
}

#[test]
fn conditional_expression_picks_a_branch() {
    let mut interp = Interpreter::new();
    run(&mut interp, "x = 'yes' if 1 < 2 else 'no'");
    let x = interp.get_global("x").unwrap();
    assert_eq!(interp.str_value(&x), Some("yes"));
}

#[test]
fn string_operations() {
    let mut interp = Interpreter::new();
    let value = interp.eval("'ab' * 3 + '!'", CompileMode::Eval).unwrap();
    assert_eq!(interp.str_value(&value), Some("ababab!"));
}

#[test]
fn container_literals_and_subscripts() {
    let mut interp = Interpreter::new();
    run(
        &mut interp,
        "d = {'a': 1, 'b': 2}\nv = d['b']\nt = (1, 2, 3)[0]\ns = 'hello'[1:4]\nl = [1, 2, 3][-1]",
    );
    assert_eq!(global_int(&interp, "v"), 2);
    assert_eq!(global_int(&interp, "t"), 1);
    let s = interp.get_global("s").unwrap();
    assert_eq!(interp.str_value(&s), Some("ell"));
    assert_eq!(global_int(&interp, "l"), 3);
}

#[test]
fn lambda_calls_with_defaults() {
    let mut interp = Interpreter::new();
    run(&mut interp, "f = lambda x, y=10: x + y\na = f(1)\nb = f(1, 2)");
    assert_eq!(global_int(&interp, "a"), 11);
    assert_eq!(global_int(&interp, "b"), 3);
}

/// A parameter captured by a nested lambda travels through a cell and stays
/// readable after the outer call returned.
#[test]
fn closures_capture_parameters() {
    let mut interp = Interpreter::new();
    run(&mut interp, "make = lambda x: lambda: x\nf = make(42)\nv = f()");
    assert_eq!(global_int(&interp, "v"), 42);
}

#[test]
fn star_args_and_keyword_binding() {
    let mut interp = Interpreter::new();
    run(
        &mut interp,
        "f = lambda a, b, c=0: a + b + c\n\
         x = f(*(1, 2))\n\
         y = f(1, c=3, b=2)\n\
         g = lambda *args, **kw: len(args) + len(kw)\n\
         z = g(1, 2, k=3)",
    );
    assert_eq!(global_int(&interp, "x"), 3);
    assert_eq!(global_int(&interp, "y"), 6);
    assert_eq!(global_int(&interp, "z"), 3);
}

#[test]
fn multi_target_assignment_and_unpacking() {
    let mut interp = Interpreter::new();
    run(&mut interp, "a = b = 5\nc, d = (1, 2)");
    assert_eq!(global_int(&interp, "a"), 5);
    assert_eq!(global_int(&interp, "b"), 5);
    assert_eq!(global_int(&interp, "c"), 1);
    assert_eq!(global_int(&interp, "d"), 2);
}

/// An undefined name raises a NameError identifying the missing name.
#[test]
fn undefined_name_is_a_name_error() {
    let mut interp = Interpreter::new();
    let err = interp.eval("missing", CompileMode::Eval).unwrap_err();
    let Error::Run(exc) = err else {
        panic!("expected a runtime error, got {err:?}");
    };
    assert_eq!(exc.exc_type, ExcType::NameError);
    assert!(exc.message.contains("'missing'"), "message: {}", exc.message);
    assert_eq!(exc.frames[0].name, "<module>");
}

/// An error inside a called function reports the whole frame chain,
/// outermost first, with the source line of each call site.
#[test]
fn errors_carry_the_frame_chain() {
    let mut interp = Interpreter::new();
    let err = interp
        .eval("f = lambda: missing_name\nf()", CompileMode::Exec)
        .unwrap_err();
    let Error::Run(exc) = err else {
        panic!("expected a runtime error, got {err:?}");
    };
    assert_eq!(exc.exc_type, ExcType::NameError);
    let chain: Vec<(&str, u32)> = exc.frames.iter().map(|f| (f.name.as_str(), f.line)).collect();
    assert_eq!(chain, vec![("<module>", 2), ("<lambda>", 1)]);
}

#[test]
fn division_by_zero_raises() {
    let mut interp = Interpreter::new();
    let err = interp.eval("1 / 0", CompileMode::Eval).unwrap_err();
    let Error::Run(exc) = err else {
        panic!("expected a runtime error, got {err:?}");
    };
    assert_eq!(exc.exc_type, ExcType::ZeroDivisionError);
    assert_eq!(exc.message, "division by zero");
}

#[test]
fn failed_assert_raises_with_the_message() {
    let mut interp = Interpreter::new();
    run(&mut interp, "assert 1 < 2, 'fine'");
    let err = interp.eval("assert 1 > 2, 'nope'", CompileMode::Exec).unwrap_err();
    let Error::Run(exc) = err else {
        panic!("expected a runtime error, got {err:?}");
    };
    assert_eq!(exc.exc_type, ExcType::AssertionError);
    assert_eq!(exc.message, "nope");
}

/// A failed dispatch names both operand types and the operator.
#[test]
fn dispatch_failure_names_both_types() {
    let mut interp = Interpreter::new();
    let err = interp.eval("1 + 'a'", CompileMode::Eval).unwrap_err();
    let Error::Run(exc) = err else {
        panic!("expected a runtime error, got {err:?}");
    };
    assert_eq!(exc.exc_type, ExcType::TypeError);
    assert_eq!(exc.message, "unsupported operand type(s) for +: 'int' and 'str'");

    let err = interp.eval("'a' < 1", CompileMode::Eval).unwrap_err();
    let Error::Run(exc) = err else {
        panic!("expected a runtime error, got {err:?}");
    };
    assert_eq!(exc.message, "'<' not supported between instances of 'str' and 'int'");
}

#[test]
fn print_routes_through_the_writer() {
    let mut interp = Interpreter::new();
    let mut out = CollectStringPrint::new();
    interp
        .eval_with_print("print('hi', 42)", CompileMode::Exec, &mut out)
        .unwrap();
    assert_eq!(out.output(), "hi 42\n");
}

/// Interactive mode prints expression-statement values and binds them to
/// `_`; `None` results are bound but not printed.
#[test]
fn interactive_mode_prints_and_binds_underscore() {
    let mut interp = Interpreter::new();
    let mut out = CollectStringPrint::new();
    interp.eval_with_print("1 + 1", CompileMode::Single, &mut out).unwrap();
    assert_eq!(out.output(), "2\n");
    assert_eq!(global_int(&interp, "_"), 2);

    let mut out = CollectStringPrint::new();
    interp.eval_with_print("None", CompileMode::Single, &mut out).unwrap();
    assert_eq!(out.output(), "");
}

/// Integer arithmetic promotes to big integers on overflow instead of
/// wrapping or erroring.
#[test]
fn integers_promote_on_overflow() {
    let mut interp = Interpreter::new();
    run(&mut interp, "x = 9223372036854775807 + 1\ny = 2 ** 100");
    let x = interp.get_global("x").unwrap();
    assert_eq!(interp.repr(&x), "9223372036854775808");
    let y = interp.get_global("y").unwrap();
    assert_eq!(interp.repr(&y), "1267650600228229401496703205376");
}

#[test]
fn unsupported_statement_is_a_compile_error() {
    let mut interp = Interpreter::new();
    let err = interp.eval("for i in x:\n    pass", CompileMode::Exec).unwrap_err();
    assert!(matches!(
        err,
        Error::Compile(CompileError::NotImplemented { .. })
    ));
}

/// Two interpreters share no state: globals set in one are invisible to the
/// other.
#[test]
fn interpreters_are_independent() {
    let mut a = Interpreter::new();
    let mut b = Interpreter::new();
    run(&mut a, "x = 1");
    assert_eq!(a.get_global("x"), Some(Value::Int(1)));
    assert_eq!(b.get_global("x"), None);
    run(&mut b, "x = 2");
    assert_eq!(a.get_global("x"), Some(Value::Int(1)));
    assert_eq!(b.get_global("x"), Some(Value::Int(2)));
}
