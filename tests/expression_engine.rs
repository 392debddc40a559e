//! Black-box end-to-end tests: compile a source string, evaluate it, and
//! check the result, the instruction count, or the normalized source —
//! never the internals of `Compiler`/`Expression`.

use std::rc::Rc;
use std::sync::Once;

use boxscript::{CompileError, Compiler, EvalError, Scope, SimpleFormatter, Value};

static TRACING_INIT: Once = Once::new();

/// Surfaces `compile`/`evaluate`'s `tracing` diagnostics under
/// `RUST_LOG=debug cargo test -- --nocapture`; a no-op otherwise.
fn new_scope() -> Scope {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
    });
    Scope::new(Rc::new(SimpleFormatter))
}

fn eval(c: &Compiler, src: &str) -> Value {
    let expr = c.compile(src).unwrap_or_else(|e| panic!("compile({src:?}) failed: {e}"));
    expr.evaluate(&mut new_scope()).unwrap_or_else(|e| panic!("evaluate({src:?}) failed: {e}"))
}

fn root_cause(err: &EvalError) -> &EvalError {
    match err {
        EvalError::Callback { cause: Some(c), .. } => root_cause(c),
        other => other,
    }
}

#[test]
fn scenario_1_flat_integer_literal() {
    let c = Compiler::new();
    let expr = c.compile("42").unwrap();
    assert_eq!(expr.decompile_program().lines().count(), 1);
    assert_eq!(expr.evaluate(&mut new_scope()).unwrap(), Value::from_int(42));
    assert_eq!(expr.normalized_source(), "42");
}

#[test]
fn scenario_2_constant_multiplication_folds_to_one_instruction() {
    let c = Compiler::new();
    let expr = c.compile("42 * 2").unwrap();
    assert_eq!(expr.decompile_program().lines().count(), 1);
    assert_eq!(expr.evaluate(&mut new_scope()).unwrap(), Value::from_int(84));
}

#[test]
fn scenario_3_no_optimization_flag_keeps_every_call_binary() {
    let mut c = Compiler::new();
    c.set_compile_flags(boxscript::CompileFlags::NO_OPTIMIZATION);
    let expr = c.compile("42 * 2 / 5 * 3").unwrap();
    // No constant folding at all: every literal pushes, every operator calls.
    let decompiled = expr.decompile_program();
    let call_binary_count = decompiled.lines().filter(|l| l.contains("CALL_BINARY")).count();
    assert_eq!(call_binary_count, 3);
    assert_eq!(decompiled.lines().count(), 4 + 3); // 4 literals, 3 binary operators
    assert_eq!(expr.evaluate(&mut new_scope()).unwrap(), Value::from_int(42 * 2 / 5 * 3));
}

#[test]
fn scenario_4_ternary_with_constant_condition_collapses() {
    let c = Compiler::new();
    let expr = c.compile("true ? 1 : 2").unwrap();
    assert_eq!(expr.decompile_program().lines().count(), 1);
    assert_eq!(expr.evaluate(&mut new_scope()).unwrap(), Value::from_int(1));
}

#[test]
fn scenario_5_format_with_constant_args_folds_entirely() {
    let c = Compiler::new();
    let expr = c.compile("Format(\"Result: {}\", 2 * 3)").unwrap();
    assert_eq!(expr.decompile_program().lines().count(), 1);
    assert_eq!(expr.evaluate(&mut new_scope()).unwrap(), Value::from_str("Result: 6"));
}

#[test]
fn scenario_6_verbal_aliases_match_symbolic_equivalent() {
    let c = Compiler::new();
    let verbal = eval(&c, "1 equals 1 and 2 not_equals 3");
    let symbolic = eval(&c, "1 == 1 && 2 != 3");
    assert_eq!(verbal, symbolic);
    assert_eq!(verbal, Value::from_bool(true));
}

#[test]
fn integer_literal_bases_round_trip_through_normalized_source() {
    let c = Compiler::new();
    for (src, expected) in [("0x2A", 42), ("0o52", 42), ("0b101010", 42), ("42", 42)] {
        let expr = c.compile(src).unwrap();
        assert_eq!(expr.evaluate(&mut new_scope()).unwrap(), Value::from_int(expected));
        // Normalized source round-trips through another compile.
        let again = c.compile(expr.normalized_source()).unwrap();
        assert_eq!(again.evaluate(&mut new_scope()).unwrap(), Value::from_int(expected));
    }
}

#[test]
fn string_escape_round_trips() {
    let c = Compiler::new();
    for (src, raw) in [
        ("\"\"", ""),
        ("\"x\"", "x"),
        ("\"a\\\"b\"", "a\"b"),
        ("\"a\\\\b\"", "a\\b"),
        ("\"a\\nb\"", "a\nb"),
    ] {
        let expr = c.compile(src).unwrap();
        let v = expr.evaluate(&mut new_scope()).unwrap();
        assert_eq!(v.unbox::<Rc<str>>().unwrap().as_ref(), raw);
    }
}

#[test]
fn nested_expression_resolves_through_star_prefix_sugar() {
    let mut c = Compiler::new();
    let sq = c.compile("7 * 7").unwrap();
    c.add_named("sq", sq);
    assert_eq!(eval(&c, "*sq"), Value::from_int(49));
}

#[test]
fn nested_expression_missing_without_throw_uses_default() {
    let c = Compiler::new();
    assert_eq!(eval(&c, "Expression(\"missing\", 99)"), Value::from_int(99));
}

#[test]
fn nested_expression_missing_with_throw_raises_not_found() {
    let c = Compiler::new();
    let expr = c.compile("Expression(\"missing\", 0, throw)").unwrap();
    let err = expr.evaluate(&mut new_scope()).unwrap_err();
    assert!(matches!(root_cause(&err), EvalError::NestedExpressionNotFound { .. }));
}

#[test]
fn result_type_matches_evaluated_value_type() {
    let c = Compiler::new();
    for src in ["42", "\"hi\"", "true", "1 == 1"] {
        let expr = c.compile(src).unwrap();
        let value = expr.evaluate(&mut new_scope()).unwrap();
        assert_eq!(value.tag(), expr.result_type());
    }
}

#[test]
fn normalized_source_is_idempotent_under_recompilation() {
    let c = Compiler::new();
    let expr = c.compile("(1 + 2) * 3").unwrap();
    let reparsed = c.compile(expr.normalized_source()).unwrap();
    assert_eq!(reparsed.normalized_source(), expr.normalized_source());
}

#[test]
fn lhs_constant_optimization_produces_same_program_shape_as_operand_alone() {
    let c = Compiler::new();
    // `true && true` folds through the const-LHS table to just the rhs
    // operand; check it collapses to the same instruction count as the
    // rhs compiled on its own.
    let with_identity = c.compile("(1 == 1) && true").unwrap();
    let bare = c.compile("1 == 1").unwrap();
    assert_eq!(with_identity.decompile_program().lines().count(), bare.decompile_program().lines().count());
}

#[test]
fn unknown_identifier_reports_source_position() {
    let c = Compiler::new();
    let err = c.compile("nonexistent_name").unwrap_err();
    match err {
        CompileError::UnknownIdentifier { pos, name } => {
            assert_eq!(pos, 0);
            assert_eq!(name, "nonexistent_name");
        }
        other => panic!("expected UnknownIdentifier, got {other:?}"),
    }
}

#[test]
fn circular_nested_expressions_are_rejected() {
    let mut c = Compiler::new();
    let a = c.compile("Expression(\"b\", 0)").unwrap();
    c.add_named("a", a);
    let b = c.compile("Expression(\"a\", 0)").unwrap();
    c.add_named("b", b);
    let entry = c.compile("Expression(\"a\", 0)").unwrap();
    let err = entry.evaluate(&mut new_scope()).unwrap_err();
    assert!(matches!(root_cause(&err), EvalError::CircularNestedExpression { .. }));
}

#[test]
fn heterogeneous_values_form_a_strict_total_order() {
    use std::cmp::Ordering;
    let values = [Value::null(), Value::from_bool(true), Value::from_int(1), Value::from_str("x")];
    for x in &values {
        for y in &values {
            let matches = [x.box_cmp(y) == Ordering::Less, x.box_cmp(y) == Ordering::Greater, x.box_cmp(y) == Ordering::Equal];
            assert_eq!(matches.iter().filter(|m| **m).count(), 1);
        }
    }
}
