//! Table-driven plug-in helper ("Calculus"): turns static tables of
//! constant/function/operator entries into a live [`CompilePlugin`], plus
//! constant-folding shortcut tables for binary operators.
//!
//! `calculus::arithmetic()` builds the one reference content library this
//! crate ships (numeric/string/boolean operators and a couple of built-in
//! functions), serving as both a worked example and a test fixture — it is
//! deliberately not an exhaustive standard library.

use ahash::AHashMap;

use crate::plugin::{ArgInfo, CompileInfo, CompilePlugin, FoldResult, PluginCallback, Resolution};
use crate::program::Callback;
use crate::types::{self, TypeTag};
use crate::value::Value;

/// A pre-registered name that always resolves to the same constant,
/// matched via the token-abbreviation rule below.
pub struct ConstantEntry {
    pub name: &'static str,
    pub min_len: usize,
    pub case_sensitive: bool,
    pub value: Value,
}

/// `None` signature entries match any arity; `Some(types)` requires an exact
/// arity and per-position type match, except that the *last* entry may be
/// marked variadic, in which case it matches zero or more trailing
/// arguments of that type.
pub struct FunctionEntry {
    pub name: &'static str,
    pub fixed: Vec<TypeTag>,
    pub variadic_tail: Option<TypeTag>,
    pub callback: Callback,
    pub result_type: TypeTag,
    pub compile_time_invokable: bool,
}

#[derive(Clone)]
pub struct OperatorEntry {
    pub callback: Callback,
    pub result_type: TypeTag,
    pub compile_time_invokable: bool,
    pub debug_name: &'static str,
}

/// Matches the Calculus token-abbreviation rule: `candidate` matches
/// `declared` iff it is at least `min_len` bytes long and is a (case
/// appropriate) prefix of `declared`.
pub fn abbreviation_matches(candidate: &str, declared: &str, min_len: usize, case_sensitive: bool) -> bool {
    if candidate.len() < min_len || candidate.len() > declared.len() {
        return false;
    }
    if case_sensitive {
        declared.starts_with(candidate)
    } else {
        declared.to_ascii_lowercase().starts_with(&candidate.to_ascii_lowercase())
    }
}

#[derive(Default)]
pub struct Calculus {
    constants: Vec<ConstantEntry>,
    functions: Vec<FunctionEntry>,
    unary_ops: AHashMap<(String, TypeTag), OperatorEntry>,
    binary_ops: AHashMap<(String, TypeTag, TypeTag), OperatorEntry>,
    unary_aliases: AHashMap<(String, TypeTag), String>,
    binary_aliases: AHashMap<(String, TypeTag, TypeTag), String>,
    const_lhs_opt: AHashMap<(String, TypeTag), Vec<(Value, Option<Value>)>>,
    const_rhs_opt: AHashMap<(String, TypeTag), Vec<(Value, Option<Value>)>>,
}

impl Calculus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constant(&mut self, entry: ConstantEntry) -> &mut Self {
        self.constants.push(entry);
        self
    }

    pub fn add_function(&mut self, entry: FunctionEntry) -> &mut Self {
        self.functions.push(entry);
        self
    }

    pub fn add_unary_op(&mut self, op: impl Into<String>, operand: TypeTag, entry: OperatorEntry) -> &mut Self {
        self.unary_ops.insert((op.into(), operand), entry);
        self
    }

    pub fn add_binary_op(&mut self, op: impl Into<String>, lhs: TypeTag, rhs: TypeTag, entry: OperatorEntry) -> &mut Self {
        self.binary_ops.insert((op.into(), lhs, rhs), entry);
        self
    }

    pub fn add_unary_alias(&mut self, alias: impl Into<String>, operand: TypeTag, canonical: impl Into<String>) -> &mut Self {
        self.unary_aliases.insert((alias.into(), operand), canonical.into());
        self
    }

    pub fn add_binary_alias(&mut self, alias: impl Into<String>, lhs: TypeTag, rhs: TypeTag, canonical: impl Into<String>) -> &mut Self {
        self.binary_aliases.insert((alias.into(), lhs, rhs), canonical.into());
        self
    }

    /// `replacement = None` means "result equals the non-constant argument"
    /// (e.g. `x && true` → `x`); `Some(v)` means "result is the literal `v`"
    /// (e.g. `x && false` → `false`).
    pub fn add_const_lhs_optimization(&mut self, op: impl Into<String>, rhs_type: TypeTag, const_lhs: Value, replacement: Option<Value>) -> &mut Self {
        self.const_lhs_opt.entry((op.into(), rhs_type)).or_default().push((const_lhs, replacement));
        self
    }

    pub fn add_const_rhs_optimization(&mut self, op: impl Into<String>, lhs_type: TypeTag, const_rhs: Value, replacement: Option<Value>) -> &mut Self {
        self.const_rhs_opt.entry((op.into(), lhs_type)).or_default().push((const_rhs, replacement));
        self
    }

    pub fn has_unary_op(&self, op: &str, operand: TypeTag) -> bool {
        self.unary_ops.contains_key(&(op.to_string(), operand))
    }

    pub fn has_binary_op(&self, op: &str, lhs: TypeTag, rhs: TypeTag) -> bool {
        self.binary_ops.contains_key(&(op.to_string(), lhs, rhs))
    }

    fn match_function<'a>(&'a self, name: &str, args: &[ArgInfo]) -> Option<&'a FunctionEntry> {
        self.functions.iter().find(|f| {
            if f.name != name {
                return false;
            }
            match &f.variadic_tail {
                None => f.fixed.len() == args.len() && f.fixed.iter().zip(args).all(|(t, a)| *t == a.tag()),
                Some(tail) => {
                    if args.len() < f.fixed.len() {
                        return false;
                    }
                    let (head, rest) = args.split_at(f.fixed.len());
                    f.fixed.iter().zip(head).all(|(t, a)| *t == a.tag()) && rest.iter().all(|a| a.tag() == *tail)
                }
            }
        })
    }
}

impl CompilePlugin for Calculus {
    fn try_function(&self, info: &CompileInfo) -> Option<Resolution> {
        if info.args.is_empty() {
            if let Some(entry) = self
                .constants
                .iter()
                .find(|c| abbreviation_matches(info.name, c.name, c.min_len, c.case_sensitive))
            {
                return Some(Resolution::Constant(entry.value.clone()));
            }
        }
        let entry = self.match_function(info.name, info.args)?;
        Some(Resolution::Callback(PluginCallback {
            callback: entry.callback.clone(),
            result_type: entry.result_type,
            debug_name: entry.name.into(),
            compile_time_invokable: entry.compile_time_invokable,
        }))
    }

    fn try_unary_op(&self, info: &CompileInfo) -> Option<Resolution> {
        let operand = info.args.first()?.tag();
        let entry = self.unary_ops.get(&(info.name.to_string(), operand))?;
        Some(Resolution::Callback(PluginCallback {
            callback: entry.callback.clone(),
            result_type: entry.result_type,
            debug_name: entry.debug_name.into(),
            compile_time_invokable: entry.compile_time_invokable,
        }))
    }

    fn try_binary_op(&self, info: &CompileInfo) -> Option<Resolution> {
        let lhs = info.args.first()?.tag();
        let rhs = info.args.get(1)?.tag();
        let entry = self.binary_ops.get(&(info.name.to_string(), lhs, rhs))?;
        Some(Resolution::Callback(PluginCallback {
            callback: entry.callback.clone(),
            result_type: entry.result_type,
            debug_name: entry.debug_name.into(),
            compile_time_invokable: entry.compile_time_invokable,
        }))
    }

    fn try_alias(&self, kind: crate::plugin::AliasKind, name: &str, arg_types: &[TypeTag]) -> Option<String> {
        match kind {
            crate::plugin::AliasKind::Unary => self.unary_aliases.get(&(name.to_string(), *arg_types.first()?)).cloned(),
            crate::plugin::AliasKind::Binary => self
                .binary_aliases
                .get(&(name.to_string(), *arg_types.first()?, *arg_types.get(1)?))
                .cloned(),
        }
    }

    fn try_const_lhs_fold(&self, op: &str, lhs: &Value, rhs_sample: &Value) -> Option<FoldResult> {
        let table = self.const_lhs_opt.get(&(op.to_string(), rhs_sample.tag()))?;
        let (_, replacement) = table.iter().find(|(v, _)| v.box_eq(lhs))?;
        Some(match replacement {
            Some(v) => FoldResult::Literal(v.clone()),
            None => FoldResult::OtherSide,
        })
    }

    fn try_const_rhs_fold(&self, op: &str, lhs_sample: &Value, rhs: &Value) -> Option<FoldResult> {
        let table = self.const_rhs_opt.get(&(op.to_string(), lhs_sample.tag()))?;
        let (_, replacement) = table.iter().find(|(v, _)| v.box_eq(rhs))?;
        Some(match replacement {
            Some(v) => FoldResult::Literal(v.clone()),
            None => FoldResult::OtherSide,
        })
    }
}

/// Builds the reference arithmetic/string/boolean content library: `+ - * /
/// % == != < <= > >=` over int/float/string as applicable, `&& ||` over
/// bool with their standard short-circuit optimizations, and a `Format`
/// function delegating to the scope's formatter.
pub fn arithmetic() -> Calculus {
    use std::rc::Rc;

    let mut c = Calculus::new();

    c.add_constant(ConstantEntry {
        name: "true",
        min_len: 4,
        case_sensitive: false,
        value: Value::from_bool(true),
    });
    c.add_constant(ConstantEntry {
        name: "false",
        min_len: 5,
        case_sensitive: false,
        value: Value::from_bool(false),
    });
    c.add_constant(ConstantEntry {
        name: "null",
        min_len: 4,
        case_sensitive: false,
        value: Value::null(),
    });

    macro_rules! int_binop {
        ($op:literal, $debug:literal, $f:expr) => {
            c.add_binary_op(
                $op,
                types::INT,
                types::INT,
                OperatorEntry {
                    callback: Rc::new(|_scope, args: &[Value]| {
                        let a = args[0].unbox::<i64>().expect("int lhs");
                        let b = args[1].unbox::<i64>().expect("int rhs");
                        $f(a, b)
                    }),
                    result_type: types::INT,
                    compile_time_invokable: true,
                    debug_name: $debug,
                },
            );
        };
    }

    int_binop!("+", "+", |a: i64, b: i64| Ok(Value::from_int(a.wrapping_add(b))));
    int_binop!("-", "-", |a: i64, b: i64| Ok(Value::from_int(a.wrapping_sub(b))));
    int_binop!("*", "*", |a: i64, b: i64| Ok(Value::from_int(a.wrapping_mul(b))));

    c.add_binary_op(
        "/",
        types::INT,
        types::INT,
        OperatorEntry {
            callback: Rc::new(|_scope, args: &[Value]| {
                let a = args[0].unbox::<i64>().expect("int lhs");
                let b = args[1].unbox::<i64>().expect("int rhs");
                if b == 0 {
                    return Err(crate::error::EvalError::Domain {
                        message: "division by zero".into(),
                    });
                }
                Ok(Value::from_int(a / b))
            }),
            result_type: types::INT,
            compile_time_invokable: true,
            debug_name: "/",
        },
    );

    macro_rules! cmp_binop {
        ($ty:expr, $unbox:ty, $op:literal, $f:expr) => {
            c.add_binary_op(
                $op,
                $ty,
                $ty,
                OperatorEntry {
                    callback: Rc::new(|_scope, args: &[Value]| {
                        let a = args[0].unbox::<$unbox>().expect("lhs");
                        let b = args[1].unbox::<$unbox>().expect("rhs");
                        Ok(Value::from_bool($f(a, b)))
                    }),
                    result_type: types::BOOL,
                    compile_time_invokable: true,
                    debug_name: $op,
                },
            );
        };
    }

    cmp_binop!(types::INT, i64, "==", |a: i64, b: i64| a == b);
    cmp_binop!(types::INT, i64, "!=", |a: i64, b: i64| a != b);
    cmp_binop!(types::INT, i64, "<", |a: i64, b: i64| a < b);
    cmp_binop!(types::INT, i64, "<=", |a: i64, b: i64| a <= b);
    cmp_binop!(types::INT, i64, ">", |a: i64, b: i64| a > b);
    cmp_binop!(types::INT, i64, ">=", |a: i64, b: i64| a >= b);

    c.add_binary_op(
        "&&",
        types::BOOL,
        types::BOOL,
        OperatorEntry {
            callback: Rc::new(|_scope, args: &[Value]| Ok(Value::from_bool(args[0].is_true() && args[1].is_true()))),
            result_type: types::BOOL,
            compile_time_invokable: true,
            debug_name: "&&",
        },
    );
    c.add_binary_op(
        "||",
        types::BOOL,
        types::BOOL,
        OperatorEntry {
            callback: Rc::new(|_scope, args: &[Value]| Ok(Value::from_bool(args[0].is_true() || args[1].is_true()))),
            result_type: types::BOOL,
            compile_time_invokable: true,
            debug_name: "||",
        },
    );

    c.add_unary_op(
        "!",
        types::BOOL,
        OperatorEntry {
            callback: Rc::new(|_scope, args: &[Value]| Ok(Value::from_bool(!args[0].is_true()))),
            result_type: types::BOOL,
            compile_time_invokable: true,
            debug_name: "!",
        },
    );
    c.add_unary_op(
        "-",
        types::INT,
        OperatorEntry {
            callback: Rc::new(|_scope, args: &[Value]| Ok(Value::from_int(-args[0].unbox::<i64>().expect("int operand")))),
            result_type: types::INT,
            compile_time_invokable: true,
            debug_name: "-",
        },
    );

    c.add_unary_alias("not", types::BOOL, "!");
    c.add_binary_alias("and", types::BOOL, types::BOOL, "&&");
    c.add_binary_alias("or", types::BOOL, types::BOOL, "||");
    c.add_binary_alias("equals", types::INT, types::INT, "==");
    c.add_binary_alias("not_equals", types::INT, types::INT, "!=");
    c.add_binary_alias("less", types::INT, types::INT, "<");

    c.add_const_lhs_optimization("&&", types::BOOL, Value::from_bool(false), Some(Value::from_bool(false)));
    c.add_const_lhs_optimization("&&", types::BOOL, Value::from_bool(true), None);
    c.add_const_lhs_optimization("||", types::BOOL, Value::from_bool(true), Some(Value::from_bool(true)));
    c.add_const_lhs_optimization("||", types::BOOL, Value::from_bool(false), None);
    c.add_const_lhs_optimization("+", types::INT, Value::from_int(0), None);
    c.add_const_rhs_optimization("+", types::INT, Value::from_int(0), None);
    c.add_const_rhs_optimization("-", types::INT, Value::from_int(0), None);
    c.add_const_lhs_optimization("*", types::INT, Value::from_int(1), None);
    c.add_const_rhs_optimization("*", types::INT, Value::from_int(1), None);
    c.add_const_rhs_optimization("&&", types::BOOL, Value::from_bool(true), None);
    c.add_const_rhs_optimization("&&", types::BOOL, Value::from_bool(false), Some(Value::from_bool(false)));
    c.add_const_rhs_optimization("||", types::BOOL, Value::from_bool(false), None);
    c.add_const_rhs_optimization("||", types::BOOL, Value::from_bool(true), Some(Value::from_bool(true)));

    c.add_function(FunctionEntry {
        name: "Format",
        fixed: vec![types::STRING],
        variadic_tail: Some(types::INT),
        callback: Rc::new(|scope, args: &[Value]| Ok(Value::from_str(scope.formatter().format(&args[0].to_display_string(), &args[1..])))),
        result_type: types::STRING,
        compile_time_invokable: true,
    });

    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{compile_time_scope, SimpleFormatter};
    use std::rc::Rc;

    #[test]
    fn abbreviation_rule_respects_min_length_and_case() {
        assert!(abbreviation_matches("tru", "true", 2, false));
        assert!(!abbreviation_matches("t", "true", 2, false));
        assert!(!abbreviation_matches("TRU", "true", 2, true));
        assert!(abbreviation_matches("TRU", "true", 2, false));
    }

    #[test]
    fn constant_identifier_resolves_via_abbreviation() {
        let mut c = Calculus::new();
        c.add_constant(ConstantEntry {
            name: "true",
            min_len: 2,
            case_sensitive: false,
            value: Value::from_bool(true),
        });
        let info = CompileInfo::new("tru", &[]);
        match c.try_function(&info) {
            Some(Resolution::Constant(v)) => assert_eq!(v, Value::from_bool(true)),
            _ => panic!("expected constant resolution"),
        }
    }

    #[test]
    fn variadic_function_matches_any_trailing_arity() {
        let calc = arithmetic();
        let args = vec![ArgInfo::constant(Value::from_str("Result: {}")), ArgInfo::constant(Value::from_int(6))];
        let info = CompileInfo::new("Format", &args);
        assert!(calc.try_function(&info).is_some());
    }

    #[test]
    fn format_function_invokes_scope_formatter() {
        let calc = arithmetic();
        let args = vec![ArgInfo::constant(Value::from_str("Result: {}")), ArgInfo::constant(Value::from_int(6))];
        let info = CompileInfo::new("Format", &args);
        let Some(Resolution::Callback(pc)) = calc.try_function(&info) else {
            panic!("expected callback resolution");
        };
        let mut scope = compile_time_scope(Rc::new(SimpleFormatter));
        let values: Vec<Value> = args.into_iter().map(|a| a.const_value.unwrap()).collect();
        let result = (pc.callback)(&mut scope, &values).unwrap();
        assert_eq!(result, Value::from_str("Result: 6"));
    }

    #[test]
    fn const_lhs_fold_and_false_short_circuits() {
        let calc = arithmetic();
        let lhs = Value::from_bool(false);
        let rhs_sample = Value::from_bool(true);
        match calc.try_const_lhs_fold("&&", &lhs, &rhs_sample) {
            Some(FoldResult::Literal(v)) => assert_eq!(v, Value::from_bool(false)),
            other => panic!("expected Literal(false), got {other:?}"),
        }
    }

    #[test]
    fn const_rhs_fold_plus_zero_propagates_other_side() {
        let calc = arithmetic();
        let lhs_sample = Value::from_int(0);
        let rhs = Value::from_int(0);
        assert!(matches!(calc.try_const_rhs_fold("+", &lhs_sample, &rhs), Some(FoldResult::OtherSide)));
    }

    #[test]
    fn division_by_zero_is_a_domain_error_not_an_internal_vm_error() {
        let calc = arithmetic();
        let args = vec![ArgInfo::constant(Value::from_int(1)), ArgInfo::constant(Value::from_int(0))];
        let info = CompileInfo::new("/", &args);
        let Some(Resolution::Callback(pc)) = calc.try_binary_op(&info) else {
            panic!("expected callback resolution for '/'");
        };
        let mut scope = compile_time_scope(Rc::new(SimpleFormatter));
        let values: Vec<Value> = args.into_iter().map(|a| a.const_value.unwrap()).collect();
        let err = (pc.callback)(&mut scope, &values).unwrap_err();
        assert!(matches!(err, crate::error::EvalError::Domain { .. }));
    }
}
