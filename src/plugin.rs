//! The five-request compile plug-in contract.
//!
//! A plug-in answers "how do I compile this name / operator / cast?"
//! queries raised while assembling the AST. The compiler tries each
//! registered plug-in in priority order and stops at the first one that
//! answers; if none does, a typed "not found" exception is raised.

use std::rc::Rc;

use crate::program::Callback;
use crate::scope::Scope;
use crate::types::TypeTag;
use crate::value::Value;

/// One argument as seen by a plug-in: its declared (sample) type, and,
/// when known at compile time, the constant value itself.
#[derive(Debug, Clone)]
pub struct ArgInfo {
    pub sample: Value,
    pub const_value: Option<Value>,
}

impl ArgInfo {
    pub fn constant(value: Value) -> Self {
        ArgInfo {
            sample: value.clone(),
            const_value: Some(value),
        }
    }

    pub fn runtime(sample: Value) -> Self {
        ArgInfo { sample, const_value: None }
    }

    pub fn tag(&self) -> TypeTag {
        self.sample.tag()
    }

    pub fn is_const(&self) -> bool {
        self.const_value.is_some()
    }
}

/// The request bundle passed to every `try_*` method: the operator/function
/// name and the sample-box (plus constness) of each argument.
pub struct CompileInfo<'a> {
    pub name: &'a str,
    pub args: &'a [ArgInfo],
}

impl<'a> CompileInfo<'a> {
    pub fn new(name: &'a str, args: &'a [ArgInfo]) -> Self {
        CompileInfo { name, args }
    }

    pub fn all_const(&self) -> bool {
        self.args.iter().all(ArgInfo::is_const)
    }
}

/// What a plug-in hands back in its out-slots when it accepts a request: a
/// runtime callback plus its result type and diagnostic name, and whether
/// the callback is safe to invoke during compilation for constant folding.
#[derive(Clone)]
pub struct PluginCallback {
    pub callback: Callback,
    pub result_type: TypeTag,
    pub debug_name: Rc<str>,
    pub compile_time_invokable: bool,
}

/// Either out-slot a plug-in may fill: an inlined constant value, or a
/// runtime callback to emit as `CALL_*`.
pub enum Resolution {
    Constant(Value),
    Callback(PluginCallback),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasKind {
    Unary,
    Binary,
}

/// A content library answering compile-time queries. The built-in
/// arithmetic/string/comparison library ships as `calculus::arithmetic`,
/// built on top of [`crate::calculus::Calculus`]; hosts may register
/// additional plug-ins at any priority via `Compiler::add_plugin`.
pub trait CompilePlugin {
    fn try_function(&self, _info: &CompileInfo) -> Option<Resolution> {
        None
    }

    fn try_unary_op(&self, _info: &CompileInfo) -> Option<Resolution> {
        None
    }

    fn try_binary_op(&self, _info: &CompileInfo) -> Option<Resolution> {
        None
    }

    /// Auto-cast from `from`'s type to `to`. Returns a constant when `from`
    /// is itself constant and the cast is cheap enough to fold, otherwise a
    /// callback.
    fn try_auto_cast(&self, _from: &Value, _to: TypeTag) -> Option<Resolution> {
        None
    }

    /// Rewrites a verbal or shadow operator name into its canonical symbolic
    /// form for the given operand type(s). `arg_types` has length 1 for
    /// unary, 2 for binary.
    fn try_alias(&self, _kind: AliasKind, _name: &str, _arg_types: &[TypeTag]) -> Option<String> {
        None
    }

    /// Consulted when the left operand of a binary operator is constant.
    /// Returning `Some` collapses the whole node to either a literal or
    /// (via `FoldResult::OtherSide`) the right-hand subtree, generically
    /// implementing rules like `true && x` → `x`.
    fn try_const_lhs_fold(&self, _op: &str, _lhs: &Value, _rhs_sample: &Value) -> Option<FoldResult> {
        None
    }

    /// Symmetric counterpart consulted when the right operand is constant.
    fn try_const_rhs_fold(&self, _op: &str, _lhs_sample: &Value, _rhs: &Value) -> Option<FoldResult> {
        None
    }

    /// Plug-ins are tried in descending priority order; ties keep insertion
    /// order. Built-ins register at priority 0 unless stated otherwise.
    fn priority(&self) -> i32 {
        0
    }
}

/// Outcome of a const-LHS/const-RHS optimization lookup.
#[derive(Debug, Clone)]
pub enum FoldResult {
    Literal(Value),
    OtherSide,
}

/// A priority-ordered chain of plug-ins, tried front-to-back.
#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<Box<dyn CompilePlugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        PluginChain { plugins: Vec::new() }
    }

    /// Inserts `plugin` keeping the chain sorted by descending priority;
    /// plug-ins with equal priority keep insertion order (stable sort).
    pub fn insert(&mut self, plugin: Box<dyn CompilePlugin>) {
        self.plugins.push(plugin);
        self.plugins.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    }

    pub fn try_function(&self, info: &CompileInfo) -> Option<Resolution> {
        self.plugins.iter().find_map(|p| p.try_function(info))
    }

    pub fn try_unary_op(&self, info: &CompileInfo) -> Option<Resolution> {
        self.plugins.iter().find_map(|p| p.try_unary_op(info))
    }

    pub fn try_binary_op(&self, info: &CompileInfo) -> Option<Resolution> {
        self.plugins.iter().find_map(|p| p.try_binary_op(info))
    }

    pub fn try_auto_cast(&self, from: &Value, to: TypeTag) -> Option<Resolution> {
        self.plugins.iter().find_map(|p| p.try_auto_cast(from, to))
    }

    pub fn try_alias(&self, kind: AliasKind, name: &str, arg_types: &[TypeTag]) -> Option<String> {
        self.plugins.iter().find_map(|p| p.try_alias(kind, name, arg_types))
    }

    pub fn try_const_lhs_fold(&self, op: &str, lhs: &Value, rhs_sample: &Value) -> Option<FoldResult> {
        self.plugins.iter().find_map(|p| p.try_const_lhs_fold(op, lhs, rhs_sample))
    }

    pub fn try_const_rhs_fold(&self, op: &str, lhs_sample: &Value, rhs: &Value) -> Option<FoldResult> {
        self.plugins.iter().find_map(|p| p.try_const_rhs_fold(op, lhs_sample, rhs))
    }
}
