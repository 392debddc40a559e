//! The `Compiler`: owns the parse-level operator tables, the plug-in chain,
//! the named-expression registry, and the `compile(text) -> Expression`
//! entry point that drives scan -> parse -> optimize -> resolve -> emit.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use bumpalo::Bump;
use tracing::{debug, warn};

use crate::ast::Ast;
use crate::calculus::{self, Calculus, OperatorEntry};
use crate::error::{CompileError, EvalError};
use crate::flags::{CompileFlags, NormalizationFlags};
use crate::parser::{self, ParserConfig};
use crate::plugin::{AliasKind, ArgInfo, CompileInfo, CompilePlugin, FoldResult, PluginCallback, PluginChain, Resolution};
use crate::program::{Callback, ProgramBuilder, SourceSpan};
use crate::scope::{compile_time_scope, Formatter, Scope, SimpleFormatter};
use crate::types::{self, TypeRegistry, TypeTag};
use crate::value::Value;
use crate::vm;

/// Operator/function juxtapositions that must never appear unseparated in
/// normalized source text, since they would re-tokenize as a different
/// operator on a later pass.
const FORBIDDEN_SUBSTRINGS: &[&str] = &["--", "++", "**", "//"];

#[derive(Clone, Copy)]
enum CallKind {
    Function,
    Unary,
    Binary,
}

/// Fully resolved node: every identifier/operator/function has already been
/// matched against a plug-in, and every constant-foldable subtree has
/// already collapsed to a `Const`. Emission from this tree never consults a
/// plug-in again.
enum Resolved {
    Const(Value, usize),
    Call {
        pc: PluginCallback,
        args: Vec<Resolved>,
        kind: CallKind,
        pos: usize,
    },
    Nested {
        name_arg: Box<Resolved>,
        default_arg: Box<Resolved>,
        throw: bool,
        declared_type: TypeTag,
        pos: usize,
    },
    Ternary {
        cond: Box<Resolved>,
        then_b: Box<Resolved>,
        else_b: Box<Resolved>,
        pos: usize,
    },
}

impl Resolved {
    fn tag(&self) -> TypeTag {
        match self {
            Resolved::Const(v, _) => v.tag(),
            Resolved::Call { pc, .. } => pc.result_type,
            Resolved::Nested { declared_type, .. } => *declared_type,
            Resolved::Ternary { then_b, .. } => then_b.tag(),
        }
    }

    fn pos(&self) -> usize {
        match self {
            Resolved::Const(_, pos) | Resolved::Call { pos, .. } | Resolved::Nested { pos, .. } | Resolved::Ternary { pos, .. } => *pos,
        }
    }

    /// A stand-in box usable where only the *type* matters: the real value
    /// if this node already folded to one, otherwise the type registry's
    /// sample for its declared result type.
    fn sample(&self) -> Value {
        match self {
            Resolved::Const(v, _) => v.clone(),
            other => TypeRegistry::sample(other.tag()),
        }
    }
}

/// The central compiler: holds the parse-level operator/precedence tables
/// (consulted by the scanner and parser, never by plug-ins) plus the
/// plug-in chain (consulted only during resolution). Parse-level tables and
/// plug-in-level implementations are kept separate by design — see
/// `DESIGN.md`.
pub struct Compiler {
    operators: Vec<String>,
    verbal_aliases: AHashSet<String>,
    precedence: AHashMap<String, u8>,
    unary_ops: AHashSet<String>,
    custom: Calculus,
    chain: PluginChain,
    compile_flags: CompileFlags,
    normalization_flags: NormalizationFlags,
    nested_fn_name: String,
    nested_op_symbol: String,
    throw_sentinel: String,
    named: Rc<RefCell<AHashMap<String, Rc<Expression>>>>,
    reentry_guard: Rc<RefCell<AHashSet<Box<str>>>>,
    formatter: Rc<dyn Formatter>,
}

impl Compiler {
    /// A compiler seeded with the standard operator set (`+ - * / % == != <
    /// <= > >= && || !`, integer/boolean arithmetic via
    /// [`crate::calculus::arithmetic`]) and the default flags.
    pub fn new() -> Self {
        let mut precedence = AHashMap::new();
        for (op, prec) in [
            ("||", 1u8),
            ("&&", 2),
            ("==", 3),
            ("!=", 3),
            ("<", 4),
            ("<=", 4),
            (">", 4),
            (">=", 4),
            ("+", 5),
            ("-", 5),
            ("*", 6),
            ("/", 6),
            ("%", 6),
            // Verbal spellings parse at the same precedence as the symbol
            // they alias to; `try_alias` rewrites the name during resolution.
            ("or", 1),
            ("and", 2),
            ("equals", 3),
            ("not_equals", 3),
            ("less", 4),
        ] {
            precedence.insert(op.to_string(), prec);
        }
        let unary_ops: AHashSet<String> = ["-", "+", "!", "not"].iter().map(|s| s.to_string()).collect();
        let verbal_aliases: AHashSet<String> = ["and", "or", "not", "equals", "not_equals", "less"].iter().map(|s| s.to_string()).collect();

        Compiler {
            operators: crate::scanner::DEFAULT_OPERATORS.iter().map(|s| s.to_string()).collect(),
            verbal_aliases,
            precedence,
            unary_ops,
            custom: Calculus::new(),
            chain: {
                let mut chain = PluginChain::new();
                chain.insert(Box::new(calculus::arithmetic()));
                chain
            },
            compile_flags: CompileFlags::default(),
            normalization_flags: NormalizationFlags::default(),
            nested_fn_name: "Expression".to_string(),
            nested_op_symbol: "*".to_string(),
            throw_sentinel: "throw".to_string(),
            named: Rc::new(RefCell::new(AHashMap::new())),
            reentry_guard: Rc::new(RefCell::new(AHashSet::new())),
            formatter: Rc::new(SimpleFormatter),
        }
    }

    pub fn set_compile_flags(&mut self, flags: CompileFlags) {
        self.compile_flags = flags;
    }

    pub fn set_normalization_flags(&mut self, flags: NormalizationFlags) {
        self.normalization_flags = flags;
    }

    pub fn set_formatter(&mut self, formatter: Rc<dyn Formatter>) {
        self.formatter = formatter;
    }

    pub fn add_plugin(&mut self, plugin: Box<dyn CompilePlugin>) {
        self.chain.insert(plugin);
    }

    pub fn add_type(&mut self, name: &'static str, sample: Value) -> TypeTag {
        TypeRegistry::register(name, sample)
    }

    pub fn type_name(&self, tag: TypeTag) -> &'static str {
        TypeRegistry::name(tag)
    }

    pub fn add_named(&mut self, name: impl Into<String>, expression: Expression) {
        self.named.borrow_mut().insert(name.into(), Rc::new(expression));
    }

    pub fn remove_named(&mut self, name: &str) -> bool {
        self.named.borrow_mut().remove(name).is_some()
    }

    pub fn get_named(&self, name: &str) -> Option<Rc<Expression>> {
        self.named.borrow().get(name).cloned()
    }

    /// Registers a new binary operator symbol at the given parse precedence.
    /// Rejects a symbol already bound to a different precedence, or already
    /// implemented for the same operand-type pair (an Open Question in the
    /// design notes, resolved toward strict rejection rather than silent
    /// override).
    pub fn add_binary_operator(&mut self, symbol: &str, precedence: u8, lhs: TypeTag, rhs: TypeTag, entry: OperatorEntry) -> Result<(), CompileError> {
        if let Some(&existing) = self.precedence.get(symbol) {
            if existing != precedence {
                return Err(CompileError::OperatorAlreadyDefined { symbol: symbol.to_string() });
            }
        } else {
            self.precedence.insert(symbol.to_string(), precedence);
            self.register_operator_symbol(symbol);
        }
        if self.custom.has_binary_op(symbol, lhs, rhs) {
            return Err(CompileError::OperatorAlreadyDefined { symbol: symbol.to_string() });
        }
        self.custom.add_binary_op(symbol, lhs, rhs, entry);
        Ok(())
    }

    pub fn add_unary_operator(&mut self, symbol: &str, operand: TypeTag, entry: OperatorEntry) -> Result<(), CompileError> {
        if self.custom.has_unary_op(symbol, operand) {
            return Err(CompileError::OperatorAlreadyDefined { symbol: symbol.to_string() });
        }
        self.unary_ops.insert(symbol.to_string());
        self.register_operator_symbol(symbol);
        self.custom.add_unary_op(symbol, operand, entry);
        Ok(())
    }

    pub fn add_unary_alias(&mut self, alias: impl Into<String>, operand: TypeTag, canonical: impl Into<String>) {
        let alias = alias.into();
        self.verbal_aliases.insert(alias.clone());
        self.unary_ops.insert(alias.clone());
        self.custom.add_unary_alias(alias, operand, canonical);
    }

    pub fn add_binary_alias(&mut self, alias: impl Into<String>, lhs: TypeTag, rhs: TypeTag, canonical: impl Into<String>) {
        let alias = alias.into();
        self.verbal_aliases.insert(alias.clone());
        self.custom.add_binary_alias(alias, lhs, rhs, canonical);
    }

    fn register_operator_symbol(&mut self, symbol: &str) {
        if self.operators.iter().any(|o| o == symbol) {
            return;
        }
        self.operators.push(symbol.to_string());
        self.operators.sort_by_key(|o| std::cmp::Reverse(o.len()));
    }

    /// Parses, optimizes, resolves and emits `text`, producing a compiled
    /// [`Expression`]. This is the single entry point driving the whole
    /// pipeline.
    pub fn compile(&self, text: &str) -> Result<Expression, CompileError> {
        match self.compile_inner(text) {
            Ok(expr) => {
                debug!(len = text.len(), result_type = self.type_name(expr.result_type()), "expression compiled");
                Ok(expr)
            }
            Err(e) => {
                warn!(error = %e, "expression compilation failed");
                Err(e)
            }
        }
    }

    fn compile_inner(&self, text: &str) -> Result<Expression, CompileError> {
        let operators: Vec<&str> = self.operators.iter().map(String::as_str).collect();
        let config = ParserConfig {
            operators: &operators,
            verbal_aliases: &self.verbal_aliases,
            precedence: &self.precedence,
            unary_ops: &self.unary_ops,
            nested_fn_name: &self.nested_fn_name,
            nested_op_symbol: &self.nested_op_symbol,
            throw_sentinel: &self.throw_sentinel,
            flags: self.compile_flags,
        };

        let bump = Bump::new();
        let ast = parser::parse(text, &config, &bump)?;
        let ast = ast.optimize(self.compile_flags, &bump);

        let resolved = self.resolve(ast)?;

        let mut builder = ProgramBuilder::new();
        let since = builder.normalized_offset();
        self.render(ast, &mut builder);
        builder.guard_forbidden_substrings(since, FORBIDDEN_SUBSTRINGS);

        self.emit(&resolved, &mut builder);
        let result_type = resolved.tag();
        Ok(Expression {
            program: builder.build(result_type),
        })
    }

    // -- resolution --------------------------------------------------

    fn resolve(&self, node: &Ast) -> Result<Resolved, CompileError> {
        match node {
            Ast::Literal { value, pos, .. } => Ok(Resolved::Const(value.clone(), *pos)),
            Ast::Identifier { name, pos } => self.resolve_call(name, Vec::new(), CallKind::Function, *pos),
            Ast::Function { name, args, pos } => {
                if *name == self.nested_fn_name {
                    return self.resolve_nested(args, *pos);
                }
                let resolved_args = args.iter().map(|a| self.resolve(a)).collect::<Result<Vec<_>, _>>()?;
                self.resolve_call(name, resolved_args, CallKind::Function, *pos)
            }
            Ast::UnaryOp { op, child, pos } => {
                let c = self.resolve(child)?;
                let canonical = self.resolve_alias(AliasKind::Unary, op, &[c.tag()]);
                self.resolve_call(&canonical, vec![c], CallKind::Unary, *pos)
            }
            Ast::BinaryOp { op, lhs, rhs, pos } => {
                let l = self.resolve(lhs)?;
                let r = self.resolve(rhs)?;
                let canonical = self.resolve_alias(AliasKind::Binary, op, &[l.tag(), r.tag()]);
                let optimizing = !self.compile_flags.contains(CompileFlags::NO_OPTIMIZATION);

                if optimizing {
                    if let Resolved::Const(lv, _) = &l {
                        if let Some(fold) = self.resolve_const_lhs_fold(&canonical, lv, &r.sample()) {
                            return Ok(match fold {
                                FoldResult::Literal(v) => Resolved::Const(v, *pos),
                                FoldResult::OtherSide => r,
                            });
                        }
                    }
                    if let Resolved::Const(rv, _) = &r {
                        if let Some(fold) = self.resolve_const_rhs_fold(&canonical, &l.sample(), rv) {
                            return Ok(match fold {
                                FoldResult::Literal(v) => Resolved::Const(v, *pos),
                                FoldResult::OtherSide => l,
                            });
                        }
                    }
                }
                self.resolve_call(&canonical, vec![l, r], CallKind::Binary, *pos)
            }
            Ast::Ternary {
                cond,
                then_branch,
                else_branch,
                q_pos,
                ..
            } => {
                let c = self.resolve(cond)?;
                let t = self.resolve(then_branch)?;
                let e = self.resolve(else_branch)?;
                if t.tag() != e.tag() {
                    return Err(CompileError::TypeMismatch {
                        pos: *q_pos,
                        context: "ternary branches".to_string(),
                        expected: TypeRegistry::name(t.tag()),
                        found: TypeRegistry::name(e.tag()),
                    });
                }
                if !self.compile_flags.contains(CompileFlags::NO_OPTIMIZATION) {
                    if let Resolved::Const(cv, _) = &c {
                        return Ok(if cv.is_true() { t } else { e });
                    }
                }
                Ok(Resolved::Ternary {
                    cond: Box::new(c),
                    then_b: Box::new(t),
                    else_b: Box::new(e),
                    pos: *q_pos,
                })
            }
        }
    }

    fn resolve_nested(&self, args: &[&Ast], pos: usize) -> Result<Resolved, CompileError> {
        if args.len() < 2 || args.len() > 3 {
            return Err(CompileError::NestedExpressionCallArgumentMismatch {
                pos,
                detail: format!("expected 2 or 3 arguments, found {}", args.len()),
            });
        }
        let name_arg = self.resolve(args[0])?;
        if name_arg.tag() != types::STRING {
            return Err(CompileError::TypeMismatch {
                pos: args[0].pos(),
                context: "nested expression name".to_string(),
                expected: "string",
                found: TypeRegistry::name(name_arg.tag()),
            });
        }
        let default_arg = self.resolve(args[1])?;
        let throw = if args.len() == 3 {
            match args[2] {
                Ast::Identifier { name, .. } if name == &self.throw_sentinel => true,
                other => {
                    return Err(CompileError::NestedExpressionCallArgumentMismatch {
                        pos: other.pos(),
                        detail: format!("expected bare '{}'", self.throw_sentinel),
                    })
                }
            }
        } else {
            false
        };
        let declared_type = default_arg.tag();
        Ok(Resolved::Nested {
            name_arg: Box::new(name_arg),
            default_arg: Box::new(default_arg),
            throw,
            declared_type,
            pos,
        })
    }

    fn resolve_call(&self, name: &str, mut args: Vec<Resolved>, kind: CallKind, pos: usize) -> Result<Resolved, CompileError> {
        let arg_infos: Vec<ArgInfo> = args
            .iter()
            .map(|a| match a {
                Resolved::Const(v, _) => ArgInfo::constant(v.clone()),
                other => ArgInfo::runtime(other.sample()),
            })
            .collect();
        let info = CompileInfo::new(name, &arg_infos);

        let resolution = match kind {
            CallKind::Function => self.custom.try_function(&info).or_else(|| self.chain.try_function(&info)),
            CallKind::Unary => self.custom.try_unary_op(&info).or_else(|| self.chain.try_unary_op(&info)),
            CallKind::Binary => self.custom.try_binary_op(&info).or_else(|| self.chain.try_binary_op(&info)),
        };

        let resolution = resolution.or_else(|| {
            if matches!(kind, CallKind::Unary | CallKind::Binary) {
                self.try_auto_cast_retry(name, &mut args, &arg_infos, kind)
            } else {
                None
            }
        });

        let Some(resolution) = resolution else {
            return Err(match kind {
                CallKind::Function if args.is_empty() => CompileError::UnknownIdentifier { pos, name: name.to_string() },
                CallKind::Function => CompileError::UnknownFunctionSignature {
                    pos,
                    name: name.to_string(),
                    arg_types: arg_infos.iter().map(|a| TypeRegistry::name(a.tag())).collect(),
                },
                CallKind::Unary | CallKind::Binary => CompileError::UnknownOperator {
                    pos,
                    symbol: name.to_string(),
                },
            });
        };

        match resolution {
            Resolution::Constant(v) => Ok(Resolved::Const(v, pos)),
            Resolution::Callback(pc) => {
                let optimizing = !self.compile_flags.contains(CompileFlags::NO_OPTIMIZATION);
                if optimizing && pc.compile_time_invokable && args.iter().all(|a| matches!(a, Resolved::Const(..))) {
                    let values: Vec<Value> = args
                        .iter()
                        .map(|a| match a {
                            Resolved::Const(v, _) => v.clone(),
                            _ => unreachable!("checked all-const above"),
                        })
                        .collect();
                    let mut scope = compile_time_scope(self.formatter.clone());
                    let folded = (pc.callback)(&mut scope, &values).map_err(|e: EvalError| CompileError::Syntax {
                        pos,
                        message: format!("constant folding of '{name}' failed: {e}"),
                    })?;
                    return Ok(Resolved::Const(folded, pos));
                }
                Ok(Resolved::Call { pc, args, kind, pos })
            }
        }
    }

    /// Last resort when no plug-in answers a unary/binary lookup directly:
    /// tries casting one operand (in place, mutating `args`/`arg_infos`) to a
    /// type the operator does accept — first to a sibling operand's type,
    /// then to each built-in scalar — and retries the lookup. Returns the
    /// retried resolution on the first operand/target combination that
    /// makes the operator resolve; leaves `args` untouched on failure.
    fn try_auto_cast_retry(&self, name: &str, args: &mut [Resolved], arg_infos: &[ArgInfo], kind: CallKind) -> Option<Resolution> {
        const FALLBACK_TARGETS: [TypeTag; 4] = [types::INT, types::FLOAT, types::STRING, types::BOOL];

        for i in 0..args.len() {
            let from_tag = arg_infos[i].tag();
            let mut targets: Vec<TypeTag> = arg_infos.iter().map(ArgInfo::tag).filter(|&t| t != from_tag).collect();
            targets.extend(FALLBACK_TARGETS.iter().copied().filter(|&t| t != from_tag));

            for to in targets {
                let sample = arg_infos[i].sample.clone();
                let Some(cast) = self.custom.try_auto_cast(&sample, to).or_else(|| self.chain.try_auto_cast(&sample, to)) else {
                    continue;
                };
                let Resolution::Callback(cast_pc) = cast else { continue };

                let mut retried_infos = arg_infos.to_vec();
                retried_infos[i] = ArgInfo::runtime(TypeRegistry::sample(to));
                let retried_info = CompileInfo::new(name, &retried_infos);
                let retried = match kind {
                    CallKind::Unary => self.custom.try_unary_op(&retried_info).or_else(|| self.chain.try_unary_op(&retried_info)),
                    CallKind::Binary => self.custom.try_binary_op(&retried_info).or_else(|| self.chain.try_binary_op(&retried_info)),
                    CallKind::Function => None,
                };
                let Some(resolution) = retried else { continue };

                let arg_pos = args[i].pos();
                let placeholder = Resolved::Const(Value::null(), arg_pos);
                let original = std::mem::replace(&mut args[i], placeholder);
                args[i] = Resolved::Call {
                    pc: cast_pc,
                    args: vec![original],
                    kind: CallKind::Unary,
                    pos: arg_pos,
                };
                return Some(resolution);
            }
        }
        None
    }

    fn resolve_alias(&self, kind: AliasKind, name: &str, arg_types: &[TypeTag]) -> String {
        self.custom
            .try_alias(kind, name, arg_types)
            .or_else(|| self.chain.try_alias(kind, name, arg_types))
            .unwrap_or_else(|| name.to_string())
    }

    fn resolve_const_lhs_fold(&self, op: &str, lhs: &Value, rhs_sample: &Value) -> Option<FoldResult> {
        self.custom.try_const_lhs_fold(op, lhs, rhs_sample).or_else(|| self.chain.try_const_lhs_fold(op, lhs, rhs_sample))
    }

    fn resolve_const_rhs_fold(&self, op: &str, lhs_sample: &Value, rhs: &Value) -> Option<FoldResult> {
        self.custom.try_const_rhs_fold(op, lhs_sample, rhs).or_else(|| self.chain.try_const_rhs_fold(op, lhs_sample, rhs))
    }

    // -- emission ------------------------------------------------------

    fn emit(&self, node: &Resolved, b: &mut ProgramBuilder) {
        match node {
            Resolved::Const(v, pos) => b.emit_push_constant(v.clone(), SourceSpan::point(*pos)),
            Resolved::Call { pc, args, kind, pos } => {
                for a in args {
                    self.emit(a, b);
                }
                let span = SourceSpan::point(*pos);
                match kind {
                    CallKind::Function => b.emit_call_function(pc.callback.clone(), args.len() as u8, pc.result_type, pc.debug_name.clone(), span),
                    CallKind::Unary => b.emit_call_unary(pc.callback.clone(), pc.result_type, pc.debug_name.clone(), span),
                    CallKind::Binary => b.emit_call_binary(pc.callback.clone(), pc.result_type, pc.debug_name.clone(), span),
                }
            }
            Resolved::Nested {
                name_arg,
                default_arg,
                throw,
                declared_type,
                pos,
            } => {
                self.emit(name_arg, b);
                self.emit(default_arg, b);
                let callback = self.nested_callback(*throw, *declared_type, *pos);
                let debug_name: Rc<str> = Rc::from(self.nested_fn_name.as_str());
                b.emit_call_function(callback, 2, *declared_type, debug_name, SourceSpan::point(*pos));
            }
            Resolved::Ternary { cond, then_b, else_b, pos } => {
                self.emit(cond, b);
                let jf = b.emit_jump_if_false(SourceSpan::point(*pos));
                self.emit(then_b, b);
                let skip = b.emit_jump(SourceSpan::point(*pos));
                b.patch_jump(jf);
                self.emit(else_b, b);
                b.patch_jump(skip);
            }
        }
    }

    /// Builds the `Expression(name, default[, throw])` call-site callback.
    /// Looks the named expression up, guarding against recursive cycles with
    /// a shared re-entrancy set, falling back to `default` unless `throw`.
    fn nested_callback(&self, throw: bool, declared_type: TypeTag, pos: usize) -> Callback {
        let named = Rc::clone(&self.named);
        let reentry = Rc::clone(&self.reentry_guard);
        Rc::new(move |scope: &mut Scope, args: &[Value]| {
            let name = args[0].unbox::<Rc<str>>().expect("nested-expression name resolved as string");
            let key: Box<str> = Box::from(name.as_ref());
            if !reentry.borrow_mut().insert(key.clone()) {
                return Err(EvalError::CircularNestedExpression {
                    pos,
                    name: name.to_string(),
                });
            }
            let result = (|| {
                let expr = named.borrow().get(name.as_ref()).cloned();
                match expr {
                    None => {
                        if throw {
                            Err(EvalError::NestedExpressionNotFound { pos, name: name.to_string() })
                        } else {
                            Ok(args[1].clone())
                        }
                    }
                    Some(expr) => {
                        let mut inner = Scope::new(scope.formatter_rc());
                        let value = vm::evaluate(&expr.program, &mut inner)?;
                        if value.tag() != declared_type {
                            return Err(EvalError::NestedExpressionResultTypeMismatch {
                                pos,
                                expected: TypeRegistry::name(declared_type),
                                found: TypeRegistry::name(value.tag()),
                            });
                        }
                        Ok(value)
                    }
                }
            })();
            reentry.borrow_mut().remove(&key);
            result
        })
    }

    // -- normalized text rendering --------------------------------------

    fn render(&self, node: &Ast, b: &mut ProgramBuilder) {
        let mut text = String::new();
        self.render_into(node, &mut text);
        b.push_normalized(&text);
    }

    fn render_into(&self, node: &Ast, out: &mut String) {
        match node {
            Ast::Literal { value, format, .. } => render_literal(value, *format, self.normalization_flags, out),
            Ast::Identifier { name, .. } => out.push_str(name),
            Ast::Function { name, args, .. } => {
                out.push_str(name);
                out.push('(');
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render_into(a, out);
                }
                out.push(')');
            }
            Ast::UnaryOp { op, child, .. } => {
                out.push_str(&self.normalized_operator(op));
                let needs_brackets = matches!(child, Ast::BinaryOp { .. } | Ast::Ternary { .. }) || self.normalization_flags.contains(NormalizationFlags::REDUNDANT_UNARY_BRACKETS);
                if needs_brackets {
                    out.push('(');
                    self.render_into(child, out);
                    out.push(')');
                } else {
                    self.render_into(child, out);
                }
            }
            Ast::BinaryOp { op, lhs, rhs, .. } => {
                if *op == "[]" {
                    self.render_into(lhs, out);
                    out.push('[');
                    self.render_into(rhs, out);
                    out.push(']');
                    return;
                }
                let prec = self.precedence.get(op).copied().unwrap_or(0);
                let sibling_is_binary = matches!(lhs, Ast::BinaryOp { op, .. } if op != "[]") && matches!(rhs, Ast::BinaryOp { op, .. } if op != "[]");
                self.render_operand(lhs, prec, false, sibling_is_binary, out);
                out.push(' ');
                out.push_str(&self.normalized_operator(op));
                out.push(' ');
                self.render_operand(rhs, prec, true, sibling_is_binary, out);
            }
            Ast::Ternary {
                cond, then_branch, else_branch, ..
            } => {
                let bracket_conditionals = self.normalization_flags.contains(NormalizationFlags::REDUNDANT_CONDITIONAL_BRACKETS);
                self.render_ternary_part(cond, bracket_conditionals, out);
                out.push_str(" ? ");
                self.render_ternary_part(then_branch, bracket_conditionals, out);
                out.push_str(" : ");
                self.render_ternary_part(else_branch, bracket_conditionals, out);
            }
        }
    }

    fn render_ternary_part(&self, node: &Ast, bracket: bool, out: &mut String) {
        let needs = bracket && matches!(node, Ast::BinaryOp { op, .. } if op != "[]") || matches!(node, Ast::Ternary { .. });
        if needs {
            out.push('(');
            self.render_into(node, out);
            out.push(')');
        } else {
            self.render_into(node, out);
        }
    }

    fn render_operand(&self, node: &Ast, parent_prec: u8, is_rhs: bool, sibling_is_binary: bool, out: &mut String) {
        let needs = match node {
            Ast::BinaryOp { op, .. } if *op != "[]" => {
                let child_prec = self.precedence.get(op).copied().unwrap_or(0);
                child_prec < parent_prec
                    || (is_rhs && child_prec == parent_prec)
                    || (is_rhs && child_prec > parent_prec && self.normalization_flags.contains(NormalizationFlags::REDUNDANT_RHS_BRACKETS_IF_RHS_STRONGER))
                    || (sibling_is_binary && self.normalization_flags.contains(NormalizationFlags::REDUNDANT_BRACKETS_IF_BOTH_SIDES_BINARY))
                    || self.normalization_flags.contains(NormalizationFlags::REDUNDANT_BINARY_BRACKETS)
            }
            Ast::Ternary { .. } => true,
            _ => false,
        };
        if needs {
            out.push('(');
            self.render_into(node, out);
            out.push(')');
        } else {
            self.render_into(node, out);
        }
    }


    fn normalized_operator(&self, op: &str) -> String {
        if self.normalization_flags.contains(NormalizationFlags::VERBAL_OPS_TO_SYMBOLIC) {
            if let Some(symbolic) = default_verbal_to_symbolic(op) {
                return symbolic.to_string();
            }
        }
        op.to_string()
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

fn default_verbal_to_symbolic(op: &str) -> Option<&'static str> {
    Some(match op {
        "and" => "&&",
        "or" => "||",
        "not" => "!",
        "equals" => "==",
        "not_equals" => "!=",
        "less" => "<",
        _ => return None,
    })
}

fn render_literal(value: &Value, format: Option<crate::ast::NumberFormat>, normalization_flags: NormalizationFlags, out: &mut String) {
    use crate::scanner::NumberBase;
    if let Some(i) = value.unbox::<i64>() {
        match format.map(|f| f.base) {
            Some(base @ NumberBase::Hex) => out.push_str(&format!("{}{i:X}", <&str>::from(base))),
            Some(base @ NumberBase::Octal) => out.push_str(&format!("{}{i:o}", <&str>::from(base))),
            Some(base @ NumberBase::Binary) => out.push_str(&format!("{}{i:b}", <&str>::from(base))),
            _ => out.push_str(&i.to_string()),
        }
        return;
    }
    if let Some(f) = value.unbox::<f64>() {
        let scientific = normalization_flags.contains(NormalizationFlags::FORCE_SCIENTIFIC_FLOATS) || format.is_some_and(|f| f.scientific);
        if scientific {
            out.push_str(&format_scientific(f));
        } else {
            out.push_str(&f.to_string());
        }
        return;
    }
    if let Some(s) = value.unbox::<Rc<str>>() {
        out.push('"');
        out.push_str(&crate::scanner::escape_string(&s));
        out.push('"');
        return;
    }
    if let Some(b) = value.unbox::<bool>() {
        out.push_str(if b { "true" } else { "false" });
        return;
    }
    out.push_str(&value.to_display_string());
}

/// Renders a float in the `1.5e2` form the scanner's exponent syntax
/// accepts back, used when `NormalizationFlags::FORCE_SCIENTIFIC_FLOATS`
/// is set or the literal was itself written in scientific notation.
fn format_scientific(f: f64) -> String {
    format!("{f:e}")
}

/// The compiled, immutable output of [`Compiler::compile`].
pub struct Expression {
    program: crate::program::Program,
}

impl Expression {
    pub fn evaluate(&self, scope: &mut Scope) -> Result<Value, EvalError> {
        vm::evaluate(&self.program, scope)
    }

    pub fn result_type(&self) -> TypeTag {
        self.program.result_type()
    }

    pub fn normalized_source(&self) -> &str {
        self.program.normalized_source()
    }

    pub fn decompile_program(&self) -> String {
        vm::decompile(&self.program)
    }

    pub fn source_position_of_instruction(&self, index: usize) -> Option<usize> {
        self.program.source_span_of(index).map(|s| s.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::SimpleFormatter;

    /// The VM wraps every callback error with its call site on the way out,
    /// so a nested-expression failure several calls deep arrives as a chain
    /// of `EvalError::Callback`s; this walks down to the original variant.
    fn root_cause(err: &EvalError) -> &EvalError {
        match err {
            EvalError::Callback { cause: Some(c), .. } => root_cause(c),
            other => other,
        }
    }

    fn eval(compiler: &Compiler, text: &str) -> Value {
        let expr = compiler.compile(text).unwrap_or_else(|e| panic!("compile({text:?}) failed: {e}"));
        let mut scope = Scope::new(Rc::new(SimpleFormatter));
        expr.evaluate(&mut scope).unwrap_or_else(|e| panic!("evaluate({text:?}) failed: {e}"))
    }

    #[test]
    fn compiles_flat_integer_literal() {
        let c = Compiler::new();
        assert_eq!(eval(&c, "42"), Value::from_int(42));
    }

    #[test]
    fn folds_constant_multiplication_to_a_single_push() {
        let c = Compiler::new();
        let expr = c.compile("42 * 2").unwrap();
        assert_eq!(expr.evaluate(&mut Scope::new(Rc::new(SimpleFormatter))).unwrap(), Value::from_int(84));
        assert_eq!(expr.decompile_program().lines().count(), 1);
    }

    #[test]
    fn no_optimization_flag_disables_constant_folding() {
        let mut c = Compiler::new();
        c.set_compile_flags(CompileFlags::NO_OPTIMIZATION);
        let expr = c.compile("42 * 2").unwrap();
        assert_eq!(expr.decompile_program().lines().count(), 3);
        assert_eq!(expr.evaluate(&mut Scope::new(Rc::new(SimpleFormatter))).unwrap(), Value::from_int(84));
    }

    #[test]
    fn bare_equals_is_rejected_without_the_alias_flag() {
        let c = Compiler::new();
        assert!(c.compile("1 = 1").is_err());
    }

    #[test]
    fn alias_equals_with_assign_flag_lets_bare_equals_parse_as_double_equals() {
        let mut c = Compiler::new();
        c.set_compile_flags(CompileFlags::ALIAS_EQUALS_WITH_ASSIGN);
        assert_eq!(eval(&c, "1 = 1"), Value::from_bool(true));
        assert_eq!(eval(&c, "1 = 2"), Value::from_bool(false));
    }

    #[test]
    fn allow_bitwise_boolean_flag_lets_amp_and_pipe_alias_to_logical_operators() {
        let mut c = Compiler::new();
        c.set_compile_flags(CompileFlags::ALLOW_BITWISE_BOOLEAN);
        assert_eq!(eval(&c, "true & false"), Value::from_bool(false));
        assert_eq!(eval(&c, "true | false"), Value::from_bool(true));
    }

    #[test]
    fn ternary_with_constant_condition_collapses_to_living_branch() {
        let c = Compiler::new();
        let expr = c.compile("true ? 1 : 2").unwrap();
        assert_eq!(expr.decompile_program().lines().count(), 1);
        assert_eq!(eval(&c, "true ? 1 : 2"), Value::from_int(1));
    }

    #[test]
    fn ternary_with_dynamic_condition_emits_jumps() {
        let c = Compiler::new();
        assert_eq!(eval(&c, "(1 == 1) ? 10 : 20"), Value::from_int(10));
        assert_eq!(eval(&c, "(1 == 2) ? 10 : 20"), Value::from_int(20));
    }

    #[test]
    fn format_function_compiles_and_evaluates() {
        let c = Compiler::new();
        assert_eq!(eval(&c, "Format(\"Result: {}\", 2 * 3)"), Value::from_str("Result: 6"));
    }

    #[test]
    fn verbal_alias_operators_compile_to_the_same_result_as_symbols() {
        let c = Compiler::new();
        assert_eq!(eval(&c, "1 equals 1 and 2 equals 2"), eval(&c, "1 == 1 && 2 == 2"));
    }

    #[test]
    fn nested_expression_falls_back_to_default_when_missing() {
        let c = Compiler::new();
        assert_eq!(eval(&c, "Expression(\"missing\", 7)"), Value::from_int(7));
    }

    #[test]
    fn nested_expression_resolves_a_registered_named_expression() {
        let mut c = Compiler::new();
        let named = c.compile("6 * 6").unwrap();
        c.add_named("sq", named);
        assert_eq!(eval(&c, "Expression(\"sq\", 0)"), Value::from_int(36));
    }

    #[test]
    fn nested_expression_throws_when_requested_and_missing() {
        let c = Compiler::new();
        let expr = c.compile("Expression(\"missing\", 1, throw)").unwrap();
        let err = expr.evaluate(&mut Scope::new(Rc::new(SimpleFormatter))).unwrap_err();
        assert!(matches!(root_cause(&err), EvalError::NestedExpressionNotFound { .. }));
    }

    #[test]
    fn circular_nested_expression_is_detected() {
        let mut c = Compiler::new();
        let a = c.compile("Expression(\"b\", 0)").unwrap();
        c.add_named("a", a);
        let b = c.compile("Expression(\"a\", 0)").unwrap();
        c.add_named("b", b);
        let entry = c.compile("Expression(\"a\", 0)").unwrap();
        let err = entry.evaluate(&mut Scope::new(Rc::new(SimpleFormatter))).unwrap_err();
        assert!(matches!(root_cause(&err), EvalError::CircularNestedExpression { .. }));
    }

    #[test]
    fn unknown_identifier_is_rejected_with_position() {
        let c = Compiler::new();
        let err = c.compile("totally_unknown_name").unwrap_err();
        assert!(matches!(err, CompileError::UnknownIdentifier { .. }));
    }

    #[test]
    fn normalized_source_reflects_bracketing_by_precedence() {
        let c = Compiler::new();
        let expr = c.compile("(1 + 2) * 3").unwrap();
        assert!(expr.normalized_source().contains('('));
    }

    #[test]
    fn redundant_rhs_brackets_if_rhs_stronger_brackets_a_tighter_binding_rhs() {
        let mut c = Compiler::new();
        c.set_normalization_flags(NormalizationFlags::REDUNDANT_RHS_BRACKETS_IF_RHS_STRONGER);
        let expr = c.compile("1 + 2 * 3").unwrap();
        assert_eq!(expr.normalized_source(), "1 + (2 * 3)");
    }

    #[test]
    fn redundant_brackets_if_both_sides_binary_brackets_both_operands() {
        // Each parenthesized group parses as its own operand, so this is a
        // single `+` whose lhs and rhs are themselves `+` expressions - the
        // one shape where the flag's effect is visible on its own. The rhs
        // is already bracketed without the flag (equal precedence on the
        // right of a left-associative operator must bracket to round-trip);
        // the flag is what additionally brackets the lhs.
        let without_flag = Compiler::new().compile("(1 + 2) + (3 + 4)").unwrap();
        assert_eq!(without_flag.normalized_source(), "1 + 2 + (3 + 4)");

        let mut c = Compiler::new();
        c.set_normalization_flags(NormalizationFlags::REDUNDANT_BRACKETS_IF_BOTH_SIDES_BINARY);
        let with_flag = c.compile("(1 + 2) + (3 + 4)").unwrap();
        assert_eq!(with_flag.normalized_source(), "(1 + 2) + (3 + 4)");
    }

    #[test]
    fn redundant_conditional_brackets_wraps_a_binary_condition() {
        let mut c = Compiler::new();
        c.set_normalization_flags(NormalizationFlags::REDUNDANT_CONDITIONAL_BRACKETS);
        let expr = c.compile("1 == 1 ? 2 : 3").unwrap();
        assert_eq!(expr.normalized_source(), "(1 == 1) ? 2 : 3");
    }

    #[test]
    fn force_scientific_floats_renders_every_float_in_exponent_form() {
        let mut c = Compiler::new();
        c.set_normalization_flags(NormalizationFlags::FORCE_SCIENTIFIC_FLOATS);
        let expr = c.compile("1.5").unwrap();
        assert_eq!(expr.normalized_source(), "1.5e0");
    }

    #[test]
    fn scientific_literal_round_trips_without_the_force_flag() {
        let c = Compiler::new();
        let expr = c.compile("1.5e2").unwrap();
        assert_eq!(expr.normalized_source(), "1.5e2");
        let reparsed = c.compile(expr.normalized_source()).unwrap();
        assert_eq!(reparsed.evaluate(&mut Scope::new(Rc::new(SimpleFormatter))).unwrap(), Value::from_float(150.0));
    }

    /// A plug-in that only ever answers `try_auto_cast`, parsing a string
    /// operand into an int. Exercises the auto-cast retry path in
    /// `resolve_call`: the `+` operator only matches `(int, int)`, so a
    /// `"5" + 3` only compiles if the compiler casts the string operand
    /// through this plug-in before retrying the operator lookup.
    struct ParseIntCast;
    impl CompilePlugin for ParseIntCast {
        fn try_auto_cast(&self, from: &Value, to: TypeTag) -> Option<Resolution> {
            if from.tag() != types::STRING || to != types::INT {
                return None;
            }
            Some(Resolution::Callback(PluginCallback {
                callback: Rc::new(|_scope, args: &[Value]| {
                    let s = args[0].unbox::<Rc<str>>().expect("string arg");
                    s.parse::<i64>().map(Value::from_int).map_err(|_| EvalError::Domain {
                        message: format!("'{s}' is not a valid integer"),
                    })
                }),
                result_type: types::INT,
                debug_name: "parse_int".into(),
                compile_time_invokable: true,
            }))
        }
    }

    #[test]
    fn auto_cast_plugin_lets_a_string_operand_compile_against_an_int_operator() {
        let mut c = Compiler::new();
        c.add_plugin(Box::new(ParseIntCast));
        assert_eq!(eval(&c, "\"5\" + 3"), Value::from_int(8));
    }

    #[test]
    fn operator_miss_without_a_matching_auto_cast_still_reports_unknown_operator() {
        let c = Compiler::new();
        let err = c.compile("\"5\" + 3").unwrap_err();
        assert!(matches!(err, CompileError::UnknownOperator { .. }));
    }

    #[test]
    fn colliding_binary_operator_registration_is_rejected() {
        let mut c = Compiler::new();
        let make_entry = || OperatorEntry {
            callback: Rc::new(|_s, args: &[Value]| Ok(Value::from_int(args[0].unbox::<i64>().unwrap()))),
            result_type: types::INT,
            compile_time_invokable: true,
            debug_name: "^^",
        };
        c.add_binary_operator("^^", 5, types::INT, types::INT, make_entry()).expect("first registration succeeds");
        let err = c.add_binary_operator("^^", 5, types::INT, types::INT, make_entry()).unwrap_err();
        assert!(matches!(err, CompileError::OperatorAlreadyDefined { .. }));
    }
}
