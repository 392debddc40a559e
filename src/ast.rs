//! AST node shapes and the mandatory, plugin-free tree-to-tree optimization
//! pass described for `Optimize`. Assembly into a [`crate::program::Program`]
//! lives in [`crate::compiler`], since it needs the plug-in chain.

use bumpalo::Bump;

use crate::flags::CompileFlags;
use crate::scanner::NumberBase;
use crate::value::Value;

#[derive(Debug, Clone, Copy)]
pub struct NumberFormat {
    pub base: NumberBase,
    pub scientific: bool,
}

/// Tagged AST node. Nodes are arena-allocated and reference children by
/// `&'a Ast<'a>`; an expression's whole tree lives in one `bumpalo::Bump`
/// released together with the compiled `Expression`.
#[derive(Debug)]
pub enum Ast<'a> {
    Literal {
        value: Value,
        format: Option<NumberFormat>,
        pos: usize,
    },
    Identifier {
        name: String,
        pos: usize,
    },
    Function {
        name: String,
        args: Vec<&'a Ast<'a>>,
        pos: usize,
    },
    UnaryOp {
        op: String,
        child: &'a Ast<'a>,
        pos: usize,
    },
    BinaryOp {
        op: String,
        lhs: &'a Ast<'a>,
        rhs: &'a Ast<'a>,
        pos: usize,
    },
    Ternary {
        cond: &'a Ast<'a>,
        then_branch: &'a Ast<'a>,
        else_branch: &'a Ast<'a>,
        q_pos: usize,
        colon_pos: usize,
    },
}

impl<'a> Ast<'a> {
    pub fn pos(&self) -> usize {
        match self {
            Ast::Literal { pos, .. }
            | Ast::Identifier { pos, .. }
            | Ast::Function { pos, .. }
            | Ast::UnaryOp { pos, .. }
            | Ast::BinaryOp { pos, .. } => *pos,
            Ast::Ternary { q_pos, .. } => *q_pos,
        }
    }

    /// Pure tree-to-tree rewrite: constant-folds `+lit`/`-lit` on numeric
    /// literals unless `NO_OPTIMIZATION` is set, after first optimizing all
    /// children. Never consults plug-ins and never emits instructions.
    pub fn optimize(&'a self, flags: CompileFlags, bump: &'a Bump) -> &'a Ast<'a> {
        match self {
            Ast::Literal { .. } | Ast::Identifier { .. } => self,
            Ast::Function { name, args, pos } => {
                let args: Vec<&Ast> = args.iter().map(|a| a.optimize(flags, bump)).collect();
                bump.alloc(Ast::Function {
                    name: name.clone(),
                    args,
                    pos: *pos,
                })
            }
            Ast::UnaryOp { op, child, pos } => {
                let child = child.optimize(flags, bump);
                if !flags.contains(CompileFlags::NO_OPTIMIZATION) {
                    if let Some(folded) = try_fold_unary(op, child, bump) {
                        return folded;
                    }
                }
                bump.alloc(Ast::UnaryOp {
                    op: op.clone(),
                    child,
                    pos: *pos,
                })
            }
            Ast::BinaryOp { op, lhs, rhs, pos } => {
                let lhs = lhs.optimize(flags, bump);
                let rhs = rhs.optimize(flags, bump);
                bump.alloc(Ast::BinaryOp {
                    op: op.clone(),
                    lhs,
                    rhs,
                    pos: *pos,
                })
            }
            Ast::Ternary {
                cond,
                then_branch,
                else_branch,
                q_pos,
                colon_pos,
            } => {
                let cond = cond.optimize(flags, bump);
                let then_branch = then_branch.optimize(flags, bump);
                let else_branch = else_branch.optimize(flags, bump);
                bump.alloc(Ast::Ternary {
                    cond,
                    then_branch,
                    else_branch,
                    q_pos: *q_pos,
                    colon_pos: *colon_pos,
                })
            }
        }
    }
}

/// Folds `+lit`/`-lit` for numeric literals. Never folds a floating literal
/// that is NaN (open question in the design notes resolved conservatively).
fn try_fold_unary<'a>(op: &str, child: &'a Ast<'a>, bump: &'a Bump) -> Option<&'a Ast<'a>> {
    let Ast::Literal { value, format, pos } = child else {
        return None;
    };
    if let Some(i) = value.unbox::<i64>() {
        let folded = match op {
            "+" => i,
            "-" => -i,
            _ => return None,
        };
        return Some(bump.alloc(Ast::Literal {
            value: Value::from_int(folded),
            format: *format,
            pos: *pos,
        }));
    }
    if let Some(f) = value.unbox::<f64>() {
        if f.is_nan() {
            return None;
        }
        let folded = match op {
            "+" => f,
            "-" => -f,
            _ => return None,
        };
        return Some(bump.alloc(Ast::Literal {
            value: Value::from_float(folded),
            format: *format,
            pos: *pos,
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unary_minus_folds_int_literal() {
        let bump = Bump::new();
        let lit = bump.alloc(Ast::Literal {
            value: Value::from_int(5),
            format: None,
            pos: 1,
        });
        let neg = bump.alloc(Ast::UnaryOp {
            op: "-".to_string(),
            child: lit,
            pos: 0,
        });
        let optimized = neg.optimize(CompileFlags::default(), &bump);
        match optimized {
            Ast::Literal { value, .. } => assert_eq!(value.unbox::<i64>(), Some(-5)),
            other => panic!("expected folded literal, got {other:?}"),
        }
    }

    #[test]
    fn unary_minus_does_not_fold_nan() {
        let bump = Bump::new();
        let lit = bump.alloc(Ast::Literal {
            value: Value::from_float(f64::NAN),
            format: None,
            pos: 1,
        });
        let neg = bump.alloc(Ast::UnaryOp {
            op: "-".to_string(),
            child: lit,
            pos: 0,
        });
        let optimized = neg.optimize(CompileFlags::default(), &bump);
        assert!(matches!(optimized, Ast::UnaryOp { .. }));
    }

    #[test]
    fn no_optimization_flag_suppresses_unary_folding() {
        let bump = Bump::new();
        let lit = bump.alloc(Ast::Literal {
            value: Value::from_int(5),
            format: None,
            pos: 1,
        });
        let neg = bump.alloc(Ast::UnaryOp {
            op: "-".to_string(),
            child: lit,
            pos: 0,
        });
        let optimized = neg.optimize(CompileFlags::NO_OPTIMIZATION, &bump);
        assert!(matches!(optimized, Ast::UnaryOp { .. }));
    }
}
