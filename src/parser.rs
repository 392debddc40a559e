//! Pratt / precedence-climbing parser: tokens to AST.

use ahash::{AHashMap, AHashSet};
use bumpalo::Bump;

use crate::ast::{Ast, NumberFormat};
use crate::error::CompileError;
use crate::flags::CompileFlags;
use crate::scanner::{Scanner, Spanned, Token};
use crate::value::Value;

/// Binds tighter than any binary operator; used for unary prefix operators
/// including the nested-expression `*` operator.
const UNARY_PRECEDENCE: u8 = 100;
/// The ternary `?:` is right-associative and lower than every binary
/// operator in the configurable precedence table.
const TERNARY_PRECEDENCE: u8 = 0;

pub struct ParserConfig<'a> {
    pub operators: &'a [&'a str],
    pub verbal_aliases: &'a AHashSet<String>,
    pub precedence: &'a AHashMap<String, u8>,
    pub unary_ops: &'a AHashSet<String>,
    pub nested_fn_name: &'a str,
    pub nested_op_symbol: &'a str,
    pub throw_sentinel: &'a str,
    pub flags: CompileFlags,
}

pub fn parse<'a>(src: &str, config: &ParserConfig, bump: &'a Bump) -> Result<&'a Ast<'a>, CompileError> {
    let mut scanner = Scanner::new(src, config.operators, config.verbal_aliases);
    let mut tokens = Vec::new();
    loop {
        let tok = scanner.next_token()?;
        let is_eof = tok.value == Token::Eof;
        tokens.push(tok);
        if is_eof {
            break;
        }
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        bump,
        config,
    };
    let expr = parser.parse_expr(TERNARY_PRECEDENCE)?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser<'s, 'a> {
    tokens: Vec<Spanned<Token>>,
    pos: usize,
    bump: &'a Bump,
    config: &'s ParserConfig<'s>,
}

impl<'s, 'a> Parser<'s, 'a> {
    fn peek(&self) -> &Spanned<Token> {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Spanned<Token> {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect_eof(&self) -> Result<(), CompileError> {
        match &self.peek().value {
            Token::Eof => Ok(()),
            other => Err(CompileError::Syntax {
                pos: self.peek().pos,
                message: format!("unexpected trailing token {other:?}"),
            }),
        }
    }

    fn expect_punct(&mut self, ch: char) -> Result<usize, CompileError> {
        let tok = self.advance();
        match tok.value {
            Token::Punct(c) if c == ch => Ok(tok.pos),
            other => Err(CompileError::Syntax {
                pos: tok.pos,
                message: format!("expected '{ch}', found {other:?}"),
            }),
        }
    }

    fn operator_name(tok: &Token) -> Option<&str> {
        match tok {
            Token::Operator(s) | Token::VerbalOperator(s) => Some(s),
            _ => None,
        }
    }

    fn binary_precedence(&self, name: &str) -> Option<u8> {
        self.config.precedence.get(name).copied()
    }

    /// `=`/`&`/`|` only parse as binary operators when the matching
    /// `CompileFlags` bit is set, and then only as aliases for their
    /// canonical two-character spelling — there is no separate bitwise
    /// layer underneath them to preserve.
    fn canonical_operator_name<'n>(&self, name: &'n str) -> &'n str {
        match name {
            "=" if self.config.flags.contains(CompileFlags::ALIAS_EQUALS_WITH_ASSIGN) => "==",
            "&" if self.config.flags.contains(CompileFlags::ALLOW_BITWISE_BOOLEAN) => "&&",
            "|" if self.config.flags.contains(CompileFlags::ALLOW_BITWISE_BOOLEAN) => "||",
            other => other,
        }
    }

    /// Standard precedence-climbing loop: parses a unary operand, then keeps
    /// consuming binary operators (and the ternary, and subscript) whose
    /// precedence is at or above `min_prec`.
    fn parse_expr(&mut self, min_prec: u8) -> Result<&'a Ast<'a>, CompileError> {
        let mut lhs = self.parse_unary()?;

        loop {
            let tok = self.peek().clone();
            if let Token::Punct('[') = tok.value {
                self.advance();
                let index = self.parse_expr(TERNARY_PRECEDENCE)?;
                self.expect_punct(']')?;
                lhs = self.bump.alloc(Ast::BinaryOp {
                    op: "[]".to_string(),
                    lhs,
                    rhs: index,
                    pos: tok.pos,
                });
                continue;
            }
            if let Token::Punct('?') = tok.value {
                if min_prec > TERNARY_PRECEDENCE {
                    break;
                }
                self.advance();
                let then_branch = self.parse_expr(TERNARY_PRECEDENCE)?;
                let colon_pos = self.expect_punct(':')?;
                let else_branch = self.parse_expr(TERNARY_PRECEDENCE)?;
                lhs = self.bump.alloc(Ast::Ternary {
                    cond: lhs,
                    then_branch,
                    else_branch,
                    q_pos: tok.pos,
                    colon_pos,
                });
                continue;
            }
            let Some(name) = Self::operator_name(&tok.value) else { break };
            let name = self.canonical_operator_name(name);
            let Some(prec) = self.binary_precedence(name) else { break };
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_expr(prec + 1)?;
            lhs = self.bump.alloc(Ast::BinaryOp {
                op: name.to_string(),
                lhs,
                rhs,
                pos: tok.pos,
            });
        }

        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<&'a Ast<'a>, CompileError> {
        let tok = self.peek().clone();
        if let Some(name) = Self::operator_name(&tok.value) {
            if self.config.unary_ops.contains(name) {
                self.advance();
                let child = self.parse_unary_operand()?;
                return Ok(self.bump.alloc(Ast::UnaryOp {
                    op: name.to_string(),
                    child,
                    pos: tok.pos,
                }));
            }
        }
        if name_eq_operator(&tok.value, self.config.nested_op_symbol) {
            self.advance();
            return self.parse_nested_operand(tok.pos);
        }
        self.parse_postfix()
    }

    fn parse_unary_operand(&mut self) -> Result<&'a Ast<'a>, CompileError> {
        self.parse_expr(UNARY_PRECEDENCE)
    }

    /// Parses the single operand of the prefix nested-expression operator
    /// `*name`. The operand may be a bare identifier — lifted into a string
    /// literal here, at parse time, when the flag allows it — or any
    /// string-yielding sub-expression. `*name` is sugar for
    /// `Expression(name, null, throw)`: unlike the full call form it cannot
    /// supply a fallback value, so a missing named expression is an error
    /// rather than silently substituting a default.
    fn parse_nested_operand(&mut self, star_pos: usize) -> Result<&'a Ast<'a>, CompileError> {
        let name_arg: &Ast = if self.config.flags.contains(CompileFlags::ALLOW_IDENTIFIERS_FOR_NESTED) && matches!(self.peek().value, Token::Identifier(_)) {
            let Token::Identifier(name) = self.advance().value else {
                unreachable!("matched above")
            };
            self.bump.alloc(Ast::Literal {
                value: Value::from_str(name),
                format: None,
                pos: star_pos,
            })
        } else {
            self.parse_unary_operand()?
        };
        let default_arg = self.bump.alloc(Ast::Literal {
            value: Value::null(),
            format: None,
            pos: star_pos,
        });
        let throw_arg = self.bump.alloc(Ast::Identifier {
            name: self.config.throw_sentinel.to_string(),
            pos: star_pos,
        });
        Ok(self.bump.alloc(Ast::Function {
            name: self.config.nested_fn_name.to_string(),
            args: vec![name_arg, default_arg, throw_arg],
            pos: star_pos,
        }))
    }

    fn parse_postfix(&mut self) -> Result<&'a Ast<'a>, CompileError> {
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<&'a Ast<'a>, CompileError> {
        let tok = self.advance();
        match tok.value {
            Token::Int(value, base) => Ok(self.bump.alloc(Ast::Literal {
                value: Value::from_int(value),
                format: Some(NumberFormat { base, scientific: false }),
                pos: tok.pos,
            })),
            Token::Float(value, scientific) => Ok(self.bump.alloc(Ast::Literal {
                value: Value::from_float(value),
                format: Some(NumberFormat {
                    base: crate::scanner::NumberBase::Decimal,
                    scientific,
                }),
                pos: tok.pos,
            })),
            Token::Str(value, _needed_escaping) => Ok(self.bump.alloc(Ast::Literal {
                value: Value::from_str(value),
                format: None,
                pos: tok.pos,
            })),
            Token::Identifier(name) => {
                if matches!(self.peek().value, Token::Punct('(')) {
                    self.advance();
                    let args = self.parse_call_args()?;
                    Ok(self.bump.alloc(Ast::Function { name, args, pos: tok.pos }))
                } else {
                    Ok(self.bump.alloc(Ast::Identifier { name, pos: tok.pos }))
                }
            }
            Token::Punct('(') => {
                let inner = self.parse_expr(TERNARY_PRECEDENCE)?;
                self.expect_punct(')')?;
                Ok(inner)
            }
            other => Err(CompileError::Syntax {
                pos: tok.pos,
                message: format!("expected an expression, found {other:?}"),
            }),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<&'a Ast<'a>>, CompileError> {
        let mut args = Vec::new();
        if matches!(self.peek().value, Token::Punct(')')) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr(TERNARY_PRECEDENCE)?);
            match self.advance().value {
                Token::Punct(',') => continue,
                Token::Punct(')') => break,
                other => {
                    return Err(CompileError::Syntax {
                        pos: self.peek().pos,
                        message: format!("expected ',' or ')', found {other:?}"),
                    })
                }
            }
        }
        Ok(args)
    }
}

fn name_eq_operator(tok: &Token, symbol: &str) -> bool {
    matches!(tok, Token::Operator(s) if s == symbol)
}
