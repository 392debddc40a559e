//! Typed exception taxonomy for compile-time and evaluate-time failures.
//!
//! Both enums are hand-rolled (no `thiserror`) to mirror the reference
//! implementation's `ParseError`: a manual `Display`, a manual `source()`
//! chain via a boxed inner cause, and constructors that always carry a
//! source position when one is knowable.

use std::fmt;
use std::rc::Rc;

/// Byte offset into the *original* expression text, used by every error
/// variant that can pin down where the failure occurred.
pub type SourcePos = usize;

#[derive(Debug, Clone)]
pub enum CompileError {
    Syntax {
        pos: SourcePos,
        message: String,
    },
    UnexpectedEnd {
        pos: SourcePos,
    },
    UnknownIdentifier {
        pos: SourcePos,
        name: String,
    },
    UnknownOperator {
        pos: SourcePos,
        symbol: String,
    },
    OperatorAlreadyDefined {
        symbol: String,
    },
    UnknownFunctionSignature {
        pos: SourcePos,
        name: String,
        arg_types: Vec<&'static str>,
    },
    TypeMismatch {
        pos: SourcePos,
        context: String,
        expected: &'static str,
        found: &'static str,
    },
    ResultTypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    NestedExpressionCallArgumentMismatch {
        pos: SourcePos,
        detail: String,
    },
    Inner {
        pos: SourcePos,
        message: String,
        cause: Rc<CompileError>,
    },
}

impl CompileError {
    pub fn pos(&self) -> Option<SourcePos> {
        match self {
            CompileError::Syntax { pos, .. }
            | CompileError::UnexpectedEnd { pos }
            | CompileError::UnknownIdentifier { pos, .. }
            | CompileError::UnknownOperator { pos, .. }
            | CompileError::UnknownFunctionSignature { pos, .. }
            | CompileError::TypeMismatch { pos, .. }
            | CompileError::NestedExpressionCallArgumentMismatch { pos, .. }
            | CompileError::Inner { pos, .. } => Some(*pos),
            CompileError::OperatorAlreadyDefined { .. } | CompileError::ResultTypeMismatch { .. } => None,
        }
    }

    pub fn wrap(self, pos: SourcePos, message: impl Into<String>) -> CompileError {
        CompileError::Inner {
            pos,
            message: message.into(),
            cause: Rc::new(self),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Syntax { pos, message } => write!(f, "syntax error at {pos}: {message}"),
            CompileError::UnexpectedEnd { pos } => write!(f, "unexpected end of expression at {pos}"),
            CompileError::UnknownIdentifier { pos, name } => write!(f, "unknown identifier '{name}' at {pos}"),
            CompileError::UnknownOperator { pos, symbol } => write!(f, "unknown operator '{symbol}' at {pos}"),
            CompileError::OperatorAlreadyDefined { symbol } => write!(f, "operator '{symbol}' is already defined"),
            CompileError::UnknownFunctionSignature { pos, name, arg_types } => {
                write!(f, "no overload of '{name}' accepts ({}) at {pos}", arg_types.join(", "))
            }
            CompileError::TypeMismatch {
                pos,
                context,
                expected,
                found,
            } => write!(f, "type mismatch in {context} at {pos}: expected {expected}, found {found}"),
            CompileError::ResultTypeMismatch { expected, found } => {
                write!(f, "result type mismatch: expected {expected}, found {found}")
            }
            CompileError::NestedExpressionCallArgumentMismatch { pos, detail } => {
                write!(f, "bad nested-expression call at {pos}: {detail}")
            }
            CompileError::Inner { pos, message, cause } => write!(f, "{message} at {pos}: {cause}"),
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Inner { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EvalError {
    NestedExpressionNotFound {
        pos: SourcePos,
        name: String,
    },
    NestedExpressionResultTypeMismatch {
        pos: SourcePos,
        expected: &'static str,
        found: &'static str,
    },
    CircularNestedExpression {
        pos: SourcePos,
        name: String,
    },
    InternalVmError {
        message: String,
    },
    /// A domain error raised by a callback itself (division by zero, index
    /// out of range, a host function rejecting its arguments) — as opposed
    /// to [`EvalError::InternalVmError`], which is reserved for the VM's own
    /// invariant violations. Always arrives wrapped in a `Callback` once it
    /// reaches `at_call_site`.
    Domain {
        message: String,
    },
    Callback {
        pos: SourcePos,
        debug_name: String,
        message: String,
        cause: Option<Rc<EvalError>>,
    },
}

impl EvalError {
    pub fn pos(&self) -> Option<SourcePos> {
        match self {
            EvalError::NestedExpressionNotFound { pos, .. }
            | EvalError::NestedExpressionResultTypeMismatch { pos, .. }
            | EvalError::CircularNestedExpression { pos, .. }
            | EvalError::Callback { pos, .. } => Some(*pos),
            EvalError::InternalVmError { .. } | EvalError::Domain { .. } => None,
        }
    }

    /// Wraps a callback-raised error with the call site's source position,
    /// as the VM does for every `CALL_*` instruction.
    pub fn at_call_site(self, pos: SourcePos, debug_name: impl Into<String>) -> EvalError {
        EvalError::Callback {
            pos,
            debug_name: debug_name.into(),
            message: self.to_string(),
            cause: Some(Rc::new(self)),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::NestedExpressionNotFound { pos, name } => {
                write!(f, "nested expression '{name}' not found at {pos}")
            }
            EvalError::NestedExpressionResultTypeMismatch { pos, expected, found } => {
                write!(f, "nested expression at {pos} returned {found}, expected {expected}")
            }
            EvalError::CircularNestedExpression { pos, name } => {
                write!(f, "circular nested expression '{name}' at {pos}")
            }
            EvalError::InternalVmError { message } => write!(f, "internal VM error: {message}"),
            EvalError::Domain { message } => write!(f, "{message}"),
            EvalError::Callback {
                pos,
                debug_name,
                message,
                ..
            } => write!(f, "'{debug_name}' failed at {pos}: {message}"),
        }
    }
}

impl std::error::Error for EvalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EvalError::Callback { cause: Some(c), .. } => Some(c.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_source_position() {
        let e = CompileError::UnknownIdentifier {
            pos: 4,
            name: "foo".into(),
        };
        assert!(e.to_string().contains('4'));
        assert!(e.to_string().contains("foo"));
    }

    #[test]
    fn callback_error_chains_to_cause() {
        let inner = EvalError::Domain {
            message: "divide by zero".into(),
        };
        let wrapped = inner.at_call_site(10, "div");
        assert!(std::error::Error::source(&wrapped).is_some());
    }
}
