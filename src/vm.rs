//! Stack-based evaluator. Walks a [`Program`] linearly against a [`Scope`];
//! the only control flow is the two jump instructions emitted for ternary.

use tracing::warn;

use crate::error::EvalError;
use crate::program::{Instruction, Program};
use crate::scope::Scope;
use crate::value::Value;

/// Evaluates `program` against `scope`, returning the single result box left
/// on the stack. A stack that does not end exactly one deeper than it
/// started is an internal invariant violation: a debug-build assertion here,
/// and an `InternalVmError` in release (the `debug_assert!` below fires
/// first in debug builds; the explicit check after the loop covers release).
pub fn evaluate(program: &Program, scope: &mut Scope) -> Result<Value, EvalError> {
    let result = run(program, scope);
    if result.is_err() {
        warn!(error = %result.as_ref().err().unwrap(), "expression evaluation failed");
    }
    result
}

fn run(program: &Program, scope: &mut Scope) -> Result<Value, EvalError> {
    let base = scope.stack_len();
    let instructions = program.instructions();
    let mut pc: usize = 0;

    while pc < instructions.len() {
        match &instructions[pc] {
            Instruction::PushConstant { const_idx, .. } => {
                scope.stack_push(program.constant(*const_idx).clone());
                pc += 1;
            }
            Instruction::CallFunction {
                callback,
                nargs,
                debug_name,
                span,
                ..
            } => {
                let nargs = *nargs as usize;
                check_depth(scope, base, nargs)?;
                let args = scope.stack_drain_last(nargs);
                let result = callback(scope, &args).map_err(|e| e.at_call_site(span.start, debug_name.as_ref()))?;
                scope.stack_push(result);
                pc += 1;
            }
            Instruction::CallUnary {
                callback, debug_name, span, ..
            } => {
                check_depth(scope, base, 1)?;
                let args = scope.stack_drain_last(1);
                let result = callback(scope, &args).map_err(|e| e.at_call_site(span.start, debug_name.as_ref()))?;
                scope.stack_push(result);
                pc += 1;
            }
            Instruction::CallBinary {
                callback, debug_name, span, ..
            } => {
                check_depth(scope, base, 2)?;
                let args = scope.stack_drain_last(2);
                let result = callback(scope, &args).map_err(|e| e.at_call_site(span.start, debug_name.as_ref()))?;
                scope.stack_push(result);
                pc += 1;
            }
            Instruction::JumpIfFalse { target, .. } => {
                check_depth(scope, base, 1)?;
                let cond = scope.stack_drain_last(1).pop().expect("just checked depth");
                if cond.is_true() {
                    pc += 1;
                } else {
                    pc = *target as usize;
                }
            }
            Instruction::Jump { target, .. } => {
                pc = *target as usize;
            }
        }
    }

    let final_len = scope.stack_len();
    if final_len != base + 1 {
        scope.stack_truncate(base);
        return Err(EvalError::InternalVmError {
            message: format!("program left {} values on the stack, expected 1", final_len.saturating_sub(base)),
        });
    }
    Ok(scope.stack_drain_last(1).pop().expect("checked above"))
}

fn check_depth(scope: &Scope, base: usize, needed: usize) -> Result<(), EvalError> {
    if scope.stack_len() < base + needed {
        return Err(EvalError::InternalVmError {
            message: "operand stack underflow".to_string(),
        });
    }
    Ok(())
}

/// Renders a program's instructions as a multi-column listing (PC,
/// instruction, operand, source span). A thin wrapper around
/// `Program::decompile` kept here so callers only need `crate::vm` for both
/// evaluation and diagnostics.
pub fn decompile(program: &Program) -> String {
    program.decompile()
}
