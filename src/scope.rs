//! Evaluation and compile-time scopes.
//!
//! Both are the *same shape*: an arena for allocations that must outlive a
//! single evaluation, a shared formatter, an open slot for host-owned
//! per-call data, and the VM's operand stack. The compile-time scope simply
//! never has host data populated, since callbacks marked compile-time
//! invokable must not depend on it.

use std::any::Any;
use std::rc::Rc;

use bumpalo::Bump;

use crate::value::Value;

/// Minimal formatter contract used by the `Format(...)` family of built-in
/// functions. Hosts may supply a richer implementation; this crate ships
/// `SimpleFormatter`, a `{}`-placeholder substitution formatter, as the
/// default.
pub trait Formatter {
    fn format(&self, template: &str, args: &[Value]) -> String;
}

/// Replaces each `{}` in `template`, left to right, with the textual
/// rendering of the corresponding argument. Extra `{}` placeholders beyond
/// the argument count are left verbatim; extra arguments are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleFormatter;

impl Formatter for SimpleFormatter {
    fn format(&self, template: &str, args: &[Value]) -> String {
        let mut out = String::with_capacity(template.len());
        let mut args = args.iter();
        let mut rest = template;
        while let Some(idx) = rest.find("{}") {
            out.push_str(&rest[..idx]);
            match args.next() {
                Some(arg) => arg.append_to_string(&mut out),
                None => out.push_str("{}"),
            }
            rest = &rest[idx + 2..];
        }
        out.push_str(rest);
        out
    }
}

/// Per-evaluation mutable state threaded through every callback invocation.
pub struct Scope {
    arena: Bump,
    formatter: Rc<dyn Formatter>,
    host_data: Option<Box<dyn Any>>,
    stack: Vec<Value>,
}

impl Scope {
    pub fn new(formatter: Rc<dyn Formatter>) -> Self {
        Scope {
            arena: Bump::new(),
            formatter,
            host_data: None,
            stack: Vec::new(),
        }
    }

    pub fn formatter(&self) -> &dyn Formatter {
        self.formatter.as_ref()
    }

    /// Clones the formatter handle so a callback can spin up a fresh `Scope`
    /// (nested-expression evaluation) sharing the caller's formatter.
    pub fn formatter_rc(&self) -> Rc<dyn Formatter> {
        self.formatter.clone()
    }

    pub fn set_host_data(&mut self, data: Box<dyn Any>) {
        self.host_data = Some(data);
    }

    pub fn host_data(&self) -> Option<&dyn Any> {
        self.host_data.as_deref()
    }

    pub fn host_data_mut(&mut self) -> Option<&mut (dyn Any + 'static)> {
        self.host_data.as_deref_mut()
    }

    pub fn arena(&self) -> &Bump {
        &self.arena
    }

    /// Clears the arena and the VM operand stack, but keeps the formatter
    /// and drops any previously set host data. Lets a host reuse one `Scope`
    /// across many evaluations without reallocating it each time.
    pub fn reset(&mut self) {
        self.arena.reset();
        self.host_data = None;
        self.stack.clear();
    }

    pub(crate) fn stack_push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn stack_pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn stack_truncate(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    /// Removes and returns the last `n` values, in push order, as a
    /// contiguous slice-backing `Vec`. Used by `CALL_*` to hand a callback
    /// its arguments.
    pub(crate) fn stack_drain_last(&mut self, n: usize) -> Vec<Value> {
        let at = self.stack.len() - n;
        self.stack.split_off(at)
    }
}

/// Structurally identical to `Scope`; used only during constant folding, so
/// it never carries host data and callbacks invoked through it must be
/// marked compile-time-invokable.
pub fn compile_time_scope(formatter: Rc<dyn Formatter>) -> Scope {
    Scope::new(formatter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_formatter_substitutes_placeholders_in_order() {
        let f = SimpleFormatter;
        let out = f.format("Result: {}", &[Value::from_int(6)]);
        assert_eq!(out, "Result: 6");
    }

    #[test]
    fn reset_clears_host_data_and_stack() {
        let mut scope = Scope::new(Rc::new(SimpleFormatter));
        scope.set_host_data(Box::new(42i32));
        scope.stack_push(Value::from_int(1));
        scope.reset();
        assert!(scope.host_data().is_none());
        assert_eq!(scope.stack_len(), 0);
    }
}
