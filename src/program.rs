//! Compiled program: a flat instruction sequence plus constant pool, produced
//! by [`crate::compiler::Compiler::compile`] and consumed by [`crate::vm`].

use std::rc::Rc;

use crate::error::EvalError;
use crate::scope::Scope;
use crate::types::TypeTag;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSpan {
    pub start: usize,
    pub end: usize,
}

impl SourceSpan {
    pub fn point(pos: usize) -> Self {
        SourceSpan { start: pos, end: pos }
    }
}

/// A compiled callback: takes the evaluation scope and a contiguous argument
/// slice, returns a result box. Shared (`Rc`) because the same plug-in
/// callback is cloned into every instruction that invokes it.
pub type Callback = Rc<dyn Fn(&mut Scope, &[Value]) -> Result<Value, EvalError>>;

#[derive(Clone)]
pub enum Instruction {
    PushConstant {
        const_idx: u16,
        span: SourceSpan,
    },
    CallFunction {
        callback: Callback,
        nargs: u8,
        result_type: TypeTag,
        debug_name: Rc<str>,
        span: SourceSpan,
    },
    CallUnary {
        callback: Callback,
        result_type: TypeTag,
        debug_name: Rc<str>,
        span: SourceSpan,
    },
    CallBinary {
        callback: Callback,
        result_type: TypeTag,
        debug_name: Rc<str>,
        span: SourceSpan,
    },
    /// Pops a box, calls `is-true` on it; if false, jumps to `target`.
    JumpIfFalse {
        target: u32,
        span: SourceSpan,
    },
    Jump {
        target: u32,
        span: SourceSpan,
    },
}

impl Instruction {
    pub fn span(&self) -> SourceSpan {
        match self {
            Instruction::PushConstant { span, .. }
            | Instruction::CallFunction { span, .. }
            | Instruction::CallUnary { span, .. }
            | Instruction::CallBinary { span, .. }
            | Instruction::JumpIfFalse { span, .. }
            | Instruction::Jump { span, .. } => *span,
        }
    }

    fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::PushConstant { .. } => "PUSH_CONSTANT",
            Instruction::CallFunction { .. } => "CALL_FUNCTION",
            Instruction::CallUnary { .. } => "CALL_UNARY",
            Instruction::CallBinary { .. } => "CALL_BINARY",
            Instruction::JumpIfFalse { .. } => "JUMP_IF_FALSE",
            Instruction::Jump { .. } => "JUMP",
        }
    }
}

/// Identifies a not-yet-patched jump; returned by `ProgramBuilder::emit_jump*`
/// and consumed exactly once by `patch_jump`.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

/// Assembles a [`Program`] one instruction at a time, in lock-step with the
/// normalized source text. Mirrors the reference implementation's bytecode
/// builder: jumps are emitted as placeholders and back-patched once their
/// target offset is known, rather than through a general label facility.
pub struct ProgramBuilder {
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    normalized: String,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder {
            instructions: Vec::new(),
            constants: Vec::new(),
            normalized: String::new(),
        }
    }

    pub fn current_offset(&self) -> usize {
        self.instructions.len()
    }

    pub fn normalized_offset(&self) -> usize {
        self.normalized.len()
    }

    pub fn normalized_text(&self) -> &str {
        &self.normalized
    }

    pub fn push_normalized(&mut self, text: &str) {
        self.normalized.push_str(text);
    }

    /// Scans the just-appended tail of the normalized text for any
    /// configured forbidden substring produced by operator/operand
    /// juxtaposition (e.g. `--`, `/*`); inserts a single space right before
    /// the offending occurrence if one is found. Linear in the length of
    /// the emitted fragment by design — never run over the whole text.
    pub fn guard_forbidden_substrings(&mut self, since: usize, forbidden: &[&str]) {
        let tail_start = since.min(self.normalized.len());
        loop {
            let tail = &self.normalized[tail_start..];
            let hit = forbidden.iter().filter_map(|f| tail.find(f).map(|i| (i, f.len()))).min_by_key(|(i, _)| *i);
            let Some((offset, _)) = hit else { break };
            self.normalized.insert(tail_start + offset, ' ');
        }
    }

    pub fn add_const(&mut self, value: Value) -> u16 {
        let idx = u16::try_from(self.constants.len()).expect("constant pool overflow");
        self.constants.push(value);
        idx
    }

    pub fn emit_push_constant(&mut self, value: Value, span: SourceSpan) {
        let const_idx = self.add_const(value);
        self.instructions.push(Instruction::PushConstant { const_idx, span });
    }

    pub fn emit_call_function(&mut self, callback: Callback, nargs: u8, result_type: TypeTag, debug_name: Rc<str>, span: SourceSpan) {
        self.instructions.push(Instruction::CallFunction {
            callback,
            nargs,
            result_type,
            debug_name,
            span,
        });
    }

    pub fn emit_call_unary(&mut self, callback: Callback, result_type: TypeTag, debug_name: Rc<str>, span: SourceSpan) {
        self.instructions.push(Instruction::CallUnary {
            callback,
            result_type,
            debug_name,
            span,
        });
    }

    pub fn emit_call_binary(&mut self, callback: Callback, result_type: TypeTag, debug_name: Rc<str>, span: SourceSpan) {
        self.instructions.push(Instruction::CallBinary {
            callback,
            result_type,
            debug_name,
            span,
        });
    }

    pub fn emit_jump_if_false(&mut self, span: SourceSpan) -> JumpLabel {
        let label = JumpLabel(self.instructions.len());
        self.instructions.push(Instruction::JumpIfFalse { target: u32::MAX, span });
        label
    }

    pub fn emit_jump(&mut self, span: SourceSpan) -> JumpLabel {
        let label = JumpLabel(self.instructions.len());
        self.instructions.push(Instruction::Jump { target: u32::MAX, span });
        label
    }

    /// Back-patches a previously emitted jump to target the current offset.
    ///
    /// # Panics
    /// Panics if called twice for the same label, or if the label's slot is
    /// no longer a jump instruction (both indicate a builder bug).
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = u32::try_from(self.current_offset()).expect("program too large to address with u32 offsets");
        match &mut self.instructions[label.0] {
            Instruction::JumpIfFalse { target: t, .. } | Instruction::Jump { target: t, .. } => {
                assert_eq!(*t, u32::MAX, "jump label patched twice");
                *t = target;
            }
            _ => panic!("patch_jump label does not point at a jump instruction"),
        }
    }

    pub fn build(self, result_type: TypeTag) -> Program {
        Program {
            instructions: self.instructions,
            constants: self.constants,
            normalized_source: self.normalized,
            result_type,
        }
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The compiled, immutable output of `Compiler::compile`.
pub struct Program {
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    normalized_source: String,
    result_type: TypeTag,
}

impl Program {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn constant(&self, idx: u16) -> &Value {
        &self.constants[idx as usize]
    }

    pub fn normalized_source(&self) -> &str {
        &self.normalized_source
    }

    pub fn result_type(&self) -> TypeTag {
        self.result_type
    }

    pub fn source_span_of(&self, instruction_index: usize) -> Option<SourceSpan> {
        self.instructions.get(instruction_index).map(Instruction::span)
    }

    /// Multi-column textual listing: PC, mnemonic, operand, source span.
    /// Line count always equals the instruction count, and every span lies
    /// inside the normalized source.
    pub fn decompile(&self) -> String {
        let mut out = String::new();
        for (pc, instr) in self.instructions.iter().enumerate() {
            let span = instr.span();
            let operand = match instr {
                Instruction::PushConstant { const_idx, .. } => format!("const#{const_idx} = {}", self.constants[*const_idx as usize].to_display_string()),
                Instruction::CallFunction { nargs, debug_name, .. } => format!("{debug_name}/{nargs}"),
                Instruction::CallUnary { debug_name, .. } => debug_name.to_string(),
                Instruction::CallBinary { debug_name, .. } => debug_name.to_string(),
                Instruction::JumpIfFalse { target, .. } => format!("-> {target}"),
                Instruction::Jump { target, .. } => format!("-> {target}"),
            };
            out.push_str(&format!("{pc:>4}  {:<14} {operand:<24} [{}..{}]\n", instr.mnemonic(), span.start, span.end));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;

    #[test]
    fn patch_jump_sets_target_to_current_offset() {
        let mut b = ProgramBuilder::new();
        let label = b.emit_jump_if_false(SourceSpan::point(0));
        b.emit_push_constant(Value::from_int(1), SourceSpan::point(1));
        b.patch_jump(label);
        let program = b.build(types::INT);
        match program.instructions()[0] {
            Instruction::JumpIfFalse { target, .. } => assert_eq!(target, 1),
            _ => panic!("expected JumpIfFalse"),
        }
    }

    #[test]
    #[should_panic(expected = "patched twice")]
    fn patching_same_label_twice_panics() {
        let mut b = ProgramBuilder::new();
        let label = b.emit_jump(SourceSpan::point(0));
        b.patch_jump(label);
        b.patch_jump(label);
    }

    #[test]
    fn forbidden_substring_gets_a_separating_space() {
        let mut b = ProgramBuilder::new();
        b.push_normalized("a-");
        let since = b.normalized_offset();
        b.push_normalized("-b");
        b.guard_forbidden_substrings(since - 1, &["--"]);
        assert_eq!(b.normalized_text(), "a- -b");
    }

    #[test]
    fn decompile_line_count_matches_instruction_count() {
        let mut b = ProgramBuilder::new();
        b.emit_push_constant(Value::from_int(1), SourceSpan::point(0));
        b.emit_push_constant(Value::from_int(2), SourceSpan { start: 1, end: 2 });
        let program = b.build(types::INT);
        assert_eq!(program.decompile().lines().count(), program.instructions().len());
    }
}
