//! Compile-time configuration bit-sets.
//!
//! Both flag sets are plain in-process `bitflags!` values, built with the
//! ordinary builder-style `insert`/`remove`/`contains` API — there is no INI
//! or TOML reader in this crate; a host embedding this engine is expected to
//! construct these from its own configuration layer and pass them in.

use bitflags::bitflags;

bitflags! {
    /// Governs parsing/compilation semantics that change what is *legal*,
    /// not merely how it is rendered back out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompileFlags: u32 {
        /// A bare identifier may stand in for a string literal as the first
        /// argument of a nested-expression reference (`*name` / `Expression(name, ...)`).
        const ALLOW_IDENTIFIERS_FOR_NESTED = 1 << 0;
        /// `=` parses as a binary operator, canonicalized to `==` — there is
        /// no separate assignment operator to alias it away from.
        const ALIAS_EQUALS_WITH_ASSIGN = 1 << 1;
        /// `&` / `|` parse as binary operators, canonicalized to `&&` / `||`
        /// — this engine has no bitwise layer underneath them to collide with.
        const ALLOW_BITWISE_BOOLEAN = 1 << 2;
        /// Disables every constant-folding / collapsing optimization.
        const NO_OPTIMIZATION = 1 << 3;
    }
}

impl Default for CompileFlags {
    fn default() -> Self {
        CompileFlags::ALLOW_IDENTIFIERS_FOR_NESTED
    }
}

bitflags! {
    /// Governs how a compiled expression is rendered back into normalized
    /// source text; never changes compiled semantics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NormalizationFlags: u32 {
        /// Reserved: rewrites a called function's name to a plug-in-declared
        /// canonical spelling at render time. Not consulted — normalized
        /// rendering runs on the pre-resolution `Ast`, before any plug-in has
        /// matched a function to a signature, and there is no nullary
        /// render-time alias lookup that would not be a no-op in practice.
        /// See `DESIGN.md`.
        const REPLACE_FUNCTION_NAMES = 1 << 0;
        /// Reserved: same render-time-vs-resolve-time ordering problem as
        /// `REPLACE_FUNCTION_NAMES`, for plug-in-registered operator aliases
        /// rather than the fixed built-in verbal table `VERBAL_OPS_TO_SYMBOLIC`
        /// already covers. See `DESIGN.md`.
        const REPLACE_ALIAS_OPERATORS = 1 << 1;
        const VERBAL_OPS_TO_SYMBOLIC = 1 << 2;
        const REDUNDANT_UNARY_BRACKETS = 1 << 3;
        const REDUNDANT_BINARY_BRACKETS = 1 << 4;
        /// Brackets a binary operand that binds *tighter* than its parent
        /// even though precedence alone would leave it bare.
        const REDUNDANT_RHS_BRACKETS_IF_RHS_STRONGER = 1 << 5;
        /// Brackets both operands of a binary operator whenever both sides
        /// are themselves binary expressions, regardless of precedence.
        const REDUNDANT_BRACKETS_IF_BOTH_SIDES_BINARY = 1 << 6;
        /// Brackets a ternary's condition when it is a binary expression,
        /// and brackets a nested ternary branch.
        const REDUNDANT_CONDITIONAL_BRACKETS = 1 << 7;
        /// Renders every float literal in `1.5e2` scientific form instead of
        /// its default `Display` spelling.
        const FORCE_SCIENTIFIC_FLOATS = 1 << 8;
    }
}

impl Default for NormalizationFlags {
    fn default() -> Self {
        NormalizationFlags::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_with_bitor() {
        let f = NormalizationFlags::REPLACE_ALIAS_OPERATORS | NormalizationFlags::VERBAL_OPS_TO_SYMBOLIC;
        assert!(f.contains(NormalizationFlags::REPLACE_ALIAS_OPERATORS));
        assert!(f.contains(NormalizationFlags::VERBAL_OPS_TO_SYMBOLIC));
        assert!(!f.contains(NormalizationFlags::FORCE_SCIENTIFIC_FLOATS));
    }
}
