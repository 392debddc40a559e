//! Process-local type registry.
//!
//! Every [`crate::value::Value`] carries a [`TypeTag`] as its runtime type identity.
//! Built-in tags are allocated once at bootstrap; host types are registered lazily,
//! in registration order, the first time the embedding application calls
//! [`TypeRegistry::register`] (typically via `Compiler::add_type`).

use std::sync::{OnceLock, RwLock};

use ahash::AHashMap;

use crate::value::Value;

/// Stable identity of a registered type. Two values have "the same type" iff
/// their tags are equal; this is never inferred structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(u32);

impl TypeTag {
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

pub const NULL: TypeTag = TypeTag::from_raw(0);
pub const BOOL: TypeTag = TypeTag::from_raw(1);
pub const INT: TypeTag = TypeTag::from_raw(2);
pub const FLOAT: TypeTag = TypeTag::from_raw(3);
pub const STRING: TypeTag = TypeTag::from_raw(4);
/// Sentinel tag used by array boxes; the real element type lives in `Value::elem_tag`.
pub const ARRAY: TypeTag = TypeTag::from_raw(5);

const FIRST_HOST_TAG: u32 = 16;

struct TypeEntry {
    name: &'static str,
    sample: Value,
}

struct Registry {
    entries: AHashMap<u32, TypeEntry>,
    by_name: AHashMap<&'static str, TypeTag>,
    next_host_tag: u32,
}

impl Registry {
    fn bootstrap() -> Self {
        let mut reg = Registry {
            entries: AHashMap::new(),
            by_name: AHashMap::new(),
            next_host_tag: FIRST_HOST_TAG,
        };
        reg.push(NULL, "null", Value::null());
        reg.push(BOOL, "bool", Value::from_bool(false));
        reg.push(INT, "int", Value::from_int(0));
        reg.push(FLOAT, "float", Value::from_float(0.0));
        reg.push(STRING, "string", Value::from_str(""));
        reg.push(ARRAY, "array", Value::empty_array(NULL));
        reg
    }

    fn push(&mut self, tag: TypeTag, name: &'static str, sample: Value) {
        self.entries.insert(tag.0, TypeEntry { name, sample });
        self.by_name.insert(name, tag);
    }
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Registry::bootstrap()))
}

/// Process-local table mapping a [`TypeTag`] to its human-readable name and a
/// sample box, used by plug-ins to describe function signatures without
/// holding a live value.
pub struct TypeRegistry;

impl TypeRegistry {
    /// Registers a new host type and returns its tag. Registration is global
    /// and idempotent by name: re-registering the same name returns the
    /// existing tag rather than allocating a new one.
    pub fn register(name: &'static str, sample: Value) -> TypeTag {
        let mut reg = registry().write().expect("type registry poisoned");
        if let Some(&existing) = reg.by_name.get(name) {
            return existing;
        }
        let tag = TypeTag::from_raw(reg.next_host_tag);
        reg.next_host_tag += 1;
        reg.push(tag, name, sample);
        tag
    }

    pub fn name(tag: TypeTag) -> &'static str {
        let reg = registry().read().expect("type registry poisoned");
        reg.entries.get(&tag.0).map(|e| e.name).unwrap_or("<unknown type>")
    }

    pub fn sample(tag: TypeTag) -> Value {
        let reg = registry().read().expect("type registry poisoned");
        reg.entries
            .get(&tag.0)
            .map(|e| e.sample.clone())
            .unwrap_or_else(Value::null)
    }

    pub fn lookup_by_name(name: &str) -> Option<TypeTag> {
        let reg = registry().read().expect("type registry poisoned");
        reg.by_name.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_resolve() {
        assert_eq!(TypeRegistry::name(INT), "int");
        assert_eq!(TypeRegistry::name(STRING), "string");
    }

    #[test]
    fn registering_same_name_twice_is_idempotent() {
        let a = TypeRegistry::register("duration", Value::from_int(0));
        let b = TypeRegistry::register("duration", Value::from_int(0));
        assert_eq!(a, b);
    }
}
