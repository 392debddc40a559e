//! `Value` — the uniform, type-discriminated container ("box") that threads
//! through the scanner, parser, compiler and VM.
//!
//! A `Value` is either one of the built-in scalar/array shapes or a
//! host-registered type wrapped behind [`BoxHostType`]. Dispatch for the
//! built-ins is hand-written in this file; host types supply their own
//! dispatch table by implementing the trait.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::types::{self, TypeRegistry, TypeTag};

/// Polymorphic operations a host-registered type must provide so that it
/// participates in the same equals/cmp/is-null/is-empty/is-true/hash/append
/// protocol as the built-in types.
pub trait BoxHostType: std::fmt::Debug {
    fn type_tag(&self) -> TypeTag;
    fn box_eq(&self, other: &dyn BoxHostType) -> bool;
    fn box_cmp(&self, other: &dyn BoxHostType) -> Option<Ordering>;
    fn is_null(&self) -> bool {
        false
    }
    fn is_empty(&self) -> bool;
    fn is_true(&self) -> bool;
    fn box_hash(&self, state: &mut dyn Hasher);
    fn append_to_string(&self, out: &mut String);
}

#[derive(Debug, Clone)]
enum Repr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Array(Rc<[Value]>),
    Host(Rc<dyn BoxHostType>),
}

/// The uniform value container. Cheap to clone: scalars are copied, strings
/// and arrays are reference-counted, host values go through their own `Rc`.
#[derive(Debug, Clone)]
pub struct Value {
    repr: Repr,
    /// Present (and distinct from the container's own tag) only for arrays,
    /// naming the element type.
    elem_tag: Option<TypeTag>,
}

impl Value {
    pub fn null() -> Self {
        Value {
            repr: Repr::Null,
            elem_tag: None,
        }
    }

    pub fn from_bool(b: bool) -> Self {
        Value {
            repr: Repr::Bool(b),
            elem_tag: None,
        }
    }

    pub fn from_int(i: i64) -> Self {
        Value {
            repr: Repr::Int(i),
            elem_tag: None,
        }
    }

    pub fn from_float(f: f64) -> Self {
        Value {
            repr: Repr::Float(f),
            elem_tag: None,
        }
    }

    pub fn from_str(s: impl Into<Rc<str>>) -> Self {
        Value {
            repr: Repr::Str(s.into()),
            elem_tag: None,
        }
    }

    pub fn from_array(elem_tag: TypeTag, items: Vec<Value>) -> Self {
        Value {
            repr: Repr::Array(items.into()),
            elem_tag: Some(elem_tag),
        }
    }

    pub fn empty_array(elem_tag: TypeTag) -> Self {
        Self::from_array(elem_tag, Vec::new())
    }

    pub fn from_host(value: Rc<dyn BoxHostType>) -> Self {
        Value {
            repr: Repr::Host(value),
            elem_tag: None,
        }
    }

    /// Runtime type identity. For array boxes this is the `ARRAY` sentinel;
    /// use [`Value::elem_tag`] for the element type.
    pub fn tag(&self) -> TypeTag {
        match &self.repr {
            Repr::Null => types::NULL,
            Repr::Bool(_) => types::BOOL,
            Repr::Int(_) => types::INT,
            Repr::Float(_) => types::FLOAT,
            Repr::Str(_) => types::STRING,
            Repr::Array(_) => types::ARRAY,
            Repr::Host(h) => h.type_tag(),
        }
    }

    pub fn elem_tag(&self) -> Option<TypeTag> {
        self.elem_tag
    }

    pub fn is_null(&self) -> bool {
        match &self.repr {
            Repr::Null => true,
            Repr::Host(h) => h.is_null(),
            _ => false,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.repr, Repr::Array(_))
    }

    pub fn is_array_of(&self, tag: TypeTag) -> bool {
        self.is_array() && self.elem_tag == Some(tag)
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Array(items) => items.len(),
            Repr::Str(s) => s.len(),
            _ => 0,
        }
    }

    pub fn is_empty_value(&self) -> bool {
        match &self.repr {
            Repr::Null => true,
            Repr::Str(s) => s.is_empty(),
            Repr::Array(items) => items.is_empty(),
            Repr::Host(h) => h.is_empty(),
            _ => false,
        }
    }

    /// `is-true` used by `JUMP_IF_FALSE` and by `&&`/`||` short-circuit folding.
    pub fn is_true(&self) -> bool {
        match &self.repr {
            Repr::Null => false,
            Repr::Bool(b) => *b,
            Repr::Int(i) => *i != 0,
            Repr::Float(f) => *f != 0.0,
            Repr::Str(s) => !s.is_empty(),
            Repr::Array(items) => !items.is_empty(),
            Repr::Host(h) => h.is_true(),
        }
    }

    pub fn append_to_string(&self, out: &mut String) {
        match &self.repr {
            Repr::Null => out.push_str("null"),
            Repr::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Repr::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Repr::Float(f) => {
                let _ = write!(out, "{f}");
            }
            Repr::Str(s) => out.push_str(s),
            Repr::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.append_to_string(out);
                }
                out.push(']');
            }
            Repr::Host(h) => h.append_to_string(out),
        }
    }

    pub fn to_display_string(&self) -> String {
        let mut s = String::new();
        self.append_to_string(&mut s);
        s
    }

    pub fn is_type<T: ValueType>(&self) -> bool {
        T::matches(self)
    }

    pub fn unbox<T: ValueType>(&self) -> Option<T> {
        T::unbox(self)
    }

    /// Panics (via `debug_assert!` in debug builds, or simply on the `None`
    /// branch in release) unless `is_type::<T>()` already holds. Mirrors the
    /// "undefined unless IsType" contract without true undefined behaviour.
    pub fn unbox_unchecked<T: ValueType>(&self) -> T {
        debug_assert!(self.is_type::<T>(), "unbox_unchecked called on mismatched type");
        self.unbox::<T>().expect("unbox_unchecked: type mismatch")
    }

    pub fn unbox_element<T: ValueType>(&self, index: usize) -> Option<T> {
        match &self.repr {
            Repr::Array(items) => items.get(index).and_then(T::unbox),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match &self.repr {
            Repr::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_host(&self) -> Option<&dyn BoxHostType> {
        match &self.repr {
            Repr::Host(h) => Some(h.as_ref()),
            _ => None,
        }
    }

    /// Nested equality: type identity first, value second.
    pub fn box_eq(&self, other: &Value) -> bool {
        if self.tag() != other.tag() {
            return false;
        }
        match (&self.repr, &other.repr) {
            (Repr::Null, Repr::Null) => true,
            (Repr::Bool(a), Repr::Bool(b)) => a == b,
            (Repr::Int(a), Repr::Int(b)) => a == b,
            (Repr::Float(a), Repr::Float(b)) => a == b,
            (Repr::Str(a), Repr::Str(b)) => a == b,
            (Repr::Array(a), Repr::Array(b)) => {
                self.elem_tag == other.elem_tag && a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.box_eq(y))
            }
            (Repr::Host(a), Repr::Host(b)) => a.box_eq(b.as_ref()),
            _ => false,
        }
    }

    /// Strict total order across the whole value space: types first (by
    /// tag), then value. Guarantees heterogeneous collections of boxes stay
    /// sortable.
    pub fn box_cmp(&self, other: &Value) -> Ordering {
        match self.tag().cmp(&other.tag()) {
            Ordering::Equal => {}
            non_eq => return non_eq,
        }
        match (&self.repr, &other.repr) {
            (Repr::Null, Repr::Null) => Ordering::Equal,
            (Repr::Bool(a), Repr::Bool(b)) => a.cmp(b),
            (Repr::Int(a), Repr::Int(b)) => a.cmp(b),
            (Repr::Float(a), Repr::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Repr::Str(a), Repr::Str(b)) => a.cmp(b),
            (Repr::Array(a), Repr::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.box_cmp(y) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Repr::Host(a), Repr::Host(b)) => a.box_cmp(b.as_ref()).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        }
    }

    pub fn box_hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match &self.repr {
            Repr::Null => {}
            Repr::Bool(b) => b.hash(state),
            Repr::Int(i) => i.hash(state),
            Repr::Float(f) => f.to_bits().hash(state),
            Repr::Str(s) => s.hash(state),
            Repr::Array(items) => {
                for item in items.iter() {
                    item.box_hash(state);
                }
            }
            Repr::Host(h) => h.box_hash(state),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        TypeRegistry::name(self.tag())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.box_eq(other)
    }
}
impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.box_cmp(other))
    }
}
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.box_cmp(other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.box_hash(state);
    }
}

/// Maps a native Rust type onto a [`TypeTag`] and its box conversion, backing
/// `Value::is_type::<T>()` / `Value::unbox::<T>()`.
pub trait ValueType: Sized {
    fn matches(value: &Value) -> bool;
    fn unbox(value: &Value) -> Option<Self>;
}

impl ValueType for bool {
    fn matches(value: &Value) -> bool {
        matches!(value.repr, Repr::Bool(_))
    }
    fn unbox(value: &Value) -> Option<Self> {
        match value.repr {
            Repr::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl ValueType for i64 {
    fn matches(value: &Value) -> bool {
        matches!(value.repr, Repr::Int(_))
    }
    fn unbox(value: &Value) -> Option<Self> {
        match value.repr {
            Repr::Int(i) => Some(i),
            _ => None,
        }
    }
}

impl ValueType for f64 {
    fn matches(value: &Value) -> bool {
        matches!(value.repr, Repr::Float(_))
    }
    fn unbox(value: &Value) -> Option<Self> {
        match value.repr {
            Repr::Float(f) => Some(f),
            _ => None,
        }
    }
}

impl ValueType for Rc<str> {
    fn matches(value: &Value) -> bool {
        matches!(value.repr, Repr::Str(_))
    }
    fn unbox(value: &Value) -> Option<Self> {
        match &value.repr {
            Repr::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_type_same_value_is_equal() {
        assert_eq!(Value::from_int(42), Value::from_int(42));
        assert_ne!(Value::from_int(42), Value::from_int(43));
    }

    #[test]
    fn cross_type_comparison_falls_back_to_type_identity() {
        let a = Value::from_bool(true);
        let b = Value::from_int(0);
        assert_ne!(a, b);
        assert_eq!(a.tag().cmp(&b.tag()), a.box_cmp(&b));
    }

    #[test]
    fn heterogeneous_ordering_is_total() {
        let values = vec![Value::from_int(1), Value::from_bool(true), Value::null(), Value::from_str("x")];
        for x in &values {
            for y in &values {
                let lt = x.box_cmp(y) == Ordering::Less;
                let gt = x.box_cmp(y) == Ordering::Greater;
                let eq = x.box_cmp(y) == Ordering::Equal;
                assert_eq!([lt, gt, eq].iter().filter(|b| **b).count(), 1);
            }
        }
    }

    #[test]
    fn unbox_respects_exact_type() {
        let v = Value::from_int(7);
        assert!(v.is_type::<i64>());
        assert!(!v.is_type::<f64>());
        assert_eq!(v.unbox::<i64>(), Some(7));
        assert_eq!(v.unbox::<f64>(), None);
    }

    #[test]
    fn array_unbox_element_is_distinct_from_scalar_unbox() {
        let arr = Value::from_array(types::INT, vec![Value::from_int(1), Value::from_int(2)]);
        assert!(arr.unbox::<i64>().is_none());
        assert_eq!(arr.unbox_element::<i64>(0), Some(1));
        assert_eq!(arr.unbox_element::<i64>(5), None);
    }

    #[test]
    fn is_true_matches_truthiness_contract() {
        assert!(!Value::null().is_true());
        assert!(!Value::from_int(0).is_true());
        assert!(Value::from_int(1).is_true());
        assert!(!Value::from_str("").is_true());
        assert!(Value::from_str("x").is_true());
    }

    #[test]
    fn append_to_string_renders_arrays_recursively() {
        let arr = Value::from_array(types::INT, vec![Value::from_int(1), Value::from_int(2)]);
        assert_eq!(arr.to_display_string(), "[1, 2]");
    }
}
