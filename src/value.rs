//! Dynamically typed D-Bus values.
//!
//! Message bodies are trees of [`Value`] checked against a parsed signature
//! before marshalling. Dicts keep insertion order; on decode, a duplicate
//! wire key overrides the earlier entry.

use crate::error::Error;
use crate::signature::{parse_single_type, Signature, SignatureType, TypeCode};

/// A single D-Bus value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    /// Index into the containing message's attached fd array.
    UnixFd(u32),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    /// An array of dict entries, in insertion order with unique keys.
    Dict(Vec<(Value, Value)>),
    Variant(Box<Variant>),
}

/// A D-Bus variant: a value tagged with its single complete type.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub signature: SignatureType,
    pub value: Value,
}

impl Variant {
    /// Create a variant, parsing the signature and verifying the value
    /// against it.
    pub fn new(signature: &str, value: Value) -> Result<Self, Error> {
        let signature = parse_single_type(signature)?;
        signature.verify(&value)?;
        Ok(Self { signature, value })
    }

    /// Create a variant from an already parsed type without re-verifying,
    /// for values that were just decoded against that type.
    pub(crate) fn unchecked(signature: SignatureType, value: Value) -> Self {
        Self { signature, value }
    }
}

impl Value {
    /// A short description of the value's kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Boolean(_) => "boolean",
            Value::Int16(_) => "int16",
            Value::Uint16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::Uint32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::Uint64(_) => "uint64",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::UnixFd(_) => "unix fd index",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Dict(_) => "dict",
            Value::Variant(_) => "variant",
        }
    }

    /// A variant value, verified against its signature.
    pub fn variant(signature: &str, value: Value) -> Result<Value, Error> {
        Ok(Value::Variant(Box::new(Variant::new(signature, value)?)))
    }

    /// View string-like values (`s`, `o`, `g`) as `&str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Unwrap one level of variant, if this is one.
    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(v) => Some(v),
            _ => None,
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Uint16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Rewrite every `h` value in a body from a caller-held raw fd number to an
/// index into a deduplicated fd array, returning the rewritten body and that
/// array.
///
/// This is the bridge between the high-level shape, where `h` carries the fd
/// itself, and the wire shape, where `h` is an index into the message's
/// attached fds.
pub fn replace_fds_with_idx(
    signature: &Signature,
    body: Vec<Value>,
) -> (Vec<Value>, Vec<u32>) {
    let mut fds: Vec<u32> = Vec::new();
    let body = signature
        .types
        .iter()
        .zip(body)
        .map(|(ty, value)| replace_fds(ty, value, &mut |fd| {
            match fds.iter().position(|&existing| existing == fd) {
                Some(idx) => idx as u32,
                None => {
                    fds.push(fd);
                    (fds.len() - 1) as u32
                }
            }
        }))
        .collect();
    (body, fds)
}

/// Rewrite every `h` value in a body from an fd-array index back to the raw
/// fd number found at that index. Out-of-range indexes map to `u32::MAX`.
pub fn replace_idx_with_fds(
    signature: &Signature,
    body: Vec<Value>,
    fds: &[u32],
) -> Vec<Value> {
    signature
        .types
        .iter()
        .zip(body)
        .map(|(ty, value)| {
            replace_fds(ty, value, &mut |idx| {
                fds.get(idx as usize).copied().unwrap_or(u32::MAX)
            })
        })
        .collect()
}

fn replace_fds(
    ty: &SignatureType,
    value: Value,
    replace: &mut impl FnMut(u32) -> u32,
) -> Value {
    // Only fd-bearing subtrees need rewriting; variants may hide fds behind
    // any signature, so they are always walked.
    if !ty.text.bytes().any(|c| c == b'h' || c == b'v') {
        return value;
    }
    match (ty.code, value) {
        (TypeCode::UnixFd, Value::UnixFd(fd)) => Value::UnixFd(replace(fd)),
        (TypeCode::Variant, Value::Variant(variant)) => {
            let Variant { signature, value } = *variant;
            let inner = replace_fds(&signature, value, replace);
            Value::Variant(Box::new(Variant::unchecked(signature, inner)))
        }
        (TypeCode::Struct, Value::Struct(fields)) => Value::Struct(
            ty.children
                .iter()
                .zip(fields)
                .map(|(child, field)| replace_fds(child, field, replace))
                .collect(),
        ),
        (TypeCode::Array, Value::Array(items)) => {
            let child = &ty.children[0];
            Value::Array(
                items
                    .into_iter()
                    .map(|item| replace_fds(child, item, replace))
                    .collect(),
            )
        }
        (TypeCode::Array, Value::Dict(entries)) => {
            let value_ty = &ty.children[0].children[1];
            Value::Dict(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, replace_fds(value_ty, v, replace)))
                    .collect(),
            )
        }
        (_, value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::parse_signature;

    #[test]
    fn test_variant_verifies() {
        assert!(Variant::new("u", Value::Uint32(42)).is_ok());
        assert!(Variant::new("u", Value::from("nope")).is_err());
        assert!(Variant::new("!", Value::Uint32(1)).is_err());
    }

    #[test]
    fn test_replace_fds_with_idx_dedupes() {
        let sig = parse_signature("hh").unwrap();
        let body = vec![Value::UnixFd(9), Value::UnixFd(9)];
        let (body, fds) = replace_fds_with_idx(&sig, body);
        assert_eq!(body, vec![Value::UnixFd(0), Value::UnixFd(0)]);
        assert_eq!(fds, vec![9]);
    }

    #[test]
    fn test_replace_fds_inside_containers() {
        let sig = parse_signature("a{sv}").unwrap();
        let body = vec![Value::Dict(vec![(
            Value::from("fd"),
            Value::variant("h", Value::UnixFd(7)).unwrap(),
        )])];
        let (body, fds) = replace_fds_with_idx(&sig, body);
        assert_eq!(fds, vec![7]);
        let Value::Dict(entries) = &body[0] else {
            panic!("expected a dict");
        };
        let variant = entries[0].1.as_variant().unwrap();
        assert_eq!(variant.value, Value::UnixFd(0));
    }

    #[test]
    fn test_replace_idx_with_fds() {
        let sig = parse_signature("ah").unwrap();
        let body = vec![Value::Array(vec![Value::UnixFd(0), Value::UnixFd(1)])];
        let body = replace_idx_with_fds(&sig, body, &[33, 44]);
        assert_eq!(
            body,
            vec![Value::Array(vec![Value::UnixFd(33), Value::UnixFd(44)])]
        );
    }

    #[test]
    fn test_fd_free_body_untouched() {
        let sig = parse_signature("si").unwrap();
        let body = vec![Value::from("x"), Value::Int32(-1)];
        let (out, fds) = replace_fds_with_idx(&sig, body.clone());
        assert_eq!(out, body);
        assert!(fds.is_empty());
    }
}
