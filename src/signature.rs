//! D-Bus type signature parsing.
//!
//! A signature is a sequence of complete types. [`parse_signature`] turns the
//! string form into a tree of [`SignatureType`] nodes that the marshaller and
//! unmarshaller walk. The parser is total: it consumes the whole input or
//! fails with [`InvalidSignatureError`].

use std::fmt;
use std::str::FromStr;

use crate::error::{InvalidSignatureError, SignatureBodyMismatchError};
use crate::validators::is_object_path_valid;
use crate::value::Value;

/// Maximum nesting depth for arrays, and separately for structs/dict
/// entries, per the D-Bus specification.
const MAX_CONTAINER_DEPTH: usize = 32;

/// Maximum byte length of a signature string.
const MAX_SIGNATURE_LENGTH: usize = 255;

/// The type codes of the D-Bus type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    UnixFd,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array,
    Struct,
    DictEntry,
}

impl TypeCode {
    /// Map a signature character to its type code.
    pub fn from_code(c: u8) -> Option<TypeCode> {
        Some(match c {
            b'y' => TypeCode::Byte,
            b'b' => TypeCode::Boolean,
            b'n' => TypeCode::Int16,
            b'q' => TypeCode::Uint16,
            b'i' => TypeCode::Int32,
            b'u' => TypeCode::Uint32,
            b'x' => TypeCode::Int64,
            b't' => TypeCode::Uint64,
            b'd' => TypeCode::Double,
            b'h' => TypeCode::UnixFd,
            b's' => TypeCode::String,
            b'o' => TypeCode::ObjectPath,
            b'g' => TypeCode::Signature,
            b'v' => TypeCode::Variant,
            b'a' => TypeCode::Array,
            b'(' => TypeCode::Struct,
            b'{' => TypeCode::DictEntry,
            _ => return None,
        })
    }

    /// The signature character for this type.
    pub fn code(self) -> char {
        match self {
            TypeCode::Byte => 'y',
            TypeCode::Boolean => 'b',
            TypeCode::Int16 => 'n',
            TypeCode::Uint16 => 'q',
            TypeCode::Int32 => 'i',
            TypeCode::Uint32 => 'u',
            TypeCode::Int64 => 'x',
            TypeCode::Uint64 => 't',
            TypeCode::Double => 'd',
            TypeCode::UnixFd => 'h',
            TypeCode::String => 's',
            TypeCode::ObjectPath => 'o',
            TypeCode::Signature => 'g',
            TypeCode::Variant => 'v',
            TypeCode::Array => 'a',
            TypeCode::Struct => '(',
            TypeCode::DictEntry => '{',
        }
    }

    /// Natural alignment of values of this type in the wire format.
    pub fn alignment(self) -> usize {
        match self {
            TypeCode::Byte | TypeCode::Signature | TypeCode::Variant => 1,
            TypeCode::Int16 | TypeCode::Uint16 => 2,
            TypeCode::Boolean
            | TypeCode::Int32
            | TypeCode::Uint32
            | TypeCode::UnixFd
            | TypeCode::String
            | TypeCode::ObjectPath
            | TypeCode::Array => 4,
            TypeCode::Int64
            | TypeCode::Uint64
            | TypeCode::Double
            | TypeCode::Struct
            | TypeCode::DictEntry => 8,
        }
    }

    /// Whether this is a basic (non-container) type.
    pub fn is_basic(self) -> bool {
        !matches!(
            self,
            TypeCode::Array | TypeCode::Struct | TypeCode::DictEntry | TypeCode::Variant
        )
    }
}

/// One complete type from a signature.
///
/// Arrays have one child, dict entries two (key and value), structs one per
/// field. Basic types and variants have none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureType {
    /// The signature text of this complete type, e.g. `a{sv}`.
    pub text: String,
    /// The type code of the outermost constructor.
    pub code: TypeCode,
    /// Child types for container types.
    pub children: Vec<SignatureType>,
}

impl SignatureType {
    fn basic(code: TypeCode) -> Self {
        Self {
            text: code.code().to_string(),
            code,
            children: Vec::new(),
        }
    }

    /// Verify that a value conforms to this type.
    pub fn verify(&self, value: &Value) -> Result<(), SignatureBodyMismatchError> {
        let mismatch = |expected: &str| {
            Err(SignatureBodyMismatchError(format!(
                "type '{}' expects {expected}, got {}",
                self.text,
                value.kind()
            )))
        };

        match self.code {
            TypeCode::Byte => match value {
                Value::Byte(_) => Ok(()),
                _ => mismatch("a byte"),
            },
            TypeCode::Boolean => match value {
                Value::Boolean(_) => Ok(()),
                _ => mismatch("a boolean"),
            },
            TypeCode::Int16 => match value {
                Value::Int16(_) => Ok(()),
                _ => mismatch("an int16"),
            },
            TypeCode::Uint16 => match value {
                Value::Uint16(_) => Ok(()),
                _ => mismatch("a uint16"),
            },
            TypeCode::Int32 => match value {
                Value::Int32(_) => Ok(()),
                _ => mismatch("an int32"),
            },
            TypeCode::Uint32 => match value {
                Value::Uint32(_) => Ok(()),
                _ => mismatch("a uint32"),
            },
            TypeCode::Int64 => match value {
                Value::Int64(_) => Ok(()),
                _ => mismatch("an int64"),
            },
            TypeCode::Uint64 => match value {
                Value::Uint64(_) => Ok(()),
                _ => mismatch("a uint64"),
            },
            TypeCode::Double => match value {
                Value::Double(_) => Ok(()),
                _ => mismatch("a double"),
            },
            TypeCode::UnixFd => match value {
                Value::UnixFd(_) => Ok(()),
                _ => mismatch("a unix fd index"),
            },
            TypeCode::String => match value {
                Value::String(_) => Ok(()),
                _ => mismatch("a string"),
            },
            TypeCode::ObjectPath => match value {
                Value::ObjectPath(path) if is_object_path_valid(path) => Ok(()),
                Value::ObjectPath(path) => Err(SignatureBodyMismatchError(format!(
                    "type 'o' requires a valid object path, got {path:?}"
                ))),
                _ => mismatch("an object path"),
            },
            TypeCode::Signature => match value {
                Value::Signature(text) => {
                    parse_signature(text).map_err(|e| SignatureBodyMismatchError(e.to_string()))?;
                    Ok(())
                }
                _ => mismatch("a signature"),
            },
            TypeCode::Variant => match value {
                Value::Variant(variant) => variant.signature.verify(&variant.value),
                _ => mismatch("a variant"),
            },
            TypeCode::Array => {
                let child = &self.children[0];
                if child.code == TypeCode::DictEntry {
                    let Value::Dict(entries) = value else {
                        return mismatch("a dict");
                    };
                    for (key, val) in entries {
                        child.children[0].verify(key)?;
                        child.children[1].verify(val)?;
                    }
                    Ok(())
                } else {
                    let Value::Array(items) = value else {
                        return mismatch("an array");
                    };
                    for item in items {
                        child.verify(item)?;
                    }
                    Ok(())
                }
            }
            TypeCode::Struct => {
                let Value::Struct(fields) = value else {
                    return mismatch("a struct");
                };
                if fields.len() != self.children.len() {
                    return Err(SignatureBodyMismatchError(format!(
                        "struct '{}' expects {} fields, got {}",
                        self.text,
                        self.children.len(),
                        fields.len()
                    )));
                }
                for (child, field) in self.children.iter().zip(fields) {
                    child.verify(field)?;
                }
                Ok(())
            }
            // Dict entries never appear outside arrays; the array arm above
            // handles them.
            TypeCode::DictEntry => mismatch("a dict entry inside an array"),
        }
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A parsed signature: an ordered list of complete types.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    /// The full signature text.
    pub text: String,
    /// The parsed complete types, in order.
    pub types: Vec<SignatureType>,
}

impl Signature {
    /// The empty signature.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this signature has no types.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Verify that a message body conforms to this signature, element for
    /// element.
    pub fn verify(&self, body: &[Value]) -> Result<(), SignatureBodyMismatchError> {
        if body.len() != self.types.len() {
            return Err(SignatureBodyMismatchError(format!(
                "signature '{}' expects {} values, got {}",
                self.text,
                self.types.len(),
                body.len()
            )));
        }
        for (ty, value) in self.types.iter().zip(body) {
            ty.verify(value)?;
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = InvalidSignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_signature(s)
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, InvalidSignatureError> {
        if !input.is_ascii() {
            return Err(InvalidSignatureError(format!(
                "signature must be ASCII: {input:?}"
            )));
        }
        if input.len() > MAX_SIGNATURE_LENGTH {
            return Err(InvalidSignatureError(format!(
                "signature exceeds {MAX_SIGNATURE_LENGTH} bytes"
            )));
        }
        Ok(Self {
            input: input.as_bytes(),
            pos: 0,
            array_depth: 0,
            struct_depth: 0,
        })
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn text_since(&self, start: usize) -> String {
        // The input was checked to be ASCII on construction.
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    /// Parse one complete type. `in_array` tracks whether the immediately
    /// enclosing constructor is an array, the only position where a dict
    /// entry may appear.
    fn parse_one(&mut self, in_array: bool) -> Result<SignatureType, InvalidSignatureError> {
        let start = self.pos;
        let c = self
            .peek()
            .ok_or_else(|| InvalidSignatureError("unexpected end of signature".into()))?;
        let code = TypeCode::from_code(c).ok_or_else(|| {
            InvalidSignatureError(format!("got unexpected type code: {:?}", c as char))
        })?;
        self.pos += 1;

        match code {
            TypeCode::Array => {
                self.array_depth += 1;
                if self.array_depth > MAX_CONTAINER_DEPTH {
                    return Err(InvalidSignatureError(format!(
                        "array nesting exceeds {MAX_CONTAINER_DEPTH}"
                    )));
                }
                if self.peek().is_none() {
                    return Err(InvalidSignatureError("missing type for array".into()));
                }
                let child = self.parse_one(true)?;
                self.array_depth -= 1;
                Ok(SignatureType {
                    text: self.text_since(start),
                    code,
                    children: vec![child],
                })
            }
            TypeCode::Struct => {
                self.struct_depth += 1;
                if self.struct_depth > MAX_CONTAINER_DEPTH {
                    return Err(InvalidSignatureError(format!(
                        "struct nesting exceeds {MAX_CONTAINER_DEPTH}"
                    )));
                }
                let mut children = Vec::new();
                loop {
                    match self.peek() {
                        None => {
                            return Err(InvalidSignatureError(
                                "missing closing \")\" for struct".into(),
                            ))
                        }
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => children.push(self.parse_one(false)?),
                    }
                }
                if children.is_empty() {
                    return Err(InvalidSignatureError("struct cannot be empty".into()));
                }
                self.struct_depth -= 1;
                Ok(SignatureType {
                    text: self.text_since(start),
                    code,
                    children,
                })
            }
            TypeCode::DictEntry => {
                if !in_array {
                    return Err(InvalidSignatureError(
                        "dict entry may only appear as an array element".into(),
                    ));
                }
                self.struct_depth += 1;
                if self.struct_depth > MAX_CONTAINER_DEPTH {
                    return Err(InvalidSignatureError(format!(
                        "struct nesting exceeds {MAX_CONTAINER_DEPTH}"
                    )));
                }
                let key = self.parse_one(false)?;
                if !key.code.is_basic() {
                    return Err(InvalidSignatureError(
                        "dict entry key must be a basic type".into(),
                    ));
                }
                let value = self.parse_one(false)?;
                match self.peek() {
                    Some(b'}') => self.pos += 1,
                    _ => {
                        return Err(InvalidSignatureError(
                            "missing closing \"}\" for dict entry".into(),
                        ))
                    }
                }
                self.struct_depth -= 1;
                Ok(SignatureType {
                    text: self.text_since(start),
                    code,
                    children: vec![key, value],
                })
            }
            _ => Ok(SignatureType::basic(code)),
        }
    }
}

/// Parse a signature string into its ordered list of complete types.
pub fn parse_signature(text: &str) -> Result<Signature, InvalidSignatureError> {
    let mut parser = Parser::new(text)?;
    let mut types = Vec::new();
    while parser.peek().is_some() {
        types.push(parser.parse_one(false)?);
    }
    Ok(Signature {
        text: text.to_string(),
        types,
    })
}

/// Parse a signature that must contain exactly one complete type.
pub fn parse_single_type(text: &str) -> Result<SignatureType, InvalidSignatureError> {
    let mut parser = Parser::new(text)?;
    if parser.peek().is_none() {
        return Err(InvalidSignatureError("empty signature".into()));
    }
    let ty = parser.parse_one(false)?;
    if parser.peek().is_some() {
        return Err(InvalidSignatureError(format!(
            "more than one complete type in {text:?}"
        )));
    }
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_types() {
        let sig = parse_signature("ybnqiuxtdsogvh").unwrap();
        assert_eq!(sig.types.len(), 14);
        assert_eq!(sig.types[0].code, TypeCode::Byte);
        assert_eq!(sig.types[13].code, TypeCode::UnixFd);
        assert_eq!(sig.to_string(), "ybnqiuxtdsogvh");
    }

    #[test]
    fn test_nested_containers() {
        let sig = parse_signature("a{s(ai)}").unwrap();
        assert_eq!(sig.types.len(), 1);
        let array = &sig.types[0];
        assert_eq!(array.code, TypeCode::Array);
        assert_eq!(array.text, "a{s(ai)}");
        let entry = &array.children[0];
        assert_eq!(entry.code, TypeCode::DictEntry);
        assert_eq!(entry.children[0].code, TypeCode::String);
        assert_eq!(entry.children[1].text, "(ai)");
    }

    #[test]
    fn test_each_complete_type_keeps_its_text() {
        let sig = parse_signature("asa{sv}s").unwrap();
        let texts: Vec<_> = sig.types.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["as", "a{sv}", "s"]);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_signature("z").is_err());
        assert!(parse_signature("a").is_err());
        assert!(parse_signature("(").is_err());
        assert!(parse_signature("()").is_err());
        assert!(parse_signature("(s").is_err());
        assert!(parse_signature("{ss}").is_err());
        assert!(parse_signature("a{vs}").is_err());
        assert!(parse_signature("a{ss").is_err());
        assert!(parse_signature("a{}").is_err());
    }

    #[test]
    fn test_depth_limits() {
        let deep_array = "a".repeat(33) + "y";
        assert!(parse_signature(&deep_array).is_err());
        let ok_array = "a".repeat(32) + "y";
        assert!(parse_signature(&ok_array).is_ok());

        let deep_struct = "(".repeat(33) + "y" + &")".repeat(33);
        assert!(parse_signature(&deep_struct).is_err());
    }

    #[test]
    fn test_length_limit() {
        let long = "i".repeat(256);
        assert!(parse_signature(&long).is_err());
    }

    #[test]
    fn test_single_type() {
        assert!(parse_single_type("a{sv}").is_ok());
        assert!(parse_single_type("ss").is_err());
        assert!(parse_single_type("").is_err());
    }

    #[test]
    fn test_verify_arity() {
        let sig = parse_signature("ss").unwrap();
        assert!(sig
            .verify(&[Value::from("a"), Value::from("b")])
            .is_ok());
        assert!(sig.verify(&[Value::from("a")]).is_err());
    }

    #[test]
    fn test_verify_object_path() {
        let ty = parse_single_type("o").unwrap();
        assert!(ty.verify(&Value::ObjectPath("/ok".into())).is_ok());
        assert!(ty.verify(&Value::ObjectPath("bad".into())).is_err());
        assert!(ty.verify(&Value::from("str")).is_err());
    }

    #[test]
    fn test_verify_struct_arity() {
        let ty = parse_single_type("(si)").unwrap();
        assert!(ty
            .verify(&Value::Struct(vec![Value::from("x"), Value::Int32(1)]))
            .is_ok());
        assert!(ty.verify(&Value::Struct(vec![Value::from("x")])).is_err());
    }
}
