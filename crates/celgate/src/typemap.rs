//! Declared types and their mapping into the expression type system.
//!
//! Custom overloads and variables are declared with a compact type syntax
//! shared between external configuration and extension-embedded rule data:
//! primitives by name, named message types by fully-qualified name,
//! `list<T>`, and `map<K, V>`.

use celgate_cel::CelType;
use serde::Deserialize;

use crate::error::Error;

/// Primitive declared types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Bool,
    Int,
    UInt,
    Double,
    Bytes,
    String,
    Duration,
    Timestamp,
    Error,
    Dyn,
    Any,
}

impl Primitive {
    fn from_name(name: &str) -> Option<Primitive> {
        match name {
            "bool" => Some(Primitive::Bool),
            "int" => Some(Primitive::Int),
            "uint" => Some(Primitive::UInt),
            "double" => Some(Primitive::Double),
            "bytes" => Some(Primitive::Bytes),
            "string" => Some(Primitive::String),
            "duration" => Some(Primitive::Duration),
            "timestamp" => Some(Primitive::Timestamp),
            "error" => Some(Primitive::Error),
            "dyn" => Some(Primitive::Dyn),
            "any" => Some(Primitive::Any),
            _ => None,
        }
    }
}

/// A type as declared in rule options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum DeclaredType {
    Primitive(Primitive),
    /// A named message type.
    Object(String),
    /// `list<T>`.
    Array(Box<DeclaredType>),
    /// `map<K, V>`.
    Map(Box<DeclaredType>, Box<DeclaredType>),
}

impl DeclaredType {
    /// Parse the compact type syntax: `"string"`, `"pkg.Message"`,
    /// `"list<string>"`, `"map<string, int>"`.
    pub fn parse(input: &str) -> Result<DeclaredType, Error> {
        let mut cursor = Cursor::new(input);
        let parsed = cursor.parse_type()?;
        cursor.skip_whitespace();
        if !cursor.at_end() {
            return Err(cursor.fail("trailing input"));
        }
        Ok(parsed)
    }

    /// Map into the expression type system.
    ///
    /// This is the dispatch table the environment builder declares overload
    /// signatures with.
    pub fn to_cel_type(&self) -> CelType {
        match self {
            DeclaredType::Primitive(primitive) => match primitive {
                Primitive::Bool => CelType::Bool,
                Primitive::Int => CelType::Int,
                Primitive::UInt => CelType::UInt,
                Primitive::Double => CelType::Double,
                Primitive::Bytes => CelType::Bytes,
                Primitive::String => CelType::String,
                Primitive::Duration => CelType::Duration,
                Primitive::Timestamp => CelType::Timestamp,
                Primitive::Error => CelType::Error,
                Primitive::Dyn => CelType::Dyn,
                Primitive::Any => CelType::Any,
            },
            DeclaredType::Object(name) => CelType::message(name),
            DeclaredType::Array(elem) => CelType::list(elem.to_cel_type()),
            DeclaredType::Map(key, value) => {
                CelType::map(key.to_cel_type(), value.to_cel_type())
            }
        }
    }
}

impl TryFrom<String> for DeclaredType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Error> {
        DeclaredType::parse(&value)
    }
}

impl std::fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_cel_type().display_name())
    }
}

/// A custom function signature declared in rule options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FunctionSignature {
    /// Argument types, receiver first for member functions.
    pub args: Vec<DeclaredType>,
    /// Result type.
    pub result: DeclaredType,
    /// Whether the function is called as `receiver.f(args)`.
    pub member: bool,
}

impl Default for FunctionSignature {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            result: DeclaredType::Primitive(Primitive::Bool),
            member: false,
        }
    }
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn fail(&self, reason: &str) -> Error {
        Error::InvalidDeclaredType {
            input: self.input.to_string(),
            reason: reason.to_string(),
        }
    }

    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while self.rest().starts_with(|c: char| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_whitespace();
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn name(&mut self) -> Result<&'a str, Error> {
        self.skip_whitespace();
        let start = self.pos;
        let bytes = self.input.as_bytes();
        while self.pos < bytes.len() {
            let c = bytes[self.pos] as char;
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.fail("expected a type name"));
        }
        Ok(&self.input[start..self.pos])
    }

    fn parse_type(&mut self) -> Result<DeclaredType, Error> {
        let name = self.name()?;
        match name {
            "list" => {
                if !self.eat('<') {
                    return Err(self.fail("expected '<' after list"));
                }
                let elem = self.parse_type()?;
                if !self.eat('>') {
                    return Err(self.fail("expected '>' after list element type"));
                }
                Ok(DeclaredType::Array(Box::new(elem)))
            }
            "map" => {
                if !self.eat('<') {
                    return Err(self.fail("expected '<' after map"));
                }
                let key = self.parse_type()?;
                if !self.eat(',') {
                    return Err(self.fail("expected ',' between map key and value"));
                }
                let value = self.parse_type()?;
                if !self.eat('>') {
                    return Err(self.fail("expected '>' after map value type"));
                }
                Ok(DeclaredType::Map(Box::new(key), Box::new(value)))
            }
            name => match Primitive::from_name(name) {
                Some(primitive) => Ok(DeclaredType::Primitive(primitive)),
                None => Ok(DeclaredType::Object(name.to_string())),
            },
        }
    }
}
