//! FFI Type System
//!
//! Descriptors and values exchanged between callers and native code.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::FfiError;

/// Element type of an array argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// 8-bit unsigned integer
    Byte,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit floating point
    Float,
    /// 64-bit floating point
    Double,
}

impl ElementType {
    /// Get the size in bytes of one element
    pub fn size(&self) -> usize {
        match self {
            ElementType::Byte => 1,
            ElementType::Int32 | ElementType::Float => 4,
            ElementType::Int64 | ElementType::Double => 8,
        }
    }

    /// Parse from a string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "u8" | "uint8" | "uint8_t" | "byte" => Some(ElementType::Byte),
            "i32" | "int32" | "int32_t" | "int" => Some(ElementType::Int32),
            "i64" | "int64" | "int64_t" | "long" => Some(ElementType::Int64),
            "f32" | "float" => Some(ElementType::Float),
            "f64" | "double" => Some(ElementType::Double),
            _ => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Byte => write!(f, "u8"),
            ElementType::Int32 => write!(f, "i32"),
            ElementType::Int64 => write!(f, "i64"),
            ElementType::Float => write!(f, "f32"),
            ElementType::Double => write!(f, "f64"),
        }
    }
}

/// Shape of a value for marshaling purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    /// No value (return only)
    Void,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit floating point
    Float,
    /// 64-bit floating point
    Double,
    /// Raw pointer (usize, platform-dependent)
    Pointer,
    /// Null-terminated C string (const char*)
    String,
    /// Null reference, passed as a zero pointer
    Null,
    /// Array passed as a pointer to its first element
    Array(ElementType),
}

impl TypeDescriptor {
    /// Check if this descriptor occupies a pointer-sized slot
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            TypeDescriptor::Pointer
                | TypeDescriptor::String
                | TypeDescriptor::Null
                | TypeDescriptor::Array(_)
        )
    }

    /// Check if this descriptor may be used as a return type
    pub fn is_valid_return(&self) -> bool {
        !matches!(self, TypeDescriptor::Null | TypeDescriptor::Array(_))
    }

    /// Parse from a string representation
    ///
    /// Arrays are written with a `[]` suffix, e.g. `i32[]`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(elem) = s.strip_suffix("[]") {
            return ElementType::parse(elem).map(TypeDescriptor::Array);
        }
        match s.to_lowercase().as_str() {
            "void" => Some(TypeDescriptor::Void),
            "i32" | "int32" | "int32_t" | "int" => Some(TypeDescriptor::Int32),
            "i64" | "int64" | "int64_t" | "long" => Some(TypeDescriptor::Int64),
            "f32" | "float" => Some(TypeDescriptor::Float),
            "f64" | "double" => Some(TypeDescriptor::Double),
            "ptr" | "pointer" | "void*" => Some(TypeDescriptor::Pointer),
            "str" | "cstr" | "string" | "char*" | "const char*" => Some(TypeDescriptor::String),
            "null" => Some(TypeDescriptor::Null),
            _ => None,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Void => write!(f, "void"),
            TypeDescriptor::Int32 => write!(f, "i32"),
            TypeDescriptor::Int64 => write!(f, "i64"),
            TypeDescriptor::Float => write!(f, "f32"),
            TypeDescriptor::Double => write!(f, "f64"),
            TypeDescriptor::Pointer => write!(f, "ptr"),
            TypeDescriptor::String => write!(f, "cstr"),
            TypeDescriptor::Null => write!(f, "null"),
            TypeDescriptor::Array(elem) => write!(f, "{}[]", elem),
        }
    }
}

/// Native calling convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallingConvention {
    /// Platform default C convention
    #[default]
    Cdecl,
    /// Callee-cleanup convention (only distinct on 32-bit x86)
    Stdcall,
}

impl CallingConvention {
    /// Parse from a string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cdecl" | "c" | "default" => Some(CallingConvention::Cdecl),
            "stdcall" | "winapi" | "system" => Some(CallingConvention::Stdcall),
            _ => None,
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::Cdecl => write!(f, "cdecl"),
            CallingConvention::Stdcall => write!(f, "stdcall"),
        }
    }
}

/// Owned array argument
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    Byte(Vec<u8>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl ArrayValue {
    /// Element type of this array
    pub fn element_type(&self) -> ElementType {
        match self {
            ArrayValue::Byte(_) => ElementType::Byte,
            ArrayValue::Int32(_) => ElementType::Int32,
            ArrayValue::Int64(_) => ElementType::Int64,
            ArrayValue::Float(_) => ElementType::Float,
            ArrayValue::Double(_) => ElementType::Double,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Byte(v) => v.len(),
            ArrayValue::Int32(v) => v.len(),
            ArrayValue::Int64(v) => v.len(),
            ArrayValue::Float(v) => v.len(),
            ArrayValue::Double(v) => v.len(),
        }
    }

    /// Check if the array has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of the first element
    pub fn as_ptr(&self) -> *const std::ffi::c_void {
        match self {
            ArrayValue::Byte(v) => v.as_ptr().cast(),
            ArrayValue::Int32(v) => v.as_ptr().cast(),
            ArrayValue::Int64(v) => v.as_ptr().cast(),
            ArrayValue::Float(v) => v.as_ptr().cast(),
            ArrayValue::Double(v) => v.as_ptr().cast(),
        }
    }
}

/// A value that can be passed to or returned from native functions
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    /// Pointer value
    Pointer(usize),
    /// Owned string, passed as a NUL-terminated copy
    String(String),
    /// Null reference
    Null,
    /// Owned array, passed by address
    Array(ArrayValue),
}

impl Value {
    /// Get the descriptor of this value
    pub fn descriptor(&self) -> TypeDescriptor {
        match self {
            Value::Int32(_) => TypeDescriptor::Int32,
            Value::Int64(_) => TypeDescriptor::Int64,
            Value::Float(_) => TypeDescriptor::Float,
            Value::Double(_) => TypeDescriptor::Double,
            Value::Pointer(_) => TypeDescriptor::Pointer,
            Value::String(_) => TypeDescriptor::String,
            Value::Null => TypeDescriptor::Null,
            Value::Array(a) => TypeDescriptor::Array(a.element_type()),
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse a command-line literal
    ///
    /// Accepted forms: `null`, `<type>:<value>` (e.g. `i32:5`, `f64:9.2`,
    /// `str:hello`, `ptr:0x1000`) and `<elem>[]:<v,v,...>` (e.g. `i32[]:1,2,3`).
    pub fn parse_literal(s: &str) -> Result<Self, FfiError> {
        if s.eq_ignore_ascii_case("null") {
            return Ok(Value::Null);
        }
        let (ty, raw) = s
            .split_once(':')
            .ok_or_else(|| FfiError::invalid(format!("expected <type>:<value>, got '{}'", s)))?;
        let descriptor = TypeDescriptor::parse(ty)
            .ok_or_else(|| FfiError::invalid(format!("unknown argument type '{}'", ty)))?;

        let bad = |e: &dyn fmt::Display| {
            FfiError::invalid(format!("bad {} literal '{}': {}", ty, raw, e))
        };
        match descriptor {
            TypeDescriptor::Int32 => raw.trim().parse().map(Value::Int32).map_err(|e| bad(&e)),
            TypeDescriptor::Int64 => raw.trim().parse().map(Value::Int64).map_err(|e| bad(&e)),
            TypeDescriptor::Float => raw.trim().parse().map(Value::Float).map_err(|e| bad(&e)),
            TypeDescriptor::Double => raw.trim().parse().map(Value::Double).map_err(|e| bad(&e)),
            TypeDescriptor::Pointer => parse_address(raw.trim())
                .map(Value::Pointer)
                .map_err(|e| bad(&e)),
            TypeDescriptor::String => Ok(Value::String(raw.to_string())),
            TypeDescriptor::Array(elem) => parse_array(elem, raw).map_err(|e| bad(&e)),
            TypeDescriptor::Void | TypeDescriptor::Null => Err(FfiError::invalid(format!(
                "'{}' is not an argument type",
                ty
            ))),
        }
    }
}

fn parse_address(s: &str) -> Result<usize, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_array(elem: ElementType, raw: &str) -> Result<Value, String> {
    fn items<T: std::str::FromStr>(raw: &str) -> Result<Vec<T>, String>
    where
        T::Err: fmt::Display,
    {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<T>().map_err(|e| e.to_string()))
            .collect()
    }

    let array = match elem {
        ElementType::Byte => ArrayValue::Byte(items(raw)?),
        ElementType::Int32 => ArrayValue::Int32(items(raw)?),
        ElementType::Int64 => ArrayValue::Int64(items(raw)?),
        ElementType::Float => ArrayValue::Float(items(raw)?),
        ElementType::Double => ArrayValue::Double(items(raw)?),
    };
    Ok(Value::Array(array))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Pointer(p) => write!(f, "{:#x}", p),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Null => write!(f, "null"),
            Value::Array(a) => write!(f, "{}[{}]", a.element_type(), a.len()),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
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

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Array(ArrayValue::Byte(v))
    }
}

impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Self {
        Value::Array(ArrayValue::Int32(v))
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::Array(ArrayValue::Int64(v))
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Array(ArrayValue::Float(v))
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(ArrayValue::Double(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
