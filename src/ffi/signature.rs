//! Signature Keys
//!
//! A key names a call shape, not a function: every native function with the
//! same convention, return descriptor and argument descriptors shares one stub.

use std::fmt;

use super::types::{CallingConvention, TypeDescriptor, Value};

/// Canonical identity of a call shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureKey {
    convention: CallingConvention,
    ret: TypeDescriptor,
    args: Vec<TypeDescriptor>,
}

impl SignatureKey {
    /// Create a key from explicit descriptors
    pub fn new(
        convention: CallingConvention,
        ret: TypeDescriptor,
        args: Vec<TypeDescriptor>,
    ) -> Self {
        Self {
            convention,
            ret,
            args,
        }
    }

    /// Derive the key for a call from its argument values
    pub fn for_call(convention: CallingConvention, ret: TypeDescriptor, args: &[Value]) -> Self {
        Self::new(convention, ret, args.iter().map(Value::descriptor).collect())
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn return_type(&self) -> TypeDescriptor {
        self.ret
    }

    pub fn args(&self) -> &[TypeDescriptor] {
        &self.args
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.ret, self.convention)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}
