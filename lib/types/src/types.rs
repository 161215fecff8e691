//! Value and function types, reduced to what code placement needs to know.
use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// A list of all possible value types in WebAssembly.
#[derive(Copy, Debug, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Type {
    /// Signed 32 bit integer.
    I32,
    /// Signed 64 bit integer.
    I64,
    /// Floating point 32 bit integer.
    F32,
    /// Floating point 64 bit integer.
    F64,
    /// A 128 bit number.
    V128,
    /// A reference to opaque data in the Wasm instance.
    ExternRef,
    /// A reference to a Wasm function.
    FuncRef,
    /// A reference to a Wasm exception.
    ExceptionRef,
}

impl Type {
    /// Whether a value of this type can cross the boundary into JIT-compiled
    /// host code without being boxed by the interpreter entry.
    pub fn is_exposable(self) -> bool {
        !matches!(self, Self::V128 | Self::ExceptionRef)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::V128 => "v128",
            Self::ExternRef => "externref",
            Self::FuncRef => "funcref",
            Self::ExceptionRef => "exnref",
        };
        f.write_str(name)
    }
}

/// The signature of a function that is either implemented
/// in a Wasm module or exposed to Wasm by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FunctionType {
    params: Box<[Type]>,
    results: Box<[Type]>,
}

impl FunctionType {
    /// Creates a new Function Type with the given parameter and return types.
    pub fn new<Params, Returns>(params: Params, returns: Returns) -> Self
    where
        Params: Into<Box<[Type]>>,
        Returns: Into<Box<[Type]>>,
    {
        Self {
            params: params.into(),
            results: returns.into(),
        }
    }

    /// Parameter types.
    pub fn params(&self) -> &[Type] {
        &self.params
    }

    /// Return types.
    pub fn results(&self) -> &[Type] {
        &self.results
    }

    /// Whether callers coming from JIT code may use a dedicated JIT entry
    /// stub for this signature. Signatures carrying a value that JIT code
    /// cannot represent always go through the interpreter entry.
    pub fn can_have_jit_entry(&self) -> bool {
        self.params
            .iter()
            .chain(self.results.iter())
            .all(|ty| ty.is_exposable())
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let results = self
            .results
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "[{params}] -> [{results}]")
    }
}
