//! Trap codes describing the reason a trap site faults.

use std::fmt::{self, Display, Formatter};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A trap code describing the reason for a trap.
///
/// Every trap site recorded in a code block carries one of these, so that the
/// signal handler can turn a faulting pc into a Wasm-level trap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Error)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum TrapCode {
    /// The current stack space was exhausted.
    StackOverflow = 0,

    /// A memory access was out of the bounds of the accessed memory.
    OutOfBounds = 1,

    /// An atomic memory access was attempted with an unaligned pointer.
    UnalignedAccess = 2,

    /// Indirect call to a null table entry.
    IndirectCallToNull = 3,

    /// Signature mismatch on indirect call.
    IndirectCallBadSig = 4,

    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow = 5,

    /// An integer division by zero.
    IntegerDivideByZero = 6,

    /// Failed float-to-int conversion.
    InvalidConversionToInteger = 7,

    /// Code that was supposed to have been unreachable was reached.
    Unreachable = 8,

    /// A null reference was dereferenced.
    NullPointerDereference = 9,

    /// A reference cast failed.
    BadCast = 10,

    /// A pending interrupt request was observed at a loop header or prologue.
    CheckInterrupt = 11,
}

impl TrapCode {
    /// Gets the message for this trap code
    pub fn message(&self) -> &str {
        match self {
            Self::StackOverflow => "call stack exhausted",
            Self::OutOfBounds => "out of bounds memory access",
            Self::UnalignedAccess => "unaligned memory access",
            Self::IndirectCallToNull => "indirect call to null",
            Self::IndirectCallBadSig => "indirect call signature mismatch",
            Self::IntegerOverflow => "integer overflow",
            Self::IntegerDivideByZero => "integer divide by zero",
            Self::InvalidConversionToInteger => "invalid conversion to integer",
            Self::Unreachable => "unreachable executed",
            Self::NullPointerDereference => "dereferencing null pointer",
            Self::BadCast => "bad cast",
            Self::CheckInterrupt => "interrupt requested",
        }
    }
}

impl Display for TrapCode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.message())
    }
}
