//! Error types.
//!
//! Allocation failures surface as `None`/null at the public boundary; the
//! `try_*` variants and configuration parsing report these instead.

use thiserror::Error;

/// Why an allocation could not be satisfied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
  /// The OS refused to hand out more memory.
  #[error("out of memory: could not obtain {0} bytes from the OS")]
  OutOfMemory(usize),
  /// Size arithmetic (count * size, rounding to a class) overflowed.
  #[error("requested size overflows the address space")]
  SizeOverflow,
  #[error("alignment {0} is not a power of two")]
  InvalidAlignment(usize),
  #[error("no arena with id {0}")]
  UnknownArena(usize),
  /// The OS returned an address the extent tracker cannot index.
  #[error("address {0:#x} is outside the trackable address space")]
  Unaddressable(usize),
  #[error(transparent)]
  Config(#[from] ConfigError),
}

/// Rejected configuration input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("unknown option `{0}`")]
  UnknownKey(String),
  #[error("invalid value `{value}` for option `{key}`")]
  InvalidValue { key: String, value: String },
  #[error("option `{key}` out of range: {reason}")]
  OutOfRange { key: &'static str, reason: &'static str },
}

/// Caller contract violations detected on the free path.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
  /// The pointer was never issued by this heap, or its extent is gone.
  #[error("pointer {0:#x} was not allocated by this heap")]
  UnknownPointer(usize),
  /// The region is already free.
  #[error("double free of {0:#x}")]
  DoubleFree(usize),
  /// The pointer falls inside an allocation but not at its start.
  #[error("pointer {0:#x} does not point to the start of an allocation")]
  InteriorPointer(usize),
}

impl Misuse {
  pub fn addr(&self) -> usize {
    match *self {
      Self::UnknownPointer(a) | Self::DoubleFree(a) | Self::InteriorPointer(a) => a,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn config_error_converts_into_alloc_error() {
    let err: AllocError = ConfigError::UnknownKey("bogus".into()).into();
    assert_eq!(err.to_string(), "unknown option `bogus`");
  }

  #[test]
  fn misuse_reports_address() {
    let m = Misuse::DoubleFree(0x1000);
    assert_eq!(m.addr(), 0x1000);
    assert_eq!(m.to_string(), "double free of 0x1000");
  }
}
