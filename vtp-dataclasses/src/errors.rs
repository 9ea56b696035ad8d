//! Error types for the VTP driver
//!
//! The driver never aborts the process on a hardware
//! fault. Every failure is handed back to the caller
//! as one of the variants below, together with a
//! diagnostic which is also logged at the place where
//! the failure was detected.

use std::error::Error;
use std::fmt;

/// Failures of the board level operations
#[derive(Debug, Clone, PartialEq)]
pub enum VtpError {
  /// The device node is absent or the
  /// register window can not be mapped
  HardwareUnavailable(String),
  /// The shared lock segment was created by
  /// an incompatible build (declared size differs)
  VersionMismatch {
    expected : usize,
    found    : usize,
  },
  /// The process shared mutex can not be
  /// recovered after its owner died
  LockUnrecoverable,
  /// A bounded polling loop was exhausted
  Timeout {
    what     : String,
    attempts : u32,
  },
  /// A programmed value was outside of the
  /// range the hardware accepts.
  /// These get clamped and logged, the variant
  /// carries what has been requested and what
  /// has actually been applied.
  ProtocolViolation {
    what      : String,
    requested : u64,
    applied   : u64,
  },
  /// Malformed or missing configuration
  ConfigError(String),
  /// A hardware FIFO is full or a record is
  /// too large to ever fit
  ResourceExhausted {
    what      : String,
    requested : usize,
    available : usize,
  },
  /// Register access which is unaligned or
  /// outside of the mapped window
  InvalidOffset(u32),
  /// A setter was not latched by the hardware
  VerifyFailed {
    offset : u32,
    wrote  : u32,
    read   : u32,
  },
  /// The loaded firmware profile does not own
  /// the requested register block
  NotSupported(String),
  /// Operation issued in the wrong lifecycle state
  InvalidState(String),
}

impl VtpError {
  /// A short name of the failure class, used
  /// for logging and the Display impl
  pub fn kind(&self) -> &'static str {
    match self {
      VtpError::HardwareUnavailable(_)    => "HardwareUnavailable",
      VtpError::VersionMismatch {..}      => "VersionMismatch",
      VtpError::LockUnrecoverable         => "LockUnrecoverable",
      VtpError::Timeout {..}              => "Timeout",
      VtpError::ProtocolViolation {..}    => "ProtocolViolation",
      VtpError::ConfigError(_)            => "ConfigError",
      VtpError::ResourceExhausted {..}    => "ResourceExhausted",
      VtpError::InvalidOffset(_)          => "InvalidOffset",
      VtpError::VerifyFailed {..}         => "VerifyFailed",
      VtpError::NotSupported(_)           => "NotSupported",
      VtpError::InvalidState(_)           => "InvalidState",
    }
  }

  /// Self-healing conditions are retried or
  /// reset automatically by the driver, everything
  /// else is left to the operator.
  pub fn is_recoverable(&self) -> bool {
    match self {
      VtpError::Timeout {..}           => true,
      VtpError::ProtocolViolation {..} => true,
      VtpError::ResourceExhausted {..} => true,
      _                                => false,
    }
  }
}

impl fmt::Display for VtpError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let detail : String;
    match self {
      VtpError::HardwareUnavailable(msg) => {
        detail = msg.clone();
      }
      VtpError::VersionMismatch { expected, found } => {
        detail = format!("lock segment has {found} bytes, this build expects {expected}");
      }
      VtpError::LockUnrecoverable => {
        detail = String::from("board mutex is not recoverable, operator intervention required");
      }
      VtpError::Timeout { what, attempts } => {
        detail = format!("{what} (gave up after {attempts} attempts)");
      }
      VtpError::ProtocolViolation { what, requested, applied } => {
        detail = format!("{what}: requested {requested}, applied {applied}");
      }
      VtpError::ConfigError(msg) => {
        detail = msg.clone();
      }
      VtpError::ResourceExhausted { what, requested, available } => {
        detail = format!("{what}: need {requested}, have {available}");
      }
      VtpError::InvalidOffset(offset) => {
        detail = format!("register offset {:#06x} is unaligned or out of range", offset);
      }
      VtpError::VerifyFailed { offset, wrote, read } => {
        detail = format!("register {:#06x} wrote {:#010x} read back {:#010x}", offset, wrote, read);
      }
      VtpError::NotSupported(msg) => {
        detail = msg.clone();
      }
      VtpError::InvalidState(msg) => {
        detail = msg.clone();
      }
    }
    write!(f, "<VtpError {}: {}>", self.kind(), detail)
  }
}

impl Error for VtpError {
}

/// Indicate issues with (de)serialization
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SerializationError {
  HeadInvalid,
  StreamTooShort,
  WrongByteSize,
  UnknownControlType,
  JsonDecodingError,
  TomlDecodingError,
}

impl SerializationError {
  pub fn to_string(&self) -> String {
    match self {
      SerializationError::HeadInvalid        => {return String::from("HeadInvalid");},
      SerializationError::StreamTooShort     => {return String::from("StreamTooShort");},
      SerializationError::WrongByteSize      => {return String::from("WrongByteSize");},
      SerializationError::UnknownControlType => {return String::from("UnknownControlType");},
      SerializationError::JsonDecodingError  => {return String::from("JsonDecodingError");},
      SerializationError::TomlDecodingError  => {return String::from("TomlDecodingError");},
    }
  }
}

impl fmt::Display for SerializationError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = self.to_string();
    write!(f, "<Serialization Error : {}>", repr)
  }
}

impl Error for SerializationError {
}

#[cfg(test)]
mod test_errors {
  use super::*;

  #[test]
  fn timeout_is_recoverable_lock_is_not() {
    let timeout = VtpError::Timeout { what : String::from("dma wait"), attempts : 10 };
    assert!(timeout.is_recoverable());
    assert!(!VtpError::LockUnrecoverable.is_recoverable());
    assert!(!VtpError::HardwareUnavailable(String::from("no /dev/uio0")).is_recoverable());
  }

  #[test]
  fn display_carries_kind() {
    let err  = VtpError::VerifyFailed { offset : 0x2010, wrote : 1, read : 0 };
    let repr = format!("{}", err);
    assert!(repr.starts_with("<VtpError VerifyFailed"));
    assert!(repr.contains("0x2010"));
  }
}
