//! Dataclasses for the VTP driver
//!
//! Error taxonomy, the status datagram and the
//! EVIO-like records the board writes into its
//! outgoing streams.

pub mod constants;
pub mod errors;
pub mod serialization;
pub mod status;
pub mod evio;

#[macro_use] extern crate log;

pub use errors::{
  VtpError,
  SerializationError,
};

/// Create a struct with random field values,
/// used to test (de)serialization
#[cfg(feature = "random")]
pub trait FromRandom {
  fn from_random() -> Self;
}

/// Clamp a value into [min, max].
///
/// The hardware silently accepts out of range values,
/// so the driver clamps and logs a ProtocolViolation
/// instead of rejecting the request.
pub fn clamp_with_warning(what  : &str,
                          value : u32,
                          min   : u32,
                          max   : u32) -> u32 {
  let applied = value.clamp(min, max);
  if applied != value {
    let err = VtpError::ProtocolViolation {
      what      : String::from(what),
      requested : value as u64,
      applied   : applied as u64,
    };
    warn!("{err}");
  }
  applied
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clamp_keeps_values_in_range() {
    assert_eq!(clamp_with_warning("mtu", 1500, 576, 9000), 1500);
    assert_eq!(clamp_with_warning("mtu", 100, 576, 9000), 576);
    assert_eq!(clamp_with_warning("mtu", 20000, 576, 9000), 9000);
  }
}
