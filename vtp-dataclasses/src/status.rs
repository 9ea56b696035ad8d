//! The status/sync datagram
//!
//! Once per second the board sends a small UDP
//! datagram to the downstream aggregator. It
//! announces the current frame number and event
//! rate so that the receiving side can align
//! the streams of several boards.
//!
//! Layout (28 bytes, big endian):
//!
//! | bytes  | field           |
//! |--------|-----------------|
//! | 0..2   | 'L','C'         |
//! | 2      | version  (u8)   |
//! | 3      | reserved (u8)   |
//! | 4..8   | source id (u32) |
//! | 8..16  | frame number (u64) |
//! | 16..20 | event rate Hz (u32) |
//! | 20..28 | timestamp ns (u64) |

use std::fmt;

#[cfg(feature = "random")]
use crate::FromRandom;
#[cfg(feature = "random")]
extern crate rand;
#[cfg(feature = "random")]
use rand::Rng;

use crate::serialization::{
  parse_u8,
  parse_u32_be,
  parse_u64_be,
  Serialization,
  SerializationError,
};

pub const STATUS_DATAGRAM_VERSION : u8 = 1;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct StatusDatagram {
  pub version         : u8,
  pub reserved        : u8,
  pub source_id       : u32,
  pub frame_number    : u64,
  pub event_rate_hz   : u32,
  pub timestamp_nanos : u64,
}

impl StatusDatagram {
  pub fn new() -> Self {
    Self {
      version         : STATUS_DATAGRAM_VERSION,
      reserved        : 0,
      source_id       : 0,
      frame_number    : 0,
      event_rate_hz   : 0,
      timestamp_nanos : 0,
    }
  }

  /// A datagram stamped with the current wall clock
  pub fn now(source_id     : u32,
             frame_number  : u64,
             event_rate_hz : u32) -> Self {
    let mut dg          = Self::new();
    dg.source_id        = source_id;
    dg.frame_number     = frame_number;
    dg.event_rate_hz    = event_rate_hz;
    dg.timestamp_nanos  = chrono::Utc::now()
      .timestamp_nanos_opt()
      .unwrap_or(0) as u64;
    dg
  }
}

impl Default for StatusDatagram {
  fn default() -> Self {
    Self::new()
  }
}

impl Serialization for StatusDatagram {
  /// 'L' 'C'
  const HEAD : u16   = 0x4c43;
  const SIZE : usize = 28;

  fn from_bytestream(stream : &[u8],
                     pos    : &mut usize)
    -> Result<Self, SerializationError> {
    Self::verify_fixed(stream, pos)?;
    *pos += 2;
    let mut dg         = StatusDatagram::new();
    dg.version         = parse_u8(stream, pos);
    dg.reserved        = parse_u8(stream, pos);
    dg.source_id       = parse_u32_be(stream, pos);
    dg.frame_number    = parse_u64_be(stream, pos);
    dg.event_rate_hz   = parse_u32_be(stream, pos);
    dg.timestamp_nanos = parse_u64_be(stream, pos);
    Ok(dg)
  }

  fn to_bytestream(&self) -> Vec<u8> {
    let mut bs = Vec::<u8>::with_capacity(Self::SIZE);
    bs.extend_from_slice(&Self::HEAD.to_be_bytes());
    bs.push(self.version);
    bs.push(self.reserved);
    bs.extend_from_slice(&self.source_id.to_be_bytes());
    bs.extend_from_slice(&self.frame_number.to_be_bytes());
    bs.extend_from_slice(&self.event_rate_hz.to_be_bytes());
    bs.extend_from_slice(&self.timestamp_nanos.to_be_bytes());
    bs
  }
}

#[cfg(feature = "random")]
impl FromRandom for StatusDatagram {
  fn from_random() -> Self {
    let mut rng = rand::thread_rng();
    Self {
      version         : rng.gen::<u8>(),
      reserved        : rng.gen::<u8>(),
      source_id       : rng.gen::<u32>(),
      frame_number    : rng.gen::<u64>(),
      event_rate_hz   : rng.gen::<u32>(),
      timestamp_nanos : rng.gen::<u64>(),
    }
  }
}

impl fmt::Display for StatusDatagram {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<StatusDatagram");
    repr += &(format!("\n  version      : {}", self.version));
    repr += &(format!("\n  source id    : {}", self.source_id));
    repr += &(format!("\n  frame number : {}", self.frame_number));
    repr += &(format!("\n  rate [Hz]    : {}", self.event_rate_hz));
    repr += &(format!("\n  timestamp    : {}>", self.timestamp_nanos));
    write!(f, "{}", repr)
  }
}

#[cfg(test)]
mod test_status {
  use super::*;

  #[test]
  fn layout_is_28_bytes_and_starts_with_lc() {
    let mut dg       = StatusDatagram::new();
    dg.source_id     = 0x01020304;
    dg.frame_number  = 0x1122334455667788;
    let bs           = dg.to_bytestream();
    assert_eq!(bs.len(), StatusDatagram::SIZE);
    assert_eq!(bs[0], b'L');
    assert_eq!(bs[1], b'C');
    assert_eq!(bs[2], STATUS_DATAGRAM_VERSION);
    assert_eq!(&bs[4..8],  &[1, 2, 3, 4]);
    assert_eq!(&bs[8..16], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
  }

  #[test]
  fn wrong_head_is_rejected() {
    let mut bs = StatusDatagram::new().to_bytestream();
    bs[0] = b'X';
    let result = StatusDatagram::from_bytestream(&bs, &mut 0);
    assert_eq!(result, Err(SerializationError::HeadInvalid));
  }

  #[test]
  fn short_stream_is_rejected() {
    let bs = StatusDatagram::new().to_bytestream();
    let result = StatusDatagram::from_bytestream(&bs[0..20], &mut 0);
    assert_eq!(result, Err(SerializationError::StreamTooShort));
  }
}
