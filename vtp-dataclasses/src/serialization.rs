//! Serialization/Deserialization helpers
//!
//! Everything that leaves the board over the
//! network is big endian (network byte order),
//! the register words in the FIFOs are native
//! u32 and get converted at the very end.

// re-exports
pub use crate::errors::SerializationError;

pub fn parse_u8(bs : &[u8], pos : &mut usize) -> u8 {
  let value = bs[*pos];
  *pos += 1;
  value
}

/// Get a big endian u16 from a bytestream and
/// move on the position marker
pub fn parse_u16_be(bs : &[u8], pos : &mut usize) -> u16 {
  let value = u16::from_be_bytes([bs[*pos], bs[*pos+1]]);
  *pos += 2;
  value
}

pub fn parse_u32_be(bs : &[u8], pos : &mut usize) -> u32 {
  let value = u32::from_be_bytes([bs[*pos], bs[*pos+1], bs[*pos+2], bs[*pos+3]]);
  *pos += 4;
  value
}

pub fn parse_u64_be(bs : &[u8], pos : &mut usize) -> u64 {
  let value = u64::from_be_bytes([bs[*pos],   bs[*pos+1], bs[*pos+2], bs[*pos+3],
                                  bs[*pos+4], bs[*pos+5], bs[*pos+6], bs[*pos+7]]);
  *pos += 8;
  value
}

/// Flatten 32bit words into a big endian byte stream
pub fn u32_to_u8_be(words : &[u32]) -> Vec<u8> {
  words.iter()
    .flat_map(|&n| n.to_be_bytes())
    .collect()
}

/// Restore 32bit words from a big endian byte stream.
///
/// Trailing bytes which do not make up a full
/// word are ignored.
pub fn u8_to_u32_be(bytes : &[u8]) -> Vec<u32> {
  bytes.chunks_exact(4)
    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
    .collect()
}

/// Encode/decode structs to Vec::<u8> to send
/// over the network
pub trait Serialization {

  /// Two byte magic at the beginning of
  /// the stream (big endian)
  const HEAD : u16;
  /// The size of the serialized bytestream
  /// INCLUDING the head. Variable sized
  /// structs leave this at 0.
  const SIZE : usize = 0;

  /// Check that there are enough bytes left
  /// for a fixed size struct and that the head
  /// sits at `pos`. Does not advance `pos`.
  fn verify_fixed(stream : &[u8],
                  pos    : &usize) -> Result<(), SerializationError> {
    if Self::SIZE == 0 {
      // conceptional error, not a runtime condition
      panic!("verify_fixed can only be used for structs with a fixed size!");
    }
    if stream.len() < *pos + Self::SIZE {
      return Err(SerializationError::StreamTooShort);
    }
    let mut head_pos = *pos;
    if parse_u16_be(stream, &mut head_pos) != Self::HEAD {
      return Err(SerializationError::HeadInvalid);
    }
    Ok(())
  }

  /// Decode a serializable from a bytestream
  fn from_bytestream(stream : &[u8],
                     pos    : &mut usize)
    -> Result<Self, SerializationError>
    where Self : Sized;

  /// Encode a serializable to a bytestream
  fn to_bytestream(&self) -> Vec<u8>;
}

#[cfg(test)]
mod test_serialization {
  use super::*;

  #[test]
  fn big_endian_helpers_advance_position() {
    let stream = vec![0x4c, 0x43, 0x00, 0x00, 0x01, 0x02, 0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 0, 0, 0, 42];
    let mut pos = 0usize;
    assert_eq!(parse_u16_be(&stream, &mut pos), 0x4c43);
    assert_eq!(parse_u8(&stream, &mut pos), 0);
    assert_eq!(parse_u8(&stream, &mut pos), 0);
    assert_eq!(parse_u16_be(&stream, &mut pos), 0x0102);
    assert_eq!(parse_u32_be(&stream, &mut pos), 0xdeadbeef);
    assert_eq!(parse_u64_be(&stream, &mut pos), 42);
    assert_eq!(pos, stream.len());
  }

  #[test]
  fn words_to_bytes_and_back() {
    let words = vec![0xc0da0100u32, 0x1, 0xffd10100];
    let bytes = u32_to_u8_be(&words);
    assert_eq!(bytes.len(), 12);
    assert_eq!(&bytes[0..4], &[0xc0, 0xda, 0x01, 0x00]);
    assert_eq!(u8_to_u32_be(&bytes), words);
  }
}
