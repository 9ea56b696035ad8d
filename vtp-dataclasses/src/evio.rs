//! Minimal EVIO-like framing
//!
//! The board emits two kinds of records itself,
//! everything else is framed by the firmware:
//!
//! * control events (SYNC, PRESTART, GO, PAUSE, END)
//!   which are injected into the outgoing stream
//!   at run transitions
//! * banks which the hardware ROC appends to its
//!   sync/async event FIFOs
//!
//! A record is a block header of 8 words followed
//! by one bank. A bank starts with its exclusive
//! length (number of words following the length
//! word) and a tag/type/num word.

use std::fmt;

use crate::serialization::SerializationError;

pub const EVIO_MAGIC             : u32 = 0xc0da0100;
pub const BLOCK_HEADER_WORDS     : usize = 8;
pub const EVIO_VERSION           : u32 = 4;
/// bit 9 of the version word - last block in stream
pub const LAST_BLOCK_BIT         : u32 = 1 << 9;
/// control events carry 3 data words
pub const CONTROL_PAYLOAD_WORDS  : usize = 3;
/// data type 0x01 - unsigned 32bit words
pub const DATA_TYPE_U32          : u8  = 0x01;
/// num field of CODA control events
pub const CONTROL_EVENT_NUM      : u8  = 0xcc;

/// CODA control event types, encoded
/// in the bank tag
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlEventType {
  Sync     = 0xffd0,
  Prestart = 0xffd1,
  Go       = 0xffd2,
  Pause    = 0xffd3,
  End      = 0xffd4,
}

impl ControlEventType {
  pub fn from_tag(tag : u16) -> Option<Self> {
    match tag {
      0xffd0 => Some(ControlEventType::Sync),
      0xffd1 => Some(ControlEventType::Prestart),
      0xffd2 => Some(ControlEventType::Go),
      0xffd3 => Some(ControlEventType::Pause),
      0xffd4 => Some(ControlEventType::End),
      _      => None,
    }
  }

  pub fn tag(&self) -> u16 {
    *self as u16
  }
}

impl fmt::Display for ControlEventType {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      ControlEventType::Sync     => "SYNC",
      ControlEventType::Prestart => "PRESTART",
      ControlEventType::Go       => "GO",
      ControlEventType::Pause    => "PAUSE",
      ControlEventType::End      => "END",
    };
    write!(f, "<ControlEventType: {}>", repr)
  }
}

/// Tag/type/num word of a bank
pub fn bank_header_word(tag : u16, data_type : u8, num : u8) -> u32 {
  ((tag as u32) << 16) | ((data_type as u32) << 8) | num as u32
}

/// The 8 word block header
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BlockHeader {
  /// total block length in words, header included
  pub block_len    : u32,
  pub block_number : u32,
  pub event_count  : u32,
  /// free to use, we put the board (roc) id here
  pub reserved1    : u32,
  pub last_block   : bool,
}

impl BlockHeader {
  pub fn new() -> Self {
    Self {
      block_len    : BLOCK_HEADER_WORDS as u32,
      block_number : 0,
      event_count  : 0,
      reserved1    : 0,
      last_block   : false,
    }
  }

  pub fn to_words(&self) -> [u32; BLOCK_HEADER_WORDS] {
    let mut version = EVIO_VERSION;
    if self.last_block {
      version |= LAST_BLOCK_BIT;
    }
    [self.block_len,
     self.block_number,
     BLOCK_HEADER_WORDS as u32,
     self.event_count,
     self.reserved1,
     version,
     0,
     EVIO_MAGIC]
  }

  pub fn from_words(words : &[u32]) -> Result<Self, SerializationError> {
    if words.len() < BLOCK_HEADER_WORDS {
      return Err(SerializationError::StreamTooShort);
    }
    if words[7] != EVIO_MAGIC || words[2] != BLOCK_HEADER_WORDS as u32 {
      return Err(SerializationError::HeadInvalid);
    }
    Ok(Self {
      block_len    : words[0],
      block_number : words[1],
      event_count  : words[3],
      reserved1    : words[4],
      last_block   : (words[5] & LAST_BLOCK_BIT) > 0,
    })
  }
}

impl Default for BlockHeader {
  fn default() -> Self {
    Self::new()
  }
}

/// A CODA control event
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ControlEvent {
  pub event_type  : ControlEventType,
  /// unix time in seconds
  pub time        : u32,
  /// only meaningful for PRESTART
  pub run_number  : u32,
  /// only meaningful for PRESTART
  pub run_type    : u32,
  /// events seen so far (GO, PAUSE, END, SYNC)
  pub event_count : u32,
}

impl ControlEvent {
  pub fn new(event_type : ControlEventType) -> Self {
    Self {
      event_type,
      time        : chrono::Utc::now().timestamp() as u32,
      run_number  : 0,
      run_type    : 0,
      event_count : 0,
    }
  }

  pub fn prestart(run_number : u32, run_type : u32) -> Self {
    let mut ev     = Self::new(ControlEventType::Prestart);
    ev.run_number  = run_number;
    ev.run_type    = run_type;
    ev
  }

  pub fn go(event_count : u32) -> Self {
    let mut ev     = Self::new(ControlEventType::Go);
    ev.event_count = event_count;
    ev
  }

  pub fn end(event_count : u32) -> Self {
    let mut ev     = Self::new(ControlEventType::End);
    ev.event_count = event_count;
    ev
  }

  /// The bank (length word included)
  pub fn bank_words(&self) -> Vec<u32> {
    let mut words = Vec::<u32>::with_capacity(2 + CONTROL_PAYLOAD_WORDS);
    words.push(1 + CONTROL_PAYLOAD_WORDS as u32);
    words.push(bank_header_word(self.event_type.tag(), DATA_TYPE_U32, CONTROL_EVENT_NUM));
    words.push(self.time);
    match self.event_type {
      ControlEventType::Prestart => {
        words.push(self.run_number);
        words.push(self.run_type);
      }
      _ => {
        words.push(0);
        words.push(self.event_count);
      }
    }
    words
  }

  /// Block header + bank, ready to be pushed
  /// word by word into the hardware FIFO
  pub fn to_record(&self, block_number : u32, roc_id : u32) -> Vec<u32> {
    let bank            = self.bank_words();
    let mut header      = BlockHeader::new();
    header.block_len    = (BLOCK_HEADER_WORDS + bank.len()) as u32;
    header.block_number = block_number;
    header.event_count  = 1;
    header.reserved1    = roc_id;
    header.last_block   = self.event_type == ControlEventType::End;
    let mut record = Vec::<u32>::with_capacity(header.block_len as usize);
    record.extend_from_slice(&header.to_words());
    record.extend_from_slice(&bank);
    record
  }

  pub fn from_record(words : &[u32]) -> Result<Self, SerializationError> {
    let header = BlockHeader::from_words(words)?;
    if (header.block_len as usize) > words.len()
      || words.len() < BLOCK_HEADER_WORDS + 2 + CONTROL_PAYLOAD_WORDS {
      return Err(SerializationError::StreamTooShort);
    }
    let bank = &words[BLOCK_HEADER_WORDS..];
    if bank[0] != 1 + CONTROL_PAYLOAD_WORDS as u32 {
      return Err(SerializationError::WrongByteSize);
    }
    let tag = (bank[1] >> 16) as u16;
    let event_type = match ControlEventType::from_tag(tag) {
      None     => return Err(SerializationError::UnknownControlType),
      Some(et) => et,
    };
    let mut ev = ControlEvent::new(event_type);
    ev.time    = bank[2];
    match event_type {
      ControlEventType::Prestart => {
        ev.run_number = bank[3];
        ev.run_type   = bank[4];
      }
      _ => {
        ev.event_count = bank[4];
      }
    }
    Ok(ev)
  }
}

impl fmt::Display for ControlEvent {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = format!("<ControlEvent {}", self.event_type);
    repr += &(format!("\n  time        : {}", self.time));
    repr += &(format!("\n  run number  : {}", self.run_number));
    repr += &(format!("\n  run type    : {}", self.run_type));
    repr += &(format!("\n  event count : {}>", self.event_count));
    write!(f, "{}", repr)
  }
}

/// A bank the hardware ROC appends to an event
#[derive(Debug, Clone, PartialEq)]
pub struct RocBank {
  pub tag       : u16,
  pub data_type : u8,
  pub num       : u8,
  pub payload   : Vec<u32>,
}

impl RocBank {
  pub fn new(tag : u16, num : u8, payload : Vec<u32>) -> Self {
    Self {
      tag,
      data_type : DATA_TYPE_U32,
      num,
      payload,
    }
  }

  /// The length-prefixed word representation
  pub fn to_words(&self) -> Vec<u32> {
    let mut words = Vec::<u32>::with_capacity(self.payload.len() + 2);
    words.push(self.payload.len() as u32 + 1);
    words.push(bank_header_word(self.tag, self.data_type, self.num));
    words.extend_from_slice(&self.payload);
    words
  }

  /// Number of words the bank occupies in a FIFO
  pub fn len_words(&self) -> usize {
    self.payload.len() + 2
  }
}

#[cfg(test)]
mod test_evio {
  use super::*;

  #[test]
  fn control_record_layout() {
    let ev     = ControlEvent::prestart(1234, 7);
    let record = ev.to_record(1, 42);
    assert_eq!(record.len(), BLOCK_HEADER_WORDS + 2 + CONTROL_PAYLOAD_WORDS);
    assert_eq!(record[0] as usize, record.len());
    assert_eq!(record[4], 42);
    assert_eq!(record[7], EVIO_MAGIC);
    assert_eq!(record[8], 4);
    assert_eq!(record[9], 0xffd101cc);
    assert_eq!(record[11], 1234);
    assert_eq!(record[12], 7);
  }

  #[test]
  fn end_record_is_last_block() {
    let record = ControlEvent::end(100).to_record(5, 1);
    let header = BlockHeader::from_words(&record).unwrap();
    assert!(header.last_block);
    let go     = ControlEvent::go(0).to_record(2, 1);
    assert!(!BlockHeader::from_words(&go).unwrap().last_block);
  }

  #[test]
  fn decode_control_record() {
    let ev      = ControlEvent::end(9876);
    let decoded = ControlEvent::from_record(&ev.to_record(3, 1)).unwrap();
    assert_eq!(decoded, ev);
  }

  #[test]
  fn unknown_tag_is_rejected() {
    let mut record = ControlEvent::go(1).to_record(1, 1);
    record[9] = bank_header_word(0x1234, DATA_TYPE_U32, CONTROL_EVENT_NUM);
    assert_eq!(ControlEvent::from_record(&record), Err(SerializationError::UnknownControlType));
  }

  #[test]
  fn roc_bank_is_length_prefixed() {
    let bank  = RocBank::new(0x0e10, 3, vec![1, 2, 3]);
    let words = bank.to_words();
    assert_eq!(words.len(), bank.len_words());
    assert_eq!(words[0], 4);
    assert_eq!(words[1], 0x0e100103);
  }
}
