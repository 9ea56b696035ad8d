//! Hardware read out controller
//!
//! The firmware plays the part of a CODA ROC. In full
//! software mode every trigger has to be acknowledged
//! by the host through the sync FIFO, in hardware mode
//! the trigger/event flow runs on its own and the host
//! only adds banks when it wants to.
//!
//! Both FIFOs have a fixed depth. The sync FIFO is
//! checked against its depth before anything is
//! written. A user event which fits the async FIFO
//! waits until it fits as a whole, a larger one is
//! written in chunks no larger than the free space the
//! hardware reports. An overflow can not be cleared
//! without a firmware reload.

use std::fmt;
use std::sync::atomic::{
  AtomicUsize,
  Ordering,
};
use std::sync::Arc;

use vtp_dataclasses::errors::VtpError;
use vtp_dataclasses::evio::RocBank;
use vtp_lib::settings::{
  RocMode,
  RocSettings,
};

use crate::device::VtpDevice;
use crate::registers::*;
use crate::wait::BoundedWait;

/// Largest word count the length registers can hold
pub const ROC_LEN_MAX_WORDS : usize = 0xffff;

/// Collects banks into one sync event, keeping
/// track of the sync FIFO depth
#[derive(Debug, Clone, Default)]
pub struct RocBankBuilder {
  banks : Vec<RocBank>,
  words : usize,
}

impl RocBankBuilder {
  pub fn new() -> Self {
    Self {
      banks : Vec::new(),
      words : 0,
    }
  }

  /// Add a bank. Refused if the event would no
  /// longer fit the sync FIFO.
  pub fn push(&mut self, bank : RocBank) -> Result<&mut Self, VtpError> {
    let needed = self.words + bank.len_words();
    if needed > ROC_FIFO_DEPTH {
      return Err(VtpError::ResourceExhausted {
        what      : String::from("ROC sync FIFO"),
        requested : needed,
        available : ROC_FIFO_DEPTH,
      });
    }
    self.words = needed;
    self.banks.push(bank);
    Ok(self)
  }

  pub fn len_words(&self) -> usize {
    self.words
  }

  pub fn is_empty(&self) -> bool {
    self.banks.is_empty()
  }

  /// Wrap all banks into one bank of banks
  /// tagged `tag` (usually the roc id)
  pub fn build(&self, tag : u16, num : u8) -> RocBank {
    let mut payload = Vec::<u32>::with_capacity(self.words);
    for b in &self.banks {
      payload.extend_from_slice(&b.to_words());
    }
    let mut bank   = RocBank::new(tag, num, payload);
    // 0x10 - bank of banks
    bank.data_type = 0x10;
    bank
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct RocCounters {
  pub triggers : u32,
  pub acked    : u32,
  pub pending  : u32,
  pub bytes    : u64,
}

impl fmt::Display for RocCounters {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<RocCounters:");
    repr += &(format!("\n  triggers : {}", self.triggers));
    repr += &(format!("\n  acked    : {}", self.acked));
    repr += &(format!("\n  pending  : {}", self.pending));
    repr += &(format!("\n  bytes    : {}>", self.bytes));
    write!(f, "{}", repr)
  }
}

pub struct HardwareRoc {
  dev         : Arc<VtpDevice>,
  fifo_wait   : BoundedWait,
  mode        : RocMode,
  /// words of an interrupted user event which sit in
  /// the async FIFO without a length. Only a reset
  /// flushes them.
  uncommitted : AtomicUsize,
}

impl HardwareRoc {
  pub fn new(dev : Arc<VtpDevice>, settings : &RocSettings) -> Result<Self, VtpError> {
    dev.capabilities().require_hardware_roc()?;
    Ok(Self {
      dev,
      fifo_wait   : BoundedWait::from(&settings.async_fifo),
      mode        : settings.mode,
      uncommitted : AtomicUsize::new(0),
    })
  }

  pub fn mode(&self) -> RocMode {
    self.mode
  }

  /// Link mode, roc id and the record buffering
  /// parameters, all read back
  pub fn configure(&mut self, settings : &RocSettings) -> Result<(), VtpError> {
    self.dev.locked(|io| {
      let ctrl = io.read32(ROC_CTRL)?;
      let ctrl = match settings.mode {
        RocMode::Hardware     => ctrl | ROC_CTRL_HW_MODE,
        RocMode::FullSoftware => ctrl & !ROC_CTRL_HW_MODE,
      };
      io.write_verify(ROC_CTRL,           ctrl,                     ROC_CTRL_HW_MODE)?;
      io.write_verify(ROC_ID,             settings.roc_id,          u32::MAX)?;
      io.write_verify(ROC_MAX_RECORD,     settings.max_record_size, u32::MAX)?;
      io.write_verify(ROC_MAX_BLOCKS,     settings.max_blocks,      0xffff)?;
      io.write_verify(ROC_RECORD_TIMEOUT, settings.record_timeout,  u32::MAX)
    })?;
    self.mode      = settings.mode;
    self.fifo_wait = BoundedWait::from(&settings.async_fifo);
    info!("ROC {} configured in {:?} mode, max record {} bytes, max {} blocks",
          settings.roc_id, settings.mode, settings.max_record_size, settings.max_blocks);
    Ok(())
  }

  pub fn set_mode(&mut self, mode : RocMode) -> Result<(), VtpError> {
    match mode {
      RocMode::Hardware     => self.dev.set_bits(ROC_CTRL, ROC_CTRL_HW_MODE)?,
      RocMode::FullSoftware => self.dev.clear_bits(ROC_CTRL, ROC_CTRL_HW_MODE)?,
    };
    self.mode = mode;
    Ok(())
  }

  /// The reset is level held, the ROC stays
  /// in reset until it gets released. It also
  /// flushes the async FIFO.
  pub fn hold_reset(&self) -> Result<(), VtpError> {
    self.dev.set_bits(ROC_CTRL, ROC_CTRL_RESET)?;
    let flushed = self.uncommitted.swap(0, Ordering::AcqRel);
    if flushed > 0 {
      info!("Flushed {} uncommitted words from the async FIFO", flushed);
    }
    debug!("ROC held in reset");
    Ok(())
  }

  /// Words of an interrupted user event still
  /// in the async FIFO
  pub fn uncommitted_words(&self) -> usize {
    self.uncommitted.load(Ordering::Acquire)
  }

  pub fn release_reset(&self) -> Result<(), VtpError> {
    self.dev.clear_bits(ROC_CTRL, ROC_CTRL_RESET)?;
    Ok(())
  }

  pub fn is_held_in_reset(&self) -> Result<bool, VtpError> {
    Ok(self.dev.read32(ROC_CTRL)? & ROC_CTRL_RESET != 0)
  }

  pub fn enable(&self, enable : bool) -> Result<(), VtpError> {
    if enable {
      self.dev.set_bits(ROC_CTRL, ROC_CTRL_ENABLE)?;
    } else {
      self.dev.clear_bits(ROC_CTRL, ROC_CTRL_ENABLE)?;
    }
    Ok(())
  }

  /// Triggers waiting for an acknowledgement
  pub fn poll(&self) -> Result<u32, VtpError> {
    self.dev.read32(ROC_PENDING)
  }

  /// Acknowledge one trigger. The bank goes word by
  /// word into the sync FIFO, the word count is
  /// written last. Without a bank this is a bare
  /// acknowledgement.
  ///
  /// Returns the number of words written.
  pub fn write_bank(&self, bank : Option<&RocBank>) -> Result<usize, VtpError> {
    let words = match bank {
      None    => Vec::new(),
      Some(b) => b.to_words(),
    };
    if words.len() > ROC_FIFO_DEPTH {
      return Err(VtpError::ResourceExhausted {
        what      : String::from("ROC sync FIFO"),
        requested : words.len(),
        available : ROC_FIFO_DEPTH,
      });
    }
    self.dev.locked(|io| {
      for w in &words {
        io.write32(ROC_SYNC_FIFO_DATA, *w)?;
      }
      io.write32(ROC_SYNC_ACK_LEN, words.len() as u32)
    })?;
    trace!("Acknowledged trigger with {} words", words.len());
    Ok(words.len())
  }

  /// Send a user (async) event.
  ///
  /// Words are only written when the hardware reports
  /// free space, never more than it reports. An event
  /// up to the FIFO depth is written in one go once
  /// there is room for all of it, so a timeout leaves
  /// nothing behind. Larger events go in chunks. If
  /// such an event is interrupted, further events are
  /// refused until the ROC has been reset.
  ///
  /// Once everything is in the FIFO the length commits
  /// the event. The overflow flag is checked once more
  /// at the end to catch other writers.
  pub fn write_user_event(&self, words : &[u32]) -> Result<usize, VtpError> {
    let stale = self.uncommitted_words();
    if stale > 0 {
      return Err(VtpError::InvalidState(format!("{} words of an interrupted user event are in the async FIFO, reset the ROC first!", stale)));
    }
    if words.len() > ROC_LEN_MAX_WORDS {
      return Err(VtpError::ResourceExhausted {
        what      : String::from("ROC async event length"),
        requested : words.len(),
        available : ROC_LEN_MAX_WORDS,
      });
    }
    if words.is_empty() {
      debug!("Empty user event, nothing to send");
      return Ok(0);
    }
    let whole       = words.len() <= ROC_FIFO_DEPTH;
    let mut written = 0usize;
    while written < words.len() {
      // status and the chunk in one lock hold, nobody
      // else can take the space in between
      let n = self.fifo_wait.poll("ROC async FIFO space", |_| {
        self.dev.locked(|io| {
          let status = io.read32(ROC_ASYNC_STATUS)?;
          if status & ROC_ASYNC_OVERFLOW != 0 {
            error!("ROC async FIFO overflow!");
            return Err(VtpError::ResourceExhausted {
              what      : String::from("ROC async FIFO (overflow)"),
              requested : words.len() - written,
              available : 0,
            });
          }
          let free = (status & ROC_ASYNC_FREE_MASK) as usize;
          if free == 0 || (whole && free < words.len()) {
            return Ok(None);
          }
          let chunk = &words[written..words.len().min(written + free)];
          for w in chunk {
            io.write32(ROC_ASYNC_FIFO_DATA, *w)?;
          }
          Ok(Some(chunk.len()))
        })
      });
      match n {
        Ok(n) => written += n,
        Err(err) => {
          if written > 0 {
            error!("User event interrupted after {} of {} words! {err}", written, words.len());
            self.uncommitted.store(written, Ordering::Release);
          }
          return Err(err);
        }
      }
    }
    self.dev.write32(ROC_ASYNC_LEN, words.len() as u32)?;
    if self.dev.read32(ROC_ASYNC_STATUS)? & ROC_ASYNC_OVERFLOW != 0 {
      error!("ROC async FIFO overflowed while writing a user event of {} words!", words.len());
      return Err(VtpError::ResourceExhausted {
        what      : String::from("ROC async FIFO (overflow)"),
        requested : words.len(),
        available : 0,
      });
    }
    debug!("User event of {} words committed", words.len());
    Ok(words.len())
  }

  pub fn trigger_count(&self) -> Result<u32, VtpError> {
    self.dev.read32(ROC_TRIG_CNT)
  }

  pub fn ack_count(&self) -> Result<u32, VtpError> {
    self.dev.read32(ROC_ACK_CNT)
  }

  /// Bytes sent, assembled from the two halves
  pub fn byte_count(&self) -> Result<u64, VtpError> {
    self.dev.locked(|io| io.read_split_u64(ROC_BYTE_CNT_HI, ROC_BYTE_CNT_LO))
  }

  /// All counters in one lock hold
  pub fn counters(&self) -> Result<RocCounters, VtpError> {
    self.dev.locked(|io| {
      Ok(RocCounters {
        triggers : io.read32(ROC_TRIG_CNT)?,
        acked    : io.read32(ROC_ACK_CNT)?,
        pending  : io.read32(ROC_PENDING)?,
        bytes    : io.read_split_u64(ROC_BYTE_CNT_HI, ROC_BYTE_CNT_LO)?,
      })
    })
  }
}

#[cfg(test)]
mod test_roc {
  use super::*;
  use crate::lock::ProcessLock;
  use crate::profile::FirmwareProfile;
  use crate::sim::{
    unique_lock_name,
    Access,
    AsyncFifo,
    RocTriggers,
    SimRegisters,
  };

  fn roc(sim : &SimRegisters) -> (HardwareRoc, String) {
    let name = unique_lock_name("roc");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = Arc::new(VtpDevice::attach(Box::new(sim.clone()), lock, None).unwrap());
    let mut settings   = RocSettings::new();
    settings.async_fifo = vtp_lib::settings::WaitSettings::new(100, 0, 0);
    (HardwareRoc::new(dev, &settings).unwrap(), name)
  }

  #[test]
  fn not_available_in_streaming_firmware() {
    let sim  = SimRegisters::board(FirmwareProfile::Streaming, 1);
    let name = unique_lock_name("roc-missing");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = Arc::new(VtpDevice::attach(Box::new(sim), lock, None).unwrap());
    assert!(matches!(HardwareRoc::new(dev, &RocSettings::new()), Err(VtpError::NotSupported(_))));
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn reset_is_level_held() {
    let sim = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    let (roc, name) = roc(&sim);
    roc.hold_reset().unwrap();
    assert!(roc.is_held_in_reset().unwrap());
    roc.enable(true).unwrap();
    // enabling does not release it
    assert!(roc.is_held_in_reset().unwrap());
    roc.release_reset().unwrap();
    assert!(!roc.is_held_in_reset().unwrap());
    assert_eq!(sim.peek(ROC_CTRL) & ROC_CTRL_ENABLE, ROC_CTRL_ENABLE);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn configure_sets_mode_and_buffering() {
    let sim = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    let (mut roc, name) = roc(&sim);
    let mut settings = RocSettings::new();
    settings.mode       = RocMode::FullSoftware;
    settings.max_blocks = 10;
    roc.configure(&settings).unwrap();
    assert_eq!(sim.peek(ROC_CTRL) & ROC_CTRL_HW_MODE, 0);
    assert_eq!(sim.peek(ROC_MAX_BLOCKS), 10);
    roc.set_mode(RocMode::Hardware).unwrap();
    assert_eq!(roc.mode(), RocMode::Hardware);
    assert_eq!(sim.peek(ROC_CTRL) & ROC_CTRL_HW_MODE, ROC_CTRL_HW_MODE);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn bank_then_length() {
    let sim = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    sim.add_behaviour(Box::new(RocTriggers::new(2)));
    let (roc, name) = roc(&sim);
    assert_eq!(roc.poll().unwrap(), 2);
    let bank = RocBank::new(0x1, 0, vec![0xa, 0xb, 0xc]);
    sim.clear_log();
    assert_eq!(roc.write_bank(Some(&bank)).unwrap(), 5);
    let writes : Vec<Access> = sim.log().into_iter().filter(|a| a.is_write()).collect();
    assert_eq!(writes.len(), 6);
    assert!(writes[..5].iter().all(|a| a.offset() == ROC_SYNC_FIFO_DATA));
    assert_eq!(writes[5], Access::Write { offset : ROC_SYNC_ACK_LEN, value : 5 });
    // bare acknowledgement
    assert_eq!(roc.write_bank(None).unwrap(), 0);
    let c = roc.counters().unwrap();
    assert_eq!(c.pending, 0);
    assert_eq!(c.acked, 2);
    assert_eq!(c.bytes, 20);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn sync_fifo_depth_is_checked() {
    let sim = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    let (roc, name) = roc(&sim);
    sim.clear_log();
    let bank = RocBank::new(0x1, 0, vec![0; ROC_FIFO_DEPTH]);
    assert!(matches!(roc.write_bank(Some(&bank)), Err(VtpError::ResourceExhausted { .. })));
    assert!(sim.writes_to(ROC_SYNC_FIFO_DATA).is_empty());
    let mut builder = RocBankBuilder::new();
    builder.push(RocBank::new(0x2, 0, vec![0; ROC_FIFO_DEPTH - 2])).unwrap();
    assert!(builder.push(RocBank::new(0x3, 0, vec![1])).is_err());
    assert_eq!(builder.len_words(), ROC_FIFO_DEPTH);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn bank_of_banks() {
    let mut builder = RocBankBuilder::new();
    builder.push(RocBank::new(0x2, 1, vec![7])).unwrap()
           .push(RocBank::new(0x3, 2, vec![8, 9])).unwrap();
    let bank = builder.build(5, 0);
    assert_eq!(bank.payload.len(), 7);
    assert_eq!(bank.payload[0], 2);
    assert_eq!(bank.payload[3], 3);
    assert_eq!(bank.to_words()[0], 8);
  }

  #[test]
  fn large_user_event_respects_free_space() {
    let sim = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    sim.set_logging(false);
    // 40 free words, 1024 drained per status read
    let depth = ROC_FIFO_DEPTH as u32;
    sim.add_behaviour(Box::new(AsyncFifo::new(depth, 1024).filled(depth - 40)));
    let (roc, name) = roc(&sim);
    sim.set_logging(true);
    let event : Vec<u32> = (0..(ROC_FIFO_DEPTH as u32 + 1000)).collect();
    assert_eq!(roc.write_user_event(&event).unwrap(), event.len());

    let mut free    = 0u32;
    let mut pending = 0u32;
    for a in sim.log() {
      match a {
        Access::Read { offset, value } if offset == ROC_ASYNC_STATUS => {
          free    = value & ROC_ASYNC_FREE_MASK;
          pending = 0;
          assert_eq!(value & ROC_ASYNC_OVERFLOW, 0);
        }
        Access::Write { offset, .. } if offset == ROC_ASYNC_FIFO_DATA => {
          pending += 1;
          assert!(pending <= free);
        }
        _ => ()
      }
    }
    assert_eq!(sim.writes_to(ROC_ASYNC_FIFO_DATA), event);
    assert_eq!(sim.writes_to(ROC_ASYNC_LEN), vec![event.len() as u32]);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn small_user_event_waits_until_it_fits() {
    let sim = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    // 10 free words, nothing drains
    sim.add_behaviour(Box::new(AsyncFifo::new(64, 0).filled(54)));
    let (roc, name) = roc(&sim);
    sim.clear_log();
    let event : Vec<u32> = (0..20).collect();
    assert!(matches!(roc.write_user_event(&event), Err(VtpError::Timeout { .. })));
    assert!(sim.writes_to(ROC_ASYNC_FIFO_DATA).is_empty());
    assert!(sim.writes_to(ROC_ASYNC_LEN).is_empty());
    assert_eq!(roc.uncommitted_words(), 0);
    // the next event is framed on its own
    assert_eq!(roc.write_user_event(&[7, 8, 9]).unwrap(), 3);
    assert_eq!(sim.writes_to(ROC_ASYNC_FIFO_DATA), vec![7, 8, 9]);
    assert_eq!(sim.writes_to(ROC_ASYNC_LEN), vec![3]);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn interrupted_user_event_needs_a_reset() {
    let sim = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    sim.set_logging(false);
    sim.add_behaviour(Box::new(AsyncFifo::new(ROC_FIFO_DEPTH as u32, 0)));
    let (roc, name) = roc(&sim);
    let event = vec![0xabu32; ROC_FIFO_DEPTH + 10];
    assert!(matches!(roc.write_user_event(&event), Err(VtpError::Timeout { .. })));
    assert_eq!(roc.uncommitted_words(), ROC_FIFO_DEPTH);

    sim.set_logging(true);
    sim.clear_log();
    assert!(matches!(roc.write_user_event(&[1]), Err(VtpError::InvalidState(_))));
    assert!(sim.log().iter().all(|a| !a.is_write()));

    roc.hold_reset().unwrap();
    roc.release_reset().unwrap();
    assert_eq!(roc.uncommitted_words(), 0);
    sim.clear_log();
    assert_eq!(roc.write_user_event(&[1]).unwrap(), 1);
    assert_eq!(sim.writes_to(ROC_ASYNC_LEN), vec![1]);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn full_fifo_times_out() {
    let sim = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    sim.add_behaviour(Box::new(AsyncFifo::new(64, 0).filled(64)));
    let (roc, name) = roc(&sim);
    let res = roc.write_user_event(&[1, 2, 3]);
    assert!(matches!(res, Err(VtpError::Timeout { .. })));
    assert!(sim.writes_to(ROC_ASYNC_FIFO_DATA).is_empty());
    assert!(sim.writes_to(ROC_ASYNC_LEN).is_empty());
    ProcessLock::destroy(&name).unwrap();
  }
}
