//! The device handle
//!
//! A `VtpDevice` is returned by `open` and threaded
//! through every subsystem. It owns the mapped register
//! window and a handle to the board lock, so several
//! handles to distinct boards can coexist in one
//! process.
//!
//! Single register access takes the lock for the
//! duration of the access. Transactions which span
//! several registers go through `locked`, which holds
//! the lock for the whole closure.

use std::fmt;

use vtp_dataclasses::errors::VtpError;
use vtp_lib::settings::DeviceSettings;

use crate::lock::{
  LockHealth,
  ProcessLock,
};
use crate::memory::{
  RegisterBus,
  UioWindow,
  SIZEOF_U32,
};
use crate::profile::{
  Capabilities,
  FirmwareProfile,
};
use crate::registers::{
  self,
  BOARD_ID,
  BOARD_MAGIC,
  BOARD_MAGIC_VALUE,
  FW_REVISION,
  FW_TYPE,
  REGISTER_WINDOW_SIZE,
};
use crate::wait::BoundedWait;

/// Compare the register constants with the layout
/// of the register blocks. Run once at startup.
pub fn self_check() -> Result<(), VtpError> {
  let mismatches = registers::check_offsets();
  if mismatches.is_empty() {
    debug!("Register offset self check passed");
    return Ok(());
  }
  for m in mismatches.iter() {
    error!("Register {} at {:#06x}, but the layout puts it at {:#06x}!", m.name, m.expected, m.found);
  }
  Err(VtpError::ConfigError(format!("{} register offsets disagree with the register layout", mismatches.len())))
}

/// Identification registers, read at open
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BoardIdentity {
  pub magic       : u32,
  pub fw_type     : u32,
  pub fw_revision : u32,
  pub board_id    : u32,
}

impl BoardIdentity {
  pub fn fw_version(&self) -> (u16, u16) {
    ((self.fw_revision >> 16) as u16, (self.fw_revision & 0xffff) as u16)
  }
}

impl fmt::Display for BoardIdentity {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let (major, minor) = self.fw_version();
    let mut repr = String::from("<BoardIdentity:");
    repr += &(format!("\n  board id    : {}", self.board_id));
    repr += &(format!("\n  fw type     : {:#04x}", self.fw_type));
    repr += &(format!("\n  fw revision : {}.{}>", major, minor));
    write!(f, "{}", repr)
  }
}

/// Checked register access while the board
/// lock is held
pub struct RegisterIo<'a> {
  bus  : &'a dyn RegisterBus,
  size : usize,
}

impl<'a> RegisterIo<'a> {
  fn check(&self, offset : u32) -> Result<(), VtpError> {
    if offset as usize % SIZEOF_U32 != 0 || offset as usize + SIZEOF_U32 > self.size {
      error!("Invalid register offset {:#x}!", offset);
      return Err(VtpError::InvalidOffset(offset));
    }
    Ok(())
  }

  pub fn read32(&self, offset : u32) -> Result<u32, VtpError> {
    self.check(offset)?;
    Ok(self.bus.read32(offset))
  }

  pub fn write32(&self, offset : u32, value : u32) -> Result<(), VtpError> {
    self.check(offset)?;
    self.bus.write32(offset, value);
    Ok(())
  }

  /// Read-modify-write, setting `mask`
  pub fn set_bits(&self, offset : u32, mask : u32) -> Result<u32, VtpError> {
    let value = self.read32(offset)? | mask;
    self.write32(offset, value)?;
    Ok(value)
  }

  pub fn clear_bits(&self, offset : u32, mask : u32) -> Result<u32, VtpError> {
    let value = self.read32(offset)? & !mask;
    self.write32(offset, value)?;
    Ok(value)
  }

  /// Write, then read back to make sure the
  /// hardware latched the value. Only the bits
  /// in `mask` are compared.
  pub fn write_verify(&self, offset : u32, value : u32, mask : u32) -> Result<(), VtpError> {
    self.write32(offset, value)?;
    let read = self.read32(offset)?;
    if read & mask != value & mask {
      error!("Register {:#06x} did not latch {:#x}, reads {:#x}!", offset, value, read);
      return Err(VtpError::VerifyFailed {
        offset,
        wrote : value,
        read,
      });
    }
    Ok(())
  }

  /// A 64bit counter split into two registers. The
  /// high half is read before and after the low half,
  /// a carry in between triggers a second read.
  pub fn read_split_u64(&self, hi : u32, lo : u32) -> Result<u64, VtpError> {
    let mut high = self.read32(hi)?;
    let mut low  = self.read32(lo)?;
    let again    = self.read32(hi)?;
    if again != high {
      high = again;
      low  = self.read32(lo)?;
    }
    Ok(((high as u64) << 32) | low as u64)
  }
}

/// Handle to one board
pub struct VtpDevice {
  bus      : Box<dyn RegisterBus>,
  lock     : ProcessLock,
  identity : BoardIdentity,
  profile  : FirmwareProfile,
}

impl VtpDevice {

  /// Map the register window of the board and attach
  /// to the board lock.
  pub fn open(settings : &DeviceSettings) -> Result<Self, VtpError> {
    self_check()?;
    let window = UioWindow::open(&settings.uio_path, settings.window_size)?;
    let lock   = ProcessLock::open(&settings.lock_name)?;
    Self::attach(Box::new(window), lock, settings.expected_profile.as_deref())
  }

  /// Build a handle around an arbitrary register space,
  /// e.g. the simulated registers
  pub fn attach(bus              : Box<dyn RegisterBus>,
                lock             : ProcessLock,
                expected_profile : Option<&str>) -> Result<Self, VtpError> {
    if bus.size() < REGISTER_WINDOW_SIZE {
      return Err(VtpError::ConfigError(format!("Register window of {} bytes is smaller than the register map ({} bytes)",
                                               bus.size(), REGISTER_WINDOW_SIZE)));
    }
    let identity = {
      let _guard = lock.acquire()?;
      BoardIdentity {
        magic       : bus.read32(BOARD_MAGIC),
        fw_type     : bus.read32(FW_TYPE),
        fw_revision : bus.read32(FW_REVISION),
        board_id    : bus.read32(BOARD_ID),
      }
    };
    if identity.magic != BOARD_MAGIC_VALUE {
      error!("Found board magic {:#x} at {}!", identity.magic, bus.describe());
      return Err(VtpError::HardwareUnavailable(format!("No VTP at {}", bus.describe())));
    }
    let profile = match FirmwareProfile::from_fw_type(identity.fw_type) {
      None => {
        return Err(VtpError::NotSupported(format!("Firmware type {:#x}", identity.fw_type)));
      }
      Some(p) => p,
    };
    if let Some(name) = expected_profile {
      let expected = FirmwareProfile::from_name(name)?;
      if expected != profile {
        error!("Expected {}, but the board runs {}!", expected, profile);
        return Err(VtpError::ConfigError(format!("Board runs {}, not {}", profile, expected)));
      }
    }
    info!("Opened {}", bus.describe());
    info!("{}", identity);
    info!("{}", profile);
    Ok(Self {
      bus,
      lock,
      identity,
      profile,
    })
  }

  pub fn identity(&self) -> &BoardIdentity {
    &self.identity
  }

  pub fn profile(&self) -> FirmwareProfile {
    self.profile
  }

  pub fn capabilities(&self) -> Capabilities {
    self.profile.capabilities()
  }

  pub fn lock(&self) -> &ProcessLock {
    &self.lock
  }

  pub fn lock_health(&self, wait : &BoundedWait) -> Result<LockHealth, VtpError> {
    self.lock.health_check(wait)
  }

  /// Run a multi register transaction while
  /// holding the board lock
  pub fn locked<T, F>(&self, transaction : F) -> Result<T, VtpError>
    where F : FnOnce(&RegisterIo) -> Result<T, VtpError> {
    let _guard = self.lock.acquire()?;
    let io = RegisterIo {
      bus  : self.bus.as_ref(),
      size : self.bus.size(),
    };
    transaction(&io)
  }

  pub fn read32(&self, offset : u32) -> Result<u32, VtpError> {
    self.locked(|io| io.read32(offset))
  }

  pub fn write32(&self, offset : u32, value : u32) -> Result<(), VtpError> {
    self.locked(|io| io.write32(offset, value))
  }

  pub fn set_bits(&self, offset : u32, mask : u32) -> Result<u32, VtpError> {
    self.locked(|io| io.set_bits(offset, mask))
  }

  pub fn clear_bits(&self, offset : u32, mask : u32) -> Result<u32, VtpError> {
    self.locked(|io| io.clear_bits(offset, mask))
  }

  pub fn write_verify(&self, offset : u32, value : u32, mask : u32) -> Result<(), VtpError> {
    self.locked(|io| io.write_verify(offset, value, mask))
  }

  /// Unmap the register window and close the lock
  /// handle. The lock segment stays for the next
  /// process.
  pub fn close(self) {
    info!("Closing {}", self.bus.describe());
  }
}

impl fmt::Display for VtpDevice {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<VtpDevice: {}, board {}, {}>",
           self.bus.describe(), self.identity.board_id, self.profile)
  }
}

#[cfg(test)]
mod test_device {
  use super::*;
  use crate::sim::{
    SimRegisters,
    unique_lock_name,
  };
  use crate::registers::SCRATCH;

  fn sim_device(profile : FirmwareProfile) -> (VtpDevice, SimRegisters, String) {
    let sim  = SimRegisters::board(profile, 7);
    let name = unique_lock_name("device");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = VtpDevice::attach(Box::new(sim.clone()), lock, None).unwrap();
    (dev, sim, name)
  }

  #[test]
  fn offset_self_check_passes() {
    assert!(self_check().is_ok());
  }

  #[test]
  fn identity_is_read_at_open() {
    let (dev, _sim, name) = sim_device(FirmwareProfile::StreamingRoc);
    assert_eq!(dev.identity().board_id, 7);
    assert_eq!(dev.profile(), FirmwareProfile::StreamingRoc);
    dev.close();
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn unaligned_and_out_of_range_offsets_are_rejected() {
    let (dev, _sim, name) = sim_device(FirmwareProfile::Streaming);
    assert_eq!(dev.read32(0x2), Err(VtpError::InvalidOffset(0x2)));
    assert_eq!(dev.write32(REGISTER_WINDOW_SIZE as u32, 1), Err(VtpError::InvalidOffset(REGISTER_WINDOW_SIZE as u32)));
    assert!(dev.write32(SCRATCH, 0xabcd).is_ok());
    assert_eq!(dev.read32(SCRATCH), Ok(0xabcd));
    dev.close();
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn bit_helpers() {
    let (dev, _sim, name) = sim_device(FirmwareProfile::Streaming);
    dev.write32(SCRATCH, 0b1000).unwrap();
    assert_eq!(dev.set_bits(SCRATCH, 0b0011), Ok(0b1011));
    assert_eq!(dev.clear_bits(SCRATCH, 0b1001), Ok(0b0010));
    assert!(dev.write_verify(SCRATCH, 0x55, 0xff).is_ok());
    dev.close();
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn unlatched_write_fails_verification() {
    let (dev, sim, name) = sim_device(FirmwareProfile::Streaming);
    sim.set_read_only(SCRATCH, 0);
    match dev.write_verify(SCRATCH, 0x55, 0xff) {
      Err(VtpError::VerifyFailed { offset, wrote, read }) => {
        assert_eq!(offset, SCRATCH);
        assert_eq!(wrote, 0x55);
        assert_eq!(read, 0);
      }
      other => panic!("Expected VerifyFailed, got {:?}", other),
    }
    dev.close();
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn wrong_magic_is_hardware_unavailable() {
    let sim  = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.poke(BOARD_MAGIC, 0xffffffff);
    let name = unique_lock_name("magic");
    let lock = ProcessLock::open(&name).unwrap();
    assert!(matches!(VtpDevice::attach(Box::new(sim), lock, None),
                     Err(VtpError::HardwareUnavailable(_))));
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn unexpected_profile_is_refused() {
    let sim  = SimRegisters::board(FirmwareProfile::Trigger, 1);
    let name = unique_lock_name("profile");
    let lock = ProcessLock::open(&name).unwrap();
    assert!(matches!(VtpDevice::attach(Box::new(sim), lock, Some("Streaming")),
                     Err(VtpError::ConfigError(_))));
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn split_counter_read() {
    let (dev, sim, name) = sim_device(FirmwareProfile::Streaming);
    sim.poke(0x20, 0x1);
    sim.poke(0x24, 0xfffffff0);
    let value = dev.locked(|io| io.read_split_u64(0x20, 0x24)).unwrap();
    assert_eq!(value, 0x1_ffff_fff0);
    dev.close();
    ProcessLock::destroy(&name).unwrap();
  }
}
