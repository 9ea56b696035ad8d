//! Register window memory management
//!
//! The VTP maps its register space into OS memory
//! through the userspace io framework.
//!
//! /dev/uio0 - VTP register window
//!
//! Contrary to mapping the device for every single
//! register access, the window is mapped once at
//! board open and stays mapped until the board is
//! closed.

extern crate memmap;

use std::fs::File;
use std::ptr;

use memmap::MmapMut;

use vtp_dataclasses::errors::VtpError;

/// The size of a 32bit unsigned int in byte
/// (all words in registers are u32)
pub const SIZEOF_U32 : usize = 4;

/// Word granular access to a register space.
///
/// Implementors are not required to serialize
/// access, that is done by the process lock
/// held by the caller.
pub trait RegisterBus : Send + Sync {
  /// Read a register at byte offset `offset`
  fn read32(&self, offset : u32) -> u32;
  fn write32(&self, offset : u32, value : u32);
  /// Size of the register space in bytes
  fn size(&self) -> usize;
  fn describe(&self) -> String;
}

/// Allow READ/WRITE access to the memory registers at /dev/uio*
///
/// # Arguments
///
/// * addr_space : the uio device
/// * len        : length of the mapping in bytes
pub fn map_physical_mem_write(addr_space : &str,
                              len        : usize)
  -> Result<MmapMut, VtpError> {
  let file = File::options()
    .read(true)
    .write(true)
    .open(addr_space)
    .map_err(|err| VtpError::HardwareUnavailable(format!("Can not open {}! {}", addr_space, err)))?;
  let m = unsafe {
    memmap::MmapOptions::new()
      .offset(0)
      .len(len)
      .map_mut(&file)
  };
  m.map_err(|err| VtpError::HardwareUnavailable(format!("Failed to mmap {}! {}", addr_space, err)))
}

/// The mapped register window of a uio device
pub struct UioWindow {
  path : String,
  mmap : MmapMut,
  base : *mut u32,
}

// The window is plain device memory. Concurrent access
// is serialized by the board lock.
unsafe impl Send for UioWindow {}
unsafe impl Sync for UioWindow {}

impl UioWindow {
  pub fn open(path : &str, len : usize) -> Result<Self, VtpError> {
    if len == 0 || len % SIZEOF_U32 != 0 {
      return Err(VtpError::ConfigError(format!("Invalid register window size {len}")));
    }
    let mut mmap = map_physical_mem_write(path, len)?;
    let base = mmap.as_mut_ptr() as *mut u32;
    info!("Mapped {} bytes of register space from {}", len, path);
    Ok(Self {
      path : String::from(path),
      mmap,
      base,
    })
  }
}

impl RegisterBus for UioWindow {
  fn read32(&self, offset : u32) -> u32 {
    // offset is checked by the device handle
    unsafe {
      ptr::read_volatile(self.base.add(offset as usize / SIZEOF_U32))
    }
  }

  fn write32(&self, offset : u32, value : u32) {
    trace!("Attempting to write {value:#x} at addr {offset:#x}");
    unsafe {
      ptr::write_volatile(self.base.add(offset as usize / SIZEOF_U32), value);
    }
  }

  fn size(&self) -> usize {
    self.mmap.len()
  }

  fn describe(&self) -> String {
    format!("uio window {} ({} bytes)", self.path, self.mmap.len())
  }
}

impl Drop for UioWindow {
  fn drop(&mut self) {
    debug!("Unmapping register window {}", self.path);
  }
}
