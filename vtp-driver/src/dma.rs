//! DMA engine
//!
//! The board has two DMA channels which write into
//! physically contiguous buffers in host memory:
//!
//! * channel 0 - trigger interface (TI) data
//! * channel 1 - board event data
//!
//! The buffers come from an external page allocator,
//! on the board this is the u-dma-buf kernel module,
//! which exports each buffer as /dev/udmabufN together
//! with its physical address in sysfs.
//!
//! A buffer handed to `start` belongs to the channel
//! until the matching `wait_done` returns. Buffers are
//! released only by `mem_close`.

extern crate memmap;

use std::fmt;
use std::fs::{
  self,
  File,
};
use std::sync::Arc;

use memmap::MmapMut;

use vtp_dataclasses::errors::VtpError;

use crate::device::VtpDevice;
use crate::registers::{
  dma_reg,
  DMA_CTRL,
  DMA_CTRL_CLEAR,
  DMA_CTRL_ENABLE,
  DMA_CTRL_RESET,
  DMA_CTRL_RUN,
  DMA_DEST_ADDR,
  DMA_MAX_LEN,
  DMA_STATUS,
  DMA_STATUS_DONE,
  DMA_STATUS_ERROR,
  DMA_XFER_LEN,
};
use crate::wait::BoundedWait;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaChannelId {
  /// Trigger interface side
  TriggerInterface,
  /// Board local event data
  Board,
}

impl DmaChannelId {
  pub fn index(&self) -> usize {
    match self {
      DmaChannelId::TriggerInterface => 0,
      DmaChannelId::Board            => 1,
    }
  }
}

impl fmt::Display for DmaChannelId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      DmaChannelId::TriggerInterface => "TI",
      DmaChannelId::Board            => "Board",
    };
    write!(f, "<DmaChannel: {}>", repr)
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaState {
  Idle,
  Running,
  Done,
  Error,
  TimedOut,
}

impl fmt::Display for DmaState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      DmaState::Idle     => "Idle",
      DmaState::Running  => "Running",
      DmaState::Done     => "Done",
      DmaState::Error    => "Error",
      DmaState::TimedOut => "TimedOut",
    };
    write!(f, "<DmaState: {}>", repr)
  }
}

enum DmaBacking {
  Mapped(MmapMut),
  Heap(Vec<u8>),
}

/// A physically contiguous buffer
pub struct DmaBuffer {
  pub id        : usize,
  pub phys_addr : u64,
  pub size      : usize,
  backing       : DmaBacking,
}

impl DmaBuffer {
  pub fn as_slice(&self) -> &[u8] {
    match &self.backing {
      DmaBacking::Mapped(m) => &m[..],
      DmaBacking::Heap(v)   => &v[..],
    }
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    match &mut self.backing {
      DmaBacking::Mapped(m) => &mut m[..],
      DmaBacking::Heap(v)   => &mut v[..],
    }
  }
}

impl fmt::Display for DmaBuffer {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<DmaBuffer {}: phys {:#010x}, {} bytes>", self.id, self.phys_addr, self.size)
  }
}

/// Source of physically contiguous memory
pub trait PageAllocator : Send {
  fn allocate(&mut self, id : usize, size : usize) -> Result<DmaBuffer, VtpError>;
  fn release(&mut self, buffer : DmaBuffer) {
    debug!("Released {}", buffer);
  }
}

/// Buffers exported by the u-dma-buf kernel module
pub struct UdmabufAllocator {
  /// e.g. /dev/udmabuf, buffer i is /dev/udmabuf{i}
  prefix : String,
}

impl UdmabufAllocator {
  pub fn new(prefix : &str) -> Self {
    Self {
      prefix : String::from(prefix),
    }
  }

  fn device_name(&self, id : usize) -> String {
    format!("{}{}", self.prefix, id)
  }

  /// sysfs exports the physical address as hex string
  fn phys_addr(&self, id : usize) -> Result<u64, VtpError> {
    let dev  = self.device_name(id);
    let name = dev.rsplit('/').next().unwrap_or(&dev).to_string();
    let path = format!("/sys/class/u-dma-buf/{}/phys_addr", name);
    let repr = fs::read_to_string(&path)
      .map_err(|err| VtpError::HardwareUnavailable(format!("Can not read {}! {}", path, err)))?;
    let repr = repr.trim().trim_start_matches("0x");
    u64::from_str_radix(repr, 16)
      .map_err(|err| VtpError::HardwareUnavailable(format!("Malformed physical address in {}! {}", path, err)))
  }
}

impl PageAllocator for UdmabufAllocator {
  fn allocate(&mut self, id : usize, size : usize) -> Result<DmaBuffer, VtpError> {
    let dev  = self.device_name(id);
    let file = File::options()
      .read(true)
      .write(true)
      .open(&dev)
      .map_err(|err| VtpError::HardwareUnavailable(format!("Can not open {}! {}", dev, err)))?;
    let available = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
    // character devices report 0, only check real sizes
    if available != 0 && available < size {
      return Err(VtpError::ResourceExhausted {
        what      : dev,
        requested : size,
        available,
      });
    }
    let phys_addr = self.phys_addr(id)?;
    let mmap = unsafe {
      memmap::MmapOptions::new()
        .len(size)
        .map_mut(&file)
    }.map_err(|err| VtpError::HardwareUnavailable(format!("Failed to mmap {}! {}", dev, err)))?;
    Ok(DmaBuffer {
      id,
      phys_addr,
      size,
      backing : DmaBacking::Mapped(mmap),
    })
  }
}

/// Plain heap memory with made up physical
/// addresses, for the simulated board
pub struct HeapAllocator {
  next_phys : u64,
  /// allocations beyond this many fail
  limit     : Option<usize>,
  allocated : usize,
}

impl HeapAllocator {
  pub fn new() -> Self {
    Self {
      next_phys : 0x1000_0000,
      limit     : None,
      allocated : 0,
    }
  }

  /// Fail after `limit` successful allocations
  pub fn with_limit(limit : usize) -> Self {
    let mut alloc = Self::new();
    alloc.limit   = Some(limit);
    alloc
  }
}

impl Default for HeapAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl PageAllocator for HeapAllocator {
  fn allocate(&mut self, id : usize, size : usize) -> Result<DmaBuffer, VtpError> {
    if let Some(limit) = self.limit {
      if self.allocated >= limit {
        return Err(VtpError::ResourceExhausted {
          what      : String::from("heap DMA buffers"),
          requested : self.allocated + 1,
          available : limit,
        });
      }
    }
    let phys_addr   = self.next_phys;
    self.next_phys += (size as u64 + 0xfff) & !0xfff;
    self.allocated += 1;
    Ok(DmaBuffer {
      id,
      phys_addr,
      size,
      backing : DmaBacking::Heap(vec![0u8; size]),
    })
  }

  fn release(&mut self, buffer : DmaBuffer) {
    self.allocated = self.allocated.saturating_sub(1);
    debug!("Released {}", buffer);
  }
}

struct ChannelSlot {
  state     : DmaState,
  in_flight : Option<DmaBuffer>,
}

/// The two DMA channels and their buffer pool
pub struct DmaEngine {
  dev       : Arc<VtpDevice>,
  allocator : Box<dyn PageAllocator>,
  /// buffers not owned by a channel
  pool      : Vec<DmaBuffer>,
  channels  : [ChannelSlot; 2],
  wait      : BoundedWait,
}

impl DmaEngine {
  pub fn new(dev       : Arc<VtpDevice>,
             allocator : Box<dyn PageAllocator>,
             wait      : BoundedWait) -> Result<Self, VtpError> {
    dev.capabilities().require_dma()?;
    Ok(Self {
      dev,
      allocator,
      pool     : Vec::new(),
      channels : [ChannelSlot { state : DmaState::Idle, in_flight : None },
                  ChannelSlot { state : DmaState::Idle, in_flight : None }],
      wait,
    })
  }

  /// Reserve `n` buffers of `size` bytes each.
  ///
  /// If an allocation fails, the buffers which were
  /// already reserved are released again.
  pub fn mem_open(&mut self, n : usize, size : usize) -> Result<(), VtpError> {
    if !self.pool.is_empty() || self.channels.iter().any(|c| c.in_flight.is_some()) {
      return Err(VtpError::InvalidState(String::from("DMA buffers are already allocated")));
    }
    for id in 0..n {
      match self.allocator.allocate(id, size) {
        Ok(buffer) => {
          debug!("Allocated {}", buffer);
          self.pool.push(buffer);
        }
        Err(err) => {
          error!("Allocation of DMA buffer {} failed! {}", id, err);
          self.mem_close();
          return Err(err);
        }
      }
    }
    info!("Allocated {} DMA buffers of {} bytes", n, size);
    Ok(())
  }

  /// Release all buffers, including the ones
  /// a channel still holds
  pub fn mem_close(&mut self) {
    let mut n_released = 0;
    for slot in self.channels.iter_mut() {
      if let Some(buffer) = slot.in_flight.take() {
        warn!("Releasing {} while a transfer is running!", buffer);
        self.allocator.release(buffer);
        n_released += 1;
      }
    }
    for buffer in self.pool.drain(..) {
      self.allocator.release(buffer);
      n_released += 1;
    }
    debug!("Released {} DMA buffers", n_released);
  }

  fn reset_sequence(&self, ch : DmaChannelId) -> Result<(), VtpError> {
    let ctrl = dma_reg(ch.index(), DMA_CTRL);
    self.dev.locked(|io| {
      io.write32(ctrl, 0)?;
      io.write32(ctrl, DMA_CTRL_RESET)?;
      io.write32(ctrl, 0)?;
      io.write32(ctrl, DMA_CTRL_CLEAR)?;
      io.write32(ctrl, DMA_CTRL_ENABLE)
    })
  }

  fn recover_buffer(&mut self, ch : DmaChannelId) {
    if let Some(buffer) = self.channels[ch.index()].in_flight.take() {
      self.pool.push(buffer);
    }
  }

  /// stop -> reset -> clear -> enable. Can be
  /// issued at any time, a buffer held by the
  /// channel goes back to the pool.
  pub fn channel_init(&mut self, ch : DmaChannelId) -> Result<(), VtpError> {
    self.reset_sequence(ch)?;
    self.recover_buffer(ch);
    self.channels[ch.index()].state = DmaState::Idle;
    debug!("Initialized {}", ch);
    Ok(())
  }

  /// Start a transfer into buffer `buffer_id`,
  /// returns right away
  pub fn start(&mut self,
               ch        : DmaChannelId,
               buffer_id : usize,
               max_len   : usize) -> Result<(), VtpError> {
    if self.channels[ch.index()].state == DmaState::Running {
      return Err(VtpError::InvalidState(format!("{} is already running", ch)));
    }
    let pos = match self.pool.iter().position(|b| b.id == buffer_id) {
      None => {
        return Err(VtpError::InvalidState(format!("DMA buffer {} is not available", buffer_id)));
      }
      Some(p) => p,
    };
    let (phys_addr, size) = (self.pool[pos].phys_addr, self.pool[pos].size);
    let phys = u32::try_from(phys_addr)
      .map_err(|_| VtpError::ConfigError(format!("DMA buffer at {:#x} is outside of the 32bit address space", phys_addr)))?;
    let len = vtp_dataclasses::clamp_with_warning("DMA max length", max_len.min(u32::MAX as usize) as u32, 4, size as u32);
    self.dev.locked(|io| {
      io.write32(dma_reg(ch.index(), DMA_DEST_ADDR), phys)?;
      io.write32(dma_reg(ch.index(), DMA_MAX_LEN), len)?;
      io.write32(dma_reg(ch.index(), DMA_CTRL), DMA_CTRL_ENABLE | DMA_CTRL_RUN)
    })?;
    let buffer = self.pool.remove(pos);
    let slot   = &mut self.channels[ch.index()];
    slot.in_flight = Some(buffer);
    slot.state     = DmaState::Running;
    trace!("Started {} into buffer {} ({} bytes max)", ch, buffer_id, len);
    Ok(())
  }

  /// Poll for completion within the bounded budget.
  ///
  /// Returns the number of transferred bytes. A channel
  /// which does not finish in time, or reports an error,
  /// is re-initialized and 0 is returned.
  pub fn wait_done(&mut self, ch : DmaChannelId) -> Result<usize, VtpError> {
    if self.channels[ch.index()].state != DmaState::Running {
      return Err(VtpError::InvalidState(format!("{} was not started", ch)));
    }
    let status_reg = dma_reg(ch.index(), DMA_STATUS);
    let result = self.wait.poll("DMA completion", |_| {
      let status = self.dev.read32(status_reg)?;
      if status & (DMA_STATUS_DONE | DMA_STATUS_ERROR) != 0 {
        Ok(Some(status))
      } else {
        Ok(None)
      }
    });
    let final_state = match result {
      Ok(status) if status & DMA_STATUS_ERROR == 0 => {
        let len = self.dev.read32(dma_reg(ch.index(), DMA_XFER_LEN))? as usize;
        self.recover_buffer(ch);
        self.channels[ch.index()].state = DmaState::Done;
        trace!("{} done, {} bytes", ch, len);
        return Ok(len);
      }
      Ok(status) => {
        error!("{} reports an error, status {:#x}!", ch, status);
        DmaState::Error
      }
      Err(VtpError::Timeout { attempts, .. }) => {
        error!("{} timed out after {} polls, re-initializing!", ch, attempts);
        DmaState::TimedOut
      }
      Err(err) => return Err(err),
    };
    self.reset_sequence(ch)?;
    self.recover_buffer(ch);
    self.channels[ch.index()].state = final_state;
    Ok(0)
  }

  pub fn state(&self, ch : DmaChannelId) -> DmaState {
    self.channels[ch.index()].state
  }

  /// A buffer which is not held by a channel
  pub fn buffer(&self, id : usize) -> Option<&DmaBuffer> {
    self.pool.iter().find(|b| b.id == id)
  }

  pub fn n_buffers(&self) -> usize {
    self.pool.len() + self.channels.iter().filter(|c| c.in_flight.is_some()).count()
  }
}

impl Drop for DmaEngine {
  fn drop(&mut self) {
    if self.n_buffers() > 0 {
      self.mem_close();
    }
  }
}

#[cfg(test)]
mod test_dma {
  use super::*;
  use std::time::Duration;
  use crate::lock::ProcessLock;
  use crate::profile::FirmwareProfile;
  use crate::sim::{
    unique_lock_name,
    DmaCompletion,
    SimRegisters,
  };

  fn engine(sim : &SimRegisters, polls : u32) -> (DmaEngine, String) {
    let name = unique_lock_name("dma");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = Arc::new(VtpDevice::attach(Box::new(sim.clone()), lock, None).unwrap());
    let wait = BoundedWait::new(polls, Duration::ZERO, None);
    (DmaEngine::new(dev, Box::new(HeapAllocator::new()), wait).unwrap(), name)
  }

  #[test]
  fn partial_allocation_is_cleaned_up() {
    let sim  = SimRegisters::board(FirmwareProfile::Streaming, 1);
    let name = unique_lock_name("dma-alloc");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = Arc::new(VtpDevice::attach(Box::new(sim), lock, None).unwrap());
    let mut dma = DmaEngine::new(dev, Box::new(HeapAllocator::with_limit(2)), BoundedWait::dma()).unwrap();
    assert!(matches!(dma.mem_open(4, 1024), Err(VtpError::ResourceExhausted { .. })));
    assert_eq!(dma.n_buffers(), 0);
    // nothing left over, a smaller request works
    assert!(dma.mem_open(2, 1024).is_ok());
    dma.mem_close();
    dma.mem_close();
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn init_sequence_order() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    let (mut dma, name) = engine(&sim, 10);
    sim.clear_log();
    dma.channel_init(DmaChannelId::Board).unwrap();
    assert_eq!(sim.writes_to(dma_reg(1, DMA_CTRL)),
               vec![0, DMA_CTRL_RESET, 0, DMA_CTRL_CLEAR, DMA_CTRL_ENABLE]);
    drop(dma);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn buffer_is_owned_by_the_channel_while_running() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.add_behaviour(Box::new(DmaCompletion::after(0, 5, 512)));
    let (mut dma, name) = engine(&sim, 100);
    dma.mem_open(2, 4096).unwrap();
    dma.channel_init(DmaChannelId::TriggerInterface).unwrap();
    dma.start(DmaChannelId::TriggerInterface, 1, 4096).unwrap();
    assert!(dma.buffer(1).is_none());
    assert!(matches!(dma.start(DmaChannelId::TriggerInterface, 0, 4096), Err(VtpError::InvalidState(_))));
    assert_eq!(dma.wait_done(DmaChannelId::TriggerInterface).unwrap(), 512);
    assert!(dma.buffer(1).is_some());
    assert_eq!(dma.state(DmaChannelId::TriggerInterface), DmaState::Done);
    drop(dma);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn wait_without_start_is_invalid() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    let (mut dma, name) = engine(&sim, 10);
    assert!(matches!(dma.wait_done(DmaChannelId::Board), Err(VtpError::InvalidState(_))));
    drop(dma);
    ProcessLock::destroy(&name).unwrap();
  }
}
