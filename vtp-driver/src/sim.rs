//! A simulated register file
//!
//! Stands in for the uio window when there is no board,
//! for the unit/integration tests and for `--simulate`.
//! Registers are plain words in a map. Hardware reactions
//! (DMA completion, lanes coming up, the network stack
//! connecting) are modeled by behaviours which get to see
//! every access. All accesses are recorded, so tests can
//! check the order in which registers were touched.

use std::collections::HashMap;
use std::fmt;
use std::sync::{
  Arc,
  Mutex,
};
use std::sync::atomic::{
  AtomicUsize,
  Ordering,
};
use std::time::{
  Duration,
  Instant,
};

use vtp_dataclasses::constants::{
  N_SERDES_LANES,
  N_STREAMS,
};

use crate::memory::RegisterBus;
use crate::profile::FirmwareProfile;
use crate::registers::*;

/// One recorded register access
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
  Read  { offset : u32, value : u32 },
  Write { offset : u32, value : u32 },
}

impl Access {
  pub fn offset(&self) -> u32 {
    match self {
      Access::Read  { offset, .. } => *offset,
      Access::Write { offset, .. } => *offset,
    }
  }

  pub fn value(&self) -> u32 {
    match self {
      Access::Read  { value, .. } => *value,
      Access::Write { value, .. } => *value,
    }
  }

  pub fn is_write(&self) -> bool {
    matches!(self, Access::Write { .. })
  }
}

/// The register contents as seen by the behaviours
#[derive(Debug, Default)]
pub struct RegisterFile {
  values    : HashMap<u32, u32>,
  /// software writes to these are dropped
  read_only : HashMap<u32, ()>,
}

impl RegisterFile {
  pub fn get(&self, offset : u32) -> u32 {
    *self.values.get(&offset).unwrap_or(&0)
  }

  /// Set a register from the hardware side
  pub fn set(&mut self, offset : u32, value : u32) {
    self.values.insert(offset, value);
  }
}

/// Hardware reactions to register accesses
pub trait SimBehaviour : Send {
  /// Called once when the behaviour is added
  fn install(&mut self, _regs : &mut RegisterFile) {}
  /// Called after a software write has been stored
  fn on_write(&mut self, _regs : &mut RegisterFile, _offset : u32, _value : u32) {}
  /// Called before a software read is answered
  fn on_read(&mut self, _regs : &mut RegisterFile, _offset : u32) {}
}

struct SimState {
  size        : usize,
  regs        : RegisterFile,
  behaviours  : Vec<Box<dyn SimBehaviour>>,
  log         : Vec<Access>,
  log_enabled : bool,
}

/// Shared handle to a simulated register space
#[derive(Clone)]
pub struct SimRegisters {
  state : Arc<Mutex<SimState>>,
}

static LOCK_COUNTER : AtomicUsize = AtomicUsize::new(0);

/// A lock name nobody else uses, so simulated boards
/// do not contend with each other (or a real board)
pub fn unique_lock_name(prefix : &str) -> String {
  format!("vtp-sim-{}-{}-{}", prefix, std::process::id(), LOCK_COUNTER.fetch_add(1, Ordering::SeqCst))
}

impl SimRegisters {
  pub fn new(size : usize) -> Self {
    Self {
      state : Arc::new(Mutex::new(SimState {
        size,
        regs        : RegisterFile::default(),
        behaviours  : Vec::new(),
        log         : Vec::new(),
        log_enabled : true,
      })),
    }
  }

  /// An idle board running firmware `profile`.
  /// All lanes are down, nothing reacts.
  pub fn board(profile : FirmwareProfile, board_id : u32) -> Self {
    let sim = Self::new(REGISTER_WINDOW_SIZE);
    sim.poke(BOARD_MAGIC, BOARD_MAGIC_VALUE);
    sim.poke(FW_TYPE, profile.fw_type());
    sim.poke(FW_REVISION, 0x0003_0004);
    sim.poke(BOARD_ID, board_id);
    sim.poke(CLK_STATUS, 1);
    sim.poke(ROC_ASYNC_STATUS, ROC_FIFO_DEPTH as u32);
    sim
  }

  /// A board where everything works: lanes are up,
  /// DMA completes, connections get established and
  /// counters advance. Used for `--simulate`.
  pub fn healthy_board(profile : FirmwareProfile, board_id : u32) -> Self {
    let sim = Self::board(profile, board_id);
    sim.set_logging(false);
    for lane in 0..N_SERDES_LANES {
      sim.add_behaviour(Box::new(LaneTraining::up_after(lane, 0)));
    }
    for ch in 0..2 {
      sim.add_behaviour(Box::new(DmaCompletion::after(ch, 10, 4096)));
    }
    for inst in 0..N_STREAMS {
      sim.add_behaviour(Box::new(NetworkStack::new(inst, Duration::ZERO, 3)));
    }
    sim.add_behaviour(Box::new(HostFifo::new(2)));
    sim.add_behaviour(Box::new(AsyncFifo::new(ROC_FIFO_DEPTH as u32, 64)));
    sim.add_behaviour(Box::new(FreeRunningCounters::new(1_000, 25)));
    sim
  }

  fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
    // a panicking test thread must not take
    // the other tests down with it
    match self.state.lock() {
      Ok(s)  => s,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  pub fn add_behaviour(&self, mut behaviour : Box<dyn SimBehaviour>) {
    let mut state = self.state();
    behaviour.install(&mut state.regs);
    state.behaviours.push(behaviour);
  }

  /// Set a register without logging or behaviours
  pub fn poke(&self, offset : u32, value : u32) {
    self.state().regs.set(offset, value);
  }

  pub fn peek(&self, offset : u32) -> u32 {
    self.state().regs.get(offset)
  }

  /// Software writes to `offset` are dropped
  pub fn set_read_only(&self, offset : u32, value : u32) {
    let mut state = self.state();
    state.regs.set(offset, value);
    state.regs.read_only.insert(offset, ());
  }

  pub fn set_logging(&self, enabled : bool) {
    self.state().log_enabled = enabled;
  }

  pub fn log(&self) -> Vec<Access> {
    self.state().log.clone()
  }

  pub fn clear_log(&self) {
    self.state().log.clear();
  }

  /// All values written to `offset`, in order
  pub fn writes_to(&self, offset : u32) -> Vec<u32> {
    self.state().log.iter()
      .filter(|a| a.is_write() && a.offset() == offset)
      .map(|a| a.value())
      .collect()
  }

  pub fn reads_of(&self, offset : u32) -> usize {
    self.state().log.iter()
      .filter(|a| !a.is_write() && a.offset() == offset)
      .count()
  }
}

impl RegisterBus for SimRegisters {
  fn read32(&self, offset : u32) -> u32 {
    let mut state = self.state();
    let SimState { regs, behaviours, .. } = &mut *state;
    for b in behaviours.iter_mut() {
      b.on_read(regs, offset);
    }
    let value = regs.get(offset);
    if state.log_enabled {
      state.log.push(Access::Read { offset, value });
    }
    value
  }

  fn write32(&self, offset : u32, value : u32) {
    let mut state = self.state();
    if state.log_enabled {
      state.log.push(Access::Write { offset, value });
    }
    let SimState { regs, behaviours, .. } = &mut *state;
    if !regs.read_only.contains_key(&offset) {
      regs.set(offset, value);
    }
    for b in behaviours.iter_mut() {
      b.on_write(regs, offset, value);
    }
  }

  fn size(&self) -> usize {
    self.state().size
  }

  fn describe(&self) -> String {
    String::from("simulated register file")
  }
}

impl fmt::Display for SimRegisters {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let state = self.state();
    write!(f, "<SimRegisters: {} registers set, {} behaviours, {} accesses logged>",
           state.regs.values.len(), state.behaviours.len(), state.log.len())
  }
}

//========== Behaviours =================
//
//=======================================

/// A DMA channel which finishes on the n-th
/// status poll after being started, or never
pub struct DmaCompletion {
  channel   : usize,
  polls     : Option<u32>,
  xfer_len  : u32,
  remaining : Option<u32>,
}

impl DmaCompletion {
  pub fn after(channel : usize, polls : u32, xfer_len : u32) -> Self {
    Self {
      channel,
      polls     : Some(polls.max(1)),
      xfer_len,
      remaining : None,
    }
  }

  pub fn never(channel : usize) -> Self {
    Self {
      channel,
      polls     : None,
      xfer_len  : 0,
      remaining : None,
    }
  }
}

impl SimBehaviour for DmaCompletion {
  fn on_write(&mut self, regs : &mut RegisterFile, offset : u32, value : u32) {
    if offset != dma_reg(self.channel, DMA_CTRL) {
      return;
    }
    let status = dma_reg(self.channel, DMA_STATUS);
    if value & (DMA_CTRL_RESET | DMA_CTRL_CLEAR) != 0 {
      regs.set(status, 0);
      self.remaining = None;
    }
    if value & DMA_CTRL_RUN != 0 && value & DMA_CTRL_ENABLE != 0 {
      regs.set(status, DMA_STATUS_BUSY);
      regs.set(dma_reg(self.channel, DMA_XFER_LEN), 0);
      // a never completing channel stays busy forever
      self.remaining = Some(self.polls.unwrap_or(u32::MAX));
    }
  }

  fn on_read(&mut self, regs : &mut RegisterFile, offset : u32) {
    if offset != dma_reg(self.channel, DMA_STATUS) || self.polls.is_none() {
      return;
    }
    if let Some(r) = self.remaining {
      if r <= 1 {
        let max_len = regs.get(dma_reg(self.channel, DMA_MAX_LEN));
        regs.set(dma_reg(self.channel, DMA_XFER_LEN), self.xfer_len.min(max_len));
        regs.set(offset, DMA_STATUS_DONE);
        self.remaining = None;
      } else {
        self.remaining = Some(r - 1);
      }
    }
  }
}

/// A serdes lane which trains after its n-th
/// reset pulse (0 means it is up right away)
pub struct LaneTraining {
  lane         : usize,
  pulses_req   : u32,
  pulses_seen  : u32,
  in_reset     : bool,
}

impl LaneTraining {
  pub fn up_after(lane : usize, pulses : u32) -> Self {
    Self {
      lane,
      pulses_req  : pulses,
      pulses_seen : 0,
      in_reset    : false,
    }
  }

  pub fn never(lane : usize) -> Self {
    Self::up_after(lane, u32::MAX)
  }

  fn status_up(&self) -> u32 {
    SD_STATUS_SUBLANES | SD_STATUS_CHANNEL_UP
  }
}

impl SimBehaviour for LaneTraining {
  fn install(&mut self, regs : &mut RegisterFile) {
    if self.pulses_req == 0 {
      regs.set(serdes_reg(self.lane, SD_STATUS), self.status_up());
    }
    regs.set(serdes_reg(self.lane, SD_LATENCY), (120 << 16) | 118);
  }

  fn on_write(&mut self, regs : &mut RegisterFile, offset : u32, value : u32) {
    if offset != serdes_reg(self.lane, SD_CTRL) {
      return;
    }
    if value & SD_CTRL_ERR_CNT_RST != 0 {
      regs.set(serdes_reg(self.lane, SD_SOFT_ERR_CNT), 0);
    }
    if value & SD_CTRL_RESET != 0 {
      self.in_reset = true;
      regs.set(serdes_reg(self.lane, SD_STATUS), 0);
    } else if self.in_reset {
      self.in_reset     = false;
      self.pulses_seen += 1;
      if self.pulses_seen >= self.pulses_req {
        regs.set(serdes_reg(self.lane, SD_STATUS), self.status_up());
      }
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum NetPhase {
  Idle,
  ResetAsserted(Instant),
  PhyReleased(Instant),
  GtReleased(Instant),
  TcpReleased(Instant),
  Requested,
  Connected,
  /// Sequence violated, only a full reset helps
  Broken,
}

/// The FPGA network stack of one instance.
///
/// It only connects if the resets are asserted together
/// and then released in the order PHY, GT, TCP with at
/// least `min_settle` between two steps, followed by the
/// request. Anything else leaves it broken until the
/// resets are asserted again.
pub struct NetworkStack {
  inst          : usize,
  min_settle    : Duration,
  connect_polls : u32,
  polls         : u32,
  phase         : NetPhase,
  /// status reads which report pending tx data
  /// once connected
  backlog       : u32,
}

impl NetworkStack {
  pub fn new(inst : usize, min_settle : Duration, connect_polls : u32) -> Self {
    Self {
      inst,
      min_settle,
      connect_polls,
      polls   : 0,
      phase   : NetPhase::Idle,
      backlog : 0,
    }
  }

  pub fn with_backlog(mut self, backlog : u32) -> Self {
    self.backlog = backlog;
    self
  }

  fn next_phase(&self, value : u32) -> NetPhase {
    let resets  = value & NET_CTRL_ALL_RESETS;
    let request = value & (NET_CTRL_CONNECT | NET_CTRL_LISTEN | NET_CTRL_UDP_EN);
    let now     = Instant::now();
    let settled = |t : Instant| now.duration_since(t) >= self.min_settle;
    if resets == NET_CTRL_ALL_RESETS && request == 0 {
      return NetPhase::ResetAsserted(now);
    }
    match self.phase {
      NetPhase::ResetAsserted(t)
        if resets == NET_CTRL_GT_RESET | NET_CTRL_TCP_RESET && request == 0 && settled(t)
        => NetPhase::PhyReleased(now),
      NetPhase::PhyReleased(t)
        if resets == NET_CTRL_TCP_RESET && request == 0 && settled(t)
        => NetPhase::GtReleased(now),
      NetPhase::GtReleased(t)
        if resets == 0 && request == 0 && settled(t)
        => NetPhase::TcpReleased(now),
      NetPhase::TcpReleased(t)
        if resets == 0 && request != 0 && settled(t)
        => NetPhase::Requested,
      NetPhase::Requested | NetPhase::Connected if resets == 0 && request == 0
        => NetPhase::Idle,
      NetPhase::Requested | NetPhase::Connected if resets == 0
        => self.phase,
      _ => NetPhase::Broken,
    }
  }
}

impl SimBehaviour for NetworkStack {
  fn install(&mut self, regs : &mut RegisterFile) {
    regs.set(net_reg(self.inst, NET_TX_FRAMES), 1200);
    regs.set(net_reg(self.inst, NET_TX_BYTES_LO), 0x8000_0000);
    regs.set(net_reg(self.inst, NET_TX_BYTES_HI), 0x2);
  }

  fn on_write(&mut self, _regs : &mut RegisterFile, offset : u32, value : u32) {
    if offset != net_reg(self.inst, NET_CTRL) {
      return;
    }
    self.phase = self.next_phase(value);
    if self.phase == NetPhase::Requested {
      self.polls = 0;
    }
  }

  fn on_read(&mut self, regs : &mut RegisterFile, offset : u32) {
    if offset != net_reg(self.inst, NET_STATUS) {
      return;
    }
    if self.phase == NetPhase::Requested {
      self.polls += 1;
      if self.polls >= self.connect_polls {
        self.phase = NetPhase::Connected;
      }
    }
    let mut status = 0;
    match self.phase {
      NetPhase::PhyReleased(_)
      | NetPhase::GtReleased(_)
      | NetPhase::TcpReleased(_)
      | NetPhase::Requested => {
        status |= NET_STATUS_LINK_UP;
      }
      NetPhase::Connected => {
        status |= NET_STATUS_LINK_UP | NET_STATUS_CONNECTED;
        if self.backlog > 0 {
          self.backlog -= 1;
          status |= NET_STATUS_TX_PENDING;
        }
      }
      NetPhase::Idle
      | NetPhase::ResetAsserted(_)
      | NetPhase::Broken => (),
    }
    regs.set(offset, status);
  }
}

/// The host injection FIFO of the event builder,
/// a record leaves after `reads` status polls
pub struct HostFifo {
  reads     : u32,
  remaining : u32,
}

impl HostFifo {
  pub fn new(reads : u32) -> Self {
    Self {
      reads,
      remaining : 0,
    }
  }
}

impl SimBehaviour for HostFifo {
  fn on_write(&mut self, regs : &mut RegisterFile, offset : u32, _value : u32) {
    if offset == EB_HOST_FIFO_LEN {
      self.remaining = self.reads;
      regs.set(EB_HOST_FIFO_STATUS, if self.reads > 0 { EB_HOST_PENDING } else { 0 });
    }
  }

  fn on_read(&mut self, regs : &mut RegisterFile, offset : u32) {
    if offset == EB_HOST_FIFO_STATUS && self.remaining > 0 {
      self.remaining -= 1;
      if self.remaining == 0 {
        regs.set(EB_HOST_FIFO_STATUS, 0);
      }
    }
  }
}

/// The asynchronous event FIFO of the ROC. The hardware
/// drains `drain_per_poll` words for every status poll.
/// Writing into a full FIFO raises the overflow flag,
/// a ROC reset empties it but keeps the flag.
pub struct AsyncFifo {
  depth          : u32,
  fill           : u32,
  drain_per_poll : u32,
  overflow       : bool,
}

impl AsyncFifo {
  pub fn new(depth : u32, drain_per_poll : u32) -> Self {
    Self {
      depth,
      fill : 0,
      drain_per_poll,
      overflow : false,
    }
  }

  /// Start with `fill` words already queued
  pub fn filled(mut self, fill : u32) -> Self {
    self.fill = fill.min(self.depth);
    self
  }

  fn status(&self) -> u32 {
    let mut status = (self.depth - self.fill) & ROC_ASYNC_FREE_MASK;
    if self.overflow {
      status |= ROC_ASYNC_OVERFLOW;
    }
    status
  }
}

impl SimBehaviour for AsyncFifo {
  fn install(&mut self, regs : &mut RegisterFile) {
    regs.set(ROC_ASYNC_STATUS, self.status());
  }

  fn on_write(&mut self, regs : &mut RegisterFile, offset : u32, value : u32) {
    if offset == ROC_CTRL && value & ROC_CTRL_RESET != 0 {
      self.fill = 0;
      regs.set(ROC_ASYNC_STATUS, self.status());
    }
    if offset == ROC_ASYNC_FIFO_DATA {
      if self.fill >= self.depth {
        self.overflow = true;
      } else {
        self.fill += 1;
      }
      regs.set(ROC_ASYNC_STATUS, self.status());
    }
  }

  fn on_read(&mut self, regs : &mut RegisterFile, offset : u32) {
    if offset == ROC_ASYNC_STATUS {
      regs.set(ROC_ASYNC_STATUS, self.status());
      self.fill = self.fill.saturating_sub(self.drain_per_poll);
    }
  }
}

/// Triggers arriving at the ROC, every sync FIFO
/// acknowledgement consumes one
pub struct RocTriggers {
  pending : u32,
}

impl RocTriggers {
  pub fn new(pending : u32) -> Self {
    Self {
      pending,
    }
  }
}

impl SimBehaviour for RocTriggers {
  fn install(&mut self, regs : &mut RegisterFile) {
    regs.set(ROC_PENDING, self.pending);
    regs.set(ROC_TRIG_CNT, self.pending);
  }

  fn on_write(&mut self, regs : &mut RegisterFile, offset : u32, value : u32) {
    if offset == ROC_SYNC_ACK_LEN && self.pending > 0 {
      self.pending -= 1;
      regs.set(ROC_PENDING, self.pending);
      regs.set(ROC_ACK_CNT, regs.get(ROC_ACK_CNT) + 1);
      let bytes = ((regs.get(ROC_BYTE_CNT_HI) as u64) << 32 | regs.get(ROC_BYTE_CNT_LO) as u64)
        + 4*(value as u64);
      regs.set(ROC_BYTE_CNT_LO, bytes as u32);
      regs.set(ROC_BYTE_CNT_HI, (bytes >> 32) as u32);
    }
  }
}

/// Frame and trigger counters which advance on
/// every read, wrapping at 32 bit
pub struct FreeRunningCounters {
  frame_step   : u32,
  trigger_step : u32,
}

impl FreeRunningCounters {
  pub fn new(frame_step : u32, trigger_step : u32) -> Self {
    Self {
      frame_step,
      trigger_step,
    }
  }
}

impl SimBehaviour for FreeRunningCounters {
  fn on_read(&mut self, regs : &mut RegisterFile, offset : u32) {
    if (EB_FRAME_CNT..EB_FRAME_CNT + 4*N_STREAMS as u32).contains(&offset) {
      regs.set(offset, regs.get(offset).wrapping_add(self.frame_step));
    }
    if offset == ROC_TRIG_CNT {
      regs.set(offset, regs.get(offset).wrapping_add(self.trigger_step));
    }
  }
}

#[cfg(test)]
mod test_sim {
  use super::*;

  #[test]
  fn accesses_are_logged_in_order() {
    let sim = SimRegisters::new(0x100);
    sim.write32(0x10, 5);
    assert_eq!(sim.read32(0x10), 5);
    assert_eq!(sim.log(), vec![Access::Write { offset : 0x10, value : 5 },
                               Access::Read  { offset : 0x10, value : 5 }]);
    sim.clear_log();
    assert!(sim.log().is_empty());
  }

  #[test]
  fn lane_trains_after_pulses() {
    let sim = SimRegisters::new(REGISTER_WINDOW_SIZE);
    sim.add_behaviour(Box::new(LaneTraining::up_after(3, 2)));
    let ctrl = serdes_reg(3, SD_CTRL);
    let stat = serdes_reg(3, SD_STATUS);
    for _ in 0..2 {
      assert_eq!(sim.read32(stat) & SD_STATUS_CHANNEL_UP, 0);
      sim.write32(ctrl, SD_CTRL_RESET);
      sim.write32(ctrl, 0);
    }
    assert_eq!(sim.read32(stat), 0x1f);
  }

  #[test]
  fn network_stack_rejects_a_bare_request() {
    let sim = SimRegisters::new(REGISTER_WINDOW_SIZE);
    sim.add_behaviour(Box::new(NetworkStack::new(0, Duration::ZERO, 1)));
    sim.write32(net_reg(0, NET_CTRL), NET_CTRL_CONNECT);
    for _ in 0..5 {
      assert_eq!(sim.read32(net_reg(0, NET_STATUS)) & NET_STATUS_CONNECTED, 0);
    }
  }

  #[test]
  fn async_fifo_flags_overflow() {
    let sim = SimRegisters::new(REGISTER_WINDOW_SIZE);
    sim.add_behaviour(Box::new(AsyncFifo::new(4, 0)));
    for k in 0..5 {
      sim.write32(ROC_ASYNC_FIFO_DATA, k);
    }
    assert_ne!(sim.read32(ROC_ASYNC_STATUS) & ROC_ASYNC_OVERFLOW, 0);
  }
}
