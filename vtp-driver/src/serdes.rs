//! Serdes lanes
//!
//! 20 high speed lanes, 16 from the payload ports on
//! the backplane and 4 on the front panel. Every lane
//! has 4 physical sub-lanes. A lane is recovered by
//! pulsing its reset, which forces the transceiver to
//! train again. Nothing interrupts, the state is only
//! ever observed by polling the status registers.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{
  Duration,
  Instant,
};

use vtp_dataclasses::constants::{
  N_PAYLOAD_PORTS,
  N_SERDES_LANES,
  N_SUBLANES,
};
use vtp_dataclasses::errors::VtpError;

use crate::device::VtpDevice;
use crate::registers::{
  serdes_reg,
  SD_CTRL,
  SD_CTRL_ERR_CNT_RST,
  SD_CTRL_RESET,
  SD_LATENCY,
  SD_SOFT_ERR_CNT,
  SD_STATUS,
  SD_STATUS_CHANNEL_UP,
};
use crate::wait::BoundedWait;

/// Payload ports are named PP1-PP16, the
/// front panel lanes FP1-FP4
pub fn lane_name(lane : usize) -> String {
  if lane < N_PAYLOAD_PORTS {
    format!("PP{}", lane + 1)
  } else {
    format!("FP{}", lane - N_PAYLOAD_PORTS + 1)
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
  Down,
  /// Reset released, waiting for the channel
  Training,
  Up,
}

impl fmt::Display for LinkState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      LinkState::Down     => "Down",
      LinkState::Training => "Training",
      LinkState::Up       => "Up",
    };
    write!(f, "{}", repr)
  }
}

/// Snapshot of one lane
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LaneStatus {
  pub lane        : usize,
  pub sublanes_up : [bool; N_SUBLANES],
  pub channel_up  : bool,
  pub soft_errors : u32,
  /// one way latencies in clock ticks
  pub rx_latency  : u16,
  pub tx_latency  : u16,
}

impl LaneStatus {
  /// Fully trained, all sub-lanes included
  pub fn is_ready(&self) -> bool {
    self.channel_up && self.sublanes_up.iter().all(|s| *s)
  }
}

impl fmt::Display for LaneStatus {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let sub : String = self.sublanes_up.iter()
      .map(|s| if *s { '1' } else { '0' })
      .collect();
    write!(f, "{:<5} up: {:<5} sub-lanes: {} soft errors: {:>8} latency rx/tx: {}/{}",
           lane_name(self.lane), self.channel_up, sub, self.soft_errors,
           self.rx_latency, self.tx_latency)
  }
}

/// What check_links saw
#[derive(Debug, Clone, PartialEq)]
pub struct LinkCheckReport {
  /// Lanes which were asked for
  pub wanted    : u32,
  /// Down lanes after every pass, the first entry
  /// is the initial observation before any reset
  pub down_per_pass : Vec<u32>,
  pub up_mask   : u32,
}

impl LinkCheckReport {
  /// Number of reset pulses which were issued
  pub fn retries(&self) -> usize {
    self.down_per_pass.len().saturating_sub(1)
  }

  pub fn all_up(&self) -> bool {
    self.wanted & !self.up_mask == 0
  }
}

impl fmt::Display for LinkCheckReport {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<LinkCheckReport:");
    repr += &(format!("\n  wanted  : {:#07x}", self.wanted));
    repr += &(format!("\n  up      : {:#07x}", self.up_mask));
    repr += &(format!("\n  retries : {}>", self.retries()));
    write!(f, "{}", repr)
  }
}

fn mask_names(mask : u32) -> String {
  let names : Vec<String> = (0..N_SERDES_LANES)
    .filter(|l| mask & (1 << l) != 0)
    .map(lane_name)
    .collect();
  names.join(" ")
}

pub struct SerdesLinkManager {
  dev      : Arc<VtpDevice>,
  /// lanes which are expected to come up
  wanted   : u32,
  policy   : BoundedWait,
  settle   : Duration,
  states   : [LinkState; N_SERDES_LANES],
}

impl SerdesLinkManager {
  /// Lanes which are not routed in the loaded
  /// firmware are dropped from `lane_mask`
  pub fn new(dev       : Arc<VtpDevice>,
             lane_mask : u32,
             policy    : BoundedWait,
             settle    : Duration) -> Self {
    let routed = dev.capabilities().serdes_lanes;
    if lane_mask & !routed != 0 {
      warn!("Lanes {} are not routed in this firmware, ignoring them", mask_names(lane_mask & !routed));
    }
    Self {
      dev,
      wanted : lane_mask & routed,
      policy,
      settle,
      states : [LinkState::Down; N_SERDES_LANES],
    }
  }

  fn check_lane(lane : usize) -> Result<(), VtpError> {
    if lane >= N_SERDES_LANES {
      return Err(VtpError::ConfigError(format!("There is no serdes lane {lane}")));
    }
    Ok(())
  }

  pub fn wanted(&self) -> u32 {
    self.wanted
  }

  pub fn state(&self, lane : usize) -> LinkState {
    self.states.get(lane).copied().unwrap_or(LinkState::Down)
  }

  /// Current channel up bits of all lanes
  pub fn up_mask(&mut self) -> Result<u32, VtpError> {
    let statuses = self.dev.locked(|io| {
      let mut s = [0u32; N_SERDES_LANES];
      for (lane, status) in s.iter_mut().enumerate() {
        *status = io.read32(serdes_reg(lane, SD_STATUS))?;
      }
      Ok(s)
    })?;
    let mut mask = 0u32;
    for (lane, status) in statuses.iter().enumerate() {
      if status & SD_STATUS_CHANNEL_UP != 0 {
        mask |= 1 << lane;
        self.states[lane] = LinkState::Up;
      } else if self.states[lane] == LinkState::Up {
        warn!("Lane {} lost its channel!", lane_name(lane));
        self.states[lane] = LinkState::Down;
      }
    }
    Ok(mask)
  }

  /// Poll the wanted lanes, pulsing the reset of those
  /// which are down, until all are up or the retry
  /// budget is used up. Returns what was seen in
  /// every pass, the final up mask included.
  pub fn check_links(&mut self) -> Result<LinkCheckReport, VtpError> {
    let start    = Instant::now();
    let mut up   = self.up_mask()?;
    let mut down = self.wanted & !up;
    let mut down_per_pass = vec![down];
    debug!("Initial link check, down: [{}]", mask_names(down));
    let mut pass = 0u32;
    while down != 0 && pass < self.policy.max_attempts {
      if let Some(limit) = self.policy.timeout {
        if start.elapsed() >= limit {
          break;
        }
      }
      pass += 1;
      for lane in (0..N_SERDES_LANES).filter(|l| down & (1 << l) != 0) {
        self.pulse_reset(lane)?;
      }
      if !self.policy.backoff.is_zero() {
        thread::sleep(self.policy.backoff);
      }
      up   = self.up_mask()?;
      down = self.wanted & !up;
      down_per_pass.push(down);
      if down != 0 {
        info!("Link check pass {}/{}, still down: [{}]", pass, self.policy.max_attempts, mask_names(down));
      }
    }
    if down != 0 {
      warn!("Lanes [{}] did not come up after {} retries!", mask_names(down), pass);
    } else {
      info!("All wanted lanes up after {} retries", pass);
    }
    Ok(LinkCheckReport {
      wanted : self.wanted,
      down_per_pass,
      up_mask : up,
    })
  }

  fn pulse_reset(&mut self, lane : usize) -> Result<(), VtpError> {
    let ctrl = serdes_reg(lane, SD_CTRL);
    self.dev.set_bits(ctrl, SD_CTRL_RESET)?;
    if !self.settle.is_zero() {
      thread::sleep(self.settle);
    }
    self.dev.clear_bits(ctrl, SD_CTRL_RESET)?;
    self.states[lane] = LinkState::Training;
    trace!("Pulsed reset of lane {}", lane_name(lane));
    Ok(())
  }

  /// Force a lane to train again (on) or keep
  /// it in reset (off)
  pub fn enable(&mut self, lane : usize, on : bool) -> Result<(), VtpError> {
    Self::check_lane(lane)?;
    if on {
      self.pulse_reset(lane)
    } else {
      self.disable(lane)
    }
  }

  /// Hold the lane in reset
  pub fn disable(&mut self, lane : usize) -> Result<(), VtpError> {
    Self::check_lane(lane)?;
    self.dev.set_bits(serdes_reg(lane, SD_CTRL), SD_CTRL_RESET)?;
    self.states[lane] = LinkState::Down;
    debug!("Lane {} held in reset", lane_name(lane));
    Ok(())
  }

  pub fn status(&self, lane : usize) -> Result<LaneStatus, VtpError> {
    Self::check_lane(lane)?;
    let (status, errors, latency) = self.dev.locked(|io| {
      Ok((io.read32(serdes_reg(lane, SD_STATUS))?,
          io.read32(serdes_reg(lane, SD_SOFT_ERR_CNT))?,
          io.read32(serdes_reg(lane, SD_LATENCY))?))
    })?;
    let mut sublanes_up = [false; N_SUBLANES];
    for (k, s) in sublanes_up.iter_mut().enumerate() {
      *s = status & (1 << k) != 0;
    }
    Ok(LaneStatus {
      lane,
      sublanes_up,
      channel_up  : status & SD_STATUS_CHANNEL_UP != 0,
      soft_errors : errors,
      rx_latency  : (latency & 0xffff) as u16,
      tx_latency  : (latency >> 16) as u16,
    })
  }

  /// May data flow on this lane?
  pub fn port_ready(&self, lane : usize) -> Result<bool, VtpError> {
    Ok(self.status(lane)?.is_ready())
  }

  pub fn reset_error_counter(&self, lane : usize) -> Result<(), VtpError> {
    Self::check_lane(lane)?;
    let ctrl = serdes_reg(lane, SD_CTRL);
    self.dev.locked(|io| {
      io.set_bits(ctrl, SD_CTRL_ERR_CNT_RST)?;
      io.clear_bits(ctrl, SD_CTRL_ERR_CNT_RST)?;
      Ok(())
    })
  }

  /// Status of all lanes, for diagnostics
  pub fn status_table(&self) -> Result<Vec<LaneStatus>, VtpError> {
    (0..N_SERDES_LANES).map(|lane| self.status(lane)).collect()
  }
}

#[cfg(test)]
mod test_serdes {
  use super::*;
  use crate::lock::ProcessLock;
  use crate::profile::FirmwareProfile;
  use crate::sim::{
    unique_lock_name,
    LaneTraining,
    SimRegisters,
  };

  fn manager(sim : &SimRegisters, mask : u32, attempts : u32) -> (SerdesLinkManager, String) {
    let name = unique_lock_name("serdes");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = Arc::new(VtpDevice::attach(Box::new(sim.clone()), lock, None).unwrap());
    let policy = BoundedWait::new(attempts, Duration::ZERO, None);
    (SerdesLinkManager::new(dev, mask, policy, Duration::ZERO), name)
  }

  #[test]
  fn lane_names() {
    assert_eq!(lane_name(0), "PP1");
    assert_eq!(lane_name(15), "PP16");
    assert_eq!(lane_name(16), "FP1");
    assert_eq!(lane_name(19), "FP4");
  }

  #[test]
  fn status_decoding() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.poke(serdes_reg(2, SD_STATUS), 0b1_0111);
    sim.poke(serdes_reg(2, SD_SOFT_ERR_CNT), 12);
    sim.poke(serdes_reg(2, SD_LATENCY), (300 << 16) | 200);
    let (links, name) = manager(&sim, 0x4, 1);
    let status = links.status(2).unwrap();
    assert_eq!(status.sublanes_up, [true, true, true, false]);
    assert!(status.channel_up);
    assert!(!status.is_ready());
    assert_eq!(status.soft_errors, 12);
    assert_eq!(status.rx_latency, 200);
    assert_eq!(status.tx_latency, 300);
    assert!(links.status(20).is_err());
    drop(links);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn disable_holds_reset() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.add_behaviour(Box::new(LaneTraining::up_after(5, 0)));
    let (mut links, name) = manager(&sim, 1 << 5, 1);
    assert!(links.port_ready(5).unwrap());
    links.enable(5, false).unwrap();
    assert_eq!(sim.peek(serdes_reg(5, SD_CTRL)) & SD_CTRL_RESET, SD_CTRL_RESET);
    assert!(!links.port_ready(5).unwrap());
    assert_eq!(links.state(5), LinkState::Down);
    links.enable(5, true).unwrap();
    assert!(links.port_ready(5).unwrap());
    drop(links);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn unrouted_lanes_are_dropped() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    let (links, name) = manager(&sim, 0xfff0_0001, 1);
    assert_eq!(links.wanted(), 0x1);
    drop(links);
    ProcessLock::destroy(&name).unwrap();
  }
}
