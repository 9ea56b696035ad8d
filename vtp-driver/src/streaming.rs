//! Streaming transport
//!
//! The network stack which sends the detector data off
//! the board is implemented entirely in FPGA logic. The
//! software side only writes registers and polls status.
//! Bringing up a connection is a sequence of register
//! writes with mandatory settle times in between, tearing
//! it down has to wait for the transmit buffer to drain.
//!
//! The streaming event builder aggregates the payload
//! port data into frames which are handed to the network
//! instances (one per stream). Control events are
//! injected into the same pipeline by the host.

pub mod event_builder;
pub mod network;

pub use event_builder::EventBuilder;
pub use network::NetworkClient;

use std::fmt;
use std::sync::Arc;

use chrono::{
  DateTime,
  Utc,
};

use vtp_dataclasses::constants::N_PAYLOAD_PORTS;
use vtp_dataclasses::errors::VtpError;
use vtp_dataclasses::evio::ControlEvent;
use vtp_lib::settings::StreamingSettings;

use crate::device::VtpDevice;
use crate::serdes::SerdesLinkManager;
use crate::wait::BoundedWait;

/// Life cycle of one network instance
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
  Idle,
  /// Addresses are programmed and verified
  Configuring,
  /// TCP client, connect request issued
  Connecting,
  /// TCP server, listen request issued
  Listening,
  Established,
  /// Waiting for the transmit buffer to drain
  Draining,
  Closed,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      ConnectionState::Idle        => "Idle",
      ConnectionState::Configuring => "Configuring",
      ConnectionState::Connecting  => "Connecting",
      ConnectionState::Listening   => "Listening",
      ConnectionState::Established => "Established",
      ConnectionState::Draining    => "Draining",
      ConnectionState::Closed      => "Closed",
    };
    write!(f, "<ConnectionState: {}>", repr)
  }
}

/// Counters of one network instance. They are reset
/// together with the firmware, so they get taken
/// before a connection is torn down.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct StreamAccounting {
  pub inst        : usize,
  pub frames_sent : u32,
  pub bytes_sent  : u64,
  pub taken_at    : DateTime<Utc>,
}

impl fmt::Display for StreamAccounting {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = format!("<StreamAccounting {}:", self.inst);
    repr += &(format!("\n  frames sent : {}", self.frames_sent));
    repr += &(format!("\n  bytes sent  : {}", self.bytes_sent));
    repr += &(format!("\n  taken at    : {}>", self.taken_at));
    write!(f, "{}", repr)
  }
}

/// Extends a wrapping 32bit hardware counter to 64 bit.
///
/// A sample smaller than the previous one counts as
/// exactly one wrap around. This is only correct if the
/// counter is sampled often enough that it can not wrap
/// twice between two samples, the caller has to ensure
/// that (at 1Hz sampling it holds for any realistic
/// frame rate).
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct FrameCounter {
  last  : Option<u32>,
  wraps : u64,
}

impl FrameCounter {
  pub fn new() -> Self {
    Self {
      last  : None,
      wraps : 0,
    }
  }

  /// Feed a new sample, get the extended value
  pub fn update(&mut self, raw : u32) -> u64 {
    if let Some(previous) = self.last {
      if raw < previous {
        self.wraps += 1;
        debug!("Frame counter wrapped ({} -> {}), {} wraps", previous, raw, self.wraps);
      }
    }
    self.last = Some(raw);
    self.value()
  }

  pub fn value(&self) -> u64 {
    (self.wraps << 32) | self.last.unwrap_or(0) as u64
  }
}

/// Event builder and network instances of one board
pub struct StreamingTransport {
  settings       : StreamingSettings,
  event_builder  : Option<EventBuilder>,
  clients        : Vec<NetworkClient>,
  frame_counters : Vec<FrameCounter>,
  block_number   : u32,
}

impl StreamingTransport {
  pub fn new(dev : Arc<VtpDevice>, settings : &StreamingSettings) -> Result<Self, VtpError> {
    let caps = dev.capabilities();
    if settings.connections.len() > caps.streaming_instances {
      return Err(VtpError::NotSupported(format!("The loaded firmware has {} network instances, {} are configured",
                                                caps.streaming_instances, settings.connections.len())));
    }
    let event_builder = if caps.event_builder {
      Some(EventBuilder::new(dev.clone(), BoundedWait::from(&settings.inject))?)
    } else {
      None
    };
    let mut clients = Vec::<NetworkClient>::new();
    for inst in 0..settings.connections.len() {
      clients.push(NetworkClient::new(dev.clone(),
                                      inst,
                                      settings.settle,
                                      BoundedWait::from(&settings.connect),
                                      BoundedWait::from(&settings.drain))?);
    }
    let n_counters = if caps.event_builder { vtp_dataclasses::constants::N_STREAMS } else { 0 };
    Ok(Self {
      settings       : settings.clone(),
      event_builder,
      clients,
      frame_counters : vec![FrameCounter::new(); n_counters],
      block_number   : 0,
    })
  }

  pub fn event_builder(&self) -> Option<&EventBuilder> {
    self.event_builder.as_ref()
  }

  fn require_event_builder(&mut self) -> Result<&mut EventBuilder, VtpError> {
    match self.event_builder.as_mut() {
      None     => Err(VtpError::NotSupported(String::from("The loaded firmware has no streaming event builder"))),
      Some(eb) => Ok(eb),
    }
  }

  pub fn client(&self, inst : usize) -> Option<&NetworkClient> {
    self.clients.get(inst)
  }

  pub fn client_mut(&mut self, inst : usize) -> Option<&mut NetworkClient> {
    self.clients.get_mut(inst)
  }

  fn n_streams(&self) -> Option<u32> {
    self.event_builder.as_ref().map(|eb| eb.n_streams())
  }

  /// Program the event builder and all enabled
  /// network instances, verifying every value
  pub fn configure(&mut self) -> Result<(), VtpError> {
    let eb_settings = self.settings.event_builder.clone();
    if let Some(eb) = self.event_builder.as_mut() {
      eb.configure(&eb_settings)?;
    }
    for (inst, con) in self.settings.connections.iter().enumerate() {
      if !con.enabled {
        continue;
      }
      self.clients[inst].configure(con)?;
    }
    Ok(())
  }

  /// Connect all enabled instances. A failed connection
  /// is not an error, false is returned and the caller
  /// can try again later.
  pub fn connect(&mut self) -> Result<bool, VtpError> {
    let n_streams = self.n_streams();
    let mut all_up = true;
    for (inst, con) in self.settings.connections.iter().enumerate() {
      if !con.enabled {
        continue;
      }
      if !self.clients[inst].connect(n_streams)? {
        all_up = false;
      }
    }
    Ok(all_up)
  }

  /// Let payload port data into the frames, but only
  /// from ports whose lanes are fully up. Returns the
  /// payload port mask which has been applied.
  pub fn enable_data_flow(&mut self, links : &SerdesLinkManager) -> Result<u16, VtpError> {
    let wanted = self.settings.event_builder.pp_enable_mask;
    let mut ready = 0u16;
    for port in 0..N_PAYLOAD_PORTS {
      if wanted & (1 << port) == 0 {
        continue;
      }
      if links.port_ready(port)? {
        ready |= 1 << port;
      } else {
        warn!("Payload port {} is not ready, masking it out", port + 1);
      }
    }
    let eb = self.require_event_builder()?;
    eb.set_pp_mask(ready)?;
    eb.set_stream_processing(true)?;
    info!("Data flow enabled for payload ports {:#06x}", ready);
    Ok(ready)
  }

  pub fn disable_data_flow(&mut self) -> Result<(), VtpError> {
    self.require_event_builder()?.set_stream_processing(false)
  }

  /// Inject a control event into the outgoing stream
  pub fn send_control_event(&mut self, event : &ControlEvent) -> Result<usize, VtpError> {
    let block  = self.block_number;
    let roc_id = self.settings.event_builder.board_id;
    let n      = self.require_event_builder()?.inject_control_event(event, block, roc_id)?;
    self.block_number = self.block_number.wrapping_add(1);
    Ok(n)
  }

  /// Sample the hardware frame counter of `stream`
  /// and extend it to 64 bit
  pub fn frame_number(&mut self, stream : usize) -> Result<u64, VtpError> {
    let raw = self.require_event_builder()?.frame_count(stream)?;
    match self.frame_counters.get_mut(stream) {
      None    => Err(VtpError::ConfigError(format!("There is no stream {stream}"))),
      Some(c) => Ok(c.update(raw)),
    }
  }

  /// Drain and close every connection which is not
  /// idle or already closed. The counters are taken
  /// before. Every instance gets its drain attempt,
  /// the first failure is returned afterwards and the
  /// failed instances stay open.
  pub fn disconnect(&mut self) -> Result<Vec<StreamAccounting>, VtpError> {
    let mut accounting = Vec::new();
    let mut failure    = None;
    for client in self.clients.iter_mut() {
      match client.state() {
        ConnectionState::Idle | ConnectionState::Closed => continue,
        _ => (),
      }
      match client.disconnect() {
        Ok(acc) => accounting.push(acc),
        Err(err) => {
          if failure.is_none() {
            failure = Some(err);
          }
        }
      }
    }
    match failure {
      Some(err) => Err(err),
      None      => Ok(accounting),
    }
  }

  /// Close every connection without waiting for the
  /// transmit buffers
  pub fn disconnect_immediate(&mut self) -> Result<Vec<StreamAccounting>, VtpError> {
    let mut accounting = Vec::new();
    for client in self.clients.iter_mut() {
      match client.state() {
        ConnectionState::Idle | ConnectionState::Closed => continue,
        _ => (),
      }
      accounting.push(client.disconnect_immediate()?);
    }
    Ok(accounting)
  }
}

#[cfg(test)]
mod test_streaming {
  use super::*;

  #[test]
  fn frame_counter_extends_over_wraps() {
    let mut fc = FrameCounter::new();
    assert_eq!(fc.update(10), 10);
    assert_eq!(fc.update(u32::MAX - 5), (u32::MAX - 5) as u64);
    assert_eq!(fc.update(3), (1u64 << 32) + 3);
    assert_eq!(fc.update(3), (1u64 << 32) + 3);
    assert_eq!(fc.update(2), (2u64 << 32) + 2);
  }

  #[test]
  fn frame_counter_is_monotonic_for_one_wrap_per_sample() {
    let mut fc     = FrameCounter::new();
    let mut truth  = 0u64;
    let mut last   = 0u64;
    // steps just below 2^32 wrap on nearly every sample
    for step in [1u64, 4_000_000_000, 12345, 4_294_967_000, 17, 3_000_000_000] {
      truth += step;
      let extended = fc.update(truth as u32);
      assert!(extended >= last);
      assert_eq!(extended, truth);
      last = extended;
    }
  }
}
