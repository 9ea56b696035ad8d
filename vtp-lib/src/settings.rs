//! Aggregate settings for the VTP driver
//!
//! Different sections represent the different
//! subsystems of the board. All bounded polling
//! loops take their limits from here, the defaults
//! are the values the board is operated with.
//!

use std::fs::File;
use std::io::{
    Write,
    Read,
};
use std::fmt;
use std::env;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

extern crate toml;

use vtp_dataclasses::constants::{
  N_PAYLOAD_PORTS,
  N_STREAMS,
  MTU_DEFAULT,
};
use vtp_dataclasses::errors::{
  SerializationError,
  VtpError,
};

use crate::{
  STATUS_HOST_ENV,
  STATUS_PORT_ENV,
};

/// Limits of a bounded polling loop
///
/// There is no cancellation, giving up after
/// max_attempts (or timeout_ms, if not 0) is
/// the only way out of a wait.
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct WaitSettings {
  /// Maximum number of polls
  pub max_attempts : u32,
  /// Sleep between two polls
  pub backoff_ms   : u64,
  /// Wall clock limit, 0 means only
  /// max_attempts applies
  pub timeout_ms   : u64,
}

impl WaitSettings {
  pub fn new(max_attempts : u32, backoff_ms : u64, timeout_ms : u64) -> Self {
    Self {
      max_attempts,
      backoff_ms,
      timeout_ms,
    }
  }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct DeviceSettings {
  /// The uio device the register window is mapped from
  pub uio_path      : String,
  /// Size of the register window in bytes
  pub window_size   : usize,
  /// Name of the shared lock segment (in /dev/shm)
  pub lock_name     : String,
  /// Refuse to operate a board which runs a
  /// different firmware profile (e.g. "Streaming")
  pub expected_profile : Option<String>,
  /// Limits of the lock health check
  pub lock_health   : WaitSettings,
}

impl DeviceSettings {
  pub fn new() -> Self {
    Self {
      uio_path    : String::from("/dev/uio0"),
      window_size : 0x4000,
      lock_name   : String::from("vtp-board-lock"),
      lock_health : WaitSettings::new(10, 100, 0),
      expected_profile : None,
    }
  }
}

impl Default for DeviceSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct DmaSettings {
  /// Number of physically contiguous buffers
  pub n_buffers      : u32,
  /// Size of each buffer in bytes
  pub buffer_size    : usize,
  /// u-dma-buf device prefix, buffer i is at {prefix}{i}
  pub udmabuf_prefix : String,
  /// Completion polling
  pub wait           : WaitSettings,
}

impl DmaSettings {
  pub fn new() -> Self {
    Self {
      n_buffers      : 4,
      buffer_size    : 4*1024*1024,
      udmabuf_prefix : String::from("/dev/udmabuf"),
      wait           : WaitSettings::new(1_000_000, 0, 0),
    }
  }
}

impl Default for DmaSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SerdesSettings {
  /// Lanes which are expected to come up,
  /// bit 0-15 payload ports, bit 16-19 front panel
  pub lane_mask       : u32,
  /// Time the lane reset is held asserted
  pub reset_settle_ms : u64,
  /// Bring-up retries
  pub link_check      : WaitSettings,
}

impl SerdesSettings {
  pub fn new() -> Self {
    Self {
      lane_mask       : 0x0000ffff,
      link_check      : WaitSettings::new(10, 100, 0),
      reset_settle_ms : 10,
    }
  }
}

impl Default for SerdesSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// How the FPGA network stack operates
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum TransportMode {
  TcpClient,
  TcpServer,
  Udp,
}

impl TransportMode {
  pub fn to_u32(&self) -> u32 {
    match self {
      TransportMode::TcpClient => 0,
      TransportMode::TcpServer => 1,
      TransportMode::Udp       => 2,
    }
  }

  pub fn from_u32(value : u32) -> Option<Self> {
    match value {
      0 => Some(TransportMode::TcpClient),
      1 => Some(TransportMode::TcpServer),
      2 => Some(TransportMode::Udp),
      _ => None,
    }
  }
}

impl fmt::Display for TransportMode {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      TransportMode::TcpClient => "TCP client",
      TransportMode::TcpServer => "TCP server",
      TransportMode::Udp       => "UDP",
    };
    write!(f, "<TransportMode: {}>", repr)
  }
}

/// A 6 byte ethernet address
pub fn parse_mac(mac : &str) -> Result<[u8;6], VtpError> {
  let parts : Vec<&str> = mac.split(':').collect();
  if parts.len() != 6 {
    return Err(VtpError::ConfigError(format!("Malformed MAC address {mac}")));
  }
  let mut bytes = [0u8;6];
  for (k, p) in parts.iter().enumerate() {
    match u8::from_str_radix(p, 16) {
      Err(_) => return Err(VtpError::ConfigError(format!("Malformed MAC address {mac}"))),
      Ok(b)  => bytes[k] = b,
    }
  }
  Ok(bytes)
}

fn parse_ip(what : &str, ip : &str) -> Result<Ipv4Addr, VtpError> {
  Ipv4Addr::from_str(ip)
    .map_err(|_| VtpError::ConfigError(format!("Malformed {what} address {ip}")))
}

/// One network client/server instance
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ConnectionSettings {
  pub enabled    : bool,
  pub mode       : TransportMode,
  pub local_ip   : String,
  pub local_mac  : String,
  pub subnet     : String,
  pub gateway    : String,
  pub dest_ip    : String,
  pub dest_port  : u16,
  pub local_port : u16,
  pub mtu        : u32,
}

impl ConnectionSettings {
  pub fn new() -> Self {
    Self {
      enabled    : false,
      mode       : TransportMode::TcpClient,
      local_ip   : String::from("192.168.1.10"),
      local_mac  : String::from("ce:ba:f0:03:00:a0"),
      subnet     : String::from("255.255.255.0"),
      gateway    : String::from("192.168.1.1"),
      dest_ip    : String::from("192.168.1.100"),
      dest_port  : 46100,
      local_port : 10001,
      mtu        : MTU_DEFAULT,
    }
  }

  pub fn local_ip(&self) -> Result<Ipv4Addr, VtpError> {
    parse_ip("local", &self.local_ip)
  }

  pub fn subnet(&self) -> Result<Ipv4Addr, VtpError> {
    parse_ip("subnet", &self.subnet)
  }

  pub fn gateway(&self) -> Result<Ipv4Addr, VtpError> {
    parse_ip("gateway", &self.gateway)
  }

  pub fn dest_ip(&self) -> Result<Ipv4Addr, VtpError> {
    parse_ip("destination", &self.dest_ip)
  }

  pub fn local_mac(&self) -> Result<[u8;6], VtpError> {
    parse_mac(&self.local_mac)
  }
}

impl Default for ConnectionSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct EventBuilderSettings {
  /// Payload ports which contribute to the frames
  pub pp_enable_mask : u16,
  /// Stream (1-4) each payload port is assigned to
  pub pp_stream      : Vec<u8>,
  /// Frame length in ns, quantized to the frame tick
  pub frame_len_ns   : u32,
  /// Board id as it appears in the frame headers
  pub board_id       : u32,
  /// Number of active streams (at max 4)
  pub n_streams      : u8,
}

impl EventBuilderSettings {
  pub fn new() -> Self {
    Self {
      pp_enable_mask : 0xffff,
      pp_stream      : vec![1; N_PAYLOAD_PORTS],
      frame_len_ns   : 65536,
      board_id       : 1,
      n_streams      : 1,
    }
  }
}

impl Default for EventBuilderSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// Settle times of the network reset sequence
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SettleSettings {
  /// All resets asserted
  pub reset_assert_ms  : u64,
  /// After the PHY reset was released
  pub phy_release_ms   : u64,
  /// After the transceiver reset was released
  pub gt_release_ms    : u64,
  /// After the TCP core reset was released
  pub tcp_release_ms   : u64,
}

impl SettleSettings {
  pub fn new() -> Self {
    Self {
      reset_assert_ms : 10,
      phy_release_ms  : 10,
      gt_release_ms   : 250,
      tcp_release_ms  : 10,
    }
  }
}

impl Default for SettleSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct StreamingSettings {
  pub connections   : Vec<ConnectionSettings>,
  pub event_builder : EventBuilderSettings,
  /// Waiting for the connection to be established
  pub connect       : WaitSettings,
  /// Waiting for the transmit buffer to drain
  pub drain         : WaitSettings,
  /// Waiting for a host injected record to leave
  pub inject        : WaitSettings,
  pub settle        : SettleSettings,
}

impl StreamingSettings {
  pub fn new() -> Self {
    let mut first   = ConnectionSettings::new();
    first.enabled   = true;
    Self {
      connections   : vec![first],
      event_builder : EventBuilderSettings::new(),
      connect       : WaitSettings::new(200, 100, 20000),
      drain         : WaitSettings::new(1000, 1, 5000),
      inject        : WaitSettings::new(1000, 1, 0),
      settle        : SettleSettings::new(),
    }
  }
}

impl Default for StreamingSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// How triggers are handed through the hardware ROC
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum RocMode {
  /// Every trigger is acknowledged by software
  FullSoftware,
  /// Triggers and events flow autonomously
  Hardware,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RocSettings {
  pub mode            : RocMode,
  pub roc_id          : u32,
  /// Maximum size of a record in bytes
  pub max_record_size : u32,
  /// Maximum number of blocks buffered into a record
  pub max_blocks      : u32,
  /// Flush a partially filled record after this many ticks
  pub record_timeout  : u32,
  /// Waiting for space in the async event FIFO
  pub async_fifo      : WaitSettings,
}

impl RocSettings {
  pub fn new() -> Self {
    Self {
      mode            : RocMode::Hardware,
      roc_id          : 1,
      max_record_size : 1024*1024,
      max_blocks      : 1000,
      record_timeout  : 0,
      async_fifo      : WaitSettings::new(1000, 1, 0),
    }
  }
}

impl Default for RocSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct StatusSettings {
  /// Run the 1Hz status sender thread
  pub enabled     : bool,
  pub host        : String,
  pub port        : u16,
  pub interval_ms : u64,
  pub source_id   : u32,
  pub version     : u8,
}

impl StatusSettings {
  pub fn new() -> Self {
    Self {
      enabled     : false,
      host        : String::from("127.0.0.1"),
      port        : 46200,
      interval_ms : 1000,
      source_id   : 1,
      version     : 1,
    }
  }
}

impl Default for StatusSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct VtpSettings {
  pub device    : DeviceSettings,
  pub dma       : DmaSettings,
  pub serdes    : SerdesSettings,
  pub streaming : StreamingSettings,
  pub roc       : RocSettings,
  pub status    : StatusSettings,
}

impl VtpSettings {
  pub fn new() -> Self {
    Self {
      device    : DeviceSettings::new(),
      dma       : DmaSettings::new(),
      serdes    : SerdesSettings::new(),
      streaming : StreamingSettings::new(),
      roc       : RocSettings::new(),
      status    : StatusSettings::new(),
    }
  }

  /// The status sender host/port can be changed
  /// through the environment without touching
  /// the settings file
  pub fn apply_env_overrides(&mut self) {
    if let Ok(host) = env::var(STATUS_HOST_ENV) {
      if !host.is_empty() {
        info!("Status sender host overridden by {STATUS_HOST_ENV}={host}");
        self.status.host = host;
      }
    }
    if let Ok(port) = env::var(STATUS_PORT_ENV) {
      match port.parse::<u16>() {
        Err(err) => {
          error!("Ignoring {STATUS_PORT_ENV}={port}, not a port number! {err}");
        }
        Ok(p) => {
          info!("Status sender port overridden by {STATUS_PORT_ENV}={p}");
          self.status.port = p;
        }
      }
    }
  }

  /// Catch malformed values before anything
  /// is written to the hardware
  pub fn validate(&self) -> Result<(), VtpError> {
    if self.dma.n_buffers == 0 || self.dma.buffer_size == 0 {
      return Err(VtpError::ConfigError(String::from("DMA needs at least one non-empty buffer")));
    }
    if self.streaming.connections.len() > N_STREAMS {
      return Err(VtpError::ConfigError(format!("At max {} connections are supported, got {}",
                                               N_STREAMS, self.streaming.connections.len())));
    }
    if self.streaming.event_builder.pp_stream.len() != N_PAYLOAD_PORTS {
      return Err(VtpError::ConfigError(format!("pp_stream needs {} entries, got {}",
                                               N_PAYLOAD_PORTS,
                                               self.streaming.event_builder.pp_stream.len())));
    }
    for con in self.streaming.connections.iter().filter(|c| c.enabled) {
      con.local_ip()?;
      con.subnet()?;
      con.gateway()?;
      con.dest_ip()?;
      con.local_mac()?;
    }
    if self.serdes.lane_mask >> 20 != 0 {
      return Err(VtpError::ConfigError(format!("Lane mask {:#x} addresses more than 20 lanes",
                                               self.serdes.lane_mask)));
    }
    Ok(())
  }

  /// Write the settings to a toml file
  pub fn to_toml(&self, mut filename : String) {
    if !filename.ends_with(".toml") {
      filename += ".toml";
    }
    info!("Will write to file {}!", filename);
    match File::create(&filename) {
      Err(err) => {
        error!("Unable to open file {}! {}", filename, err);
      }
      Ok(mut file) => {
        match toml::to_string_pretty(&self) {
          Err(err) => {
            error!("Unable to serialize toml! {err}");
          }
          Ok(toml_string) => {
            match file.write_all(toml_string.as_bytes()) {
              Err(err) => error!("Unable to write to file {}! {}", filename, err),
              Ok(_)    => debug!("Wrote settings to {}!", filename)
            }
          }
        }
      }
    }
  }

  /// Write the settings to a json file
  pub fn to_json(&self, mut filename : String) {
    if !filename.ends_with(".json") {
      filename += ".json";
    }
    info!("Will write to file {}!", filename);
    match File::create(&filename) {
      Err(err) => {
        error!("Unable to open file {}! {}", filename, err);
      }
      Ok(mut file) => {
        match serde_json::to_string_pretty(&self) {
          Err(err) => {
            error!("Unable to serialize json! {err}");
          }
          Ok(json_string) => {
            match file.write_all(json_string.as_bytes()) {
              Err(err) => error!("Unable to write to file {}! {}", filename, err),
              Ok(_)    => debug!("Wrote settings to {}!", filename)
            }
          }
        }
      }
    }
  }

  pub fn from_toml(filename : &Path) -> Result<VtpSettings, SerializationError> {
    match File::open(filename) {
      Err(err) => {
        error!("Unable to open {}! {}", filename.display(), err);
        return Err(SerializationError::TomlDecodingError);
      }
      Ok(mut file) => {
        let mut toml_string = String::from("");
        match file.read_to_string(&mut toml_string) {
          Err(err) => {
            error!("Unable to read {}! {}", filename.display(), err);
            return Err(SerializationError::TomlDecodingError);
          }
          Ok(_) => {
            match toml::from_str(&toml_string) {
              Err(err) => {
                error!("Can't interpret toml! {}", err);
                return Err(SerializationError::TomlDecodingError);
              }
              Ok(settings) => {
                return Ok(settings);
              }
            }
          }
        }
      }
    }
  }
}

impl Default for VtpSettings {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for VtpSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp : String;
    match toml::to_string(self) {
      Err(err) => {
        error!("Deserialization error! {err}");
        disp = String::from("-- DESERIALIZATION ERROR! --");
      }
      Ok(_disp) => {
        disp = _disp;
      }
    }
    write!(f, "<VtpSettings :\n{}>", disp)
  }
}
