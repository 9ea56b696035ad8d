//! One FPGA network instance (TCP client, TCP server or UDP)

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use vtp_dataclasses::clamp_with_warning;
use vtp_dataclasses::constants::{
  MTU_MAX,
  MTU_MIN,
};
use vtp_dataclasses::errors::VtpError;
use vtp_lib::settings::{
  ConnectionSettings,
  SettleSettings,
  TransportMode,
};

use crate::device::VtpDevice;
use crate::registers::*;
use crate::streaming::{
  ConnectionState,
  StreamAccounting,
};
use crate::wait::BoundedWait;

const NET_CTRL_REQUESTS : u32 = NET_CTRL_CONNECT | NET_CTRL_LISTEN | NET_CTRL_UDP_EN;

pub struct NetworkClient {
  dev             : Arc<VtpDevice>,
  inst            : usize,
  state           : ConnectionState,
  mode            : Option<TransportMode>,
  settle          : SettleSettings,
  connect_wait    : BoundedWait,
  drain_wait      : BoundedWait,
  last_accounting : Option<StreamAccounting>,
}

impl NetworkClient {
  pub fn new(dev          : Arc<VtpDevice>,
             inst         : usize,
             settle       : SettleSettings,
             connect_wait : BoundedWait,
             drain_wait   : BoundedWait) -> Result<Self, VtpError> {
    dev.capabilities().require_streaming_instance(inst)?;
    Ok(Self {
      dev,
      inst,
      state           : ConnectionState::Idle,
      mode            : None,
      settle,
      connect_wait,
      drain_wait,
      last_accounting : None,
    })
  }

  pub fn inst(&self) -> usize {
    self.inst
  }

  pub fn state(&self) -> ConnectionState {
    self.state
  }

  pub fn mode(&self) -> Option<TransportMode> {
    self.mode
  }

  /// Counters taken by the last disconnect
  pub fn last_accounting(&self) -> Option<StreamAccounting> {
    self.last_accounting
  }

  fn reg(&self, reg : u32) -> u32 {
    net_reg(self.inst, reg)
  }

  /// Program mode, addresses, ports and MTU. Every
  /// value is read back. The MTU is clamped into the
  /// range the stack supports.
  pub fn configure(&mut self, con : &ConnectionSettings) -> Result<(), VtpError> {
    match self.state {
      ConnectionState::Connecting
      | ConnectionState::Listening
      | ConnectionState::Established
      | ConnectionState::Draining => {
        return Err(VtpError::InvalidState(format!("Instance {} is {}, disconnect it first!", self.inst, self.state)));
      }
      _ => ()
    }
    // parse everything before the first write
    let local_ip = u32::from(con.local_ip()?);
    let subnet   = u32::from(con.subnet()?);
    let gateway  = u32::from(con.gateway()?);
    let dest_ip  = u32::from(con.dest_ip()?);
    let mac      = con.local_mac()?;
    let mac_hi   = (mac[0] as u32) << 8 | mac[1] as u32;
    let mac_lo   = (mac[2] as u32) << 24 | (mac[3] as u32) << 16 | (mac[4] as u32) << 8 | mac[5] as u32;
    let mtu      = clamp_with_warning("mtu", con.mtu, MTU_MIN, MTU_MAX);

    let regs : [(u32, u32, u32); 10] = [
      (self.reg(NET_MODE),       con.mode.to_u32(),     0x3),
      (self.reg(NET_LOCAL_IP),   local_ip,              u32::MAX),
      (self.reg(NET_SUBNET),     subnet,                u32::MAX),
      (self.reg(NET_GATEWAY),    gateway,               u32::MAX),
      (self.reg(NET_MAC_HI),     mac_hi,                0xffff),
      (self.reg(NET_MAC_LO),     mac_lo,                u32::MAX),
      (self.reg(NET_DEST_IP),    dest_ip,               u32::MAX),
      (self.reg(NET_DEST_PORT),  con.dest_port as u32,  0xffff),
      (self.reg(NET_LOCAL_PORT), con.local_port as u32, 0xffff),
      (self.reg(NET_MTU),        mtu,                   0x3fff),
    ];
    let result = self.dev.locked(|io| {
      for (offset, value, mask) in regs {
        io.write_verify(offset, value, mask)?;
      }
      Ok(())
    });
    match result {
      Err(err) => {
        error!("Configuring network instance {} failed! {err}", self.inst);
        self.state = ConnectionState::Idle;
        self.mode  = None;
        Err(err)
      }
      Ok(_) => {
        info!("Network instance {} configured as {:?}, {} -> {}:{}, mtu {}",
              self.inst, con.mode, con.local_ip, con.dest_ip, con.dest_port, mtu);
        self.state = ConnectionState::Configuring;
        self.mode  = Some(con.mode);
        Ok(())
      }
    }
  }

  fn pause(&self, ms : u64) {
    thread::sleep(Duration::from_millis(ms));
  }

  /// Bring the connection up.
  ///
  /// The resets are asserted together and released
  /// one by one (PHY, GT, TCP) with a settle time
  /// after every step. The request bit and the number
  /// of streams are written in the same transaction,
  /// then the connected flag is polled.
  ///
  /// Not getting a connection is not an error, the
  /// failure is logged and Ok(false) returned, so
  /// the caller can retry with the next run.
  pub fn connect(&mut self, n_streams : Option<u32>) -> Result<bool, VtpError> {
    let mode = match self.mode {
      None => {
        return Err(VtpError::InvalidState(format!("Network instance {} has not been configured!", self.inst)));
      }
      Some(m) => m,
    };
    let ctrl = self.reg(NET_CTRL);
    self.dev.write32(ctrl, NET_CTRL_ALL_RESETS)?;
    self.pause(self.settle.reset_assert_ms);
    self.dev.clear_bits(ctrl, NET_CTRL_PHY_RESET)?;
    self.pause(self.settle.phy_release_ms);
    self.dev.clear_bits(ctrl, NET_CTRL_GT_RESET)?;
    self.pause(self.settle.gt_release_ms);
    self.dev.clear_bits(ctrl, NET_CTRL_TCP_RESET)?;
    self.pause(self.settle.tcp_release_ms);

    let request = match mode {
      TransportMode::TcpClient => NET_CTRL_CONNECT,
      TransportMode::TcpServer => NET_CTRL_LISTEN,
      TransportMode::Udp       => NET_CTRL_UDP_EN,
    };
    self.dev.locked(|io| {
      io.write32(ctrl, request)?;
      if let Some(n) = n_streams {
        io.write32(EB_NSTREAMS, n)?;
      }
      Ok(())
    })?;
    self.state = match mode {
      TransportMode::TcpServer => ConnectionState::Listening,
      _                        => ConnectionState::Connecting,
    };

    let status = self.reg(NET_STATUS);
    let dev    = &self.dev;
    let result = self.connect_wait.poll("network connection", |_| {
      if dev.read32(status)? & NET_STATUS_CONNECTED != 0 {
        Ok(Some(()))
      } else {
        Ok(None)
      }
    });
    match result {
      Ok(_) => {
        info!("Network instance {} established", self.inst);
        self.state = ConnectionState::Established;
        Ok(true)
      }
      Err(VtpError::Timeout { what, attempts }) => {
        error!("Network instance {} did not connect ({what} timed out after {attempts} attempts)!", self.inst);
        // addresses are still valid, allow a retry
        self.state = ConnectionState::Configuring;
        Ok(false)
      }
      Err(err) => {
        self.state = ConnectionState::Configuring;
        Err(err)
      }
    }
  }

  /// Read the transmit counters
  pub fn accounting(&self) -> Result<StreamAccounting, VtpError> {
    let frames = self.reg(NET_TX_FRAMES);
    let hi     = self.reg(NET_TX_BYTES_HI);
    let lo     = self.reg(NET_TX_BYTES_LO);
    let inst   = self.inst;
    self.dev.locked(|io| {
      Ok(StreamAccounting {
        inst,
        frames_sent : io.read32(frames)?,
        bytes_sent  : io.read_split_u64(hi, lo)?,
        taken_at    : Utc::now(),
      })
    })
  }

  /// Wait for the transmit buffer to drain, then
  /// close.
  ///
  /// If the buffer does not drain in time the request
  /// stays set and the state stays Draining. The caller
  /// can call disconnect again or give up with
  /// disconnect_immediate.
  pub fn disconnect(&mut self) -> Result<StreamAccounting, VtpError> {
    self.state = ConnectionState::Draining;
    let accounting = self.accounting()?;
    let status = self.reg(NET_STATUS);
    let dev    = &self.dev;
    let result = self.drain_wait.poll("transmit drain", |_| {
      if dev.read32(status)? & NET_STATUS_TX_PENDING == 0 {
        Ok(Some(()))
      } else {
        Ok(None)
      }
    });
    if let Err(err) = result {
      if let VtpError::Timeout { .. } = err {
        error!("Network instance {} still has data pending, keeping the connection open!", self.inst);
      }
      return Err(err);
    }
    self.close(accounting)
  }

  /// Close without draining
  pub fn disconnect_immediate(&mut self) -> Result<StreamAccounting, VtpError> {
    let accounting = self.accounting()?;
    self.close(accounting)
  }

  fn close(&mut self, accounting : StreamAccounting) -> Result<StreamAccounting, VtpError> {
    self.dev.clear_bits(self.reg(NET_CTRL), NET_CTRL_REQUESTS)?;
    info!("Network instance {} closed after {} frames, {} bytes",
          self.inst, accounting.frames_sent, accounting.bytes_sent);
    self.state           = ConnectionState::Closed;
    self.last_accounting = Some(accounting);
    Ok(accounting)
  }
}

#[cfg(test)]
mod test_network {
  use super::*;
  use crate::lock::ProcessLock;
  use crate::profile::FirmwareProfile;
  use crate::sim::{
    unique_lock_name,
    Access,
    NetworkStack,
    SimRegisters,
  };

  fn no_settle() -> SettleSettings {
    SettleSettings {
      reset_assert_ms : 0,
      phy_release_ms  : 0,
      gt_release_ms   : 0,
      tcp_release_ms  : 0,
    }
  }

  fn client(sim : &SimRegisters, inst : usize) -> (NetworkClient, String) {
    let name = unique_lock_name("net");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = Arc::new(VtpDevice::attach(Box::new(sim.clone()), lock, None).unwrap());
    let wait = BoundedWait::new(10, Duration::ZERO, None);
    (NetworkClient::new(dev, inst, no_settle(), wait, wait).unwrap(), name)
  }

  #[test]
  fn configure_splits_the_mac() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    let (mut cl, name) = client(&sim, 1);
    let mut con = ConnectionSettings::new();
    con.local_mac = String::from("ce:ba:f0:03:00:a1");
    con.mtu       = 20000;
    cl.configure(&con).unwrap();
    assert_eq!(sim.peek(net_reg(1, NET_MAC_HI)), 0xceba);
    assert_eq!(sim.peek(net_reg(1, NET_MAC_LO)), 0xf00300a1);
    assert_eq!(sim.peek(net_reg(1, NET_MTU)), MTU_MAX);
    assert_eq!(cl.state(), ConnectionState::Configuring);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn configure_detects_unlatched_values() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.set_read_only(net_reg(0, NET_DEST_PORT), 0);
    let (mut cl, name) = client(&sim, 0);
    let res = cl.configure(&ConnectionSettings::new());
    assert!(matches!(res, Err(VtpError::VerifyFailed { .. })));
    assert_eq!(cl.state(), ConnectionState::Idle);
    assert!(matches!(cl.connect(None), Err(VtpError::InvalidState(_))));
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn instance_missing_in_firmware() {
    let sim  = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    let name = unique_lock_name("net-missing");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = Arc::new(VtpDevice::attach(Box::new(sim), lock, None).unwrap());
    let res  = NetworkClient::new(dev, 2, no_settle(), BoundedWait::connect(), BoundedWait::drain());
    assert!(matches!(res, Err(VtpError::NotSupported(_))));
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn connect_and_drain() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.add_behaviour(Box::new(NetworkStack::new(0, Duration::ZERO, 3).with_backlog(4)));
    let (mut cl, name) = client(&sim, 0);
    cl.configure(&ConnectionSettings::new()).unwrap();
    assert!(cl.connect(Some(2)).unwrap());
    assert_eq!(cl.state(), ConnectionState::Established);
    assert_eq!(sim.peek(EB_NSTREAMS), 2);

    sim.clear_log();
    let acc = cl.disconnect().unwrap();
    assert_eq!(acc.frames_sent, 1200);
    assert_eq!(acc.bytes_sent, 0x2_8000_0000);
    assert_eq!(cl.state(), ConnectionState::Closed);
    // the request is only withdrawn after the
    // last status read showed nothing pending
    let log = sim.log();
    let ctrl_write = log.iter()
      .position(|a| a.is_write() && a.offset() == net_reg(0, NET_CTRL))
      .unwrap();
    let last_status = log[..ctrl_write].iter()
      .rev()
      .find(|a| matches!(a, Access::Read { offset, .. } if *offset == net_reg(0, NET_STATUS)))
      .unwrap();
    assert_eq!(last_status.value() & NET_STATUS_TX_PENDING, 0);
    assert_eq!(sim.peek(net_reg(0, NET_CTRL)) & NET_CTRL_REQUESTS, 0);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn drain_timeout_keeps_the_connection() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.set_logging(false);
    // more pending status reads than one drain budget
    sim.add_behaviour(Box::new(NetworkStack::new(0, Duration::ZERO, 3).with_backlog(16)));
    let (mut cl, name) = client(&sim, 0);
    cl.configure(&ConnectionSettings::new()).unwrap();
    assert!(cl.connect(None).unwrap());

    match cl.disconnect() {
      Err(VtpError::Timeout { .. }) => (),
      other => panic!("Unexpected {:?}", other),
    }
    assert_eq!(cl.state(), ConnectionState::Draining);
    assert_eq!(sim.peek(net_reg(0, NET_CTRL)) & NET_CTRL_REQUESTS, NET_CTRL_CONNECT);
    assert!(cl.last_accounting().is_none());

    // the second attempt finds the buffer empty
    let acc = cl.disconnect().unwrap();
    assert_eq!(acc.frames_sent, 1200);
    assert_eq!(cl.state(), ConnectionState::Closed);
    assert_eq!(sim.peek(net_reg(0, NET_CTRL)) & NET_CTRL_REQUESTS, 0);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn immediate_disconnect_after_drain_timeout() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.set_logging(false);
    sim.add_behaviour(Box::new(NetworkStack::new(0, Duration::ZERO, 1).with_backlog(1000)));
    let (mut cl, name) = client(&sim, 0);
    cl.configure(&ConnectionSettings::new()).unwrap();
    assert!(cl.connect(None).unwrap());
    assert!(cl.disconnect().is_err());
    assert_ne!(sim.peek(net_reg(0, NET_CTRL)) & NET_CTRL_REQUESTS, 0);
    cl.disconnect_immediate().unwrap();
    assert_eq!(cl.state(), ConnectionState::Closed);
    assert_eq!(sim.peek(net_reg(0, NET_CTRL)) & NET_CTRL_REQUESTS, 0);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn failed_connection_is_not_fatal() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    // never connects within the 10 polls
    sim.add_behaviour(Box::new(NetworkStack::new(0, Duration::ZERO, 1000)));
    let (mut cl, name) = client(&sim, 0);
    cl.configure(&ConnectionSettings::new()).unwrap();
    assert!(!cl.connect(None).unwrap());
    assert_eq!(cl.state(), ConnectionState::Configuring);
    ProcessLock::destroy(&name).unwrap();
  }
}
