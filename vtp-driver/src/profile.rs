//! Firmware profiles
//!
//! The same board is loaded with different firmware
//! depending on its role in the crate. Each firmware
//! owns only a part of the register window. Which part
//! is decided once, when a subsystem is set up, not on
//! every register access.

use std::fmt;

use vtp_dataclasses::constants::N_STREAMS;
use vtp_dataclasses::errors::VtpError;

/// All 20 serdes lanes
pub const ALL_LANES : u32 = 0x000f_ffff;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FirmwareProfile {
  /// Streaming readout, frames go out over the
  /// FPGA network stack
  Streaming,
  /// Triggered readout through the hardware ROC
  HardwareRoc,
  /// Hardware ROC with its records sent over
  /// the streaming network stack
  StreamingRoc,
  /// Trigger processing only, no data path
  Trigger,
}

impl FirmwareProfile {
  /// Decode the FW_TYPE register
  pub fn from_fw_type(fw_type : u32) -> Option<Self> {
    match fw_type & 0xff {
      0x01 => Some(FirmwareProfile::Streaming),
      0x02 => Some(FirmwareProfile::HardwareRoc),
      0x03 => Some(FirmwareProfile::StreamingRoc),
      0x10 => Some(FirmwareProfile::Trigger),
      _    => None,
    }
  }

  pub fn fw_type(&self) -> u32 {
    match self {
      FirmwareProfile::Streaming    => 0x01,
      FirmwareProfile::HardwareRoc  => 0x02,
      FirmwareProfile::StreamingRoc => 0x03,
      FirmwareProfile::Trigger      => 0x10,
    }
  }

  /// Parse the name used in the settings file
  pub fn from_name(name : &str) -> Result<Self, VtpError> {
    match name.to_lowercase().as_str() {
      "streaming"    => Ok(FirmwareProfile::Streaming),
      "hardwareroc"  => Ok(FirmwareProfile::HardwareRoc),
      "streamingroc" => Ok(FirmwareProfile::StreamingRoc),
      "trigger"      => Ok(FirmwareProfile::Trigger),
      _ => Err(VtpError::ConfigError(format!("Unknown firmware profile {name}"))),
    }
  }

  pub fn capabilities(&self) -> Capabilities {
    match self {
      FirmwareProfile::Streaming => Capabilities {
        dma                 : true,
        serdes_lanes        : ALL_LANES,
        streaming_instances : N_STREAMS,
        event_builder       : true,
        hardware_roc        : false,
      },
      FirmwareProfile::HardwareRoc => Capabilities {
        dma                 : true,
        serdes_lanes        : ALL_LANES,
        streaming_instances : 1,
        event_builder       : false,
        hardware_roc        : true,
      },
      FirmwareProfile::StreamingRoc => Capabilities {
        dma                 : true,
        serdes_lanes        : ALL_LANES,
        streaming_instances : N_STREAMS,
        event_builder       : true,
        hardware_roc        : true,
      },
      FirmwareProfile::Trigger => Capabilities {
        dma                 : true,
        serdes_lanes        : ALL_LANES,
        streaming_instances : 0,
        event_builder       : false,
        hardware_roc        : false,
      },
    }
  }
}

impl fmt::Display for FirmwareProfile {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      FirmwareProfile::Streaming    => "Streaming",
      FirmwareProfile::HardwareRoc  => "HardwareRoc",
      FirmwareProfile::StreamingRoc => "StreamingRoc",
      FirmwareProfile::Trigger      => "Trigger",
    };
    write!(f, "<FirmwareProfile: {}>", repr)
  }
}

/// The register blocks a firmware profile owns
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Capabilities {
  pub dma                 : bool,
  /// Lanes which are routed in this firmware
  pub serdes_lanes        : u32,
  /// Number of network client/server instances
  pub streaming_instances : usize,
  pub event_builder       : bool,
  pub hardware_roc        : bool,
}

impl Capabilities {
  pub fn require_dma(&self) -> Result<(), VtpError> {
    Self::require(self.dma, "DMA engine")
  }

  pub fn require_event_builder(&self) -> Result<(), VtpError> {
    Self::require(self.event_builder, "streaming event builder")
  }

  pub fn require_hardware_roc(&self) -> Result<(), VtpError> {
    Self::require(self.hardware_roc, "hardware ROC")
  }

  pub fn require_streaming_instance(&self, inst : usize) -> Result<(), VtpError> {
    Self::require(inst < self.streaming_instances, &format!("network instance {inst}"))
  }

  fn require(cond : bool, what : &str) -> Result<(), VtpError> {
    if cond {
      Ok(())
    } else {
      Err(VtpError::NotSupported(format!("The loaded firmware has no {what}")))
    }
  }
}

impl fmt::Display for Capabilities {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<Capabilities:");
    repr += &(format!("\n  DMA                 : {}", self.dma));
    repr += &(format!("\n  serdes lanes        : {:#07x}", self.serdes_lanes));
    repr += &(format!("\n  network instances   : {}", self.streaming_instances));
    repr += &(format!("\n  event builder       : {}", self.event_builder));
    repr += &(format!("\n  hardware ROC        : {}>", self.hardware_roc));
    write!(f, "{}", repr)
  }
}

#[cfg(test)]
mod test_profile {
  use super::*;

  #[test]
  fn fw_type_decoding() {
    for p in [FirmwareProfile::Streaming,
              FirmwareProfile::HardwareRoc,
              FirmwareProfile::StreamingRoc,
              FirmwareProfile::Trigger] {
      assert_eq!(FirmwareProfile::from_fw_type(p.fw_type()), Some(p));
    }
    assert_eq!(FirmwareProfile::from_fw_type(0x7f), None);
  }

  #[test]
  fn trigger_firmware_has_no_data_path() {
    let caps = FirmwareProfile::Trigger.capabilities();
    assert!(matches!(caps.require_event_builder(), Err(VtpError::NotSupported(_))));
    assert!(matches!(caps.require_hardware_roc(), Err(VtpError::NotSupported(_))));
    assert!(caps.require_streaming_instance(0).is_err());
    assert!(caps.require_dma().is_ok());
  }

  #[test]
  fn names_from_settings() {
    assert_eq!(FirmwareProfile::from_name("StreamingRoc").unwrap(), FirmwareProfile::StreamingRoc);
    assert!(FirmwareProfile::from_name("drs4").is_err());
  }
}
