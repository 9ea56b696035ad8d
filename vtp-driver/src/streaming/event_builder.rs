//! The streaming event builder
//!
//! Builds fixed length frames out of the payload port
//! data and hands them to the network instances. The
//! host can push complete records (e.g. CODA control
//! events) into the same output through a small FIFO.

use std::sync::Arc;

use vtp_dataclasses::clamp_with_warning;
use vtp_dataclasses::constants::{
  FRAME_LEN_MAX,
  FRAME_LEN_MIN,
  FRAME_LEN_TICK_NS,
  N_PAYLOAD_PORTS,
  N_STREAMS,
};
use vtp_dataclasses::errors::VtpError;
use vtp_dataclasses::evio::ControlEvent;
use vtp_lib::settings::EventBuilderSettings;

use crate::device::VtpDevice;
use crate::registers::{
  eb_frame_cnt,
  EB_BOARD_ID,
  EB_CTRL,
  EB_CTRL_HOST_EN,
  EB_CTRL_STREAM_EN,
  EB_FRAME_LEN,
  EB_HOST_FIFO_DATA,
  EB_HOST_FIFO_LEN,
  EB_HOST_FIFO_STATUS,
  EB_HOST_PENDING,
  EB_NSTREAMS,
  EB_PP_MASK,
  EB_PP_STREAM,
};
use crate::wait::BoundedWait;

/// Largest record the host FIFO length register
/// can describe
pub const HOST_RECORD_MAX_WORDS : usize = 0xffff;

/// Frame length in ns to frame ticks. Lengths which
/// are not a multiple of the tick are rounded down,
/// the result is clamped into the supported range.
pub fn frame_len_ticks(frame_len_ns : u32) -> u32 {
  if frame_len_ns % FRAME_LEN_TICK_NS != 0 {
    debug!("Frame length {frame_len_ns} ns is not a multiple of {FRAME_LEN_TICK_NS} ns, rounding down");
  }
  clamp_with_warning("frame length [ticks]",
                     frame_len_ns / FRAME_LEN_TICK_NS,
                     FRAME_LEN_MIN,
                     FRAME_LEN_MAX)
}

/// Pack the stream assignment (1-4) of every payload
/// port into 2 bits, port 1 in the lowest bits
pub fn pack_pp_streams(pp_stream : &[u8]) -> Result<u32, VtpError> {
  if pp_stream.len() != N_PAYLOAD_PORTS {
    return Err(VtpError::ConfigError(format!("Expected a stream for each of the {} payload ports, got {}!",
                                             N_PAYLOAD_PORTS, pp_stream.len())));
  }
  let mut packed = 0u32;
  for (port, stream) in pp_stream.iter().enumerate() {
    let s = clamp_with_warning(&format!("stream of PP{}", port + 1), *stream as u32, 1, N_STREAMS as u32);
    packed |= (s - 1) << (2*port);
  }
  Ok(packed)
}

pub struct EventBuilder {
  dev         : Arc<VtpDevice>,
  inject_wait : BoundedWait,
  n_streams   : u32,
}

impl EventBuilder {
  pub fn new(dev : Arc<VtpDevice>, inject_wait : BoundedWait) -> Result<Self, VtpError> {
    dev.capabilities().require_event_builder()?;
    Ok(Self {
      dev,
      inject_wait,
      n_streams : 1,
    })
  }

  /// Active streams as they have been programmed
  pub fn n_streams(&self) -> u32 {
    self.n_streams
  }

  pub fn configure(&mut self, settings : &EventBuilderSettings) -> Result<(), VtpError> {
    let streams   = pack_pp_streams(&settings.pp_stream)?;
    let ticks     = frame_len_ticks(settings.frame_len_ns);
    let n_streams = clamp_with_warning("number of streams", settings.n_streams as u32, 1, N_STREAMS as u32);
    self.dev.locked(|io| {
      io.write_verify(EB_PP_MASK,   settings.pp_enable_mask as u32, 0xffff)?;
      io.write_verify(EB_PP_STREAM, streams,                        u32::MAX)?;
      io.write_verify(EB_FRAME_LEN, ticks,                          0xffff)?;
      io.write_verify(EB_BOARD_ID,  settings.board_id,              u32::MAX)?;
      io.write_verify(EB_NSTREAMS,  n_streams,                      0x7)
    })?;
    self.n_streams = n_streams;
    info!("Event builder configured, payload ports {:#06x}, frame length {} ticks, {} stream(s)",
          settings.pp_enable_mask, ticks, n_streams);
    Ok(())
  }

  pub fn set_pp_mask(&self, mask : u16) -> Result<(), VtpError> {
    self.dev.write_verify(EB_PP_MASK, mask as u32, 0xffff)
  }

  pub fn set_stream_processing(&self, enable : bool) -> Result<(), VtpError> {
    if enable {
      self.dev.set_bits(EB_CTRL, EB_CTRL_STREAM_EN)?;
    } else {
      self.dev.clear_bits(EB_CTRL, EB_CTRL_STREAM_EN)?;
    }
    Ok(())
  }

  pub fn stream_processing_enabled(&self) -> Result<bool, VtpError> {
    Ok(self.dev.read32(EB_CTRL)? & EB_CTRL_STREAM_EN != 0)
  }

  pub fn set_host_injection(&self, enable : bool) -> Result<(), VtpError> {
    if enable {
      self.dev.set_bits(EB_CTRL, EB_CTRL_HOST_EN)?;
    } else {
      self.dev.clear_bits(EB_CTRL, EB_CTRL_HOST_EN)?;
    }
    Ok(())
  }

  /// Raw (wrapping) frame counter of `stream`
  pub fn frame_count(&self, stream : usize) -> Result<u32, VtpError> {
    if stream >= N_STREAMS {
      return Err(VtpError::ConfigError(format!("There is no stream {stream}")));
    }
    self.dev.read32(eb_frame_cnt(stream))
  }

  /// Push a control event into the output.
  ///
  /// Stream processing is disabled while the record is
  /// in the FIFO, so the control event can not end up
  /// in the middle of a frame. The words go first, the
  /// length write starts the transmission. Afterwards
  /// stream processing is restored to what it was.
  ///
  /// If the record does not leave the FIFO in time,
  /// stream processing stays off and the host path
  /// stays on, the error is returned. Data flow has to
  /// be enabled again explicitly.
  ///
  /// Returns the number of words injected.
  pub fn inject_control_event(&self,
                              event        : &ControlEvent,
                              block_number : u32,
                              roc_id       : u32) -> Result<usize, VtpError> {
    let record = event.to_record(block_number, roc_id);
    self.inject_record(&record)?;
    info!("Injected {:?} event ({} words, block {})", event.event_type, record.len(), block_number);
    Ok(record.len())
  }

  /// Push an arbitrary record through the host FIFO
  pub fn inject_record(&self, record : &[u32]) -> Result<(), VtpError> {
    if record.len() > HOST_RECORD_MAX_WORDS {
      return Err(VtpError::ResourceExhausted {
        what      : String::from("host injection FIFO"),
        requested : record.len(),
        available : HOST_RECORD_MAX_WORDS,
      });
    }
    let was_streaming = self.dev.locked(|io| {
      if io.read32(EB_HOST_FIFO_STATUS)? & EB_HOST_PENDING != 0 {
        return Err(VtpError::InvalidState(String::from("A host record is still pending in the event builder")));
      }
      let ctrl = io.read32(EB_CTRL)?;
      io.write32(EB_CTRL, ctrl & !EB_CTRL_STREAM_EN)?;
      io.write32(EB_CTRL, (ctrl & !EB_CTRL_STREAM_EN) | EB_CTRL_HOST_EN)?;
      for word in record {
        io.write32(EB_HOST_FIFO_DATA, *word)?;
      }
      io.write32(EB_HOST_FIFO_LEN, record.len() as u32)?;
      Ok(ctrl & EB_CTRL_STREAM_EN != 0)
    })?;

    let dev  = &self.dev;
    let sent = self.inject_wait.poll("host record transmission", |_| {
      if dev.read32(EB_HOST_FIFO_STATUS)? & EB_HOST_PENDING == 0 {
        Ok(Some(()))
      } else {
        Ok(None)
      }
    });

    if let Err(err) = sent {
      error!("Host record was not sent, stream processing stays disabled! {err}");
      return Err(err);
    }
    self.dev.locked(|io| {
      let ctrl = io.clear_bits(EB_CTRL, EB_CTRL_HOST_EN)?;
      if was_streaming {
        io.write32(EB_CTRL, ctrl | EB_CTRL_STREAM_EN)?;
      }
      Ok(())
    })
  }
}

#[cfg(test)]
mod test_event_builder {
  use super::*;
  use crate::lock::ProcessLock;
  use crate::profile::FirmwareProfile;
  use crate::sim::{
    unique_lock_name,
    Access,
    HostFifo,
    SimRegisters,
  };

  fn builder(sim : &SimRegisters) -> (Result<EventBuilder, VtpError>, String) {
    let name = unique_lock_name("eb");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = Arc::new(VtpDevice::attach(Box::new(sim.clone()), lock, None).unwrap());
    (EventBuilder::new(dev, BoundedWait::new(10, std::time::Duration::ZERO, None)), name)
  }

  #[test]
  fn frame_length_quantization() {
    assert_eq!(frame_len_ticks(65536), 16384);
    assert_eq!(frame_len_ticks(65539), 16384);
    assert_eq!(frame_len_ticks(100), FRAME_LEN_MIN);
    assert_eq!(frame_len_ticks(u32::MAX), FRAME_LEN_MAX);
  }

  #[test]
  fn stream_assignment_packing() {
    let mut streams = vec![1u8; N_PAYLOAD_PORTS];
    assert_eq!(pack_pp_streams(&streams).unwrap(), 0);
    streams[0]  = 2;
    streams[15] = 4;
    // out of range is clamped
    streams[1]  = 9;
    assert_eq!(pack_pp_streams(&streams).unwrap(), 0b01 | 0b11 << 2 | 0b11 << 30);
    assert!(pack_pp_streams(&streams[..4]).is_err());
  }

  #[test]
  fn configure_writes_all_fields() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    let (eb, name) = builder(&sim);
    let mut eb = eb.unwrap();
    let mut settings = EventBuilderSettings::new();
    settings.pp_enable_mask = 0x00ff;
    settings.n_streams      = 7;
    settings.board_id       = 0x42;
    eb.configure(&settings).unwrap();
    assert_eq!(sim.peek(EB_PP_MASK), 0xff);
    assert_eq!(sim.peek(EB_FRAME_LEN), 16384);
    assert_eq!(sim.peek(EB_BOARD_ID), 0x42);
    assert_eq!(sim.peek(EB_NSTREAMS), 4);
    assert_eq!(eb.n_streams(), 4);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn no_event_builder_in_roc_firmware() {
    let sim = SimRegisters::board(FirmwareProfile::HardwareRoc, 1);
    let (eb, name) = builder(&sim);
    assert!(matches!(eb, Err(VtpError::NotSupported(_))));
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn injection_pauses_stream_processing() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.add_behaviour(Box::new(HostFifo::new(3)));
    let (eb, name) = builder(&sim);
    let eb = eb.unwrap();
    eb.set_stream_processing(true).unwrap();
    sim.clear_log();

    let n = eb.inject_control_event(&ControlEvent::go(0), 7, 1).unwrap();
    let log = sim.log();
    let writes : Vec<&Access> = log.iter().filter(|a| a.is_write()).collect();
    // stream processing goes off before the first data word
    assert_eq!(writes[0].offset(), EB_CTRL);
    assert_eq!(writes[0].value() & EB_CTRL_STREAM_EN, 0);
    let data : Vec<&&Access> = writes.iter().filter(|a| a.offset() == EB_HOST_FIFO_DATA).collect();
    assert_eq!(data.len(), n);
    let len_pos  = writes.iter().position(|a| a.offset() == EB_HOST_FIFO_LEN).unwrap();
    let last_dat = writes.iter().rposition(|a| a.offset() == EB_HOST_FIFO_DATA).unwrap();
    assert!(len_pos > last_dat);
    assert_eq!(writes[len_pos].value() as usize, n);
    // and comes back once the record is gone
    assert_eq!(sim.peek(EB_CTRL), EB_CTRL_STREAM_EN);
    assert_eq!(sim.peek(EB_HOST_FIFO_STATUS), 0);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn stuck_injection_keeps_streaming_off() {
    let sim = SimRegisters::board(FirmwareProfile::Streaming, 1);
    sim.add_behaviour(Box::new(HostFifo::new(1000)));
    let (eb, name) = builder(&sim);
    let eb = eb.unwrap();
    eb.set_stream_processing(true).unwrap();
    let res = eb.inject_control_event(&ControlEvent::end(5), 9, 1);
    assert!(matches!(res, Err(VtpError::Timeout { .. })));
    assert_eq!(sim.peek(EB_CTRL) & EB_CTRL_STREAM_EN, 0);
    assert_eq!(sim.peek(EB_CTRL) & EB_CTRL_HOST_EN, EB_CTRL_HOST_EN);
    assert!(!eb.stream_processing_enabled().unwrap());

    // nothing goes on top of the pending record
    sim.clear_log();
    let res = eb.inject_control_event(&ControlEvent::end(5), 10, 1);
    assert!(matches!(res, Err(VtpError::InvalidState(_))));
    assert!(sim.writes_to(EB_HOST_FIFO_DATA).is_empty());
    assert!(sim.writes_to(EB_HOST_FIFO_LEN).is_empty());
    ProcessLock::destroy(&name).unwrap();
  }
}
