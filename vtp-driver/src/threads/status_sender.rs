//! The 1Hz status/sync sender
//!
//! Samples the frame counter of stream 0 and the ROC
//! trigger counter, and sends both as a small UDP
//! datagram to the downstream aggregator.

use std::net::UdpSocket;
use std::sync::{
  Arc,
  Mutex,
};
use std::thread::sleep;
use std::time::{
  Duration,
  Instant,
};

use vtp_dataclasses::errors::VtpError;
use vtp_dataclasses::serialization::Serialization;
use vtp_dataclasses::status::StatusDatagram;
use vtp_lib::settings::StatusSettings;
use vtp_lib::thread_control::ThreadControl;

use crate::device::VtpDevice;
use crate::registers::{
  eb_frame_cnt,
  ROC_TRIG_CNT,
};
use crate::streaming::FrameCounter;

/// The stop flag is checked at least this often
const STOP_CHECK_INTERVAL : Duration = Duration::from_millis(100);

/// Events per second from a counter increment
pub fn rate_hz(delta : u64, elapsed : Duration) -> u32 {
  let secs = elapsed.as_secs_f64();
  if secs <= 0.0 {
    return 0;
  }
  (delta as f64 / secs).round().min(u32::MAX as f64) as u32
}

/// Keeps the state needed to turn the raw hardware
/// counters into a frame number and a rate
pub struct StatusSampler {
  dev           : Arc<VtpDevice>,
  frames        : FrameCounter,
  triggers      : FrameCounter,
  last_triggers : Option<(u64, Instant)>,
}

impl StatusSampler {
  pub fn new(dev : Arc<VtpDevice>) -> Self {
    Self {
      dev,
      frames        : FrameCounter::new(),
      triggers      : FrameCounter::new(),
      last_triggers : None,
    }
  }

  /// 64bit frame number of stream 0 and the trigger
  /// rate since the last call. Whatever the firmware
  /// does not have reads as 0.
  pub fn sample(&mut self) -> Result<(u64, u32), VtpError> {
    let caps = self.dev.capabilities();
    let mut frame_number = 0u64;
    if caps.event_builder {
      frame_number = self.frames.update(self.dev.read32(eb_frame_cnt(0))?);
    }
    let mut rate = 0u32;
    if caps.hardware_roc {
      let now      = Instant::now();
      let triggers = self.triggers.update(self.dev.read32(ROC_TRIG_CNT)?);
      if let Some((last, then)) = self.last_triggers {
        rate = rate_hz(triggers.saturating_sub(last), now.duration_since(then));
      }
      self.last_triggers = Some((triggers, now));
    }
    Ok((frame_number, rate))
  }
}

/// Send a status datagram every interval until the
/// stop flag is set
///
/// # Arguments
///
/// * dev            - the board
/// * settings       - destination, interval and
///                    datagram source id/version
/// * thread_control - stop flag, counters for
///                    the main thread
pub fn status_sender(dev            : Arc<VtpDevice>,
                     settings       : StatusSettings,
                     thread_control : Arc<Mutex<ThreadControl>>) {
  let destination = format!("{}:{}", settings.host, settings.port);
  let socket = match UdpSocket::bind("0.0.0.0:0") {
    Err(err) => {
      error!("Unable to bind udp socket for the status sender! {err}");
      return;
    }
    Ok(s) => s,
  };
  if let Err(err) = socket.connect(&destination) {
    error!("Unable to connect status sender to {destination}! {err}");
    return;
  }
  info!("Sending status datagrams to {} every {} ms", destination, settings.interval_ms);
  match thread_control.lock() {
    Err(err)   => error!("Unable to lock shared memory! {err}"),
    Ok(mut tc) => tc.thread_status_sender_active = true,
  }

  let interval    = Duration::from_millis(settings.interval_ms);
  let nap         = interval.min(STOP_CHECK_INTERVAL);
  let mut sampler = StatusSampler::new(dev);
  // the first one goes out right away
  let mut last_sent : Option<Instant> = None;
  'main: loop {
    if last_sent.map_or(true, |t| t.elapsed() >= interval) {
      last_sent = Some(Instant::now());
      match sampler.sample() {
        Err(err) => error!("Unable to sample the counters! {err}"),
        Ok((frame_number, rate)) => {
          let mut dg = StatusDatagram::now(settings.source_id, frame_number, rate);
          dg.version = settings.version;
          match socket.send(&dg.to_bytestream()) {
            Err(err) => error!("Unable to send status datagram! {err}"),
            Ok(_)    => {
              trace!("Sent status, frame {} rate {} Hz", frame_number, rate);
              match thread_control.lock() {
                Err(err)   => error!("Unable to lock shared memory! {err}"),
                Ok(mut tc) => {
                  tc.n_status_sent    += 1;
                  tc.last_frame_number = frame_number;
                }
              }
            }
          }
        }
      }
    }
    sleep(nap);
    match thread_control.lock() {
      Err(err) => error!("Unable to lock shared memory! {err}"),
      Ok(tc)   => {
        if tc.stop_flag {
          info!("Stopping status sender thread, stop signal received!");
          break 'main;
        }
      }
    }
  }
  match thread_control.lock() {
    Err(err)   => error!("Unable to lock shared memory! {err}"),
    Ok(mut tc) => tc.thread_status_sender_active = false,
  }
}

#[cfg(test)]
mod test_status_sender {
  use super::*;
  use std::thread;
  use crate::lock::ProcessLock;
  use crate::profile::FirmwareProfile;
  use crate::sim::{
    unique_lock_name,
    FreeRunningCounters,
    SimRegisters,
  };

  fn device(profile : FirmwareProfile) -> (Arc<VtpDevice>, SimRegisters, String) {
    let sim  = SimRegisters::board(profile, 3);
    sim.set_logging(false);
    sim.add_behaviour(Box::new(FreeRunningCounters::new(1000, 25)));
    let name = unique_lock_name("status");
    let lock = ProcessLock::open(&name).unwrap();
    let dev  = Arc::new(VtpDevice::attach(Box::new(sim.clone()), lock, None).unwrap());
    (dev, sim, name)
  }

  #[test]
  fn rates() {
    assert_eq!(rate_hz(100, Duration::from_secs(1)), 100);
    assert_eq!(rate_hz(100, Duration::from_millis(500)), 200);
    assert_eq!(rate_hz(100, Duration::ZERO), 0);
  }

  #[test]
  fn sampler_extends_the_frame_counter() {
    let (dev, sim, name) = device(FirmwareProfile::StreamingRoc);
    sim.poke(eb_frame_cnt(0), u32::MAX - 1500);
    let mut sampler = StatusSampler::new(dev);
    let (first, rate) = sampler.sample().unwrap();
    assert_eq!(first, (u32::MAX - 500) as u64);
    // no previous sample, no rate yet
    assert_eq!(rate, 0);
    let (second, _) = sampler.sample().unwrap();
    assert_eq!(second, first + 1000);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn datagrams_arrive_until_stopped() {
    let (dev, _sim, name) = device(FirmwareProfile::StreamingRoc);
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut settings = StatusSettings::new();
    settings.host        = String::from("127.0.0.1");
    settings.port        = receiver.local_addr().unwrap().port();
    settings.interval_ms = 20;
    settings.source_id   = 0x77;

    let tc     = Arc::new(Mutex::new(ThreadControl::new()));
    let tc_thr = tc.clone();
    let handle = thread::spawn(move || status_sender(dev, settings, tc_thr));

    let mut buf = [0u8; 64];
    let mut last_frame = 0u64;
    for _ in 0..3 {
      let n = receiver.recv(&mut buf).unwrap();
      assert_eq!(n, StatusDatagram::SIZE);
      let mut pos = 0usize;
      let dg = StatusDatagram::from_bytestream(&buf[..n], &mut pos).unwrap();
      assert_eq!(dg.source_id, 0x77);
      assert!(dg.frame_number > last_frame);
      last_frame = dg.frame_number;
    }
    tc.lock().unwrap().stop_flag = true;
    handle.join().unwrap();
    let tc = tc.lock().unwrap();
    assert!(tc.n_status_sent >= 3);
    assert!(!tc.thread_status_sender_active);
    ProcessLock::destroy(&name).unwrap();
  }
}
