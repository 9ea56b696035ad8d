//! Bounded polling
//!
//! Nothing on the board raises an interrupt, every
//! "wait" is a polling loop. A loop gives up after
//! a maximum number of attempts or, if set, after
//! a wall clock limit, whichever comes first. There
//! is no other way to cancel a wait.

use std::fmt;
use std::thread;
use std::time::{
  Duration,
  Instant,
};

use vtp_dataclasses::errors::VtpError;
use vtp_lib::settings::WaitSettings;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BoundedWait {
  pub max_attempts : u32,
  /// Sleep between two polls, zero means busy polling
  pub backoff      : Duration,
  pub timeout      : Option<Duration>,
}

impl BoundedWait {
  pub fn new(max_attempts : u32,
             backoff      : Duration,
             timeout      : Option<Duration>) -> Self {
    Self {
      max_attempts,
      backoff,
      timeout,
    }
  }

  /// DMA completion, ~10^6 busy polls
  pub fn dma() -> Self {
    Self::new(1_000_000, Duration::ZERO, None)
  }

  /// Serdes bring up, 10 passes
  pub fn link_check() -> Self {
    Self::new(10, Duration::from_millis(100), None)
  }

  /// Network connection, ~20s
  pub fn connect() -> Self {
    Self::new(200, Duration::from_millis(100), Some(Duration::from_secs(20)))
  }

  pub fn drain() -> Self {
    Self::new(1000, Duration::from_millis(1), Some(Duration::from_secs(5)))
  }

  /// Host injection and async FIFO space
  pub fn fifo() -> Self {
    Self::new(1000, Duration::from_millis(1), None)
  }

  pub fn lock_health() -> Self {
    Self::new(10, Duration::from_millis(100), None)
  }

  /// Poll until `probe` yields a value.
  ///
  /// `probe` gets the (1-based) attempt number. Errors
  /// of the probe end the wait immediately, exhaustion
  /// is reported as `VtpError::Timeout`.
  pub fn poll<T, F>(&self, what : &str, mut probe : F) -> Result<T, VtpError>
    where F : FnMut(u32) -> Result<Option<T>, VtpError> {
    let start = Instant::now();
    let mut attempt = 0u32;
    while attempt < self.max_attempts {
      attempt += 1;
      if let Some(value) = probe(attempt)? {
        trace!("{what} ready after {attempt} attempts");
        return Ok(value);
      }
      if let Some(limit) = self.timeout {
        if start.elapsed() >= limit {
          break;
        }
      }
      if !self.backoff.is_zero() && attempt < self.max_attempts {
        thread::sleep(self.backoff);
      }
    }
    Err(VtpError::Timeout {
      what     : String::from(what),
      attempts : attempt,
    })
  }
}

impl From<&WaitSettings> for BoundedWait {
  fn from(ws : &WaitSettings) -> Self {
    let timeout = match ws.timeout_ms {
      0 => None,
      t => Some(Duration::from_millis(t)),
    };
    Self::new(ws.max_attempts, Duration::from_millis(ws.backoff_ms), timeout)
  }
}

impl fmt::Display for BoundedWait {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let timeout = match self.timeout {
      None    => String::from("none"),
      Some(t) => format!("{:?}", t),
    };
    write!(f, "<BoundedWait: {} attempts, backoff {:?}, timeout {}>",
           self.max_attempts, self.backoff, timeout)
  }
}
