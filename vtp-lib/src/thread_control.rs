//! Thread control structures
//!
//! The driver is a single process which mostly polls
//! synchronously. The only concurrent piece is the
//! status sender, which is coordinated with the main
//! control flow through this struct, shared as
//! Arc<Mutex<ThreadControl>>.

use std::fmt;

/// Send runtime information
/// to threads via shared memory
/// (Arc(Mutex)
#[derive(Default, Debug)]
pub struct ThreadControl {
  /// Stop ALL threads
  pub stop_flag                    : bool,
  /// alive indicator for the status sender thread
  pub thread_status_sender_active  : bool,
  /// The current run number
  pub run_number                   : u32,
  /// Datagrams sent since the thread started
  pub n_status_sent                : u64,
  /// Last (64bit extended) frame number reported
  pub last_frame_number            : u64,
}

impl ThreadControl {
  pub fn new() -> Self {
    Self {
      stop_flag                   : false,
      thread_status_sender_active : false,
      run_number                  : 0,
      n_status_sent               : 0,
      last_frame_number           : 0,
    }
  }
}

impl fmt::Display for ThreadControl {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<ThreadControl:");
    repr        += &(format!("\n  Run number     : {}", self.run_number));
    repr        += "\n    -- program status:";
    repr        += &(format!("\n  stop flag      : {}", self.stop_flag));
    repr        += "\n    -- reported thread activity:";
    repr        += &(format!("\n  status sender  : {}", self.thread_status_sender_active));
    repr        += &(format!("\n  -- sent        : {}", self.n_status_sent));
    repr        += &(format!("\n  -- last frame  : {}>", self.last_frame_number));
    write!(f, "{}", repr)
  }
}
