//! The board lock
//!
//! Every process which touches the register window
//! (the driver, debug-registers, test programs) has to
//! hold one and the same lock while doing so. The
//! firmware does not cope with interleaved partial
//! updates of multi register transactions.
//!
//! The lock is a robust, process shared pthread mutex
//! which lives in a small named segment in /dev/shm.
//! The segment is created by the first process which
//! opens it and persists afterwards, closing the lock
//! only decrements the open count. Removing it is an
//! explicit operation (`ProcessLock::destroy`).
//!
//! If a holder dies while holding the lock, the next
//! acquirer is told so and the lock is made consistent
//! again, see `LockOutcome`.

extern crate libc;
extern crate memmap;

use std::fmt;
use std::fs::{
  self,
  OpenOptions,
};
use std::io::ErrorKind;
use std::mem::size_of;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{
  AtomicU32,
  Ordering,
};
use std::thread;
use std::time::Duration;

use memmap::MmapMut;

use vtp_dataclasses::errors::VtpError;

use crate::wait::BoundedWait;

/// Directory the named segments live in
pub const SHM_DIR : &str = "/dev/shm";
/// "VTPL"
pub const LOCK_MAGIC : u32 = 0x5654504c;

/// The layout of the shared segment. Its size is
/// the declared size every attaching build checks.
#[repr(C)]
struct LockSegment {
  magic       : u32,
  layout_size : u32,
  ready       : AtomicU32,
  open_count  : AtomicU32,
  mutex       : libc::pthread_mutex_t,
}

pub const LOCK_SEGMENT_SIZE : usize = size_of::<LockSegment>();

/// The result of an acquisition attempt
pub enum LockOutcome<'a> {
  Acquired(LockGuard<'a>),
  /// The previous holder died while holding the
  /// lock. The lock has been made consistent, but
  /// the registers might have been left half way
  /// through a transaction.
  RecoveredFromDeadOwner(LockGuard<'a>),
  Busy,
  Unrecoverable,
}

impl<'a> LockOutcome<'a> {
  pub fn is_acquired(&self) -> bool {
    matches!(self, LockOutcome::Acquired(_) | LockOutcome::RecoveredFromDeadOwner(_))
  }
}

impl<'a> fmt::Display for LockOutcome<'a> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      LockOutcome::Acquired(_)               => "Acquired",
      LockOutcome::RecoveredFromDeadOwner(_) => "RecoveredFromDeadOwner",
      LockOutcome::Busy                      => "Busy",
      LockOutcome::Unrecoverable             => "Unrecoverable",
    };
    write!(f, "<LockOutcome: {}>", repr)
  }
}

/// What the health check had to do
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockHealth {
  /// The lock was free
  Free,
  RecoveredFromDeadOwner,
  /// The lock was busy, but became free
  /// within the bounded wait
  HolderReleased,
  /// Last resort, the mutex has been initialized
  /// anew while (supposedly) being held
  Reinitialized,
}

impl fmt::Display for LockHealth {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      LockHealth::Free                   => "Free",
      LockHealth::RecoveredFromDeadOwner => "RecoveredFromDeadOwner",
      LockHealth::HolderReleased         => "HolderReleased",
      LockHealth::Reinitialized          => "Reinitialized",
    };
    write!(f, "<LockHealth: {}>", repr)
  }
}

/// Releases the lock when going out of scope
pub struct LockGuard<'a> {
  lock : &'a ProcessLock,
}

impl<'a> Drop for LockGuard<'a> {
  fn drop(&mut self) {
    let rc = unsafe { libc::pthread_mutex_unlock(self.lock.mutex()) };
    if rc != 0 {
      warn!("Unable to release lock {}! errno {}", self.lock.name, rc);
    }
  }
}

/// Path of the segment for lock `name`
pub fn segment_path(name : &str) -> PathBuf {
  PathBuf::from(SHM_DIR).join(name)
}

/// Set up a robust, process shared mutex at `mutex`
fn init_mutex(mutex : *mut libc::pthread_mutex_t, name : &str) -> Result<(), VtpError> {
  unsafe {
    let mut attr : libc::pthread_mutexattr_t = std::mem::zeroed();
    if libc::pthread_mutexattr_init(&mut attr) != 0 {
      return Err(VtpError::LockUnrecoverable);
    }
    let mut rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if rc == 0 {
      rc = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
    }
    if rc == 0 {
      rc = libc::pthread_mutex_init(mutex, &attr);
    }
    libc::pthread_mutexattr_destroy(&mut attr);
    if rc != 0 {
      error!("Unable to initialize the mutex of lock {}! errno {}", name, rc);
      return Err(VtpError::LockUnrecoverable);
    }
  }
  Ok(())
}

/// A handle to the named board lock
pub struct ProcessLock {
  name    : String,
  _mmap   : MmapMut,
  segment : *mut LockSegment,
}

// The segment is shared memory which is only accessed
// through atomics and the pthread api.
unsafe impl Send for ProcessLock {}
unsafe impl Sync for ProcessLock {}

impl ProcessLock {

  /// Create the lock segment, or attach to it
  /// if it exists already.
  ///
  /// Fails with VersionMismatch if the existing
  /// segment was created with a different layout.
  pub fn open(name : &str) -> Result<Self, VtpError> {
    let path = segment_path(name);
    let (file, created) = match OpenOptions::new()
      .read(true)
      .write(true)
      .create_new(true)
      .open(&path) {
      Ok(f) => (f, true),
      Err(err) if err.kind() == ErrorKind::AlreadyExists => {
        let f = OpenOptions::new()
          .read(true)
          .write(true)
          .open(&path)
          .map_err(|err| VtpError::HardwareUnavailable(format!("Can not attach to lock {}! {}", path.display(), err)))?;
        (f, false)
      }
      Err(err) => {
        return Err(VtpError::HardwareUnavailable(format!("Can not create lock {}! {}", path.display(), err)));
      }
    };

    if created {
      file.set_len(LOCK_SEGMENT_SIZE as u64)
        .map_err(|err| VtpError::HardwareUnavailable(format!("Can not size lock segment! {err}")))?;
      // other users of the board might run under a different uid
      if let Err(err) = fs::set_permissions(&path, fs::Permissions::from_mode(0o666)) {
        warn!("Unable to set permissions of {}! {}", path.display(), err);
      }
    } else {
      // the creator might not have sized the segment yet
      let found = BoundedWait::new(1000, Duration::from_millis(1), None)
        .poll("lock segment size", |_| {
          let len = file.metadata()
            .map_err(|err| VtpError::HardwareUnavailable(format!("Can not stat lock segment! {err}")))?
            .len() as usize;
          Ok(if len == 0 { None } else { Some(len) })
        })
        .unwrap_or(0);
      if found != LOCK_SEGMENT_SIZE {
        error!("Lock segment {} has size {}, expected {}!", path.display(), found, LOCK_SEGMENT_SIZE);
        return Err(VtpError::VersionMismatch {
          expected : LOCK_SEGMENT_SIZE,
          found,
        });
      }
    }

    let mut mmap = unsafe {
      memmap::MmapOptions::new()
        .len(LOCK_SEGMENT_SIZE)
        .map_mut(&file)
    }.map_err(|err| VtpError::HardwareUnavailable(format!("Failed to mmap lock segment! {err}")))?;
    let segment = mmap.as_mut_ptr() as *mut LockSegment;

    if created {
      init_mutex(unsafe { ptr::addr_of_mut!((*segment).mutex) }, name)?;
      unsafe {
        (*segment).magic       = LOCK_MAGIC;
        (*segment).layout_size = LOCK_SEGMENT_SIZE as u32;
        (*segment).ready.store(1, Ordering::Release);
      }
      info!("Created lock segment {}", path.display());
    } else {
      let ready = BoundedWait::new(1000, Duration::from_millis(1), None)
        .poll("lock segment init", |_| {
          let flag = unsafe { (*segment).ready.load(Ordering::Acquire) };
          Ok(if flag == 1 { Some(()) } else { None })
        });
      if ready.is_err() {
        error!("Lock segment {} never got initialized!", path.display());
        return Err(VtpError::LockUnrecoverable);
      }
      let (magic, layout_size) = unsafe { ((*segment).magic, (*segment).layout_size) };
      if magic != LOCK_MAGIC || layout_size as usize != LOCK_SEGMENT_SIZE {
        error!("Lock segment {} has magic {:#x} and layout size {}!", path.display(), magic, layout_size);
        return Err(VtpError::VersionMismatch {
          expected : LOCK_SEGMENT_SIZE,
          found    : layout_size as usize,
        });
      }
      debug!("Attached to lock segment {}", path.display());
    }
    let lock = Self {
      name  : String::from(name),
      _mmap : mmap,
      segment,
    };
    lock.seg().open_count.fetch_add(1, Ordering::AcqRel);
    Ok(lock)
  }

  /// Remove the lock segment. Handles which are
  /// still open keep their mapping, later opens
  /// create a new segment.
  pub fn destroy(name : &str) -> Result<(), VtpError> {
    let path = segment_path(name);
    match fs::remove_file(&path) {
      Ok(_) => {
        info!("Destroyed lock segment {}", path.display());
        Ok(())
      }
      Err(err) if err.kind() == ErrorKind::NotFound => {
        warn!("Lock segment {} does not exist!", path.display());
        Ok(())
      }
      Err(err) => Err(VtpError::HardwareUnavailable(format!("Can not remove {}! {}", path.display(), err))),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Number of handles currently open on the segment
  pub fn open_count(&self) -> u32 {
    self.seg().open_count.load(Ordering::Acquire)
  }

  fn seg(&self) -> &LockSegment {
    unsafe { &*self.segment }
  }

  fn mutex(&self) -> *mut libc::pthread_mutex_t {
    unsafe { ptr::addr_of_mut!((*self.segment).mutex) }
  }

  /// Translate a pthread return code
  fn outcome(&self, rc : i32) -> LockOutcome<'_> {
    match rc {
      0 => LockOutcome::Acquired(LockGuard { lock : self }),
      libc::EOWNERDEAD => {
        warn!("Previous holder of lock {} died while holding it!", self.name);
        let rc = unsafe { libc::pthread_mutex_consistent(self.mutex()) };
        if rc != 0 {
          error!("Can not make lock {} consistent! errno {}", self.name, rc);
          unsafe { libc::pthread_mutex_unlock(self.mutex()); }
          return LockOutcome::Unrecoverable;
        }
        LockOutcome::RecoveredFromDeadOwner(LockGuard { lock : self })
      }
      libc::EBUSY | libc::ETIMEDOUT => LockOutcome::Busy,
      libc::ENOTRECOVERABLE => {
        error!("Lock {} is not recoverable!", self.name);
        LockOutcome::Unrecoverable
      }
      _ => {
        error!("Unexpected return code {} when acquiring lock {}!", rc, self.name);
        LockOutcome::Unrecoverable
      }
    }
  }

  /// Block until the lock is ours
  pub fn lock(&self) -> LockOutcome<'_> {
    let rc = unsafe { libc::pthread_mutex_lock(self.mutex()) };
    self.outcome(rc)
  }

  pub fn try_lock(&self) -> LockOutcome<'_> {
    let rc = unsafe { libc::pthread_mutex_trylock(self.mutex()) };
    self.outcome(rc)
  }

  /// Wait at max `timeout` for the lock
  pub fn lock_timeout(&self, timeout : Duration) -> LockOutcome<'_> {
    let mut deadline = libc::timespec { tv_sec : 0, tv_nsec : 0 };
    unsafe {
      libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline);
    }
    let nanos = deadline.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    deadline.tv_sec  += (timeout.as_secs() + nanos / 1_000_000_000) as libc::time_t;
    deadline.tv_nsec  = (nanos % 1_000_000_000) as libc::c_long;
    let rc = unsafe { libc::pthread_mutex_timedlock(self.mutex(), &deadline) };
    self.outcome(rc)
  }

  /// Blocking acquire for register access. A dead
  /// owner is logged and accepted, an unrecoverable
  /// lock is handed to the caller.
  pub fn acquire(&self) -> Result<LockGuard<'_>, VtpError> {
    match self.lock() {
      LockOutcome::Acquired(guard) => Ok(guard),
      LockOutcome::RecoveredFromDeadOwner(guard) => {
        warn!("Register state might be inconsistent after recovering lock {}", self.name);
        Ok(guard)
      }
      LockOutcome::Busy => {
        Err(VtpError::Timeout {
          what     : format!("lock {}", self.name),
          attempts : 1,
        })
      }
      LockOutcome::Unrecoverable => Err(VtpError::LockUnrecoverable),
    }
  }

  /// Make sure the lock is usable.
  ///
  /// * try to acquire
  /// * if busy, try to release it as a foreign holder
  /// * wait for it within `wait`
  /// * if still busy, initialize the mutex anew
  pub fn health_check(&self, wait : &BoundedWait) -> Result<LockHealth, VtpError> {
    match self.try_lock() {
      LockOutcome::Acquired(_) => {
        debug!("Lock {} is healthy", self.name);
        return Ok(LockHealth::Free);
      }
      LockOutcome::RecoveredFromDeadOwner(_) => {
        return Ok(LockHealth::RecoveredFromDeadOwner);
      }
      LockOutcome::Unrecoverable => {
        return self.reinitialize();
      }
      LockOutcome::Busy => (),
    }
    warn!("Lock {} is busy, attempting to release it", self.name);
    let rc = unsafe { libc::pthread_mutex_unlock(self.mutex()) };
    if rc != 0 {
      debug!("Foreign release of lock {} refused, errno {}", self.name, rc);
    }
    let waited = wait.poll("lock health", |_| {
      match self.try_lock() {
        LockOutcome::Acquired(_)               => Ok(Some(LockHealth::HolderReleased)),
        LockOutcome::RecoveredFromDeadOwner(_) => Ok(Some(LockHealth::RecoveredFromDeadOwner)),
        LockOutcome::Busy                      => Ok(None),
        LockOutcome::Unrecoverable             => Err(VtpError::LockUnrecoverable),
      }
    });
    match waited {
      Ok(health) => Ok(health),
      Err(VtpError::Timeout { attempts, .. }) => {
        error!("Lock {} still busy after {} attempts!", self.name, attempts);
        self.reinitialize()
      }
      Err(_) => self.reinitialize(),
    }
  }

  fn reinitialize(&self) -> Result<LockHealth, VtpError> {
    error!("Re-initializing lock {} as a last resort!", self.name);
    init_mutex(self.mutex(), &self.name)?;
    // give a concurrent waiter the chance to notice
    thread::yield_now();
    Ok(LockHealth::Reinitialized)
  }
}

impl Drop for ProcessLock {
  fn drop(&mut self) {
    let before = self.seg().open_count.fetch_sub(1, Ordering::AcqRel);
    debug!("Closed lock {}, {} handles remain", self.name, before.saturating_sub(1));
  }
}

impl fmt::Display for ProcessLock {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<ProcessLock: {} ({} open handles)>", self.name, self.open_count())
  }
}

#[cfg(test)]
mod test_lock {
  use super::*;
  use std::mem;
  use std::sync::Arc;
  use std::sync::atomic::AtomicUsize;
  use std::sync::mpsc;

  static COUNTER : AtomicUsize = AtomicUsize::new(0);

  fn unique_name(what : &str) -> String {
    format!("vtp-test-{}-{}-{}", what, std::process::id(), COUNTER.fetch_add(1, Ordering::SeqCst))
  }

  #[test]
  fn open_creates_then_attaches() {
    let name   = unique_name("attach");
    let first  = ProcessLock::open(&name).unwrap();
    assert_eq!(first.open_count(), 1);
    let second = ProcessLock::open(&name).unwrap();
    assert_eq!(first.open_count(), 2);
    drop(second);
    assert_eq!(first.open_count(), 1);
    drop(first);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn close_does_not_destroy_the_segment() {
    let name = unique_name("persist");
    {
      let lock = ProcessLock::open(&name).unwrap();
      assert!(lock.try_lock().is_acquired());
    }
    assert!(segment_path(&name).exists());
    let lock = ProcessLock::open(&name).unwrap();
    assert_eq!(lock.open_count(), 1);
    assert!(lock.try_lock().is_acquired());
    drop(lock);
    ProcessLock::destroy(&name).unwrap();
    assert!(!segment_path(&name).exists());
  }

  #[test]
  fn size_mismatch_is_version_mismatch() {
    let name = unique_name("version");
    let file = fs::File::create(segment_path(&name)).unwrap();
    file.set_len(LOCK_SEGMENT_SIZE as u64 + 8).unwrap();
    drop(file);
    match ProcessLock::open(&name) {
      Err(VtpError::VersionMismatch { expected, found }) => {
        assert_eq!(expected, LOCK_SEGMENT_SIZE);
        assert_eq!(found, LOCK_SEGMENT_SIZE + 8);
      }
      Err(err) => panic!("Unexpected error {err}"),
      Ok(_)    => panic!("Attached to a segment of the wrong size"),
    }
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn at_most_one_holder() {
    let name    = unique_name("exclusive");
    let anchor  = ProcessLock::open(&name).unwrap();
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..6 {
      let name     = name.clone();
      let holders  = holders.clone();
      let max_seen = max_seen.clone();
      handles.push(thread::spawn(move || {
        // every "process" has its own mapping
        let lock = ProcessLock::open(&name).unwrap();
        for k in 0..200 {
          let outcome = if k % 2 == 0 { lock.lock() } else { lock.lock_timeout(Duration::from_secs(5)) };
          assert!(outcome.is_acquired());
          let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
          max_seen.fetch_max(now, Ordering::SeqCst);
          thread::yield_now();
          holders.fetch_sub(1, Ordering::SeqCst);
          drop(outcome);
        }
      }));
    }
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    drop(anchor);
    ProcessLock::destroy(&name).unwrap();
  }

  /// Lock in a separate thread and let the thread
  /// end without releasing. The mapping is handed
  /// back, so it outlives the thread.
  fn die_while_holding(name : &str) -> ProcessLock {
    let name = String::from(name);
    thread::spawn(move || {
      let lock = ProcessLock::open(&name).unwrap();
      match lock.lock() {
        LockOutcome::Acquired(guard) => mem::forget(guard),
        other => panic!("Unexpected {other}"),
      }
      lock
    }).join().unwrap()
  }

  #[test]
  fn dead_owner_is_recovered() {
    let name = unique_name("deadowner");
    let lock = ProcessLock::open(&name).unwrap();
    let _dead = die_while_holding(&name);
    match lock.try_lock() {
      LockOutcome::RecoveredFromDeadOwner(_) => (),
      other => panic!("Expected recovery, got {other}"),
    }
    // consistent again
    assert!(matches!(lock.try_lock(), LockOutcome::Acquired(_)));
    drop(lock);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn health_check_recovers_dead_owner() {
    let name  = unique_name("health-dead");
    let lock  = ProcessLock::open(&name).unwrap();
    let _dead = die_while_holding(&name);
    let wait  = BoundedWait::new(3, Duration::from_millis(1), None);
    assert_eq!(lock.health_check(&wait).unwrap(), LockHealth::RecoveredFromDeadOwner);
    assert_eq!(lock.health_check(&wait).unwrap(), LockHealth::Free);
    drop(lock);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn timed_acquire_of_a_held_lock_is_busy() {
    let name = unique_name("timed");
    let lock = ProcessLock::open(&name).unwrap();
    let (held_tx, held_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let holder_name = name.clone();
    let holder = thread::spawn(move || {
      let lock  = ProcessLock::open(&holder_name).unwrap();
      let guard = lock.lock();
      held_tx.send(()).unwrap();
      done_rx.recv().unwrap();
      drop(guard);
    });
    held_rx.recv().unwrap();
    assert!(matches!(lock.lock_timeout(Duration::from_millis(20)), LockOutcome::Busy));
    assert!(matches!(lock.try_lock(), LockOutcome::Busy));
    done_tx.send(()).unwrap();
    holder.join().unwrap();
    assert!(lock.try_lock().is_acquired());
    drop(lock);
    ProcessLock::destroy(&name).unwrap();
  }

  #[test]
  fn health_check_reinitializes_a_stuck_lock() {
    let name = unique_name("health-stuck");
    let lock = ProcessLock::open(&name).unwrap();
    let (held_tx, held_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let holder_name = name.clone();
    let holder = thread::spawn(move || {
      let lock = ProcessLock::open(&holder_name).unwrap();
      match lock.lock() {
        LockOutcome::Acquired(guard) => {
          held_tx.send(()).unwrap();
          done_rx.recv().unwrap();
          // the lock got re-initialized under our feet
          mem::forget(guard);
        }
        other => panic!("Unexpected {other}"),
      }
      lock
    });
    held_rx.recv().unwrap();
    let wait = BoundedWait::new(3, Duration::from_millis(1), None);
    assert_eq!(lock.health_check(&wait).unwrap(), LockHealth::Reinitialized);
    assert!(matches!(lock.try_lock(), LockOutcome::Acquired(_)));
    done_tx.send(()).unwrap();
    let _holder_lock = holder.join().unwrap();
    drop(lock);
    ProcessLock::destroy(&name).unwrap();
  }
}
