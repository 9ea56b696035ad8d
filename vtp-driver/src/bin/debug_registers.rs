//! Look at the board registers without touching
//! anything: offset self-check, lock health, a full
//! register dump and the serdes link table.

extern crate vtp_driver;

use std::process::exit;
use std::time::Duration;

use clap::Parser;

use vtp_lib::{
  init_env_logger,
  load_settings,
};

use vtp_driver::device::VtpDevice;
use vtp_driver::lock::ProcessLock;
use vtp_driver::profile::FirmwareProfile;
use vtp_driver::registers::{
  check_offsets,
  named_registers,
};
use vtp_driver::serdes::SerdesLinkManager;
use vtp_driver::sim::{
  unique_lock_name,
  SimRegisters,
};
use vtp_driver::wait::BoundedWait;

#[derive(Parser, Debug)]
#[command(author = "VTP DAQ group", version, about, long_about = None)]
struct Args {
  /// Use a simulated board
  #[arg(long, default_value_t = false)]
  simulate : bool,
  /// Firmware profile of the simulated board
  #[arg(long, default_value = "StreamingRoc")]
  profile : String,
  /// Skip the lock health check
  #[arg(long, default_value_t = false)]
  no_lock_check : bool,
}

fn main() {
  init_env_logger();
  let args = Args::parse();

  println!("=> Checking register map offsets...");
  let mismatches = check_offsets();
  for m in &mismatches {
    println!("  !! {} at {:#06x}, expected {:#06x}", m.name, m.found, m.expected);
  }
  if mismatches.is_empty() {
    println!("=> Offsets ok");
  }

  let settings = match load_settings(None) {
    Err(err) => {
      println!("=> {err}");
      exit(1);
    }
    Ok(s) => s,
  };
  let mut sim_lock = None;
  let opened = if args.simulate {
    let profile = match FirmwareProfile::from_name(&args.profile) {
      Err(err) => {
        println!("=> {err}");
        exit(1);
      }
      Ok(p) => p,
    };
    let name = unique_lock_name("debug");
    sim_lock = Some(name.clone());
    let sim  = SimRegisters::healthy_board(profile, 1);
    ProcessLock::open(&name).and_then(|lock| VtpDevice::attach(Box::new(sim), lock, None))
  } else {
    VtpDevice::open(&settings.device)
  };
  let dev = match opened {
    Err(err) => {
      println!("=> Unable to open the board! {err}");
      exit(1);
    }
    Ok(d) => std::sync::Arc::new(d),
  };
  println!("=> {}", dev);
  println!("=> {}", dev.identity());
  println!("=> {}", dev.capabilities());
  println!("=> Lock {} has {} open handle(s)", dev.lock().name(), dev.lock().open_count());

  if !args.no_lock_check {
    match dev.lock_health(&BoundedWait::from(&settings.device.lock_health)) {
      Err(err)   => println!("=> Lock health check failed! {err}"),
      Ok(health) => println!("=> Lock health {:?}", health),
    }
  }

  println!("=> Register dump");
  for (name, offset) in named_registers() {
    match dev.read32(offset) {
      Err(err)  => println!("  {:<28} {:#06x} : {err}", name, offset),
      Ok(value) => println!("  {:<28} {:#06x} : {:#010x}", name, offset, value),
    }
  }

  println!("=> Serdes lanes");
  let links = SerdesLinkManager::new(dev.clone(),
                                     dev.capabilities().serdes_lanes,
                                     BoundedWait::link_check(),
                                     Duration::from_millis(settings.serdes.reset_settle_ms));
  match links.status_table() {
    Err(err)  => println!("=> Unable to read lane status! {err}"),
    Ok(table) => {
      for lane in table {
        println!("  {}", lane);
      }
    }
  }

  drop(links);
  if let Ok(dev) = std::sync::Arc::try_unwrap(dev) {
    dev.close();
  }
  if let Some(name) = sim_lock {
    let _ = ProcessLock::destroy(&name);
  }
}
