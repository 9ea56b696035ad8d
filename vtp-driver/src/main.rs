//! # vtp-driver
//!
//! Opens the board, optionally brings up the links and
//! the data path (--run), keeps the status sender going
//! and shuts everything down again on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{
  AtomicBool,
  Ordering,
};
use std::sync::{
  Arc,
  Mutex,
};
use std::thread;
use std::time::Duration;

#[macro_use] extern crate log;
extern crate clap;
extern crate signal_hook;

use clap::Parser;
use signal_hook::consts::{
  SIGINT,
  SIGTERM,
};

use vtp_dataclasses::errors::VtpError;
use vtp_dataclasses::evio::ControlEvent;
use vtp_lib::settings::VtpSettings;
use vtp_lib::thread_control::ThreadControl;
use vtp_lib::{
  init_env_logger,
  load_settings,
};

use vtp_driver::device::{
  self_check,
  VtpDevice,
};
use vtp_driver::dma::{
  DmaChannelId,
  DmaEngine,
  HeapAllocator,
  PageAllocator,
  UdmabufAllocator,
};
use vtp_driver::lock::ProcessLock;
use vtp_driver::profile::FirmwareProfile;
use vtp_driver::roc::HardwareRoc;
use vtp_driver::serdes::SerdesLinkManager;
use vtp_driver::sim::{
  unique_lock_name,
  SimRegisters,
};
use vtp_driver::streaming::StreamingTransport;
use vtp_driver::threads::status_sender;
use vtp_driver::wait::BoundedWait;

#[derive(Parser, Debug)]
#[command(author = "VTP DAQ group", version, about, long_about = None)]
struct Args {
  /// Settings file. If not given, vtp-config.toml is
  /// searched for in $VTP_CONFIG_DIR
  #[arg(short, long)]
  config : Option<PathBuf>,
  /// Run against a simulated register file instead
  /// of /dev/uio
  #[arg(long, default_value_t = false)]
  simulate : bool,
  /// Firmware profile of the simulated board
  #[arg(long, default_value = "StreamingRoc")]
  profile : String,
  /// Only run the register map self-check and exit
  #[arg(long, default_value_t = false)]
  self_check : bool,
  /// Bring up links, DMA, streaming and ROC and start
  /// a run with this run number
  #[arg(long)]
  run : Option<u32>,
  /// Write the default settings to this file and exit
  #[arg(long)]
  write_default_settings : Option<String>,
}

/// Subsystems which take part in a run
struct RunContext {
  dma       : Option<DmaEngine>,
  links     : SerdesLinkManager,
  streaming : Option<StreamingTransport>,
  roc       : Option<HardwareRoc>,
}

fn bring_up(dev        : &Arc<VtpDevice>,
            settings   : &VtpSettings,
            simulate   : bool,
            run_number : u32) -> Result<RunContext, VtpError> {
  let caps = dev.capabilities();
  let mut links = SerdesLinkManager::new(dev.clone(),
                                         settings.serdes.lane_mask,
                                         BoundedWait::from(&settings.serdes.link_check),
                                         Duration::from_millis(settings.serdes.reset_settle_ms));
  let report = links.check_links()?;
  if !report.all_up() {
    warn!("Not all requested lanes are up! {}", report);
  }

  let mut dma = None;
  if caps.dma {
    let allocator : Box<dyn PageAllocator> = if simulate {
      Box::new(HeapAllocator::new())
    } else {
      Box::new(UdmabufAllocator::new(&settings.dma.udmabuf_prefix))
    };
    let mut engine = DmaEngine::new(dev.clone(), allocator, BoundedWait::from(&settings.dma.wait))?;
    engine.mem_open(settings.dma.n_buffers as usize, settings.dma.buffer_size)?;
    engine.channel_init(DmaChannelId::TriggerInterface)?;
    engine.channel_init(DmaChannelId::Board)?;
    dma = Some(engine);
  }

  let mut roc = None;
  if caps.hardware_roc {
    let mut r = HardwareRoc::new(dev.clone(), &settings.roc)?;
    r.hold_reset()?;
    r.configure(&settings.roc)?;
    r.release_reset()?;
    r.enable(true)?;
    roc = Some(r);
  }

  let mut streaming = None;
  if caps.streaming_instances > 0 && caps.event_builder {
    let mut st = StreamingTransport::new(dev.clone(), &settings.streaming)?;
    st.configure()?;
    if !st.connect()? {
      warn!("Not all connections could be established, the run continues without them!");
    }
    st.send_control_event(&ControlEvent::prestart(run_number, 0))?;
    st.send_control_event(&ControlEvent::go(0))?;
    st.enable_data_flow(&links)?;
    streaming = Some(st);
  }
  info!("Run {} started", run_number);
  Ok(RunContext {
    dma,
    links,
    streaming,
    roc,
  })
}

fn tear_down(mut ctx : RunContext) -> Result<(), VtpError> {
  if let Some(st) = ctx.streaming.as_mut() {
    st.disable_data_flow()?;
    st.send_control_event(&ControlEvent::end(0))?;
    let accounting = match st.disconnect() {
      Ok(acc) => acc,
      Err(VtpError::Timeout { what, attempts }) => {
        warn!("{what} did not finish after {attempts} polls, closing the remaining connections without drain!");
        st.disconnect_immediate()?
      }
      Err(err) => return Err(err),
    };
    for acc in accounting {
      info!("{}", acc);
    }
  }
  if let Some(roc) = ctx.roc.as_ref() {
    roc.enable(false)?;
    info!("{}", roc.counters()?);
    roc.hold_reset()?;
  }
  if let Some(dma) = ctx.dma.as_mut() {
    dma.mem_close();
  }
  for lane in ctx.links.status_table()? {
    debug!("{}", lane);
  }
  Ok(())
}

fn main() {
  init_env_logger();
  let args = Args::parse();

  if let Some(fname) = args.write_default_settings {
    let settings = VtpSettings::new();
    settings.to_toml(fname);
    exit(0);
  }

  if let Err(err) = self_check() {
    error!("Register map self-check failed! {err}");
    exit(1);
  }
  if args.self_check {
    println!("=> Register map self-check passed");
    exit(0);
  }

  let settings = match load_settings(args.config) {
    Err(err) => {
      error!("Unable to load settings! {err}");
      exit(1);
    }
    Ok(s) => s,
  };
  if let Err(err) = settings.validate() {
    error!("Invalid settings! {err}");
    exit(1);
  }
  debug!("{}", settings);

  let mut sim_lock = None;
  let opened = if args.simulate {
    let profile = match FirmwareProfile::from_name(&args.profile) {
      Err(err) => {
        error!("{err}");
        exit(1);
      }
      Ok(p) => p,
    };
    let name = unique_lock_name("driver");
    let sim  = SimRegisters::healthy_board(profile, 1);
    sim_lock = Some(name.clone());
    ProcessLock::open(&name)
      .and_then(|lock| VtpDevice::attach(Box::new(sim), lock, settings.device.expected_profile.as_deref()))
  } else {
    VtpDevice::open(&settings.device)
  };
  let dev = match opened {
    Err(err) => {
      error!("Unable to open the board! {err}");
      exit(1);
    }
    Ok(d) => Arc::new(d),
  };
  println!("=> {}", dev);

  let mut run = None;
  if let Some(run_number) = args.run {
    match bring_up(&dev, &settings, args.simulate, run_number) {
      Err(err) => error!("Unable to start run {run_number}! {err}"),
      Ok(ctx)  => run = Some(ctx),
    }
  }

  let thread_control = Arc::new(Mutex::new(ThreadControl::new()));
  if let Some(run_number) = args.run {
    if let Ok(mut tc) = thread_control.lock() {
      tc.run_number = run_number;
    }
  }
  let mut sender = None;
  if settings.status.enabled {
    let dev_c = dev.clone();
    let tc_c  = thread_control.clone();
    let st_c  = settings.status.clone();
    match thread::Builder::new()
      .name("status-sender".into())
      .spawn(move || status_sender(dev_c, st_c, tc_c)) {
      Err(err) => error!("Unable to start the status sender thread! {err}"),
      Ok(h)    => sender = Some(h),
    }
  }

  let term = Arc::new(AtomicBool::new(false));
  for sig in [SIGINT, SIGTERM] {
    if let Err(err) = signal_hook::flag::register(sig, Arc::clone(&term)) {
      error!("Unable to register handler for signal {sig}! {err}");
    }
  }
  info!("Running, waiting for SIGINT/SIGTERM");
  while !term.load(Ordering::Relaxed) {
    thread::sleep(Duration::from_millis(200));
  }
  println!("=> Received stop signal, shutting down!");

  match thread_control.lock() {
    Err(err)   => error!("Unable to lock shared memory! {err}"),
    Ok(mut tc) => tc.stop_flag = true,
  }
  if let Some(handle) = sender {
    if handle.join().is_err() {
      error!("Status sender thread panicked!");
    }
  }
  if let Ok(tc) = thread_control.lock() {
    info!("{}", tc);
  }
  if let Some(ctx) = run {
    if let Err(err) = tear_down(ctx) {
      error!("Ending the run failed! {err}");
    }
  }

  match Arc::try_unwrap(dev) {
    Err(_)  => warn!("Board handle still in use, not closing it explicitly"),
    Ok(dev) => dev.close(),
  }
  if let Some(name) = sim_lock {
    if let Err(err) = ProcessLock::destroy(&name) {
      warn!("Unable to remove simulation lock {name}! {err}");
    }
  }
  println!("So long and thanks for all the \u{1F41F}");
}
