//! Control plane driver for the VXS Trigger Processor
//!
//! Everything goes through one [`device::VtpDevice`],
//! which owns the mapped register window and the board
//! wide process shared lock. The subsystems (DMA, serdes,
//! streaming transport, hardware ROC) hold it in an Arc.
//!
//! [`sim::SimRegisters`] stands in for the hardware
//! in the tests and for `--simulate`.

pub mod registers;
pub mod memory;
pub mod lock;
pub mod wait;
pub mod profile;
pub mod device;
pub mod sim;
pub mod dma;
pub mod serdes;
pub mod streaming;
pub mod roc;
pub mod threads;

extern crate libc;
extern crate memmap;

#[macro_use] extern crate log;

pub use device::VtpDevice;
pub use profile::FirmwareProfile;
pub use wait::BoundedWait;
