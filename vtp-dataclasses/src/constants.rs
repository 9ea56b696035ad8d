//! Board wide constants shared between the crates

/// Number of high speed backplane slots
pub const N_PAYLOAD_PORTS    : usize = 16;
/// Number of front panel fiber links
pub const N_FRONT_PANEL      : usize = 4;
/// All serdes lanes, payload ports first
pub const N_SERDES_LANES     : usize = N_PAYLOAD_PORTS + N_FRONT_PANEL;
/// Physical sub-lanes bonded into one link
pub const N_SUBLANES         : usize = 4;
/// Network client/server instances (= streams)
pub const N_STREAMS          : usize = 4;

/// Frame length limits (in ticks) accepted
/// by the streaming event builder
pub const FRAME_LEN_MIN      : u32 = 1024;
pub const FRAME_LEN_MAX      : u32 = 65535;
/// One frame length tick in ns
pub const FRAME_LEN_TICK_NS  : u32 = 4;

pub const MTU_MIN            : u32 = 576;
pub const MTU_MAX            : u32 = 9000;
pub const MTU_DEFAULT        : u32 = 8000;
