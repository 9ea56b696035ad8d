//! Registers of the VTP are accessed through the
//! uio register window (Addr8). It is a 32bit system,
//! so each register occupies 4 bytes and the next
//! register will be the previous register + 4.
//! If the register is the same as another, then the
//! register holds different fields for the different
//! bits in the register.
//!
//! The window is subdivided into blocks, the block
//! offsets are fixed by the firmware:
//!
//! | block                  | offset  |
//! |------------------------|---------|
//! | clock / status         | 0x0000  |
//! | serdes lanes (20)      | 0x0100  |
//! | DMA channels (2)       | 0x0800  |
//! | streaming event builder| 0x1000  |
//! | network clients (4)    | 0x2000  |
//! | hardware ROC           | 0x3000  |
//!
//! The same layout is described as a set of `#[repr(C)]`
//! structs below. `check_offsets` compares the two
//! descriptions and is run once when the board is opened.

use std::mem::{
  offset_of,
  size_of,
};

use vtp_dataclasses::constants::{
  N_SERDES_LANES,
  N_STREAMS,
};

/// Size of the mapped register window in bytes
pub const REGISTER_WINDOW_SIZE : usize = 0x4000;

//========== Clock / status =============
//
//=======================================

pub const CLK_BASE        : u32 = 0x0000;
pub const BOARD_MAGIC     : u32 = 0x0000; //[31:0] ro  "VTP0"
pub const FW_TYPE         : u32 = 0x0004; //[7:0]  ro  firmware profile id
pub const FW_REVISION     : u32 = 0x0008; //[31:0] ro  major[31:16] minor[15:0]
pub const BOARD_ID        : u32 = 0x000c; //[7:0]  ro  slot/board id
pub const CLK_CTRL        : u32 = 0x0010; //[0]    rw  PLL reset
pub const CLK_STATUS      : u32 = 0x0014; //[0]    ro  PLL locked
pub const SCRATCH         : u32 = 0x0018; //[31:0] rw

pub const BOARD_MAGIC_VALUE : u32 = 0x56545030;

//========== Serdes lanes ===============
// lane 0-15 payload ports, 16-19 front panel
//=======================================

pub const SERDES_BASE     : u32 = 0x0100;
pub const SERDES_STRIDE   : u32 = 0x40;
pub const SD_CTRL         : u32 = 0x00; //[0] rw lane reset (level), [1] error counter reset
pub const SD_STATUS       : u32 = 0x04; //[3:0] ro sub-lane up, [4] channel up
pub const SD_SOFT_ERR_CNT : u32 = 0x08; //[31:0] ro soft errors since reset
pub const SD_LATENCY      : u32 = 0x0c; //[15:0] ro rx latency, [31:16] tx latency (ticks)

pub const SD_CTRL_RESET        : u32 = 1 << 0;
pub const SD_CTRL_ERR_CNT_RST  : u32 = 1 << 1;
pub const SD_STATUS_SUBLANES   : u32 = 0xf;
pub const SD_STATUS_CHANNEL_UP : u32 = 1 << 4;

//=================DMA==================================
// (direct memory access)
// channel 0 - trigger interface, 1 - board event data
//======================================================

pub const DMA_BASE        : u32 = 0x0800;
pub const DMA_STRIDE      : u32 = 0x40;
pub const DMA_CTRL        : u32 = 0x00; //[0] run, [1] reset, [2] clear status, [3] enable
pub const DMA_STATUS      : u32 = 0x04; //[0] busy, [1] done, [2] error
pub const DMA_DEST_ADDR   : u32 = 0x08; //[31:0] physical destination address
pub const DMA_MAX_LEN     : u32 = 0x0c; //[31:0] maximum transfer length in bytes
pub const DMA_XFER_LEN    : u32 = 0x10; //[31:0] bytes transferred by the last run

pub const DMA_CTRL_RUN          : u32 = 1 << 0;
pub const DMA_CTRL_RESET        : u32 = 1 << 1;
pub const DMA_CTRL_CLEAR        : u32 = 1 << 2;
pub const DMA_CTRL_ENABLE       : u32 = 1 << 3;
pub const DMA_STATUS_BUSY       : u32 = 1 << 0;
pub const DMA_STATUS_DONE       : u32 = 1 << 1;
pub const DMA_STATUS_ERROR      : u32 = 1 << 2;

//========== Streaming event builder ====
//
//=======================================

pub const EB_BASE             : u32 = 0x1000;
pub const EB_CTRL             : u32 = 0x1000; //[0] stream processing enable, [1] host data enable, [2] reset
pub const EB_PP_MASK          : u32 = 0x1004; //[15:0] payload port enable
pub const EB_PP_STREAM        : u32 = 0x1008; //[31:0] 2 bits per payload port, stream-1
pub const EB_FRAME_LEN        : u32 = 0x100c; //[15:0] frame length in ticks
pub const EB_BOARD_ID         : u32 = 0x1010; //[31:0] board id in frame headers
pub const EB_NSTREAMS         : u32 = 0x1014; //[2:0] active streams
pub const EB_FRAME_CNT        : u32 = 0x1020; //[31:0] x4, frames built per stream (wraps)
pub const EB_HOST_FIFO_DATA   : u32 = 0x1040; //[31:0] wo host injected record words
pub const EB_HOST_FIFO_LEN    : u32 = 0x1044; //[15:0] wo record length, triggers transmission
pub const EB_HOST_FIFO_STATUS : u32 = 0x1048; //[0] ro record pending

pub const EB_CTRL_STREAM_EN   : u32 = 1 << 0;
pub const EB_CTRL_HOST_EN     : u32 = 1 << 1;
pub const EB_CTRL_RESET       : u32 = 1 << 2;
pub const EB_HOST_PENDING     : u32 = 1 << 0;

//========== Network clients ============
// one per stream
//=======================================

pub const NET_BASE        : u32 = 0x2000;
pub const NET_STRIDE      : u32 = 0x100;
pub const NET_CTRL        : u32 = 0x00; //[0] phy reset, [1] gt reset, [2] tcp reset, [3] connect, [4] listen, [5] udp enable
pub const NET_STATUS      : u32 = 0x04; //[0] phy link up, [1] connected, [2] tx data pending
pub const NET_MODE        : u32 = 0x08; //[1:0] 0 tcp client, 1 tcp server, 2 udp
pub const NET_LOCAL_IP    : u32 = 0x0c;
pub const NET_SUBNET      : u32 = 0x10;
pub const NET_GATEWAY     : u32 = 0x14;
pub const NET_MAC_HI      : u32 = 0x18; //[15:0] mac bytes 0-1
pub const NET_MAC_LO      : u32 = 0x1c; //[31:0] mac bytes 2-5
pub const NET_DEST_IP     : u32 = 0x20;
pub const NET_DEST_PORT   : u32 = 0x24; //[15:0]
pub const NET_LOCAL_PORT  : u32 = 0x28; //[15:0]
pub const NET_MTU         : u32 = 0x2c; //[13:0]
pub const NET_TX_FRAMES   : u32 = 0x30; //[31:0] ro frames sent
pub const NET_TX_BYTES_LO : u32 = 0x34; //[31:0] ro bytes sent
pub const NET_TX_BYTES_HI : u32 = 0x38; //[31:0] ro

pub const NET_CTRL_PHY_RESET   : u32 = 1 << 0;
pub const NET_CTRL_GT_RESET    : u32 = 1 << 1;
pub const NET_CTRL_TCP_RESET   : u32 = 1 << 2;
pub const NET_CTRL_CONNECT     : u32 = 1 << 3;
pub const NET_CTRL_LISTEN      : u32 = 1 << 4;
pub const NET_CTRL_UDP_EN      : u32 = 1 << 5;
pub const NET_CTRL_ALL_RESETS  : u32 = NET_CTRL_PHY_RESET | NET_CTRL_GT_RESET | NET_CTRL_TCP_RESET;
pub const NET_STATUS_LINK_UP   : u32 = 1 << 0;
pub const NET_STATUS_CONNECTED : u32 = 1 << 1;
pub const NET_STATUS_TX_PENDING: u32 = 1 << 2;

//========== Hardware ROC ===============
//
//=======================================

pub const ROC_BASE            : u32 = 0x3000;
pub const ROC_CTRL            : u32 = 0x3000; //[0] reset (level held), [1] hardware mode, [2] enable
pub const ROC_TRIG_CNT        : u32 = 0x3004; //[31:0] ro triggers received
pub const ROC_ACK_CNT         : u32 = 0x3008; //[31:0] ro triggers acknowledged
pub const ROC_PENDING         : u32 = 0x300c; //[31:0] ro triggers awaiting acknowledgement
pub const ROC_BYTE_CNT_LO     : u32 = 0x3010; //[31:0] ro bytes sent
pub const ROC_BYTE_CNT_HI     : u32 = 0x3014; //[31:0] ro
pub const ROC_SYNC_FIFO_DATA  : u32 = 0x3018; //[31:0] wo sync event words
pub const ROC_SYNC_ACK_LEN    : u32 = 0x301c; //[15:0] wo word count, acknowledges a trigger
pub const ROC_ASYNC_FIFO_DATA : u32 = 0x3020; //[31:0] wo async (user) event words
pub const ROC_ASYNC_LEN       : u32 = 0x3024; //[15:0] wo word count, commits the user event
pub const ROC_ASYNC_STATUS    : u32 = 0x3028; //[15:0] ro free words, [31] overflow
pub const ROC_MAX_RECORD      : u32 = 0x302c; //[31:0] max record size in bytes
pub const ROC_MAX_BLOCKS      : u32 = 0x3030; //[15:0]
pub const ROC_RECORD_TIMEOUT  : u32 = 0x3034; //[31:0] ticks
pub const ROC_ID              : u32 = 0x3038; //[31:0]

pub const ROC_CTRL_RESET         : u32 = 1 << 0;
pub const ROC_CTRL_HW_MODE       : u32 = 1 << 1;
pub const ROC_CTRL_ENABLE        : u32 = 1 << 2;
pub const ROC_ASYNC_FREE_MASK    : u32 = 0xffff;
pub const ROC_ASYNC_OVERFLOW     : u32 = 1 << 31;
/// Depth of the sync and async event FIFOs in words
pub const ROC_FIFO_DEPTH         : usize = 4096;

/// Address of a register of serdes lane `lane`
pub fn serdes_reg(lane : usize, reg : u32) -> u32 {
  SERDES_BASE + (lane as u32)*SERDES_STRIDE + reg
}

/// Address of a register of DMA channel `channel`
pub fn dma_reg(channel : usize, reg : u32) -> u32 {
  DMA_BASE + (channel as u32)*DMA_STRIDE + reg
}

/// Address of a register of network client `inst`
pub fn net_reg(inst : usize, reg : u32) -> u32 {
  NET_BASE + (inst as u32)*NET_STRIDE + reg
}

/// Hardware frame counter of stream `stream` (0-3)
pub fn eb_frame_cnt(stream : usize) -> u32 {
  EB_FRAME_CNT + 4*(stream as u32)
}

//========== Layout description =========
//
//=======================================

#[repr(C)]
pub struct ClkRegs {
  pub magic       : u32,
  pub fw_type     : u32,
  pub fw_revision : u32,
  pub board_id    : u32,
  pub ctrl        : u32,
  pub status      : u32,
  pub scratch     : u32,
  _reserved       : [u32; 57],
}

#[repr(C)]
pub struct SerdesLaneRegs {
  pub ctrl         : u32,
  pub status       : u32,
  pub soft_err_cnt : u32,
  pub latency      : u32,
  _reserved        : [u32; 12],
}

#[repr(C)]
pub struct DmaChannelRegs {
  pub ctrl      : u32,
  pub status    : u32,
  pub dest_addr : u32,
  pub max_len   : u32,
  pub xfer_len  : u32,
  _reserved     : [u32; 11],
}

#[repr(C)]
pub struct EventBuilderRegs {
  pub ctrl             : u32,
  pub pp_mask          : u32,
  pub pp_stream        : u32,
  pub frame_len        : u32,
  pub board_id         : u32,
  pub nstreams         : u32,
  _reserved0           : [u32; 2],
  pub frame_cnt        : [u32; N_STREAMS],
  _reserved1           : [u32; 4],
  pub host_fifo_data   : u32,
  pub host_fifo_len    : u32,
  pub host_fifo_status : u32,
  _reserved2           : [u32; 1005],
}

#[repr(C)]
pub struct NetClientRegs {
  pub ctrl        : u32,
  pub status      : u32,
  pub mode        : u32,
  pub local_ip    : u32,
  pub subnet      : u32,
  pub gateway     : u32,
  pub mac_hi      : u32,
  pub mac_lo      : u32,
  pub dest_ip     : u32,
  pub dest_port   : u32,
  pub local_port  : u32,
  pub mtu         : u32,
  pub tx_frames   : u32,
  pub tx_bytes_lo : u32,
  pub tx_bytes_hi : u32,
  _reserved       : [u32; 49],
}

#[repr(C)]
pub struct RocRegs {
  pub ctrl            : u32,
  pub trig_cnt        : u32,
  pub ack_cnt         : u32,
  pub pending         : u32,
  pub byte_cnt_lo     : u32,
  pub byte_cnt_hi     : u32,
  pub sync_fifo_data  : u32,
  pub sync_ack_len    : u32,
  pub async_fifo_data : u32,
  pub async_len       : u32,
  pub async_status    : u32,
  pub max_record      : u32,
  pub max_blocks      : u32,
  pub record_timeout  : u32,
  pub roc_id          : u32,
  _reserved           : [u32; 1009],
}

/// The whole register window
#[repr(C)]
pub struct VtpRegisterMap {
  pub clk    : ClkRegs,
  pub serdes : [SerdesLaneRegs; N_SERDES_LANES],
  _reserved0 : [u32; 128],
  pub dma    : [DmaChannelRegs; 2],
  _reserved1 : [u32; 480],
  pub eb     : EventBuilderRegs,
  pub net    : [NetClientRegs; N_STREAMS],
  _reserved2 : [u32; 768],
  pub roc    : RocRegs,
}

const _ : () = assert!(size_of::<VtpRegisterMap>() == REGISTER_WINDOW_SIZE);
const _ : () = assert!(size_of::<SerdesLaneRegs>() == SERDES_STRIDE as usize);
const _ : () = assert!(size_of::<DmaChannelRegs>() == DMA_STRIDE as usize);
const _ : () = assert!(size_of::<NetClientRegs>()  == NET_STRIDE as usize);

/// A register whose address constant does not
/// agree with the layout description
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetMismatch {
  pub name     : &'static str,
  pub expected : u32,
  pub found    : u32,
}

/// Compare every address constant with the
/// layout description. An empty result means
/// the register map is consistent.
pub fn check_offsets() -> Vec<OffsetMismatch> {
  let clk    = offset_of!(VtpRegisterMap, clk) as u32;
  let serdes = offset_of!(VtpRegisterMap, serdes) as u32;
  let dma    = offset_of!(VtpRegisterMap, dma) as u32;
  let eb     = offset_of!(VtpRegisterMap, eb) as u32;
  let net    = offset_of!(VtpRegisterMap, net) as u32;
  let roc    = offset_of!(VtpRegisterMap, roc) as u32;
  let checks : Vec<(&'static str, u32, u32)> = vec![
    ("CLK_BASE",            CLK_BASE,            clk),
    ("BOARD_MAGIC",         BOARD_MAGIC,         clk + offset_of!(ClkRegs, magic) as u32),
    ("FW_TYPE",             FW_TYPE,             clk + offset_of!(ClkRegs, fw_type) as u32),
    ("FW_REVISION",         FW_REVISION,         clk + offset_of!(ClkRegs, fw_revision) as u32),
    ("BOARD_ID",            BOARD_ID,            clk + offset_of!(ClkRegs, board_id) as u32),
    ("CLK_CTRL",            CLK_CTRL,            clk + offset_of!(ClkRegs, ctrl) as u32),
    ("CLK_STATUS",          CLK_STATUS,          clk + offset_of!(ClkRegs, status) as u32),
    ("SCRATCH",             SCRATCH,             clk + offset_of!(ClkRegs, scratch) as u32),
    ("SERDES_BASE",         SERDES_BASE,         serdes),
    ("SD_CTRL",             SD_CTRL,             offset_of!(SerdesLaneRegs, ctrl) as u32),
    ("SD_STATUS",           SD_STATUS,           offset_of!(SerdesLaneRegs, status) as u32),
    ("SD_SOFT_ERR_CNT",     SD_SOFT_ERR_CNT,     offset_of!(SerdesLaneRegs, soft_err_cnt) as u32),
    ("SD_LATENCY",          SD_LATENCY,          offset_of!(SerdesLaneRegs, latency) as u32),
    ("DMA_BASE",            DMA_BASE,            dma),
    ("DMA_CTRL",            DMA_CTRL,            offset_of!(DmaChannelRegs, ctrl) as u32),
    ("DMA_STATUS",          DMA_STATUS,          offset_of!(DmaChannelRegs, status) as u32),
    ("DMA_DEST_ADDR",       DMA_DEST_ADDR,       offset_of!(DmaChannelRegs, dest_addr) as u32),
    ("DMA_MAX_LEN",         DMA_MAX_LEN,         offset_of!(DmaChannelRegs, max_len) as u32),
    ("DMA_XFER_LEN",        DMA_XFER_LEN,        offset_of!(DmaChannelRegs, xfer_len) as u32),
    ("EB_BASE",             EB_BASE,             eb),
    ("EB_CTRL",             EB_CTRL,             eb + offset_of!(EventBuilderRegs, ctrl) as u32),
    ("EB_PP_MASK",          EB_PP_MASK,          eb + offset_of!(EventBuilderRegs, pp_mask) as u32),
    ("EB_PP_STREAM",        EB_PP_STREAM,        eb + offset_of!(EventBuilderRegs, pp_stream) as u32),
    ("EB_FRAME_LEN",        EB_FRAME_LEN,        eb + offset_of!(EventBuilderRegs, frame_len) as u32),
    ("EB_BOARD_ID",         EB_BOARD_ID,         eb + offset_of!(EventBuilderRegs, board_id) as u32),
    ("EB_NSTREAMS",         EB_NSTREAMS,         eb + offset_of!(EventBuilderRegs, nstreams) as u32),
    ("EB_FRAME_CNT",        EB_FRAME_CNT,        eb + offset_of!(EventBuilderRegs, frame_cnt) as u32),
    ("EB_HOST_FIFO_DATA",   EB_HOST_FIFO_DATA,   eb + offset_of!(EventBuilderRegs, host_fifo_data) as u32),
    ("EB_HOST_FIFO_LEN",    EB_HOST_FIFO_LEN,    eb + offset_of!(EventBuilderRegs, host_fifo_len) as u32),
    ("EB_HOST_FIFO_STATUS", EB_HOST_FIFO_STATUS, eb + offset_of!(EventBuilderRegs, host_fifo_status) as u32),
    ("NET_BASE",            NET_BASE,            net),
    ("NET_CTRL",            NET_CTRL,            offset_of!(NetClientRegs, ctrl) as u32),
    ("NET_STATUS",          NET_STATUS,          offset_of!(NetClientRegs, status) as u32),
    ("NET_MODE",            NET_MODE,            offset_of!(NetClientRegs, mode) as u32),
    ("NET_LOCAL_IP",        NET_LOCAL_IP,        offset_of!(NetClientRegs, local_ip) as u32),
    ("NET_SUBNET",          NET_SUBNET,          offset_of!(NetClientRegs, subnet) as u32),
    ("NET_GATEWAY",         NET_GATEWAY,         offset_of!(NetClientRegs, gateway) as u32),
    ("NET_MAC_HI",          NET_MAC_HI,          offset_of!(NetClientRegs, mac_hi) as u32),
    ("NET_MAC_LO",          NET_MAC_LO,          offset_of!(NetClientRegs, mac_lo) as u32),
    ("NET_DEST_IP",         NET_DEST_IP,         offset_of!(NetClientRegs, dest_ip) as u32),
    ("NET_DEST_PORT",       NET_DEST_PORT,       offset_of!(NetClientRegs, dest_port) as u32),
    ("NET_LOCAL_PORT",      NET_LOCAL_PORT,      offset_of!(NetClientRegs, local_port) as u32),
    ("NET_MTU",             NET_MTU,             offset_of!(NetClientRegs, mtu) as u32),
    ("NET_TX_FRAMES",       NET_TX_FRAMES,       offset_of!(NetClientRegs, tx_frames) as u32),
    ("NET_TX_BYTES_LO",     NET_TX_BYTES_LO,     offset_of!(NetClientRegs, tx_bytes_lo) as u32),
    ("NET_TX_BYTES_HI",     NET_TX_BYTES_HI,     offset_of!(NetClientRegs, tx_bytes_hi) as u32),
    ("ROC_BASE",            ROC_BASE,            roc),
    ("ROC_CTRL",            ROC_CTRL,            roc + offset_of!(RocRegs, ctrl) as u32),
    ("ROC_TRIG_CNT",        ROC_TRIG_CNT,        roc + offset_of!(RocRegs, trig_cnt) as u32),
    ("ROC_ACK_CNT",         ROC_ACK_CNT,         roc + offset_of!(RocRegs, ack_cnt) as u32),
    ("ROC_PENDING",         ROC_PENDING,         roc + offset_of!(RocRegs, pending) as u32),
    ("ROC_BYTE_CNT_LO",     ROC_BYTE_CNT_LO,     roc + offset_of!(RocRegs, byte_cnt_lo) as u32),
    ("ROC_BYTE_CNT_HI",     ROC_BYTE_CNT_HI,     roc + offset_of!(RocRegs, byte_cnt_hi) as u32),
    ("ROC_SYNC_FIFO_DATA",  ROC_SYNC_FIFO_DATA,  roc + offset_of!(RocRegs, sync_fifo_data) as u32),
    ("ROC_SYNC_ACK_LEN",    ROC_SYNC_ACK_LEN,    roc + offset_of!(RocRegs, sync_ack_len) as u32),
    ("ROC_ASYNC_FIFO_DATA", ROC_ASYNC_FIFO_DATA, roc + offset_of!(RocRegs, async_fifo_data) as u32),
    ("ROC_ASYNC_LEN",       ROC_ASYNC_LEN,       roc + offset_of!(RocRegs, async_len) as u32),
    ("ROC_ASYNC_STATUS",    ROC_ASYNC_STATUS,    roc + offset_of!(RocRegs, async_status) as u32),
    ("ROC_MAX_RECORD",      ROC_MAX_RECORD,      roc + offset_of!(RocRegs, max_record) as u32),
    ("ROC_MAX_BLOCKS",      ROC_MAX_BLOCKS,      roc + offset_of!(RocRegs, max_blocks) as u32),
    ("ROC_RECORD_TIMEOUT",  ROC_RECORD_TIMEOUT,  roc + offset_of!(RocRegs, record_timeout) as u32),
    ("ROC_ID",              ROC_ID,              roc + offset_of!(RocRegs, roc_id) as u32),
  ];
  checks.into_iter()
    .filter(|(_, expected, found)| expected != found)
    .map(|(name, expected, found)| OffsetMismatch { name, expected, found })
    .collect()
}

/// All named registers, used for register dumps
pub fn named_registers() -> Vec<(String, u32)> {
  let mut regs = vec![
    (String::from("BOARD_MAGIC"), BOARD_MAGIC),
    (String::from("FW_TYPE"),     FW_TYPE),
    (String::from("FW_REVISION"), FW_REVISION),
    (String::from("BOARD_ID"),    BOARD_ID),
    (String::from("CLK_STATUS"),  CLK_STATUS),
  ];
  for lane in 0..N_SERDES_LANES {
    regs.push((format!("SD{:02}_STATUS", lane),  serdes_reg(lane, SD_STATUS)));
    regs.push((format!("SD{:02}_ERRCNT", lane),  serdes_reg(lane, SD_SOFT_ERR_CNT)));
  }
  for ch in 0..2 {
    regs.push((format!("DMA{}_STATUS", ch),   dma_reg(ch, DMA_STATUS)));
    regs.push((format!("DMA{}_XFER_LEN", ch), dma_reg(ch, DMA_XFER_LEN)));
  }
  regs.push((String::from("EB_CTRL"),      EB_CTRL));
  regs.push((String::from("EB_PP_MASK"),   EB_PP_MASK));
  regs.push((String::from("EB_FRAME_LEN"), EB_FRAME_LEN));
  regs.push((String::from("EB_NSTREAMS"),  EB_NSTREAMS));
  for inst in 0..N_STREAMS {
    regs.push((format!("EB_FRAME_CNT{}", inst), eb_frame_cnt(inst)));
    regs.push((format!("NET{}_CTRL", inst),     net_reg(inst, NET_CTRL)));
    regs.push((format!("NET{}_STATUS", inst),   net_reg(inst, NET_STATUS)));
  }
  regs.push((String::from("ROC_CTRL"),     ROC_CTRL));
  regs.push((String::from("ROC_TRIG_CNT"), ROC_TRIG_CNT));
  regs.push((String::from("ROC_ACK_CNT"),  ROC_ACK_CNT));
  regs.push((String::from("ROC_PENDING"),  ROC_PENDING));
  regs
}

#[cfg(test)]
mod test_registers {
  use super::*;

  #[test]
  fn register_map_offsets_agree_with_layout() {
    let mismatches = check_offsets();
    assert!(mismatches.is_empty(), "Offset mismatches: {:?}", mismatches);
  }

  #[test]
  fn per_instance_addresses() {
    assert_eq!(serdes_reg(0, SD_STATUS),  0x0104);
    assert_eq!(serdes_reg(19, SD_CTRL),   0x05c0);
    assert_eq!(dma_reg(1, DMA_STATUS),    0x0844);
    assert_eq!(net_reg(3, NET_CTRL),      0x2300);
    assert_eq!(eb_frame_cnt(3),           0x102c);
  }

  #[test]
  fn all_named_registers_are_inside_the_window() {
    for (name, addr) in named_registers() {
      assert_eq!(addr % 4, 0, "{name} unaligned");
      assert!((addr as usize) < REGISTER_WINDOW_SIZE, "{name} outside window");
    }
  }
}
