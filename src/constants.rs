/// Number of bits in a Packet Sequence Number.
pub(crate) const PSN_SIZE_BITS: usize = 24;
/// Half of the PSN space; anything further apart compares as "in the past".
pub(crate) const MAX_PSN_WINDOW: usize = 1 << (PSN_SIZE_BITS - 1);
/// Mask extracting a PSN from a 32-bit word.
pub(crate) const PSN_MASK: u32 = (1 << PSN_SIZE_BITS) - 1;

/// Mask extracting a QPN from a 32-bit word.
pub(crate) const QPN_MASK: u32 = 0x00FF_FFFF;

/// Subnet-management QP.
pub const QP0: u32 = 0;
/// General-services management QP.
pub const QP1: u32 = 1;
/// Destination QPN carried by multicast datagrams.
pub const MULTICAST_QPN: u32 = 0x00FF_FFFF;

pub(crate) const MAX_QP_CNT: usize = 1024;
/// Low bits of a QPN hold a random key; the high bits index the table.
pub(crate) const QPN_KEY_PART_WIDTH: u32 = 14;

/// Base of the synthetic registry handles given to per-port management
/// QPs, above the 24-bit QPN space.
pub(crate) const MGMT_HANDLE_BASE: u32 = 0x0100_0000;

pub(crate) const MAX_CQ_CNT: usize = 1024;
/// Upper bound on the capacity of a single completion queue.
pub(crate) const MAX_CQE: usize = 4096;

/// First multicast LID. Unicast LIDs live in `[1, MCAST_LID_BASE)`.
pub const MCAST_LID_BASE: u16 = 0xC000;
/// The permissive LID matches any destination port.
pub const LID_PERMISSIVE: u16 = 0xFFFF;

/// Largest datagram the fabric ever carries: headers plus a 4096-byte
/// payload plus ICRC and footer, with slack.
pub(crate) const PACKET_BUFFER: usize = 8 * 1024;

/// Packets a single scheduler pass may emit for one QP.
pub(crate) const SEND_BURST_QUOTA: u32 = 16;

/// Responses the responder remembers for duplicate atomics.
pub(crate) const RESPONSE_CACHE_DEPTH: usize = 16;

/// Ceiling on `max_rd_atomic`.
pub(crate) const MAX_RD_ATOMIC: u8 = 16;

/// Node description the emulated switch reports.
pub(crate) const SWITCH_DESCRIPTION: &str = "softib internal switch";

pub(crate) const SWITCH_NODE_GUID: u64 = 0x0002_c900_0000_0100;
pub(crate) const SWITCH_SYS_GUID: u64 = 0x0002_c900_0000_0200;

pub(crate) const DRIVER_DEVICE_ID: u16 = 0x0b1e;
pub(crate) const DRIVER_REVISION: u32 = 1;
