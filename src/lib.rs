//! softib — a software InfiniBand fabric emulator.
//!
//! Emulates RDMA verbs devices entirely in user space, carrying
//! packets over UDP datagrams on the loopback interface. Queue pairs,
//! completion queues, the reliable-connected retransmit engine and the
//! unreliable-datagram service run on a per-device cooperative worker;
//! an [`EmulatedSwitch`] relays traffic between devices and terminates
//! subnet-management packets.
//!
//! ```no_run
//! use std::sync::Arc;
//! use softib::{Device, EmulatedSwitch, FabricConfig, ProcessMemory};
//!
//! let config = FabricConfig::default();
//! let switch = EmulatedSwitch::new(1, config.ports_per_device).unwrap();
//! switch.start();
//!
//! let memory = Arc::new(ProcessMemory::new());
//! let device = Device::new(0, config, memory, Some(switch.local_addr())).unwrap();
//! device.start();
//! device.register_with_switch().unwrap();
//! ```

mod config;
mod constants;
mod cq;
mod device;
mod error;
pub mod mad;
pub mod mem;
mod packet;
mod pma;
mod qp;
mod rc;
mod sched;
mod switch;
mod types;
mod ud;
mod wr;

pub use config::{Behaviors, ConfigError, ConfigLoader, FabricConfig};
pub use constants::{LID_PERMISSIVE, MCAST_LID_BASE, MULTICAST_QPN, QP0, QP1};
pub use cq::CqNotify;
pub use device::{AsyncEvent, Device, QpInitAttr};
pub use error::{Error, Result};
pub use mem::{MemAccessError, MemoryRegistry, ProcessMemory};
pub use pma::PerfCounters;
pub use qp::{ModifyQp, QpAttrs, QpState, QpType};
pub use switch::EmulatedSwitch;
pub use types::{PathMtu, Psn};
pub use wr::{
    RecvWr, SendFlags, SendWr, Sge, UdDest, WcOpcode, WcStatus, WorkCompletion, WrOpcode,
};
