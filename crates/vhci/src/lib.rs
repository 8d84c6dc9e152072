//! Virtual USB host controller core
//!
//! A software root hub whose ports are backed by TCP connections to remote
//! USB/IP servers. The crate provides:
//!
//! - [`PortTable`]: the fixed set of root hub ports and their lifecycle
//! - [`InboundStreamBuffer`]: zero-copy reassembly of the received byte stream
//! - [`LockedBuffer`]: page-locked descriptors for in-flight transfers
//! - [`ReconnectSupervisor`]: background replay of persisted devices with backoff
//! - [`Vhci`]: the controller tying them together, driven by [`ioctl::dispatch`]
//!
//! # Example
//!
//! ```
//! use vhci::PortTable;
//!
//! let table = PortTable::new(4).unwrap();
//! assert_eq!(table.acquire_port(), Some(1));
//! assert_eq!(table.acquire_port(), Some(2));
//! table.release_port(1).unwrap();
//! assert_eq!(table.acquire_port(), Some(1));
//! ```

pub mod config;
pub mod controller;
pub mod device;
pub mod ioctl;
pub mod locked_buffer;
pub mod persistent;
pub mod port_table;
pub mod stream_buffer;
pub mod transport;

pub use config::VhciConfig;
pub use controller::Vhci;
pub use device::{DeviceContext, DeviceSummary};
pub use ioctl::{IoctlCode, dispatch};
pub use locked_buffer::{AccessMode, BufferChain, LockOperation, Lockable, LockedBuffer, MemoryKind};
pub use persistent::{BackoffPolicy, PersistentDeviceEntry, ReconnectSupervisor};
pub use port_table::PortTable;
pub use stream_buffer::{CopyCursor, InboundStreamBuffer, Segment};
pub use transport::{Connector, TcpConnector};
