//! Control interface records for the virtual host controller
//!
//! This crate defines the fixed-size records exchanged between user-space
//! tooling and the controller: attach (plugin) and detach (unplug) requests,
//! the imported-device enumeration and the ports-status snapshot, together
//! with the error-code and status-code enumerations returned to callers.
//!
//! # Example
//!
//! ```
//! use protocol::{PluginRequest, USBIP_PORT};
//!
//! let req = PluginRequest::new("pi5.local", USBIP_PORT, "1-1.2");
//! let bytes = req.encode().unwrap();
//! assert_eq!(bytes.len(), PluginRequest::SIZE);
//!
//! let decoded = PluginRequest::decode(&bytes).unwrap();
//! assert_eq!(decoded.busid, "1-1.2");
//! assert_eq!(decoded.port, 0);
//! ```

pub mod codec;
pub mod consts;
pub mod error;
pub mod records;
pub mod status;
pub mod types;

pub use consts::{
    BUS_ID_SIZE, DEV_PATH_MAX, HOST_SIZE, MAX_PORTS, SERIAL_SIZE, SERVICE_SIZE, USBIP_PORT,
    USBIP_VERSION,
};
pub use error::{ProtocolError, Result};
pub use records::{ImportedDevice, PluginRequest, PortsStatus, UnplugRequest};
pub use status::{ErrorCode, OpStatus, Outcome, make_error, split_error};
pub use types::{DeviceSpeed, PortState};
