//! Fixed sizes shared with the user-space tooling
//!
//! These widths are part of the control interface and must not change:
//! existing tools lay out their request buffers with exactly these values.

/// Default USB/IP service (TCP port) on the exporting host
pub const USBIP_PORT: &str = "3240";

/// USB/IP protocol version spoken by the exporting host (1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

/// Maximum device path width
pub const DEV_PATH_MAX: usize = 256;

/// Bus-id field width, terminator included
pub const BUS_ID_SIZE: usize = 32;

/// Host field width (NI_MAXHOST)
pub const HOST_SIZE: usize = 1025;

/// Service field width (NI_MAXSERV)
pub const SERVICE_SIZE: usize = 32;

/// Serial number field width
pub const SERIAL_SIZE: usize = 255;

/// Upper bound on the number of ports a controller may expose
pub const MAX_PORTS: usize = 255;
