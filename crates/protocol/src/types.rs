//! USB and port type definitions used in the control records

use crate::error::{ProtocolError, Result};

/// USB device speed
///
/// Wire values follow the kernel's `usb_device_speed` numbering.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceSpeed {
    /// Not reported yet
    #[default]
    Unknown = 0,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low = 1,
    /// Full speed - 12 Mbps (USB 1.1)
    Full = 2,
    /// High speed - 480 Mbps (USB 2.0)
    High = 3,
    /// Wireless USB
    Wireless = 4,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super = 5,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus = 6,
}

impl TryFrom<u32> for DeviceSpeed {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Unknown,
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            _ => {
                return Err(ProtocolError::InvalidValue {
                    what: "device speed",
                    value: value.into(),
                });
            }
        })
    }
}

/// Lifecycle state of one virtual port
///
/// ```text
/// Free ──acquire──> Acquiring ──attach──> Plugged ──mark_unplugged──> Unplugging
///   ^                   │                    │                            │
///   └──────────────────release───────────────┴────────────────────────────┘
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PortState {
    #[default]
    Free = 0,
    /// Reserved by an attach that has not completed yet
    Acquiring = 1,
    Plugged = 2,
    /// Device teardown in progress; the index stays reserved
    Unplugging = 3,
}

impl TryFrom<u8> for PortState {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Free,
            1 => Self::Acquiring,
            2 => Self::Plugged,
            3 => Self::Unplugging,
            _ => {
                return Err(ProtocolError::InvalidValue {
                    what: "port state",
                    value: value.into(),
                });
            }
        })
    }
}
