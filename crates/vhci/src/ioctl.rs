//! Control interface dispatch
//!
//! Decodes the fixed-size request records, runs the matching controller
//! operation and encodes the reply. Failures carry an [`Error`] whose
//! [`code`](Error::code) is what the caller sees.

use crate::controller::Vhci;
use crate::transport::Connector;
use common::{Error, Result};
use protocol::{ImportedDevice, OpStatus, PluginRequest, PortsStatus, UnplugRequest, make_error};
use tracing::debug;

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_READ_WRITE_DATA: u32 = 0x3;

const fn ctl_code(function: u32) -> u32 {
    (FILE_DEVICE_UNKNOWN << 16) | (FILE_READ_WRITE_DATA << 14) | (function << 2) | METHOD_BUFFERED
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoctlCode {
    PluginHardware,
    UnplugHardware,
    GetImportedDevices,
    GetPortsStatus,
}

impl IoctlCode {
    pub const fn code(self) -> u32 {
        match self {
            Self::PluginHardware => ctl_code(0x800),
            Self::UnplugHardware => ctl_code(0x801),
            Self::GetImportedDevices => ctl_code(0x802),
            Self::GetPortsStatus => ctl_code(0x803),
        }
    }
}

impl TryFrom<u32> for IoctlCode {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        [
            Self::PluginHardware,
            Self::UnplugHardware,
            Self::GetImportedDevices,
            Self::GetPortsStatus,
        ]
        .into_iter()
        .find(|c| c.code() == code)
        .ok_or_else(|| Error::Parameter(format!("unknown control code {:#x}", code)))
    }
}

fn ensure_output(output_len: usize, needed: usize) -> Result<()> {
    if output_len < needed {
        return Err(Error::Parameter(format!(
            "output buffer of {} bytes, need {}",
            output_len, needed
        )));
    }
    Ok(())
}

/// Run one control request
///
/// `output_len` is the size of the caller's output buffer; the reply never
/// exceeds it.
pub async fn dispatch<C: Connector>(
    vhci: &Vhci<C>,
    code: IoctlCode,
    input: &[u8],
    output_len: usize,
) -> Result<Vec<u8>> {
    debug!(
        "{:?}: input {} bytes, output {} bytes",
        code,
        input.len(),
        output_len
    );

    match code {
        IoctlCode::PluginHardware => {
            ensure_output(output_len, PluginRequest::OUTPUT_SIZE)?;
            let mut req = PluginRequest::decode(input)?;
            vhci.plugin_hardware(&mut req).await?;
            Ok(req.encode_output()?)
        }
        IoctlCode::UnplugHardware => {
            let req = UnplugRequest::decode(input)?;
            vhci.unplug_hardware(req.port).await?;
            Ok(Vec::new())
        }
        IoctlCode::GetImportedDevices => {
            let devices = vhci.get_imported_devices(output_len);
            Ok(ImportedDevice::encode_list(&devices)?)
        }
        IoctlCode::GetPortsStatus => {
            ensure_output(output_len, PortsStatus::SIZE)?;
            Ok(vhci.get_ports_status().encode()?)
        }
    }
}

/// Completion status for a dispatch result: 0 or a packed error
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => make_error(e.code(), OpStatus::Ok),
    }
}
