//! Control request records
//!
//! Every record has a fixed size and a little-endian, unpadded layout:
//!
//! ```text
//! PluginRequest   [size: u32][port: i32][busid: 32][service: 32][host: 1025][serial: 255]
//! UnplugRequest   [port: i32]
//! ImportedDevice  [port: i32][state: u32][speed: u32][vendor: u16][product: u16][devid: u32]
//!                 [busid: 32][service: 32][host: 1025]
//! PortsStatus     [num_ports: u8][state: u8 * 255]
//! ```
//!
//! Port numbers are 1-based; 0 means "unassigned".

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::codec::{check_fixed_str, ensure_len, read_fixed_str, write_fixed_str};
use crate::consts::{BUS_ID_SIZE, HOST_SIZE, MAX_PORTS, SERIAL_SIZE, SERVICE_SIZE};
use crate::error::{ProtocolError, Result};
use crate::types::{DeviceSpeed, PortState};

/// Attach request
///
/// The caller fills host, service and bus-id; the controller writes the
/// assigned port back (0 if the attempt failed before a port was assigned).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PluginRequest {
    pub port: i32,
    pub busid: String,
    pub service: String,
    pub host: String,
    pub serial: String,
}

impl PluginRequest {
    /// Encoded record size, also the value of the leading size field
    pub const SIZE: usize = 4 + 4 + BUS_ID_SIZE + SERVICE_SIZE + HOST_SIZE + SERIAL_SIZE;

    /// Output written back to the caller: the size field followed by the port
    pub const OUTPUT_SIZE: usize = 8;

    pub fn new(host: impl Into<String>, service: impl Into<String>, busid: impl Into<String>) -> Self {
        Self {
            port: 0,
            busid: busid.into(),
            service: service.into(),
            host: host.into(),
            serial: String::new(),
        }
    }

    /// Check that every string fits its field
    pub fn validate(&self) -> Result<()> {
        check_fixed_str("busid", &self.busid, BUS_ID_SIZE)?;
        check_fixed_str("service", &self.service, SERVICE_SIZE)?;
        check_fixed_str("host", &self.host, HOST_SIZE)?;
        check_fixed_str("serial", &self.serial, SERIAL_SIZE)?;
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.write_u32::<LittleEndian>(Self::SIZE as u32)?;
        out.write_i32::<LittleEndian>(self.port)?;
        write_fixed_str(&mut out, "busid", &self.busid, BUS_ID_SIZE)?;
        write_fixed_str(&mut out, "service", &self.service, SERVICE_SIZE)?;
        write_fixed_str(&mut out, "host", &self.host, HOST_SIZE)?;
        write_fixed_str(&mut out, "serial", &self.serial, SERIAL_SIZE)?;
        debug_assert_eq!(out.len(), Self::SIZE);
        Ok(out)
    }

    /// Decode a request, enforcing the record-size self-check
    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let mut cursor = Cursor::new(buf);

        let size = cursor.read_u32::<LittleEndian>()? as usize;
        if size != Self::SIZE {
            return Err(ProtocolError::SizeMismatch {
                expected: Self::SIZE,
                actual: size,
            });
        }

        let port = cursor.read_i32::<LittleEndian>()?;
        let busid = read_fixed_str(&mut cursor, "busid", BUS_ID_SIZE)?;
        let service = read_fixed_str(&mut cursor, "service", SERVICE_SIZE)?;
        let host = read_fixed_str(&mut cursor, "host", HOST_SIZE)?;
        let serial = read_fixed_str(&mut cursor, "serial", SERIAL_SIZE)?;

        Ok(Self {
            port,
            busid,
            service,
            host,
            serial,
        })
    }

    /// Encode the `OUTPUT_SIZE`-byte reply carrying the assigned port
    pub fn encode_output(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::OUTPUT_SIZE);
        out.write_u32::<LittleEndian>(Self::SIZE as u32)?;
        out.write_i32::<LittleEndian>(self.port)?;
        Ok(out)
    }

    /// Read the assigned port from a reply produced by [`Self::encode_output`]
    pub fn decode_output(buf: &[u8]) -> Result<i32> {
        ensure_len(buf, Self::OUTPUT_SIZE)?;
        let mut cursor = Cursor::new(buf);
        cursor.read_u32::<LittleEndian>()?;
        Ok(cursor.read_i32::<LittleEndian>()?)
    }
}

/// Detach request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnplugRequest {
    pub port: i32,
}

impl UnplugRequest {
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.write_i32::<LittleEndian>(self.port)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let port = Cursor::new(buf).read_i32::<LittleEndian>()?;
        Ok(Self { port })
    }
}

/// One entry of the imported-devices enumeration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportedDevice {
    pub port: i32,
    pub state: PortState,
    pub speed: DeviceSpeed,
    pub vendor: u16,
    pub product: u16,
    pub devid: u32,
    pub busid: String,
    pub service: String,
    pub host: String,
}

impl ImportedDevice {
    pub const SIZE: usize = 4 + 4 + 4 + 2 + 2 + 4 + BUS_ID_SIZE + SERVICE_SIZE + HOST_SIZE;

    /// Number of records that fit an output buffer of `output_len` bytes
    pub const fn capacity(output_len: usize) -> usize {
        output_len / Self::SIZE
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_i32::<LittleEndian>(self.port)?;
        out.write_u32::<LittleEndian>(self.state as u32)?;
        out.write_u32::<LittleEndian>(self.speed as u32)?;
        out.write_u16::<LittleEndian>(self.vendor)?;
        out.write_u16::<LittleEndian>(self.product)?;
        out.write_u32::<LittleEndian>(self.devid)?;
        write_fixed_str(out, "busid", &self.busid, BUS_ID_SIZE)?;
        write_fixed_str(out, "service", &self.service, SERVICE_SIZE)?;
        write_fixed_str(out, "host", &self.host, HOST_SIZE)?;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let mut cursor = Cursor::new(buf);

        let port = cursor.read_i32::<LittleEndian>()?;
        let state = cursor.read_u32::<LittleEndian>()?;
        let state = u8::try_from(state)
            .map_err(|_| ProtocolError::InvalidValue {
                what: "port state",
                value: state.into(),
            })
            .and_then(PortState::try_from)?;
        let speed = DeviceSpeed::try_from(cursor.read_u32::<LittleEndian>()?)?;
        let vendor = cursor.read_u16::<LittleEndian>()?;
        let product = cursor.read_u16::<LittleEndian>()?;
        let devid = cursor.read_u32::<LittleEndian>()?;
        let busid = read_fixed_str(&mut cursor, "busid", BUS_ID_SIZE)?;
        let service = read_fixed_str(&mut cursor, "service", SERVICE_SIZE)?;
        let host = read_fixed_str(&mut cursor, "host", HOST_SIZE)?;

        Ok(Self {
            port,
            state,
            speed,
            vendor,
            product,
            devid,
            busid,
            service,
            host,
        })
    }

    /// Encode a list of records back to back
    pub fn encode_list(devices: &[ImportedDevice]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(devices.len() * Self::SIZE);
        for dev in devices {
            dev.encode_into(&mut out)?;
        }
        Ok(out)
    }

    /// Decode every whole record in `buf`
    pub fn decode_list(buf: &[u8]) -> Result<Vec<Self>> {
        buf.chunks_exact(Self::SIZE).map(Self::decode).collect()
    }
}

/// Snapshot of every port's state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortsStatus {
    pub ports: Vec<PortState>,
}

impl PortsStatus {
    pub const SIZE: usize = 1 + MAX_PORTS;

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    /// State of a 1-based port, `None` if out of range
    pub fn state(&self, port: i32) -> Option<PortState> {
        let idx = usize::try_from(port).ok()?.checked_sub(1)?;
        self.ports.get(idx).copied()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.ports.len() > MAX_PORTS {
            return Err(ProtocolError::InvalidValue {
                what: "port count",
                value: self.ports.len() as i64,
            });
        }

        let mut out = Vec::with_capacity(Self::SIZE);
        out.write_u8(self.ports.len() as u8)?;
        out.extend(self.ports.iter().map(|s| *s as u8));
        out.resize(Self::SIZE, 0);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let count = buf[0] as usize;
        let ports = buf[1..=count]
            .iter()
            .map(|b| PortState::try_from(*b))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes_are_fixed() {
        assert_eq!(PluginRequest::SIZE, 1352);
        assert_eq!(UnplugRequest::SIZE, 4);
        assert_eq!(ImportedDevice::SIZE, 1109);
        assert_eq!(PortsStatus::SIZE, 256);
    }

    #[test]
    fn test_plugin_request_layout() {
        let mut req = PluginRequest::new("server", "3240", "1-1.2");
        req.port = 3;
        let bytes = req.encode().unwrap();

        assert_eq!(bytes.len(), PluginRequest::SIZE);
        assert_eq!(&bytes[0..4], &(PluginRequest::SIZE as u32).to_le_bytes());
        assert_eq!(&bytes[4..8], &3i32.to_le_bytes());
        assert_eq!(&bytes[8..13], b"1-1.2");
        assert_eq!(bytes[13], 0);
        assert_eq!(&bytes[40..44], b"3240");
        assert_eq!(&bytes[72..78], b"server");

        assert_eq!(PluginRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_plugin_request_size_self_check() {
        let req = PluginRequest::new("h", "s", "b");
        let mut bytes = req.encode().unwrap();
        bytes[0..4].copy_from_slice(&8u32.to_le_bytes());

        let err = PluginRequest::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::SizeMismatch {
                expected: 1352,
                actual: 8
            }
        ));
    }

    #[test]
    fn test_plugin_request_short_buffer() {
        let err = PluginRequest::decode(&[0u8; 100]).unwrap_err();
        assert!(matches!(err, ProtocolError::BufferTooSmall { .. }));
    }

    #[test]
    fn test_busid_width_enforced() {
        let req = PluginRequest::new("h", "s", "x".repeat(BUS_ID_SIZE));
        assert!(req.validate().is_err());
        assert!(req.encode().is_err());

        let req = PluginRequest::new("h", "s", "x".repeat(BUS_ID_SIZE - 1));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_plugin_output_carries_port() {
        let mut req = PluginRequest::new("h", "s", "b");
        req.port = 7;
        let out = req.encode_output().unwrap();
        assert_eq!(out.len(), PluginRequest::OUTPUT_SIZE);
        assert_eq!(PluginRequest::decode_output(&out).unwrap(), 7);
    }

    #[test]
    fn test_imported_device_list() {
        let devices = vec![
            ImportedDevice {
                port: 1,
                state: PortState::Plugged,
                speed: DeviceSpeed::High,
                vendor: 0x1234,
                product: 0x5678,
                devid: 0x0001_0002,
                busid: "1-1".into(),
                service: "3240".into(),
                host: "pi5".into(),
            },
            ImportedDevice {
                port: 4,
                state: PortState::Plugged,
                busid: "2-1".into(),
                ..Default::default()
            },
        ];

        let bytes = ImportedDevice::encode_list(&devices).unwrap();
        assert_eq!(bytes.len(), 2 * ImportedDevice::SIZE);
        assert_eq!(ImportedDevice::decode_list(&bytes).unwrap(), devices);
    }

    #[test]
    fn test_imported_device_capacity() {
        assert_eq!(ImportedDevice::capacity(0), 0);
        assert_eq!(ImportedDevice::capacity(ImportedDevice::SIZE - 1), 0);
        assert_eq!(ImportedDevice::capacity(3 * ImportedDevice::SIZE + 10), 3);
    }

    #[test]
    fn test_ports_status_encoding() {
        let status = PortsStatus {
            ports: vec![PortState::Plugged, PortState::Free, PortState::Unplugging],
        };
        let bytes = status.encode().unwrap();
        assert_eq!(bytes.len(), PortsStatus::SIZE);
        assert_eq!(&bytes[..4], &[3, 2, 0, 3]);

        let decoded = PortsStatus::decode(&bytes).unwrap();
        assert_eq!(decoded.num_ports(), 3);
        assert_eq!(decoded.state(1), Some(PortState::Plugged));
        assert_eq!(decoded.state(3), Some(PortState::Unplugging));
        assert_eq!(decoded.state(0), None);
        assert_eq!(decoded.state(4), None);
        assert_eq!(decoded.state(-1), None);
    }
}
