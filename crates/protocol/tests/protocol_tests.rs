//! Integration tests for the control interface records
//!
//! Checks the byte layout callers depend on and how malformed input is
//! rejected.

use protocol::{
    BUS_ID_SIZE, DeviceSpeed, ErrorCode, HOST_SIZE, ImportedDevice, OpStatus, Outcome,
    PluginRequest, PortState, PortsStatus, ProtocolError, SERIAL_SIZE, SERVICE_SIZE, UnplugRequest,
    make_error, split_error,
};

fn sample_device(port: i32) -> ImportedDevice {
    ImportedDevice {
        port,
        state: PortState::Plugged,
        speed: DeviceSpeed::Super,
        vendor: 0x046d,
        product: 0xc52b,
        devid: 0x0001_0002,
        busid: format!("3-{}", port),
        service: "3240".to_string(),
        host: "usbip.example.org".to_string(),
    }
}

mod layout {
    use super::*;

    #[test]
    fn test_plugin_request_layout() {
        let mut req = PluginRequest::new("pi5", "3240", "1-1.2");
        req.port = 3;
        let bytes = req.encode().unwrap();

        assert_eq!(bytes.len(), 4 + 4 + BUS_ID_SIZE + SERVICE_SIZE + HOST_SIZE + SERIAL_SIZE);
        assert_eq!(&bytes[0..4], &(PluginRequest::SIZE as u32).to_le_bytes());
        assert_eq!(&bytes[4..8], &3i32.to_le_bytes());
        assert_eq!(&bytes[8..13], b"1-1.2");
        assert_eq!(bytes[13], 0);

        let service = 8 + BUS_ID_SIZE;
        assert_eq!(&bytes[service..service + 4], b"3240");
        let host = service + SERVICE_SIZE;
        assert_eq!(&bytes[host..host + 3], b"pi5");
    }

    #[test]
    fn test_plugin_output_layout() {
        let mut req = PluginRequest::new("pi5", "3240", "1-1");
        req.port = 5;
        let out = req.encode_output().unwrap();

        assert_eq!(out.len(), PluginRequest::OUTPUT_SIZE);
        assert_eq!(&out[4..8], &5i32.to_le_bytes());
        assert_eq!(PluginRequest::decode_output(&out).unwrap(), 5);
    }

    #[test]
    fn test_unplug_request_layout() {
        let bytes = UnplugRequest { port: 9 }.encode().unwrap();
        assert_eq!(bytes, 9i32.to_le_bytes());
        assert_eq!(UnplugRequest::decode(&bytes).unwrap().port, 9);
    }

    #[test]
    fn test_imported_device_list() {
        let devices = vec![sample_device(1), sample_device(4)];
        let bytes = ImportedDevice::encode_list(&devices).unwrap();
        assert_eq!(bytes.len(), 2 * ImportedDevice::SIZE);

        let decoded = ImportedDevice::decode_list(&bytes).unwrap();
        assert_eq!(decoded, devices);
    }

    #[test]
    fn test_imported_device_capacity() {
        assert_eq!(ImportedDevice::capacity(0), 0);
        assert_eq!(ImportedDevice::capacity(ImportedDevice::SIZE - 1), 0);
        assert_eq!(ImportedDevice::capacity(3 * ImportedDevice::SIZE + 7), 3);
    }

    #[test]
    fn test_ports_status_layout() {
        let status = PortsStatus {
            ports: vec![PortState::Plugged, PortState::Free, PortState::Unplugging],
        };
        let bytes = status.encode().unwrap();

        assert_eq!(bytes.len(), PortsStatus::SIZE);
        assert_eq!(&bytes[..4], &[3, 2, 0, 3]);
        assert!(bytes[4..].iter().all(|b| *b == 0));

        let decoded = PortsStatus::decode(&bytes).unwrap();
        assert_eq!(decoded.state(1), Some(PortState::Plugged));
        assert_eq!(decoded.state(0), None);
        assert_eq!(decoded.state(4), None);
    }
}

mod rejection {
    use super::*;

    #[test]
    fn test_plugin_request_size_self_check() {
        let mut bytes = PluginRequest::new("pi5", "3240", "1-1").encode().unwrap();
        bytes[0..4].copy_from_slice(&100u32.to_le_bytes());

        assert!(matches!(
            PluginRequest::decode(&bytes),
            Err(ProtocolError::SizeMismatch { actual: 100, .. })
        ));
    }

    #[test]
    fn test_plugin_request_truncated() {
        let bytes = PluginRequest::new("pi5", "3240", "1-1").encode().unwrap();
        assert!(matches!(
            PluginRequest::decode(&bytes[..PluginRequest::SIZE - 1]),
            Err(ProtocolError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_unterminated_field() {
        let mut bytes = PluginRequest::new("pi5", "3240", "1-1").encode().unwrap();
        bytes[8..8 + BUS_ID_SIZE].fill(b'a');

        assert!(matches!(
            PluginRequest::decode(&bytes),
            Err(ProtocolError::Unterminated { field: "busid" })
        ));
    }

    #[test]
    fn test_oversized_field() {
        let req = PluginRequest::new("h".repeat(HOST_SIZE), "3240", "1-1");
        assert!(matches!(
            req.encode(),
            Err(ProtocolError::FieldTooLong { field: "host", .. })
        ));

        // One byte shorter leaves room for the terminator
        let req = PluginRequest::new("h".repeat(HOST_SIZE - 1), "3240", "1-1");
        assert!(req.encode().is_ok());
    }

    #[test]
    fn test_bad_port_state() {
        let mut bytes = PortsStatus {
            ports: vec![PortState::Free],
        }
        .encode()
        .unwrap();
        bytes[1] = 9;
        assert!(PortsStatus::decode(&bytes).is_err());
    }
}

mod status_codes {
    use super::*;

    #[test]
    fn test_status_takes_precedence() {
        let packed = make_error(ErrorCode::Network, OpStatus::DevBusy);
        assert_eq!(
            split_error(packed).unwrap(),
            Outcome::Status(OpStatus::DevBusy)
        );
    }

    #[test]
    fn test_error_when_status_ok() {
        let packed = make_error(ErrorCode::PortFull, OpStatus::Ok);
        assert!(packed < 0);
        assert_eq!(
            split_error(packed).unwrap(),
            Outcome::Error(ErrorCode::PortFull)
        );
    }

    #[test]
    fn test_zero_is_success() {
        assert_eq!(make_error(ErrorCode::None, OpStatus::Ok), 0);
        assert_eq!(split_error(0).unwrap(), Outcome::Error(ErrorCode::None));
    }
}
