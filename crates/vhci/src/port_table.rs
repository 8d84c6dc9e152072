//! Root hub port table
//!
//! Fixed-size table of root hub ports, numbered 1..=N. Each port moves
//! through a four-state lifecycle:
//!
//! ```text
//!   Free --acquire--> Acquiring --attach--> Plugged --mark_unplugged--> Unplugging
//!    ^                    |                                                |
//!    +------release-------+-------------------release---------------------+
//! ```
//!
//! A port holds a weak reference to its device exactly while it is Plugged;
//! the controller owns the device itself. Allocation scans for the lowest
//! free port under the table's write lock, so concurrent attaches never get
//! the same port.

use crate::device::{DeviceContext, DeviceSummary};
use common::{Error, Result};
use protocol::{ImportedDevice, MAX_PORTS, PortState, PortsStatus};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Port {
    state: PortState,
    /// Set exactly while Plugged
    device: Option<Weak<DeviceContext>>,
    /// Cached for enumeration, kept until the port is released
    summary: Option<DeviceSummary>,
}

impl Port {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// `port` is a valid 1-based index into a table of `num_ports`
pub fn is_valid_port(port: i32, num_ports: usize) -> bool {
    port > 0 && (port as usize) <= num_ports
}

#[derive(Debug)]
pub struct PortTable {
    num_ports: usize,
    ports: RwLock<Vec<Port>>,
}

impl PortTable {
    /// Create a table of `num_ports` free ports
    pub fn new(num_ports: usize) -> Result<Self> {
        if num_ports == 0 || num_ports > MAX_PORTS {
            return Err(Error::Parameter(format!(
                "port count {} outside 1..={}",
                num_ports, MAX_PORTS
            )));
        }

        let ports = (0..num_ports).map(|_| Port::default()).collect();
        Ok(Self {
            num_ports,
            ports: RwLock::new(ports),
        })
    }

    pub fn num_ports(&self) -> usize {
        self.num_ports
    }

    pub fn is_valid_port(&self, port: i32) -> bool {
        is_valid_port(port, self.num_ports)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Port>> {
        self.ports.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Port>> {
        self.ports.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn index(&self, port: i32) -> Result<usize> {
        if self.is_valid_port(port) {
            Ok(port as usize - 1)
        } else {
            Err(Error::Parameter(format!(
                "port {} outside 1..={}",
                port, self.num_ports
            )))
        }
    }

    /// Reserve the lowest free port
    ///
    /// Returns `None` when every port is in use.
    pub fn acquire_port(&self) -> Option<i32> {
        let mut ports = self.write();
        let idx = ports.iter().position(|p| p.state == PortState::Free)?;
        ports[idx].state = PortState::Acquiring;

        let port = idx as i32 + 1;
        trace!("acquired port {}", port);
        Some(port)
    }

    /// Return a port to Free from any other state
    pub fn release_port(&self, port: i32) -> Result<()> {
        let idx = self.index(port)?;
        let mut ports = self.write();
        let entry = &mut ports[idx];

        if entry.state == PortState::Free {
            return Err(Error::Parameter(format!("port {} is not in use", port)));
        }

        trace!("released port {} from {:?}", port, entry.state);
        entry.reset();
        Ok(())
    }

    /// Bind a device to an Acquiring port, making it Plugged
    pub fn attach_device(&self, port: i32, device: &Arc<DeviceContext>) -> Result<()> {
        let idx = self.index(port)?;
        let mut ports = self.write();
        let entry = &mut ports[idx];

        if entry.state != PortState::Acquiring {
            return Err(Error::Parameter(format!(
                "port {} is {:?}, expected Acquiring",
                port, entry.state
            )));
        }

        entry.state = PortState::Plugged;
        entry.device = Some(Arc::downgrade(device));
        entry.summary = Some(device.summary().clone());
        debug!("port {} plugged: {}", port, device.summary().busid);
        Ok(())
    }

    /// Start a detach: Plugged becomes Unplugging
    ///
    /// Returns the device that was bound, if it is still alive. Repeating
    /// the call on an Unplugging port changes nothing and returns `None`.
    pub fn mark_unplugged(&self, port: i32) -> Result<Option<Arc<DeviceContext>>> {
        let idx = self.index(port)?;
        let mut ports = self.write();
        let entry = &mut ports[idx];

        match entry.state {
            PortState::Plugged => {
                entry.state = PortState::Unplugging;
                Ok(entry.device.take().and_then(|w| w.upgrade()))
            }
            PortState::Unplugging => Ok(None),
            state => Err(Error::Parameter(format!(
                "port {} is {:?}, nothing to unplug",
                port, state
            ))),
        }
    }

    /// Move every Plugged port to Unplugging
    ///
    /// Returns the ports and their still-live devices.
    pub fn mark_unplugged_all(&self) -> Vec<(i32, Option<Arc<DeviceContext>>)> {
        let mut ports = self.write();
        ports
            .iter_mut()
            .enumerate()
            .filter(|(_, p)| p.state == PortState::Plugged)
            .map(|(idx, p)| {
                p.state = PortState::Unplugging;
                (idx as i32 + 1, p.device.take().and_then(|w| w.upgrade()))
            })
            .collect()
    }

    /// Detach whatever is on `port` and free it in one step
    ///
    /// Fails with [`Error::NoDevice`] if no device was ever attached: a Free
    /// port, or an Acquiring one whose attach is still in flight and owns it.
    pub fn detach_and_release(&self, port: i32) -> Result<Option<Arc<DeviceContext>>> {
        let idx = self.index(port)?;
        let mut ports = self.write();
        let entry = &mut ports[idx];

        if matches!(entry.state, PortState::Free | PortState::Acquiring) {
            return Err(Error::NoDevice { port });
        }

        let device = entry.device.take().and_then(|w| w.upgrade());
        debug!("port {} released from {:?}", port, entry.state);
        entry.reset();
        Ok(device)
    }

    pub fn state(&self, port: i32) -> Result<PortState> {
        let idx = self.index(port)?;
        Ok(self.read()[idx].state)
    }

    /// Device bound to a Plugged port
    pub fn find_device(&self, port: i32) -> Option<Arc<DeviceContext>> {
        let idx = self.index(port).ok()?;
        self.read()[idx].device.as_ref()?.upgrade()
    }

    pub fn get_ports_status(&self) -> PortsStatus {
        PortsStatus {
            ports: self.read().iter().map(|p| p.state).collect(),
        }
    }

    /// Plugged ports in port order, at most `limit` of them
    pub fn get_imported_devices(&self, limit: usize) -> Vec<ImportedDevice> {
        self.read()
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == PortState::Plugged)
            .filter_map(|(idx, p)| {
                let summary = p.summary.as_ref()?;
                Some(summary.to_imported(idx as i32 + 1, p.state))
            })
            .take(limit)
            .collect()
    }

    pub fn get_plugged_count(&self) -> usize {
        self.count(|s| s == PortState::Plugged)
    }

    /// Ports with a device bound or still tearing one down
    pub fn get_device_count(&self) -> usize {
        self.count(|s| matches!(s, PortState::Plugged | PortState::Unplugging))
    }

    fn count(&self, pred: impl Fn(PortState) -> bool) -> usize {
        self.read().iter().filter(|p| pred(p.state)).count()
    }
}
