//! Virtual host controller
//!
//! [`Vhci`] owns the port table, the attached devices and the reconnect
//! supervisor. Attach reserves a port before connecting so the port is
//! never handed out twice, and gives it back if the connection fails.

use crate::device::DeviceContext;
use crate::persistent::{AttachTarget, BackoffPolicy, ReconnectSupervisor, parse_entries};
use crate::port_table::PortTable;
use crate::transport::{Connector, TcpConnector};
use common::{Error, Result};
use protocol::{ImportedDevice, PluginRequest, PortsStatus};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

pub struct Vhci<C = TcpConnector> {
    ports: PortTable,
    /// Owning references; the port table only holds weak ones.
    /// Lock order: `devices` before the port table.
    devices: Mutex<HashMap<i32, Arc<DeviceContext>>>,
    /// Set by `shutdown`; checked under `devices` before a device is plugged
    closed: AtomicBool,
    connector: C,
    supervisor: ReconnectSupervisor,
    backoff: BackoffPolicy,
}

impl<C: Connector> Vhci<C> {
    pub fn new(num_ports: usize, connector: C) -> Result<Self> {
        Ok(Self {
            ports: PortTable::new(num_ports)?,
            devices: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            connector,
            supervisor: ReconnectSupervisor::new(),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<i32, Arc<DeviceContext>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the device named by `req`
    ///
    /// On success the assigned port is returned and written to `req.port`;
    /// on failure `req.port` is 0 and any reserved port is free again.
    pub async fn plugin_hardware(&self, req: &mut PluginRequest) -> Result<i32> {
        req.port = 0;
        if self.is_closed() {
            return Err(closed_error());
        }
        req.validate()?;
        if req.host.is_empty() || req.service.is_empty() || req.busid.is_empty() {
            return Err(Error::Parameter(
                "host, service and bus-id are required".into(),
            ));
        }

        let port = self.ports.acquire_port().ok_or_else(|| {
            warn!("no free port for {}:{}/{}", req.host, req.service, req.busid);
            Error::PortFull
        })?;

        let device = match self.connector.connect(req).await {
            Ok(device) => device,
            Err(e) => {
                if let Err(re) = self.ports.release_port(port) {
                    debug!("port {} already released: {}", port, re);
                }
                return Err(e);
            }
        };

        let attached = {
            let mut devices = self.devices();
            if self.is_closed() {
                if let Err(re) = self.ports.release_port(port) {
                    debug!("port {} already released: {}", port, re);
                }
                Err(closed_error())
            } else {
                self.ports
                    .attach_device(port, &device)
                    .map(|()| devices.insert(port, Arc::clone(&device)))
            }
        };
        if let Err(e) = attached {
            device.close().await;
            return Err(e);
        }

        req.port = port;
        info!(
            "plugged {}:{}/{} on port {}",
            req.host, req.service, req.busid, port
        );
        Ok(port)
    }

    /// Detach the device on `port` and free the port
    pub async fn unplug_hardware(&self, port: i32) -> Result<()> {
        let device = {
            let mut devices = self.devices();
            let detached = self.ports.detach_and_release(port)?;
            devices.remove(&port).or(detached)
        };

        if let Some(device) = device {
            device.close().await;
        }
        info!("unplugged port {}", port);
        Ok(())
    }

    /// Plugged devices that fit an output buffer of `output_len` bytes
    pub fn get_imported_devices(&self, output_len: usize) -> Vec<ImportedDevice> {
        self.ports
            .get_imported_devices(ImportedDevice::capacity(output_len))
    }

    pub fn get_ports_status(&self) -> PortsStatus {
        self.ports.get_ports_status()
    }

    pub fn find_device(&self, port: i32) -> Option<Arc<DeviceContext>> {
        self.ports.find_device(port)
    }

    /// Stop the reconnect worker and detach every device
    ///
    /// Attaches still connecting free their own ports and are refused.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.supervisor.shutdown().await;

        let (unplugged, owned) = {
            let mut devices = self.devices();
            let unplugged = self.ports.mark_unplugged_all();
            (unplugged, std::mem::take(&mut *devices))
        };

        for device in owned.values() {
            device.close().await;
        }
        for (port, _) in &unplugged {
            if let Err(e) = self.ports.release_port(*port) {
                error!("failed to release port {}: {}", port, e);
            }
        }
        info!("controller shut down, {} devices detached", owned.len());
    }

    /// Replay persisted attach requests in the background
    ///
    /// Malformed lines are logged and skipped. Returns the number of entries
    /// handed to the worker; 0 if there was nothing to do or the worker
    /// could not start.
    pub fn plugin_persistent_devices<S: AsRef<str>>(self: &Arc<Self>, lines: &[S]) -> usize {
        let entries = parse_entries(lines);
        if entries.is_empty() {
            debug!("no persistent devices to plug");
            return 0;
        }

        let count = entries.len();
        match self
            .supervisor
            .launch(Arc::clone(self), entries, self.backoff)
        {
            Ok(()) => count,
            Err(e) => {
                warn!("persistent devices not plugged: {}", e);
                0
            }
        }
    }
}

fn closed_error() -> Error {
    Error::Request("controller is shut down".into())
}

impl<C: Connector> AttachTarget for Vhci<C> {
    fn attach(&self, request: &mut PluginRequest) -> impl Future<Output = Result<i32>> + Send {
        self.plugin_hardware(request)
    }

    fn max_entries(&self) -> usize {
        self.ports.num_ports()
    }
}

impl<C> std::fmt::Debug for Vhci<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vhci")
            .field("ports", &self.ports)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}
