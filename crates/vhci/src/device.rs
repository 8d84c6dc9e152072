//! Per-device context
//!
//! Owns the connection to the remote USB/IP server for one attached device:
//! the inbound stream buffer fed by the receive pump, the write half used to
//! send requests, and the cached summary reported by enumeration.

use crate::locked_buffer::{AccessMode, BufferChain, LockOperation, Lockable, LockedBuffer, MemoryKind};
use crate::stream_buffer::{CopyCursor, InboundStreamBuffer, Segment};
use bytes::BytesMut;
use common::{Error, NetworkFailure, Result};
use protocol::{DeviceSpeed, ImportedDevice, PluginRequest, PortState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Receive chunk reserved per read
const RECV_CHUNK: usize = 64 * 1024;

/// Write half of the device connection
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What enumeration reports about an attached device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceSummary {
    pub host: String,
    pub service: String,
    pub busid: String,
    pub speed: DeviceSpeed,
    pub vendor: u16,
    pub product: u16,
    pub devid: u32,
}

impl DeviceSummary {
    pub fn from_request(req: &PluginRequest) -> Self {
        Self {
            host: req.host.clone(),
            service: req.service.clone(),
            busid: req.busid.clone(),
            ..Self::default()
        }
    }

    pub fn to_imported(&self, port: i32, state: PortState) -> ImportedDevice {
        ImportedDevice {
            port,
            state,
            speed: self.speed,
            vendor: self.vendor,
            product: self.product,
            devid: self.devid,
            busid: self.busid.clone(),
            service: self.service.clone(),
            host: self.host.clone(),
        }
    }
}

pub struct DeviceContext {
    summary: DeviceSummary,
    stream: Mutex<InboundStreamBuffer>,
    data_ready: Notify,
    closed: AtomicBool,
    writer: tokio::sync::Mutex<Option<TransportWriter>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceContext {
    pub fn new(summary: DeviceSummary) -> Self {
        Self {
            summary,
            stream: Mutex::new(InboundStreamBuffer::new()),
            data_ready: Notify::new(),
            closed: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    pub fn with_writer(self, writer: TransportWriter) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            ..self
        }
    }

    pub fn summary(&self) -> &DeviceSummary {
        &self.summary
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `f` with the stream buffer locked
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut InboundStreamBuffer) -> R) -> R {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stream)
    }

    pub fn buffered(&self) -> usize {
        self.with_stream(|s| s.size())
    }

    /// Append received data and wake waiters
    pub fn push_segment(&self, segment: Segment) {
        self.with_stream(|s| s.push(segment));
        self.data_ready.notify_waiters();
    }

    pub fn copy(
        &self,
        dest: &mut [u8],
        offset: usize,
        cursor: Option<&CopyCursor>,
    ) -> Result<CopyCursor> {
        self.with_stream(|s| s.copy(dest, offset, cursor))
    }

    pub fn release(&self, len: usize) -> Result<()> {
        self.with_stream(|s| s.release(len))
    }

    /// Wait until at least `len` bytes are buffered
    ///
    /// Fails once the connection is closed with less than `len` bytes left.
    pub async fn wait_for(&self, len: usize) -> Result<()> {
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let available = self.buffered();
            if available >= len {
                return Ok(());
            }
            if self.is_closed() {
                return Err(Error::network(
                    NetworkFailure::Network,
                    format!(
                        "connection to {} closed with {} of {} bytes buffered",
                        self.summary.host, available, len
                    ),
                ));
            }
            notified.await;
        }
    }

    /// Send a header and optional payload as one transfer
    ///
    /// Both ranges stay locked until the write completes.
    pub async fn send(&self, header: &[u8], payload: &[u8]) -> Result<()> {
        let mut chain = BufferChain::new();
        chain.push(LockedBuffer::from_slice(MemoryKind::Paged, header));
        if !payload.is_empty() {
            chain.push(LockedBuffer::from_slice(MemoryKind::Paged, payload));
        }

        chain.prepare(LockOperation::Read, AccessMode::Kernel)?;
        let result = self.write_chain(&chain).await;
        chain.unprepare();
        result
    }

    async fn write_chain(&self, chain: &BufferChain<'_>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            Error::network(NetworkFailure::Network, "device connection is closed")
        })?;

        for buffer in chain.iter() {
            let bytes = buffer
                .as_slice()
                .ok_or_else(|| Error::Parameter("buffer is not prepared".into()))?;
            writer
                .write_all(bytes)
                .await
                .map_err(|e| Error::network(NetworkFailure::Network, e.to_string()))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| Error::network(NetworkFailure::Network, e.to_string()))?;

        trace!("sent {} bytes to {}", chain.total_len(), self.summary.host);
        Ok(())
    }

    /// Start feeding the stream buffer from `reader`
    ///
    /// The pump holds only a weak reference; it stops on EOF, on a read
    /// error, or once the device is dropped.
    pub fn spawn_receive_pump<R>(self: &Arc<Self>, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let device = Arc::downgrade(self);
        let handle = tokio::spawn(receive_pump(device, reader));

        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.data_ready.notify_waiters();
    }

    /// Tear the connection down
    pub async fn close(&self) {
        self.mark_closed();

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("shutdown of {} failed: {}", self.summary.host, e);
            }
        }
        debug!("device {}/{} closed", self.summary.host, self.summary.busid);
    }
}

async fn receive_pump<R>(device: Weak<DeviceContext>, mut reader: R)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = BytesMut::with_capacity(RECV_CHUNK);
    loop {
        buf.reserve(RECV_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("peer closed connection");
                break;
            }
            Ok(n) => {
                let Some(dev) = device.upgrade() else {
                    return;
                };
                dev.push_segment(buf.split().freeze());
                trace!("received {} bytes, {} buffered", n, dev.buffered());
            }
            Err(e) => {
                warn!("receive failed: {}", e);
                break;
            }
        }
    }

    if let Some(dev) = device.upgrade() {
        dev.mark_closed();
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("summary", &self.summary)
            .field("buffered", &self.buffered())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_plugin_request, with_timeout};
    use std::time::Duration;

    fn device() -> Arc<DeviceContext> {
        let req = create_mock_plugin_request(1);
        Arc::new(DeviceContext::new(DeviceSummary::from_request(&req)))
    }

    #[test]
    fn test_summary_from_request() {
        let req = create_mock_plugin_request(3);
        let summary = DeviceSummary::from_request(&req);
        assert_eq!(summary.host, "host3");
        assert_eq!(summary.busid, "1-3");

        let imported = summary.to_imported(2, PortState::Plugged);
        assert_eq!(imported.port, 2);
        assert_eq!(imported.service, "3240");
    }

    #[test]
    fn test_push_copy_release() {
        let dev = device();
        dev.push_segment(Bytes::from_static(b"abc"));
        dev.push_segment(Bytes::from_static(b"defg"));

        let mut dest = [0u8; 5];
        dev.copy(&mut dest, 1, None).unwrap();
        assert_eq!(&dest, b"bcdef");

        dev.release(3).unwrap();
        assert_eq!(dev.buffered(), 4);
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_push() {
        let dev = device();
        let waiter = {
            let dev = Arc::clone(&dev);
            tokio::spawn(async move { dev.wait_for(6).await })
        };

        dev.push_segment(Bytes::from_static(b"abc"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        dev.push_segment(Bytes::from_static(b"def"));

        with_timeout(DEFAULT_TEST_TIMEOUT, waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_fails_after_close() {
        let dev = device();
        dev.push_segment(Bytes::from_static(b"ab"));
        dev.close().await;

        let err = dev.wait_for(4).await.unwrap_err();
        assert!(err.is_retryable());
        // Already buffered data can still be drained
        dev.wait_for(2).await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_pump_feeds_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(client);

        let req = create_mock_plugin_request(1);
        let dev = Arc::new(
            DeviceContext::new(DeviceSummary::from_request(&req)).with_writer(Box::new(writer)),
        );
        dev.spawn_receive_pump(reader);

        server.write_all(b"hello world").await.unwrap();
        with_timeout(DEFAULT_TEST_TIMEOUT, dev.wait_for(11))
            .await
            .unwrap()
            .unwrap();

        let mut dest = [0u8; 11];
        dev.copy(&mut dest, 0, None).unwrap();
        assert_eq!(&dest, b"hello world");

        dev.send(b"hdr:", b"payload").await.unwrap();
        let mut echoed = [0u8; 11];
        server.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hdr:payload");

        drop(server);
        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            while !dev.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let dev = device();
        let err = dev.send(b"hdr", b"").await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }
}
