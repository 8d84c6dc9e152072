//! Connection establishment to remote USB/IP servers

use crate::device::{DeviceContext, DeviceSummary};
use common::{Error, NetworkFailure, Result};
use protocol::PluginRequest;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Opens the transport for an attach request
///
/// Transport-establishment failures are reported as [`Error::Network`] so
/// the reconnect supervisor can tell them from permanent refusals.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        request: &PluginRequest,
    ) -> impl Future<Output = Result<Arc<DeviceContext>>> + Send;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CONNECT_TIMEOUT)
    }
}

/// `host:port` with IPv6 literals bracketed
fn target_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

async fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e.to_string());
            }
            Err(_) => {
                debug!("connect to {} timed out after {:?}", addr, timeout);
                last_err = Some(format!("timed out after {:?}", timeout));
            }
        }
    }
    Err(Error::network(
        NetworkFailure::Connect,
        last_err.unwrap_or_else(|| "no address to connect to".into()),
    ))
}

impl Connector for TcpConnector {
    async fn connect(&self, request: &PluginRequest) -> Result<Arc<DeviceContext>> {
        let port: u16 = request.service.parse().map_err(|_| {
            Error::Parameter(format!("service '{}' is not a port number", request.service))
        })?;
        let target = target_addr(&request.host, port);

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| Error::network(NetworkFailure::AddrInfo, format!("{}: {}", target, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::network(
                NetworkFailure::AddrInfo,
                format!("{}: no addresses", target),
            ));
        }

        let stream = connect_any(&addrs, self.connect_timeout).await?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::network(NetworkFailure::Network, e.to_string()))?;

        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let device = Arc::new(
            DeviceContext::new(DeviceSummary::from_request(request)).with_writer(Box::new(writer)),
        );
        device.spawn_receive_pump(reader);

        info!(
            "connected to {} ({:?}) for bus-id {}",
            target, peer, request.busid
        );
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_target_addr() {
        assert_eq!(target_addr("pi5", 3240), "pi5:3240");
        assert_eq!(target_addr("::1", 3240), "[::1]:3240");
        assert_eq!(target_addr("[::1]", 3240), "[::1]:3240");
    }

    #[tokio::test]
    async fn test_non_numeric_service_is_permanent() {
        let req = PluginRequest::new("localhost", "usbip", "1-1");
        let err = TcpConnector::default().connect(&req).await.unwrap_err();
        assert!(matches!(err, Error::Parameter(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_refused_connection_is_retryable() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let req = PluginRequest::new("127.0.0.1", port.to_string(), "1-1");
        let err = TcpConnector::default().connect(&req).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Network {
                kind: NetworkFailure::Connect,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connect_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"\x00\x00\x00\x03").await.unwrap();
            sock
        });

        let req = PluginRequest::new("127.0.0.1", port.to_string(), "1-1");
        let device = TcpConnector::default().connect(&req).await.unwrap();
        let _sock = server.await.unwrap();

        device.wait_for(4).await.unwrap();
        let mut dest = [0u8; 4];
        device.copy(&mut dest, 0, None).unwrap();
        assert_eq!(dest, [0, 0, 0, 3]);
        assert_eq!(device.summary().busid, "1-1");

        device.close().await;
    }
}
