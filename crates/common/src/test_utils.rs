//! Test utilities for the virtual host controller
//!
//! Provides mock records and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_plugin_request;
//!
//! let req = create_mock_plugin_request(1);
//! assert_eq!(req.busid, "1-1");
//! assert_eq!(req.port, 0);
//! ```

use protocol::{PluginRequest, USBIP_PORT};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create an attach request for host `host{id}`, bus-id `1-{id}`
pub fn create_mock_plugin_request(id: u32) -> PluginRequest {
    PluginRequest::new(format!("host{}", id), USBIP_PORT, format!("1-{}", id))
}

/// Create `count` persisted lines in `host,service,busid` form
///
/// # Example
/// ```
/// use common::test_utils::create_mock_persistent_lines;
///
/// let lines = create_mock_persistent_lines(2);
/// assert_eq!(lines, vec!["host1,3240,1-1", "host2,3240,1-2"]);
/// ```
pub fn create_mock_persistent_lines(count: u32) -> Vec<String> {
    (1..=count)
        .map(|id| format!("host{},{},1-{}", id, USBIP_PORT, id))
        .collect()
}

/// Create mock stream data of specified size (`0, 1, 2, ..., 255, 0, ...`)
pub fn create_mock_stream_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Split `data` into consecutive chunks of the given lengths
///
/// # Panics
///
/// Panics if the lengths do not add up to `data.len()`.
pub fn split_into_segments(data: &[u8], lengths: &[usize]) -> Vec<Vec<u8>> {
    assert_eq!(
        lengths.iter().sum::<usize>(),
        data.len(),
        "segment lengths must cover the data"
    );

    let mut offset = 0;
    lengths
        .iter()
        .map(|len| {
            let chunk = data[offset..offset + len].to_vec();
            offset += len;
            chunk
        })
        .collect()
}

/// Run a future with a timeout
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// # #[tokio::main]
/// # async fn main() {
/// let value = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
/// assert_eq!(value, 42);
/// # }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
