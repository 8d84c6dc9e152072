//! Persistent device reconnection
//!
//! At startup the controller replays a persisted list of attach requests in
//! `host,service,busid` form. Requests that fail with a transient network
//! error are retried in rounds with a backoff that grows with the attempt
//! number and shrinks with the number of devices still pending. The
//! background worker stops when every entry is resolved or when it is told
//! to stop, and it can be stopped mid-sleep within one slice.

use common::{Error, Result};
use protocol::PluginRequest;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default backoff unit (seconds)
pub const DEFAULT_UNIT_SECS: u64 = 10;

/// Default backoff ceiling (seconds), half an hour
pub const DEFAULT_MAX_DELAY_SECS: u64 = 30 * 60;

/// Default stop-check granularity while sleeping (seconds)
pub const DEFAULT_SLICE_SECS: u64 = 5;

/// One persisted attach request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentDeviceEntry {
    pub host: String,
    pub service: String,
    pub busid: String,
    /// Port assigned by the last successful attach
    pub port: i32,
    /// Failed attempts so far
    pub attempts: u32,
}

impl PersistentDeviceEntry {
    pub fn to_request(&self) -> PluginRequest {
        PluginRequest::new(self.host.clone(), self.service.clone(), self.busid.clone())
    }
}

impl FromStr for PersistentDeviceEntry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::Parameter(format!("malformed persistent device '{}'", s));

        // The bus-id is everything after the second comma, commas included
        let (host, rest) = s.split_once(',').ok_or_else(malformed)?;
        let (service, busid) = rest.split_once(',').ok_or_else(malformed)?;

        if host.is_empty() || service.is_empty() || busid.is_empty() {
            return Err(malformed());
        }

        let entry = Self {
            host: host.to_string(),
            service: service.to_string(),
            busid: busid.to_string(),
            port: 0,
            attempts: 0,
        };
        entry.to_request().validate()?;
        Ok(entry)
    }
}

/// Parse persisted lines, dropping the malformed ones
pub fn parse_entries<S: AsRef<str>>(lines: &[S]) -> Vec<PersistentDeviceEntry> {
    lines
        .iter()
        .filter_map(|line| match line.as_ref().parse() {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("{}", e);
                None
            }
        })
        .collect()
}

/// Delay before a retry round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub unit: Duration,
    pub max_delay: Duration,
    /// Sleep granularity; the stop flag is checked between slices
    pub slice: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(DEFAULT_UNIT_SECS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            slice: Duration::from_secs(DEFAULT_SLICE_SECS),
        }
    }
}

impl BackoffPolicy {
    /// Delay before round `attempt` (0-based) with `cnt` devices pending
    ///
    /// The first two rounds run immediately; after that the delay is
    /// `unit * attempt / cnt`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32, cnt: usize) -> Duration {
        if attempt <= 1 || cnt == 0 {
            return Duration::ZERO;
        }
        let scaled = self.unit.saturating_mul(attempt) / cnt.min(u32::MAX as usize) as u32;
        scaled.min(self.max_delay)
    }
}

/// Backoff in whole seconds with the default policy
pub fn get_delay(attempt: u32, cnt: usize) -> u64 {
    BackoffPolicy::default().delay(attempt, cnt).as_secs()
}

/// Whether a failed attach should stay in the retry list
pub fn can_retry(err: &Error) -> bool {
    err.is_retryable()
}

/// Sleep for `delay` in `slice` steps, bailing out once `stop` is set
///
/// Returns `false` if the sleep was cut short.
pub async fn sleep_interruptible(delay: Duration, slice: Duration, stop: &AtomicBool) -> bool {
    let slice = if slice.is_zero() { delay } else { slice };
    let mut remaining = delay;

    while !remaining.is_zero() {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
    !stop.load(Ordering::Acquire)
}

/// Something persistent entries can be attached through
///
/// Implemented by the controller; the worker submits every request through
/// the same attach path a user-space caller would.
pub trait AttachTarget: Send + Sync + 'static {
    fn attach(&self, request: &mut PluginRequest) -> impl Future<Output = Result<i32>> + Send;

    /// Upper bound on entries tried per round
    fn max_entries(&self) -> usize;
}

/// Attach one entry; `true` once it needs no further attempts
async fn plugin_entry<T: AttachTarget>(target: &T, entry: &mut PersistentDeviceEntry) -> bool {
    let mut req = entry.to_request();
    match target.attach(&mut req).await {
        Ok(port) => {
            entry.port = port;
            info!(
                "persistent device {}:{}/{} plugged on port {}",
                entry.host, entry.service, entry.busid, port
            );
            true
        }
        Err(e) if can_retry(&e) => {
            entry.attempts += 1;
            debug!(
                "persistent device {}:{}/{} attempt {} failed: {}",
                entry.host, entry.service, entry.busid, entry.attempts, e
            );
            false
        }
        Err(e) => {
            warn!(
                "persistent device {}:{}/{} dropped: {}",
                entry.host, entry.service, entry.busid, e
            );
            true
        }
    }
}

/// Run retry rounds until the list drains or `stop` is set
///
/// Returns the entries still pending.
pub async fn replay<T: AttachTarget>(
    target: &T,
    mut entries: Vec<PersistentDeviceEntry>,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
) -> Vec<PersistentDeviceEntry> {
    let mut attempt: u32 = 0;

    while !stop.load(Ordering::Acquire) {
        let cnt = entries.len().min(target.max_entries());
        if cnt == 0 {
            break;
        }

        let delay = policy.delay(attempt, cnt);
        if !delay.is_zero() {
            debug!(
                "round {}: {} devices pending, sleeping {:?}",
                attempt, cnt, delay
            );
            if !sleep_interruptible(delay, policy.slice, stop).await {
                break;
            }
        }

        let mut i = 0;
        let mut pending = cnt;
        while i < pending && !stop.load(Ordering::Acquire) {
            if plugin_entry(target, &mut entries[i]).await {
                entries.remove(i);
                pending -= 1;
            } else {
                i += 1;
            }
        }

        attempt = attempt.saturating_add(1);
    }

    entries
}

type WorkerSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

/// Owner of the background reconnect worker
///
/// At most one worker is registered at a time. The worker clears its own
/// registration when it finishes; [`shutdown`](Self::shutdown) sets the stop
/// flag and waits for a still-registered worker to exit.
#[derive(Debug, Default)]
pub struct ReconnectSupervisor {
    stop: Arc<AtomicBool>,
    worker: WorkerSlot,
}

impl ReconnectSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Start replaying `entries` against `target` in the background
    ///
    /// Refused while a worker is registered or when no runtime is available.
    pub fn launch<T: AttachTarget>(
        &self,
        target: Arc<T>,
        entries: Vec<PersistentDeviceEntry>,
        policy: BackoffPolicy,
    ) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Resource(format!("cannot start reconnect worker: {}", e)))?;

        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::Request("reconnect worker already running".into()));
        }

        self.stop.store(false, Ordering::Release);
        let stop = Arc::clone(&self.stop);
        let worker = Arc::clone(&self.worker);
        let count = entries.len();

        // The slot stays locked until the handle is stored, so the worker
        // cannot clear it first
        *slot = Some(runtime.spawn(async move {
            let pending = replay(&*target, entries, &policy, &stop).await;
            if !pending.is_empty() {
                info!("reconnect worker stopped with {} devices pending", pending.len());
            }
            drop(target);

            let registered = worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .is_some();
            debug!("reconnect worker exited (registered: {})", registered);
        }));

        info!("reconnect worker started for {} devices", count);
        Ok(())
    }

    /// Ask the worker to stop without waiting
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the worker and wait for it to exit
    pub async fn shutdown(&self) {
        self.stop();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("reconnect worker failed: {}", e);
            }
        }
    }
}
