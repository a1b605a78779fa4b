use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::MemoryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    BytesProcessed,
    Threshold,
    Periodic,
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub reason: CleanupReason,
    pub released_bytes: u64,
    pub bytes_processed: u64,
}

pub type MemoryProbe = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

/// Free-list of read buffers shared by every output pump.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            capacity,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Returns a zeroed buffer of exactly `len` bytes.
    pub fn borrow(&self, len: usize) -> Vec<u8> {
        let mut buf = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity.max(len)));
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    pub fn give_back(&self, buf: Vec<u8>) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn retained_bytes(&self) -> u64 {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|buf| buf.capacity() as u64)
            .sum()
    }

    /// Releases every idle buffer and returns the capacity freed.
    fn drain(&self) -> u64 {
        let drained = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        drained.iter().map(|buf| buf.capacity() as u64).sum()
    }
}

/// Bounds heap growth caused by terminal streaming.
///
/// Pumps report throughput through [`MemorySafeguard::add_bytes_processed`];
/// a background loop spawned with [`MemorySafeguard::spawn`] drains the
/// buffer pool and resets the counters when memory use crosses the
/// configured threshold, when a periodic cleanup is due, or when a cleanup
/// was requested.
pub struct MemorySafeguard {
    config: MemoryConfig,
    pool: BufferPool,
    processed: AtomicU64,
    cleanups: AtomicU64,
    requests: mpsc::Sender<CleanupReason>,
    receiver: Mutex<Option<mpsc::Receiver<CleanupReason>>>,
    probe: MemoryProbe,
}

impl MemorySafeguard {
    pub fn new(config: MemoryConfig) -> Arc<Self> {
        Self::with_probe(config, Arc::new(resident_bytes))
    }

    pub fn with_probe(config: MemoryConfig, probe: MemoryProbe) -> Arc<Self> {
        let (requests, receiver) = mpsc::channel(1);
        let pool = BufferPool::new(config.pool_buffer_capacity, config.pool_max_idle);
        Arc::new(Self {
            config,
            pool,
            processed: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
            requests,
            receiver: Mutex::new(Some(receiver)),
            probe,
        })
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn bytes_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn cleanups(&self) -> u64 {
        self.cleanups.load(Ordering::Relaxed)
    }

    pub fn add_bytes_processed(&self, n: u64) {
        let total = self.processed.fetch_add(n, Ordering::Relaxed).saturating_add(n);
        if total > self.config.max_buffer_bytes {
            self.request_cleanup(CleanupReason::BytesProcessed);
        }
    }

    /// Queues a cleanup without waiting. Returns `false` when one is
    /// already pending or the loop is gone.
    pub fn request_cleanup(&self, reason: CleanupReason) -> bool {
        self.requests.try_send(reason).is_ok()
    }

    /// Current memory use: resident set size when available, otherwise
    /// the bytes held by the pool.
    pub fn memory_in_use(&self) -> u64 {
        (self.probe)().unwrap_or_else(|| self.pool.retained_bytes())
    }

    pub fn over_threshold(&self) -> bool {
        self.memory_in_use() > self.config.threshold_bytes()
    }

    pub fn force_cleanup(&self, reason: CleanupReason) -> CleanupReport {
        let released_bytes = self.pool.drain();
        let bytes_processed = self.processed.swap(0, Ordering::Relaxed);
        self.cleanups.fetch_add(1, Ordering::Relaxed);
        let report = CleanupReport {
            reason,
            released_bytes,
            bytes_processed,
        };
        match reason {
            CleanupReason::Threshold => warn!(?report, "memory threshold exceeded; cleaned up"),
            _ => debug!(?report, "memory cleanup"),
        }
        report
    }

    /// Starts the monitor loop. Only the first call spawns a task.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let safeguard = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(safeguard.config.check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_cleanup = Instant::now();
            info!(
                limit_bytes = safeguard.config.limit_bytes,
                threshold_bytes = safeguard.config.threshold_bytes(),
                "memory safeguard started"
            );
            loop {
                let reason = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if safeguard.over_threshold() {
                            Some(CleanupReason::Threshold)
                        } else if last_cleanup.elapsed() >= safeguard.config.periodic_cleanup() {
                            Some(CleanupReason::Periodic)
                        } else {
                            None
                        }
                    }
                    request = receiver.recv() => match request {
                        Some(reason) => Some(reason),
                        None => break,
                    },
                };
                if let Some(reason) = reason {
                    safeguard.force_cleanup(reason);
                    last_cleanup = Instant::now();
                }
            }
            debug!("memory safeguard stopped");
        }))
    }
}

impl std::fmt::Debug for MemorySafeguard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySafeguard")
            .field("limit_bytes", &self.config.limit_bytes)
            .field("bytes_processed", &self.bytes_processed())
            .field("cleanups", &self.cleanups())
            .field("idle_buffers", &self.pool.idle_count())
            .finish()
    }
}

/// Reads `VmRSS` from `/proc/self/status`. The kernel reports it in kB,
/// so the result does not depend on the page size.
#[cfg(target_os = "linux")]
fn resident_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

#[cfg(any(target_os = "linux", test))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find_map(|line| line.strip_prefix("VmRSS:"))?;
    let mut fields = line.split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") => Some(value.saturating_mul(1024)),
        _ => None,
    }
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes() -> Option<u64> {
    None
}
