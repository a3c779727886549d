//! Per-user traffic accounting.
//!
//! Relay tasks add wire byte counts as they go; one flush task periodically
//! drains the accumulated counters and hands them to a [`TrafficSink`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::Result;
use crate::proxy::TrafficHook;
use crate::server::metrics::ServerMetrics;

/// Bytes moved for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounter {
    /// Bytes read from the user's client
    pub bytes_up: u64,
    /// Bytes written to the user's client
    pub bytes_down: u64,
}

/// One line of a traffic report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    /// User the bytes belong to
    pub user_id: String,
    /// Bytes read from the user's clients
    pub bytes_up: u64,
    /// Bytes written to the user's clients
    pub bytes_down: u64,
}

/// Shared counter map, drained atomically.
#[derive(Default)]
pub struct TrafficAccumulator {
    counters: Mutex<HashMap<String, TrafficCounter>>,
}

impl TrafficAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to a user's counters.
    pub fn add(&self, user_id: &str, bytes_up: u64, bytes_down: u64) {
        if bytes_up == 0 && bytes_down == 0 {
            return;
        }

        let mut counters = self.counters.lock();
        match counters.get_mut(user_id) {
            Some(counter) => {
                counter.bytes_up += bytes_up;
                counter.bytes_down += bytes_down;
            }
            None => {
                counters.insert(
                    user_id.to_string(),
                    TrafficCounter {
                        bytes_up,
                        bytes_down,
                    },
                );
            }
        }
    }

    /// Current counters for a user.
    pub fn get(&self, user_id: &str) -> Option<TrafficCounter> {
        self.counters.lock().get(user_id).copied()
    }

    /// Number of users with pending counts.
    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.counters.lock().is_empty()
    }

    /// Take every pending counter, leaving the accumulator empty.
    ///
    /// Records come out sorted by user id.
    pub fn drain(&self) -> Vec<TrafficRecord> {
        let counters = std::mem::take(&mut *self.counters.lock());
        let mut batch: Vec<TrafficRecord> = counters
            .into_iter()
            .map(|(user_id, c)| TrafficRecord {
                user_id,
                bytes_up: c.bytes_up,
                bytes_down: c.bytes_down,
            })
            .collect();
        batch.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        batch
    }

    /// Merge a batch back, e.g. after its report failed.
    pub fn restore(&self, batch: Vec<TrafficRecord>) {
        for record in batch {
            self.add(&record.user_id, record.bytes_up, record.bytes_down);
        }
    }
}

/// Accounting hook for one session: one user's counters plus the aggregates.
pub struct UserTraffic {
    user_id: String,
    accumulator: Arc<TrafficAccumulator>,
    metrics: Arc<ServerMetrics>,
}

impl UserTraffic {
    /// Hook crediting `user_id` in `accumulator` and the aggregate byte counters.
    pub fn new(
        user_id: impl Into<String>,
        accumulator: Arc<TrafficAccumulator>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            accumulator,
            metrics,
        }
    }
}

impl TrafficHook for UserTraffic {
    fn add_up(&self, bytes: u64) {
        self.accumulator.add(&self.user_id, bytes, 0);
        self.metrics.add_bytes_received(bytes);
    }

    fn add_down(&self, bytes: u64) {
        self.accumulator.add(&self.user_id, 0, bytes);
        self.metrics.add_bytes_sent(bytes);
    }
}

/// Consumer of traffic reports.
#[async_trait]
pub trait TrafficSink: Send + Sync {
    /// Deliver one batch. On error the batch is kept for the next flush.
    async fn report(&self, batch: &[TrafficRecord]) -> Result<()>;
}

/// Writes each record to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl TrafficSink for LogSink {
    async fn report(&self, batch: &[TrafficRecord]) -> Result<()> {
        for record in batch {
            tracing::info!(
                user = %record.user_id,
                up = record.bytes_up,
                down = record.bytes_down,
                "traffic"
            );
        }
        Ok(())
    }
}

/// Drain the accumulator into `sink` once.
///
/// Returns the number of records delivered. Empty batches are not sent.
pub async fn flush_once(accumulator: &TrafficAccumulator, sink: &dyn TrafficSink) -> Result<usize> {
    let batch = accumulator.drain();
    if batch.is_empty() {
        return Ok(0);
    }

    match sink.report(&batch).await {
        Ok(()) => Ok(batch.len()),
        Err(e) => {
            accumulator.restore(batch);
            Err(e)
        }
    }
}

/// Flush every `interval` until `shutdown` fires, then flush one last time.
pub async fn run_flush_loop(
    accumulator: Arc<TrafficAccumulator>,
    sink: Arc<dyn TrafficSink>,
    metrics: Arc<ServerMetrics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match flush_once(&accumulator, sink.as_ref()).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Reported traffic for {} users", n),
            Err(e) => tracing::warn!("Traffic report failed, keeping counters: {}", e),
        }
        tracing::debug!("{}", metrics.format_report());
    }

    if let Err(e) = flush_once(&accumulator, sink.as_ref()).await {
        tracing::warn!("Final traffic report failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<TrafficRecord>>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TrafficSink for RecordingSink {
        async fn report(&self, batch: &[TrafficRecord]) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::roster("sink down"));
            }
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_same_user_merged() {
        let acc = TrafficAccumulator::new();
        acc.add("alice", 10, 0);
        acc.add("alice", 5, 7);
        acc.add("bob", 0, 3);
        acc.add("carol", 0, 0);

        let batch = acc.drain();
        assert_eq!(
            batch,
            vec![
                TrafficRecord {
                    user_id: "alice".into(),
                    bytes_up: 15,
                    bytes_down: 7
                },
                TrafficRecord {
                    user_id: "bob".into(),
                    bytes_up: 0,
                    bytes_down: 3
                },
            ]
        );
        assert!(acc.is_empty());
    }

    #[test]
    fn test_concurrent_adds_not_lost() {
        let acc = Arc::new(TrafficAccumulator::new());
        let drained = Arc::new(Mutex::new(0u64));

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let acc = Arc::clone(&acc);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        acc.add("u", 1, 0);
                    }
                })
            })
            .collect();

        let drainer = {
            let acc = Arc::clone(&acc);
            let drained = Arc::clone(&drained);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let sum: u64 = acc.drain().iter().map(|r| r.bytes_up).sum();
                    *drained.lock() += sum;
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        drainer.join().unwrap();

        let rest: u64 = acc.drain().iter().map(|r| r.bytes_up).sum();
        assert_eq!(*drained.lock() + rest, 8000);
    }

    #[test]
    fn test_user_traffic_hook() {
        let acc = Arc::new(TrafficAccumulator::new());
        let metrics = Arc::new(ServerMetrics::new());
        let hook = UserTraffic::new("alice", Arc::clone(&acc), Arc::clone(&metrics));

        hook.add_up(100);
        hook.add_down(40);

        assert_eq!(
            acc.get("alice"),
            Some(TrafficCounter {
                bytes_up: 100,
                bytes_down: 40
            })
        );
        assert_eq!(metrics.bytes_received(), 100);
        assert_eq!(metrics.bytes_sent(), 40);
    }

    #[tokio::test]
    async fn test_failed_report_is_restored() {
        let acc = TrafficAccumulator::new();
        let sink = RecordingSink::default();

        assert_eq!(flush_once(&acc, &sink).await.unwrap(), 0);
        assert!(sink.batches.lock().is_empty());

        acc.add("alice", 10, 20);
        sink.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(flush_once(&acc, &sink).await.is_err());

        acc.add("alice", 1, 1);
        sink.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(flush_once(&acc, &sink).await.unwrap(), 1);

        let batches = sink.batches.lock();
        assert_eq!(batches[0][0].bytes_up, 11);
        assert_eq!(batches[0][0].bytes_down, 21);
    }

    #[tokio::test]
    async fn test_flush_loop_final_flush() {
        let acc = Arc::new(TrafficAccumulator::new());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(false);

        acc.add("alice", 1, 2);
        let task = tokio::spawn(run_flush_loop(
            Arc::clone(&acc),
            sink.clone() as Arc<dyn TrafficSink>,
            Arc::new(ServerMetrics::new()),
            Duration::from_secs(3600),
            rx,
        ));

        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(sink.batches.lock().len(), 1);
        assert!(acc.is_empty());
    }
}
