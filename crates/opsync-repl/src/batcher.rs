//! Outbound batching of locally executed operations.
//!
//! Operations of one replicable accumulate in a single open batch that streams into a
//! compressing sink. The batch is closed and handed to the [`SendQueue`] when the delayed-flush
//! timer fires, when its serialized size exceeds the trigger, or when an operation of another
//! replicable arrives. One mutex guards the batch and the timer handle; broker I/O never happens
//! under it.

use crate::compression::{CompressingSink, CompressionConfig};
use crate::config::BatchingConfig;
use crate::error::Result;
use crate::operation::{ExecutedOperation, ReplicableId};
use crate::send_queue::{SendJob, SendQueue};
use crate::wire;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

/// Why a batch was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The delayed-flush timer fired.
    Timer,
    /// The serialized size exceeded the trigger.
    Size,
    /// An operation of a different replicable arrived.
    ReplicableSwitch,
    /// Flush requested explicitly.
    Explicit,
}

struct OpenBatch {
    replicable_id: ReplicableId,
    sink: CompressingSink,
    type_tags: Vec<&'static str>,
    uncompressed_bytes: usize,
}

struct FlushTimer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct BatchState {
    open: Option<OpenBatch>,
    timer: Option<FlushTimer>,
    next_generation: u64,
}

impl BatchState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

/// Internal stats with atomic fields for lock-free updates.
#[derive(Debug, Default)]
struct BatcherStatsInner {
    submitted_operations: AtomicU64,
    flushed_batches: AtomicU64,
    timer_flushes: AtomicU64,
    size_flushes: AtomicU64,
    switch_flushes: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_operations: AtomicU64,
    uncompressed_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

/// Counters of the outbound batcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatcherStats {
    /// Operations submitted.
    pub submitted_operations: u64,
    /// Batches handed to the send queue.
    pub flushed_batches: u64,
    /// Batches closed by the timer.
    pub timer_flushes: u64,
    /// Batches closed by the size trigger.
    pub size_flushes: u64,
    /// Batches closed by a replicable switch.
    pub switch_flushes: u64,
    /// Batches the send queue rejected.
    pub dropped_batches: u64,
    /// Operations in rejected batches.
    pub dropped_operations: u64,
    /// Serialized bytes of flushed batches before compression.
    pub uncompressed_bytes: u64,
    /// Bytes of flushed batches after compression.
    pub compressed_bytes: u64,
}

impl BatcherStats {
    /// Average compressed size of a flushed batch.
    pub fn average_batch_bytes(&self) -> f64 {
        if self.flushed_batches == 0 {
            0.0
        } else {
            self.compressed_bytes as f64 / self.flushed_batches as f64
        }
    }
}

struct BatcherShared {
    config: BatchingConfig,
    compression: CompressionConfig,
    queue: Arc<SendQueue>,
    runtime: Handle,
    state: Mutex<BatchState>,
    stats: BatcherStatsInner,
}

/// Accumulates operations into per-replicable batches.
#[derive(Clone)]
pub struct OutboundBatcher {
    shared: Arc<BatcherShared>,
}

impl OutboundBatcher {
    /// Create a batcher feeding `queue`. Flush timers are spawned on `runtime`.
    pub fn new(
        config: BatchingConfig,
        compression: CompressionConfig,
        queue: Arc<SendQueue>,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(BatcherShared {
                config,
                compression,
                queue,
                runtime,
                state: Mutex::new(BatchState::default()),
                stats: BatcherStatsInner::default(),
            }),
        }
    }

    /// Add one operation of `replicable_id` to the open batch.
    pub fn submit(&self, replicable_id: &ReplicableId, operation: &ExecutedOperation) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state
            .open
            .as_ref()
            .is_some_and(|open| &open.replicable_id != replicable_id)
        {
            shared.dispatch(&mut state, FlushReason::ReplicableSwitch);
        }

        if state.open.is_none() {
            let mut sink = CompressingSink::new(&shared.compression)?;
            let header_bytes = wire::write_header(&mut sink, replicable_id)?;
            state.open = Some(OpenBatch {
                replicable_id: replicable_id.clone(),
                sink,
                type_tags: Vec::new(),
                uncompressed_bytes: header_bytes,
            });
            if state.timer.is_none() {
                self.schedule_timer(&mut state);
            }
        }

        let appended = match state.open.as_mut() {
            Some(open) => match wire::write_operation(&mut open.sink, &operation.payload) {
                Ok(written) => {
                    open.type_tags.push(operation.type_tag);
                    open.uncompressed_bytes += written;
                    Ok(open.uncompressed_bytes)
                }
                Err(e) => Err(e),
            },
            None => Ok(0),
        };
        let batch_bytes = match appended {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some(open) = state.open.take() {
                    shared.record_drop(open.type_tags.len() as u64);
                }
                error!(replicable = %replicable_id, error = %e, "failed to append operation, batch discarded");
                return Err(e);
            }
        };

        if batch_bytes > shared.config.trigger_size_bytes {
            state.cancel_timer();
            shared.dispatch(&mut state, FlushReason::Size);
            info!(
                replicable = %replicable_id,
                batch_bytes,
                trigger_bytes = shared.config.trigger_size_bytes,
                "batch exceeded trigger size, flushed early"
            );
        }
        drop(state);

        let submitted = shared
            .stats
            .submitted_operations
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if submitted % shared.config.stats_log_interval.max(1) == 0 {
            let stats = self.stats();
            info!(
                submitted,
                batches = stats.flushed_batches,
                avg_ops_per_batch = submitted as f64 / stats.flushed_batches.max(1) as f64,
                avg_batch_bytes = stats.average_batch_bytes(),
                queued_bytes = shared.queue.queued_bytes(),
                "replication throughput"
            );
        }
        Ok(())
    }

    /// Close the open batch, if any, and hand it to the send queue.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        state.cancel_timer();
        self.shared.dispatch(&mut state, FlushReason::Explicit);
    }

    /// Discard the open batch and cancel the timer without sending.
    pub fn discard(&self) {
        let mut state = self.shared.state.lock();
        state.cancel_timer();
        state.open = None;
    }

    /// Returns true if a batch is open.
    pub fn has_open_batch(&self) -> bool {
        self.shared.state.lock().open.is_some()
    }

    /// Returns true if a delayed flush is scheduled.
    pub fn timer_pending(&self) -> bool {
        self.shared.state.lock().timer.is_some()
    }

    /// Get a snapshot of current statistics.
    pub fn stats(&self) -> BatcherStats {
        let s = &self.shared.stats;
        BatcherStats {
            submitted_operations: s.submitted_operations.load(Ordering::Relaxed),
            flushed_batches: s.flushed_batches.load(Ordering::Relaxed),
            timer_flushes: s.timer_flushes.load(Ordering::Relaxed),
            size_flushes: s.size_flushes.load(Ordering::Relaxed),
            switch_flushes: s.switch_flushes.load(Ordering::Relaxed),
            dropped_batches: s.dropped_batches.load(Ordering::Relaxed),
            dropped_operations: s.dropped_operations.load(Ordering::Relaxed),
            uncompressed_bytes: s.uncompressed_bytes.load(Ordering::Relaxed),
            compressed_bytes: s.compressed_bytes.load(Ordering::Relaxed),
        }
    }

    fn schedule_timer(&self, state: &mut BatchState) {
        let generation = state.next_generation;
        state.next_generation += 1;
        let weak: Weak<BatcherShared> = Arc::downgrade(&self.shared);
        let delay = self.shared.config.transmission_delay();
        let task = self.shared.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.flush_from_timer(generation);
            }
        });
        state.timer = Some(FlushTimer {
            generation,
            handle: task.abort_handle(),
        });
    }
}

impl BatcherShared {
    fn flush_from_timer(&self, generation: u64) {
        let mut state = self.state.lock();
        match &state.timer {
            Some(timer) if timer.generation == generation => state.timer = None,
            _ => {
                debug!(generation, "stale flush timer fired, nothing to do");
                return;
            }
        }
        self.dispatch(&mut state, FlushReason::Timer);
    }

    /// Finish the open batch and enqueue it. Runs under the batch lock so enqueue order equals
    /// production order.
    fn dispatch(&self, state: &mut BatchState, reason: FlushReason) {
        let Some(open) = state.open.take() else {
            return;
        };
        let operations = open.type_tags.len() as u64;
        let payload = match open.sink.finish() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                self.record_drop(operations);
                error!(replicable = %open.replicable_id, error = %e, "failed to compress batch, dropped");
                return;
            }
        };
        let job = SendJob {
            replicable_id: open.replicable_id,
            payload,
            type_tags: open.type_tags,
            uncompressed_bytes: open.uncompressed_bytes as u64,
        };
        let compressed = job.size();
        let uncompressed = job.uncompressed_bytes;
        debug!(
            replicable = %job.replicable_id,
            operations,
            uncompressed,
            compressed,
            ?reason,
            "batch flushed"
        );
        if self.queue.enqueue(job).is_err() {
            self.record_drop(operations);
            return;
        }
        match reason {
            FlushReason::Timer => self.stats.timer_flushes.fetch_add(1, Ordering::Relaxed),
            FlushReason::Size => self.stats.size_flushes.fetch_add(1, Ordering::Relaxed),
            FlushReason::ReplicableSwitch => {
                self.stats.switch_flushes.fetch_add(1, Ordering::Relaxed)
            }
            FlushReason::Explicit => 0,
        };
        self.stats.flushed_batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .uncompressed_bytes
            .fetch_add(uncompressed, Ordering::Relaxed);
        self.stats
            .compressed_bytes
            .fetch_add(compressed, Ordering::Relaxed);
    }

    fn record_drop(&self, operations: u64) {
        self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .dropped_operations
            .fetch_add(operations, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::decompress;
    use crate::wire::decode_message;
    use std::time::Duration;

    fn batcher(config: BatchingConfig, limit: u64) -> (OutboundBatcher, Arc<SendQueue>) {
        let queue = Arc::new(SendQueue::new(limit));
        let batcher = OutboundBatcher::new(
            config,
            CompressionConfig::default(),
            Arc::clone(&queue),
            Handle::current(),
        );
        (batcher, queue)
    }

    fn op(value: u8) -> ExecutedOperation {
        ExecutedOperation::new("Put", vec![value; 8])
    }

    fn decode(job: &SendJob) -> crate::wire::InboundMessage {
        decode_message(Bytes::from(decompress(&job.payload).unwrap())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_after_delay() {
        let (batcher, queue) = batcher(BatchingConfig::default(), 1 << 20);
        batcher.submit(&"r".into(), &op(1)).unwrap();
        batcher.submit(&"r".into(), &op(2)).unwrap();
        assert!(batcher.timer_pending());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let job = queue.try_take().unwrap();
        assert_eq!(job.type_tags, vec!["Put", "Put"]);
        assert_eq!(decode(&job).operations.len(), 2);
        assert!(!batcher.has_open_batch());
        assert!(!batcher.timer_pending());
        assert_eq!(batcher.stats().timer_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicable_switch_flushes_previous_batch() {
        let (batcher, queue) = batcher(BatchingConfig::default(), 1 << 20);
        batcher.submit(&"a".into(), &op(1)).unwrap();
        batcher.submit(&"b".into(), &op(2)).unwrap();
        batcher.submit(&"a".into(), &op(3)).unwrap();
        batcher.flush();

        let ids: Vec<_> = std::iter::from_fn(|| queue.try_take())
            .map(|job| decode(&job).replicable_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "a"]);
        assert_eq!(batcher.stats().switch_flushes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_immediately() {
        let config = BatchingConfig {
            trigger_size_bytes: 64,
            ..Default::default()
        };
        let (batcher, queue) = batcher(config, 1 << 20);
        let big = ExecutedOperation::new("Blob", vec![7u8; 100]);
        batcher.submit(&"r".into(), &big).unwrap();

        assert_eq!(queue.len(), 1);
        assert!(!batcher.timer_pending());
        assert!(!batcher.has_open_batch());
        assert_eq!(batcher.stats().size_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_is_noop() {
        let (batcher, queue) = batcher(BatchingConfig::default(), 1 << 20);
        batcher.submit(&"r".into(), &op(1)).unwrap();
        let stale = batcher.shared.state.lock().timer.as_ref().unwrap().generation;
        batcher.flush();
        batcher.submit(&"r".into(), &op(2)).unwrap();

        batcher.shared.flush_from_timer(stale);
        assert!(batcher.has_open_batch());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_batch_is_dropped_and_counted() {
        let (batcher, queue) = batcher(BatchingConfig::default(), 8);
        batcher.submit(&"r".into(), &op(1)).unwrap();
        batcher.flush();

        assert!(queue.is_empty());
        let stats = batcher.stats();
        assert_eq!(stats.dropped_batches, 1);
        assert_eq!(stats.dropped_operations, 1);
        assert_eq!(stats.flushed_batches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_drops_open_batch() {
        let (batcher, queue) = batcher(BatchingConfig::default(), 1 << 20);
        batcher.submit(&"r".into(), &op(1)).unwrap();
        batcher.discard();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_empty());
        assert!(!batcher.has_open_batch());
    }
}
