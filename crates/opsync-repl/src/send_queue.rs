//! Bounded FIFO of compressed replication blocks awaiting publication.
//!
//! The byte total covers queued jobs plus the job the sender is currently publishing; it drops
//! only once [`SendQueue::complete`] is called after a successful publish.

use crate::error::{ReplError, Result};
use crate::operation::ReplicableId;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::error;

/// One compressed block, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SendJob {
    /// Replicable every operation in the block belongs to.
    pub replicable_id: ReplicableId,
    /// Compressed frame as published on the topic.
    pub payload: Bytes,
    /// Type tag of each operation, in order.
    pub type_tags: Vec<&'static str>,
    /// Serialized size before compression.
    pub uncompressed_bytes: u64,
}

impl SendJob {
    /// Bytes the job occupies in the queue budget.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Number of operations in the block.
    pub fn operation_count(&self) -> usize {
        self.type_tags.len()
    }
}

/// Snapshot of send queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendQueueStats {
    /// Jobs waiting to be taken.
    pub queued_jobs: usize,
    /// Bytes queued or in flight.
    pub queued_bytes: u64,
    /// Configured byte budget.
    pub limit_bytes: u64,
    /// Jobs accepted since start.
    pub accepted_jobs: u64,
    /// Jobs rejected for exceeding the budget.
    pub rejected_jobs: u64,
    /// Bytes of rejected jobs.
    pub rejected_bytes: u64,
}

/// FIFO of [`SendJob`]s bounded by a byte budget.
pub struct SendQueue {
    jobs: Mutex<VecDeque<SendJob>>,
    queued_bytes: AtomicU64,
    limit_bytes: u64,
    available: Notify,
    accepted_jobs: AtomicU64,
    rejected_jobs: AtomicU64,
    rejected_bytes: AtomicU64,
}

impl SendQueue {
    /// Create an empty queue with the given byte budget.
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            queued_bytes: AtomicU64::new(0),
            limit_bytes,
            available: Notify::new(),
            accepted_jobs: AtomicU64::new(0),
            rejected_jobs: AtomicU64::new(0),
            rejected_bytes: AtomicU64::new(0),
        }
    }

    /// Append a job, or reject it if the byte budget would be exceeded.
    pub fn enqueue(&self, job: SendJob) -> Result<()> {
        let job_bytes = job.size();
        {
            let mut jobs = self.jobs.lock();
            let queued_bytes = self.queued_bytes.load(Ordering::Acquire);
            if queued_bytes + job_bytes > self.limit_bytes {
                drop(jobs);
                self.rejected_jobs.fetch_add(1, Ordering::Relaxed);
                self.rejected_bytes.fetch_add(job_bytes, Ordering::Relaxed);
                error!(
                    replicable = %job.replicable_id,
                    queued_bytes,
                    job_bytes,
                    limit_bytes = self.limit_bytes,
                    "send queue full, replication block dropped; replicas are now stale"
                );
                return Err(ReplError::QueueFull {
                    queued_bytes,
                    job_bytes,
                    limit_bytes: self.limit_bytes,
                });
            }
            self.queued_bytes.fetch_add(job_bytes, Ordering::AcqRel);
            jobs.push_back(job);
        }
        self.accepted_jobs.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        Ok(())
    }

    /// Remove the head job, waiting until one is available.
    ///
    /// Cancel-safe: a cancelled call never loses a job.
    pub async fn take(&self) -> SendJob {
        loop {
            if let Some(job) = self.try_take() {
                return job;
            }
            self.available.notified().await;
        }
    }

    /// Remove the head job if there is one.
    pub fn try_take(&self) -> Option<SendJob> {
        self.jobs.lock().pop_front()
    }

    /// Release the budget held by a job that was published.
    pub fn complete(&self, job: &SendJob) {
        self.queued_bytes.fetch_sub(job.size(), Ordering::AcqRel);
    }

    /// Drop every waiting job and release its budget. Returns the number dropped.
    pub fn clear(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let dropped: u64 = jobs.iter().map(SendJob::size).sum();
        let count = jobs.len();
        jobs.clear();
        self.queued_bytes.fetch_sub(dropped, Ordering::AcqRel);
        count
    }

    /// Jobs waiting to be taken.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Returns true if no job is waiting.
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Bytes queued or in flight.
    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Get a snapshot of current statistics.
    pub fn stats(&self) -> SendQueueStats {
        SendQueueStats {
            queued_jobs: self.len(),
            queued_bytes: self.queued_bytes(),
            limit_bytes: self.limit_bytes,
            accepted_jobs: self.accepted_jobs.load(Ordering::Relaxed),
            rejected_jobs: self.rejected_jobs.load(Ordering::Relaxed),
            rejected_bytes: self.rejected_bytes.load(Ordering::Relaxed),
        }
    }
}
