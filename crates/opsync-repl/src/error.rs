//! Error types for the replication subsystem.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Broker transport error (connect, declare, publish, consume).
    #[error("broker error: {msg}")]
    Broker {
        /// Error message describing the transport issue.
        msg: String,
    },

    /// Registration, deregistration or initial-load request to the master failed.
    #[error("handshake with master failed: {msg}")]
    Handshake {
        /// Error message describing the failed request.
        msg: String,
    },

    /// Compression or decompression of a replication block failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// A replication message or snapshot stream is malformed.
    #[error("malformed replication data: {msg}")]
    Wire {
        /// What was wrong with the data.
        msg: String,
    },

    /// Writing or reading the snapshot of a replicable failed.
    #[error("snapshot error for replicable {replicable_id}: {msg}")]
    Snapshot {
        /// The replicable whose snapshot failed.
        replicable_id: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// A received operation could not be decoded or executed.
    /// The replica is no longer consistent with its master after this.
    #[error("failed to apply operation to replicable {replicable_id}: {msg}")]
    Apply {
        /// The replicable the operation was addressed to.
        replicable_id: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// The outbound send queue cannot take the job without exceeding its byte budget.
    #[error("outbound send queue full: {queued_bytes}B queued, job of {job_bytes}B exceeds limit of {limit_bytes}B")]
    QueueFull {
        /// Bytes currently queued or in flight.
        queued_bytes: u64,
        /// Size of the rejected job.
        job_bytes: u64,
        /// Configured byte budget.
        limit_bytes: u64,
    },

    /// No replicable with this ID is known locally.
    #[error("unknown replicable: {replicable_id}")]
    UnknownReplicable {
        /// The unknown replicable identifier.
        replicable_id: String,
    },

    /// No replica with this ID is registered.
    #[error("unknown replica: {replica_id}")]
    UnknownReplica {
        /// The unknown replica identifier.
        replica_id: Uuid,
    },

    /// This instance already replicates from a master.
    #[error("already replicating from {master}")]
    AlreadyReplicating {
        /// The master currently replicated from.
        master: String,
    },

    /// The bootstrap was stopped before the replica went live.
    #[error("bootstrap from {master} stopped before completion")]
    BootstrapStopped {
        /// The master the bootstrap was running against.
        master: String,
    },

    /// This instance is not replicating from any master.
    #[error("not replicating from any master")]
    NotReplicating,

    /// Invalid or unreadable configuration.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Error message describing the problem.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The replication service was shut down.
    #[error("replication service shut down")]
    Shutdown,
}

impl ReplError {
    pub(crate) fn broker(msg: impl Into<String>) -> Self {
        Self::Broker { msg: msg.into() }
    }

    pub(crate) fn wire(msg: impl Into<String>) -> Self {
        Self::Wire { msg: msg.into() }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;
