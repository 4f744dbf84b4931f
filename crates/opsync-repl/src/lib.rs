#![warn(missing_docs)]

//! opsync replication: streams operations executed on a master to replicas over a pub/sub
//! broker, with an initial-load bootstrap that hands each replica a consistent snapshot before
//! live operations are applied.

pub mod batcher;
pub mod bootstrap;
pub mod broker;
pub mod compression;
pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod master;
pub mod memory_broker;
pub mod metrics;
pub mod operation;
pub mod receiver;
pub mod registry;
pub mod replicables;
pub mod send_queue;
pub mod sender;
pub mod status;
pub mod store;
pub mod wire;

pub use bootstrap::{BootstrapPhase, ReplicaClient};
pub use broker::{BrokerChannel, BrokerConnector, BrokerEndpoint, Subscription};
pub use config::ReplConfig;
pub use descriptor::{MasterDescriptor, ReplicaDescriptor};
pub use endpoint::{HttpMasterEndpoint, LocalMasterEndpoint, MasterEndpoint};
pub use error::{ReplError, Result};
pub use master::ReplicationMaster;
pub use memory_broker::MemoryBroker;
pub use operation::{ExecutedOperation, Operation, OperationListener, Replicable, ReplicableId};
pub use replicables::ReplicableRegistry;
pub use status::{MasterStatus, ReplicationStatus};
