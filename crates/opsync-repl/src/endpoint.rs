//! Registration and initial-load handshake between a replica and its master.

use crate::descriptor::{MasterDescriptor, ReplicaDescriptor};
use crate::error::{ReplError, Result};
use crate::master::ReplicationMaster;
use crate::operation::ReplicableId;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Request/response side channel to a master.
#[async_trait]
pub trait MasterEndpoint: Send + Sync {
    /// Register this server as a replica of `replicable_ids`. Returns the replica ID.
    async fn register(
        &self,
        server_id: Uuid,
        version: &str,
        replicable_ids: &[ReplicableId],
    ) -> Result<Uuid>;

    /// Remove the registration of this server.
    async fn deregister(&self, server_id: Uuid) -> Result<()>;

    /// Ask the master to stream the snapshots of `replicable_ids`. Returns the queue name.
    async fn request_initial_load(&self, replicable_ids: &[ReplicableId]) -> Result<String>;
}

fn first_line(body: &str) -> Result<&str> {
    body.lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .ok_or_else(|| ReplError::Handshake {
            msg: "empty response from master".to_string(),
        })
}

fn joined(replicable_ids: &[ReplicableId]) -> String {
    replicable_ids
        .iter()
        .map(ReplicableId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Handshake over HTTP POST requests carrying the master's bearer token.
pub struct HttpMasterEndpoint {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpMasterEndpoint {
    /// Create an endpoint for `master`.
    pub fn new(master: &MasterDescriptor, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplError::Handshake { msg: e.to_string() })?;
        Ok(Self {
            client,
            base_url: master.endpoint_url.trim_end_matches('/').to_string(),
            bearer_token: master.bearer_token.clone(),
        })
    }

    async fn post(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let url = format!("{}/replication/{}", self.base_url, path);
        debug!(url = %url, "handshake request");
        let mut request = self.client.post(&url).query(query);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ReplError::Handshake { msg: e.to_string() })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReplError::Handshake {
                msg: format!("{} answered {}", url, status),
            });
        }
        response
            .text()
            .await
            .map_err(|e| ReplError::Handshake { msg: e.to_string() })
    }
}

#[async_trait]
impl MasterEndpoint for HttpMasterEndpoint {
    async fn register(
        &self,
        server_id: Uuid,
        version: &str,
        replicable_ids: &[ReplicableId],
    ) -> Result<Uuid> {
        let body = self
            .post(
                "register",
                &[
                    ("server", server_id.to_string()),
                    ("version", version.to_string()),
                    ("replicables", joined(replicable_ids)),
                ],
            )
            .await?;
        let line = first_line(&body)?;
        Uuid::parse_str(line).map_err(|e| ReplError::Handshake {
            msg: format!("invalid replica id {:?}: {}", line, e),
        })
    }

    async fn deregister(&self, server_id: Uuid) -> Result<()> {
        self.post("deregister", &[("server", server_id.to_string())])
            .await
            .map(|_| ())
    }

    async fn request_initial_load(&self, replicable_ids: &[ReplicableId]) -> Result<String> {
        let body = self
            .post("initial-load", &[("replicables", joined(replicable_ids))])
            .await?;
        first_line(&body).map(str::to_string)
    }
}

/// Handshake bound directly to a master in the same process.
pub struct LocalMasterEndpoint {
    master: ReplicationMaster,
    address: String,
}

impl LocalMasterEndpoint {
    /// Create an endpoint that registers replicas as coming from `address`.
    pub fn new(master: ReplicationMaster, address: &str) -> Self {
        Self {
            master,
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl MasterEndpoint for LocalMasterEndpoint {
    async fn register(
        &self,
        server_id: Uuid,
        version: &str,
        replicable_ids: &[ReplicableId],
    ) -> Result<Uuid> {
        let mut descriptor =
            ReplicaDescriptor::new(server_id, &self.address, version, replicable_ids.to_vec());
        if let Some(existing) = self.master.replica_for_server(&server_id) {
            descriptor.replica_id = existing.replica_id;
        }
        self.master.register_replica(descriptor).await
    }

    async fn deregister(&self, server_id: Uuid) -> Result<()> {
        let replica = self
            .master
            .replica_for_server(&server_id)
            .ok_or_else(|| ReplError::Handshake {
                msg: format!("server {} is not registered", server_id),
            })?;
        self.master.unregister_replica(&replica.replica_id).await?;
        Ok(())
    }

    async fn request_initial_load(&self, replicable_ids: &[ReplicableId]) -> Result<String> {
        self.master.serve_initial_load(replicable_ids).await
    }
}
