//! Client and tunnel entities
//!
//! A `Client` is the live state of one registered agent: its descriptor
//! fields, its active tunnels and, while connected, the transport handle.
//! Tunnels are owned by exactly one client and rebuilt on reconnect.

use crate::acl::TunnelAcl;
use crate::groups::ClientGroup;
use chrono::{DateTime, Utc};
use portway_proto::{ConnectionRequest, Remote, UpdatesStatus};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Opaque handle to an agent's live transport connection
///
/// The client exclusively owns its handle while connected and releases it
/// on `close`/disconnect. Implementations must make `close` idempotent.
pub trait ClientConnection: Send + Sync + std::fmt::Debug {
    fn remote_addr(&self) -> SocketAddr;
    fn close(&self);
}

#[derive(Debug, Error)]
pub enum TunnelStartError {
    #[error("tunnel to {0} with the same local port already exists")]
    DuplicateTunnel(String),

    #[error("local port {0} is used by another tunnel of this client")]
    LocalPortInUse(u16),

    #[error("remote {0} has no resolved local port")]
    UnresolvedLocalPort(String),
}

/// One active port-forward owned by a client
#[derive(Debug, Clone, Serialize)]
pub struct Tunnel {
    /// Unique tunnel id within the server
    pub id: String,
    /// Remote spec with the local side resolved
    pub remote: Remote,
    /// Resolved local listening port
    pub local_port: u16,
    /// Optional peer allow-list, parsed once at creation
    #[serde(skip)]
    pub acl: Option<TunnelAcl>,
}

/// Identity and live state of one registered agent
#[derive(Debug, Clone, Serialize)]
pub struct Client {
    pub id: String,
    pub client_auth_id: String,
    pub name: String,
    pub os: String,
    pub os_arch: String,
    pub os_family: String,
    pub os_kernel: String,
    pub os_full_name: String,
    pub os_version: String,
    pub os_virtualization_system: String,
    pub os_virtualization_role: String,
    pub hostname: String,
    pub cpu_family: String,
    pub cpu_model: String,
    pub cpu_model_name: String,
    pub cpu_vendor: String,
    pub num_cpus: u32,
    pub mem_total: u64,
    pub timezone: String,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    pub tags: Vec<String>,
    pub version: String,
    /// Host component of the agent's transport address
    pub address: String,
    /// Active tunnels in creation order
    pub tunnels: Vec<Tunnel>,
    /// None while connected; set when the agent drops
    pub disconnected_at: Option<DateTime<Utc>>,
    /// User groups allowed to manage this client; empty means unrestricted
    pub allowed_user_groups: Vec<String>,
    /// OS update status, carried over across reconnects
    pub updates_status: Option<UpdatesStatus>,
    /// Live transport handle, present iff connected
    #[serde(skip)]
    pub connection: Option<Arc<dyn ClientConnection>>,
}

impl Client {
    /// Build a freshly connected client from an agent's connection request
    pub fn from_request(
        id: impl Into<String>,
        client_auth_id: impl Into<String>,
        address: impl Into<String>,
        req: &ConnectionRequest,
        connection: Arc<dyn ClientConnection>,
    ) -> Self {
        Self {
            id: id.into(),
            client_auth_id: client_auth_id.into(),
            name: req.name.clone(),
            os: req.os.clone(),
            os_arch: req.os_arch.clone(),
            os_family: req.os_family.clone(),
            os_kernel: req.os_kernel.clone(),
            os_full_name: req.os_full_name.clone(),
            os_version: req.os_version.clone(),
            os_virtualization_system: req.os_virtualization_system.clone(),
            os_virtualization_role: req.os_virtualization_role.clone(),
            hostname: req.hostname.clone(),
            cpu_family: req.cpu_family.clone(),
            cpu_model: req.cpu_model.clone(),
            cpu_model_name: req.cpu_model_name.clone(),
            cpu_vendor: req.cpu_vendor.clone(),
            num_cpus: req.num_cpus,
            mem_total: req.mem_total,
            timezone: req.timezone.clone(),
            ipv4: req.ipv4.clone(),
            ipv6: req.ipv6.clone(),
            tags: req.tags.clone(),
            version: req.version.clone(),
            address: address.into(),
            tunnels: Vec::new(),
            disconnected_at: None,
            allowed_user_groups: Vec::new(),
            updates_status: None,
            connection: Some(connection),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// True when this client matches the group's membership rule
    pub fn belongs_to(&self, group: &ClientGroup) -> bool {
        group.matches(self)
    }

    pub fn belongs_to_one_of(&self, groups: &[ClientGroup]) -> bool {
        groups.iter().any(|g| self.belongs_to(g))
    }

    /// True when a user with the given groups may manage this client.
    /// A client with no group restriction is open to everyone.
    pub fn has_access(&self, user_groups: &[String]) -> bool {
        self.allowed_user_groups.is_empty()
            || self
                .allowed_user_groups
                .iter()
                .any(|g| user_groups.contains(g))
    }

    /// Validate a resolved remote against already-held tunnels, then
    /// construct and append the tunnel.
    ///
    /// Expects the remote's local side to be resolved (the service fills
    /// in random ports before calling this).
    pub fn start_tunnel(
        &mut self,
        remote: Remote,
        acl: Option<TunnelAcl>,
    ) -> Result<Tunnel, TunnelStartError> {
        let local_port = remote
            .local_port
            .as_deref()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| TunnelStartError::UnresolvedLocalPort(remote.remote()))?;

        for held in &self.tunnels {
            if held.local_port == local_port {
                if held.remote.same_target(&remote) {
                    return Err(TunnelStartError::DuplicateTunnel(remote.remote()));
                }
                return Err(TunnelStartError::LocalPortInUse(local_port));
            }
        }

        let tunnel = Tunnel {
            id: uuid::Uuid::new_v4().to_string(),
            remote,
            local_port,
            acl,
        };
        tracing::debug!(
            client_id = %self.id,
            tunnel_id = %tunnel.id,
            local_port,
            remote = %tunnel.remote.remote(),
            "Started tunnel"
        );
        self.tunnels.push(tunnel.clone());
        Ok(tunnel)
    }

    /// Release the live connection handle; safe to call more than once
    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            tracing::debug!(client_id = %self.id, "Closing client connection");
            conn.close();
        }
    }

    /// Mark the client disconnected and release the handle
    pub fn set_disconnected(&mut self, at: DateTime<Utc>) {
        self.disconnected_at = Some(at);
        self.connection = None;
    }
}
