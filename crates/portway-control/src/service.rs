//! Client service: registration, tunnel allocation, and removal
//!
//! Sole owner of the cross-entity invariants: client-id uniqueness,
//! auth-id exclusivity and server-wide local-port uniqueness. Compound
//! operations (register, allocate tunnels, terminate, force-delete) are
//! serialized on one lock; single-record reads and field updates rely on
//! the repository's per-id atomicity alone.

use crate::acl::TunnelAcl;
use crate::client::{Client, ClientConnection, Tunnel};
use crate::error::ControlError;
use crate::groups::ClientGroup;
use crate::ports::PortDistributor;
use crate::repository::{ClientFilter, ClientRepository};
use crate::user::User;
use chrono::{DateTime, Utc};
use portway_proto::{ConnectionRequest, Remote, UpdatesStatus};
use std::sync::{Arc, Mutex, MutexGuard};

/// Orchestrates the client registry and its port pool
pub struct ClientService {
    repo: Arc<ClientRepository>,
    /// Guards the invariant-bearing sequences (lookup, allocate, persist).
    /// Holding the guard also grants exclusive access to the distributor,
    /// so a refreshed busy snapshot cannot be observed by another caller.
    ports: Mutex<PortDistributor>,
}

impl ClientService {
    pub fn new(port_distributor: PortDistributor, repo: Arc<ClientRepository>) -> Self {
        Self {
            repo,
            ports: Mutex::new(port_distributor),
        }
    }

    pub fn repo(&self) -> &ClientRepository {
        &self.repo
    }

    pub fn count(&self) -> usize {
        self.repo.count()
    }

    pub fn count_active(&self) -> usize {
        self.repo.count_active()
    }

    pub fn count_disconnected(&self) -> usize {
        self.repo.count_disconnected()
    }

    pub fn get_by_id(&self, client_id: &str) -> Option<Client> {
        self.repo.get_by_id(client_id)
    }

    pub fn get_active_by_id(&self, client_id: &str) -> Option<Client> {
        self.repo.get_active_by_id(client_id)
    }

    pub fn get_all(&self) -> Vec<Client> {
        self.repo.get_all()
    }

    pub fn get_all_by_client_auth_id(&self, client_auth_id: &str) -> Vec<Client> {
        self.repo.get_all_by_client_auth_id(client_auth_id)
    }

    pub fn get_user_clients(&self, user: &dyn User, filters: &[ClientFilter]) -> Vec<Client> {
        self.repo.get_user_clients(user, filters)
    }

    /// Connected clients belonging to any of the given groups
    pub fn get_active_by_groups(&self, groups: &[ClientGroup]) -> Vec<Client> {
        if groups.is_empty() {
            return Vec::new();
        }
        self.repo
            .get_all_active()
            .into_iter()
            .filter(|c| c.belongs_to_one_of(groups))
            .collect()
    }

    /// Append each visible client's id to every group it belongs to, then
    /// sort each group's member list for deterministic output
    pub fn populate_groups_with_user_clients(&self, groups: &mut [ClientGroup], user: &dyn User) {
        let all = self.repo.get_user_clients(user, &[]);
        for client in &all {
            for group in groups.iter_mut() {
                if client.belongs_to(group) {
                    group.client_ids.push(client.id.clone());
                }
            }
        }
        for group in groups.iter_mut() {
            group.client_ids.sort();
        }
    }

    /// Register a newly connected agent
    ///
    /// Serialized with every other registration: id-uniqueness, auth-id
    /// exclusivity and port allocation all read-then-write shared registry
    /// state. Any tunnel-allocation failure aborts the whole registration
    /// with nothing persisted.
    pub fn start_client(
        &self,
        client_auth_id: &str,
        client_id: &str,
        connection: Arc<dyn ClientConnection>,
        allow_multiuse_creds: bool,
        req: &ConnectionRequest,
    ) -> Result<Client, ControlError> {
        let mut ports = self.lock_ports();

        let old_client = self.repo.get_by_id(client_id);
        if let Some(old) = &old_client {
            if old.is_connected() {
                return Err(ControlError::conflict(format!(
                    "client id {:?} is already in use",
                    client_id
                )));
            }
        }

        let mut remotes = req.remotes.clone();
        if let Some(old) = &old_client {
            let reestablish = tunnels_to_reestablish(&old.tunnels, &remotes);
            tracing::info!(
                client_id,
                requested = remotes.len(),
                reestablish = reestablish.len(),
                "Reconnect: merging tunnels held before disconnect"
            );
            remotes.extend(reestablish);
        }

        if !allow_multiuse_creds && self.is_client_auth_id_in_use(client_auth_id, client_id) {
            return Err(ControlError::conflict(format!(
                "client auth id {:?} is already in use by a connected client",
                client_auth_id
            )));
        }

        let address = connection.remote_addr().ip().to_string();

        let mut client =
            Client::from_request(client_id, client_auth_id, address, req, connection);
        if let Some(old) = old_client {
            // operationally meaningful state survives reconnect even
            // though tunnels are rebuilt fresh
            client.updates_status = old.updates_status;
        }

        self.start_tunnels_locked(&mut ports, &mut client, &remotes)?;

        self.repo.save(client.clone());
        tracing::info!(
            client_id,
            client_auth_id,
            tunnels = client.tunnels.len(),
            "Registered client"
        );
        Ok(client)
    }

    /// Add tunnels to an existing client (operator "add tunnels" path)
    pub fn start_client_tunnels(
        &self,
        client_id: &str,
        remotes: &[Remote],
    ) -> Result<Vec<Tunnel>, ControlError> {
        let mut ports = self.lock_ports();
        let mut client = self.get_existing_by_id(client_id)?;
        let tunnels = self.start_tunnels_locked(&mut ports, &mut client, remotes)?;
        self.repo.save(client);
        Ok(tunnels)
    }

    /// Handle a client disconnect according to the retention policy:
    /// hard-delete when retention is disabled, soft-delete otherwise.
    /// A record force-deleted concurrently is not resurrected.
    pub fn terminate(&self, client: &mut Client) -> Result<(), ControlError> {
        let _ports = self.lock_ports();

        if self.repo.keep_lost_clients().is_none() {
            tracing::info!(client_id = %client.id, "Client disconnected, retention disabled, deleting");
            client.connection = None;
            self.repo.delete(&client.id);
            return Ok(());
        }

        client.set_disconnected(Utc::now());

        if self.repo.get_by_id(&client.id).is_none() {
            tracing::debug!(client_id = %client.id, "Client was force-deleted, skipping save");
            return Ok(());
        }
        tracing::info!(client_id = %client.id, "Client disconnected, record retained");
        self.repo.save(client.clone());
        Ok(())
    }

    /// Operator-initiated removal regardless of connection state and
    /// retention policy; closes the live connection first if present
    pub fn force_delete(&self, client: &mut Client) -> Result<(), ControlError> {
        let _ports = self.lock_ports();
        if client.is_connected() {
            client.close();
        }
        tracing::info!(client_id = %client.id, "Force-deleted client");
        self.repo.delete(&client.id);
        Ok(())
    }

    /// Delete a disconnected client by id
    pub fn delete_offline(&self, client_id: &str) -> Result<(), ControlError> {
        let existing = self.get_existing_by_id(client_id)?;

        if existing.is_connected() {
            return Err(ControlError::bad_request(
                "client is active, should be disconnected",
            ));
        }

        self.repo.delete(client_id);
        tracing::info!(client_id, "Deleted offline client");
        Ok(())
    }

    /// Purge disconnected clients whose retention window elapsed.
    /// Returns the number of purged records.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let _ports = self.lock_ports();
        let expired = self.repo.get_all_expired(now);
        for client in &expired {
            self.repo.delete(&client.id);
        }
        if !expired.is_empty() {
            tracing::info!(purged = expired.len(), "Purged expired disconnected clients");
        }
        expired.len()
    }

    pub fn set_acl(
        &self,
        client_id: &str,
        allowed_user_groups: Vec<String>,
    ) -> Result<(), ControlError> {
        let mut existing = self.get_existing_by_id(client_id)?;
        existing.allowed_user_groups = allowed_user_groups;
        self.repo.save(existing);
        Ok(())
    }

    pub fn set_updates_status(
        &self,
        client_id: &str,
        updates_status: UpdatesStatus,
    ) -> Result<(), ControlError> {
        let mut existing = self.get_existing_by_id(client_id)?;
        existing.updates_status = Some(updates_status);
        self.repo.save(existing);
        Ok(())
    }

    /// Ok when the user may act on the given client
    pub fn check_client_access(&self, client_id: &str, user: &dyn User) -> Result<(), ControlError> {
        let existing = self.get_existing_by_id(client_id)?;
        self.check_clients_access(&[existing], user)
    }

    /// Ok when the user may act on all given clients; otherwise one
    /// Forbidden error naming every denied client id
    pub fn check_clients_access(
        &self,
        clients: &[Client],
        user: &dyn User,
    ) -> Result<(), ControlError> {
        if user.is_admin() {
            return Ok(());
        }

        let denied: Vec<&str> = clients
            .iter()
            .filter(|c| !c.has_access(user.groups()))
            .map(|c| c.id.as_str())
            .collect();

        if !denied.is_empty() {
            return Err(ControlError::forbidden(format!(
                "access denied to client(s) with id(s): {}",
                denied.join(", ")
            )));
        }
        Ok(())
    }

    fn lock_ports(&self) -> MutexGuard<'_, PortDistributor> {
        self.ports.lock().expect("client service lock poisoned")
    }

    /// True when another *connected* client holds the auth id
    fn is_client_auth_id_in_use(&self, client_auth_id: &str, client_id: &str) -> bool {
        self.repo
            .get_all_by_client_auth_id(client_auth_id)
            .iter()
            .any(|c| c.id != client_id && c.is_connected())
    }

    /// Allocate tunnels for the requested remotes, in request order.
    /// Fail-fast: the caller discards the whole client construction on
    /// error, so no rollback happens here.
    fn start_tunnels_locked(
        &self,
        ports: &mut PortDistributor,
        client: &mut Client,
        remotes: &[Remote],
    ) -> Result<Vec<Tunnel>, ControlError> {
        ports.refresh(self.repo.busy_ports());

        let mut tunnels = Vec::with_capacity(remotes.len());
        for requested in remotes {
            let mut remote = requested.clone();
            if !remote.is_local_specified() {
                let port = ports.random_port().map_err(|e| {
                    ControlError::internal(format!(
                        "failed to allocate port for tunnel to {}: {}",
                        remote.remote(),
                        e
                    ))
                })?;
                remote.local_host = Some("0.0.0.0".to_string());
                remote.local_port = Some(port.to_string());
                remote.local_port_random = true;
            } else {
                let port = check_local_port(ports, remote.local_port.as_deref().unwrap())?;
                ports.reserve(port);
            }

            let acl = match &remote.acl {
                Some(raw) => Some(TunnelAcl::parse(raw).map_err(|e| {
                    ControlError::internal(format!(
                        "failed to parse ACL for tunnel to {}: {}",
                        remote.remote(),
                        e
                    ))
                })?),
                None => None,
            };

            let tunnel = client
                .start_tunnel(remote, acl)
                .map_err(|e| ControlError::conflict(format!("can't create tunnel: {}", e)))?;
            tunnels.push(tunnel);
        }
        Ok(tunnels)
    }

    /// Non-optional lookup: empty id and missing record are distinct errors
    fn get_existing_by_id(&self, client_id: &str) -> Result<Client, ControlError> {
        if client_id.is_empty() {
            return Err(ControlError::bad_request("client id is empty"));
        }
        self.repo.get_by_id(client_id).ok_or_else(|| {
            ControlError::not_found(format!("client with id {:?} not found", client_id))
        })
    }
}

/// Remotes held before a disconnect that the new request does not already
/// cover, so a reconnecting agent gets its tunnels back without the
/// operator re-declaring them. Random-port tunnels are re-requested as
/// random so a fresh port is drawn.
pub fn tunnels_to_reestablish(old_tunnels: &[Tunnel], requested: &[Remote]) -> Vec<Remote> {
    let mut result = Vec::new();
    for tunnel in old_tunnels {
        let mut candidate = tunnel.remote.clone();
        if candidate.local_port_random {
            candidate.local_host = None;
            candidate.local_port = None;
            candidate.local_port_random = false;
        }
        let covered = requested
            .iter()
            .chain(result.iter())
            .any(|r| candidate.is_covered_by(r));
        if !covered {
            result.push(candidate);
        }
    }
    result
}

fn check_local_port(ports: &PortDistributor, port: &str) -> Result<u16, ControlError> {
    let local_port = port
        .parse::<u16>()
        .map_err(|_| ControlError::bad_request(format!("invalid local port {:?}", port)))?;

    if !ports.is_allowed(local_port) {
        return Err(ControlError::bad_request(format!(
            "local port {} is not among allowed ports",
            local_port
        )));
    }

    if ports.is_busy(local_port) {
        return Err(ControlError::conflict(format!(
            "local port {} already in use",
            local_port
        )));
    }

    Ok(local_port)
}
