//! In-memory client registry
//!
//! Concurrency-safe store of client entities keyed by client id, with
//! secondary lookup by auth id and access-narrowed queries for operators.
//! All operations are atomic per id; the service additionally serializes
//! the compound operations that span lookups and saves.

use crate::client::Client;
use crate::groups::wildcard_match;
use crate::user::User;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Client attribute a filter may target
///
/// An enumerated capability set: the API layer validates raw field names
/// against this before anything reaches the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterField {
    Name,
    Os,
    OsFullName,
    OsVersion,
    OsVirtualizationSystem,
    OsVirtualizationRole,
    CpuFamily,
    CpuModel,
    CpuModelName,
    Timezone,
    NumCpus,
    Hostname,
    Version,
    ClientAuthId,
    Address,
    Tags,
}

/// One validated filter predicate: values OR together, filters AND together
#[derive(Debug, Clone)]
pub struct ClientFilter {
    pub field: FilterField,
    /// Accepted values; `*` wildcards supported
    pub values: Vec<String>,
}

impl ClientFilter {
    pub fn new(field: FilterField, values: &[&str]) -> Self {
        Self {
            field,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// True when the client satisfies this predicate
    pub fn matches(&self, client: &Client) -> bool {
        let candidates: Vec<String> = match self.field {
            FilterField::Name => vec![client.name.clone()],
            FilterField::Os => vec![client.os.clone()],
            FilterField::OsFullName => vec![client.os_full_name.clone()],
            FilterField::OsVersion => vec![client.os_version.clone()],
            FilterField::OsVirtualizationSystem => vec![client.os_virtualization_system.clone()],
            FilterField::OsVirtualizationRole => vec![client.os_virtualization_role.clone()],
            FilterField::CpuFamily => vec![client.cpu_family.clone()],
            FilterField::CpuModel => vec![client.cpu_model.clone()],
            FilterField::CpuModelName => vec![client.cpu_model_name.clone()],
            FilterField::Timezone => vec![client.timezone.clone()],
            FilterField::NumCpus => vec![client.num_cpus.to_string()],
            FilterField::Hostname => vec![client.hostname.clone()],
            FilterField::Version => vec![client.version.clone()],
            FilterField::ClientAuthId => vec![client.client_auth_id.clone()],
            FilterField::Address => vec![client.address.clone()],
            FilterField::Tags => client.tags.clone(),
        };
        self.values
            .iter()
            .any(|pattern| candidates.iter().any(|c| wildcard_match(pattern, c)))
    }
}

/// Concurrency-safe registry of client entities keyed by client id
#[derive(Debug)]
pub struct ClientRepository {
    clients: RwLock<HashMap<String, Client>>,
    /// How long to retain disconnected clients; None deletes them
    /// immediately on disconnect
    keep_lost_clients: Option<Duration>,
}

impl ClientRepository {
    pub fn new(keep_lost_clients: Option<Duration>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            keep_lost_clients,
        }
    }

    pub fn keep_lost_clients(&self) -> Option<Duration> {
        self.keep_lost_clients
    }

    /// Insert-or-replace by client id
    pub fn save(&self, client: Client) {
        let mut clients = self.clients.write().unwrap();
        clients.insert(client.id.clone(), client);
    }

    /// Remove the record unconditionally
    pub fn delete(&self, client_id: &str) -> Option<Client> {
        let mut clients = self.clients.write().unwrap();
        clients.remove(client_id)
    }

    pub fn get_by_id(&self, client_id: &str) -> Option<Client> {
        let clients = self.clients.read().unwrap();
        clients.get(client_id).cloned()
    }

    /// Like `get_by_id` but only for connected clients
    pub fn get_active_by_id(&self, client_id: &str) -> Option<Client> {
        let clients = self.clients.read().unwrap();
        clients
            .get(client_id)
            .filter(|c| c.is_connected())
            .cloned()
    }

    /// All clients sorted by id for deterministic listings
    pub fn get_all(&self) -> Vec<Client> {
        let clients = self.clients.read().unwrap();
        let mut all: Vec<Client> = clients.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn get_all_active(&self) -> Vec<Client> {
        let clients = self.clients.read().unwrap();
        let mut active: Vec<Client> = clients
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    pub fn get_all_by_client_auth_id(&self, client_auth_id: &str) -> Vec<Client> {
        let clients = self.clients.read().unwrap();
        let mut matching: Vec<Client> = clients
            .values()
            .filter(|c| c.client_auth_id == client_auth_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching
    }

    /// Clients the given user may see, narrowed by the given filters
    pub fn get_user_clients(&self, user: &dyn User, filters: &[ClientFilter]) -> Vec<Client> {
        let mut visible = self.get_all();
        if !user.is_admin() {
            let groups = user.groups();
            visible.retain(|c| c.has_access(groups));
        }
        visible.retain(|c| filters.iter().all(|f| f.matches(c)));
        visible
    }

    /// Disconnected clients whose retention window has elapsed at `now`.
    /// Always empty when retention is disabled (those are deleted at
    /// disconnect time).
    pub fn get_all_expired(&self, now: DateTime<Utc>) -> Vec<Client> {
        let keep = match self.keep_lost_clients {
            Some(keep) => keep,
            None => return Vec::new(),
        };
        let clients = self.clients.read().unwrap();
        clients
            .values()
            .filter(|c| matches!(c.disconnected_at, Some(at) if at + keep < now))
            .cloned()
            .collect()
    }

    /// Local ports of all tunnels of connected clients
    pub fn busy_ports(&self) -> Vec<u16> {
        let clients = self.clients.read().unwrap();
        clients
            .values()
            .filter(|c| c.is_connected())
            .flat_map(|c| c.tunnels.iter().map(|t| t.local_port))
            .collect()
    }

    pub fn count(&self) -> usize {
        let clients = self.clients.read().unwrap();
        clients.len()
    }

    pub fn count_active(&self) -> usize {
        let clients = self.clients.read().unwrap();
        clients.values().filter(|c| c.is_connected()).count()
    }

    pub fn count_disconnected(&self) -> usize {
        let clients = self.clients.read().unwrap();
        clients.values().filter(|c| !c.is_connected()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::connected_client;
    use crate::user::StaticUser;

    fn disconnected_client(id: &str, auth_id: &str) -> Client {
        let mut client = connected_client(id, auth_id);
        client.set_disconnected(Utc::now());
        client
    }

    #[test]
    fn test_save_replaces_by_id() {
        let repo = ClientRepository::new(None);
        repo.save(connected_client("c1", "auth1"));
        let mut updated = connected_client("c1", "auth1");
        updated.name = "renamed".to_string();
        repo.save(updated);

        assert_eq!(repo.count(), 1);
        assert_eq!(repo.get_by_id("c1").unwrap().name, "renamed");
    }

    #[test]
    fn test_get_active_by_id() {
        let repo = ClientRepository::new(None);
        repo.save(connected_client("c1", "auth1"));
        repo.save(disconnected_client("c2", "auth2"));

        assert!(repo.get_active_by_id("c1").is_some());
        assert!(repo.get_active_by_id("c2").is_none());
        assert!(repo.get_by_id("c2").is_some());
    }

    #[test]
    fn test_get_all_sorted() {
        let repo = ClientRepository::new(None);
        repo.save(connected_client("c2", "auth"));
        repo.save(connected_client("c1", "auth"));

        let ids: Vec<String> = repo.get_all().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_counts() {
        let repo = ClientRepository::new(None);
        repo.save(connected_client("c1", "auth1"));
        repo.save(disconnected_client("c2", "auth2"));
        repo.save(disconnected_client("c3", "auth3"));

        assert_eq!(repo.count(), 3);
        assert_eq!(repo.count_active(), 1);
        assert_eq!(repo.count_disconnected(), 2);

        repo.delete("c2");
        assert_eq!(repo.count(), 2);
        assert_eq!(repo.count_disconnected(), 1);
    }

    #[test]
    fn test_get_all_by_client_auth_id() {
        let repo = ClientRepository::new(None);
        repo.save(connected_client("c1", "shared"));
        repo.save(disconnected_client("c2", "shared"));
        repo.save(connected_client("c3", "other"));

        let ids: Vec<String> = repo
            .get_all_by_client_auth_id("shared")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_user_clients_access_narrowing() {
        let repo = ClientRepository::new(None);
        let mut restricted = connected_client("c1", "auth1");
        restricted.allowed_user_groups = vec!["dba".to_string()];
        repo.save(restricted);
        repo.save(connected_client("c2", "auth2")); // unrestricted

        let admin = StaticUser::admin();
        assert_eq!(repo.get_user_clients(&admin, &[]).len(), 2);

        let dba = StaticUser::with_groups(&["dba"]);
        assert_eq!(repo.get_user_clients(&dba, &[]).len(), 2);

        let dev = StaticUser::with_groups(&["dev"]);
        let visible: Vec<String> = repo
            .get_user_clients(&dev, &[])
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(visible, vec!["c2"]);
    }

    #[test]
    fn test_user_clients_filtering() {
        let repo = ClientRepository::new(None);
        let mut linux = connected_client("c1", "auth1");
        linux.os_full_name = "Ubuntu 22.04".to_string();
        linux.tags.push("prod".to_string());
        repo.save(linux);
        let mut windows = connected_client("c2", "auth2");
        windows.os_full_name = "Windows Server 2022".to_string();
        repo.save(windows);

        let admin = StaticUser::admin();

        let filter = ClientFilter::new(FilterField::OsFullName, &["Ubuntu*"]);
        let visible = repo.get_user_clients(&admin, &[filter]);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "c1");

        // filters AND together
        let filters = vec![
            ClientFilter::new(FilterField::OsFullName, &["Ubuntu*"]),
            ClientFilter::new(FilterField::Tags, &["staging"]),
        ];
        assert!(repo.get_user_clients(&admin, &filters).is_empty());

        // values within one filter OR together
        let filter = ClientFilter::new(FilterField::OsFullName, &["Ubuntu*", "Windows*"]);
        assert_eq!(repo.get_user_clients(&admin, &[filter]).len(), 2);
    }

    #[test]
    fn test_expired_clients() {
        let repo = ClientRepository::new(Some(Duration::hours(1)));
        let mut stale = connected_client("c1", "auth1");
        stale.set_disconnected(Utc::now() - Duration::hours(2));
        repo.save(stale);
        let mut fresh = connected_client("c2", "auth2");
        fresh.set_disconnected(Utc::now() - Duration::minutes(5));
        repo.save(fresh);
        repo.save(connected_client("c3", "auth3"));

        let expired: Vec<String> = repo
            .get_all_expired(Utc::now())
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(expired, vec!["c1"]);
    }

    #[test]
    fn test_busy_ports_only_connected() {
        use crate::client::test_support::resolved_remote;

        let repo = ClientRepository::new(None);
        let mut active = connected_client("c1", "auth1");
        active
            .start_tunnel(resolved_remote("127.0.0.1", 5432, 20000), None)
            .unwrap();
        repo.save(active);

        let mut gone = connected_client("c2", "auth2");
        gone.start_tunnel(resolved_remote("127.0.0.1", 6379, 20001), None)
            .unwrap();
        gone.set_disconnected(Utc::now());
        repo.save(gone);

        assert_eq!(repo.busy_ports(), vec![20000]);
    }
}
