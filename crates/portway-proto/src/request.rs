//! Agent hello payload
//!
//! The first message an agent sends after the transport handshake. Carries
//! the machine descriptor used for filtering/display and the list of
//! tunnels the agent wants established.

use crate::remote::Remote;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection request sent by an agent when it registers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub os_arch: String,
    #[serde(default)]
    pub os_family: String,
    #[serde(default)]
    pub os_kernel: String,
    #[serde(default)]
    pub os_full_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub os_virtualization_system: String,
    #[serde(default)]
    pub os_virtualization_role: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub cpu_family: String,
    #[serde(default)]
    pub cpu_model: String,
    #[serde(default)]
    pub cpu_model_name: String,
    #[serde(default)]
    pub cpu_vendor: String,
    #[serde(default)]
    pub num_cpus: u32,
    #[serde(default)]
    pub mem_total: u64,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: String,
    /// Tunnels to establish, in request order
    #[serde(default)]
    pub remotes: Vec<Remote>,
}

/// OS update status reported by an agent, kept across reconnects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatesStatus {
    pub refreshed_at: DateTime<Utc>,
    #[serde(default)]
    pub updates_available: u32,
    #[serde(default)]
    pub security_updates_available: u32,
    #[serde(default)]
    pub update_summaries: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// First line sent by an agent on a fresh connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    /// Stable client id. None lets the server derive one.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Credential identity the agent authenticated with
    pub client_auth_id: String,
    pub request: ConnectionRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_minimal_json() {
        let hello: ClientHello = serde_json::from_str(
            r#"{"client_auth_id":"auth-1","request":{"name":"box","remotes":[]}}"#,
        )
        .unwrap();
        assert!(hello.client_id.is_none());
        assert_eq!(hello.client_auth_id, "auth-1");
        assert_eq!(hello.request.name, "box");
        assert!(hello.request.remotes.is_empty());
    }

    #[test]
    fn test_request_with_remotes() {
        let req: ConnectionRequest = serde_json::from_str(
            r#"{"hostname":"db-host","remotes":[{"remote_host":"127.0.0.1","remote_port":5432,"local_port":"15432"}]}"#,
        )
        .unwrap();
        assert_eq!(req.hostname, "db-host");
        assert_eq!(req.remotes.len(), 1);
        assert_eq!(req.remotes[0].local_port.as_deref(), Some("15432"));
    }
}
