//! Remote tunnel specification
//!
//! A `Remote` describes one requested port-forward: a target host/port on
//! the agent side and an optional local host/port on the server side. When
//! the local side is left unspecified the server picks a free port itself.

use serde::{Deserialize, Serialize};

/// One requested tunnel: forward a local server port to a target reachable
/// from the agent.
///
/// The local port is carried as a string because it originates from
/// operator input; validation (parse, allow-list, busy check) happens on
/// the server side at allocation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    /// Local bind host on the server (e.g., "0.0.0.0"). Filled in by the
    /// server when a random port is allocated.
    #[serde(default)]
    pub local_host: Option<String>,
    /// Requested local port on the server. None means "pick one for me".
    #[serde(default)]
    pub local_port: Option<String>,
    /// True when the local port was chosen by the server rather than the
    /// caller. Set by the server, never by the agent.
    #[serde(default)]
    pub local_port_random: bool,
    /// Target host reachable from the agent (e.g., "192.168.1.100")
    pub remote_host: String,
    /// Target port reachable from the agent
    pub remote_port: u16,
    /// Optional tunnel ACL: comma-separated IPs/CIDRs allowed to use the
    /// tunnel. Parsed by the server at tunnel creation.
    #[serde(default)]
    pub acl: Option<String>,
}

impl Remote {
    /// Create a remote with only the target side specified
    pub fn new(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_host: None,
            local_port: None,
            local_port_random: false,
            remote_host: remote_host.into(),
            remote_port,
            acl: None,
        }
    }

    /// Set an explicit local port request
    pub fn with_local(mut self, host: impl Into<String>, port: impl Into<String>) -> Self {
        self.local_host = Some(host.into());
        self.local_port = Some(port.into());
        self
    }

    /// Set the tunnel ACL string
    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    /// True when the caller asked for a specific local port
    pub fn is_local_specified(&self) -> bool {
        self.local_port.is_some()
    }

    /// "host:port" form of the target side
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// "host:port" form of the local side, if specified
    pub fn local(&self) -> Option<String> {
        self.local_port.as_ref().map(|port| {
            format!(
                "{}:{}",
                self.local_host.as_deref().unwrap_or("0.0.0.0"),
                port
            )
        })
    }

    /// True when both remotes point at the same target
    pub fn same_target(&self, other: &Remote) -> bool {
        self.remote_host == other.remote_host && self.remote_port == other.remote_port
    }

    /// True when `other` already covers this remote: same target, and same
    /// local spec when this remote pins one.
    pub fn is_covered_by(&self, other: &Remote) -> bool {
        if !self.same_target(other) {
            return false;
        }
        match self.local() {
            Some(local) => other.local().as_deref() == Some(local.as_str()),
            None => true,
        }
    }
}

impl std::fmt::Display for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.local() {
            Some(local) => write!(f, "{}->{}", local, self.remote()),
            None => write!(f, "(random)->{}", self.remote()),
        }
    }
}
