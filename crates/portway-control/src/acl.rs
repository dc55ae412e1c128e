//! Tunnel ACL: allow-list of peers permitted to use one tunnel
//!
//! Parsed once from a comma-separated string of IPs and CIDR ranges at
//! tunnel-creation time, immutable afterwards. An absent ACL means the
//! tunnel is open to any peer.

use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelAclError {
    #[error("invalid ACL entry {0:?}: expected an IP address or CIDR range")]
    InvalidEntry(String),

    #[error("ACL must not be empty")]
    Empty,
}

/// Parsed allow-list evaluated per connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAcl {
    allowed: Vec<IpNet>,
}

impl TunnelAcl {
    /// Parse a comma-separated list of IPs and CIDR ranges,
    /// e.g. `"10.0.0.1,192.168.0.0/16"`. Bare IPs become /32 (or /128).
    pub fn parse(s: &str) -> Result<Self, TunnelAclError> {
        let mut allowed = Vec::new();
        for entry in s.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let net = if entry.contains('/') {
                IpNet::from_str(entry).map_err(|_| TunnelAclError::InvalidEntry(entry.to_string()))?
            } else {
                let ip = IpAddr::from_str(entry)
                    .map_err(|_| TunnelAclError::InvalidEntry(entry.to_string()))?;
                IpNet::from(ip)
            };
            allowed.push(net);
        }
        if allowed.is_empty() {
            return Err(TunnelAclError::Empty);
        }
        Ok(Self { allowed })
    }

    /// True when the given peer IP may use the tunnel
    pub fn allows(&self, ip: IpAddr) -> bool {
        self.allowed.iter().any(|net| net.contains(&ip))
    }
}
