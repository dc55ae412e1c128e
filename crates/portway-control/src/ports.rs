//! Port distributor: arbitrates the server's pool of local listening ports
//!
//! Owns the configured allowed-port set and a busy-set snapshot refreshed
//! from the live registry. It only decides which port a tunnel gets; it
//! never binds sockets itself.

use rand::seq::IteratorRandom;
use std::collections::BTreeSet;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port left among the {allowed} allowed ports")]
    Exhausted { allowed: usize },
}

/// Port range specification (inclusive)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl std::str::FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((start, end)) = s.split_once('-') {
            let start = start
                .trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid start port: {}", e))?;
            let end = end
                .trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid end port: {}", e))?;
            if start > end {
                return Err(format!("start port {} > end port {}", start, end));
            }
            Ok(PortRange::range(start, end))
        } else {
            let port = s
                .trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port: {}", e))?;
            Ok(PortRange::single(port))
        }
    }
}

/// Allocator for the server's finite pool of local listening ports
///
/// `refresh` must run before any allocation decision in the same logical
/// operation, otherwise the busy snapshot may be stale. The caller is
/// expected to hold its own lock around refresh + allocate; the
/// distributor itself is not shared.
#[derive(Debug)]
pub struct PortDistributor {
    allowed: BTreeSet<u16>,
    busy: HashSet<u16>,
}

impl PortDistributor {
    /// Build from inclusive port ranges; overlapping ranges are merged
    pub fn new(ranges: &[PortRange]) -> Self {
        let mut allowed = BTreeSet::new();
        for range in ranges {
            allowed.extend(range.start..=range.end);
        }
        tracing::debug!(allowed = allowed.len(), "Created port distributor");
        Self {
            allowed,
            busy: HashSet::new(),
        }
    }

    /// Replace the busy snapshot with the ports of all currently live tunnels
    pub fn refresh(&mut self, busy_ports: impl IntoIterator<Item = u16>) {
        self.busy = busy_ports.into_iter().collect();
        tracing::trace!(busy = self.busy.len(), "Refreshed busy-port snapshot");
    }

    /// Pick one free allowed port uniformly at random
    pub fn random_port(&mut self) -> Result<u16, PortError> {
        let mut rng = rand::thread_rng();
        let port = self
            .allowed
            .iter()
            .copied()
            .filter(|p| !self.busy.contains(p))
            .choose(&mut rng)
            .ok_or(PortError::Exhausted {
                allowed: self.allowed.len(),
            })?;
        self.busy.insert(port);
        Ok(port)
    }

    /// Mark an explicitly requested port busy so later remotes in the same
    /// allocation round cannot take it again
    pub fn reserve(&mut self, port: u16) {
        self.busy.insert(port);
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        self.allowed.contains(&port)
    }

    pub fn is_busy(&self, port: u16) -> bool {
        self.busy.contains(&port)
    }

    /// Number of configured allowed ports
    pub fn allowed_count(&self) -> usize {
        self.allowed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_parse() {
        let range = "22".parse::<PortRange>().unwrap();
        assert!(range.contains(22));
        assert!(!range.contains(23));

        let range = "20000-20010".parse::<PortRange>().unwrap();
        assert!(range.contains(20000));
        assert!(range.contains(20010));
        assert!(!range.contains(20011));

        assert!("80-22".parse::<PortRange>().is_err());
        assert!("abc".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_is_allowed() {
        let distributor = PortDistributor::new(&[PortRange::range(20000, 20002)]);
        assert!(distributor.is_allowed(20000));
        assert!(distributor.is_allowed(20002));
        assert!(!distributor.is_allowed(19999));
        assert!(!distributor.is_allowed(20003));
    }

    #[test]
    fn test_refresh_and_busy() {
        let mut distributor = PortDistributor::new(&[PortRange::range(20000, 20002)]);
        assert!(!distributor.is_busy(20001));

        distributor.refresh([20001]);
        assert!(distributor.is_busy(20001));
        assert!(!distributor.is_busy(20000));

        // refresh replaces the snapshot, it does not accumulate
        distributor.refresh([20002]);
        assert!(!distributor.is_busy(20001));
        assert!(distributor.is_busy(20002));
    }

    #[test]
    fn test_random_port_is_free_and_allowed() {
        let mut distributor = PortDistributor::new(&[PortRange::range(20000, 20004)]);
        distributor.refresh([20000, 20001]);

        let port = distributor.random_port().unwrap();
        assert!(distributor.is_allowed(port));
        assert!((20002..=20004).contains(&port));
        // the allocated port is busy immediately
        assert!(distributor.is_busy(port));
    }

    #[test]
    fn test_random_port_exhaustion() {
        let mut distributor = PortDistributor::new(&[PortRange::range(20000, 20001)]);
        distributor.random_port().unwrap();
        distributor.random_port().unwrap();

        let err = distributor.random_port().unwrap_err();
        assert!(matches!(err, PortError::Exhausted { allowed: 2 }));
    }

    #[test]
    fn test_no_duplicate_random_ports() {
        let mut distributor = PortDistributor::new(&[PortRange::range(20000, 20009)]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            assert!(seen.insert(distributor.random_port().unwrap()));
        }
    }

    #[test]
    fn test_reserve() {
        let mut distributor = PortDistributor::new(&[PortRange::range(20000, 20001)]);
        distributor.reserve(20000);
        assert!(distributor.is_busy(20000));
        assert_eq!(distributor.random_port().unwrap(), 20001);
    }
}
