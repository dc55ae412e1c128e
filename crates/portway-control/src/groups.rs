//! Client groups for operator access control and reporting
//!
//! Groups match clients by wildcard patterns over the client id. The
//! `client_ids` membership list is populated transiently from registry
//! queries and never persisted by this core.

use crate::client::Client;
use serde::{Deserialize, Serialize};

/// Named collection of clients, selected by id patterns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientGroup {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Wildcard patterns over client ids, e.g. `["prod-*", "db-1"]`
    #[serde(default)]
    pub allowed_client_ids: Vec<String>,
    /// Populated member ids, sorted ascending for deterministic output
    #[serde(default)]
    pub client_ids: Vec<String>,
}

impl ClientGroup {
    pub fn new(id: impl Into<String>, allowed_client_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            allowed_client_ids,
            client_ids: Vec::new(),
        }
    }

    /// Membership rule: the client's id matches one of the patterns
    pub fn matches(&self, client: &Client) -> bool {
        self.allowed_client_ids
            .iter()
            .any(|pattern| wildcard_match(pattern, &client.id))
    }
}

/// Match `value` against a pattern where `*` matches any run of characters
pub(crate) fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    if !value.starts_with(first) {
        return false;
    }
    let mut rest = &value[first.len()..];

    let parts: Vec<&str> = parts.collect();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        let last = i == parts.len() - 1;
        if last && !pattern.ends_with('*') {
            return rest.ends_with(part) && rest.len() >= part.len();
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::connected_client;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("db-1", "db-1"));
        assert!(!wildcard_match("db-1", "db-12"));
        assert!(wildcard_match("prod-*", "prod-web-1"));
        assert!(!wildcard_match("prod-*", "staging-web-1"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("*-db-*", "eu-db-3"));
        assert!(!wildcard_match("*-db-*", "eu-web-3"));
        assert!(wildcard_match("a*c", "abc"));
        assert!(!wildcard_match("a*c", "abcd"));
    }

    #[test]
    fn test_group_matches_by_id_pattern() {
        let group = ClientGroup::new("prod", vec!["prod-*".to_string()]);
        assert!(group.matches(&connected_client("prod-1", "auth1")));
        assert!(!group.matches(&connected_client("dev-1", "auth1")));
    }

    #[test]
    fn test_belongs_to_one_of() {
        let client = connected_client("db-7", "auth1");
        let groups = vec![
            ClientGroup::new("web", vec!["web-*".to_string()]),
            ClientGroup::new("db", vec!["db-*".to_string()]),
        ];
        assert!(client.belongs_to_one_of(&groups));
        assert!(!client.belongs_to_one_of(&groups[..1]));
    }
}
