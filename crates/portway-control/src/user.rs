//! Operator identity consumed by access-control checks
//!
//! The authentication layer is an external collaborator; the core only
//! needs to know whether a user is an admin and which groups they hold.

/// Operator identity
pub trait User {
    fn is_admin(&self) -> bool;
    fn groups(&self) -> &[String];
}

/// Plain user value for hosts that resolve identity elsewhere
#[derive(Debug, Clone, Default)]
pub struct StaticUser {
    pub admin: bool,
    pub user_groups: Vec<String>,
}

impl StaticUser {
    pub fn admin() -> Self {
        Self {
            admin: true,
            user_groups: Vec::new(),
        }
    }

    pub fn with_groups(groups: &[&str]) -> Self {
        Self {
            admin: false,
            user_groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }
}

impl User for StaticUser {
    fn is_admin(&self) -> bool {
        self.admin
    }

    fn groups(&self) -> &[String] {
        &self.user_groups
    }
}
