//! Control plane for the portway client and tunnel registry

pub mod acl;
pub mod client;
pub mod error;
pub mod groups;
pub mod ports;
pub mod repository;
pub mod service;
pub mod user;

pub use acl::{TunnelAcl, TunnelAclError};
pub use client::{Client, ClientConnection, Tunnel, TunnelStartError};
pub use error::ControlError;
pub use groups::ClientGroup;
pub use ports::{PortDistributor, PortError, PortRange};
pub use repository::{ClientFilter, ClientRepository, FilterField};
pub use service::{tunnels_to_reestablish, ClientService};
pub use user::{StaticUser, User};
