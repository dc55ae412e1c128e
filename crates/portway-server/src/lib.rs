//! Portway server: agent-facing host for the control core

pub mod server;

pub use server::{PortwayServer, ServerConfig};
