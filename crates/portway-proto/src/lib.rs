//! Wire-facing value types shared by the portway server and its agents

pub mod remote;
pub mod request;

pub use remote::Remote;
pub use request::{ClientHello, ConnectionRequest, UpdatesStatus};
