//! Device-management backend: token cache, API client and local agent.
pub mod agent;
pub mod client;
pub mod http;
pub mod token;

pub use agent::LocalAgent;
pub use client::ManagementApiClient;
pub use http::{HttpTransport, UreqTransport};
pub use token::ManagementTokenCache;

/// Command that releases the device from management.
pub const UNMANAGE_COMMAND: &str = "UnmanageDevice";
