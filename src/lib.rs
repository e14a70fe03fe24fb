//! vpnprov - VPN client provisioning library
//!
//! Issues and revokes per-user credentials on a single server across three
//! protocol stacks:
//! - OpenVPN, backed by an easyrsa PKI
//! - WireGuard and AmneziaWG peer tables
//! - VLESS users on a running Xray instance
//!
//! Shared server state is mutated under in-process and file locks, and each
//! user's client profiles are written to a per-user artifact directory.

pub mod artifacts;
pub mod command;
pub mod config;
pub mod error;
pub mod identity;
pub mod lock;
pub mod vpn;

// Re-export commonly used types
pub use artifacts::{ArtifactKind, ClientArtifacts, Protocol};
pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use config::{ServerConfig, VlessParams, DEFAULT_SETUP_PATH};
pub use error::{ProvisionError, ProvisionResult};
pub use identity::ClientIdentity;
pub use lock::{FileLock, LockRegistry};
pub use vpn::{
    GrpcConnector, ProtocolManager, ProvisionReport, Provisioner, StepStatus, XrayApi,
    XrayConnector,
};
