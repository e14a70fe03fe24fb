//! Protocol managers and the provisioning orchestrator
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Provisioner (create/delete)    │
//! └──────────────┬──────────────────────┘
//!                │
//!    ┌───────────┼───────────┐
//!    ▼           ▼           ▼
//! ┌──────┐   ┌──────┐   ┌──────┐
//! │ OVPN │   │  WG  │   │ Xray │  <- ProtocolManager
//! └──────┘   └──────┘   └──────┘
//! ```
//!
//! Each manager implements [`ProtocolManager`]. The orchestrator runs them in
//! a fixed order and records a [`StepStatus`] per protocol.

pub mod backend;
pub mod common;
pub mod manager;
pub mod openvpn;
pub mod peer_table;
pub mod wireguard;
pub mod xray;

pub use backend::ProtocolManager;
pub use manager::{ProvisionReport, Provisioner, StepStatus};
pub use openvpn::OpenVpnManager;
pub use wireguard::{WgNetwork, WireGuardManager};
pub use xray::{GrpcConnector, XrayApi, XrayConnector, XrayManager};
