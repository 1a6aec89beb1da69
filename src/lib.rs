//! Kairos provider - one-time node bootstrap and peer-to-peer cluster formation
//!
//! The provider decides, for a single machine, whether it must run a local
//! one-time installation of the cluster distribution service, and otherwise
//! joins a peer-to-peer formation network where it is assigned one of five
//! roles and keeps executing that role for the rest of the process lifetime.
//!
//! # Architecture
//!
//! - The [`orchestrator`] evaluates the [`config::BootstrapIntent`] and picks a path
//! - The one-time path ([`install`]) installs k3s exactly once, guarded by the [`sentinel`]
//! - The formation path starts the [`overlay`] and runs a long-lived [`node`]
//! - Each node executes a [`role`] handler (master, cluster-init, HA, worker, auto)
//!
//! # Modules
//!
//! - [`config`] - Bootstrap intent parsed from the machine configuration
//! - [`error`] - Error types for every bootstrap step
//! - [`event`] - Plugin event protocol (payloads and responses)
//! - [`host`] - Host facts: init system, k3s binary, machine identity
//! - [`install`] - One-time local installation of the cluster service
//! - [`layout`] - Well-known filesystem locations, rooted for testability
//! - [`node`] - Long-lived role formation node
//! - [`orchestrator`] - Bootstrap decision tree
//! - [`overlay`] - Overlay network / coordination API setup and ledger access
//! - [`releases`] - Available upgrade version listing
//! - [`role`] - Node roles, their behaviors and the auto election
//! - [`sentinel`] - Durable "already bootstrapped" marker
//! - [`service`] - Init system service control and environment files
//! - [`telemetry`] - Logging subscriber construction

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod host;
pub mod install;
pub mod layout;
pub mod node;
pub mod orchestrator;
pub mod overlay;
pub mod releases;
pub mod role;
pub mod sentinel;
pub mod service;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Network identifier used when the configuration does not override it
pub const DEFAULT_NETWORK_ID: &str = "kairos";

/// Log level used for bootstrap logging when the overlay block sets none
pub const DEFAULT_LOG_LEVEL: &str = "debug";

/// Overlay daemon instance used for the full VPN
pub const OVERLAY_DEFAULT_INSTANCE: &str = "kairos";

/// Overlay daemon instance used for the coordination-only API
pub const OVERLAY_API_INSTANCE: &str = "api";

/// Substring identifying releases that ship the k3s distribution
pub const CLUSTER_DISTRIBUTION_MARKER: &str = "k3s";

/// Network interface created by the overlay VPN
pub const OVERLAY_INTERFACE: &str = "edgevpn0";
