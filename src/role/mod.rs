//! Node roles in the formation network
//!
//! A node is assigned exactly one of five roles. Each role maps to a fixed
//! [`RoleBehavior`]; there is no string dispatch beyond parsing role names
//! read from configuration or from the overlay ledger.
//!
//! | Role                 | Kind     | cluster-init | HA-aware |
//! |----------------------|----------|--------------|----------|
//! | `master`             | server   | no           | no       |
//! | `master/clusterinit` | server   | yes          | yes      |
//! | `master/ha`          | server   | no           | yes      |
//! | `worker`             | agent    | no           | no       |
//! | `auto`               | election | no           | no       |

mod election;
mod handler;

pub use election::{run_election, schedule_roles, HaPlan};
pub use handler::{execute_role, RoleContext, RoleProgress};

use serde::{Deserialize, Serialize};

use crate::config::ClusterKind;
use crate::Error;

/// Role of a node in the formation network
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Plain control plane server
    #[serde(rename = "master")]
    Master,
    /// Server bootstrapping a fresh control-plane datastore
    #[serde(rename = "master/clusterinit")]
    MasterClusterInit,
    /// Server joining an existing control plane
    #[serde(rename = "master/ha")]
    MasterHa,
    /// Agent joining an existing control plane
    #[serde(rename = "worker")]
    Worker,
    /// Role decided by the network election
    #[serde(rename = "auto")]
    Auto,
}

impl NodeRole {
    /// Every role, in registration order
    pub const ALL: [NodeRole; 5] = [
        NodeRole::Master,
        NodeRole::MasterClusterInit,
        NodeRole::MasterHa,
        NodeRole::Worker,
        NodeRole::Auto,
    ];

    /// Role name as stored in configuration and in the ledger
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::MasterClusterInit => "master/clusterinit",
            Self::MasterHa => "master/ha",
            Self::Worker => "worker",
            Self::Auto => "auto",
        }
    }

    /// The fixed behavior executed for this role
    pub fn behavior(self) -> RoleBehavior {
        match self {
            Self::Master => RoleBehavior::server(false, false),
            Self::MasterClusterInit => RoleBehavior::server(true, true),
            Self::MasterHa => RoleBehavior::server(false, true),
            Self::Worker => RoleBehavior {
                kind: RoleKind::Cluster(ClusterKind::Agent),
                cluster_init: false,
                ha: false,
            },
            Self::Auto => RoleBehavior {
                kind: RoleKind::Election,
                cluster_init: false,
                ha: false,
            },
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| {
                Error::config(format!(
                    "invalid role: {s}, expected one of: master, master/clusterinit, master/ha, worker, auto"
                ))
            })
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a role handler does when executed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    /// Install and run a k3s service flavor
    Cluster(ClusterKind),
    /// Take part in the role election
    Election,
}

/// Behavior configuration of a role handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleBehavior {
    /// What the handler executes
    pub kind: RoleKind,
    /// Bootstraps the control-plane datastore
    pub cluster_init: bool,
    /// Part of an HA control plane
    pub ha: bool,
}

impl RoleBehavior {
    fn server(cluster_init: bool, ha: bool) -> Self {
        Self {
            kind: RoleKind::Cluster(ClusterKind::Server),
            cluster_init,
            ha,
        }
    }

    /// Joins a control plane created by another node
    pub fn joins_existing(&self) -> bool {
        match self.kind {
            RoleKind::Cluster(ClusterKind::Agent) => true,
            RoleKind::Cluster(ClusterKind::Server) => self.ha && !self.cluster_init,
            RoleKind::Election => false,
        }
    }
}

/// The set of role handlers a node registers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleRegistry {
    roles: Vec<NodeRole>,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl RoleRegistry {
    /// Registry with all five role handlers
    pub fn standard() -> Self {
        Self {
            roles: NodeRole::ALL.to_vec(),
        }
    }

    /// Whether a handler is registered for the role
    pub fn contains(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.roles.len()
    }

    /// True when no handler is registered
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}
