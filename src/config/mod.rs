//! Bootstrap intent parsed from the machine configuration
//!
//! The configuration document (usually a `#cloud-config` YAML, JSON works as
//! well) is read twice into two overlapping shapes:
//!
//! - [`AgentSettings`] - generic agent settings shared with every provider
//! - the provider section - `p2p`, `k3s` and `k3s-agent` blocks
//!
//! Both are combined into an immutable [`BootstrapIntent`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::role::NodeRole;
use crate::{Error, Result, DEFAULT_LOG_LEVEL, DEFAULT_NETWORK_ID};

/// Settings for one k3s service flavor (`k3s` or `k3s-agent` block)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterServiceConfig {
    /// Whether the block explicitly requests a local installation
    pub enabled: bool,
    /// Environment written to the service environment file
    pub env: BTreeMap<String, String>,
    /// Extra arguments appended to the launch command, in order
    pub args: Vec<String>,
    /// Use only `args` instead of the arguments computed for a formation role
    pub replace_args: bool,
}

/// Which k3s flavor a node installs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterKind {
    /// Control plane (`k3s server`)
    Server,
    /// Node agent (`k3s agent`)
    Agent,
}

impl ClusterKind {
    /// Name of the managed service
    pub fn service_name(self) -> &'static str {
        match self {
            Self::Server => "k3s",
            Self::Agent => "k3s-agent",
        }
    }

    /// Subcommand passed to the k3s binary
    pub fn role_arg(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.role_arg())
    }
}

/// Automatic role assignment settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutoConfig {
    /// Explicit toggle; absent means enabled
    pub enable: Option<bool>,
    /// High availability control plane settings
    pub ha: HaConfig,
}

impl AutoConfig {
    /// Auto formation is on unless explicitly disabled
    pub fn is_enabled(&self) -> bool {
        self.enable.unwrap_or(true)
    }
}

/// HA control plane settings for automatic role assignment
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HaConfig {
    /// Whether the elected control plane is HA (cluster-init + joining masters)
    pub enable: bool,
    /// Number of additional masters joining the cluster-init master
    pub master_nodes: usize,
}

/// Overlay VPN settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct VpnConfig {
    /// Create the VPN interface; absent means true
    pub create: Option<bool>,
    /// Route cluster traffic through the VPN interface; absent means true
    #[serde(rename = "use")]
    pub use_vpn: Option<bool>,
    /// Extra environment for the overlay daemon
    pub env: BTreeMap<String, String>,
}

/// The `p2p` block: peer-to-peer formation settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct OverlayConfig {
    /// Shared network token; empty means no formation is possible
    pub network_token: String,
    /// Network identifier; empty means [`DEFAULT_NETWORK_ID`]
    pub network_id: String,
    /// Fixed role for this node, short-circuiting the election
    pub role: String,
    /// Nodes required before roles are assigned
    pub minimum_nodes: usize,
    /// Bootstrap log level
    #[serde(rename = "loglevel")]
    pub log_level: String,
    /// Automatic role assignment
    pub auto: AutoConfig,
    /// VPN settings
    pub vpn: VpnConfig,
    /// Directory for persisted node state
    pub state_dir: Option<PathBuf>,
}

impl OverlayConfig {
    /// Whether node traffic, not just coordination metadata, must go through
    /// the overlay. When false a coordination-only API is enough.
    pub fn vpn_needs_creation(&self) -> bool {
        self.vpn.create.unwrap_or(true) || self.routes_cluster_traffic()
    }

    /// Whether k3s should bind its pod network to the overlay interface
    pub fn routes_cluster_traffic(&self) -> bool {
        self.vpn.use_vpn.unwrap_or(true)
    }

    /// Effective network identifier
    pub fn network_id(&self) -> &str {
        if self.network_id.is_empty() {
            DEFAULT_NETWORK_ID
        } else {
            &self.network_id
        }
    }

    /// Fixed default role, if the configuration names one
    pub fn default_role(&self) -> Result<Option<NodeRole>> {
        if self.role.is_empty() {
            return Ok(None);
        }
        self.role.parse().map(Some)
    }

    /// Address this node advertises to peers, when pinned in the VPN env
    pub fn advertise_address(&self) -> Option<String> {
        self.vpn
            .env
            .get("ADDRESS")
            .map(|addr| addr.split('/').next().unwrap_or(addr).to_string())
            .filter(|addr| !addr.is_empty())
    }
}

/// Generic agent settings shared by every provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSettings {
    /// Verbose agent output
    pub debug: bool,
    /// Fail hard on non-fatal errors
    pub strict: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderSection {
    p2p: Option<OverlayConfig>,
    k3s: ClusterServiceConfig,
    #[serde(rename = "k3s-agent")]
    k3s_agent: ClusterServiceConfig,
}

/// Parsed bootstrap configuration, immutable after load
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapIntent {
    /// Peer-to-peer formation block; `None` means no formation requested
    pub overlay: Option<OverlayConfig>,
    /// `k3s` block
    pub cluster_server: ClusterServiceConfig,
    /// `k3s-agent` block
    pub cluster_agent: ClusterServiceConfig,
    /// Generic agent settings
    pub agent: AgentSettings,
}

impl BootstrapIntent {
    /// Parse the intent from a serialized configuration document
    pub fn from_config_str(raw: &str) -> Result<Self> {
        if is_blank_document(raw) {
            return Ok(Self::default());
        }

        let agent: AgentSettings = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("failed reading agent settings: {}", e)))?;
        let provider: ProviderSection = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("failed reading provider settings: {}", e)))?;

        Ok(Self {
            overlay: provider.p2p,
            cluster_server: provider.k3s,
            cluster_agent: provider.k3s_agent,
            agent,
        })
    }

    /// True when any of the overlay or cluster blocks asks for work
    pub fn has_work(&self) -> bool {
        self.overlay.is_some() || self.cluster_server.enabled || self.cluster_agent.enabled
    }

    /// True when either cluster block is enabled
    pub fn cluster_block_enabled(&self) -> bool {
        self.cluster_server.enabled || self.cluster_agent.enabled
    }

    /// Overlay absent, or present with an empty token
    pub fn token_missing(&self) -> bool {
        self.overlay
            .as_ref()
            .map_or(true, |overlay| overlay.network_token.is_empty())
    }

    /// Overlay present with automatic formation explicitly disabled
    pub fn auto_formation_disabled(&self) -> bool {
        self.overlay
            .as_ref()
            .is_some_and(|overlay| !overlay.auto.is_enabled())
    }

    /// The cluster flavor installed by the one-time bootstrap
    ///
    /// Server takes priority when both blocks are enabled. When neither is
    /// enabled the server flavor is used with empty settings.
    pub fn local_cluster(&self) -> (ClusterKind, &ClusterServiceConfig) {
        if self.cluster_server.enabled {
            (ClusterKind::Server, &self.cluster_server)
        } else if self.cluster_agent.enabled {
            (ClusterKind::Agent, &self.cluster_agent)
        } else {
            (ClusterKind::Server, &self.cluster_server)
        }
    }

    /// Settings of the given cluster flavor
    pub fn cluster(&self, kind: ClusterKind) -> &ClusterServiceConfig {
        match kind {
            ClusterKind::Server => &self.cluster_server,
            ClusterKind::Agent => &self.cluster_agent,
        }
    }

    /// Bootstrap log level, defaulting to [`DEFAULT_LOG_LEVEL`]
    ///
    /// A debugging agent always logs at `debug`, whatever the p2p block says.
    pub fn log_level(&self) -> &str {
        if self.agent.debug {
            return "debug";
        }
        self.overlay
            .as_ref()
            .map(|overlay| overlay.log_level.as_str())
            .filter(|level| !level.is_empty())
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// A document holding only comments (`#cloud-config`) or whitespace
fn is_blank_document(raw: &str) -> bool {
    raw.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(yaml: &str) -> BootstrapIntent {
        BootstrapIntent::from_config_str(yaml).expect("config should parse")
    }

    // ==========================================================================
    // Story: Reading the machine configuration
    // ==========================================================================

    #[test]
    fn story_empty_configuration_requests_nothing() {
        let parsed = intent("#cloud-config\n");
        assert!(!parsed.has_work());
        assert!(parsed.token_missing());
        assert!(!parsed.auto_formation_disabled());

        assert!(!intent("").has_work());
    }

    #[test]
    fn story_full_formation_config_is_read() {
        let parsed = intent(
            r#"#cloud-config
debug: true
p2p:
  network_token: "b3RwOgogIGRodDoK"
  network_id: "edge-fleet"
  role: "worker"
  minimum_nodes: 3
  loglevel: info
  auto:
    ha:
      enable: true
      master_nodes: 2
  vpn:
    create: false
    use: false
    env:
      ADDRESS: 10.1.0.12/24
k3s:
  env:
    K3S_RESOLV_CONF: /etc/resolv.conf
  args:
    - --disable=traefik
    - --disable=servicelb
"#,
        );

        assert!(parsed.agent.debug);
        let overlay = parsed.overlay.as_ref().expect("p2p block present");
        assert_eq!(overlay.network_id(), "edge-fleet");
        assert_eq!(overlay.minimum_nodes, 3);
        // debug: true overrides the p2p loglevel
        assert_eq!(parsed.log_level(), "debug");
        assert!(overlay.auto.is_enabled());
        assert!(overlay.auto.ha.enable);
        assert_eq!(overlay.auto.ha.master_nodes, 2);
        assert!(!overlay.vpn_needs_creation());
        assert_eq!(overlay.advertise_address().as_deref(), Some("10.1.0.12"));
        assert_eq!(overlay.default_role().unwrap(), Some(NodeRole::Worker));

        assert!(!parsed.cluster_server.enabled);
        assert_eq!(
            parsed.cluster_server.args,
            vec!["--disable=traefik", "--disable=servicelb"]
        );
        assert_eq!(
            parsed.cluster_server.env.get("K3S_RESOLV_CONF").map(String::as_str),
            Some("/etc/resolv.conf")
        );
    }

    #[test]
    fn story_json_configuration_is_accepted() {
        let parsed = intent(r#"{"k3s-agent": {"enabled": true, "args": ["--node-label=edge"]}}"#);
        assert!(parsed.has_work());
        let (kind, cfg) = parsed.local_cluster();
        assert_eq!(kind, ClusterKind::Agent);
        assert_eq!(cfg.args, vec!["--node-label=edge"]);
    }

    #[test]
    fn story_malformed_configuration_is_a_config_error() {
        let err = BootstrapIntent::from_config_str("p2p: [not, a, map]").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    // ==========================================================================
    // Story: Derived decisions
    // ==========================================================================

    #[test]
    fn story_server_takes_priority_over_agent() {
        let parsed = intent("k3s:\n  enabled: true\nk3s-agent:\n  enabled: true\n");
        let (kind, _) = parsed.local_cluster();
        assert_eq!(kind, ClusterKind::Server);
        assert_eq!(kind.service_name(), "k3s");
        assert_eq!(kind.role_arg(), "server");
        assert_eq!(ClusterKind::Agent.service_name(), "k3s-agent");
    }

    #[test]
    fn story_overlay_without_token_counts_as_missing() {
        let parsed = intent("p2p:\n  network_id: foo\n");
        assert!(parsed.has_work());
        assert!(parsed.token_missing());
    }

    #[test]
    fn story_auto_disabled_only_when_explicit() {
        assert!(!intent("p2p:\n  network_token: abc\n").auto_formation_disabled());
        assert!(intent("p2p:\n  network_token: abc\n  auto:\n    enable: false\n")
            .auto_formation_disabled());
        assert!(!intent("k3s:\n  enabled: true\n").auto_formation_disabled());
    }

    #[test]
    fn story_p2p_loglevel_applies_unless_debugging() {
        assert_eq!(intent("p2p:\n  loglevel: warn\n").log_level(), "warn");
        assert_eq!(
            intent("debug: false\np2p:\n  loglevel: info\n").log_level(),
            "info"
        );
        assert_eq!(intent("debug: true\np2p:\n  loglevel: info\n").log_level(), "debug");
    }

    #[test]
    fn story_defaults_fill_unset_overlay_fields() {
        let parsed = intent("p2p:\n  network_token: abc\n");
        let overlay = parsed.overlay.as_ref().unwrap();
        assert_eq!(overlay.network_id(), DEFAULT_NETWORK_ID);
        assert_eq!(parsed.log_level(), DEFAULT_LOG_LEVEL);
        assert!(overlay.vpn_needs_creation());
        assert!(overlay.routes_cluster_traffic());
        assert_eq!(overlay.default_role().unwrap(), None);
        assert_eq!(overlay.advertise_address(), None);
    }

    #[test]
    fn story_vpn_needed_when_either_flag_is_on() {
        let only_use = intent("p2p:\n  vpn:\n    create: false\n");
        assert!(only_use.overlay.unwrap().vpn_needs_creation());

        let only_create = intent("p2p:\n  vpn:\n    use: false\n");
        assert!(only_create.overlay.unwrap().vpn_needs_creation());
    }

    #[test]
    fn story_unknown_role_is_rejected() {
        let parsed = intent("p2p:\n  network_token: abc\n  role: captain\n");
        let err = parsed.overlay.unwrap().default_role().unwrap_err();
        assert!(err.to_string().contains("captain"));
    }
}
