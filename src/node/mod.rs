//! Long-lived role formation node
//!
//! Once started a node never returns on its own. Every tick it:
//!
//! 1. announces itself in the ledger
//! 2. resolves its own role (state dir, then ledger, then the configured default)
//! 3. runs the persistent roles (`auto`), which drive the election
//! 4. resolves the address it advertises, if not known yet
//! 5. runs its own role until it completes once
//!
//! Errors inside a tick are logged and retried on the next tick. Only a failure
//! to join the network at start is reported back to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::config::{BootstrapIntent, OverlayConfig};
use crate::host::Host;
use crate::overlay::ledger::{Buckets, HttpLedger, Ledger};
use crate::overlay::OverlayNetworkHandle;
use crate::role::{execute_role, NodeRole, RoleContext, RoleProgress, RoleRegistry};
use crate::sentinel::SentinelGuard;
use crate::service::run_command;
use crate::{Error, Result, OVERLAY_INTERFACE};

/// Interval between two node ticks
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// File in the state dir holding the assigned role
const ROLE_STATE_FILE: &str = "role";

/// Everything needed to build a formation node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSpec {
    /// Network identifier
    pub network_id: String,
    /// Address of the coordination API
    pub api_address: String,
    /// Nodes required before roles are assigned
    pub min_nodes: usize,
    /// UUID of this machine
    pub uuid: String,
    /// Directory for persisted node state
    pub state_dir: PathBuf,
    /// Shared network token
    pub token: String,
    /// Registered role handlers
    pub roles: RoleRegistry,
    /// Roles run on every tick regardless of the assigned role
    pub persistent_roles: Vec<NodeRole>,
    /// Role used when nothing is assigned yet
    pub default_role: Option<NodeRole>,
    /// Where the address advertised to peers comes from
    pub address_source: AddressSource,
}

/// Where a node takes the address it advertises to peers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressSource {
    /// Pinned in the configuration
    Fixed(String),
    /// First IPv4 address of a network interface, e.g. the DHCP-assigned overlay one
    Interface(String),
    /// Local address of the default outbound route
    OutboundRoute,
}

impl AddressSource {
    /// Source for a node on `overlay`
    ///
    /// A pinned `ADDRESS` wins. Nodes routing cluster traffic through the VPN
    /// advertise their overlay address, others their outbound one.
    pub fn for_overlay(overlay: &OverlayConfig) -> Self {
        match overlay.advertise_address() {
            Some(address) => Self::Fixed(address),
            None if overlay.routes_cluster_traffic() => {
                Self::Interface(OVERLAY_INTERFACE.to_string())
            }
            None => Self::OutboundRoute,
        }
    }

    /// Current address, `None` while it is not available yet
    pub async fn resolve(&self) -> Option<String> {
        match self {
            Self::Fixed(address) => Some(address.clone()),
            Self::Interface(name) => interface_address(name).await,
            Self::OutboundRoute => outbound_address().await,
        }
    }
}

impl NodeSpec {
    /// Spec for a node on a running overlay
    ///
    /// Registers all five role handlers with `auto` persistent. Fails when the
    /// configured default role is unknown.
    pub fn for_overlay(
        handle: &OverlayNetworkHandle,
        intent: &BootstrapIntent,
        uuid: impl Into<String>,
        default_state_dir: &Path,
    ) -> Result<Self> {
        let overlay = intent
            .overlay
            .as_ref()
            .ok_or_else(|| Error::config("no p2p block configured"))?;

        Ok(Self {
            network_id: handle.network_id.clone(),
            api_address: handle.api_address.clone(),
            min_nodes: handle.min_nodes,
            uuid: uuid.into(),
            state_dir: overlay
                .state_dir
                .clone()
                .unwrap_or_else(|| default_state_dir.to_path_buf()),
            token: handle.token.clone(),
            roles: RoleRegistry::standard(),
            persistent_roles: vec![NodeRole::Auto],
            default_role: overlay.default_role()?,
            address_source: AddressSource::for_overlay(overlay),
        })
    }
}

/// Builds and starts formation nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeLauncher: Send + Sync {
    /// Start a node; only returns when it stops
    async fn launch(&self, spec: NodeSpec, intent: &BootstrapIntent) -> Result<()>;
}

/// Launches nodes talking to the EdgeVPN ledger API
#[derive(Clone)]
pub struct EdgeVpnLauncher {
    host: Arc<dyn Host>,
    sentinel: Arc<dyn SentinelGuard>,
}

impl EdgeVpnLauncher {
    /// Create a launcher installing roles on `host`
    pub fn new(host: Arc<dyn Host>, sentinel: Arc<dyn SentinelGuard>) -> Self {
        Self { host, sentinel }
    }
}

#[async_trait]
impl NodeLauncher for EdgeVpnLauncher {
    async fn launch(&self, spec: NodeSpec, intent: &BootstrapIntent) -> Result<()> {
        let ledger = Arc::new(HttpLedger::new(&spec.api_address)?);

        let ctx = RoleContext {
            intent: Arc::new(intent.clone()),
            ledger,
            buckets: Buckets::new(&spec.network_id),
            host: Arc::clone(&self.host),
            sentinel: Arc::clone(&self.sentinel),
            uuid: spec.uuid.clone(),
            address: None,
            state_dir: spec.state_dir.clone(),
            min_nodes: spec.min_nodes,
        };
        FormationNode::new(spec, ctx).start().await
    }
}

/// Local address used for outbound traffic, `None` without a route
///
/// Connecting a UDP socket sends nothing; it only selects a route.
async fn outbound_address() -> Option<String> {
    let socket = match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(error = %e, "Cannot bind route lookup socket");
            return None;
        }
    };
    if let Err(e) = socket.connect("1.1.1.1:80").await {
        debug!(error = %e, "No outbound route");
        return None;
    }
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// IPv4 address currently assigned to interface `name`
async fn interface_address(name: &str) -> Option<String> {
    match run_command("ip", &["-4", "-o", "addr", "show", "dev", name]).await {
        Ok(output) => parse_ip_addr(&output),
        Err(e) => {
            debug!(interface = %name, error = %e, "Interface address not available");
            None
        }
    }
}

/// First `inet` address of `ip -o addr show` output, without its prefix length
fn parse_ip_addr(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        fields.find(|field| *field == "inet")?;
        let cidr = fields.next()?;
        Some(cidr.split('/').next().unwrap_or(cidr).to_string())
    })
}

/// A running member of the formation network
pub struct FormationNode {
    spec: NodeSpec,
    ctx: RoleContext,
    role: Option<NodeRole>,
    role_done: bool,
}

impl FormationNode {
    /// Create a node; nothing happens until [`FormationNode::start`]
    pub fn new(spec: NodeSpec, ctx: RoleContext) -> Self {
        Self {
            spec,
            ctx,
            role: None,
            role_done: false,
        }
    }

    /// Role currently executed by this node
    pub fn role(&self) -> Option<NodeRole> {
        self.role
    }

    /// Join the network and run forever
    ///
    /// Returns only when the first announcement fails.
    pub async fn start(mut self) -> Result<()> {
        self.announce().await.map_err(|e| {
            Error::node(format!("cannot join network {}: {}", self.spec.network_id, e))
        })?;
        info!(
            network_id = %self.spec.network_id,
            uuid = %self.spec.uuid,
            "Joined formation network"
        );

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Node tick failed, retrying");
            }
        }
    }

    /// One round of announce, election and role execution
    pub async fn tick(&mut self) -> Result<()> {
        self.announce().await?;

        // A fixed role must be in the ledger before the leader schedules
        self.ensure_role().await?;

        for role in self.spec.persistent_roles.clone() {
            if !self.spec.roles.contains(role) {
                continue;
            }
            if let RoleProgress::Pending(reason) = execute_role(role, &self.ctx).await? {
                debug!(role = %role, reason = %reason, "Persistent role pending");
            }
        }

        self.ensure_role().await?;

        let Some(role) = self.role else {
            debug!("No role assigned yet");
            return Ok(());
        };
        if self.role_done || self.spec.persistent_roles.contains(&role) {
            return Ok(());
        }
        if !self.spec.roles.contains(role) {
            return Err(Error::node(format!("no handler registered for role {}", role)));
        }
        self.ensure_address().await;

        match execute_role(role, &self.ctx).await? {
            RoleProgress::Done => {
                self.role_done = true;
                info!(role = %role, "Role completed");
            }
            RoleProgress::Pending(reason) => {
                debug!(role = %role, reason = %reason, "Role pending");
            }
        }
        Ok(())
    }

    async fn ensure_address(&mut self) {
        if self.ctx.address.is_some() {
            return;
        }
        self.ctx.address = self.spec.address_source.resolve().await;
        match &self.ctx.address {
            Some(address) => info!(address = %address, "Node address resolved"),
            None => debug!(source = ?self.spec.address_source, "Node address not available yet"),
        }
    }

    async fn announce(&self) -> Result<()> {
        let now = Utc::now().timestamp().to_string();
        self.ctx
            .ledger
            .put(&self.ctx.buckets.nodes(), &self.spec.uuid, &now)
            .await
    }

    async fn ensure_role(&mut self) -> Result<()> {
        if self.role.is_some() {
            return Ok(());
        }
        self.role = self.resolve_role().await?;
        if let Some(role) = self.role {
            self.persist_role(role).await?;
            self.ctx
                .ledger
                .put(&self.ctx.buckets.roles(), &self.spec.uuid, role.as_str())
                .await?;
            info!(role = %role, "Role assigned to this node");
        }
        Ok(())
    }

    fn role_file(&self) -> PathBuf {
        self.spec.state_dir.join(ROLE_STATE_FILE)
    }

    /// Persisted role, then ledger assignment, then the configured default
    ///
    /// The resolved role is written back to the ledger by the caller so the
    /// leader never schedules over it.
    async fn resolve_role(&self) -> Result<Option<NodeRole>> {
        match tokio::fs::read_to_string(self.role_file()).await {
            Ok(saved) => match saved.trim().parse() {
                Ok(role) => return Ok(Some(role)),
                Err(e) => warn!(error = %e, "Ignoring unreadable role state"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let roles = self.ctx.buckets.roles();
        if let Some(assigned) = self.ctx.ledger.get(&roles, &self.spec.uuid).await? {
            match assigned.parse::<NodeRole>() {
                Ok(NodeRole::Auto) => {}
                Ok(role) => return Ok(Some(role)),
                Err(e) => warn!(error = %e, "Ignoring invalid role assignment"),
            }
        }

        Ok(self.spec.default_role.filter(|role| *role != NodeRole::Auto))
    }

    async fn persist_role(&self, role: NodeRole) -> Result<()> {
        tokio::fs::create_dir_all(&self.spec.state_dir).await?;
        tokio::fs::write(self.role_file(), role.as_str()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::host::{InitSystem, MockHost};
    use crate::overlay::ledger::testing::MemoryLedger;
    use crate::overlay::ledger::MockLedger;
    use crate::overlay::OverlayMode;
    use crate::sentinel::MockSentinelGuard;
    use crate::service::testing::{CallLog, RecordingService};

    const CONFIG: &str = "p2p:\n  network_token: abc\n  minimum_nodes: 1\n";

    fn spec(state_dir: &Path, default_role: Option<NodeRole>) -> NodeSpec {
        NodeSpec {
            network_id: "kairos".to_string(),
            api_address: "127.0.0.1:8080".to_string(),
            min_nodes: 1,
            uuid: "node-a".to_string(),
            state_dir: state_dir.to_path_buf(),
            token: "abc".to_string(),
            roles: RoleRegistry::standard(),
            persistent_roles: vec![NodeRole::Auto],
            default_role,
            address_source: AddressSource::Fixed("10.1.0.1".to_string()),
        }
    }

    fn context(ledger: Arc<dyn Ledger>, calls: CallLog, state_dir: &Path) -> RoleContext {
        let mut host = MockHost::new();
        host.expect_init_system().return_const(Some(InitSystem::Systemd));
        host.expect_cluster_binary()
            .return_const(Some(PathBuf::from("/usr/bin/k3s")));
        host.expect_write_env().returning(|_, _| Ok(()));
        host.expect_service()
            .returning(move |_, name| Box::new(RecordingService::new(name, calls.clone())));

        let mut sentinel = MockSentinelGuard::new();
        sentinel.expect_exists().return_const(false);
        sentinel.expect_create().returning(|| Ok(()));

        RoleContext {
            intent: Arc::new(BootstrapIntent::from_config_str(CONFIG).unwrap()),
            ledger,
            buckets: Buckets::new("kairos"),
            host: Arc::new(host),
            sentinel: Arc::new(sentinel),
            uuid: "node-a".to_string(),
            address: None,
            state_dir: state_dir.to_path_buf(),
            min_nodes: 1,
        }
    }

    // ==========================================================================
    // Story: Building the node
    // ==========================================================================

    #[test]
    fn story_spec_registers_five_roles_with_auto_persistent() {
        let intent = BootstrapIntent::from_config_str(
            "p2p:\n  network_token: abc\n  network_id: lab\n  minimum_nodes: 3\n  role: master/ha\n",
        )
        .unwrap();
        let handle = OverlayNetworkHandle {
            network_id: "lab".to_string(),
            api_address: "127.0.0.1:8080".to_string(),
            token: "abc".to_string(),
            min_nodes: 3,
            mode: OverlayMode::Vpn,
        };

        let spec = NodeSpec::for_overlay(&handle, &intent, "uuid-1", Path::new("/state")).unwrap();

        assert_eq!(spec.roles.len(), 5);
        assert_eq!(spec.persistent_roles, vec![NodeRole::Auto]);
        assert_eq!(spec.default_role, Some(NodeRole::MasterHa));
        assert_eq!(spec.state_dir, PathBuf::from("/state"));
        assert_eq!(spec.min_nodes, 3);
        assert_eq!(spec.network_id, "lab");
    }

    #[test]
    fn story_unknown_default_role_fails_node_creation() {
        let intent =
            BootstrapIntent::from_config_str("p2p:\n  network_token: abc\n  role: captain\n").unwrap();
        let handle = OverlayNetworkHandle {
            network_id: "kairos".to_string(),
            api_address: "127.0.0.1:8080".to_string(),
            token: "abc".to_string(),
            min_nodes: 0,
            mode: OverlayMode::ApiOnly,
        };
        assert!(NodeSpec::for_overlay(&handle, &intent, "u", Path::new("/s")).is_err());
    }

    // ==========================================================================
    // Story: Choosing the advertised address
    // ==========================================================================

    fn overlay(yaml: &str) -> OverlayConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn story_address_source_follows_the_vpn_settings() {
        assert_eq!(
            AddressSource::for_overlay(&overlay("network_token: abc\n")),
            AddressSource::Interface("edgevpn0".to_string())
        );
        assert_eq!(
            AddressSource::for_overlay(&overlay("network_token: abc\nvpn:\n  use: false\n")),
            AddressSource::OutboundRoute
        );
        assert_eq!(
            AddressSource::for_overlay(&overlay(
                "network_token: abc\nvpn:\n  env:\n    ADDRESS: 10.1.0.9/24\n"
            )),
            AddressSource::Fixed("10.1.0.9".to_string())
        );
    }

    #[test]
    fn story_interface_address_is_read_from_ip_output() {
        let output = "5: edgevpn0    inet 10.1.0.5/24 brd 10.1.0.255 scope global edgevpn0\\       valid_lft forever preferred_lft forever\n";
        assert_eq!(parse_ip_addr(output).as_deref(), Some("10.1.0.5"));
        assert_eq!(parse_ip_addr(""), None);
    }

    #[tokio::test]
    async fn story_node_waits_for_its_overlay_address() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::default());
        let calls = CallLog::default();
        let mut spec = spec(dir.path(), None);
        spec.address_source = AddressSource::Interface("kairos-absent0".to_string());
        let mut node = FormationNode::new(spec, context(ledger.clone(), calls.clone(), dir.path()));

        // A missing address is not a failure: the role stays pending
        node.tick().await.unwrap();

        assert_eq!(node.role(), Some(NodeRole::Master));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(ledger.value("kairos-cluster", "token"), None);
    }

    // ==========================================================================
    // Story: A lone node elects itself and installs the control plane
    // ==========================================================================

    #[tokio::test]
    async fn story_single_node_becomes_master_and_installs() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::default());
        let calls = CallLog::default();
        let mut node = FormationNode::new(spec(dir.path(), None), context(ledger.clone(), calls.clone(), dir.path()));

        node.tick().await.unwrap();

        assert!(ledger.value("kairos-nodes", "node-a").is_some());
        assert_eq!(ledger.value("kairos-roles", "node-a").as_deref(), Some("master"));
        assert_eq!(node.role(), Some(NodeRole::Master));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("role")).unwrap(),
            "master"
        );
        assert!(calls.lock().unwrap().contains(&"start k3s".to_string()));

        // Completed roles are not re-run
        let before = calls.lock().unwrap().len();
        node.tick().await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn story_persisted_role_is_resumed_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("role"), "worker\n").unwrap();
        let ledger = Arc::new(MemoryLedger::default());
        let mut node = FormationNode::new(spec(dir.path(), None), context(ledger.clone(), CallLog::default(), dir.path()));

        node.tick().await.unwrap();

        // The stored role wins over whatever the election would pick
        assert_eq!(node.role(), Some(NodeRole::Worker));
        assert_eq!(ledger.value("kairos-roles", "node-a").as_deref(), Some("worker"));
    }

    #[tokio::test]
    async fn story_default_role_is_published_for_the_leader() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::default());
        let mut node = FormationNode::new(
            spec(dir.path(), Some(NodeRole::Worker)),
            context(ledger.clone(), CallLog::default(), dir.path()),
        );

        node.tick().await.unwrap();

        // The election left the fixed role alone; the worker waits for a master
        assert_eq!(node.role(), Some(NodeRole::Worker));
        assert_eq!(ledger.value("kairos-roles", "node-a").as_deref(), Some("worker"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("role")).unwrap(),
            "worker"
        );
    }

    #[tokio::test]
    async fn story_unreachable_ledger_fails_start() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_put()
            .returning(|_, _, _| Err(Error::overlay("connection refused")));

        let dir = tempfile::tempdir().unwrap();
        let node = FormationNode::new(
            spec(dir.path(), None),
            context(Arc::new(ledger), CallLog::default(), dir.path()),
        );

        let err = node.start().await.unwrap_err();
        assert!(matches!(err, Error::Node(_)));
        assert!(err.to_string().contains("cannot join network kairos"));
        assert!(err.to_string().contains("connection refused"));
    }
}
