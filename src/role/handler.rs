//! Role handlers
//!
//! Cluster roles install a k3s flavor once, sharing join data through the
//! ledger: the initializing master publishes the cluster token and its
//! address, joining masters and workers wait for both before installing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::election::run_election;
use super::{NodeRole, RoleBehavior, RoleKind};
use crate::config::{BootstrapIntent, ClusterKind};
use crate::host::Host;
use crate::install::install_cluster_service;
use crate::overlay::ledger::{Buckets, Ledger};
use crate::sentinel::SentinelGuard;
use crate::{Result, OVERLAY_INTERFACE};

/// k3s supervisor/API port joining nodes connect to
const CONTROL_PLANE_PORT: u16 = 6443;

/// File in the state dir holding the token this node initialized the cluster with
const TOKEN_STATE_FILE: &str = "cluster-token";

/// Everything a role handler needs, shared by every tick of a node
#[derive(Clone)]
pub struct RoleContext {
    /// Parsed configuration
    pub intent: Arc<BootstrapIntent>,
    /// Coordination ledger
    pub ledger: Arc<dyn Ledger>,
    /// Ledger buckets of the network
    pub buckets: Buckets,
    /// Host the services are installed on
    pub host: Arc<dyn Host>,
    /// Marker guarding the cluster installation
    pub sentinel: Arc<dyn SentinelGuard>,
    /// UUID of this node
    pub uuid: String,
    /// Address this node is reachable at by peers, `None` until known
    pub address: Option<String>,
    /// Directory for persisted node state
    pub state_dir: PathBuf,
    /// Nodes required before roles are assigned
    pub min_nodes: usize,
}

/// Result of running a role handler once
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleProgress {
    /// The role did its work
    Done,
    /// The role cannot proceed yet; retried on the next tick
    Pending(String),
}

/// Run the handler of `role` once
pub async fn execute_role(role: NodeRole, ctx: &RoleContext) -> Result<RoleProgress> {
    let behavior = role.behavior();
    match behavior.kind {
        RoleKind::Election => run_election(ctx).await,
        RoleKind::Cluster(kind) => install_role(role, behavior, kind, ctx).await,
    }
}

async fn install_role(
    role: NodeRole,
    behavior: RoleBehavior,
    kind: ClusterKind,
    ctx: &RoleContext,
) -> Result<RoleProgress> {
    if ctx.sentinel.exists() {
        debug!(role = %role, "Cluster service already installed");
        return Ok(RoleProgress::Done);
    }

    let Some(address) = ctx.address.as_deref() else {
        return Ok(RoleProgress::Pending("waiting for the node address".to_string()));
    };

    let cfg = ctx.intent.cluster(kind);
    let routes_traffic = ctx
        .intent
        .overlay
        .as_ref()
        .is_some_and(|overlay| overlay.routes_cluster_traffic());
    let cluster = ctx.buckets.cluster();

    let mut env = cfg.env.clone();
    let mut args = vec![format!("--node-ip={}", address)];
    if kind == ClusterKind::Server {
        args.push(format!("--tls-san={}", address));
    }
    if routes_traffic {
        args.push(format!("--flannel-iface={}", OVERLAY_INTERFACE));
    }

    let publish = if behavior.joins_existing() {
        let token = ctx.ledger.get(&cluster, Buckets::TOKEN).await?;
        let address = ctx.ledger.get(&cluster, Buckets::ADDRESS).await?;
        let (Some(token), Some(address)) = (token, address) else {
            return Ok(RoleProgress::Pending(
                "waiting for the control plane to publish join data".to_string(),
            ));
        };

        let server_url = format!("https://{}:{}", address, CONTROL_PLANE_PORT);
        match kind {
            ClusterKind::Server => args.push(format!("--server={}", server_url)),
            ClusterKind::Agent => {
                env.insert("K3S_URL".to_string(), server_url);
            }
        }
        env.insert("K3S_TOKEN".to_string(), token);
        None
    } else {
        let token = init_token(ctx).await?;
        if behavior.cluster_init {
            args.push("--cluster-init".to_string());
        }
        env.insert("K3S_TOKEN".to_string(), token.clone());
        Some(token)
    };

    let args = if cfg.replace_args {
        cfg.args.clone()
    } else {
        args.into_iter().chain(cfg.args.iter().cloned()).collect()
    };

    debug!(role = %role, env = ?redact(&env), args = ?args, "Installing role");
    install_cluster_service(ctx.host.as_ref(), kind, &env, &args).await?;

    if let Some(token) = publish {
        ctx.ledger.put(&cluster, Buckets::TOKEN, &token).await?;
        ctx.ledger.put(&cluster, Buckets::ADDRESS, address).await?;
        info!(role = %role, address = %address, "Published control plane join data");
    }

    ctx.sentinel.create()?;
    info!(role = %role, service = kind.service_name(), "Role installed");
    Ok(RoleProgress::Done)
}

/// Token an initializing master starts k3s with
///
/// Saved in the state dir before k3s is installed, so a retried install and
/// the later publish use the token the running server was started with.
/// Without a saved token, one already published in the ledger is adopted,
/// otherwise a fresh one is generated.
async fn init_token(ctx: &RoleContext) -> Result<String> {
    let path = ctx.state_dir.join(TOKEN_STATE_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(saved) if !saved.trim().is_empty() => return Ok(saved.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let token = match ctx.ledger.get(&ctx.buckets.cluster(), Buckets::TOKEN).await? {
        Some(token) => token,
        None => Uuid::new_v4().simple().to_string(),
    };
    tokio::fs::create_dir_all(&ctx.state_dir).await?;
    tokio::fs::write(&path, &token).await?;
    Ok(token)
}

/// Environment with secrets masked, for logging
fn redact(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            if key.contains("TOKEN") {
                (key.clone(), "<redacted>".to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}
