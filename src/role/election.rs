//! Automatic role election through the overlay ledger
//!
//! Every node announces itself in the nodes bucket with a unix timestamp.
//! Nodes whose announcement is older than [`NODE_TTL`] are considered gone.
//! Once at least `minimum_nodes` are alive, the node with the lowest UUID
//! becomes the leader and is the only one writing role assignments:
//!
//! - itself (or the first unassigned node when no control plane exists):
//!   `master/clusterinit` with HA enabled, `master` otherwise
//! - the next `master_nodes` unassigned nodes: `master/ha` (HA only)
//! - everybody else: `worker`
//!
//! Assignments are never rewritten, so a re-election after the leader left
//! only fills in nodes that have no role yet.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use super::{NodeRole, RoleContext, RoleProgress};
use crate::config::AutoConfig;
use crate::Result;

/// Age after which a node announcement is ignored
pub const NODE_TTL: Duration = Duration::from_secs(90);

/// Control plane shape requested by the auto configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HaPlan {
    /// Bootstrap an HA control plane
    pub enabled: bool,
    /// Masters joining the cluster-init master
    pub master_nodes: usize,
}

impl HaPlan {
    /// Plan from the `p2p.auto` block
    pub fn from_config(auto: &AutoConfig) -> Self {
        Self {
            enabled: auto.ha.enable,
            master_nodes: auto.ha.master_nodes,
        }
    }

    fn leader_role(self) -> NodeRole {
        if self.enabled {
            NodeRole::MasterClusterInit
        } else {
            NodeRole::Master
        }
    }
}

/// Roles for every live node that has none yet
///
/// `live` may be in any order; nodes are scheduled by ascending UUID.
/// Existing assignments of `auto` are treated as unassigned.
pub fn schedule_roles(
    live: &[String],
    assigned: &BTreeMap<String, NodeRole>,
    plan: HaPlan,
) -> BTreeMap<String, NodeRole> {
    let fixed: BTreeMap<&String, NodeRole> = assigned
        .iter()
        .filter(|(_, role)| **role != NodeRole::Auto)
        .map(|(node, role)| (node, *role))
        .collect();

    let mut has_leader = fixed
        .values()
        .any(|role| matches!(role, NodeRole::Master | NodeRole::MasterClusterInit));
    let mut ha_masters = fixed
        .values()
        .filter(|role| **role == NodeRole::MasterHa)
        .count();

    let mut nodes: Vec<&String> = live.iter().collect();
    nodes.sort();
    nodes.dedup();

    let mut schedule = BTreeMap::new();
    for node in nodes.into_iter().filter(|node| !fixed.contains_key(node)) {
        let role = if !has_leader {
            has_leader = true;
            plan.leader_role()
        } else if plan.enabled && ha_masters < plan.master_nodes {
            ha_masters += 1;
            NodeRole::MasterHa
        } else {
            NodeRole::Worker
        };
        schedule.insert(node.clone(), role);
    }
    schedule
}

/// Nodes whose last announcement is at most `ttl` old
pub(crate) fn live_nodes(announcements: &BTreeMap<String, String>, now: i64, ttl: Duration) -> Vec<String> {
    let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    announcements
        .iter()
        .filter_map(|(node, seen)| {
            let seen: i64 = seen.trim().parse().ok()?;
            (now.saturating_sub(seen) <= ttl).then(|| node.clone())
        })
        .collect()
}

/// One election round, run by the `auto` role on every tick
pub async fn run_election(ctx: &RoleContext) -> Result<RoleProgress> {
    let announcements = ctx.ledger.entries(&ctx.buckets.nodes()).await?;
    let live = live_nodes(&announcements, Utc::now().timestamp(), NODE_TTL);

    let required = ctx.min_nodes.max(1);
    if live.len() < required {
        debug!(alive = live.len(), required, "Not enough nodes to assign roles");
        return Ok(RoleProgress::Pending(format!(
            "waiting for {} nodes, {} alive",
            required,
            live.len()
        )));
    }

    let Some(leader) = live.iter().min() else {
        return Ok(RoleProgress::Pending("no live nodes".to_string()));
    };
    if *leader != ctx.uuid {
        debug!(leader = %leader, "Not the leader, waiting for assignment");
        return Ok(RoleProgress::Done);
    }

    let assigned: BTreeMap<String, NodeRole> = ctx
        .ledger
        .entries(&ctx.buckets.roles())
        .await?
        .into_iter()
        .filter_map(|(node, role)| role.parse().ok().map(|role| (node, role)))
        .collect();

    let plan = ctx
        .intent
        .overlay
        .as_ref()
        .map(|overlay| HaPlan::from_config(&overlay.auto))
        .unwrap_or_default();

    for (node, role) in schedule_roles(&live, &assigned, plan) {
        ctx.ledger
            .put(&ctx.buckets.roles(), &node, role.as_str())
            .await?;
        info!(node = %node, role = %role, "Role assigned");
    }
    Ok(RoleProgress::Done)
}
