//! One-time local installation of the cluster service
//!
//! Installs and starts k3s (server or agent) exactly once per machine:
//!
//! 1. Skip when the sentinel says a previous run completed
//! 2. Pick the flavor: `k3s` server wins over `k3s-agent`
//! 3. Detect the init system
//! 4. Write the service environment file
//! 5. Locate the k3s binary
//! 6. Override the service command to `<binary> <role> <args>`
//! 7. Start, then enable the service
//! 8. Set up the overlay VPN when the configuration needs one
//! 9. Create the sentinel
//!
//! Steps 3 to 7 are shared with the formation role handlers through
//! [`install_cluster_service`]. There are no retries: the first failing step
//! aborts and the sentinel stays unset, so the next boot tries again.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::config::{BootstrapIntent, ClusterKind};
use crate::host::Host;
use crate::sentinel::SentinelGuard;
use crate::{Error, Result};

/// Launch command for a k3s flavor: `<binary> <role> <args joined by space>`
///
/// The trailing space of an empty argument list is kept, matching the
/// command k3s units have always been installed with.
pub fn launch_command(binary: &str, kind: ClusterKind, args: &[String]) -> String {
    format!("{} {} {}", binary, kind.role_arg(), args.join(" "))
}

/// Install, start and enable a k3s service flavor on the host
pub async fn install_cluster_service(
    host: &dyn Host,
    kind: ClusterKind,
    env: &BTreeMap<String, String>,
    args: &[String],
) -> Result<()> {
    let service = kind.service_name();

    let init = host.init_system().ok_or(Error::InitSystemUndetected)?;
    info!(service, init = %init, "Installing cluster service");
    let svc = host.service(init, service);

    host.write_env(service, env).await?;

    let binary = host.cluster_binary().ok_or_else(|| {
        let searched: Vec<String> = host
            .binary_search_paths()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        Error::binary_not_found(searched.join(", "))
    })?;

    let command = launch_command(&binary.display().to_string(), kind, args);
    svc.override_cmd(&command).await?;
    svc.start().await?;
    svc.enable().await?;

    info!(service, command = %command, "Cluster service running");
    Ok(())
}

/// Runs the local installation at most once per machine
#[derive(Clone)]
pub struct OneTimeBootstrapper {
    host: Arc<dyn Host>,
    sentinel: Arc<dyn SentinelGuard>,
}

impl OneTimeBootstrapper {
    /// Create a bootstrapper
    pub fn new(host: Arc<dyn Host>, sentinel: Arc<dyn SentinelGuard>) -> Self {
        Self { host, sentinel }
    }

    /// Run the one-time bootstrap
    ///
    /// `overlay_setup` is invoked after the service is running, only when the
    /// overlay block is present and needs a VPN.
    pub async fn run<F, Fut>(&self, intent: &BootstrapIntent, overlay_setup: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.sentinel.exists() {
            info!("Sentinel exists, nothing to do");
            return Ok(());
        }
        info!("One time bootstrap starting");

        let (kind, cfg) = intent.local_cluster();
        install_cluster_service(self.host.as_ref(), kind, &cfg.env, &cfg.args).await?;

        if intent
            .overlay
            .as_ref()
            .is_some_and(|overlay| overlay.vpn_needs_creation())
        {
            overlay_setup().await?;
        }

        self.sentinel.create()?;
        info!(service = kind.service_name(), "One time bootstrap complete");
        Ok(())
    }
}
