//! Overlay network setup
//!
//! Formation needs at least the overlay coordination API; when node traffic
//! must also flow through the overlay, the full VPN is started instead. The
//! coordinator picks the mode from the configuration, the backend does the
//! actual work on the host.

pub mod ledger;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::config::OverlayConfig;
use crate::host::Host;
use crate::layout::SystemLayout;
use crate::{Error, Result, OVERLAY_API_INSTANCE, OVERLAY_DEFAULT_INSTANCE};

/// Overlay daemon log level when the configuration sets none
const DAEMON_LOG_LEVEL: &str = "info";

/// How the overlay was brought up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayMode {
    /// Full VPN: node traffic and coordination
    Vpn,
    /// Coordination API only
    ApiOnly,
}

impl std::fmt::Display for OverlayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vpn => write!(f, "vpn"),
            Self::ApiOnly => write!(f, "api"),
        }
    }
}

/// A running overlay, as seen by the formation node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayNetworkHandle {
    /// Network identifier
    pub network_id: String,
    /// Address of the coordination API
    pub api_address: String,
    /// Shared network token
    pub token: String,
    /// Nodes required before roles are assigned
    pub min_nodes: usize,
    /// VPN or API only
    pub mode: OverlayMode,
}

impl OverlayNetworkHandle {
    fn new(overlay: &OverlayConfig, api_address: &str, mode: OverlayMode) -> Self {
        Self {
            network_id: overlay.network_id().to_string(),
            api_address: api_address.to_string(),
            token: overlay.network_token.clone(),
            min_nodes: overlay.minimum_nodes,
            mode,
        }
    }
}

/// Starts overlay daemons on the host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OverlayBackend: Send + Sync {
    /// Start the full VPN daemon instance, serving the API on `api_address`
    async fn start_vpn(&self, instance: &str, api_address: &str, overlay: &OverlayConfig)
        -> Result<()>;

    /// Start the coordination-only API on `api_address`
    async fn start_api(&self, api_address: &str, overlay: &OverlayConfig) -> Result<()>;
}

/// Chooses and starts the overlay mode a configuration needs
#[derive(Clone)]
pub struct OverlayCoordinator {
    backend: Arc<dyn OverlayBackend>,
}

impl OverlayCoordinator {
    /// Create a coordinator over the given backend
    pub fn new(backend: Arc<dyn OverlayBackend>) -> Self {
        Self { backend }
    }

    /// Start the full VPN on the given daemon instance
    pub async fn setup_vpn(
        &self,
        instance: &str,
        overlay: &OverlayConfig,
        api_address: &str,
    ) -> Result<OverlayNetworkHandle> {
        info!(instance, network_id = %overlay.network_id(), "Configuring VPN");
        self.backend.start_vpn(instance, api_address, overlay).await?;
        Ok(OverlayNetworkHandle::new(overlay, api_address, OverlayMode::Vpn))
    }

    /// Start only the coordination API
    pub async fn setup_api(
        &self,
        overlay: &OverlayConfig,
        api_address: &str,
    ) -> Result<OverlayNetworkHandle> {
        info!(network_id = %overlay.network_id(), "Configuring API");
        self.backend.start_api(api_address, overlay).await?;
        Ok(OverlayNetworkHandle::new(overlay, api_address, OverlayMode::ApiOnly))
    }

    /// Full VPN when node traffic needs the overlay, otherwise the API alone
    pub async fn establish(
        &self,
        overlay: &OverlayConfig,
        api_address: &str,
    ) -> Result<OverlayNetworkHandle> {
        if overlay.vpn_needs_creation() {
            self.setup_vpn(OVERLAY_DEFAULT_INSTANCE, overlay, api_address)
                .await
        } else {
            self.setup_api(overlay, api_address).await
        }
    }
}

/// EdgeVPN daemon driven through the host init system
///
/// VPN mode configures the packaged `edgevpn@<instance>` unit through its
/// environment file. API mode reuses the `edgevpn@api` unit with the VPN
/// disabled and its command overridden to `edgevpn api`.
#[derive(Clone)]
pub struct EdgeVpnBackend {
    host: Arc<dyn Host>,
    layout: SystemLayout,
}

impl EdgeVpnBackend {
    /// Create a backend for the given host
    pub fn new(host: Arc<dyn Host>, layout: SystemLayout) -> Self {
        Self { host, layout }
    }

    fn unit(instance: &str) -> String {
        format!("edgevpn@{}", instance)
    }

    /// Daemon environment shared by both modes, `vpn.env` entries win
    fn daemon_env(api_address: &str, overlay: &OverlayConfig, vpn: bool) -> BTreeMap<String, String> {
        let listen = api_address
            .split_once("://")
            .map_or(api_address, |(_, rest)| rest);
        let log_level = if overlay.log_level.is_empty() {
            DAEMON_LOG_LEVEL
        } else {
            overlay.log_level.as_str()
        };

        let mut env = BTreeMap::from([
            ("EDGEVPNTOKEN".to_string(), overlay.network_token.clone()),
            ("API".to_string(), "true".to_string()),
            ("APILISTEN".to_string(), listen.to_string()),
            ("EDGEVPNLOGLEVEL".to_string(), log_level.to_string()),
        ]);
        if vpn {
            let dhcp = !overlay.vpn.env.contains_key("ADDRESS");
            env.insert("DHCP".to_string(), dhcp.to_string());
        } else {
            env.insert("VPN".to_string(), "false".to_string());
        }
        env.extend(overlay.vpn.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    async fn start_unit(&self, unit: &str, env: &BTreeMap<String, String>, command: Option<String>) -> Result<()> {
        let init = self.host.init_system().ok_or(Error::InitSystemUndetected)?;
        self.host.write_env(unit, env).await?;

        let svc = self.host.service(init, unit);
        if let Some(command) = command {
            svc.override_cmd(&command).await?;
        }
        svc.start().await?;
        svc.enable().await?;
        info!(service = %unit, "Overlay daemon started");
        Ok(())
    }
}

#[async_trait]
impl OverlayBackend for EdgeVpnBackend {
    async fn start_vpn(&self, instance: &str, api_address: &str, overlay: &OverlayConfig) -> Result<()> {
        let env = Self::daemon_env(api_address, overlay, true);
        self.start_unit(&Self::unit(instance), &env, None).await
    }

    async fn start_api(&self, api_address: &str, overlay: &OverlayConfig) -> Result<()> {
        let env = Self::daemon_env(api_address, overlay, false);
        let command = format!("{} api", self.layout.overlay_binary().display());
        self.start_unit(&Self::unit(OVERLAY_API_INSTANCE), &env, Some(command))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{InitSystem, MockHost};
    use crate::service::testing::{CallLog, RecordingService};

    fn overlay(yaml: &str) -> OverlayConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    // ==========================================================================
    // Story: Choosing between the VPN and the API
    // ==========================================================================

    #[tokio::test]
    async fn story_default_overlay_starts_the_full_vpn() {
        let mut backend = MockOverlayBackend::new();
        backend
            .expect_start_vpn()
            .withf(|instance: &str, api: &str, _: &OverlayConfig| {
                instance == "kairos" && api == "127.0.0.1:8080"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        backend.expect_start_api().never();

        let coordinator = OverlayCoordinator::new(Arc::new(backend));
        let cfg = overlay("network_token: abc\nminimum_nodes: 2\n");
        let handle = coordinator.establish(&cfg, "127.0.0.1:8080").await.unwrap();

        assert_eq!(handle.mode, OverlayMode::Vpn);
        assert_eq!(handle.network_id, "kairos");
        assert_eq!(handle.token, "abc");
        assert_eq!(handle.min_nodes, 2);
        assert_eq!(handle.api_address, "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn story_vpn_disabled_starts_only_the_api() {
        let mut backend = MockOverlayBackend::new();
        backend.expect_start_vpn().never();
        backend
            .expect_start_api()
            .times(1)
            .returning(|_, _| Ok(()));

        let coordinator = OverlayCoordinator::new(Arc::new(backend));
        let cfg = overlay("network_token: abc\nnetwork_id: lab\nvpn:\n  create: false\n  use: false\n");
        let handle = coordinator.establish(&cfg, "127.0.0.1:8080").await.unwrap();

        assert_eq!(handle.mode, OverlayMode::ApiOnly);
        assert_eq!(handle.network_id, "lab");
    }

    #[tokio::test]
    async fn story_backend_failure_propagates() {
        let mut backend = MockOverlayBackend::new();
        backend
            .expect_start_vpn()
            .returning(|_, _, _| Err(Error::overlay("edgevpn not installed")));

        let coordinator = OverlayCoordinator::new(Arc::new(backend));
        let err = coordinator
            .establish(&overlay("network_token: abc\n"), "127.0.0.1:8080")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("edgevpn not installed"));
    }

    // ==========================================================================
    // Story: EdgeVPN daemon configuration
    // ==========================================================================

    fn recording_host(calls: CallLog, envs: Arc<std::sync::Mutex<Vec<(String, BTreeMap<String, String>)>>>) -> MockHost {
        let mut host = MockHost::new();
        host.expect_init_system().return_const(Some(InitSystem::Systemd));
        host.expect_write_env().returning(move |svc, vars| {
            envs.lock().unwrap().push((svc.to_string(), vars.clone()));
            Ok(())
        });
        host.expect_service().returning(move |_, name| {
            Box::new(RecordingService::new(name, calls.clone()))
        });
        host
    }

    #[tokio::test]
    async fn story_vpn_unit_is_configured_started_and_enabled() {
        let calls = CallLog::default();
        let envs = Arc::default();
        let host = recording_host(calls.clone(), Arc::clone(&envs));
        let backend = EdgeVpnBackend::new(Arc::new(host), SystemLayout::default());

        let cfg = overlay("network_token: abc\nvpn:\n  env:\n    ADDRESS: 10.1.0.3/24\n");
        backend.start_vpn("kairos", "127.0.0.1:8080", &cfg).await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["start edgevpn@kairos", "enable edgevpn@kairos"]
        );
        let envs = envs.lock().unwrap();
        let (unit, env) = &envs[0];
        assert_eq!(unit, "edgevpn@kairos");
        assert_eq!(env["EDGEVPNTOKEN"], "abc");
        assert_eq!(env["APILISTEN"], "127.0.0.1:8080");
        assert_eq!(env["EDGEVPNLOGLEVEL"], "info");
        assert_eq!(env["DHCP"], "false");
        assert_eq!(env["ADDRESS"], "10.1.0.3/24");
        assert!(!env.contains_key("VPN"));
    }

    #[tokio::test]
    async fn story_api_unit_runs_edgevpn_api_without_vpn() {
        let calls = CallLog::default();
        let envs = Arc::default();
        let host = recording_host(calls.clone(), Arc::clone(&envs));
        let backend = EdgeVpnBackend::new(Arc::new(host), SystemLayout::default());

        let cfg = overlay("network_token: abc\nloglevel: warn\n");
        backend.start_api("http://127.0.0.1:8080", &cfg).await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "override edgevpn@api /usr/bin/edgevpn api",
                "start edgevpn@api",
                "enable edgevpn@api",
            ]
        );
        let envs = envs.lock().unwrap();
        let (_, env) = &envs[0];
        assert_eq!(env["VPN"], "false");
        assert_eq!(env["APILISTEN"], "127.0.0.1:8080");
        assert_eq!(env["EDGEVPNLOGLEVEL"], "warn");
    }

    #[tokio::test]
    async fn story_no_init_system_means_no_overlay() {
        let mut host = MockHost::new();
        host.expect_init_system().return_const(None);
        host.expect_write_env().never();
        host.expect_service().never();

        let backend = EdgeVpnBackend::new(Arc::new(host), SystemLayout::default());
        let err = backend
            .start_vpn("kairos", "127.0.0.1:8080", &overlay("network_token: abc\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InitSystemUndetected));
    }
}
