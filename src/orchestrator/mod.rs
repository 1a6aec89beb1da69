//! Bootstrap decision tree
//!
//! Given the parsed [`BootstrapIntent`], the orchestrator picks one of:
//!
//! | Condition                                              | Path                 |
//! |--------------------------------------------------------|----------------------|
//! | no `p2p` block and no enabled `k3s`/`k3s-agent` block  | no-op                |
//! | (no token and a cluster block enabled) or auto off     | one-time bootstrap   |
//! | no token                                               | configuration error  |
//! | otherwise                                              | formation network    |
//!
//! The decision itself is the pure [`decide`] function. Every failure is
//! reported as an [`Outcome::Failed`] carrying the step it came from.

mod hooks;

pub use hooks::{BootstrapHooks, ShellHooks, BOOTSTRAP_STAGE};
#[cfg(test)]
pub(crate) use hooks::MockBootstrapHooks;

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::BootstrapIntent;
use crate::host::{Host, LocalHost};
use crate::install::OneTimeBootstrapper;
use crate::layout::SystemLayout;
use crate::node::{EdgeVpnLauncher, NodeLauncher, NodeSpec};
use crate::overlay::{EdgeVpnBackend, OverlayCoordinator};
use crate::sentinel::{FileSentinel, SentinelGuard};
use crate::{Error, Result, OVERLAY_DEFAULT_INSTANCE};

/// State reported when there is nothing to bootstrap
pub const NOOP_MESSAGE: &str = "no kairos or k3s configuration. nothing to do";

/// Error message when formation is requested without a network token
pub const MISSING_TOKEN_MESSAGE: &str = "no network token provided, or `k3s` block configured";

/// Path chosen for an intent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Nothing configured
    Noop,
    /// Install the cluster service locally, once
    OneTimeBootstrap,
    /// Formation requested without a network token
    MissingToken,
    /// Join the peer-to-peer formation network
    Formation,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Noop => write!(f, "noop"),
            Decision::OneTimeBootstrap => write!(f, "one-time bootstrap"),
            Decision::MissingToken => write!(f, "missing token"),
            Decision::Formation => write!(f, "formation"),
        }
    }
}

/// Evaluate the decision tree; first matching rule wins
pub fn decide(intent: &BootstrapIntent) -> Decision {
    if !intent.has_work() {
        return Decision::Noop;
    }

    let token_missing = intent.token_missing();
    if (token_missing && intent.cluster_block_enabled()) || intent.auto_formation_disabled() {
        Decision::OneTimeBootstrap
    } else if token_missing {
        Decision::MissingToken
    } else {
        Decision::Formation
    }
}

/// Step prefix of one-time bootstrap failures
pub const SETUP_FAILED: &str = "Failed setup";
/// Step prefix of overlay failures on the formation path
pub const VPN_SETUP_FAILED: &str = "Failed setup VPN";
/// Step prefix of node construction failures
pub const NODE_CREATE_FAILED: &str = "Failed creating node";
/// Step prefix of node start failures
pub const NODE_START_FAILED: &str = "Failed start";

/// Result of handling one bootstrap request
#[derive(Debug)]
pub enum Outcome {
    /// Nothing to do; carries the reported state
    Noop(String),
    /// Bootstrap completed
    Success,
    /// Bootstrap failed at a step
    Failed {
        /// Step prefix, e.g. `Failed setup`
        step: Option<&'static str>,
        /// Underlying error
        error: Error,
    },
}

impl Outcome {
    fn failed(step: &'static str, error: Error) -> Self {
        Self::Failed {
            step: Some(step),
            error,
        }
    }

    /// Error message reported to the caller, `None` unless failed
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Failed {
                step: Some(step),
                error,
            } => Some(format!("{}: {}", step, error)),
            Self::Failed { step: None, error } => Some(error.to_string()),
            _ => None,
        }
    }
}

/// Entry point of the bootstrap event
pub struct BootstrapOrchestrator {
    host: Arc<dyn Host>,
    sentinel: Arc<dyn SentinelGuard>,
    overlay: OverlayCoordinator,
    launcher: Arc<dyn NodeLauncher>,
    hooks: Arc<dyn BootstrapHooks>,
    layout: SystemLayout,
}

impl BootstrapOrchestrator {
    /// Create an orchestrator from its collaborators
    pub fn new(
        host: Arc<dyn Host>,
        sentinel: Arc<dyn SentinelGuard>,
        overlay: OverlayCoordinator,
        launcher: Arc<dyn NodeLauncher>,
        hooks: Arc<dyn BootstrapHooks>,
        layout: SystemLayout,
    ) -> Self {
        Self {
            host,
            sentinel,
            overlay,
            launcher,
            hooks,
            layout,
        }
    }

    /// Orchestrator wired to the real machine under `layout`
    pub fn local(layout: SystemLayout) -> Self {
        let host: Arc<dyn Host> = Arc::new(LocalHost::new(layout.clone()));
        let sentinel: Arc<dyn SentinelGuard> = Arc::new(FileSentinel::at(&layout));
        let overlay = OverlayCoordinator::new(Arc::new(EdgeVpnBackend::new(
            Arc::clone(&host),
            layout.clone(),
        )));
        let launcher = Arc::new(EdgeVpnLauncher::new(Arc::clone(&host), Arc::clone(&sentinel)));

        Self::new(host, sentinel, overlay, launcher, Arc::new(ShellHooks), layout)
    }

    /// Handle a bootstrap request
    ///
    /// Runs the pre-bootstrap hooks, then [`BootstrapOrchestrator::execute`].
    /// On the formation path this only returns on failure: a node that stops
    /// running is reported as [`Error::NodeReturned`].
    pub async fn handle(&self, intent: &BootstrapIntent, api_address: &str) -> Outcome {
        if decide(intent) == Decision::Noop {
            return Outcome::Noop(NOOP_MESSAGE.to_string());
        }
        if let Err(e) = self.run_hooks(intent).await {
            return Outcome::failed(SETUP_FAILED, e);
        }
        self.execute(intent, api_address).await
    }

    /// Run the bootstrap stage and the hook script
    ///
    /// Failures are logged and ignored, unless the agent runs in strict mode.
    pub async fn run_hooks(&self, intent: &BootstrapIntent) -> Result<()> {
        let strict = intent.agent.strict;

        if let Err(e) = self.hooks.run_stage(BOOTSTRAP_STAGE).await {
            if strict {
                return Err(e);
            }
            warn!(stage = BOOTSTRAP_STAGE, error = %e, "Bootstrap stage failed, continuing");
        }
        let script = self.layout.bootstrap_hook();
        if let Err(e) = self.hooks.run_hook_script(&script).await {
            if strict {
                return Err(e);
            }
            warn!(script = %script.display(), error = %e, "Bootstrap hook failed, continuing");
        }
        Ok(())
    }

    /// Take the bootstrap path selected by [`decide`], hooks already run
    pub async fn execute(&self, intent: &BootstrapIntent, api_address: &str) -> Outcome {
        let decision = decide(intent);
        info!(decision = %decision, "Bootstrap path selected");

        match decision {
            Decision::Noop => Outcome::Noop(NOOP_MESSAGE.to_string()),
            Decision::OneTimeBootstrap => self.one_time(intent, api_address).await,
            Decision::MissingToken => Outcome::Failed {
                step: None,
                error: Error::config(MISSING_TOKEN_MESSAGE),
            },
            Decision::Formation => self.formation(intent, api_address).await,
        }
    }

    async fn one_time(&self, intent: &BootstrapIntent, api_address: &str) -> Outcome {
        let bootstrapper =
            OneTimeBootstrapper::new(Arc::clone(&self.host), Arc::clone(&self.sentinel));
        let result = bootstrapper
            .run(intent, move || async move {
                match intent.overlay.as_ref() {
                    Some(overlay) => self
                        .overlay
                        .setup_vpn(OVERLAY_DEFAULT_INSTANCE, overlay, api_address)
                        .await
                        .map(|_| ()),
                    None => Ok(()),
                }
            })
            .await;

        match result {
            Ok(()) => Outcome::Success,
            Err(e) => {
                if e.is_environment_fatal() {
                    error!(error = %e, "Host cannot run the cluster service");
                } else {
                    warn!(error = %e, "One-time bootstrap failed");
                }
                Outcome::failed(SETUP_FAILED, e)
            }
        }
    }

    async fn formation(&self, intent: &BootstrapIntent, api_address: &str) -> Outcome {
        let Some(overlay) = intent.overlay.as_ref() else {
            return Outcome::Failed {
                step: None,
                error: Error::config(MISSING_TOKEN_MESSAGE),
            };
        };

        let handle = match self.overlay.establish(overlay, api_address).await {
            Ok(handle) => handle,
            Err(e) => return Outcome::failed(VPN_SETUP_FAILED, e),
        };
        info!(network_id = %handle.network_id, mode = %handle.mode, "Overlay ready");

        let spec = match NodeSpec::for_overlay(
            &handle,
            intent,
            self.host.machine_uuid(),
            &self.layout.state_dir(),
        ) {
            Ok(spec) => spec,
            Err(e) => return Outcome::failed(NODE_CREATE_FAILED, e),
        };

        match self.launcher.launch(spec, intent).await {
            Ok(()) => Outcome::Failed {
                step: None,
                error: Error::NodeReturned,
            },
            Err(e) => Outcome::failed(NODE_START_FAILED, e),
        }
    }
}
