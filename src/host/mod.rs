//! Host facts and service construction
//!
//! The [`Host`] trait is the single seam between bootstrap logic and the
//! machine it runs on: init system detection, k3s binary lookup, machine
//! identity, service handles and service environment files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;
use uuid::Uuid;

use crate::layout::SystemLayout;
use crate::service::{env, OpenRcService, ServiceController, SystemdService};
use crate::Result;

/// Supported init system families
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitSystem {
    /// systemd
    Systemd,
    /// openrc
    OpenRc,
}

impl std::fmt::Display for InitSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Systemd => write!(f, "systemd"),
            Self::OpenRc => write!(f, "openrc"),
        }
    }
}

/// The machine being bootstrapped
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Host: Send + Sync {
    /// Detect the init system, `None` when neither family is present
    fn init_system(&self) -> Option<InitSystem>;

    /// Locate the k3s binary
    fn cluster_binary(&self) -> Option<PathBuf>;

    /// Paths searched by [`Host::cluster_binary`], for error reporting
    fn binary_search_paths(&self) -> Vec<PathBuf>;

    /// Stable unique identifier of this machine
    fn machine_uuid(&self) -> String;

    /// Build a controller for the named service
    fn service(&self, init: InitSystem, name: &str) -> Box<dyn ServiceController>;

    /// Merge `vars` into the environment file of the named service
    async fn write_env(&self, service: &str, vars: &BTreeMap<String, String>) -> Result<()>;
}

/// The real machine, with every path resolved against a [`SystemLayout`]
#[derive(Clone, Debug, Default)]
pub struct LocalHost {
    layout: SystemLayout,
}

impl LocalHost {
    /// Create a host view over the given layout
    pub fn new(layout: SystemLayout) -> Self {
        Self { layout }
    }

    fn read_trimmed(&self, path: PathBuf) -> Option<String> {
        std::fs::read_to_string(path)
            .ok()
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
    }
}

#[async_trait]
impl Host for LocalHost {
    fn init_system(&self) -> Option<InitSystem> {
        if self.layout.openrc_run().exists() {
            Some(InitSystem::OpenRc)
        } else if self.layout.systemd_runtime_dir().is_dir() {
            Some(InitSystem::Systemd)
        } else {
            None
        }
    }

    fn cluster_binary(&self) -> Option<PathBuf> {
        self.layout.k3s_binaries().into_iter().find(|p| p.is_file())
    }

    fn binary_search_paths(&self) -> Vec<PathBuf> {
        self.layout.k3s_binaries()
    }

    fn machine_uuid(&self) -> String {
        if let Some(id) = self.read_trimmed(self.layout.machine_id()) {
            if let Ok(uuid) = Uuid::parse_str(&id) {
                return uuid.hyphenated().to_string();
            }
        }
        if let Some(id) = self.read_trimmed(self.layout.product_uuid()) {
            return id.to_lowercase();
        }

        let hostname = self
            .read_trimmed(self.layout.hostname())
            .unwrap_or_else(|| "localhost".to_string());
        debug!(hostname = %hostname, "No machine id found, deriving uuid from hostname");
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, hostname.as_bytes()).to_string()
    }

    fn service(&self, init: InitSystem, name: &str) -> Box<dyn ServiceController> {
        match init {
            InitSystem::Systemd => Box::new(SystemdService::new(name, self.layout.clone())),
            InitSystem::OpenRc => Box::new(OpenRcService::new(name, self.layout.clone())),
        }
    }

    async fn write_env(&self, service: &str, vars: &BTreeMap<String, String>) -> Result<()> {
        env::write_env_file(&self.layout.env_file(service), vars).await
    }
}
