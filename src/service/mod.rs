//! Init system service control
//!
//! A thin contract over the local init system: override the launch command
//! of a named unit, start it and enable it for future boots. Both supported
//! families (systemd and openrc) shell out to their native tools.

pub mod env;

use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info};

use crate::layout::SystemLayout;
use crate::{Error, Result};

/// Control over one named service of the local init system
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Replace the command the service runs
    async fn override_cmd(&self, command: &str) -> Result<()>;

    /// Start the service now
    async fn start(&self) -> Result<()>;

    /// Enable the service on future boots
    async fn enable(&self) -> Result<()>;
}

/// Run a command to completion, returning stdout or stderr as the failure
pub(crate) async fn run_command(cmd: &str, args: &[&str]) -> std::result::Result<String, String> {
    debug!(command = %cmd, args = ?args, "Running command");
    let output = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", cmd, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{} {} exited with {}: {}",
            cmd,
            args.join(" "),
            output.status,
            stderr.trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

// =============================================================================
// systemd
// =============================================================================

/// A systemd unit, overridden through a drop-in file
#[derive(Clone, Debug)]
pub struct SystemdService {
    name: String,
    layout: SystemLayout,
}

impl SystemdService {
    /// Create a controller for the named unit
    pub fn new(name: impl Into<String>, layout: SystemLayout) -> Self {
        Self {
            name: name.into(),
            layout,
        }
    }

    /// Unit name, e.g. `k3s` or `edgevpn@kairos`
    pub fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> String {
        format!("{}.service", self.name)
    }

    /// Drop-in clearing the packaged `ExecStart`, setting ours and loading
    /// the service environment file
    fn override_dropin(&self, command: &str) -> String {
        format!(
            "[Service]\nEnvironmentFile=-/etc/sysconfig/{}\nExecStart=\nExecStart={}\n",
            self.name, command
        )
    }
}

#[async_trait]
impl ServiceController for SystemdService {
    async fn override_cmd(&self, command: &str) -> Result<()> {
        let dir = self.layout.systemd_dropin_dir(&self.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::service_override(&self.name, e.to_string()))?;
        tokio::fs::write(dir.join("override.conf"), self.override_dropin(command))
            .await
            .map_err(|e| Error::service_override(&self.name, e.to_string()))?;

        run_command("systemctl", &["daemon-reload"])
            .await
            .map_err(|e| Error::service_override(&self.name, e))?;
        info!(service = %self.name, command = %command, "Service command overridden");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        run_command("systemctl", &["start", &self.unit()])
            .await
            .map_err(|e| Error::service_start(&self.name, e))?;
        info!(service = %self.name, "Service started");
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        run_command("systemctl", &["enable", &self.unit()])
            .await
            .map_err(|e| Error::service_enable(&self.name, e))?;
        info!(service = %self.name, "Service enabled");
        Ok(())
    }
}

// =============================================================================
// openrc
// =============================================================================

/// An openrc service, overridden by rewriting its init script
#[derive(Clone, Debug)]
pub struct OpenRcService {
    name: String,
    layout: SystemLayout,
}

impl OpenRcService {
    /// Create a controller for the named service
    pub fn new(name: impl Into<String>, layout: SystemLayout) -> Self {
        Self {
            name: name.into(),
            layout,
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Supervised init script running `command`, sourcing the service env file
    fn init_script(&self, command: &str) -> String {
        let (program, args) = command
            .trim()
            .split_once(char::is_whitespace)
            .map(|(program, args)| (program, args.trim()))
            .unwrap_or((command.trim(), ""));

        format!(
            r#"#!/sbin/openrc-run

depend() {{
    after net-online
    need net
}}

supervisor=supervise-daemon
name="{name}"
command="{program}"
command_args="{args}"
pidfile="/var/run/{name}.pid"
respawn_delay=5
respawn_max=0

set -o allexport
if [ -f /etc/environment ]; then . /etc/environment; fi
if [ -f /etc/sysconfig/{name} ]; then . /etc/sysconfig/{name}; fi
set +o allexport
"#,
            name = self.name,
            program = program,
            args = args.replace('"', "\\\""),
        )
    }
}

#[async_trait]
impl ServiceController for OpenRcService {
    async fn override_cmd(&self, command: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let script = self.layout.openrc_script(&self.name);
        if let Some(parent) = script.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::service_override(&self.name, e.to_string()))?;
        }
        tokio::fs::write(&script, self.init_script(command))
            .await
            .map_err(|e| Error::service_override(&self.name, e.to_string()))?;
        tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| Error::service_override(&self.name, e.to_string()))?;

        info!(service = %self.name, command = %command, "Service command overridden");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        run_command("rc-service", &[&self.name, "start"])
            .await
            .map_err(|e| Error::service_start(&self.name, e))?;
        info!(service = %self.name, "Service started");
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        run_command("rc-update", &["add", &self.name, "default"])
            .await
            .map_err(|e| Error::service_enable(&self.name, e))?;
        info!(service = %self.name, "Service enabled");
        Ok(())
    }
}
