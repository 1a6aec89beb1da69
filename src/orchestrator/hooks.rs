//! Pre-bootstrap hooks
//!
//! Run before any bootstrap branch. Both are best-effort: the orchestrator
//! logs failures and carries on.

use std::path::Path;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::service::run_command;
use crate::{Error, Result};

/// Stage run before bootstrap by the OS stage runner
pub const BOOTSTRAP_STAGE: &str = "kairos-agent.bootstrap";

/// External hooks run before bootstrap
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapHooks: Send + Sync {
    /// Run a named stage of the OS stage runner
    async fn run_stage(&self, stage: &str) -> Result<()>;

    /// Run the hook script at `path`, when present
    async fn run_hook_script(&self, path: &Path) -> Result<()>;
}

/// Hooks executed through the local shell tools
#[derive(Clone, Debug, Default)]
pub struct ShellHooks;

#[async_trait]
impl BootstrapHooks for ShellHooks {
    async fn run_stage(&self, stage: &str) -> Result<()> {
        run_command("elemental", &["run-stage", stage])
            .await
            .map(|_| ())
            .map_err(Error::hook)
    }

    async fn run_hook_script(&self, path: &Path) -> Result<()> {
        if !path.is_file() {
            debug!(path = %path.display(), "No hook script installed");
            return Ok(());
        }
        let script = path.display().to_string();
        run_command(&script, &[]).await.map(|_| ()).map_err(Error::hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SystemLayout;

    #[tokio::test]
    async fn story_missing_hook_script_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SystemLayout::new(dir.path());
        ShellHooks
            .run_hook_script(&layout.bootstrap_hook())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_failing_hook_script_reports_a_hook_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let layout = SystemLayout::new(dir.path());
        let script = layout.bootstrap_hook();
        std::fs::create_dir_all(script.parent().unwrap()).unwrap();
        std::fs::write(&script, "#!/bin/sh\necho broken >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = ShellHooks.run_hook_script(&script).await.unwrap_err();
        assert!(matches!(err, Error::Hook(_)));
        assert!(err.to_string().contains("broken"));
    }
}
