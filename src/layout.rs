//! Well-known filesystem locations
//!
//! Every path the provider reads or writes is resolved against a root
//! directory. Production uses `/`; tests point the root at a temp dir.

use std::path::{Path, PathBuf};

/// Marker file recording that the one-time bootstrap completed
pub const SENTINEL_PATH: &str = "/usr/local/.kairos/deployed";

/// Default directory for persisted formation node state
pub const DEFAULT_STATE_DIR: &str = "/usr/local/.kairos/state";

/// Hook script run before bootstrap
pub const BOOTSTRAP_HOOK_PATH: &str = "/usr/bin/kairos-agent.bootstrap.hook";

/// Directory holding per-service environment files
const ENV_DIR: &str = "/etc/sysconfig";

const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";
const SYSTEMD_RUNTIME_DIR: &str = "/run/systemd/system";
const OPENRC_INIT_DIR: &str = "/etc/init.d";
const OPENRC_RUN: &str = "/sbin/openrc-run";

const K3S_BINARIES: [&str; 2] = ["/usr/bin/k3s", "/usr/local/bin/k3s"];
const OVERLAY_BINARY: &str = "/usr/bin/edgevpn";

/// Filesystem layout rooted at a base directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemLayout {
    root: PathBuf,
}

impl Default for SystemLayout {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SystemLayout {
    /// Create a layout rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an absolute path against the root
    pub fn path(&self, absolute: impl AsRef<Path>) -> PathBuf {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix("/").unwrap_or(absolute);
        self.root.join(relative)
    }

    /// Sentinel marker file
    pub fn sentinel(&self) -> PathBuf {
        self.path(SENTINEL_PATH)
    }

    /// Default formation node state directory
    pub fn state_dir(&self) -> PathBuf {
        self.path(DEFAULT_STATE_DIR)
    }

    /// Environment file consumed by a service at start time
    pub fn env_file(&self, service: &str) -> PathBuf {
        self.path(ENV_DIR).join(service)
    }

    /// Pre-bootstrap hook script
    pub fn bootstrap_hook(&self) -> PathBuf {
        self.path(BOOTSTRAP_HOOK_PATH)
    }

    /// systemd drop-in directory for a unit
    pub fn systemd_dropin_dir(&self, service: &str) -> PathBuf {
        self.path(SYSTEMD_UNIT_DIR)
            .join(format!("{}.service.d", service))
    }

    /// systemd runtime directory, present only when systemd is PID 1
    pub fn systemd_runtime_dir(&self) -> PathBuf {
        self.path(SYSTEMD_RUNTIME_DIR)
    }

    /// openrc init script for a service
    pub fn openrc_script(&self, service: &str) -> PathBuf {
        self.path(OPENRC_INIT_DIR).join(service)
    }

    /// openrc runner binary, present only on openrc based systems
    pub fn openrc_run(&self) -> PathBuf {
        self.path(OPENRC_RUN)
    }

    /// Candidate locations of the k3s binary, in lookup order
    pub fn k3s_binaries(&self) -> Vec<PathBuf> {
        K3S_BINARIES.iter().map(|p| self.path(p)).collect()
    }

    /// Overlay daemon binary
    pub fn overlay_binary(&self) -> PathBuf {
        self.path(OVERLAY_BINARY)
    }

    /// systemd/dbus machine id
    pub fn machine_id(&self) -> PathBuf {
        self.path("/etc/machine-id")
    }

    /// DMI product UUID
    pub fn product_uuid(&self) -> PathBuf {
        self.path("/sys/class/dmi/id/product_uuid")
    }

    /// Static hostname
    pub fn hostname(&self) -> PathBuf {
        self.path("/etc/hostname")
    }

    /// os-release file describing the installed image
    pub fn os_release(&self) -> PathBuf {
        self.path("/etc/os-release")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_rooted_at_slash() {
        let layout = SystemLayout::default();
        assert_eq!(layout.sentinel(), PathBuf::from(SENTINEL_PATH));
        assert_eq!(layout.env_file("k3s"), PathBuf::from("/etc/sysconfig/k3s"));
    }

    #[test]
    fn custom_root_prefixes_every_path() {
        let layout = SystemLayout::new("/tmp/machine");
        assert_eq!(
            layout.sentinel(),
            PathBuf::from("/tmp/machine/usr/local/.kairos/deployed")
        );
        assert_eq!(
            layout.systemd_dropin_dir("edgevpn@kairos"),
            PathBuf::from("/tmp/machine/etc/systemd/system/edgevpn@kairos.service.d")
        );
        assert_eq!(
            layout.k3s_binaries(),
            vec![
                PathBuf::from("/tmp/machine/usr/bin/k3s"),
                PathBuf::from("/tmp/machine/usr/local/bin/k3s"),
            ]
        );
    }

    #[test]
    fn relative_paths_are_joined_as_is() {
        let layout = SystemLayout::new("/r");
        assert_eq!(layout.path("etc/hosts"), PathBuf::from("/r/etc/hosts"));
    }
}
