//! Available upgrade releases
//!
//! Release tags are read from the image repository the running OS was built
//! from (`IMAGE_REPO` in `/etc/os-release`). Only tags shipping k3s are kept,
//! sorted by semantic version precedence. The `stable` filter drops tags
//! whose OS version is a pre-release.

mod registry;

pub use registry::{ImageReference, RegistryTagSource};

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use semver::Version;
use tracing::debug;

use crate::{Result, CLUSTER_DISTRIBUTION_MARKER};

/// Which releases to report
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseFilter {
    /// Every k3s release
    All,
    /// Only releases whose OS version has no pre-release component
    Stable,
}

impl ReleaseFilter {
    /// `"stable"` selects [`ReleaseFilter::Stable`], anything else [`ReleaseFilter::All`]
    pub fn from_data(data: &str) -> Self {
        if data.trim() == "stable" {
            Self::Stable
        } else {
            Self::All
        }
    }
}

/// Source of release tags
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TagSource: Send + Sync {
    /// Every tag of the release repository
    async fn list_tags(&self) -> Result<Vec<String>>;
}

/// Lists upgrade versions from a tag source
#[derive(Clone)]
pub struct ReleaseLister {
    source: Arc<dyn TagSource>,
}

impl ReleaseLister {
    /// Create a lister over the given source
    pub fn new(source: Arc<dyn TagSource>) -> Self {
        Self { source }
    }

    /// Sorted, filtered release tags
    pub async fn list(&self, filter: ReleaseFilter) -> Result<Vec<String>> {
        let tags = self.source.list_tags().await?;
        let total = tags.len();
        let releases = select_releases(tags, filter);
        debug!(total, kept = releases.len(), filter = ?filter, "Listed releases");
        Ok(releases)
    }
}

/// Keep k3s tags, sort them and apply the filter
pub fn select_releases(tags: Vec<String>, filter: ReleaseFilter) -> Vec<String> {
    let mut releases: Vec<String> = tags
        .into_iter()
        .filter(|tag| tag.contains(CLUSTER_DISTRIBUTION_MARKER))
        .collect();
    releases.sort_by(|a, b| compare_tags(a, b));

    if filter == ReleaseFilter::Stable {
        releases.retain(|tag| is_stable(tag));
    }
    releases
}

fn parse_tag(tag: &str) -> Option<Version> {
    Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
}

/// Semantic version precedence; unparsable tags sort last, lexically
fn compare_tags(a: &str, b: &str) -> Ordering {
    match (parse_tag(a), parse_tag(b)) {
        (Some(va), Some(vb)) => va.cmp_precedence(&vb).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// The OS version (before the `-k3s` suffix) carries no pre-release
///
/// `v1.0.0-k3sv1.23.9-k3s1` is stable, `v1.0.0-rc2-k3sv1.23.9-k3s1` is not.
fn is_stable(tag: &str) -> bool {
    let suffix = format!("-{}", CLUSTER_DISTRIBUTION_MARKER);
    let os_version = tag.split(suffix.as_str()).next().unwrap_or(tag);
    parse_tag(os_version).is_some_and(|version| version.pre.is_empty())
}
