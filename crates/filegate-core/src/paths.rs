//! Logical-to-physical path resolution for the shared stores.
//!
//! All shared stores (queue, archives, notifications, uploads, metadata,
//! staging) hang off a single base directory, normally a network share. The
//! resolver probes the share for reachability — existence plus an actual
//! sentinel write, since a mount can be present but read-only — and caches
//! the result for a bounded interval. When the share is unreachable it
//! resolves against the configured local fallback and marks itself
//! `DEGRADED`; callers surface that flag and the engine refuses
//! state-changing writes in degraded mode unless explicitly permitted.
//!
//! The project root is deliberately not probed here: direct delivery into
//! the project tree has its own elevation/fallback policy in the placement
//! pipeline, which needs to observe the real permission failure.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::EngineConfig;

/// Sentinel filename used by the reachability probe.
const PROBE_SENTINEL: &str = ".reachability-probe";

/// Logical roots resolved against the shared base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRoot {
    /// Live approval queue and its sibling documents.
    Queue,
    /// Terminal-submission archives.
    Archive,
    /// Per-user notification inboxes.
    Notify,
    /// Per-user upload directories.
    Upload,
    /// Metadata sidecar tree.
    Metadata,
    /// Staged artifacts awaiting privileged placement.
    Staging,
    /// Final project tree (separately configured, never falls back).
    Project,
}

impl StoreRoot {
    /// Subdirectory of the shared base for this root, if it is share-hosted.
    const fn shared_subdir(self) -> Option<&'static str> {
        match self {
            Self::Queue => Some("approvals"),
            Self::Archive => Some("approvals/archive"),
            Self::Notify => Some("notifications"),
            Self::Upload => Some("uploads"),
            Self::Metadata => Some("metadata"),
            Self::Staging => Some("staging"),
            Self::Project => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ProbeResult {
    checked_at: Instant,
    reachable: bool,
}

/// Resolves logical store roots to physical directories.
#[derive(Debug)]
pub struct PathResolver {
    network_root: PathBuf,
    local_fallback_root: PathBuf,
    project_root: PathBuf,
    staging_root: Option<PathBuf>,
    probe_cache_ttl: Duration,
    probe: Mutex<Option<ProbeResult>>,
    degraded: AtomicBool,
}

impl PathResolver {
    /// Builds a resolver from configuration.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let staging_root = config.staging_root.clone();
        Self {
            network_root: config.network_root.clone(),
            local_fallback_root: config.local_fallback_root.clone(),
            project_root: config.project_root(),
            staging_root,
            probe_cache_ttl: Duration::from_secs(config.probe_cache_seconds),
            probe: Mutex::new(None),
            degraded: AtomicBool::new(false),
        }
    }

    /// Resolves a logical root to a physical directory.
    ///
    /// Share-hosted roots resolve under the network base when reachable and
    /// under the local fallback otherwise. The project root resolves to its
    /// configured location unconditionally, and an explicitly configured
    /// staging root likewise bypasses the shared base.
    #[must_use]
    pub fn resolve(&self, root: StoreRoot) -> PathBuf {
        if root == StoreRoot::Project {
            return self.project_root.clone();
        }
        if root == StoreRoot::Staging {
            if let Some(explicit) = &self.staging_root {
                return explicit.clone();
            }
        }
        let subdir = root
            .shared_subdir()
            .expect("non-project roots have a shared subdir");
        self.shared_base().join(subdir)
    }

    /// Current physical base for the shared stores.
    ///
    /// Probes reachability if the cached result is stale, flipping the
    /// degraded flag to match the outcome.
    #[must_use]
    pub fn shared_base(&self) -> PathBuf {
        if self.probe_reachable() {
            self.network_root.clone()
        } else {
            self.local_fallback_root.clone()
        }
    }

    /// Returns true when the resolver is serving from the local fallback.
    #[must_use]
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Drops the cached probe result so the next access re-probes.
    pub fn invalidate_probe(&self) {
        let mut guard = self.probe.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = None;
    }

    fn probe_reachable(&self) -> bool {
        let mut guard = self.probe.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(cached) = *guard {
            if cached.checked_at.elapsed() < self.probe_cache_ttl {
                return cached.reachable;
            }
        }

        let reachable = probe_writable(&self.network_root);
        *guard = Some(ProbeResult {
            checked_at: Instant::now(),
            reachable,
        });
        drop(guard);

        let was_degraded = self.degraded.swap(!reachable, Ordering::Relaxed);
        if !reachable && !was_degraded {
            warn!(
                network_root = %self.network_root.display(),
                fallback = %self.local_fallback_root.display(),
                "shared store unreachable, entering degraded mode"
            );
        }
        reachable
    }
}

/// Probes that `base` exists and accepts writes.
///
/// The sentinel write is idempotent: the file carries a per-process name
/// and is removed on success, so concurrent probes from different hosts do
/// not interfere.
fn probe_writable(base: &std::path::Path) -> bool {
    if std::fs::create_dir_all(base).is_err() {
        return false;
    }
    let sentinel = base.join(format!("{PROBE_SENTINEL}.{}", std::process::id()));
    match std::fs::write(&sentinel, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&sentinel);
            true
        },
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn config_with_roots(network: PathBuf, fallback: PathBuf) -> EngineConfig {
        EngineConfig {
            network_root: network,
            local_fallback_root: fallback,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn resolves_under_reachable_network_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let network = tmp.path().join("share");
        let config = config_with_roots(network.clone(), tmp.path().join("local"));
        let resolver = PathResolver::new(&config);

        assert_eq!(resolver.resolve(StoreRoot::Queue), network.join("approvals"));
        assert_eq!(
            resolver.resolve(StoreRoot::Archive),
            network.join("approvals/archive")
        );
        assert_eq!(
            resolver.resolve(StoreRoot::Notify),
            network.join("notifications")
        );
        assert!(!resolver.degraded());
    }

    #[test]
    fn falls_back_when_network_root_unwritable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        // A path below a regular file can never be created.
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").expect("write blocker");
        let fallback = tmp.path().join("local");

        let config = config_with_roots(blocker.join("share"), fallback.clone());
        let resolver = PathResolver::new(&config);

        assert_eq!(
            resolver.resolve(StoreRoot::Queue),
            fallback.join("approvals")
        );
        assert!(resolver.degraded());
    }

    #[test]
    fn probe_result_is_cached() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let network = tmp.path().join("share");
        let config = config_with_roots(network.clone(), tmp.path().join("local"));
        let resolver = PathResolver::new(&config);

        assert!(!resolver.degraded());
        let _ = resolver.shared_base();

        // Making the root unreachable is not observed until the cache
        // expires or is invalidated.
        std::fs::remove_dir_all(&network).expect("remove share");
        std::fs::write(&network, b"now a file").expect("block share");
        assert_eq!(resolver.shared_base(), network);

        resolver.invalidate_probe();
        assert_eq!(resolver.shared_base(), tmp.path().join("local"));
        assert!(resolver.degraded());
    }

    #[test]
    fn project_root_never_falls_back() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").expect("write blocker");

        let mut config = config_with_roots(blocker.join("share"), tmp.path().join("local"));
        config.project_root = Some(PathBuf::from("/exports/projects"));
        let resolver = PathResolver::new(&config);

        assert_eq!(
            resolver.resolve(StoreRoot::Project),
            PathBuf::from("/exports/projects")
        );
    }

    #[test]
    fn explicit_staging_root_bypasses_shared_base() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config =
            config_with_roots(tmp.path().join("share"), tmp.path().join("local"));
        config.staging_root = Some(tmp.path().join("elsewhere"));
        let resolver = PathResolver::new(&config);

        assert_eq!(
            resolver.resolve(StoreRoot::Staging),
            tmp.path().join("elsewhere")
        );
    }

    #[test]
    fn probe_sentinel_is_cleaned_up() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(probe_writable(tmp.path()));
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .expect("read dir")
            .collect();
        assert!(leftovers.is_empty(), "probe must remove its sentinel");
    }
}
