//! Volume binding.
//!
//! Resolves a template's host-path mounts to concrete paths on the node an
//! instance was placed on. Host paths are node-local and expected to exist
//! already; resolution is a lookup, never a provisioning step, and it does
//! not retry. A failure surfaces to the reconciler as an instance start
//! failure.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use rekon_id::NodeName;

use crate::error::{ControllerError, ControllerResult};
use crate::model::{BoundVolume, VolumeMount};

/// Answers whether a concrete path is accessible on a node.
pub trait HostPaths: Send + Sync {
    fn is_accessible(&self, node: &NodeName, path: &Path) -> bool;
}

/// Checks paths on the local filesystem.
///
/// Suitable when nodes are directories on the controller's own host
/// (see [`VolumeBinder::with_node_roots`]) or for a single-node setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHostPaths;

impl HostPaths for LocalHostPaths {
    fn is_accessible(&self, _node: &NodeName, path: &Path) -> bool {
        std::fs::metadata(path).is_ok()
    }
}

/// Fixed table of accessible paths, for tests and simulation.
#[derive(Debug, Clone, Default)]
pub struct StaticHostPaths {
    per_node: BTreeMap<NodeName, BTreeSet<PathBuf>>,
    everywhere: BTreeSet<PathBuf>,
}

impl StaticHostPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `path` accessible on `node` only.
    pub fn with_path(mut self, node: NodeName, path: impl Into<PathBuf>) -> Self {
        self.per_node.entry(node).or_default().insert(path.into());
        self
    }

    /// Make `path` accessible on every node.
    pub fn with_shared_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.everywhere.insert(path.into());
        self
    }
}

impl HostPaths for StaticHostPaths {
    fn is_accessible(&self, node: &NodeName, path: &Path) -> bool {
        self.everywhere.contains(path)
            || self
                .per_node
                .get(node)
                .is_some_and(|paths| paths.contains(path))
    }
}

/// Resolves volume mounts for a node.
#[derive(Clone)]
pub struct VolumeBinder {
    host_paths: Arc<dyn HostPaths>,

    /// When set, `/a/b` on node `n` resolves to `<root>/n/a/b`.
    node_roots: Option<PathBuf>,
}

impl VolumeBinder {
    pub fn new(host_paths: Arc<dyn HostPaths>) -> Self {
        Self {
            host_paths,
            node_roots: None,
        }
    }

    /// Resolve host paths under a per-node directory below `root`.
    pub fn with_node_roots(mut self, root: impl Into<PathBuf>) -> Self {
        self.node_roots = Some(root.into());
        self
    }

    /// Concrete path of `mount` on `node`.
    pub fn resolve(&self, mount: &VolumeMount, node: &NodeName) -> ControllerResult<PathBuf> {
        let path = match &self.node_roots {
            Some(root) => {
                let relative: PathBuf = mount
                    .host_path
                    .components()
                    .filter(|c| matches!(c, Component::Normal(_)))
                    .collect();
                root.join(node.as_str()).join(relative)
            }
            None => mount.host_path.clone(),
        };

        if !self.host_paths.is_accessible(node, &path) {
            return Err(ControllerError::VolumeUnavailable {
                volume: mount.name.clone(),
                node: node.clone(),
                path,
            });
        }

        Ok(path)
    }

    /// Resolve every mount of a template, failing on the first unavailable one.
    pub fn bind_all(
        &self,
        mounts: &[VolumeMount],
        node: &NodeName,
    ) -> ControllerResult<Vec<BoundVolume>> {
        mounts
            .iter()
            .map(|mount| {
                Ok(BoundVolume {
                    name: mount.name.clone(),
                    host_path: self.resolve(mount, node)?,
                    mount_path: mount.mount_path.clone(),
                    read_only: mount.read_only,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for VolumeBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeBinder")
            .field("node_roots", &self.node_roots)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::node;

    fn mount(host: &str, target: &str) -> VolumeMount {
        VolumeMount {
            name: "dataset".to_string(),
            host_path: PathBuf::from(host),
            mount_path: PathBuf::from(target),
            read_only: true,
        }
    }

    #[test]
    fn test_resolve_static_paths() {
        let paths = StaticHostPaths::new()
            .with_shared_path("/srv/shared")
            .with_path(node("node-a"), "/srv/datasets");
        let binder = VolumeBinder::new(Arc::new(paths));

        assert_eq!(
            binder.resolve(&mount("/srv/shared", "/workdir"), &node("node-b")).unwrap(),
            PathBuf::from("/srv/shared")
        );
        assert!(binder.resolve(&mount("/srv/datasets", "/data"), &node("node-a")).is_ok());

        let err = binder
            .resolve(&mount("/srv/datasets", "/data"), &node("node-b"))
            .unwrap_err();
        assert!(matches!(err, ControllerError::VolumeUnavailable { .. }));
    }

    #[test]
    fn test_bind_all_fails_on_first_missing() {
        let binder = VolumeBinder::new(Arc::new(StaticHostPaths::new().with_shared_path("/a")));
        let mounts = vec![mount("/a", "/x"), mount("/b", "/y")];

        assert!(binder.bind_all(&mounts, &node("node-a")).is_err());
        assert_eq!(binder.bind_all(&mounts[..1], &node("node-a")).unwrap().len(), 1);
    }

    #[test]
    fn test_local_paths_under_node_roots() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node-a/srv/datasets")).unwrap();
        let binder = VolumeBinder::new(Arc::new(LocalHostPaths)).with_node_roots(dir.path());

        let resolved = binder
            .resolve(&mount("/srv/datasets", "/data"), &node("node-a"))
            .unwrap();
        assert_eq!(resolved, dir.path().join("node-a/srv/datasets"));

        // Same host path does not exist under node-b's root.
        assert!(binder
            .resolve(&mount("/srv/datasets", "/data"), &node("node-b"))
            .is_err());
    }
}
