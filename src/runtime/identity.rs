// src/runtime/identity.rs
//! Tenant OS identity and workspace resolution
//!
//! An [`Identity`] (uid, gid, working directory) is fixed when a worker is
//! spawned and never changes for the life of that process. Resolvers map a
//! workspace key to the identity its worker must run as.

use crate::runtime::worker_handle::WorkspaceKey;
use crate::utils::errors::{PoolError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

static SITE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?$").expect("valid regex"));

/// OS identity a worker process runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Target user id
    pub uid: u32,

    /// Target primary group id
    pub gid: u32,

    /// Working directory the worker starts in
    pub cwd: PathBuf,
}

impl Identity {
    pub fn new(uid: u32, gid: u32, cwd: impl Into<PathBuf>) -> Self {
        Self {
            uid,
            gid,
            cwd: cwd.into(),
        }
    }

    /// Identity of the current process, rooted at `cwd`
    pub fn current(cwd: impl Into<PathBuf>) -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            cwd: cwd.into(),
        }
    }

    /// Whether spawning as this identity needs a uid/gid switch
    pub fn requires_switch(&self) -> bool {
        self.uid != nix::unistd::geteuid().as_raw() || self.gid != nix::unistd::getegid().as_raw()
    }
}

/// Maps a workspace key to the identity its worker runs as
pub trait WorkspaceResolver: Send + Sync {
    fn resolve(&self, workspace: &WorkspaceKey) -> Result<Identity>;
}

/// Fixed workspace → identity table
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<WorkspaceKey, Identity>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, workspace: impl Into<WorkspaceKey>, identity: Identity) -> Self {
        self.insert(workspace, identity);
        self
    }

    pub fn insert(&mut self, workspace: impl Into<WorkspaceKey>, identity: Identity) {
        self.entries.insert(workspace.into(), identity);
    }
}

impl WorkspaceResolver for StaticResolver {
    fn resolve(&self, workspace: &WorkspaceKey) -> Result<Identity> {
        self.entries
            .get(workspace)
            .cloned()
            .ok_or_else(|| PoolError::InvalidWorkspace {
                workspace: workspace.to_string(),
                reason: "unknown workspace".to_string(),
            })
    }
}

/// Resolves `site:<name>` (or bare `<name>`) to `<sites_root>/<name>/user`,
/// running the worker as the owner of that directory.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    sites_root: PathBuf,
    allow_root_owned: bool,
}

impl DirectoryResolver {
    pub fn new(sites_root: impl Into<PathBuf>) -> Self {
        Self {
            sites_root: sites_root.into(),
            allow_root_owned: false,
        }
    }

    /// Accept workspaces owned by uid 0 (development only)
    pub fn allow_root_owned(mut self, allow: bool) -> Self {
        self.allow_root_owned = allow;
        self
    }

    pub fn sites_root(&self) -> &Path {
        &self.sites_root
    }

    fn invalid(workspace: &WorkspaceKey, reason: impl Into<String>) -> PoolError {
        PoolError::InvalidWorkspace {
            workspace: workspace.to_string(),
            reason: reason.into(),
        }
    }
}

impl WorkspaceResolver for DirectoryResolver {
    fn resolve(&self, workspace: &WorkspaceKey) -> Result<Identity> {
        let raw = workspace.as_str();
        let site = raw.strip_prefix("site:").unwrap_or(raw);

        if !SITE_NAME.is_match(site) || site.contains("..") {
            return Err(Self::invalid(workspace, "invalid site name"));
        }

        let root = self
            .sites_root
            .canonicalize()
            .map_err(|e| Self::invalid(workspace, format!("sites root unavailable: {}", e)))?;
        let dir = root
            .join(site)
            .join("user")
            .canonicalize()
            .map_err(|e| Self::invalid(workspace, format!("workspace directory missing: {}", e)))?;

        if !dir.starts_with(&root) {
            return Err(Self::invalid(workspace, "workspace escapes sites root"));
        }

        let meta = std::fs::metadata(&dir)?;
        if !meta.is_dir() {
            return Err(Self::invalid(workspace, "workspace is not a directory"));
        }
        if meta.uid() == 0 && !self.allow_root_owned {
            return Err(Self::invalid(workspace, "workspace is owned by root"));
        }

        debug!(
            "Resolved workspace {} to {:?} (uid={}, gid={})",
            workspace,
            dir,
            meta.uid(),
            meta.gid()
        );

        Ok(Identity::new(meta.uid(), meta.gid(), dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver() {
        let identity = Identity::new(1001, 1001, "/srv/sites/a/user");
        let resolver = StaticResolver::new().with("a", identity.clone());

        assert_eq!(resolver.resolve(&"a".into()).unwrap(), identity);
        assert!(matches!(
            resolver.resolve(&"b".into()),
            Err(PoolError::InvalidWorkspace { .. })
        ));
    }

    #[test]
    fn test_current_identity_needs_no_switch() {
        let identity = Identity::current("/tmp");
        assert!(!identity.requires_switch());
    }

    #[test]
    fn test_directory_resolver_resolves_owner() {
        let root = tempfile::tempdir().unwrap();
        let user_dir = root.path().join("example.com").join("user");
        std::fs::create_dir_all(&user_dir).unwrap();

        let resolver = DirectoryResolver::new(root.path()).allow_root_owned(true);
        let identity = resolver.resolve(&"site:example.com".into()).unwrap();

        let meta = std::fs::metadata(&user_dir).unwrap();
        assert_eq!(identity.uid, meta.uid());
        assert_eq!(identity.gid, meta.gid());
        assert_eq!(identity.cwd, user_dir.canonicalize().unwrap());

        let bare = resolver.resolve(&"example.com".into()).unwrap();
        assert_eq!(bare, identity);
    }

    #[test]
    fn test_directory_resolver_rejects_bad_names() {
        let root = tempfile::tempdir().unwrap();
        let resolver = DirectoryResolver::new(root.path()).allow_root_owned(true);

        for name in ["../etc", "site:..", "a/b", "-lead", "trail-", "", "x..y"] {
            assert!(
                resolver.resolve(&name.into()).is_err(),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_directory_resolver_missing_dir() {
        let root = tempfile::tempdir().unwrap();
        let resolver = DirectoryResolver::new(root.path());
        let err = resolver.resolve(&"missing.site".into()).unwrap_err();
        assert!(err.to_string().contains("workspace directory missing"));
    }

    #[test]
    fn test_directory_resolver_rejects_symlink_escape() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let site = root.path().join("escape.site");
        std::fs::create_dir_all(&site).unwrap();
        std::os::unix::fs::symlink(outside.path(), site.join("user")).unwrap();

        let resolver = DirectoryResolver::new(root.path()).allow_root_owned(true);
        let err = resolver.resolve(&"escape.site".into()).unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }
}
