//! Runtime configuration.
//!
//! The defaults reproduce the object naming surface existing holders of
//! this protocol already use, so two processes built from different
//! versions of this crate still contend on the same objects. Only change
//! the names when every participant is configured the same way.

use crate::error::{NamespaceError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV: &str = "NSMUTEX_CONFIG";

/// Well-known principal a secured namespace is bound to.
///
/// Never taken from a caller per-operation: it is fixed when the
/// runtime is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    /// The system account (UID 0).
    Superuser,
    /// The effective user of the running process.
    CurrentUser,
    /// An explicit numeric user.
    Uid(u32),
}

impl Principal {
    /// Resolve to a numeric user id.
    pub fn uid(&self) -> u32 {
        match self {
            Self::Superuser => 0,
            Self::CurrentUser => nix::unistd::geteuid().as_raw(),
            Self::Uid(uid) => *uid,
        }
    }

    /// Directory private to this principal that holds its namespaces.
    ///
    /// The superuser gets `/run/nsmutex`. Other users get `nsmutex` under
    /// `$XDG_RUNTIME_DIR` when it belongs to them, else `nsmutex-<uid>` in
    /// the temp dir. The platform refuses the root on first use unless it
    /// is owned by the principal and not writable by anyone else.
    pub fn default_root(&self) -> PathBuf {
        let uid = self.uid();
        if uid == 0 {
            return PathBuf::from("/run/nsmutex");
        }
        let own_runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .filter(|_| uid == nix::unistd::geteuid().as_raw())
            .filter(|dir| !dir.is_empty());
        match own_runtime_dir {
            Some(dir) => PathBuf::from(dir).join("nsmutex"),
            None => std::env::temp_dir().join(format!("nsmutex-{uid}")),
        }
    }
}

/// Configuration for a [`NamespaceRuntime`](crate::runtime::NamespaceRuntime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Directory holding the namespace on Unix (default: [`Principal::default_root`])
    pub root_dir: Option<PathBuf>,
    /// Name of the secured namespace
    pub namespace: String,
    /// Name of the boundary descriptor scoping the namespace
    pub boundary: String,
    /// Principal allowed to create and open the namespace
    pub principal: Principal,
    /// Object name prefix for derived pool mutexes
    pub pool_mutex_prefix: String,
    /// Object name of the installation mutex
    pub installation_mutex: String,
    /// Bound on namespace create/open race retries (`None` retries forever)
    pub max_namespace_retries: Option<u32>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            namespace: "Wintun".to_string(),
            boundary: "Wintun".to_string(),
            principal: Principal::Superuser,
            pool_mutex_prefix: "Wintun-Name-Mutex-".to_string(),
            installation_mutex: "Wintun-Driver-Installation-Mutex".to_string(),
            max_namespace_retries: None,
        }
    }
}

impl NamespaceConfig {
    /// Defaults bound to the current user instead of the superuser.
    ///
    /// Useful for unprivileged tooling and tests, where the creator of the
    /// namespace can never be UID 0.
    pub fn for_current_user() -> Self {
        Self {
            principal: Principal::CurrentUser,
            ..Self::default()
        }
    }

    /// Same as [`for_current_user`](Self::for_current_user), rooted at `root_dir`.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: Some(root_dir.into()),
            ..Self::for_current_user()
        }
    }

    /// Root directory in effect: the configured one, else the principal's default.
    pub fn resolved_root_dir(&self) -> PathBuf {
        self.root_dir
            .clone()
            .unwrap_or_else(|| self.principal.default_root())
    }

    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| NamespaceError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded namespace configuration");
        Ok(config)
    }

    /// Load from the file named by `NSMUTEX_CONFIG`, or fall back to defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }
}
