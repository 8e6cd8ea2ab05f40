//! Cross-phase communication: two JSON file families keyed by
//! `(pid-or-"self", interface-name)`.
//!
//! `pid` is the launcher's PID on Phase-1 writes and the literal string
//! `"self"` on Phase-2 reads; both phases must resolve the same path, which
//! is the caller's responsibility (the cache root is typically a bind mount
//! shared between the privileged helper and the launcher).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};
use crate::model::{DomainInterface, PodCacheInterface, Vif};

pub const DEFAULT_CACHE_ROOT: &str = "/var/run/kubevirt-private/interface-cache";

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheStore { root: root.into() }
    }

    fn interface_path(&self, pid: &str, iface: &str) -> PathBuf {
        self.root.join(pid).join(iface).join("interface.json")
    }

    fn vif_path(&self, pid: &str, iface: &str) -> PathBuf {
        self.root.join(pid).join(iface).join("vif.json")
    }

    pub fn load_interface(&self, pid: &str, iface: &str) -> Result<Option<DomainInterface>> {
        load_json(&self.interface_path(pid, iface))
    }

    pub fn store_interface(&self, pid: &str, iface: &str, value: &DomainInterface) -> Result<()> {
        store_json(&self.interface_path(pid, iface), value)
    }

    pub fn load_vif(&self, pid: &str, iface: &str) -> Result<Option<Vif>> {
        // §4.8 canonicalizes gateways on load; see model.rs for why that is a
        // no-op for Rust's fixed-width Ipv4Addr/Ipv6Addr.
        load_json::<Vif>(&self.vif_path(pid, iface))
    }

    pub fn store_vif(&self, pid: &str, iface: &str, value: &Vif) -> Result<()> {
        store_json(&self.vif_path(pid, iface), value)
    }

    pub fn interface_exists(&self, pid: &str, iface: &str) -> bool {
        self.interface_path(pid, iface).is_file()
    }

    fn pod_cache_path(&self, uid: &str, iface: &str) -> PathBuf {
        self.root.join("pod").join(uid).join(iface).join("pod.json")
    }

    /// Status snapshot taken before Phase 1 reshapes the sandbox interface
    /// (§6.2, `setPodInterfaceCache`).
    pub fn store_pod_cache(&self, uid: &str, iface: &str, value: &PodCacheInterface) -> Result<()> {
        store_json(&self.pod_cache_path(uid, iface), value)
    }

    pub fn load_pod_cache(&self, uid: &str, iface: &str) -> Result<Option<PodCacheInterface>> {
        load_json(&self.pod_cache_path(uid, iface))
    }
}

/// Missing file ⇒ `Ok(None)`; unmarshal error ⇒ `Err`.
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    let value = serde_json::from_slice(&bytes)?;
    Ok(Some(value))
}

/// Write-then-rename at `0644`.
fn store_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &bytes)?;
    set_permissions(&tmp_path, 0o644)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
