//! The `BindMechanism` contract (§4.3) and the `Variant` dispatch enum that
//! picks one of the four stateful implementations. SR-IOV carries no state of
//! its own and never reaches this module — the Orchestrator returns early for
//! it before a `BindMechanism` would be constructed (§9).

mod bridge;
mod macvtap;
mod masquerade;
mod slirp;

pub use bridge::Bridge;
pub use macvtap::Macvtap;
pub use masquerade::Masquerade;
pub use slirp::Slirp;

use async_trait::async_trait;

use crate::cache::CacheStore;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::handler::NetHandler;
use crate::model::{DomainInterface, Vif};
use crate::spec::{BindingVariant, InterfaceSpec, NetworkSpec, VmiSpec};

/// Everything a binding variant must implement (§4.3). `Slirp` and `Macvtap`
/// implement every method as an explicit no-op rather than inheriting a
/// default, so the no-op is visible at the call site.
#[async_trait]
pub trait BindMechanism: Send + Sync {
    /// Snapshot the sandbox interface's current kernel state without
    /// mutating it.
    async fn discover_pod_network_interface(
        &self,
        handler: &dyn NetHandler,
        iface: &InterfaceSpec,
    ) -> Result<Vif>;

    /// Reshape the kernel: bridges, taps, addresses, firewall rules. Takes
    /// `vif` by value because some variants (Masquerade) fill in fields
    /// discovery left blank, such as a generated MAC or the assigned guest
    /// address; the returned `Vif` is what gets persisted alongside the
    /// `DomainInterface` skeleton (§4.1 step 4d).
    async fn prepare_pod_network_interfaces(
        &self,
        handler: &dyn NetHandler,
        vif: Vif,
        iface: &InterfaceSpec,
        queue_number: u32,
        launcher_pid: &str,
    ) -> Result<(DomainInterface, Vif)>;

    /// Whether a `DomainInterface` cache already exists for `(pid, name)`.
    fn cached_interface_exists(&self, cache: &CacheStore, pid: &str, name: &str) -> Result<bool>;

    /// Load the cached VIF for `(pid, name)`, if any.
    fn load_cached_vif(&self, cache: &CacheStore, pid: &str, name: &str) -> Result<Option<Vif>>;

    /// Bind `MTU`/`MAC`/`Target` onto the domain entry matching `alias`.
    fn decorate_config(
        &self,
        domain: &mut Domain,
        alias: &str,
        iface: &InterfaceSpec,
        domain_iface: &DomainInterface,
        vif: &Vif,
    ) -> Result<()>;

    /// Start the internal DHCP server serving `vif`'s address to the guest,
    /// if this variant needs one.
    async fn start_dhcp(&self, handler: &dyn NetHandler, vif: &Vif, bridge: &str) -> Result<()>;
}

/// Dispatches to one of the four stateful variants.
pub enum Variant {
    Bridge(Bridge),
    Masquerade(Masquerade),
    Slirp(Slirp),
    Macvtap(Macvtap),
}

impl Variant {
    /// Resolve the variant for one interface. SR-IOV is handled by the
    /// caller before this is reached; passing it here is a programming
    /// error and rejected with `NotImplemented`.
    pub fn for_interface(
        binding: BindingVariant,
        vmi: &VmiSpec,
        iface: &InterfaceSpec,
        network: &NetworkSpec,
    ) -> Result<Self> {
        let index = vmi.interface_index(&iface.name).ok_or_else(|| {
            Error::Config(format!("interface {} is not part of this VMI", iface.name))
        })?;
        match binding {
            BindingVariant::Bridge => Ok(Variant::Bridge(Bridge::new(iface.name.clone(), index)?)),
            BindingVariant::Masquerade => Ok(Variant::Masquerade(Masquerade::new(
                iface.name.clone(),
                network.clone(),
            ))),
            BindingVariant::Slirp => Ok(Variant::Slirp(Slirp)),
            BindingVariant::Macvtap => Ok(Variant::Macvtap(Macvtap)),
            BindingVariant::Sriov => Err(Error::NotImplemented(
                "SR-IOV has no BindMechanism; handle it before constructing one".into(),
            )),
        }
    }
}

#[async_trait]
impl BindMechanism for Variant {
    async fn discover_pod_network_interface(
        &self,
        handler: &dyn NetHandler,
        iface: &InterfaceSpec,
    ) -> Result<Vif> {
        match self {
            Variant::Bridge(v) => v.discover_pod_network_interface(handler, iface).await,
            Variant::Masquerade(v) => v.discover_pod_network_interface(handler, iface).await,
            Variant::Slirp(v) => v.discover_pod_network_interface(handler, iface).await,
            Variant::Macvtap(v) => v.discover_pod_network_interface(handler, iface).await,
        }
    }

    async fn prepare_pod_network_interfaces(
        &self,
        handler: &dyn NetHandler,
        vif: Vif,
        iface: &InterfaceSpec,
        queue_number: u32,
        launcher_pid: &str,
    ) -> Result<(DomainInterface, Vif)> {
        match self {
            Variant::Bridge(v) => {
                v.prepare_pod_network_interfaces(handler, vif, iface, queue_number, launcher_pid)
                    .await
            }
            Variant::Masquerade(v) => {
                v.prepare_pod_network_interfaces(handler, vif, iface, queue_number, launcher_pid)
                    .await
            }
            Variant::Slirp(v) => {
                v.prepare_pod_network_interfaces(handler, vif, iface, queue_number, launcher_pid)
                    .await
            }
            Variant::Macvtap(v) => {
                v.prepare_pod_network_interfaces(handler, vif, iface, queue_number, launcher_pid)
                    .await
            }
        }
    }

    fn cached_interface_exists(&self, cache: &CacheStore, pid: &str, name: &str) -> Result<bool> {
        match self {
            Variant::Bridge(v) => v.cached_interface_exists(cache, pid, name),
            Variant::Masquerade(v) => v.cached_interface_exists(cache, pid, name),
            Variant::Slirp(v) => v.cached_interface_exists(cache, pid, name),
            Variant::Macvtap(v) => v.cached_interface_exists(cache, pid, name),
        }
    }

    fn load_cached_vif(&self, cache: &CacheStore, pid: &str, name: &str) -> Result<Option<Vif>> {
        match self {
            Variant::Bridge(v) => v.load_cached_vif(cache, pid, name),
            Variant::Masquerade(v) => v.load_cached_vif(cache, pid, name),
            Variant::Slirp(v) => v.load_cached_vif(cache, pid, name),
            Variant::Macvtap(v) => v.load_cached_vif(cache, pid, name),
        }
    }

    fn decorate_config(
        &self,
        domain: &mut Domain,
        alias: &str,
        iface: &InterfaceSpec,
        domain_iface: &DomainInterface,
        vif: &Vif,
    ) -> Result<()> {
        match self {
            Variant::Bridge(v) => v.decorate_config(domain, alias, iface, domain_iface, vif),
            Variant::Masquerade(v) => v.decorate_config(domain, alias, iface, domain_iface, vif),
            Variant::Slirp(v) => v.decorate_config(domain, alias, iface, domain_iface, vif),
            Variant::Macvtap(v) => v.decorate_config(domain, alias, iface, domain_iface, vif),
        }
    }

    async fn start_dhcp(&self, handler: &dyn NetHandler, vif: &Vif, bridge: &str) -> Result<()> {
        match self {
            Variant::Bridge(v) => v.start_dhcp(handler, vif, bridge).await,
            Variant::Masquerade(v) => v.start_dhcp(handler, vif, bridge).await,
            Variant::Slirp(v) => v.start_dhcp(handler, vif, bridge).await,
            Variant::Macvtap(v) => v.start_dhcp(handler, vif, bridge).await,
        }
    }
}

/// `k6t-<iface>`, shared by Bridge and Masquerade.
pub(crate) fn bridge_name(iface: &str) -> String {
    format!("k6t-{iface}")
}

/// `tap<iface[3:]>` (§6.3): strip the 3-character sandbox-interface prefix.
pub(crate) fn tap_name(iface: &str) -> String {
    format!("tap{}", iface.get(3..).unwrap_or(iface))
}
