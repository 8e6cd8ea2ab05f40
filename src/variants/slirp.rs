//! Slirp variant (§4.6): user-mode networking handled entirely by QEMU.
//! The Core never touches the kernel for this variant; its only job is to
//! strip the interface out of the domain device list and hand QEMU a
//! `-device` argument instead (§4.6, §9).

use async_trait::async_trait;

use super::BindMechanism;
use crate::cache::CacheStore;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::handler::NetHandler;
use crate::model::{DomainInterface, Vif};
use crate::spec::InterfaceSpec;

pub struct Slirp;

#[async_trait]
impl BindMechanism for Slirp {
    async fn discover_pod_network_interface(
        &self,
        _handler: &dyn NetHandler,
        iface: &InterfaceSpec,
    ) -> Result<Vif> {
        Ok(Vif {
            name: iface.name.clone(),
            ..Default::default()
        })
    }

    async fn prepare_pod_network_interfaces(
        &self,
        _handler: &dyn NetHandler,
        vif: Vif,
        _iface: &InterfaceSpec,
        _queue_number: u32,
        _launcher_pid: &str,
    ) -> Result<(DomainInterface, Vif)> {
        Ok((DomainInterface::default(), vif))
    }

    /// Always reports the cache as present: Slirp never writes one, and the
    /// Orchestrator's idempotence check must not block on it (§4.3, §9).
    fn cached_interface_exists(
        &self,
        _cache: &CacheStore,
        _pid: &str,
        _name: &str,
    ) -> Result<bool> {
        Ok(true)
    }

    fn load_cached_vif(&self, _cache: &CacheStore, _pid: &str, _name: &str) -> Result<Option<Vif>> {
        Ok(Some(Vif::default()))
    }

    /// Removes the domain device entry and appends the `-device` QEMU
    /// argument pair in its place (§4.6, testable property #8).
    fn decorate_config(
        &self,
        domain: &mut Domain,
        alias: &str,
        iface: &InterfaceSpec,
        domain_iface: &DomainInterface,
        _vif: &Vif,
    ) -> Result<()> {
        domain
            .remove_interface(alias)
            .ok_or_else(|| Error::Config(format!("no domain interface entry aliased {alias}")))?;

        let model = iface.model.as_deref().unwrap_or("virtio-net-pci");
        let mut value = format!("{model},netdev={alias},id={alias}");
        if domain_iface.mac != crate::model::Mac::default() {
            value.push_str(&format!(",mac={}", domain_iface.mac));
        }
        domain.push_qemu_arg("-device", value);
        Ok(())
    }

    async fn start_dhcp(&self, _handler: &dyn NetHandler, _vif: &Vif, _bridge: &str) -> Result<()> {
        Ok(())
    }
}
