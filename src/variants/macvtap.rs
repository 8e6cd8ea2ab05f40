//! Macvtap variant (§4.7): the sandbox interface already is a macvtap device
//! created by the external network plugin; the Core only has to record its
//! MAC/MTU and point the domain at the existing device node, no kernel
//! mutation of its own (§4.7, §9).

use async_trait::async_trait;

use super::BindMechanism;
use crate::cache::CacheStore;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::handler::NetHandler;
use crate::model::{DomainInterface, InterfaceTarget, Vif};
use crate::spec::InterfaceSpec;

pub struct Macvtap;

#[async_trait]
impl BindMechanism for Macvtap {
    async fn discover_pod_network_interface(
        &self,
        handler: &dyn NetHandler,
        iface: &InterfaceSpec,
    ) -> Result<Vif> {
        let mac = handler.get_mac(&iface.name).await?;
        let mtu = handler.get_link_mtu(&iface.name).await?;
        if mtu == 0 {
            return Err(Error::Discovery {
                iface: iface.name.clone(),
                reason: "MTU value out of range".into(),
            });
        }
        Ok(Vif {
            name: iface.name.clone(),
            mac,
            mtu,
            tap_device: iface.name.clone(),
            ..Default::default()
        })
    }

    /// No kernel mutation: the device already exists in its final shape.
    async fn prepare_pod_network_interfaces(
        &self,
        _handler: &dyn NetHandler,
        vif: Vif,
        _iface: &InterfaceSpec,
        _queue_number: u32,
        _launcher_pid: &str,
    ) -> Result<(DomainInterface, Vif)> {
        let domain_iface = DomainInterface {
            mac: vif.mac,
            mtu: vif.mtu,
            target: InterfaceTarget::new(vif.tap_device.clone()),
        };
        Ok((domain_iface, vif))
    }

    fn cached_interface_exists(&self, cache: &CacheStore, pid: &str, name: &str) -> Result<bool> {
        Ok(cache.interface_exists(pid, name))
    }

    fn load_cached_vif(&self, cache: &CacheStore, pid: &str, name: &str) -> Result<Option<Vif>> {
        cache.load_vif(pid, name)
    }

    fn decorate_config(
        &self,
        domain: &mut Domain,
        alias: &str,
        _iface: &InterfaceSpec,
        domain_iface: &DomainInterface,
        _vif: &Vif,
    ) -> Result<()> {
        let entry = domain
            .interface_mut(alias)
            .ok_or_else(|| Error::Config(format!("no domain interface entry aliased {alias}")))?;
        entry.interface = domain_iface.clone();
        Ok(())
    }

    /// No internal DHCP server: the guest's address comes from whatever the
    /// external network plugin already assigned the macvtap device.
    async fn start_dhcp(&self, _handler: &dyn NetHandler, _vif: &Vif, _bridge: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockNetHandler;

    fn iface_spec() -> InterfaceSpec {
        InterfaceSpec {
            name: "eth0".into(),
            model: None,
            mac: None,
            binding: crate::spec::BindingVariant::Macvtap,
            ports: vec![],
            network_interface_multi_queue: false,
        }
    }

    #[tokio::test]
    async fn discovery_records_existing_mac_and_mtu() {
        let mut mock = MockNetHandler::new();
        mock.expect_get_mac()
            .returning(|_| Ok(crate::model::Mac([0xaa, 0xbb, 0xcc, 0, 0, 1])));
        mock.expect_get_link_mtu().returning(|_| Ok(1450));
        let macvtap = Macvtap;
        let vif = macvtap
            .discover_pod_network_interface(&mock, &iface_spec())
            .await
            .unwrap();
        assert_eq!(vif.mac, crate::model::Mac([0xaa, 0xbb, 0xcc, 0, 0, 1]));
        assert_eq!(vif.mtu, 1450);
        assert_eq!(vif.tap_device, "eth0");
    }

    #[tokio::test]
    async fn mtu_out_of_range_fails_discovery() {
        let mut mock = MockNetHandler::new();
        mock.expect_get_mac()
            .returning(|_| Ok(crate::model::Mac([0xaa, 0xbb, 0xcc, 0, 0, 1])));
        mock.expect_get_link_mtu().returning(|_| Ok(0));
        let macvtap = Macvtap;
        let err = macvtap
            .discover_pod_network_interface(&mock, &iface_spec())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }

    #[tokio::test]
    async fn prepare_never_touches_the_kernel() {
        let mock = MockNetHandler::new();
        let macvtap = Macvtap;
        let vif = Vif {
            name: "eth0".into(),
            mac: crate::model::Mac([0xaa, 0xbb, 0xcc, 0, 0, 1]),
            mtu: 1450,
            tap_device: "eth0".into(),
            ..Default::default()
        };
        let (domain_iface, _vif) = macvtap
            .prepare_pod_network_interfaces(&mock, vif, &iface_spec(), 1, "123")
            .await
            .unwrap();
        assert_eq!(domain_iface.target.device, "eth0");
    }
}
