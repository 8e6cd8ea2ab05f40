//! Bridge variant (§4.4): reparent the sandbox interface under an in-sandbox
//! Linux bridge, randomize the sandbox interface's MAC, and serve the
//! original address/MAC/routes to the guest through an internal DHCP server.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use super::{bridge_name, tap_name, BindMechanism};
use crate::cache::CacheStore;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::handler::{filter_pod_network_routes, DhcpOptions, NetHandler};
use crate::model::{DomainInterface, InterfaceTarget, Ipv4Cidr, Vif};
use crate::spec::InterfaceSpec;

pub struct Bridge {
    iface: String,
    fake_ip_octet: u8,
}

impl Bridge {
    /// `index` is the interface's position within its VMI spec, used as the
    /// last octet of the bridge's link-local fake address (§4.4, §9). A VMI
    /// with more than 255 interfaces cannot be represented this way.
    pub fn new(iface: String, index: usize) -> Result<Self> {
        let fake_ip_octet = u8::try_from(index).map_err(|_| {
            Error::Config(format!(
                "VMI has more than 255 interfaces; cannot derive a bridge fake IP for {iface}"
            ))
        })?;
        Ok(Bridge {
            iface,
            fake_ip_octet,
        })
    }

    fn bridge(&self) -> String {
        bridge_name(&self.iface)
    }

    fn tap(&self) -> String {
        tap_name(&self.iface)
    }

    fn fake_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(169, 254, 75, self.fake_ip_octet)
    }
}

#[async_trait]
impl BindMechanism for Bridge {
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

        let addrs = handler.addr_list(&iface.name).await?;
        let ipam_disabled = addrs.is_empty();

        let (ip, gateway, routes) = if ipam_disabled {
            (None, None, Vec::new())
        } else {
            let routes = handler.route_list(&iface.name).await?;
            let gateway = routes
                .iter()
                .find(|r| r.destination.prefix == 0)
                .map(|r| r.gateway)
                .ok_or_else(|| Error::Discovery {
                    iface: iface.name.clone(),
                    reason: "No gateway address found in routes".into(),
                })?;
            (
                Some(addrs[0]),
                Some(gateway),
                filter_pod_network_routes(&routes),
            )
        };

        Ok(Vif {
            name: iface.name.clone(),
            mac,
            mtu,
            ip,
            ipv6: None,
            gateway,
            gateway_ipv6: None,
            routes,
            ipam_disabled,
            tap_device: self.tap(),
        })
    }

    async fn prepare_pod_network_interfaces(
        &self,
        handler: &dyn NetHandler,
        vif: Vif,
        _iface: &InterfaceSpec,
        queue_number: u32,
        launcher_pid: &str,
    ) -> Result<(DomainInterface, Vif)> {
        let bridge = self.bridge();
        let tap = self.tap();

        handler.link_set_down(&self.iface).await?;
        handler.set_random_mac(&self.iface).await?;
        handler.link_set_up(&self.iface).await?;

        handler.link_add_bridge(&bridge, vif.mtu).await?;
        handler.link_set_master(&self.iface, &bridge).await?;
        handler.link_set_up(&bridge).await?;

        handler
            .create_tap_device(&tap, queue_number, launcher_pid, vif.mtu)
            .await?;
        handler.bind_tap_device_to_bridge(&tap, &bridge).await?;

        if !vif.ipam_disabled {
            if let Some(ip) = vif.ip {
                handler.addr_del(&self.iface, ip).await?;
            }
        }

        handler.link_set_learning_off(&self.iface).await?;
        handler
            .addr_add(
                &bridge,
                Ipv4Cidr {
                    addr: self.fake_ip(),
                    prefix: 32,
                },
            )
            .await?;
        handler.disable_tx_offload_checksum(&bridge).await?;

        let domain_iface = DomainInterface {
            mac: vif.mac,
            mtu: vif.mtu,
            target: InterfaceTarget::new(tap),
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

    async fn start_dhcp(&self, handler: &dyn NetHandler, vif: &Vif, bridge: &str) -> Result<()> {
        if vif.ipam_disabled {
            return Ok(());
        }
        let Some(ip) = vif.ip else { return Ok(()) };
        handler
            .start_dhcp(
                &self.iface,
                bridge,
                &DhcpOptions {
                    client_ip: ip.addr,
                    client_mac: vif.mac,
                    router: vif.gateway,
                    routes: vif.routes.clone(),
                    mtu: vif.mtu,
                },
            )
            .await
    }
}
