//! Masquerade variant (§4.5): assign the guest a stable per-sandbox CIDR,
//! NAT it behind the sandbox interface, and optionally DNAT individual ports
//! in (§4.5.1).

use async_trait::async_trait;

use super::{bridge_name, tap_name, BindMechanism};
use crate::cache::CacheStore;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::handler::{DhcpOptions, IpFamily, NetHandler};
use crate::model::{DomainInterface, InterfaceTarget, Ipv4Cidr, Vif};
use crate::nat;
use crate::spec::{InterfaceSpec, NetworkSpec};

const DEFAULT_IPV4_CIDR: &str = "10.0.2.0/24";

pub struct Masquerade {
    iface: String,
    network: NetworkSpec,
}

impl Masquerade {
    pub fn new(iface: String, network: NetworkSpec) -> Self {
        Masquerade { iface, network }
    }

    fn bridge(&self) -> String {
        bridge_name(&self.iface)
    }

    fn uplink(&self) -> String {
        format!("{}-nic", self.bridge())
    }

    fn tap(&self) -> String {
        tap_name(&self.iface)
    }

    fn cidr(&self) -> &str {
        self.network
            .vm_network_cidr
            .as_deref()
            .unwrap_or(DEFAULT_IPV4_CIDR)
    }
}

#[async_trait]
impl BindMechanism for Masquerade {
    async fn discover_pod_network_interface(
        &self,
        handler: &dyn NetHandler,
        iface: &InterfaceSpec,
    ) -> Result<Vif> {
        let mtu = handler.get_link_mtu(&self.iface).await?;
        if mtu == 0 {
            return Err(Error::Discovery {
                iface: self.iface.clone(),
                reason: "MTU value out of range".into(),
            });
        }

        let mac = match &iface.mac {
            Some(mac) => crate::model::Mac::parse(mac).ok_or_else(|| {
                Error::Config(format!(
                    "invalid MAC address {mac} for interface {}",
                    self.iface
                ))
            })?,
            None => handler.generate_random_mac(),
        };

        Ok(Vif {
            name: self.iface.clone(),
            mac,
            mtu,
            ip: None,
            ipv6: None,
            gateway: None,
            gateway_ipv6: None,
            routes: Vec::new(),
            ipam_disabled: false,
            tap_device: self.tap(),
        })
    }

    async fn prepare_pod_network_interfaces(
        &self,
        handler: &dyn NetHandler,
        mut vif: Vif,
        iface: &InterfaceSpec,
        queue_number: u32,
        launcher_pid: &str,
    ) -> Result<(DomainInterface, Vif)> {
        let bridge = self.bridge();
        let uplink = self.uplink();
        let tap = self.tap();

        handler.link_add_dummy(&uplink, vif.mtu).await?;
        handler.link_set_up(&uplink).await?;

        handler.link_add_bridge(&bridge, vif.mtu).await?;
        handler.link_set_master(&uplink, &bridge).await?;
        handler.link_set_up(&bridge).await?;

        let (gateway, vm_addr) = handler.get_host_and_gw_addresses_from_cidr(self.cidr())?;
        let prefix = self
            .cidr()
            .rsplit('/')
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .unwrap_or(24);
        handler
            .addr_add(
                &bridge,
                Ipv4Cidr {
                    addr: gateway,
                    prefix,
                },
            )
            .await?;
        handler.disable_tx_offload_checksum(&bridge).await?;

        handler
            .create_tap_device(&tap, queue_number, launcher_pid, vif.mtu)
            .await?;
        handler.bind_tap_device_to_bridge(&tap, &bridge).await?;

        let ipv6_enabled = handler.is_ipv6_enabled(&self.iface).await?;

        nat::program_nat(
            handler,
            IpFamily::V4,
            &self.iface,
            &bridge,
            &vm_addr.to_string(),
            &gateway.to_string(),
            &iface.ports,
        )
        .await?;

        if ipv6_enabled {
            handler.configure_ipv6_forwarding().await?;
            if let Some(cidr) = &self.network.vm_ipv6_network_cidr {
                let (gateway_v6, vm_addr_v6) =
                    handler.get_host_and_gw_addresses_from_cidr_v6(cidr)?;
                nat::program_nat(
                    handler,
                    IpFamily::V6,
                    &self.iface,
                    &bridge,
                    &vm_addr_v6.to_string(),
                    &gateway_v6.to_string(),
                    &iface.ports,
                )
                .await?;
            }
        }

        vif.ip = Some(Ipv4Cidr {
            addr: vm_addr,
            prefix,
        });
        vif.gateway = Some(gateway);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockNetHandler;

    fn iface_spec(ports: Vec<crate::spec::PortMapping>) -> InterfaceSpec {
        InterfaceSpec {
            name: "eth0".into(),
            model: None,
            mac: None,
            binding: crate::spec::BindingVariant::Masquerade,
            ports,
            network_interface_multi_queue: false,
        }
    }

    #[tokio::test]
    async fn discovery_generates_mac_when_spec_omits_one() {
        let mut mock = MockNetHandler::new();
        mock.expect_get_link_mtu().returning(|_| Ok(1450));
        mock.expect_generate_random_mac()
            .returning(|| crate::model::Mac([0x02, 0, 0, 0, 0, 1]));
        let masquerade = Masquerade::new("eth0".into(), NetworkSpec::default());
        let vif = masquerade
            .discover_pod_network_interface(&mock, &iface_spec(vec![]))
            .await
            .unwrap();
        assert_eq!(vif.mac, crate::model::Mac([0x02, 0, 0, 0, 0, 1]));
    }

    #[tokio::test]
    async fn discovery_keeps_caller_supplied_mac() {
        let mut mock = MockNetHandler::new();
        mock.expect_get_link_mtu().returning(|_| Ok(1450));
        let masquerade = Masquerade::new("eth0".into(), NetworkSpec::default());
        let mut spec = iface_spec(vec![]);
        spec.mac = Some("02:00:00:00:00:aa".into());
        let vif = masquerade
            .discover_pod_network_interface(&mock, &spec)
            .await
            .unwrap();
        assert_eq!(
            vif.mac,
            crate::model::Mac::parse("02:00:00:00:00:aa").unwrap()
        );
    }

    #[tokio::test]
    async fn dual_stack_prepare_feeds_nat_a_concrete_v6_host_pair() {
        use std::sync::{Arc, Mutex};

        let mut mock = MockNetHandler::new();
        mock.expect_link_add_dummy().returning(|_, _| Ok(()));
        mock.expect_link_set_up().returning(|_| Ok(()));
        mock.expect_link_add_bridge().returning(|_, _| Ok(()));
        mock.expect_link_set_master().returning(|_, _| Ok(()));
        mock.expect_addr_add().returning(|_, _| Ok(()));
        mock.expect_disable_tx_offload_checksum()
            .returning(|_| Ok(()));
        mock.expect_create_tap_device()
            .returning(|_, _, _, _| Ok(()));
        mock.expect_bind_tap_device_to_bridge()
            .returning(|_, _| Ok(()));
        mock.expect_is_ipv6_enabled().returning(|_| Ok(true));
        mock.expect_configure_ipv6_forwarding().returning(|| Ok(()));
        mock.expect_has_nat_iptables().returning(|_| Ok(true));
        mock.expect_iptables_new_chain().returning(|_, _, _| Ok(()));
        mock.expect_get_host_and_gw_addresses_from_cidr()
            .returning(|_| Ok(("10.0.2.1".parse().unwrap(), "10.0.2.2".parse().unwrap())));
        mock.expect_get_host_and_gw_addresses_from_cidr_v6()
            .returning(|_| Ok(("fd00::1".parse().unwrap(), "fd00::2".parse().unwrap())));

        let v4_rules: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let v6_rules: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let v4_recorder = v4_rules.clone();
        let v6_recorder = v6_rules.clone();
        mock.expect_iptables_append_rule()
            .returning(move |_table, _chain, family, rule| {
                let rules = if family == crate::handler::IpFamily::V4 {
                    &v4_recorder
                } else {
                    &v6_recorder
                };
                rules.lock().unwrap().push(rule.to_vec());
                Ok(())
            });

        let network = NetworkSpec {
            vm_network_cidr: None,
            vm_ipv6_network_cidr: Some("fd00::/64".into()),
        };
        let masquerade = Masquerade::new("eth0".into(), network);
        let vif = Vif {
            name: "eth0".into(),
            mtu: 1450,
            ..Default::default()
        };

        masquerade
            .prepare_pod_network_interfaces(&mock, vif, &iface_spec(vec![]), 0, "123")
            .await
            .unwrap();

        let v4_rules = v4_rules.lock().unwrap();
        let v6_rules = v6_rules.lock().unwrap();
        assert!(v4_rules.iter().any(|r| r.iter().any(|a| a == "10.0.2.2")));
        assert!(v6_rules.iter().any(|r| r.iter().any(|a| a == "fd00::2")));
        // A bare network prefix must never reach ip6tables as a host address.
        assert!(!v6_rules.iter().any(|r| r.iter().any(|a| a == "fd00::/64")));
    }
}
