//! Kernel / firewall capability surface consumed by the binding variants
//! (§6.1). A single trait, passed as an explicit dependency rather than a
//! process-wide global (§9), so tests drive it through a `mockall`-generated
//! mock instead of touching the host's network namespace.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::AsFd;
use std::os::unix::io::RawFd;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::{Ipv4Network, Ipv6Network};
use netlink_packet_route::link::LinkAttribute;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::model::{Ipv4Cidr, Ipv6Cidr, Mac, Route};

/// Address family, threaded through the firewall capability surface so one
/// handler can target either iptables/ip6tables or nft's `ip`/`ip6` families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn loopback(&self) -> &'static str {
        match self {
            IpFamily::V4 => "127.0.0.1",
            IpFamily::V6 => "::1",
        }
    }
}

/// Parameters forwarded to the external DHCP server for a single interface.
#[derive(Debug, Clone)]
pub struct DhcpOptions {
    pub client_ip: Ipv4Addr,
    pub client_mac: Mac,
    pub router: Option<Ipv4Addr>,
    pub routes: Vec<Route>,
    pub mtu: u16,
}

/// The kernel/firewall capability surface the Core depends on. Every method
/// here corresponds to one bullet of the capability list; variants call these
/// instead of shelling out or opening netlink sockets directly.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait NetHandler: Send + Sync {
    // -- Link --
    async fn link_exists(&self, iface: &str) -> Result<bool>;
    async fn link_add_bridge(&self, name: &str, mtu: u16) -> Result<()>;
    async fn link_add_dummy(&self, name: &str, mtu: u16) -> Result<()>;
    async fn link_set_up(&self, iface: &str) -> Result<()>;
    async fn link_set_down(&self, iface: &str) -> Result<()>;
    async fn link_set_master(&self, iface: &str, bridge: &str) -> Result<()>;
    async fn link_set_learning_off(&self, iface: &str) -> Result<()>;
    async fn get_link_mtu(&self, iface: &str) -> Result<u16>;

    // -- Address / route --
    async fn addr_list(&self, iface: &str) -> Result<Vec<Ipv4Cidr>>;
    async fn addr_list_v6(&self, iface: &str) -> Result<Vec<Ipv6Cidr>>;
    async fn addr_add(&self, iface: &str, addr: Ipv4Cidr) -> Result<()>;
    async fn addr_add_v6(&self, iface: &str, addr: Ipv6Addr, prefix: u8) -> Result<()>;
    async fn addr_del(&self, iface: &str, addr: Ipv4Cidr) -> Result<()>;
    async fn route_list(&self, iface: &str) -> Result<Vec<Route>>;

    // -- MAC --
    async fn get_mac(&self, iface: &str) -> Result<Mac>;
    async fn set_random_mac(&self, iface: &str) -> Result<Mac>;
    fn generate_random_mac(&self) -> Mac;

    // -- Tap --
    async fn create_tap_device(&self, name: &str, queues: u32, pid: &str, mtu: u16) -> Result<()>;
    async fn bind_tap_device_to_bridge(&self, name: &str, bridge: &str) -> Result<()>;

    // -- IPv6 --
    async fn is_ipv6_enabled(&self, iface: &str) -> Result<bool>;
    async fn configure_ipv6_forwarding(&self) -> Result<()>;
    fn is_ipv4_primary(&self) -> bool;

    // -- Firewall --
    async fn has_nat_iptables(&self, family: IpFamily) -> Result<bool>;
    async fn iptables_new_chain(&self, table: &str, chain: &str, family: IpFamily) -> Result<()>;
    async fn iptables_append_rule(
        &self,
        table: &str,
        chain: &str,
        family: IpFamily,
        rule: &[String],
    ) -> Result<()>;
    async fn nftables_load(&self, table: &str) -> Result<()>;
    async fn nftables_new_chain(&self, table: &str, chain: &str, family: IpFamily) -> Result<()>;
    async fn nftables_append_rule(
        &self,
        table: &str,
        chain: &str,
        family: IpFamily,
        rule: &[String],
    ) -> Result<()>;
    fn get_nft_ip_string(&self, family: IpFamily) -> &'static str;

    // -- Offload --
    async fn disable_tx_offload_checksum(&self, iface: &str) -> Result<()>;

    // -- Addressing math --
    fn get_host_and_gw_addresses_from_cidr(&self, cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr)>;
    fn get_host_and_gw_addresses_from_cidr_v6(&self, cidr: &str) -> Result<(Ipv6Addr, Ipv6Addr)>;

    // -- DHCP --
    async fn start_dhcp(&self, iface: &str, bridge: &str, options: &DhcpOptions) -> Result<()>;
}

/// Real implementation: `rtnetlink` for link/address/route mutation,
/// shelled `iptables`/`nft` for firewall programming (no firewall-rule crate
/// appears anywhere in the retrieved corpus), and a raw `TUNSETIFF` ioctl
/// under `nix::sched::setns` for tap creation (likewise no tun/tap crate is
/// available anywhere in the corpus, so this one piece is written against the
/// kernel ABI directly rather than borrowed from an example).
#[derive(Debug, Default)]
pub struct RealNetHandler {
    ipv4_primary: bool,
}

impl RealNetHandler {
    pub fn new(ipv4_primary: bool) -> Self {
        RealNetHandler { ipv4_primary }
    }

    async fn link_index(handle: &rtnetlink::Handle, iface: &str) -> Result<Option<u32>> {
        let mut links = handle.link().get().match_name(iface.to_string()).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(msg.header.index)),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(e)) if e.code.map(|c| c.get()) == Some(-19) => {
                Ok(None) // ENODEV: no such device
            }
            Err(e) => Err(Error::Discovery {
                iface: iface.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn handle(&self) -> Result<rtnetlink::Handle> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| Error::Discovery {
                iface: String::new(),
                reason: format!("opening netlink socket: {e}"),
            })?;
        tokio::spawn(connection);
        Ok(handle)
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let (code, _out, err) = run_script::run_script!(format!(
            "{} {}",
            program,
            args.iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" ")
        ))
        .map_err(|e| Error::Firewall {
            iface: String::new(),
            reason: format!("spawning {program}: {e}"),
        })?;
        if code != 0 {
            return Err(Error::Firewall {
                iface: String::new(),
                reason: format!("{program} {args:?} exited with status {code}: {err}"),
            });
        }
        Ok(())
    }
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[async_trait]
impl NetHandler for RealNetHandler {
    async fn link_exists(&self, iface: &str) -> Result<bool> {
        let handle = self.handle().await?;
        Ok(Self::link_index(&handle, iface).await?.is_some())
    }

    async fn link_add_bridge(&self, name: &str, mtu: u16) -> Result<()> {
        let handle = self.handle().await?;
        let mut req = handle.link().add().bridge(name.to_string());
        req.message_mut()
            .attributes
            .push(LinkAttribute::Mtu(mtu as u32));
        req.execute().await.map_err(|e| Error::Prepare {
            iface: name.to_string(),
            reason: format!("creating bridge: {e}"),
            critical: false,
        })
    }

    async fn link_add_dummy(&self, name: &str, mtu: u16) -> Result<()> {
        let handle = self.handle().await?;
        let mut req = handle.link().add().dummy(name.to_string());
        req.message_mut()
            .attributes
            .push(LinkAttribute::Mtu(mtu as u32));
        req.execute().await.map_err(|e| Error::Prepare {
            iface: name.to_string(),
            reason: format!("creating dummy uplink: {e}"),
            critical: false,
        })
    }

    async fn link_set_up(&self, iface: &str) -> Result<()> {
        let handle = self.handle().await?;
        let index = Self::link_index(&handle, iface)
            .await?
            .ok_or_else(|| Error::Prepare {
                iface: iface.to_string(),
                reason: "link not found".into(),
                critical: false,
            })?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| Error::Prepare {
                iface: iface.to_string(),
                reason: format!("link set up: {e}"),
                critical: false,
            })
    }

    async fn link_set_down(&self, iface: &str) -> Result<()> {
        let handle = self.handle().await?;
        let index = Self::link_index(&handle, iface)
            .await?
            .ok_or_else(|| Error::Prepare {
                iface: iface.to_string(),
                reason: "link not found".into(),
                critical: false,
            })?;
        handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(|e| Error::Prepare {
                iface: iface.to_string(),
                reason: format!("link set down: {e}"),
                critical: false,
            })
    }

    async fn link_set_master(&self, iface: &str, bridge: &str) -> Result<()> {
        let handle = self.handle().await?;
        let iface_index =
            Self::link_index(&handle, iface)
                .await?
                .ok_or_else(|| Error::Prepare {
                    iface: iface.to_string(),
                    reason: "link not found".into(),
                    critical: false,
                })?;
        let bridge_index =
            Self::link_index(&handle, bridge)
                .await?
                .ok_or_else(|| Error::Prepare {
                    iface: bridge.to_string(),
                    reason: "bridge not found".into(),
                    critical: false,
                })?;
        handle
            .link()
            .set(iface_index)
            .controller(bridge_index)
            .execute()
            .await
            .map_err(|e| Error::Prepare {
                iface: iface.to_string(),
                reason: format!("link set master: {e}"),
                critical: false,
            })
    }

    async fn link_set_learning_off(&self, iface: &str) -> Result<()> {
        self.run("bridge", &["link", "set", "dev", iface, "learning", "off"])
    }

    async fn get_link_mtu(&self, iface: &str) -> Result<u16> {
        let handle = self.handle().await?;
        let mut links = handle.link().get().match_name(iface.to_string()).execute();
        let msg = links
            .try_next()
            .await
            .map_err(|e| Error::Discovery {
                iface: iface.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| Error::Discovery {
                iface: iface.to_string(),
                reason: "link not found".into(),
            })?;
        for attr in &msg.attributes {
            if let LinkAttribute::Mtu(mtu) = attr {
                return u16::try_from(*mtu).map_err(|_| Error::Discovery {
                    iface: iface.to_string(),
                    reason: "MTU value out of range".into(),
                });
            }
        }
        Err(Error::Discovery {
            iface: iface.to_string(),
            reason: "no MTU attribute".into(),
        })
    }

    async fn addr_list(&self, iface: &str) -> Result<Vec<Ipv4Cidr>> {
        let handle = self.handle().await?;
        let index = match Self::link_index(&handle, iface).await? {
            Some(i) => i,
            None => return Ok(Vec::new()),
        };
        let mut addrs = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut result = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(|e| Error::Discovery {
            iface: iface.to_string(),
            reason: e.to_string(),
        })? {
            for attr in &msg.attributes {
                if let netlink_packet_route::address::AddressAttribute::Address(
                    std::net::IpAddr::V4(addr),
                ) = attr
                {
                    result.push(Ipv4Cidr {
                        addr: *addr,
                        prefix: msg.header.prefix_len,
                    });
                }
            }
        }
        Ok(result)
    }

    async fn addr_list_v6(&self, iface: &str) -> Result<Vec<Ipv6Cidr>> {
        let handle = self.handle().await?;
        let index = match Self::link_index(&handle, iface).await? {
            Some(i) => i,
            None => return Ok(Vec::new()),
        };
        let mut addrs = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut result = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(|e| Error::Discovery {
            iface: iface.to_string(),
            reason: e.to_string(),
        })? {
            for attr in &msg.attributes {
                if let netlink_packet_route::address::AddressAttribute::Address(
                    std::net::IpAddr::V6(addr),
                ) = attr
                {
                    result.push(Ipv6Cidr {
                        addr: *addr,
                        prefix: msg.header.prefix_len,
                    });
                }
            }
        }
        Ok(result)
    }

    async fn addr_add(&self, iface: &str, addr: Ipv4Cidr) -> Result<()> {
        let handle = self.handle().await?;
        let index = Self::link_index(&handle, iface)
            .await?
            .ok_or_else(|| Error::Prepare {
                iface: iface.to_string(),
                reason: "link not found".into(),
                critical: false,
            })?;
        handle
            .address()
            .add(index, std::net::IpAddr::V4(addr.addr), addr.prefix)
            .execute()
            .await
            .map_err(|e| Error::Prepare {
                iface: iface.to_string(),
                reason: format!("addr add: {e}"),
                critical: false,
            })
    }

    async fn addr_add_v6(&self, iface: &str, addr: Ipv6Addr, prefix: u8) -> Result<()> {
        let handle = self.handle().await?;
        let index = Self::link_index(&handle, iface)
            .await?
            .ok_or_else(|| Error::Prepare {
                iface: iface.to_string(),
                reason: "link not found".into(),
                critical: false,
            })?;
        handle
            .address()
            .add(index, std::net::IpAddr::V6(addr), prefix)
            .execute()
            .await
            .map_err(|e| Error::Prepare {
                iface: iface.to_string(),
                reason: format!("addr add (v6): {e}"),
                critical: false,
            })
    }

    async fn addr_del(&self, iface: &str, addr: Ipv4Cidr) -> Result<()> {
        let handle = self.handle().await?;
        let index = match Self::link_index(&handle, iface).await? {
            Some(i) => i,
            None => return Ok(()),
        };
        let mut msg = netlink_packet_route::address::AddressMessage::default();
        msg.header.index = index;
        msg.header.prefix_len = addr.prefix;
        msg.header.family = netlink_packet_route::AddressFamily::Inet;
        msg.attributes
            .push(netlink_packet_route::address::AddressAttribute::Address(
                std::net::IpAddr::V4(addr.addr),
            ));
        handle
            .address()
            .del(msg)
            .execute()
            .await
            .map_err(|e| Error::Prepare {
                iface: iface.to_string(),
                reason: format!("addr del: {e}"),
                critical: false,
            })
    }

    async fn route_list(&self, iface: &str) -> Result<Vec<Route>> {
        let handle = self.handle().await?;
        let index = match Self::link_index(&handle, iface).await? {
            Some(i) => i,
            None => return Ok(Vec::new()),
        };
        let mut routes = handle.route().get(rtnetlink::IpVersion::V4).execute();
        let mut result = Vec::new();
        while let Some(msg) = routes.try_next().await.map_err(|e| Error::Discovery {
            iface: iface.to_string(),
            reason: e.to_string(),
        })? {
            let mut oif = None;
            let mut dest_addr = None;
            let mut gateway = None;
            for attr in &msg.attributes {
                match attr {
                    netlink_packet_route::route::RouteAttribute::Oif(i) => oif = Some(*i),
                    netlink_packet_route::route::RouteAttribute::Destination(
                        netlink_packet_route::route::RouteAddress::Inet(addr),
                    ) => dest_addr = Some(*addr),
                    netlink_packet_route::route::RouteAttribute::Gateway(
                        netlink_packet_route::route::RouteAddress::Inet(addr),
                    ) => gateway = Some(*addr),
                    _ => {}
                }
            }
            if oif != Some(index) {
                continue;
            }
            let Some(gateway) = gateway else {
                continue;
            };
            // A default route carries no Destination attribute at all
            // (0.0.0.0/0 is implicit).
            let dest_addr = dest_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
            result.push(Route {
                destination: Ipv4Cidr {
                    addr: dest_addr,
                    prefix: msg.header.destination_prefix_length,
                },
                gateway,
            });
        }
        Ok(result)
    }

    async fn get_mac(&self, iface: &str) -> Result<Mac> {
        let handle = self.handle().await?;
        let mut links = handle.link().get().match_name(iface.to_string()).execute();
        let msg = links
            .try_next()
            .await
            .map_err(|e| Error::Discovery {
                iface: iface.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| Error::Discovery {
                iface: iface.to_string(),
                reason: "link not found".into(),
            })?;
        for attr in &msg.attributes {
            if let LinkAttribute::Address(bytes) = attr {
                if bytes.len() == 6 {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(bytes);
                    return Ok(Mac(mac));
                }
            }
        }
        Err(Error::Discovery {
            iface: iface.to_string(),
            reason: "no hardware address attribute".into(),
        })
    }

    async fn set_random_mac(&self, iface: &str) -> Result<Mac> {
        let mac = self.generate_random_mac();
        let handle = self.handle().await?;
        let index = Self::link_index(&handle, iface)
            .await?
            .ok_or_else(|| Error::Prepare {
                iface: iface.to_string(),
                reason: "link not found".into(),
                critical: false,
            })?;
        handle
            .link()
            .set(index)
            .address(mac.0.to_vec())
            .execute()
            .await
            .map_err(|e| Error::Prepare {
                iface: iface.to_string(),
                reason: format!("set random mac: {e}"),
                critical: false,
            })?;
        Ok(mac)
    }

    fn generate_random_mac(&self) -> Mac {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        // Clear the multicast bit, set the locally-administered bit.
        bytes[0] = (bytes[0] & 0xfc) | 0x02;
        Mac(bytes)
    }

    async fn create_tap_device(&self, name: &str, queues: u32, pid: &str, mtu: u16) -> Result<()> {
        create_tap_in_netns(name, queues, pid, mtu)
    }

    async fn bind_tap_device_to_bridge(&self, name: &str, bridge: &str) -> Result<()> {
        self.link_set_master(name, bridge).await
    }

    async fn is_ipv6_enabled(&self, iface: &str) -> Result<bool> {
        let handle = self.handle().await?;
        let index = match Self::link_index(&handle, iface).await? {
            Some(i) => i,
            None => return Ok(false),
        };
        let mut addrs = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = addrs.try_next().await.map_err(|e| Error::Discovery {
            iface: iface.to_string(),
            reason: e.to_string(),
        })? {
            if msg.header.family == netlink_packet_route::AddressFamily::Inet6 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn configure_ipv6_forwarding(&self) -> Result<()> {
        tokio::fs::write("/proc/sys/net/ipv6/conf/all/forwarding", b"1\n")
            .await
            .map_err(Error::Io)
    }

    fn is_ipv4_primary(&self) -> bool {
        self.ipv4_primary
    }

    async fn has_nat_iptables(&self, family: IpFamily) -> Result<bool> {
        let binary = match family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        };
        Ok(run_script::run_script!(format!("{binary} -t nat -L -n"))
            .map(|(code, _, _)| code == 0)
            .unwrap_or(false))
    }

    async fn iptables_new_chain(&self, table: &str, chain: &str, family: IpFamily) -> Result<()> {
        let binary = match family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        };
        self.run(binary, &["-t", table, "-N", chain])
    }

    async fn iptables_append_rule(
        &self,
        table: &str,
        chain: &str,
        family: IpFamily,
        rule: &[String],
    ) -> Result<()> {
        let binary = match family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        };
        let mut args = vec!["-t", table, "-A", chain];
        args.extend(rule.iter().map(String::as_str));
        self.run(binary, &args)
    }

    async fn nftables_load(&self, table: &str) -> Result<()> {
        self.run("nft", &["-f", &format!("/etc/kubevirt/nft/{table}.nft")])
    }

    async fn nftables_new_chain(&self, table: &str, chain: &str, family: IpFamily) -> Result<()> {
        let fam = self.get_nft_ip_string(family);
        self.run(
            "nft",
            &[
                "add",
                "chain",
                fam,
                table,
                chain,
                "{",
                "type",
                "nat",
                "hook",
                "prerouting",
                "priority",
                "0",
                ";",
                "}",
            ],
        )
    }

    async fn nftables_append_rule(
        &self,
        table: &str,
        chain: &str,
        family: IpFamily,
        rule: &[String],
    ) -> Result<()> {
        let fam = self.get_nft_ip_string(family);
        let mut args = vec!["add", "rule", fam, table, chain];
        args.extend(rule.iter().map(String::as_str));
        self.run("nft", &args)
    }

    fn get_nft_ip_string(&self, family: IpFamily) -> &'static str {
        match family {
            IpFamily::V4 => "ip",
            IpFamily::V6 => "ip6",
        }
    }

    async fn disable_tx_offload_checksum(&self, iface: &str) -> Result<()> {
        self.run("ethtool", &["-K", iface, "tx", "off"])
    }

    fn get_host_and_gw_addresses_from_cidr(&self, cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let net: Ipv4Network = cidr
            .parse()
            .map_err(|e| Error::Config(format!("invalid CIDR {cidr}: {e}")))?;
        let mut hosts = net.iter().skip(1);
        let gateway = hosts
            .next()
            .ok_or_else(|| Error::Config(format!("CIDR {cidr} has no usable hosts")))?;
        let vm_addr = hosts
            .next()
            .ok_or_else(|| Error::Config(format!("CIDR {cidr} has too few usable hosts")))?;
        Ok((gateway, vm_addr))
    }

    fn get_host_and_gw_addresses_from_cidr_v6(&self, cidr: &str) -> Result<(Ipv6Addr, Ipv6Addr)> {
        let net: Ipv6Network = cidr
            .parse()
            .map_err(|e| Error::Config(format!("invalid CIDR {cidr}: {e}")))?;
        // IPv6 has no broadcast address to skip; the network address itself
        // (::0 within the prefix) is reserved for the subnet-router anycast
        // address, so usable hosts still start one past it.
        let mut hosts = net.iter().skip(1);
        let gateway = hosts
            .next()
            .ok_or_else(|| Error::Config(format!("CIDR {cidr} has no usable hosts")))?;
        let vm_addr = hosts
            .next()
            .ok_or_else(|| Error::Config(format!("CIDR {cidr} has too few usable hosts")))?;
        Ok((gateway, vm_addr))
    }

    async fn start_dhcp(&self, iface: &str, bridge: &str, options: &DhcpOptions) -> Result<()> {
        let mut args = vec![
            "dhcp-range".to_string(),
            format!("{},{},infinite", options.client_ip, options.client_ip),
            format!("dhcp-host={},{}", options.client_mac, options.client_ip),
        ];
        if let Some(router) = options.router {
            args.push(format!("dhcp-option=3,{router}"));
        }
        args.push(format!("dhcp-option=26,{}", options.mtu));
        for route in &options.routes {
            args.push(format!(
                "dhcp-option=121,{}/{},{}",
                route.destination.addr, route.destination.prefix, route.gateway
            ));
        }
        self.run(
            "dnsmasq",
            &[
                "--interface",
                bridge,
                "--bind-interfaces",
                "--except-interface=lo",
                "--dhcp-authoritative",
                &args.join(" --"),
            ],
        )
        .map_err(|e| match e {
            Error::Firewall { reason, .. } => Error::Dhcp {
                iface: iface.to_string(),
                reason,
            },
            other => other,
        })
    }
}

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Enter `pid`'s network namespace, create a persistent multi-queue-capable
/// tap device, and restore the caller's own namespace. No tun/tap crate
/// appears anywhere in the retrieved corpus, so this talks to
/// `/dev/net/tun` via the raw `TUNSETIFF` ioctl directly.
fn create_tap_in_netns(name: &str, queues: u32, pid: &str, _mtu: u16) -> Result<()> {
    let self_ns = std::fs::File::open("/proc/self/ns/net").map_err(Error::Io)?;
    let target_ns = std::fs::File::open(format!("/proc/{pid}/ns/net")).map_err(Error::Io)?;

    nix::sched::setns(target_ns.as_fd(), nix::sched::CloneFlags::CLONE_NEWNET).map_err(|e| {
        Error::Prepare {
            iface: name.to_string(),
            reason: format!("entering netns of pid {pid}: {e}"),
            critical: false,
        }
    })?;

    let result = (|| -> Result<()> {
        for _ in 0..queues.max(1) {
            open_tap(name, queues > 1)?;
        }
        Ok(())
    })();

    nix::sched::setns(self_ns.as_fd(), nix::sched::CloneFlags::CLONE_NEWNET).map_err(|e| {
        Error::Prepare {
            iface: name.to_string(),
            reason: format!("restoring original netns: {e}"),
            critical: false,
        }
    })?;

    result
}

fn open_tap(name: &str, multi_queue: bool) -> Result<RawFd> {
    use std::os::unix::ffi::OsStrExt;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(Error::Io)?;

    let mut ifr = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TAP | IFF_NO_PI | if multi_queue { IFF_MULTI_QUEUE } else { 0 },
        _pad: [0; 22],
    };
    let name_bytes = std::ffi::OsStr::new(name).as_bytes();
    for (dst, src) in ifr.name.iter_mut().zip(name_bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let fd = std::os::fd::AsRawFd::as_raw_fd(&file);
    let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, &ifr) };
    if ret < 0 {
        return Err(Error::Prepare {
            iface: name.to_string(),
            reason: format!("TUNSETIFF: {}", std::io::Error::last_os_error()),
            critical: false,
        });
    }
    // Leak the fd: the tap device stays alive in the kernel as long as a
    // process holds a handle to it; ownership transfers to the launcher
    // process that inherits this fd across exec, per §5 ("Tap device —
    // created in Phase 1 into the launcher's netns").
    std::mem::forget(file);
    Ok(fd)
}

/// Filter a discovered route list down to the entries worth replaying to the
/// guest as DHCP classless static routes: anything that isn't the default
/// route itself (the default route drives the `router` option separately).
pub fn filter_pod_network_routes(routes: &[Route]) -> Vec<Route> {
    routes
        .iter()
        .filter(|r| r.destination.prefix != 0)
        .copied()
        .collect()
}
