//! Serializable data held between Phase 1 and Phase 2, and handed to the
//! domain generator.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// A 6-byte hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub fn parse(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for b in bytes.iter_mut() {
            *b = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Mac(bytes))
    }
}

impl std::fmt::Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// An IPv4 address plus its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

/// An IPv6 address plus its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Cidr {
    pub addr: Ipv6Addr,
    pub prefix: u8,
}

/// A non-default route to replay to the guest via DHCP classless static
/// routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: Ipv4Cidr,
    pub gateway: Ipv4Addr,
}

/// Virtual Interface Facts: the discovery record a variant populates in
/// Phase 1 and consumes in Phase 2.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vif {
    pub name: String,
    pub mac: Mac,
    pub mtu: u16,
    pub ip: Option<Ipv4Cidr>,
    pub ipv6: Option<Ipv6Cidr>,
    pub gateway: Option<Ipv4Addr>,
    pub gateway_ipv6: Option<Ipv6Addr>,
    pub routes: Vec<Route>,
    pub ipam_disabled: bool,
    /// Empty for Slirp/Macvtap.
    pub tap_device: String,
}

// §4.8 has the source canonicalize `Gateway`/`GatewayIpv6` to fixed 4/16-byte
// form after a cache load. `Ipv4Addr`/`Ipv6Addr` are already fixed-width and
// round-trip through serde without ambiguity, so there is nothing to
// canonicalize here.

/// The minimal record handed to the domain generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainInterface {
    pub mac: Mac,
    pub mtu: u16,
    pub target: InterfaceTarget,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceTarget {
    pub device: String,
    pub managed: String,
}

impl InterfaceTarget {
    pub fn new(device: impl Into<String>) -> Self {
        InterfaceTarget {
            device: device.into(),
            managed: "no".to_string(),
        }
    }
}

/// User-visible status written once per interface, captured *before* any
/// reshaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodCacheInterface {
    pub iface: String,
    pub pod_ip: Option<std::net::IpAddr>,
    pub pod_ips: Vec<std::net::IpAddr>,
}

impl PodCacheInterface {
    /// Order `pod_ips` with the cluster primary family first.
    pub fn new(
        iface: impl Into<String>,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
        ipv4_primary: bool,
    ) -> Self {
        let mut pod_ips = Vec::new();
        let v4 = ipv4.map(std::net::IpAddr::V4);
        let v6 = ipv6.map(std::net::IpAddr::V6);
        if ipv4_primary {
            pod_ips.extend(v4);
            pod_ips.extend(v6);
        } else {
            pod_ips.extend(v6);
            pod_ips.extend(v4);
        }
        PodCacheInterface {
            iface: iface.into(),
            pod_ip: pod_ips.first().copied(),
            pod_ips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trips_through_display_and_parse() {
        let mac = Mac([0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01]);
        assert_eq!(mac.to_string(), "aa:bb:cc:00:00:01");
        assert_eq!(Mac::parse(&mac.to_string()), Some(mac));
    }

    #[test]
    fn mac_parse_rejects_wrong_length() {
        assert_eq!(Mac::parse("aa:bb:cc"), None);
        assert_eq!(Mac::parse("aa:bb:cc:dd:ee:ff:00"), None);
    }

    #[test]
    fn pod_ips_ordered_with_primary_family_first() {
        let ipv4: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let ipv6: Ipv6Addr = "fd00::5".parse().unwrap();

        let primary_v4 = PodCacheInterface::new("eth0", Some(ipv4), Some(ipv6), true);
        assert_eq!(
            primary_v4.pod_ips,
            vec![std::net::IpAddr::V4(ipv4), std::net::IpAddr::V6(ipv6)]
        );
        assert_eq!(primary_v4.pod_ip, Some(std::net::IpAddr::V4(ipv4)));

        let primary_v6 = PodCacheInterface::new("eth0", Some(ipv4), Some(ipv6), false);
        assert_eq!(
            primary_v6.pod_ips,
            vec![std::net::IpAddr::V6(ipv6), std::net::IpAddr::V4(ipv4)]
        );
        assert_eq!(primary_v6.pod_ip, Some(std::net::IpAddr::V6(ipv6)));
    }
}
