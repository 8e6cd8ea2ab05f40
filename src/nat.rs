//! NAT rule programmer for the Masquerade variant (§4.5.1).
//!
//! Builds the `KUBEVIRT_PREINBOUND`/`KUBEVIRT_POSTINBOUND` chains and
//! programs them through whichever firewall backend the handler reports as
//! available, preferring iptables-nat and falling back to nftables.

use crate::error::Result;
use crate::handler::{IpFamily, NetHandler};
use crate::spec::PortMapping;

const PREINBOUND: &str = "KUBEVIRT_PREINBOUND";
const POSTINBOUND: &str = "KUBEVIRT_POSTINBOUND";
const NAT_TABLE: &str = "nat";

/// Program NAT for one address family: base rules plus one DNAT/SNAT/MASQUERADE
/// triplet per port, or a catch-all DNAT if `ports` is empty.
pub async fn program_nat(
    handler: &dyn NetHandler,
    family: IpFamily,
    sandbox_iface: &str,
    bridge: &str,
    vm_ip: &str,
    gateway_ip: &str,
    ports: &[PortMapping],
) -> Result<()> {
    let use_iptables = handler.has_nat_iptables(family).await?;
    if use_iptables {
        handler
            .iptables_new_chain(NAT_TABLE, PREINBOUND, family)
            .await?;
        handler
            .iptables_new_chain(NAT_TABLE, POSTINBOUND, family)
            .await?;
    } else {
        let ruleset = match family {
            IpFamily::V4 => "ipv4-nat",
            IpFamily::V6 => "ipv6-nat",
        };
        handler.nftables_load(ruleset).await?;
        handler
            .nftables_new_chain(NAT_TABLE, PREINBOUND, family)
            .await?;
        handler
            .nftables_new_chain(NAT_TABLE, POSTINBOUND, family)
            .await?;
    }

    for rule in base_rules(sandbox_iface, bridge, vm_ip) {
        append(handler, use_iptables, family, &rule).await?;
    }

    if ports.is_empty() {
        append(
            handler,
            use_iptables,
            family,
            &Rule {
                table: NAT_TABLE,
                chain: PREINBOUND,
                args: vec!["-j".into(), "DNAT".into(), "--to".into(), vm_ip.into()],
            },
        )
        .await?;
        return Ok(());
    }

    let loopback = family.loopback();
    for port in ports {
        for rule in port_triplet(port, vm_ip, gateway_ip, loopback) {
            append(handler, use_iptables, family, &rule).await?;
        }
    }
    Ok(())
}

struct Rule {
    table: &'static str,
    chain: &'static str,
    args: Vec<String>,
}

fn base_rules(sandbox_iface: &str, bridge: &str, vm_ip: &str) -> Vec<Rule> {
    vec![
        Rule {
            table: NAT_TABLE,
            chain: "POSTROUTING",
            args: vec!["-s".into(), vm_ip.into(), "-j".into(), "MASQUERADE".into()],
        },
        Rule {
            table: NAT_TABLE,
            chain: "PREROUTING",
            args: vec![
                "-i".into(),
                sandbox_iface.into(),
                "-j".into(),
                PREINBOUND.into(),
            ],
        },
        Rule {
            table: NAT_TABLE,
            chain: "POSTROUTING",
            args: vec!["-o".into(), bridge.into(), "-j".into(), POSTINBOUND.into()],
        },
    ]
}

fn port_triplet(port: &PortMapping, vm_ip: &str, gateway_ip: &str, loopback: &str) -> Vec<Rule> {
    let proto = port.protocol.as_str();
    let dport = port.port.to_string();
    vec![
        Rule {
            table: NAT_TABLE,
            chain: POSTINBOUND,
            args: vec![
                "-p".into(),
                proto.into(),
                "--dport".into(),
                dport.clone(),
                "--source".into(),
                loopback.into(),
                "-j".into(),
                "SNAT".into(),
                "--to-source".into(),
                gateway_ip.into(),
            ],
        },
        Rule {
            table: NAT_TABLE,
            chain: PREINBOUND,
            args: vec![
                "-p".into(),
                proto.into(),
                "--dport".into(),
                dport.clone(),
                "-j".into(),
                "DNAT".into(),
                "--to-dest".into(),
                vm_ip.into(),
            ],
        },
        Rule {
            table: NAT_TABLE,
            chain: "OUTPUT",
            args: vec![
                "-p".into(),
                proto.into(),
                "--dport".into(),
                dport,
                "--dest".into(),
                loopback.into(),
                "-j".into(),
                "DNAT".into(),
                "--to-dest".into(),
                vm_ip.into(),
            ],
        },
    ]
}

async fn append(
    handler: &dyn NetHandler,
    use_iptables: bool,
    family: IpFamily,
    rule: &Rule,
) -> Result<()> {
    if use_iptables {
        handler
            .iptables_append_rule(rule.table, rule.chain, family, &rule.args)
            .await
    } else {
        handler
            .nftables_append_rule(rule.table, rule.chain, family, &rule.args)
            .await
    }
}
