//! Input types the Orchestrator is driven by.
//!
//! The distilled design treats "VMI spec / interface spec / network spec" as
//! opaque inputs owned by the cluster API. This module re-creates only the
//! fields §3/§4 actually reference, not a full cluster API.

use serde::{Deserialize, Serialize};

/// A VM instance definition: a name plus its ordered network interfaces.
///
/// Ordering matters: `bridge_fake_ip`'s last octet is derived from an
/// interface's position in this list (§4.4, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmiSpec {
    pub name: String,
    pub interfaces: Vec<InterfaceSpec>,
    /// Guest vCPU count, used by the domain-side queue calculator when an
    /// interface requests `network_interface_multi_queue` (§4.1 step 4b).
    #[serde(default = "default_vcpu_count")]
    pub vcpu_count: usize,
}

fn default_vcpu_count() -> usize {
    1
}

/// Caps the tap device's queue count regardless of vCPU count (§4.1, §9).
const MAX_NETWORK_QUEUES: usize = 8;

impl VmiSpec {
    /// Position of `iface_name` within `interfaces`, used as the bridge
    /// fake-IP octet. `None` if the interface isn't part of this VMI.
    pub fn interface_index(&self, iface_name: &str) -> Option<usize> {
        self.interfaces.iter().position(|i| i.name == iface_name)
    }

    /// `0` unless the interface opts into multi-queue, in which case one
    /// queue per vCPU up to `MAX_NETWORK_QUEUES` (§4.1 step 4b).
    pub fn queue_number_for(&self, iface: &InterfaceSpec) -> u32 {
        if !iface.network_interface_multi_queue {
            return 0;
        }
        self.vcpu_count.clamp(1, MAX_NETWORK_QUEUES) as u32
    }
}

/// One binding variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingVariant {
    Bridge,
    Masquerade,
    Slirp,
    Macvtap,
    /// Short-circuit no-op: the device is managed entirely by an external
    /// SR-IOV device plugin.
    Sriov,
}

/// Per-interface configuration supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Sandbox-interface name wired by the external network plugin.
    pub name: String,
    /// Domain-side device model (e.g. "virtio-net"), used by Slirp.
    pub model: Option<String>,
    /// Caller-requested MAC; if unset, Masquerade generates one.
    pub mac: Option<String>,
    pub binding: BindingVariant,
    /// Individual ports to DNAT; empty means forward all traffic (Masquerade
    /// only).
    pub ports: Vec<PortMapping>,
    /// Whether to size the tap device's queue count from the guest vCPU
    /// count instead of defaulting to a single queue.
    pub network_interface_multi_queue: bool,
}

/// Network-wide configuration, mostly relevant to Masquerade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// IPv4 CIDR handed to the guest; defaults to `10.0.2.0/24`-style pool
    /// when unset.
    pub vm_network_cidr: Option<String>,
    /// IPv6 CIDR handed to the guest. The distilled source threads this field
    /// but never populates it (see Design Notes); this rewrite exposes it as
    /// a first-class field instead.
    pub vm_ipv6_network_cidr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
}
