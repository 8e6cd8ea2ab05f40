//! Minimal in-memory stand-in for the libvirt-style domain XML that Phase 2's
//! `decorateConfig` step mutates (§4.2, §4.6, §4.7). The Core never owns the
//! full domain document; it only needs to find the interface entry whose
//! alias matches the sandbox-interface name and stamp or remove it.

use crate::model::DomainInterface;

/// One interface entry as it appears in the domain's device list, keyed by
/// the alias the launcher assigned when it built the domain skeleton.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainDeviceInterface {
    pub alias: String,
    pub interface: DomainInterface,
}

/// A `-device`/value pair appended to the guest's QEMU command line, used by
/// Slirp in place of a domain device entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QemuArg {
    pub flag: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Domain {
    pub interfaces: Vec<DomainDeviceInterface>,
    pub qemu_args: Vec<QemuArg>,
}

impl Domain {
    pub fn interface_mut(&mut self, alias: &str) -> Option<&mut DomainDeviceInterface> {
        self.interfaces.iter_mut().find(|i| i.alias == alias)
    }

    /// Remove and return the entry matching `alias`, used by Slirp which
    /// attaches through user-mode emulation instead of a domain device.
    pub fn remove_interface(&mut self, alias: &str) -> Option<DomainDeviceInterface> {
        let pos = self.interfaces.iter().position(|i| i.alias == alias)?;
        Some(self.interfaces.remove(pos))
    }

    pub fn push_qemu_arg(&mut self, flag: impl Into<String>, value: impl Into<String>) {
        self.qemu_args.push(QemuArg {
            flag: flag.into(),
            value: value.into(),
        });
    }
}
