//! Drives one binding variant through its two phases (§4.1, §4.2). The
//! Orchestrator itself never talks to the kernel; it resolves a
//! [`Variant`](crate::variants::Variant), gates on cache existence for
//! idempotence, and sequences discover → prepare → persist (Phase 1) or
//! load → decorate → DHCP (Phase 2).

use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::handler::NetHandler;
use crate::model::PodCacheInterface;
use crate::spec::{BindingVariant, InterfaceSpec, NetworkSpec, VmiSpec};
use crate::variants::{BindMechanism, Variant};

/// Zero-byte marker written by `ensure_dhcp` (§4.2 step 6, §6.2).
fn dhcp_sentinel_path(sentinel_dir: &Path, iface: &str) -> PathBuf {
    sentinel_dir.join(format!("dhcp_started-{iface}"))
}

/// Phase 1: privileged discovery and kernel mutation, run once per interface
/// per sandbox lifetime. `pod_uid` identifies the pod-status cache row.
pub async fn plug_phase1(
    handler: &dyn NetHandler,
    cache: &CacheStore,
    vmi: &VmiSpec,
    iface: &InterfaceSpec,
    network: &NetworkSpec,
    pod_uid: &str,
    launcher_pid: &str,
) -> Result<()> {
    if iface.binding == BindingVariant::Sriov {
        return Ok(());
    }

    let variant = Variant::for_interface(iface.binding, vmi, iface, network)?;

    let already_cached = variant
        .cached_interface_exists(cache, launcher_pid, &iface.name)
        .map_err(|e| Error::Cache {
            iface: iface.name.clone(),
            reason: e.to_string(),
        })?;

    // §4.1 step 3: present *and* variant != Slirp skips discovery; the
    // PodCache write happens in the other branch, precisely so it captures
    // addresses as seen before any reshaping rather than after.
    let skip_discovery = already_cached && !matches!(variant, Variant::Slirp(_));

    if skip_discovery {
        debug!(
            "interface {} already cached for pid {launcher_pid}, skipping discovery",
            iface.name
        );
        return Ok(());
    }

    let addrs = handler.addr_list(&iface.name).await?;
    let addrs_v6 = handler.addr_list_v6(&iface.name).await?;
    let ipv4_primary = handler.is_ipv4_primary();
    let pod_cache = PodCacheInterface::new(
        iface.name.clone(),
        addrs.first().map(|a| a.addr),
        addrs_v6.first().map(|a| a.addr),
        ipv4_primary,
    );
    cache
        .store_pod_cache(pod_uid, &iface.name, &pod_cache)
        .map_err(|e| Error::Cache {
            iface: iface.name.clone(),
            reason: e.to_string(),
        })?;

    let vif = variant
        .discover_pod_network_interface(handler, iface)
        .await
        .inspect_err(|e| error!("discovery failed for interface {}: {e}", iface.name))?;

    let queue_number = vmi.queue_number_for(iface);

    let (domain_iface, vif) = variant
        .prepare_pod_network_interfaces(handler, vif, iface, queue_number, launcher_pid)
        .await
        .map_err(|e| {
            let critical = e.into_critical();
            error!(
                "critical network error preparing interface {}: {critical}",
                iface.name
            );
            critical
        })?;

    cache
        .store_interface(launcher_pid, &iface.name, &domain_iface)
        .map_err(|e| Error::Cache {
            iface: iface.name.clone(),
            reason: e.to_string(),
        })?;
    cache
        .store_vif(launcher_pid, &iface.name, &vif)
        .map_err(|e| Error::Cache {
            iface: iface.name.clone(),
            reason: e.to_string(),
        })?;

    Ok(())
}

/// Phase 2: launcher-side domain finalization. `sentinel_dir` is where
/// `dhcp_started-<iface>` sentinels live (§6.2).
#[allow(clippy::too_many_arguments)]
pub async fn plug_phase2(
    handler: &dyn NetHandler,
    cache: &CacheStore,
    domain: &mut Domain,
    vmi: &VmiSpec,
    iface: &InterfaceSpec,
    network: &NetworkSpec,
    alias: &str,
    sentinel_dir: &Path,
) -> Result<()> {
    if iface.binding == BindingVariant::Sriov {
        return Ok(());
    }

    let variant = Variant::for_interface(iface.binding, vmi, iface, network)?;

    let exists = variant
        .cached_interface_exists(cache, "self", &iface.name)
        .map_err(|e| Error::Cache {
            iface: iface.name.clone(),
            reason: e.to_string(),
        })?;
    if !exists {
        // §4.2 step 3's distilled behavior is "log and continue"; this
        // rewrite hard-aborts instead (§9) since a missing Phase-1 cache
        // means the domain would come up with no working interface at all.
        warn!(
            "no phase 1 interface cache found for {}; aborting phase 2",
            iface.name
        );
        return Err(Error::Cache {
            iface: iface.name.clone(),
            reason: "no Phase 1 interface cache found".into(),
        });
    }

    let domain_iface = cache
        .load_interface("self", &iface.name)
        .map_err(|e| Error::Cache {
            iface: iface.name.clone(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| Error::Cache {
            iface: iface.name.clone(),
            reason: "interface cache reported present but failed to load".into(),
        })?;

    let vif = variant
        .load_cached_vif(cache, "self", &iface.name)
        .map_err(|e| Error::Cache {
            iface: iface.name.clone(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| Error::Cache {
            iface: iface.name.clone(),
            reason: "VIF cache reported present but failed to load".into(),
        })?;

    variant.decorate_config(domain, alias, iface, &domain_iface, &vif)?;

    let bridge = crate::variants::bridge_name(&iface.name);
    ensure_dhcp(handler, &variant, &vif, &bridge, &iface.name, sentinel_dir).await?;

    Ok(())
}

/// Starts the variant's internal DHCP server unless the sentinel for this
/// interface already exists; touches the sentinel on success (§4.2 step 6).
///
/// DHCP failure is fatal to the launcher process (§7): a VM that boots
/// without its advertised addresses is worse than a process restart, so this
/// panics rather than returning the failure to the caller.
async fn ensure_dhcp(
    handler: &dyn NetHandler,
    variant: &Variant,
    vif: &crate::model::Vif,
    bridge: &str,
    iface: &str,
    sentinel_dir: &Path,
) -> Result<()> {
    let sentinel = dhcp_sentinel_path(sentinel_dir, iface);
    if sentinel.is_file() {
        debug!("dhcp sentinel already present for {iface}, not starting again");
        return Ok(());
    }

    if let Err(cause) = variant.start_dhcp(handler, vif, bridge).await {
        let err = Error::Dhcp {
            iface: iface.to_string(),
            reason: cause.to_string(),
        };
        error!("{err}");
        panic!("{err}");
    }

    if let Some(parent) = sentinel.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&sentinel, []).map_err(Error::Io)?;
    info!("dhcp started for interface {iface}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockNetHandler;
    use crate::model::{Mac, Vif};

    fn vmi_with(iface: InterfaceSpec) -> VmiSpec {
        VmiSpec {
            name: "vm1".into(),
            interfaces: vec![iface],
            vcpu_count: 1,
        }
    }

    fn macvtap_iface() -> InterfaceSpec {
        InterfaceSpec {
            name: "eth0".into(),
            model: None,
            mac: None,
            binding: BindingVariant::Macvtap,
            ports: vec![],
            network_interface_multi_queue: false,
        }
    }

    #[tokio::test]
    async fn sriov_is_a_pure_no_op() {
        let mock = MockNetHandler::new();
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let iface = InterfaceSpec {
            binding: BindingVariant::Sriov,
            ..macvtap_iface()
        };
        let vmi = vmi_with(iface.clone());
        plug_phase1(
            &mock,
            &cache,
            &vmi,
            &iface,
            &NetworkSpec::default(),
            "uid1",
            "123",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn phase1_is_idempotent_on_rerun() {
        let mut mock = MockNetHandler::new();
        mock.expect_addr_list().returning(|_| Ok(vec![]));
        mock.expect_addr_list_v6().returning(|_| Ok(vec![]));
        mock.expect_is_ipv4_primary().returning(|| true);
        mock.expect_get_mac()
            .returning(|_| Ok(Mac([0xaa, 0xbb, 0xcc, 0, 0, 1])));
        mock.expect_get_link_mtu().returning(|_| Ok(1450));

        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let iface = macvtap_iface();
        let vmi = vmi_with(iface.clone());

        plug_phase1(
            &mock,
            &cache,
            &vmi,
            &iface,
            &NetworkSpec::default(),
            "uid1",
            "123",
        )
        .await
        .unwrap();
        assert!(cache.interface_exists("123", "eth0"));

        // Second run must not touch discovery again: no further
        // `expect_get_mac`/`expect_get_link_mtu` call was registered above,
        // so a mock panic on an unexpected call would fail this test.
        plug_phase1(
            &mock,
            &cache,
            &vmi,
            &iface,
            &NetworkSpec::default(),
            "uid1",
            "123",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn pod_cache_is_captured_before_reshaping_and_not_overwritten_on_rerun() {
        let mut mock = MockNetHandler::new();
        // Bridge's own `AddrDel` on the sandbox interface means a second,
        // naive `addr_list` call after reshaping would see nothing — exactly
        // the scenario the PodCache write must not be exposed to. Two calls
        // are expected on the first (not-yet-cached) run only: one from the
        // Orchestrator's own PodCache snapshot, one from Bridge's discovery
        // IPAM check; none at all on the idempotent second run.
        mock.expect_addr_list().times(2).returning(|_| {
            Ok(vec![crate::model::Ipv4Cidr {
                addr: "10.244.0.7".parse().unwrap(),
                prefix: 24,
            }])
        });
        mock.expect_addr_list_v6()
            .times(1)
            .returning(|_| Ok(vec![]));
        mock.expect_is_ipv4_primary().returning(|| true);
        mock.expect_get_mac()
            .returning(|_| Ok(Mac([0xaa, 0xbb, 0xcc, 0, 0, 1])));
        mock.expect_get_link_mtu().returning(|_| Ok(1450));
        mock.expect_route_list().returning(|_| {
            Ok(vec![crate::model::Route {
                destination: crate::model::Ipv4Cidr {
                    addr: "0.0.0.0".parse().unwrap(),
                    prefix: 0,
                },
                gateway: "10.244.0.1".parse().unwrap(),
            }])
        });
        mock.expect_link_set_down().returning(|_| Ok(()));
        mock.expect_set_random_mac()
            .returning(|_| Ok(Mac([0x02, 0, 0, 0, 0, 9])));
        mock.expect_link_set_up().returning(|_| Ok(()));
        mock.expect_link_add_bridge().returning(|_, _| Ok(()));
        mock.expect_link_set_master().returning(|_, _| Ok(()));
        mock.expect_create_tap_device()
            .returning(|_, _, _, _| Ok(()));
        mock.expect_bind_tap_device_to_bridge()
            .returning(|_, _| Ok(()));
        mock.expect_addr_del().returning(|_, _| Ok(()));
        mock.expect_link_set_learning_off().returning(|_| Ok(()));
        mock.expect_addr_add().returning(|_, _| Ok(()));
        mock.expect_disable_tx_offload_checksum()
            .returning(|_| Ok(()));

        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let iface = InterfaceSpec {
            name: "eth0".into(),
            model: None,
            mac: None,
            binding: BindingVariant::Bridge,
            ports: vec![],
            network_interface_multi_queue: false,
        };
        let vmi = vmi_with(iface.clone());

        plug_phase1(
            &mock,
            &cache,
            &vmi,
            &iface,
            &NetworkSpec::default(),
            "uid1",
            "123",
        )
        .await
        .unwrap();

        let pod_cache = cache.load_pod_cache("uid1", "eth0").unwrap().unwrap();
        assert_eq!(pod_cache.pod_ip, Some("10.244.0.7".parse().unwrap()));

        // Idempotent re-entry: `AddrDel` has already run, so a naive re-read
        // of `addr_list` here would see nothing. The `.times(2)` expectation
        // above accounts for exactly the first run's two calls; a third call
        // here would panic the mock, so this run must not reach that code
        // path at all, and the PodCache already on disk must survive
        // untouched.
        plug_phase1(
            &mock,
            &cache,
            &vmi,
            &iface,
            &NetworkSpec::default(),
            "uid1",
            "123",
        )
        .await
        .unwrap();

        let pod_cache_after = cache.load_pod_cache("uid1", "eth0").unwrap().unwrap();
        assert_eq!(pod_cache_after.pod_ip, Some("10.244.0.7".parse().unwrap()));
    }

    #[tokio::test]
    async fn phase2_hard_aborts_when_phase1_cache_is_missing() {
        let mock = MockNetHandler::new();
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let mut domain = Domain::default();
        let iface = macvtap_iface();
        let vmi = vmi_with(iface.clone());

        let err = plug_phase2(
            &mock,
            &cache,
            &mut domain,
            &vmi,
            &iface,
            &NetworkSpec::default(),
            "eth0",
            dir.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cache { .. }));
    }

    #[tokio::test]
    async fn phase2_dhcp_sentinel_prevents_a_second_start() {
        let mut mock = MockNetHandler::new();
        mock.expect_start_dhcp()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let dir = tempfile::tempdir().unwrap();
        let vif = Vif {
            name: "eth0".into(),
            ip: Some(crate::model::Ipv4Cidr {
                addr: "10.0.2.2".parse().unwrap(),
                prefix: 24,
            }),
            ..Default::default()
        };
        let variant = Variant::Bridge(crate::variants::Bridge::new("eth0".into(), 0).unwrap());

        ensure_dhcp(&mock, &variant, &vif, "k6t-eth0", "eth0", dir.path())
            .await
            .unwrap();
        assert!(dhcp_sentinel_path(dir.path(), "eth0").is_file());

        // The sentinel now exists; a second call must not start DHCP again.
        ensure_dhcp(&mock, &variant, &vif, "k6t-eth0", "eth0", dir.path())
            .await
            .unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "DHCP failed for interface eth0")]
    async fn dhcp_failure_in_phase2_is_fatal() {
        let mut mock = MockNetHandler::new();
        mock.expect_start_dhcp()
            .returning(|_, _, _| Err(Error::Config("dnsmasq not found".into())));

        let dir = tempfile::tempdir().unwrap();
        let vif = Vif {
            name: "eth0".into(),
            ip: Some(crate::model::Ipv4Cidr {
                addr: "10.0.2.2".parse().unwrap(),
                prefix: 24,
            }),
            ..Default::default()
        };
        let variant = Variant::Bridge(crate::variants::Bridge::new("eth0".into(), 0).unwrap());

        ensure_dhcp(&mock, &variant, &vif, "k6t-eth0", "eth0", dir.path())
            .await
            .ok();
    }
}
