//! End-to-end exercises of the two-phase protocol through the public API,
//! using a mocked kernel/firewall surface so no real netlink access is
//! required.

use podnet_core::cache::CacheStore;
use podnet_core::domain::{Domain, DomainDeviceInterface};
use podnet_core::handler::MockNetHandler;
use podnet_core::model::{DomainInterface, Ipv4Cidr, Mac, Route};
use podnet_core::orchestrator::{plug_phase1, plug_phase2};
use podnet_core::spec::{BindingVariant, InterfaceSpec, NetworkSpec, VmiSpec};

fn bridge_iface() -> InterfaceSpec {
    InterfaceSpec {
        name: "eth0".into(),
        model: None,
        mac: None,
        binding: BindingVariant::Bridge,
        ports: vec![],
        network_interface_multi_queue: false,
    }
}

fn default_route(gw: &str) -> Route {
    Route {
        destination: Ipv4Cidr {
            addr: "0.0.0.0".parse().unwrap(),
            prefix: 0,
        },
        gateway: gw.parse().unwrap(),
    }
}

fn full_bridge_mock() -> MockNetHandler {
    let mut mock = MockNetHandler::new();
    mock.expect_addr_list().returning(|_| {
        Ok(vec![Ipv4Cidr {
            addr: "10.244.0.7".parse().unwrap(),
            prefix: 24,
        }])
    });
    mock.expect_addr_list_v6().returning(|_| Ok(vec![]));
    mock.expect_is_ipv4_primary().returning(|| true);
    mock.expect_get_mac()
        .returning(|_| Ok(Mac([0xaa, 0xbb, 0xcc, 0, 0, 1])));
    mock.expect_get_link_mtu().returning(|_| Ok(1450));
    mock.expect_route_list()
        .returning(|_| Ok(vec![default_route("10.244.0.1")]));
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
    mock
}

#[tokio::test]
async fn bridge_interface_survives_both_phases() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mock = full_bridge_mock();
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheStore::new(dir.path());
    let iface = bridge_iface();
    let vmi = VmiSpec {
        name: "vm1".into(),
        interfaces: vec![iface.clone()],
        vcpu_count: 1,
    };

    plug_phase1(
        &mock,
        &cache,
        &vmi,
        &iface,
        &NetworkSpec::default(),
        "pod-uid-1",
        "999",
    )
    .await
    .unwrap();

    assert!(cache.interface_exists("999", "eth0"));
    let stored = cache.load_interface("999", "eth0").unwrap().unwrap();
    assert_eq!(stored.mac, Mac([0xaa, 0xbb, 0xcc, 0, 0, 1]));
    assert_eq!(stored.target.device, "tap0");

    // Phase 2 runs against the launcher's own cache root, keyed by "self"
    // rather than the launcher PID — simulate that by re-rooting a second
    // `CacheStore` at the same files but resolving through "self" directly.
    std::fs::rename(dir.path().join("999"), dir.path().join("self")).unwrap();

    let mut domain = Domain {
        interfaces: vec![DomainDeviceInterface {
            alias: "eth0".into(),
            interface: DomainInterface::default(),
        }],
        qemu_args: vec![],
    };

    let dhcp_mock = full_bridge_mock();
    let mut dhcp_mock = dhcp_mock;
    dhcp_mock
        .expect_start_dhcp()
        .times(1)
        .returning(|_, _, _| Ok(()));

    let sentinel_dir = tempfile::tempdir().unwrap();
    plug_phase2(
        &dhcp_mock,
        &cache,
        &mut domain,
        &vmi,
        &iface,
        &NetworkSpec::default(),
        "eth0",
        sentinel_dir.path(),
    )
    .await
    .unwrap();

    let entry = domain.interface_mut("eth0").unwrap();
    assert_eq!(entry.interface.mac, Mac([0xaa, 0xbb, 0xcc, 0, 0, 1]));
    assert_eq!(entry.interface.target.device, "tap0");
    assert!(sentinel_dir.path().join("dhcp_started-eth0").is_file());
}

#[tokio::test]
async fn sriov_interface_skips_both_phases_entirely() {
    let mock = MockNetHandler::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheStore::new(dir.path());
    let iface = InterfaceSpec {
        binding: BindingVariant::Sriov,
        ..bridge_iface()
    };
    let vmi = VmiSpec {
        name: "vm1".into(),
        interfaces: vec![iface.clone()],
        vcpu_count: 1,
    };

    plug_phase1(
        &mock,
        &cache,
        &vmi,
        &iface,
        &NetworkSpec::default(),
        "pod-uid-1",
        "999",
    )
    .await
    .unwrap();
    assert!(!cache.interface_exists("999", "eth0"));

    let mut domain = Domain::default();
    let sentinel_dir = tempfile::tempdir().unwrap();
    plug_phase2(
        &mock,
        &cache,
        &mut domain,
        &vmi,
        &iface,
        &NetworkSpec::default(),
        "eth0",
        sentinel_dir.path(),
    )
    .await
    .unwrap();
}
