//! Live-host integration tests
//!
//! These need a running libvirtd and systemd on the test machine, so they
//! are ignored by default:
//!
//!   cargo test --test live_host -- --ignored
//!
//! They use a scratch template prefix so the initial-state sync has no real
//! units to touch.

use std::process::Command;

use virtsyncd::reconciler::{Config, Reconciler};
use virtsyncd::systemd::{UnitActiveState, UnitManager};

const SCRATCH_PREFIX: &str = "virtsyncd-test";

fn libvirt_available() -> bool {
    Command::new("virsh")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn systemd_available() -> bool {
    Command::new("systemctl")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
#[ignore] // Requires libvirtd and the system bus
async fn test_bootstrap_and_health() {
    if !libvirt_available() || !systemd_available() {
        eprintln!("libvirt or systemd not available, skipping test");
        return;
    }

    let config = Config {
        template_prefix: SCRATCH_PREFIX.to_string(),
        connect_uri: None,
    };
    let reconciler = Reconciler::start(config)
        .await
        .expect("daemon failed to bootstrap");

    reconciler.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires the system bus
async fn test_unit_active_state_query() {
    if !systemd_available() {
        eprintln!("systemd not available, skipping test");
        return;
    }

    let units = UnitManager::connect(SCRATCH_PREFIX)
        .await
        .expect("failed to connect to the system bus");

    // dbus.service exists on any systemd host reachable over the bus.
    let state = units
        .active_state("dbus.service")
        .await
        .expect("ActiveState query failed");
    assert_eq!(state, UnitActiveState::Active);
}
