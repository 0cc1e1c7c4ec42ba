//! zbus proxies for org.freedesktop.systemd1
//!
//! Only the handful of manager calls and the one unit property the daemon
//! actually issues.

use zbus::proxy;
use zbus::zvariant::OwnedObjectPath;

/// One row of `ListUnits`: name, description, load state, active state,
/// sub state, follower, object path, job id, job type, job object path.
pub type UnitListEntry = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1",
    gen_blocking = false
)]
pub trait SystemdManager {
    /// Queue a start job. Returns the job object path.
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// Queue a stop job.
    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// Queue a restart job.
    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// Load a unit (whether or not it is running) and return its object
    /// path.
    fn load_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    /// Enumerate every unit currently in memory.
    fn list_units(&self) -> zbus::Result<Vec<UnitListEntry>>;
}

#[proxy(
    interface = "org.freedesktop.systemd1.Unit",
    default_service = "org.freedesktop.systemd1",
    assume_defaults = false,
    gen_blocking = false
)]
pub trait SystemdUnit {
    #[zbus(property)]
    fn active_state(&self) -> zbus::Result<String>;
}
