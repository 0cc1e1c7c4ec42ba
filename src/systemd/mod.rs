//! Service unit manager
//!
//! The only part of the daemon that talks to the systemd message bus.
//! Translates domain names to template unit names, commands units, reads
//! their active state, and reconciles the whole template namespace to an
//! authoritative domain-status map at startup.

pub mod proxy;

use std::collections::HashMap;

use zbus::Connection;

use crate::hypervisor::DomainStatus;
use crate::unit_name;
use proxy::{SystemdManagerProxy, SystemdUnitProxy};

/// Job mode for every unit command: a conflicting queued job makes the new
/// job fail instead of replacing the in-flight one.
pub const JOB_MODE_FAIL: &str = "fail";

/// systemd's ActiveState values, with the transient ones kept distinct so
/// callers can tell "not active yet" from "down".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitActiveState {
    Active,
    Activating,
    Inactive,
    Deactivating,
    Failed,
    Other,
}

impl UnitActiveState {
    pub fn from_bus(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "activating" => Self::Activating,
            "inactive" => Self::Inactive,
            "deactivating" => Self::Deactivating,
            "failed" => Self::Failed,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("bus call failed: {0}")]
    Bus(#[from] zbus::Error),
}

/// Handle to the init-system side of the daemon.
pub struct UnitManager {
    conn: Connection,
    manager: SystemdManagerProxy<'static>,
    prefix: String,
}

impl UnitManager {
    /// Connect to the system bus.
    pub async fn connect(prefix: &str) -> Result<Self, UnitError> {
        let conn = Connection::system().await?;
        let manager = SystemdManagerProxy::new(&conn).await?;
        Ok(Self {
            conn,
            manager,
            prefix: prefix.to_string(),
        })
    }

    /// Unit name for a domain under the template prefix.
    pub fn unit_for(&self, domain: &str) -> String {
        unit_name::compose(&self.prefix, domain)
    }

    /// Current ActiveState of a unit, loading it if necessary.
    pub async fn active_state(&self, unit: &str) -> Result<UnitActiveState, UnitError> {
        let path = self.manager.load_unit(unit).await?;
        let unit_proxy = SystemdUnitProxy::builder(&self.conn)
            .path(path)?
            .build()
            .await?;
        Ok(UnitActiveState::from_bus(&unit_proxy.active_state().await?))
    }

    /// Start the unit for a domain. No-op when it is already active.
    pub async fn start(&self, domain: &str) -> Result<(), UnitError> {
        let unit = self.unit_for(domain);
        if self.active_state(&unit).await? == UnitActiveState::Active {
            log::debug!("unit {} is already active", unit);
            return Ok(());
        }
        self.manager.start_unit(&unit, JOB_MODE_FAIL).await?;
        log::info!("start queued for unit {}", unit);
        Ok(())
    }

    /// Stop the unit for a domain. No-op when it is already inactive.
    pub async fn stop(&self, domain: &str) -> Result<(), UnitError> {
        let unit = self.unit_for(domain);
        if self.active_state(&unit).await? == UnitActiveState::Inactive {
            log::debug!("unit {} is already inactive", unit);
            return Ok(());
        }
        self.manager.stop_unit(&unit, JOB_MODE_FAIL).await?;
        log::info!("stop queued for unit {}", unit);
        Ok(())
    }

    /// Restart the unit for a domain, unconditionally.
    pub async fn restart(&self, domain: &str) -> Result<(), UnitError> {
        let unit = self.unit_for(domain);
        self.manager.restart_unit(&unit, JOB_MODE_FAIL).await?;
        log::info!("restart queued for unit {}", unit);
        Ok(())
    }

    /// Drive every template unit to agree with the authoritative domain
    /// map: units for known domains are started or stopped to match, units
    /// under the prefix without a backing domain are stopped.
    ///
    /// Per-unit command failures (for instance a guest without an installed
    /// unit file) are logged and skipped; only bus-level failures abort.
    pub async fn set_initial_state(
        &self,
        domains: &HashMap<String, DomainStatus>,
    ) -> Result<(), UnitError> {
        for (domain, status) in domains {
            let outcome = match status {
                DomainStatus::Active => self.start(domain).await,
                DomainStatus::Inactive => self.stop(domain).await,
            };
            if let Err(e) = outcome {
                log::error!("failed to align unit for domain {}: {}", domain, e);
            }
        }

        for entry in self.manager.list_units().await? {
            let (unit, _description, _load, active, ..) = entry;
            let Some(name) = unit_name::parse(&unit) else {
                continue;
            };
            if name.prefix != self.prefix || name.suffix != "service" {
                continue;
            }
            if domains.contains_key(&name.instance) {
                continue;
            }
            if UnitActiveState::from_bus(&active) == UnitActiveState::Inactive {
                continue;
            }
            log::warn!("stopping unit without a backing domain: {}", unit);
            if let Err(e) = self.manager.stop_unit(&unit, JOB_MODE_FAIL).await {
                log::error!("failed to stop {}: {}", unit, e);
            }
        }
        Ok(())
    }
}
