//! Bidirectional reconciliation
//!
//! Owns one domain manager, one unit manager, and one journal tailer, and
//! cross-drives the two control planes: hypervisor lifecycle events become
//! unit commands, completed unit jobs become domain commands. Each
//! direction has its own echo guard: the lifecycle-side action log here
//! keeps a reboot caused by an operator's unit restart from restarting the
//! unit again, and the domain manager's internal log drops job-sourced
//! actions that repeat its own recent activity.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::action_log::ActionLog;
use crate::hypervisor::{
    DomainAction, DomainError, DomainEvent, DomainManager, LifecycleKind,
};
use crate::journal::{JobEvent, JobTailer};
use crate::systemd::{UnitError, UnitManager};

/// Default stem of the per-guest template units.
pub const DEFAULT_TEMPLATE_PREFIX: &str = "libvirt-guest";

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stem of the per-guest template units (`<prefix>@<domain>.service`).
    pub template_prefix: String,
    /// Hypervisor connection URI; `None` means the libvirt client default.
    pub connect_uri: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error("component died: {0}")]
    Unhealthy(&'static str),
}

/// Unit-side reaction to one hypervisor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitReaction {
    Start,
    Stop,
    Restart,
    None,
}

/// Decide how a hypervisor event fans out to the init system, updating the
/// lifecycle-side action log along the way.
///
/// Started/Stopped always fan out and are recorded. A reboot fans out only
/// when the log holds no recent activity for the domain: the reboot an
/// operator's own unit restart causes must not restart the unit again.
fn unit_reaction(jet_log: &ActionLog, event: &DomainEvent) -> UnitReaction {
    match event {
        DomainEvent::Lifecycle { domain, kind } => match kind {
            LifecycleKind::Started => {
                jet_log.record(domain);
                UnitReaction::Start
            }
            LifecycleKind::Stopped => {
                jet_log.record(domain);
                UnitReaction::Stop
            }
            LifecycleKind::Other(_) => UnitReaction::None,
        },
        DomainEvent::Reboot { domain } => {
            if jet_log.violated(domain) {
                UnitReaction::None
            } else {
                UnitReaction::Restart
            }
        }
    }
}

/// Hypervisor-side action for one unit job event.
///
/// This direction has no reconciler-level gate and never touches the
/// lifecycle-side log: echo suppression lives in the domain manager's
/// internal action log, checked when the action is popped from its queue.
fn domain_reaction(event: &JobEvent) -> DomainAction {
    event.action
}

/// The top-level daemon object.
pub struct Reconciler {
    domains: DomainManager,
    units: UnitManager,
    /// Echo guard for the hypervisor → init-system direction, written on
    /// every lifecycle callback and consulted on reboot fan-out. Job events
    /// never touch it; their suppression is the domain manager's own log.
    jet_log: ActionLog,
    domain_events: mpsc::UnboundedReceiver<DomainEvent>,
    job_events: mpsc::UnboundedReceiver<JobEvent>,
    tailer: tokio::task::JoinHandle<()>,
}

impl Reconciler {
    /// Bring up both control-plane connections, align every template unit
    /// with the hypervisor's current view, and start the event sources.
    /// Any failure here aborts startup.
    pub async fn start(config: Config) -> Result<Self, ReconcileError> {
        let (event_tx, domain_events) = mpsc::unbounded_channel();
        let domains = DomainManager::connect(config.connect_uri.clone(), event_tx).await?;

        let units = UnitManager::connect(&config.template_prefix).await?;
        units.set_initial_state(&domains.state().await).await?;

        let (job_tx, job_events) = mpsc::unbounded_channel();
        let tailer = JobTailer::new(&config.template_prefix).spawn(job_tx);

        log::info!(
            "reconciling domains against template {}@",
            config.template_prefix
        );
        Ok(Self {
            domains,
            units,
            jet_log: ActionLog::default(),
            domain_events,
            job_events,
            tailer,
        })
    }

    /// Steady-state loop. Returns only when a supervised component died or
    /// the hypervisor connection was lost.
    pub async fn run(&mut self) -> Result<(), ReconcileError> {
        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                Some(event) = self.domain_events.recv() => self.on_domain_event(event).await,
                Some(event) = self.job_events.recv() => self.on_job_event(event),
                _ = health.tick() => {
                    if !self.domains.healthy().await {
                        return Err(ReconcileError::Unhealthy("hypervisor manager"));
                    }
                    if self.tailer.is_finished() {
                        return Err(ReconcileError::Unhealthy("journal tailer"));
                    }
                }
            }
        }
    }

    /// Hypervisor → init-system direction.
    async fn on_domain_event(&self, event: DomainEvent) {
        let domain = match &event {
            DomainEvent::Lifecycle { domain, .. } => domain.clone(),
            DomainEvent::Reboot { domain } => domain.clone(),
        };
        self.refresh(&domain).await;
        match unit_reaction(&self.jet_log, &event) {
            UnitReaction::Start => {
                if let Err(e) = self.units.start(&domain).await {
                    log::error!("failed to start unit for {}: {}", domain, e);
                }
            }
            UnitReaction::Stop => {
                if let Err(e) = self.units.stop(&domain).await {
                    log::error!("failed to stop unit for {}: {}", domain, e);
                }
            }
            UnitReaction::Restart => {
                if let Err(e) = self.units.restart(&domain).await {
                    log::error!("failed to restart unit for {}: {}", domain, e);
                }
            }
            UnitReaction::None => {
                log::debug!("no unit fan-out for {}: {:?}", domain, event);
            }
        }
    }

    /// Init-system → hypervisor direction. Every job event is dispatched;
    /// echoes of the domain manager's own recent actions are dropped by its
    /// internal action log when they are popped from the queue.
    fn on_job_event(&self, event: JobEvent) {
        match domain_reaction(&event) {
            DomainAction::Start => self.domains.start(&event.domain),
            DomainAction::Stop => self.domains.stop(&event.domain),
            DomainAction::Restart => self.domains.restart(&event.domain),
        }
    }

    async fn refresh(&self, domain: &str) {
        if let Err(e) = self.domains.refresh(domain).await {
            log::debug!("status refresh failed for {}: {}", domain, e);
        }
    }

    /// Stop the event sources, drain queued domain actions, and wait for
    /// in-flight workers before returning.
    pub async fn shutdown(self) {
        self.tailer.abort();
        self.domains.shutdown().await;
        log::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn quick_log() -> ActionLog {
        ActionLog::new(Duration::from_millis(50), Duration::from_millis(500))
    }

    fn started(domain: &str) -> DomainEvent {
        DomainEvent::Lifecycle {
            domain: domain.to_string(),
            kind: LifecycleKind::Started,
        }
    }

    fn stopped(domain: &str) -> DomainEvent {
        DomainEvent::Lifecycle {
            domain: domain.to_string(),
            kind: LifecycleKind::Stopped,
        }
    }

    fn reboot(domain: &str) -> DomainEvent {
        DomainEvent::Reboot {
            domain: domain.to_string(),
        }
    }

    #[test]
    fn test_lifecycle_events_fan_out() {
        let log = quick_log();
        assert_eq!(unit_reaction(&log, &started("alpha")), UnitReaction::Start);
        assert_eq!(unit_reaction(&log, &stopped("bravo")), UnitReaction::Stop);
    }

    #[test]
    fn test_other_lifecycle_codes_do_not_fan_out() {
        let log = quick_log();
        let event = DomainEvent::Lifecycle {
            domain: "alpha".to_string(),
            kind: LifecycleKind::Other(3),
        };
        assert_eq!(unit_reaction(&log, &event), UnitReaction::None);
        // Not recorded either, so a reboot right after still fans out.
        assert_eq!(unit_reaction(&log, &reboot("alpha")), UnitReaction::Restart);
    }

    #[test]
    fn test_reboot_without_recent_lifecycle_restarts_unit() {
        let log = quick_log();
        assert_eq!(unit_reaction(&log, &reboot("charlie")), UnitReaction::Restart);
    }

    #[test]
    fn test_reboot_suppressed_after_lifecycle_event() {
        let log = quick_log();
        assert_eq!(unit_reaction(&log, &stopped("charlie")), UnitReaction::Stop);
        assert_eq!(unit_reaction(&log, &reboot("charlie")), UnitReaction::None);
    }

    #[test]
    fn test_reboot_suppression_expires_with_threshold() {
        let log = quick_log();
        assert_eq!(unit_reaction(&log, &started("charlie")), UnitReaction::Start);
        sleep(Duration::from_millis(70));
        assert_eq!(unit_reaction(&log, &reboot("charlie")), UnitReaction::Restart);
    }

    #[test]
    fn test_reboot_suppression_is_per_domain() {
        let log = quick_log();
        assert_eq!(unit_reaction(&log, &started("alpha")), UnitReaction::Start);
        assert_eq!(unit_reaction(&log, &reboot("bravo")), UnitReaction::Restart);
    }

    #[test]
    fn test_rapid_job_events_are_both_dispatched() {
        // Two independent operator jobs in quick succession: stop, then
        // start a moment later. Both map to their own domain action.
        let stop = JobEvent {
            domain: "alpha".to_string(),
            action: DomainAction::Stop,
        };
        let start = JobEvent {
            domain: "alpha".to_string(),
            action: DomainAction::Start,
        };
        assert_eq!(domain_reaction(&stop), DomainAction::Stop);
        assert_eq!(domain_reaction(&start), DomainAction::Start);
    }

    #[test]
    fn test_job_events_never_touch_the_lifecycle_log() {
        let log = quick_log();
        let job = JobEvent {
            domain: "alpha".to_string(),
            action: DomainAction::Restart,
        };
        assert_eq!(domain_reaction(&job), DomainAction::Restart);
        // No trace was left, so a genuine reboot right after a job event
        // still fans out to the unit.
        assert!(log.last("alpha").is_none());
        assert_eq!(unit_reaction(&log, &reboot("alpha")), UnitReaction::Restart);
    }
}
