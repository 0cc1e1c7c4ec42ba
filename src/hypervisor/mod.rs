//! Hypervisor domain manager
//!
//! The only part of the daemon that talks to libvirt. Keeps an in-memory
//! domain → status map, executes start/stop/restart requests from a FIFO
//! queue on a small blocking worker pool, and forwards domain lifecycle and
//! reboot events upward through a channel.

pub mod events;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task;
use virt::connect::Connect;
use virt::domain::Domain;

use crate::action_log::ActionLog;

/// Delay between status probes while waiting for a domain to reach its
/// target state.
pub const CHECK_DELAY: Duration = Duration::from_secs(1);

/// How long a start/stop may take before the action is considered failed.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Environment overrides for the two timing knobs, in whole seconds.
pub const CHECK_DELAY_ENV: &str = "WAIT_CHECK_DELAY";
pub const ACTION_TIMEOUT_ENV: &str = "WAIT_ACTION_SECONDS";

/// Upper bound on concurrently executing domain actions.
const MAX_WORKERS: usize = 5;

/// Two-state projection of libvirt's richer domain states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainStatus {
    Active,
    Inactive,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    fn from_active(active: bool) -> Self {
        if active {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// A lifecycle command for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainAction {
    Start,
    Stop,
    Restart,
}

impl DomainAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for DomainAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle transition reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Started,
    Stopped,
    /// Any other lifecycle code (defined, suspended, crashed, ...). The
    /// reconciler refreshes the cache for these but does not fan out.
    Other(i32),
}

/// Event delivered from the hypervisor event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    Lifecycle { domain: String, kind: LifecycleKind },
    Reboot { domain: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("failed to create domain: {domain}")]
    Create {
        domain: String,
        #[source]
        source: virt::error::Error,
    },

    #[error("failed to shutdown domain: {domain}")]
    Shutdown {
        domain: String,
        #[source]
        source: virt::error::Error,
    },

    #[error("domain {action} took longer than {timeout} seconds: {domain}")]
    Timeout {
        action: DomainAction,
        domain: String,
        timeout: u64,
    },

    #[error(transparent)]
    Virt(#[from] virt::error::Error),

    #[error("libvirt event loop: {0}")]
    Event(&'static str),

    #[error("failed to spawn event thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// libvirt connections are safe to share between threads; the wrapper type
/// holds a raw pointer and therefore does not advertise it.
struct VirtConnection(Connect);

unsafe impl Send for VirtConnection {}
unsafe impl Sync for VirtConnection {}

struct Shared {
    conn: VirtConnection,
    /// Serializes hypervisor calls; `reload_state` holds it for the whole
    /// enumeration so no action can interleave with a rebuild.
    op: Mutex<()>,
    cache: Mutex<HashMap<String, DomainStatus>>,
    /// Internal echo guard: queued actions repeated within the threshold are
    /// dropped by the dispatcher.
    actions: ActionLog,
    workers: Arc<Semaphore>,
    check_delay: Duration,
    timeout: Duration,
}

/// Handle to the hypervisor side of the daemon.
pub struct DomainManager {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<(DomainAction, String)>,
    dispatcher: task::JoinHandle<()>,
    event_loop: std::thread::JoinHandle<()>,
    callback_ids: Vec<std::ffi::c_int>,
}

impl DomainManager {
    /// Open the hypervisor connection, build the initial domain-status map,
    /// and spawn the event loop, dispatcher, and callbacks.
    ///
    /// `uri = None` uses the libvirt client default, which honours
    /// `LIBVIRT_DEFAULT_URI`.
    pub async fn connect(
        uri: Option<String>,
        event_tx: mpsc::UnboundedSender<DomainEvent>,
    ) -> Result<Self, DomainError> {
        let (shared, callback_ids) = task::spawn_blocking(move || {
            // The default event implementation must be registered before the
            // connection is opened for callbacks to be delivered at all.
            events::register_default_impl()?;
            let conn = Connect::open(uri.as_deref())?;
            let shared = Arc::new(Shared {
                conn: VirtConnection(conn),
                op: Mutex::new(()),
                cache: Mutex::new(HashMap::new()),
                actions: ActionLog::default(),
                workers: Arc::new(Semaphore::new(MAX_WORKERS)),
                check_delay: duration_from_env(CHECK_DELAY_ENV, CHECK_DELAY),
                timeout: duration_from_env(ACTION_TIMEOUT_ENV, ACTION_TIMEOUT),
            });
            shared.reload_blocking()?;
            let ids = events::register(&shared.conn.0, &event_tx)?;
            Ok::<_, DomainError>((shared, ids))
        })
        .await??;

        let event_loop = std::thread::Builder::new()
            .name("libvirt-events".to_string())
            .spawn(|| loop {
                if let Err(e) = events::run_default_impl() {
                    log::error!("libvirt event loop iteration failed: {}", e);
                    std::thread::sleep(CHECK_DELAY);
                }
            })?;

        let (queue, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), rx));

        Ok(Self {
            shared,
            queue,
            dispatcher,
            event_loop,
            callback_ids,
        })
    }

    /// Snapshot of the domain → status map.
    pub async fn state(&self) -> HashMap<String, DomainStatus> {
        self.shared.cache.lock().await.clone()
    }

    /// Throw away the cached map and rebuild it from a full enumeration of
    /// all domains, including inactive ones.
    pub async fn reload_state(&self) -> Result<(), DomainError> {
        let shared = Arc::clone(&self.shared);
        task::spawn_blocking(move || shared.reload_blocking()).await?
    }

    /// Probe one domain right now and update its cache entry. The entry is
    /// removed when the domain no longer exists.
    pub async fn refresh(&self, domain: &str) -> Result<DomainStatus, DomainError> {
        let shared = Arc::clone(&self.shared);
        let name = domain.to_string();
        task::spawn_blocking(move || {
            let _op = shared.op.blocking_lock();
            match Domain::lookup_by_name(&shared.conn.0, &name) {
                Ok(dom) => shared.probe(&dom, &name),
                Err(e) => {
                    shared.cache.blocking_lock().remove(&name);
                    Err(e.into())
                }
            }
        })
        .await?
    }

    pub fn start(&self, domain: &str) {
        self.enqueue(DomainAction::Start, domain);
    }

    pub fn stop(&self, domain: &str) {
        self.enqueue(DomainAction::Stop, domain);
    }

    pub fn restart(&self, domain: &str) {
        self.enqueue(DomainAction::Restart, domain);
    }

    fn enqueue(&self, action: DomainAction, domain: &str) {
        log::debug!("queueing domain {}: {}", action, domain);
        if self.queue.send((action, domain.to_string())).is_err() {
            log::error!("action dispatcher is gone, dropping {} for {}", action, domain);
        }
    }

    /// True while the event thread, the dispatcher, and the hypervisor
    /// connection are all alive.
    pub async fn healthy(&self) -> bool {
        if self.event_loop.is_finished() || self.dispatcher.is_finished() {
            return false;
        }
        let shared = Arc::clone(&self.shared);
        task::spawn_blocking(move || shared.conn.0.is_alive().unwrap_or(false))
            .await
            .unwrap_or(false)
    }

    /// Stop accepting work, drain the queue, wait for in-flight actions,
    /// and tear down the event callbacks. The connection closes when the
    /// last reference to it drops.
    pub async fn shutdown(self) {
        drop(self.queue);
        let _ = self.dispatcher.await;
        let _ = self.shared.workers.acquire_many(MAX_WORKERS as u32).await;
        let shared = Arc::clone(&self.shared);
        let ids = self.callback_ids;
        let _ = task::spawn_blocking(move || events::deregister(&shared.conn.0, &ids)).await;
        log::debug!("domain manager stopped");
    }
}

impl Shared {
    fn reload_blocking(&self) -> Result<(), DomainError> {
        let _op = self.op.blocking_lock();
        let mut cache = self.cache.blocking_lock();
        cache.clear();
        for dom in self.conn.0.list_all_domains(0)? {
            let name = dom.get_name()?;
            let status = DomainStatus::from_active(dom.is_active()?);
            cache.insert(name, status);
        }
        log::info!("domain state reloaded: {} domains", cache.len());
        Ok(())
    }

    /// Ask the hypervisor for the domain's current status and mirror it
    /// into the cache.
    fn probe(&self, dom: &Domain, name: &str) -> Result<DomainStatus, DomainError> {
        let status = DomainStatus::from_active(dom.is_active()?);
        self.cache.blocking_lock().insert(name.to_string(), status);
        Ok(status)
    }
}

/// Pop queued actions one at a time and hand them to the worker pool.
async fn dispatch(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<(DomainAction, String)>,
) {
    while let Some((action, domain)) = rx.recv().await {
        if shared.actions.violated(&domain) {
            log::debug!("dropping {} for {}: repeated within threshold", action, domain);
            continue;
        }
        let permit = match Arc::clone(&shared.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let shared = Arc::clone(&shared);
        task::spawn_blocking(move || {
            let _permit = permit;
            if let Err(e) = run_action(&shared, action, &domain) {
                log::error!("domain action failed: {}", e);
            }
        });
    }
    log::debug!("action dispatcher stopped");
}

fn run_action(shared: &Shared, action: DomainAction, domain: &str) -> Result<(), DomainError> {
    log::info!("executing domain {}: {}", action, domain);
    match action {
        DomainAction::Start => wait_for_status(shared, domain, DomainStatus::Active, action),
        DomainAction::Stop => wait_for_status(shared, domain, DomainStatus::Inactive, action),
        DomainAction::Restart => {
            wait_for_status(shared, domain, DomainStatus::Inactive, action)?;
            wait_for_status(shared, domain, DomainStatus::Active, action)
        }
    }
}

/// Drive one domain to `target` and wait until it gets there.
///
/// The shutdown request is re-sent on every poll tick: a guest that is still
/// booting may not be ready to accept the ACPI request when first asked.
fn wait_for_status(
    shared: &Shared,
    domain: &str,
    target: DomainStatus,
    action: DomainAction,
) -> Result<(), DomainError> {
    let reissue = target == DomainStatus::Inactive;
    let deadline = Instant::now() + shared.timeout;
    let mut issued = false;
    loop {
        {
            let _op = shared.op.blocking_lock();
            let dom = Domain::lookup_by_name(&shared.conn.0, domain)?;
            if shared.probe(&dom, domain)? == target {
                return Ok(());
            }
            if !issued || reissue {
                match target {
                    DomainStatus::Active => {
                        dom.create().map_err(|source| DomainError::Create {
                            domain: domain.to_string(),
                            source,
                        })?;
                    }
                    DomainStatus::Inactive => {
                        dom.shutdown().map_err(|source| DomainError::Shutdown {
                            domain: domain.to_string(),
                            source,
                        })?;
                    }
                }
                issued = true;
            }
        }
        if Instant::now() >= deadline {
            return Err(DomainError::Timeout {
                action,
                domain: domain.to_string(),
                timeout: shared.timeout.as_secs(),
            });
        }
        std::thread::sleep(shared.check_delay);
    }
}

fn duration_from_env(var: &str, default: Duration) -> Duration {
    match std::env::var(var) {
        Ok(value) => match value.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                log::warn!("ignoring invalid {}={:?}", var, value);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_active() {
        assert_eq!(DomainStatus::from_active(true), DomainStatus::Active);
        assert_eq!(DomainStatus::from_active(false), DomainStatus::Inactive);
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(DomainStatus::Active.as_str(), "active");
        assert_eq!(DomainStatus::Inactive.as_str(), "inactive");
    }

    #[test]
    fn test_action_display() {
        assert_eq!(DomainAction::Start.to_string(), "start");
        assert_eq!(DomainAction::Stop.to_string(), "stop");
        assert_eq!(DomainAction::Restart.to_string(), "restart");
    }

    #[test]
    fn test_duration_from_env_default() {
        assert_eq!(
            duration_from_env("VIRTSYNCD_TEST_UNSET_VAR", CHECK_DELAY),
            CHECK_DELAY
        );
    }
}
