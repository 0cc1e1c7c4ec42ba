//! Job-event tailer
//!
//! Follows the systemd journal in JSON mode and extracts completed job
//! records for units under the template prefix. The journal is the one
//! reliable source for "a start/stop/restart actually went through": the
//! bus PropertiesChanged signal fires several times per job and cannot
//! distinguish a restart from an ordinary activation.
//!
//! The tail subprocess is supervised forever: when it dies or its stream
//! ends, the tailer sleeps briefly and reopens the journal asking for
//! entries back to that same delay so nothing is lost across the gap.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task;

use crate::hypervisor::DomainAction;
use crate::unit_name;

/// Delay before a dead tail subprocess is reopened, and the window of
/// entries asked for again on reopen.
pub const JOURNALCTL_RESTART_DELAY: Duration = Duration::from_secs(1);

/// A completed (or, for starts, queued) job on a template unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub domain: String,
    pub action: DomainAction,
}

/// The journal fields a job record is judged by. Everything else in the
/// record is ignored.
#[derive(Debug, Deserialize)]
struct JobRecord {
    #[serde(rename = "UNIT")]
    unit: Option<String>,
    #[serde(rename = "JOB_TYPE")]
    job_type: Option<String>,
    #[serde(rename = "JOB_RESULT")]
    job_result: Option<String>,
}

/// Follow-mode reader of the journal's job records.
pub struct JobTailer {
    prefix: String,
    program: String,
    args: Vec<String>,
}

impl JobTailer {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            program: "journalctl".to_string(),
            args: vec![
                "--follow".to_string(),
                "--output=json".to_string(),
                "--no-pager".to_string(),
            ],
        }
    }

    /// Tail an arbitrary command instead of journalctl. Tests feed canned
    /// records through this.
    pub fn with_command(prefix: &str, program: &str, args: &[&str]) -> Self {
        Self {
            prefix: prefix.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Run the supervised tail loop on its own task, forwarding accepted
    /// events into `tx` until the receiver goes away.
    pub fn spawn(self, tx: mpsc::UnboundedSender<JobEvent>) -> task::JoinHandle<()> {
        tokio::spawn(self.run(tx))
    }

    async fn run(self, tx: mpsc::UnboundedSender<JobEvent>) {
        let mut backfill = false;
        loop {
            match self.tail_once(&tx, backfill).await {
                Ok(()) => log::debug!("journal tail ended"),
                Err(e) => log::debug!("journal tail failed: {}", e),
            }
            backfill = true;
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(JOURNALCTL_RESTART_DELAY).await;
        }
        log::debug!("journal tailer stopped");
    }

    async fn tail_once(
        &self,
        tx: &mpsc::UnboundedSender<JobEvent>,
        backfill: bool,
    ) -> std::io::Result<()> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if backfill {
            command.arg(format!(
                "--since=-{}s",
                JOURNALCTL_RESTART_DELAY.as_secs()
            ));
        } else {
            command.arg("--lines=0");
        }
        command.stdout(Stdio::piped()).stderr(Stdio::null());
        command.kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "tail stdout not captured")
        })?;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(event) = parse_line(&line, &self.prefix) else {
                continue;
            };
            log::debug!("job event: {} for {}", event.action, event.domain);
            if tx.send(event).is_err() {
                return Ok(());
            }
        }
        let _ = child.wait().await;
        Ok(())
    }
}

fn parse_line(line: &str, prefix: &str) -> Option<JobEvent> {
    let record: JobRecord = serde_json::from_str(line).ok()?;
    accept(&record, prefix)
}

/// Acceptance filter for job records.
///
/// Starts are taken from the queue entry (no JOB_RESULT yet); stops and
/// restarts only once the job finished with "done". Everything outside the
/// template prefix is noise.
fn accept(record: &JobRecord, prefix: &str) -> Option<JobEvent> {
    let action = match (record.job_type.as_deref()?, record.job_result.as_deref()) {
        ("start", None) => DomainAction::Start,
        ("stop", Some("done")) => DomainAction::Stop,
        ("restart", Some("done")) => DomainAction::Restart,
        _ => return None,
    };
    let name = unit_name::parse(record.unit.as_deref()?)?;
    if name.prefix != prefix || name.suffix != "service" {
        return None;
    }
    Some(JobEvent {
        domain: name.instance,
        action,
    })
}
