//! virtsyncd - keeps libvirt guests and systemd template units in sync
//!
//! A reconciliation daemon that:
//! - Mirrors domain lifecycle changes into `<prefix>@<domain>.service` units
//! - Mirrors unit start/stop/restart jobs back into domain commands
//! - Suppresses the feedback loops its own actions would otherwise cause
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  lifecycle/reboot   ┌────────────┐  start/stop/restart ┌─────────┐
//! │ libvirtd │ ──────────────────► │            │ ──────────────────► │ systemd │
//! │          │                     │ reconciler │                     │         │
//! │          │ ◄────────────────── │            │ ◄────────────────── │         │
//! └──────────┘  start/stop/restart └────────────┘  journal job records└─────────┘
//! ```
//!
//! Both directions pass through a rate-limited action log so that the
//! peer's notification of a change this daemon just made is dropped
//! instead of echoed back.

pub mod action_log;
pub mod hypervisor;
pub mod journal;
pub mod reconciler;
pub mod systemd;
pub mod unit_name;
