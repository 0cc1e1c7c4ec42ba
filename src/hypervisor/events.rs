//! libvirt event-loop plumbing
//!
//! The safe `virt` wrapper does not cover the domain-event callback API, so
//! this module talks to `virt::sys` directly and forwards every callback
//! into a channel. All unsafe code in the crate lives here.
//!
//! Callback registrations carry a boxed channel sender as their opaque
//! pointer; libvirt invokes the free callback when a registration is
//! removed, which drops the box.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr;

use tokio::sync::mpsc;
use virt::connect::Connect;
use virt::sys;

use super::{DomainError, DomainEvent, LifecycleKind};

type EventSender = mpsc::UnboundedSender<DomainEvent>;

/// Install libvirt's default event implementation. Must run before the
/// connection is opened.
pub(super) fn register_default_impl() -> Result<(), DomainError> {
    let rc = unsafe { sys::virEventRegisterDefaultImpl() };
    if rc < 0 {
        return Err(DomainError::Event(
            "failed to register the default event implementation",
        ));
    }
    Ok(())
}

/// Run one iteration of the default event loop, blocking until there is
/// something to dispatch.
pub(super) fn run_default_impl() -> Result<(), DomainError> {
    let rc = unsafe { sys::virEventRunDefaultImpl() };
    if rc < 0 {
        return Err(DomainError::Event("event loop iteration failed"));
    }
    Ok(())
}

/// Register lifecycle and reboot callbacks for all domains on the
/// connection. Returns the callback ids for later deregistration.
pub(super) fn register(
    conn: &Connect,
    events: &EventSender,
) -> Result<Vec<c_int>, DomainError> {
    let mut ids = Vec::with_capacity(2);
    ids.push(register_one(
        conn,
        events,
        sys::VIR_DOMAIN_EVENT_ID_LIFECYCLE as c_int,
        lifecycle_callback(),
    )?);
    match register_one(
        conn,
        events,
        sys::VIR_DOMAIN_EVENT_ID_REBOOT as c_int,
        reboot_callback(),
    ) {
        Ok(id) => ids.push(id),
        Err(e) => {
            deregister(conn, &ids);
            return Err(e);
        }
    }
    Ok(ids)
}

pub(super) fn deregister(conn: &Connect, ids: &[c_int]) {
    for id in ids {
        let rc = unsafe { sys::virConnectDomainEventDeregisterAny(conn.as_ptr(), *id) };
        if rc < 0 {
            log::debug!("failed to deregister event callback {}", id);
        }
    }
}

fn register_one(
    conn: &Connect,
    events: &EventSender,
    event_id: c_int,
    callback: sys::virConnectDomainEventGenericCallback,
) -> Result<c_int, DomainError> {
    let opaque = Box::into_raw(Box::new(events.clone()));
    let id = unsafe {
        sys::virConnectDomainEventRegisterAny(
            conn.as_ptr(),
            ptr::null_mut(),
            event_id,
            callback,
            opaque as *mut c_void,
            Some(drop_sender),
        )
    };
    if id < 0 {
        // The free callback only runs for successful registrations.
        unsafe { drop(Box::from_raw(opaque)) };
        return Err(DomainError::Event("failed to register domain event callback"));
    }
    Ok(id)
}

/// The register-any call takes every callback as the generic type and casts
/// it back on the C side based on the event id, exactly what the
/// `VIR_DOMAIN_EVENT_CALLBACK()` macro does in C.
fn lifecycle_callback() -> sys::virConnectDomainEventGenericCallback {
    unsafe {
        std::mem::transmute::<
            unsafe extern "C" fn(
                sys::virConnectPtr,
                sys::virDomainPtr,
                c_int,
                c_int,
                *mut c_void,
            ) -> c_int,
            sys::virConnectDomainEventGenericCallback,
        >(on_lifecycle)
    }
}

fn reboot_callback() -> sys::virConnectDomainEventGenericCallback {
    Some(on_reboot)
}

unsafe extern "C" fn on_lifecycle(
    _conn: sys::virConnectPtr,
    dom: sys::virDomainPtr,
    event: c_int,
    _detail: c_int,
    opaque: *mut c_void,
) -> c_int {
    if let Some(domain) = domain_name(dom) {
        let kind = match event as u32 {
            sys::VIR_DOMAIN_EVENT_STARTED => LifecycleKind::Started,
            sys::VIR_DOMAIN_EVENT_STOPPED => LifecycleKind::Stopped,
            other => LifecycleKind::Other(other as i32),
        };
        let events = &*(opaque as *const EventSender);
        let _ = events.send(DomainEvent::Lifecycle { domain, kind });
    }
    0
}

unsafe extern "C" fn on_reboot(
    _conn: sys::virConnectPtr,
    dom: sys::virDomainPtr,
    opaque: *mut c_void,
) {
    if let Some(domain) = domain_name(dom) {
        let events = &*(opaque as *const EventSender);
        let _ = events.send(DomainEvent::Reboot { domain });
    }
}

unsafe extern "C" fn drop_sender(opaque: *mut c_void) {
    drop(Box::from_raw(opaque as *mut EventSender));
}

/// Name of the domain a callback fired for. The string is owned by the
/// domain object and must be copied, never freed.
unsafe fn domain_name(dom: sys::virDomainPtr) -> Option<String> {
    let name: *const c_char = sys::virDomainGetName(dom);
    if name.is_null() {
        return None;
    }
    Some(CStr::from_ptr(name).to_string_lossy().into_owned())
}
