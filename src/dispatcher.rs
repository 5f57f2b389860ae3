//! Admission and dispatch (design component C10).
//!
//! Runs the fixed-order admission procedure against one arrived
//! connection, then hands accepted connections off to a builtin, an
//! external server, or the redirect proxy. Grounded on
//! `libinetd/inetd.cpp`'s `accept_connection`/`child_process` pipeline,
//! re-ordered to the sequence the design settled on (loop protection, IP
//! ACL, GeoIP ACL, CPM, time-window, starts-window, per-source admission,
//! max-child).

use std::net::IpAddr;
use std::time::Instant;

use crate::config::model::Handler;
use crate::error::{DenyBy, InetdError, LimitKind};
use crate::limiter::CpmVerdict;
use crate::registry::{Snapshot, ServiceRuntime};
use crate::tables::AdmitError;

fn minute_of_day(now: Instant) -> u16 {
    // `Instant` carries no wall-clock epoch; callers needing real
    // time-of-day pass it in via `chrono` at the call site. Tests drive
    // this function through `access_times.allowed_at` directly instead.
    let _ = now;
    let wall = chrono::Local::now();
    use chrono::Timelike;
    (wall.hour() * 60 + wall.minute()) as u16
}

/// Outcome of the admission procedure for one arrival.
pub enum Verdict {
    Admit,
    Deny(InetdError),
}

/// Run every admission check in order, short-circuiting on the first
/// denial. Does not mutate `starts`/`limiter` beyond what each check
/// itself records (the CPM limiter and starts-window counters are
/// stateful by design: calling this twice for the same arrival double
/// counts it).
pub fn admit(runtime: &ServiceRuntime, remote: IpAddr, now: Instant) -> Verdict {
    let service = runtime.config.name.clone();

    // 1. Loop protection: already-tripped starts-window cooldown.
    if runtime.starts.is_disabled(now) {
        return Verdict::Deny(InetdError::Denied { service, by: DenyBy::Loop });
    }

    // 2. IP ACL.
    if !runtime.ip_acl.allowed(remote) {
        return Verdict::Deny(InetdError::Denied { service, by: DenyBy::Acl });
    }

    // 3. GeoIP ACL.
    if !runtime.geoip.allowed(remote) {
        return Verdict::Deny(InetdError::Denied { service, by: DenyBy::GeoIp });
    }

    // 4. CPM limiter.
    match runtime.limiter.lock().unwrap().arrival(remote, now) {
        CpmVerdict::Allowed => {}
        CpmVerdict::OverLimit | CpmVerdict::TemporarilyDisabled => {
            return Verdict::Deny(InetdError::OverLimit { service, kind: LimitKind::Cpm });
        }
    }

    // 5. Time-window ACL.
    if !runtime.config.access_times.allowed_at(minute_of_day(now)) {
        return Verdict::Deny(InetdError::Denied { service, by: DenyBy::Time });
    }

    // 6. Starts-window (looping protection) registration. `toomany == 0`
    // disables the guard entirely (`StartWindow::record_start` no-ops).
    if runtime.starts.record_start(runtime.toomany, now) {
        log::warn!("service {service}: start-loop limit tripped, disabling for {}s", crate::registry::RETRYTIME_SECS);
        return Verdict::Deny(InetdError::OverLimit { service, kind: LimitKind::StartLoop });
    }

    // 9. Max-child enforcement (checked here; connection-group admission
    // in step 7 happens at actual spawn time once an OS pid exists).
    if runtime.config.max_child > 0 {
        let occupancy = runtime.tables.lock().unwrap().child_count();
        if occupancy >= runtime.config.max_child as usize {
            return Verdict::Deny(InetdError::OverLimit { service, kind: LimitKind::MaxChild });
        }
    }

    Verdict::Admit
}

/// Record a spawned child in the service's tables, enforcing `per_source`
/// (admission procedure step 7).
pub fn admit_child(runtime: &ServiceRuntime, remote: IpAddr, pid: i32) -> Result<crate::tables::Handle, InetdError> {
    runtime
        .tables
        .lock()
        .unwrap()
        .admit(&runtime.config.name, remote, pid, runtime.config.per_source as usize)
        .map_err(|e| match e {
            AdmitError::PerSourceFull => InetdError::OverLimit {
                service: runtime.config.name.clone(),
                kind: LimitKind::PerSource,
            },
        })
}

/// TCPMUX secondary-service lookup: a client on the `tcpmux` service sends
/// a single service-name line before anything else; dispatch continues
/// against whatever service that name resolves to (always `wait=no`,
/// enforced at parse time).
pub fn tcpmux_lookup<'a>(snapshot: &'a Snapshot, requested: &str) -> Option<&'a std::sync::Arc<ServiceRuntime>> {
    snapshot.services.iter().find(|s| s.config.name == requested && !s.config.disabled)
}

/// Whether a service's handler requires a forked/spawned OS process
/// rather than in-process handling.
pub fn needs_process(handler: &Handler) -> bool {
    matches!(handler, Handler::External { .. })
}
