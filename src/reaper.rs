//! Child reaper (design component C11).
//!
//! Drains exited children with a non-blocking `waitpid` loop and retires
//! their bookkeeping from the owning service's tables. Grounded on
//! `libsystemd::signal_handler::get_next_exited_child`'s WNOHANG loop
//! pattern; `nix::sys::wait` gives the same syscall without raw FFI.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::registry::Snapshot;

/// One reaped child, for logging/acceptor re-arm decisions.
pub struct Reaped {
    pub pid: i32,
    pub service: Option<String>,
    pub exit_status: Option<i32>,
    pub signal: Option<i32>,
}

/// Drain every exited child currently reapable without blocking. Looks
/// the pid up across every service in `snapshot` (a child belongs to
/// whichever service's table still holds its handle) and retires it from
/// that service's tables.
pub fn reap_all(snapshot: &Snapshot) -> Vec<Reaped> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Ok(WaitStatus::Continued(_)) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                reaped.push(retire(snapshot, pid.as_raw(), Some(code), None));
            }
            Ok(WaitStatus::Signaled(pid, sig, _core)) => {
                reaped.push(retire(snapshot, pid.as_raw(), None, Some(sig as i32)));
            }
            Ok(WaitStatus::Stopped(_, _)) | Ok(WaitStatus::PtraceEvent(..)) | Ok(WaitStatus::PtraceSyscall(_)) => {
                continue;
            }
            Err(nix::errno::Errno::ECHILD) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    reaped
}

fn retire(snapshot: &Snapshot, pid: i32, exit_status: Option<i32>, signal: Option<i32>) -> Reaped {
    for svc in &snapshot.services {
        let handle = svc.tables.lock().unwrap().find_by_pid(pid);
        if let Some(handle) = handle {
            svc.tables.lock().unwrap().retire(handle);
            match exit_status {
                Some(0) | None => log::info!("service {}: child pid {pid} reaped", svc.config.name),
                Some(code) => log::warn!("service {}: child pid {pid} exited with status {code}", svc.config.name),
            }
            if let Some(sig) = signal {
                log::warn!("service {}: child pid {pid} killed by signal {sig}", svc.config.name);
            }
            return Reaped { pid, service: Some(svc.config.name.clone()), exit_status, signal };
        }
    }
    log::debug!("reaped untracked child pid {pid}");
    Reaped { pid, service: None, exit_status, signal }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::*;
    use crate::registry::ServiceRuntime;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn minimal() -> ServiceConfig {
        ServiceConfig {
            name: "echo".into(),
            socket_kind: SocketKind::Stream,
            family: SockFamily::V4,
            protocol: "tcp".into(),
            rpc: false,
            port: Some(7),
            unix_path: None,
            wait: WaitMode::Multi,
            identity: Identity::default(),
            handler: Handler::Builtin { name: "echo".into(), bi_fork: false },
            env: EnvPolicy::default(),
            rcvbuf: None,
            sndbuf: None,
            max_child: 0,
            cpm_max: 0,
            cpm_wait_secs: 0,
            per_source: 0,
            access_times: crate::timewin::TimeAcl::new(),
            ip_acl: IpAclConfig::default(),
            geoip: GeoIpConfig::default(),
            banners: Banners::default(),
            ipsec_policy: None,
            disabled: false,
        }
    }

    #[test]
    fn retire_finds_owning_service_and_removes_the_handle() {
        let rt = Arc::new(ServiceRuntime::build(minimal(), 256));
        let remote = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        rt.tables.lock().unwrap().admit("echo", remote, 4242, 0).unwrap();
        let snapshot = Snapshot { services: vec![rt.clone()] };

        let result = retire(&snapshot, 4242, Some(0), None);
        assert_eq!(result.service.as_deref(), Some("echo"));
        assert_eq!(rt.tables.lock().unwrap().child_count(), 0);
    }

    #[test]
    fn retire_reports_untracked_pid_without_panicking() {
        let rt = Arc::new(ServiceRuntime::build(minimal(), 256));
        let snapshot = Snapshot { services: vec![rt] };
        let result = retire(&snapshot, 99999, Some(1), None);
        assert!(result.service.is_none());
    }
}
