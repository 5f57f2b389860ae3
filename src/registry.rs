//! Service registry and reconfiguration (design component C8).
//!
//! The registry publishes an immutable `Snapshot` behind a single
//! `RwLock<Arc<_>>`; every reader takes a cheap clone of the `Arc` and
//! never blocks a writer mid-read. A reconfiguration builds the next
//! snapshot off the parsed config, carrying over the live `ServiceTables`,
//! `CpmLimiter`, and starts-window state for any service whose identity
//! tuple (`ServiceKey`) is unchanged, and returns the set of runtimes that
//! fell out of the new config so the caller can retire their sockets.
//! Grounded on `networkd`'s link-state manager, which rebuilds its table
//! from a freshly parsed config on `SIGHUP` and reconciles by matching
//! keys rather than tearing everything down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::addr::AccessIp;
use crate::config::model::{ServiceConfig, ServiceKey};
use crate::geoip::GeoAcl;
use crate::limiter::CpmLimiter;
use crate::tables::ServiceTables;

/// Starts-window (looping-protection) counters, kept per service and
/// carried across reconfiguration the same way `libinetd` persists
/// `se_count`/`se_time` for a service it recognizes across a re-read.
/// Grounded on `libinetd/inetd.cpp`'s `CNT_INTVL`/`RETRYTIME` handling.
pub struct StartWindow {
    pub count: AtomicU32,
    window_start: Mutex<Instant>,
    disabled_until: Mutex<Option<Instant>>,
}

pub const CNT_INTVL_SECS: u64 = 60;
pub const RETRYTIME_SECS: u64 = 600;

impl StartWindow {
    fn fresh(now: Instant) -> Self {
        StartWindow {
            count: AtomicU32::new(0),
            window_start: Mutex::new(now),
            disabled_until: Mutex::new(None),
        }
    }

    /// Record one more start attempt; returns `true` if the service should
    /// be temporarily disabled (tripped the loop limit).
    pub fn record_start(&self, max_per_interval: u32, now: Instant) -> bool {
        {
            let disabled_until = self.disabled_until.lock().unwrap();
            if let Some(until) = *disabled_until {
                if now < until {
                    return true;
                }
            }
        }
        let mut start = self.window_start.lock().unwrap();
        if now.duration_since(*start).as_secs() >= CNT_INTVL_SECS {
            *start = now;
            self.count.store(0, Ordering::SeqCst);
        }
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if max_per_interval > 0 && n > max_per_interval {
            *self.disabled_until.lock().unwrap() = Some(now + std::time::Duration::from_secs(RETRYTIME_SECS));
            return true;
        }
        false
    }

    pub fn is_disabled(&self, now: Instant) -> bool {
        self.disabled_until.lock().unwrap().is_some_and(|until| now < until)
    }
}

/// Everything needed to run one configured service: its static config
/// plus the mutable runtime state that outlives any single connection.
pub struct ServiceRuntime {
    pub config: ServiceConfig,
    pub ip_acl: AccessIp,
    pub geoip: GeoAcl,
    pub limiter: Mutex<CpmLimiter>,
    pub tables: Mutex<ServiceTables>,
    pub starts: StartWindow,
    /// Set while a `wait = yes` child is running, so the poll loop leaves
    /// this service's listener out of the set until the child is reaped.
    /// Cleared by whichever code path retires the child (the worker thread
    /// for builtins/redirect/external, not the poll loop itself), since a
    /// synthetic builtin pid never appears in `waitpid`.
    pub busy: AtomicBool,
    /// Starts-window threshold (`-R`/`toomany`, `CNT_INTVL = 60s`); `0`
    /// disables the loop guard entirely. Process-global, not per-service
    /// config, so it is threaded in from the `Registry` rather than parsed.
    pub toomany: u32,
}

impl ServiceRuntime {
    pub(crate) fn build(config: ServiceConfig, toomany: u32) -> Self {
        let mut ip_acl = AccessIp::new();
        for (allow, net) in &config.ip_acl.rules {
            // Already validated as duplicate-free by `ServiceConfig::validate`.
            let _ = ip_acl.insert(*net, *allow);
        }
        let _ = ip_acl.set_default(config.ip_acl.default);
        let geoip = if let Some(db) = &config.geoip.database {
            GeoAcl::new(Some(db), config.geoip.rules.clone(), config.geoip.default)
        } else {
            GeoAcl::disabled()
        };
        let limiter = Mutex::new(CpmLimiter::new(config.cpm_max, config.cpm_wait_secs));
        ServiceRuntime {
            config,
            ip_acl,
            geoip,
            limiter,
            tables: Mutex::new(ServiceTables::new()),
            starts: StartWindow::fresh(Instant::now()),
            busy: AtomicBool::new(false),
            toomany,
        }
    }

    fn carry_over(new_config: ServiceConfig, old: &Arc<ServiceRuntime>, toomany: u32) -> Self {
        let mut ip_acl = AccessIp::new();
        for (allow, net) in &new_config.ip_acl.rules {
            let _ = ip_acl.insert(*net, *allow);
        }
        let _ = ip_acl.set_default(new_config.ip_acl.default);
        let geoip = if let Some(db) = &new_config.geoip.database {
            GeoAcl::new(Some(db), new_config.geoip.rules.clone(), new_config.geoip.default)
        } else {
            GeoAcl::disabled()
        };
        // Limiter state does not carry over: a reconfigure can change
        // `cpm`, and stale buckets sized for the old rate would misreport.
        let limiter = Mutex::new(CpmLimiter::new(new_config.cpm_max, new_config.cpm_wait_secs));
        ServiceRuntime {
            config: new_config,
            ip_acl,
            geoip,
            limiter,
            tables: Mutex::new(ServiceTables::new()),
            starts: StartWindow {
                count: AtomicU32::new(old.starts.count.load(Ordering::SeqCst)),
                window_start: Mutex::new(*old.starts.window_start.lock().unwrap()),
                disabled_until: Mutex::new(*old.starts.disabled_until.lock().unwrap()),
            },
            busy: AtomicBool::new(false),
            toomany,
        }
    }
}

/// An immutable, published configuration generation.
pub struct Snapshot {
    pub services: Vec<Arc<ServiceRuntime>>,
}

impl Snapshot {
    pub fn find(&self, key: &ServiceKey) -> Option<&Arc<ServiceRuntime>> {
        self.services.iter().find(|s| &s.config.key() == key)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<ServiceRuntime>> {
        self.services.iter().find(|s| s.config.name == name)
    }
}

/// Owns the single published `Snapshot`. Readers call `current()` and
/// never block; a reconfigure swaps the `Arc` under a short-held write
/// lock and hands the caller the outgoing runtimes that no longer have a
/// matching service so they can be drained and retired.
pub struct Registry {
    current: RwLock<Arc<Snapshot>>,
    /// Process-global starts-window threshold (`-R`/`toomany`), applied to
    /// every service built or carried over through this registry.
    toomany: u32,
}

impl Registry {
    pub fn new(configs: Vec<ServiceConfig>, toomany: u32) -> Self {
        let services = configs.into_iter().map(|c| Arc::new(ServiceRuntime::build(c, toomany))).collect();
        Registry { current: RwLock::new(Arc::new(Snapshot { services })), toomany }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current.read().unwrap().clone()
    }

    /// Build and publish a new snapshot from freshly parsed configs.
    /// Returns the runtimes that existed before and have no counterpart
    /// in the new config (retired, to be drained by the caller).
    pub fn reconfigure(&self, configs: Vec<ServiceConfig>) -> Vec<Arc<ServiceRuntime>> {
        let old = self.current();
        let mut by_key: HashMap<ServiceKey, &Arc<ServiceRuntime>> =
            old.services.iter().map(|s| (s.config.key(), s)).collect();

        let mut next = Vec::with_capacity(configs.len());
        let mut matched_keys = std::collections::HashSet::new();
        for config in configs {
            let key = config.key();
            if let Some(old_runtime) = by_key.remove(&key) {
                matched_keys.insert(key);
                next.push(Arc::new(ServiceRuntime::carry_over(config, old_runtime, self.toomany)));
            } else {
                next.push(Arc::new(ServiceRuntime::build(config, self.toomany)));
            }
        }

        let retired: Vec<Arc<ServiceRuntime>> = old
            .services
            .iter()
            .filter(|s| !matched_keys.contains(&s.config.key()))
            .cloned()
            .collect();

        *self.current.write().unwrap() = Arc::new(Snapshot { services: next });
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::*;

    fn minimal(name: &str, port: u16) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            socket_kind: SocketKind::Stream,
            family: SockFamily::V4,
            protocol: "tcp".to_string(),
            rpc: false,
            port: Some(port),
            unix_path: None,
            wait: WaitMode::Multi,
            identity: Identity::default(),
            handler: Handler::Builtin { name: "echo".to_string(), bi_fork: false },
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
    fn reconfigure_carries_over_matching_service() {
        let reg = Registry::new(vec![minimal("echo", 7)], 256);
        let snap = reg.current();
        let runtime = snap.by_name("echo").unwrap();
        runtime.starts.count.store(3, Ordering::SeqCst);

        let retired = reg.reconfigure(vec![minimal("echo", 7)]);
        assert!(retired.is_empty());
        let snap2 = reg.current();
        let runtime2 = snap2.by_name("echo").unwrap();
        assert_eq!(runtime2.starts.count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reconfigure_retires_removed_service() {
        let reg = Registry::new(vec![minimal("echo", 7), minimal("daytime", 13)], 256);
        let retired = reg.reconfigure(vec![minimal("echo", 7)]);
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].config.name, "daytime");
        assert!(reg.current().by_name("daytime").is_none());
    }

    #[test]
    fn reconfigure_treats_changed_identity_as_new_service() {
        let reg = Registry::new(vec![minimal("echo", 7)], 256);
        let mut changed = minimal("echo", 7);
        changed.protocol = "udp".to_string();
        changed.socket_kind = SocketKind::Dgram;
        let retired = reg.reconfigure(vec![changed]);
        assert_eq!(retired.len(), 1);
    }

    #[test]
    fn start_window_trips_after_limit_and_recovers() {
        let window = StartWindow::fresh(Instant::now());
        let now = Instant::now();
        for _ in 0..5 {
            assert!(!window.record_start(5, now));
        }
        assert!(window.record_start(5, now));
        assert!(window.is_disabled(now));
        let later = now + std::time::Duration::from_secs(RETRYTIME_SECS + 1);
        assert!(!window.is_disabled(later));
    }
}
