//! Acceptor core (design component C9).
//!
//! A synchronous, `poll(2)`-driven accept loop: one descriptor per bound
//! service, a 30-second timeout that doubles as the reaper's poll
//! interval, and signal flags for reconfigure/terminate layered on top
//! the way `networkd::main`'s event loop layers its reload/shutdown
//! `AtomicBool`s over a fixed-interval poll. `wait = yes` services are
//! dropped from the poll set while a child is running and re-armed on
//! reap, mirroring the original's single-threaded accept-mode handling;
//! `wait = no` services dispatch every ready connection through a bounded
//! worker pool (`threadpool`), the nearest equivalent to the design's
//! completion-port-style concurrent variant without binding to IOCP.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::AsFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::config::model::{Handler, ServiceConfig, SockFamily, SocketKind};
use crate::config::parser::parse_file;
use crate::dispatcher::{self, Verdict};
use crate::error::InetdError;
use crate::reaper;
use crate::registry::{Registry, ServiceRuntime, Snapshot};
use crate::tables::Handle;

const POLL_TIMEOUT_SECS: u64 = 30;

pub enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
    Unix(UnixListener),
}

fn bind_service(config: &ServiceConfig) -> Result<Listener, InetdError> {
    let bind_err = |e: io::Error| InetdError::BindFailed { service: config.name.clone(), os_err: e };

    if config.family == SockFamily::Unix {
        let path = config.unix_path.clone().unwrap_or_else(|| PathBuf::from(format!("/tmp/{}.sock", config.name)));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        return Ok(Listener::Unix(listener));
    }

    let ip: std::net::IpAddr = match config.family {
        SockFamily::V4 => std::net::Ipv4Addr::UNSPECIFIED.into(),
        SockFamily::V6 => std::net::Ipv6Addr::UNSPECIFIED.into(),
        SockFamily::Unix => unreachable!(),
    };
    let addr = SocketAddr::new(ip, config.port.unwrap_or(0));

    match config.socket_kind {
        SocketKind::Dgram | SocketKind::Rdm => {
            let socket = UdpSocket::bind(addr).map_err(bind_err)?;
            socket.set_nonblocking(true).map_err(bind_err)?;
            Ok(Listener::Udp(socket))
        }
        SocketKind::Stream | SocketKind::SeqPacket | SocketKind::Raw => {
            let listener = TcpListener::bind(addr).map_err(bind_err)?;
            listener.set_nonblocking(true).map_err(bind_err)?;
            Ok(Listener::Tcp(listener))
        }
    }
}

/// Owns every bound listener and the worker pool that services `wait =
/// no` connections. One per process; the supervisor holds it behind no
/// further indirection (it already serializes all mutation through its
/// own loop thread).
pub struct AcceptorCore {
    registry: Arc<Registry>,
    config_path: PathBuf,
    listeners: HashMap<String, Listener>,
    /// Runtimes that fell out of the live config but still have children
    /// draining; kept around only long enough for the reaper to empty
    /// their tables.
    retiring: Vec<Arc<ServiceRuntime>>,
    pool: threadpool::ThreadPool,
    pub shutdown: Arc<AtomicBool>,
    pub reload: Arc<AtomicBool>,
}

impl AcceptorCore {
    pub fn new(config_path: PathBuf, worker_threads: usize, toomany: u32) -> Result<Self, InetdError> {
        let mut errors = Vec::new();
        let configs = parse_file(&config_path, &mut errors)?;
        for e in &errors {
            log::error!("config: {e}");
        }
        let registry = Arc::new(Registry::new(configs, toomany));

        let shutdown = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())
            .map_err(|e| InetdError::Fatal { reason: format!("cannot install SIGTERM handler: {e}") })?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())
            .map_err(|e| InetdError::Fatal { reason: format!("cannot install SIGINT handler: {e}") })?;
        signal_hook::flag::register(signal_hook::consts::SIGHUP, reload.clone())
            .map_err(|e| InetdError::Fatal { reason: format!("cannot install SIGHUP handler: {e}") })?;

        let mut core = AcceptorCore {
            registry,
            config_path,
            listeners: HashMap::new(),
            retiring: Vec::new(),
            pool: threadpool::ThreadPool::new(worker_threads.max(1)),
            shutdown,
            reload,
        };
        core.bind_all();
        Ok(core)
    }

    fn bind_all(&mut self) {
        let snapshot = self.registry.current();
        let now = Instant::now();
        for svc in &snapshot.services {
            if svc.config.disabled || svc.starts.is_disabled(now) || self.listeners.contains_key(&svc.config.name) {
                continue;
            }
            match bind_service(&svc.config) {
                Ok(l) => {
                    self.listeners.insert(svc.config.name.clone(), l);
                }
                Err(e) => log::error!("{e}"),
            }
        }
    }

    /// Closes the listener for any service whose start-loop guard just
    /// tripped (`enabled,running --limit-hit--> enabled,!running`), then
    /// re-binds anything `bind_all` previously skipped whose `RETRYTIME`
    /// cooldown has since elapsed. Called once per accept-loop iteration so
    /// a tripped service actually stops completing handshakes during its
    /// 600s cooldown instead of merely being denied after accept.
    fn retire_tripped_listeners(&mut self) {
        let snapshot = self.registry.current();
        let now = Instant::now();
        for svc in &snapshot.services {
            if svc.starts.is_disabled(now) && self.listeners.remove(&svc.config.name).is_some() {
                log::warn!(
                    "service {}: start-loop limit tripped, closing listener for {}s",
                    svc.config.name,
                    crate::registry::RETRYTIME_SECS
                );
            }
        }
        self.bind_all();
    }

    fn handle_reload(&mut self) {
        log::info!("reconfiguring on SIGHUP");
        let mut errors = Vec::new();
        let configs = match parse_file(&self.config_path, &mut errors) {
            Ok(c) => c,
            Err(e) => {
                log::error!("reconfigure aborted, config invalid: {e}");
                return;
            }
        };
        for e in &errors {
            log::error!("config: {e}");
        }
        let retired = self.registry.reconfigure(configs);
        let retired_names: HashSet<String> = retired.iter().map(|r| r.config.name.clone()).collect();
        for name in &retired_names {
            self.listeners.remove(name);
        }
        self.retiring.extend(retired);
        self.bind_all();
    }

    fn drain_retired(&mut self) {
        self.retiring.retain(|r| r.tables.lock().unwrap().child_count() > 0);
    }

    /// Run until `shutdown` is set. Each iteration: poll every eligible
    /// listener, accept/dispatch anything ready, reap exited children,
    /// service the reload flag.
    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            if self.reload.swap(false, Ordering::Relaxed) {
                self.handle_reload();
            }

            self.retire_tripped_listeners();

            let snapshot = self.registry.current();
            let mut names: Vec<&String> = Vec::new();
            let mut pollfds: Vec<PollFd> = Vec::new();
            for (name, listener) in &self.listeners {
                if snapshot.by_name(name).is_some_and(|svc| svc.busy.load(Ordering::SeqCst)) {
                    continue;
                }
                let fd = match listener {
                    Listener::Tcp(l) => l.as_fd(),
                    Listener::Udp(l) => l.as_fd(),
                    Listener::Unix(l) => l.as_fd(),
                };
                pollfds.push(PollFd::new(fd, PollFlags::POLLIN));
                names.push(name);
            }

            let timeout = PollTimeout::from(POLL_TIMEOUT_SECS as u16 * 1000u16);
            match poll(&mut pollfds, timeout) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    log::error!("poll failed: {e}");
                    break;
                }
            }

            let ready: Vec<String> = pollfds
                .iter()
                .zip(names.iter())
                .filter(|(pfd, _)| pfd.revents().is_some_and(|r| r.contains(PollFlags::POLLIN)))
                .map(|(_, name)| (*name).clone())
                .collect();

            for name in ready {
                if let Some(svc) = snapshot.by_name(&name) {
                    self.service_ready(svc.clone(), &name, &snapshot);
                }
            }

            // `busy` is cleared by whichever worker thread retires the
            // child (inline here for synthetic pids, inline in
            // `run_external` for `wait = yes`), not by this reap pass.
            reaper::reap_all(&self.registry.current());
            self.drain_retired();
        }
        log::info!("shutdown requested, exiting accept loop");
    }

    fn service_ready(&mut self, svc: Arc<ServiceRuntime>, name: &str, snapshot: &Arc<Snapshot>) {
        enum Accepted {
            Tcp(std::net::TcpStream, std::net::IpAddr),
            Unix(std::os::unix::net::UnixStream),
            Udp(UdpSocket, SocketAddr, Vec<u8>),
        }

        let single = svc.config.wait == crate::config::model::WaitMode::Single;
        let mut accepted = Vec::new();
        {
            let listener = match self.listeners.get(name) {
                Some(l) => l,
                None => return,
            };
            match listener {
                Listener::Tcp(tcp) => loop {
                    match tcp.accept() {
                        Ok((stream, peer)) => accepted.push(Accepted::Tcp(stream, peer.ip())),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::error!("service {name}: accept failed: {e}");
                            break;
                        }
                    }
                    if single {
                        break;
                    }
                },
                Listener::Unix(unix) => loop {
                    match unix.accept() {
                        Ok((stream, _)) => accepted.push(Accepted::Unix(stream)),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(_) => break,
                    }
                    if single {
                        break;
                    }
                },
                Listener::Udp(udp) => {
                    let mut buf = [0u8; 65536];
                    match udp.recv_from(&mut buf) {
                        Ok((n, peer)) => {
                            if let Ok(clone) = udp.try_clone() {
                                accepted.push(Accepted::Udp(clone, peer, buf[..n].to_vec()));
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => log::error!("service {name}: recv_from failed: {e}"),
                    }
                }
            }
        }

        for item in accepted {
            match item {
                Accepted::Tcp(stream, ip) => self.dispatch_stream(&svc, stream, ip, snapshot),
                Accepted::Unix(stream) => self.dispatch_unix(&svc, stream),
                Accepted::Udp(socket, peer, data) => self.dispatch_dgram(&svc, socket, peer, data),
            }
        }
    }

    fn dispatch_stream(
        &mut self,
        svc: &Arc<ServiceRuntime>,
        stream: std::net::TcpStream,
        remote: std::net::IpAddr,
        snapshot: &Arc<Snapshot>,
    ) {
        if svc.config.protocol.starts_with("tcpmux") {
            let snapshot = snapshot.clone();
            let placeholder = svc.clone();
            self.pool.execute(move || dispatch_tcpmux(placeholder, snapshot, stream, remote));
            return;
        }

        match dispatcher::admit(svc, remote, Instant::now()) {
            Verdict::Admit => {}
            Verdict::Deny(e) => {
                log::warn!("{e}");
                drop(stream);
                return;
            }
        }
        let svc = svc.clone();
        if svc.config.wait == crate::config::model::WaitMode::Single {
            svc.busy.store(true, Ordering::SeqCst);
        }
        self.pool.execute(move || run_connection(svc, remote, Connection::Tcp(stream)));
    }

    fn dispatch_unix(&mut self, svc: &Arc<ServiceRuntime>, stream: std::os::unix::net::UnixStream) {
        let remote = std::net::IpAddr::from(std::net::Ipv4Addr::UNSPECIFIED);
        match dispatcher::admit(svc, remote, Instant::now()) {
            Verdict::Admit => {}
            Verdict::Deny(e) => {
                log::warn!("{e}");
                return;
            }
        }
        let svc = svc.clone();
        if svc.config.wait == crate::config::model::WaitMode::Single {
            svc.busy.store(true, Ordering::SeqCst);
        }
        self.pool.execute(move || run_connection(svc, remote, Connection::Unix(stream)));
    }

    fn dispatch_dgram(&mut self, svc: &Arc<ServiceRuntime>, socket: UdpSocket, peer: SocketAddr, data: Vec<u8>) {
        match dispatcher::admit(svc, peer.ip(), Instant::now()) {
            Verdict::Admit => {}
            Verdict::Deny(e) => {
                log::warn!("{e}");
                return;
            }
        }
        let svc = svc.clone();
        self.pool.execute(move || {
            if let Handler::Builtin { name, .. } = &svc.config.handler {
                if let Err(e) = crate::builtins::run_dgram(name, &socket, peer, &data) {
                    log::warn!("service {}: builtin {name} failed: {e}", svc.config.name);
                }
            }
        });
    }
}

enum Connection {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

impl io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf),
            Connection::Unix(s) => s.read(buf),
        }
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write(buf),
            Connection::Unix(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.flush(),
            Connection::Unix(s) => s.flush(),
        }
    }
}

const TCPMUX_NAME_MAX: usize = 256;

/// Reads the service-name line a TCPMUX client sends immediately after
/// connecting (before anything else), stripping a trailing `\r`.
fn read_tcpmux_name(stream: &mut std::net::TcpStream) -> io::Result<String> {
    use std::io::Read;
    let mut name = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if name.len() >= TCPMUX_NAME_MAX {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "tcpmux service name too long"));
        }
        match stream.read(&mut byte)? {
            0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before tcpmux name line")),
            _ => {
                if byte[0] == b'\n' {
                    break;
                }
                if byte[0] != b'\r' {
                    name.push(byte[0]);
                }
            }
        }
    }
    String::from_utf8(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "tcpmux service name not utf8"))
}

/// Runs in a worker-pool thread: reads the TCPMUX name line, resolves it
/// against the live snapshot, and re-dispatches admission and the
/// connection handler against the *named* service rather than the tcpmux
/// placeholder the listener was bound under.
fn dispatch_tcpmux(placeholder: Arc<ServiceRuntime>, snapshot: Arc<Snapshot>, mut stream: std::net::TcpStream, remote: std::net::IpAddr) {
    let name = match read_tcpmux_name(&mut stream) {
        Ok(n) => n,
        Err(e) => {
            log::warn!("service {}: tcpmux name read failed: {e}", placeholder.config.name);
            return;
        }
    };
    let svc = match dispatcher::tcpmux_lookup(&snapshot, &name) {
        Some(s) => s.clone(),
        None => {
            log::warn!("service {}: tcpmux lookup for {name:?} found no matching service", placeholder.config.name);
            return;
        }
    };
    match dispatcher::admit(&svc, remote, Instant::now()) {
        Verdict::Admit => {}
        Verdict::Deny(e) => {
            log::warn!("{e}");
            return;
        }
    }
    run_connection(svc, remote, Connection::Tcp(stream));
}

/// Runs in a worker-pool thread: handle the connection per the service's
/// handler, then clear its slot in the per-service tables.
///
/// Builtins and the redirect proxy have no real child process, so they're
/// tracked under a synthetic negative pid counter and retired inline the
/// moment the handler function returns. An external server is a real OS
/// process: it's tracked under its actual pid, and for `wait = no` the
/// slot is freed later by `reaper::reap_all` picking up its exit via
/// `waitpid`, not by this thread (which does not block on it).
fn run_connection(svc: Arc<ServiceRuntime>, remote: std::net::IpAddr, mut conn: Connection) {
    if dispatcher::needs_process(&svc.config.handler) {
        let Handler::External { path, args, workdir } = &svc.config.handler else {
            unreachable!("needs_process only returns true for Handler::External")
        };
        if let Err(e) = run_external(&svc, &mut conn, remote, path, args, workdir.as_deref()) {
            log::warn!("service {}: spawn failed: {e}", svc.config.name);
        }
        return;
    }

    static SYNTHETIC_PID: Mutex<i32> = Mutex::new(-2);
    let pid = {
        let mut guard = SYNTHETIC_PID.lock().unwrap();
        *guard -= 1;
        *guard
    };

    let handle: Option<Handle> = match dispatcher::admit_child(&svc, remote, pid) {
        Ok(h) => Some(h),
        Err(e) => {
            log::warn!("{e}");
            return;
        }
    };

    match &svc.config.handler {
        Handler::Builtin { name, .. } => {
            if let Err(e) = crate::builtins::run_stream(name, &mut conn) {
                log::debug!("service {}: builtin {name}: {e}", svc.config.name);
            }
        }
        Handler::Redirect { host, port } => {
            if let Err(e) = run_redirect(&mut conn, host, *port) {
                log::warn!("service {}: redirect to {host}:{port} failed: {e}", svc.config.name);
            }
        }
        Handler::External { .. } => unreachable!("handled above"),
    }

    if let Some(handle) = handle {
        svc.tables.lock().unwrap().retire(handle);
    }
    if svc.config.wait == crate::config::model::WaitMode::Single {
        svc.busy.store(false, Ordering::SeqCst);
    }
}

/// Proxies bytes between the accepted connection and a fixed remote
/// endpoint. Recovered from `original_source`'s `redir` built-in; not
/// named in the distilled spec but present in the system it was drawn
/// from.
fn run_redirect(conn: &mut Connection, host: &str, port: u16) -> io::Result<()> {
    use std::io::{Read, Write};
    let mut upstream = std::net::TcpStream::connect((host, port))?;
    let mut up_reader = upstream.try_clone()?;
    let mut down = match conn {
        Connection::Tcp(s) => s.try_clone()?,
        Connection::Unix(_) => return Err(io::Error::new(io::ErrorKind::Unsupported, "redirect requires a stream socket")),
    };
    let mut down_reader = down.try_clone()?;

    let upstream_side = std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match down_reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if upstream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut buf = [0u8; 8192];
    loop {
        match up_reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if down.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
    let _ = upstream_side.join();
    Ok(())
}

fn run_external(
    svc: &ServiceRuntime,
    conn: &mut Connection,
    remote: std::net::IpAddr,
    path: &std::path::Path,
    args: &[String],
    workdir: Option<&std::path::Path>,
) -> Result<(), InetdError> {
    use std::os::fd::{AsRawFd, FromRawFd};
    use std::process::{Command, Stdio};

    let raw_fd = match conn {
        Connection::Tcp(s) => s.as_raw_fd(),
        Connection::Unix(s) => s.as_raw_fd(),
    };
    let dup = |fd: i32| -> io::Result<std::fs::File> {
        let new_fd = unsafe { libc::dup(fd) };
        if new_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { std::fs::File::from_raw_fd(new_fd) })
    };
    let stdin = dup(raw_fd).map_err(|e| InetdError::SpawnFailed { service: svc.config.name.clone(), os_err: e })?;
    let stdout = dup(raw_fd).map_err(|e| InetdError::SpawnFailed { service: svc.config.name.clone(), os_err: e })?;
    let stderr = dup(raw_fd).map_err(|e| InetdError::SpawnFailed { service: svc.config.name.clone(), os_err: e })?;

    let mut cmd = Command::new(path);
    cmd.args(args).stdin(Stdio::from(stdin)).stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    // Only the `passenv` allow-list (if any) is inherited from the
    // daemon's own environment; everything else comes from `env` entries.
    cmd.env_clear();
    for key in &svc.config.env.passenv {
        if let Ok(v) = std::env::var(key) {
            cmd.env(key, v);
        }
    }
    for (k, v) in &svc.config.env.set {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().map_err(|e| InetdError::SpawnFailed { service: svc.config.name.clone(), os_err: e })?;
    let pid = child.id() as i32;
    let handle = dispatcher::admit_child(svc, remote, pid)?;

    if svc.config.wait == crate::config::model::WaitMode::Single {
        // Single-threaded accept mode: block here so the acceptor's
        // `busy` set (keyed on this service) is the only thing keeping
        // the listening socket out of the poll set while this child runs.
        let _ = child.wait();
        svc.tables.lock().unwrap().retire(handle);
        svc.busy.store(false, Ordering::SeqCst);
    }
    // For `wait = no`, the slot is freed by `reaper::reap_all` when the
    // real pid shows up in a `waitpid` reap, not here.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::*;

    fn tcp_config(name: &str, port: u16) -> ServiceConfig {
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
    fn binds_an_ephemeral_tcp_port() {
        let listener = bind_service(&tcp_config("echo", 0)).unwrap();
        assert!(matches!(listener, Listener::Tcp(_)));
    }

    #[test]
    fn reads_tcpmux_name_line_up_to_newline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = std::thread::spawn(move || {
            use std::io::Write;
            let mut client = std::net::TcpStream::connect(addr).unwrap();
            client.write_all(b"echo\r\nextra-body-bytes").unwrap();
        });
        let (mut server, _) = listener.accept().unwrap();
        let name = read_tcpmux_name(&mut server).unwrap();
        assert_eq!(name, "echo");
        writer.join().unwrap();
    }

    #[test]
    fn retire_tripped_listeners_closes_a_tripped_services_socket() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "service echo\n{{\n    socket_type = stream\n    protocol    = tcp\n    wait        = no\n    user        = nobody\n    port        = 0\n    builtin     = echo\n}}"
        )
        .unwrap();

        let mut core = AcceptorCore::new(f.path().to_path_buf(), 1, 256).unwrap();
        assert!(core.listeners.contains_key("echo"));

        let now = Instant::now();
        {
            let snapshot = core.registry.current();
            let svc = snapshot.by_name("echo").unwrap();
            for _ in 0..260 {
                svc.starts.record_start(256, now);
            }
            assert!(svc.starts.is_disabled(now));
        }

        core.retire_tripped_listeners();
        assert!(!core.listeners.contains_key("echo"), "tripped service's listener should be closed");

        // Still within the cooldown: the guard in `bind_all` must keep
        // skipping it rather than immediately re-handing it a socket.
        core.retire_tripped_listeners();
        assert!(!core.listeners.contains_key("echo"), "listener must stay closed until the cooldown elapses");
    }

    #[test]
    fn tcpmux_name_line_rejects_oversized_input() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = std::thread::spawn(move || {
            use std::io::Write;
            let mut client = std::net::TcpStream::connect(addr).unwrap();
            client.write_all(&vec![b'x'; TCPMUX_NAME_MAX + 1]).unwrap();
        });
        let (mut server, _) = listener.accept().unwrap();
        assert!(read_tcpmux_name(&mut server).is_err());
        writer.join().unwrap();
    }

    #[test]
    fn poll_timeout_is_thirty_seconds() {
        assert_eq!(POLL_TIMEOUT_SECS, 30);
    }
}
