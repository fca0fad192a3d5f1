//! Supervision of the root process's fork tree
//!
//! A single-threaded event loop multiplexing two sources over epoll: a
//! signalfd carrying SIGCHLD and the control datagram socket. The root
//! process is seized with fork tracing; every descendant that execs one of
//! the target programs gets one synchronous injection pass. While one target
//! is mid-injection no other event is serviced; already-released targets are
//! unaffected.
//!
//! All mutable state lives in [`Supervisor`]; handlers take `&mut self` and
//! nothing else. A failure on one target never takes the loop down, only an
//! exit request or losing the root process does.

pub mod crashloop;

use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use std::os::unix::net::UnixDatagram;
use std::process::Command;
use std::time::Instant;
use std::{fs, io};

use anyhow::{Context, Result};
use injector_common::{AbiWidth, ControlMessage};
use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::ptrace;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config::Config;
use crate::domain::{InjectorError, ProcessState, TracingState};
use crate::injection::Injector;
use crate::remote::maps;
use crate::status::{AbiReport, MonitorReport, Report, StatusWriter};
use crashloop::CrashWindow;

const TOKEN_SOCKET: u64 = 0;
const TOKEN_SIGCHLD: u64 = 1;

/// Stops the root must never actually take; they are swallowed instead of
/// forwarded.
const JOB_CONTROL: [Signal; 4] =
    [Signal::SIGSTOP, Signal::SIGTSTP, Signal::SIGTTIN, Signal::SIGTTOU];

/// Per-ABI-width pair of values; the supervisor tracks 64-bit and 32-bit
/// zygotes independently.
#[derive(Debug, Default)]
pub struct AbiTable<T> {
    pub abi64: T,
    pub abi32: T,
}

impl<T> Index<AbiWidth> for AbiTable<T> {
    type Output = T;

    fn index(&self, abi: AbiWidth) -> &T {
        match abi {
            AbiWidth::Abi64 => &self.abi64,
            AbiWidth::Abi32 => &self.abi32,
        }
    }
}

impl<T> IndexMut<AbiWidth> for AbiTable<T> {
    fn index_mut(&mut self, abi: AbiWidth) -> &mut T {
        match abi {
            AbiWidth::Abi64 => &mut self.abi64,
            AbiWidth::Abi32 => &mut self.abi32,
        }
    }
}

/// What is known about one companion daemon.
#[derive(Debug, Default)]
pub struct DaemonStatus {
    pub pid: Option<Pid>,
    pub running: bool,
    pub root_impl: Option<String>,
    pub modules: Vec<String>,
    pub error: Option<String>,
}

pub struct Supervisor {
    config: Config,
    root: Pid,
    state: TracingState,
    stop_reason: Option<String>,
    processes: HashMap<Pid, ProcessState>,
    respawns: AbiTable<CrashWindow>,
    daemons: AbiTable<DaemonStatus>,
    injected: AbiTable<bool>,
    status: StatusWriter,
    socket: UnixDatagram,
    signals: SignalFd,
    epoll: Epoll,
}

/// Run the supervisor until an exit request (or loss of the root process).
pub fn run(config: Config) -> Result<()> {
    let mut supervisor = Supervisor::new(config)?;
    supervisor.seize_root()?;
    supervisor.update_status();
    supervisor.event_loop()
}

impl Supervisor {
    fn new(config: Config) -> Result<Self> {
        let socket_path = config.socket_path();
        // A stale socket from a previous run would make bind fail
        let _ = fs::remove_file(&socket_path);
        let socket = UnixDatagram::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        socket.set_nonblocking(true)?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.thread_block().context("Failed to block SIGCHLD")?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("Failed to create signalfd")?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(&socket, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SOCKET))?;
        epoll.add(&signals, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SIGCHLD))?;

        let status = StatusWriter::new(&config);
        let root = Pid::from_raw(config.root_pid);
        Ok(Self {
            config,
            root,
            state: TracingState::Tracing,
            stop_reason: None,
            processes: HashMap::new(),
            respawns: AbiTable::default(),
            daemons: AbiTable::default(),
            injected: AbiTable::default(),
            status,
            socket,
            signals,
            epoll,
        })
    }

    fn seize_root(&mut self) -> Result<()> {
        ptrace::seize(self.root, ptrace::Options::PTRACE_O_TRACEFORK)
            .with_context(|| format!("Failed to seize root process {}", self.root))?;
        info!("seized root process {}", self.root);
        Ok(())
    }

    fn event_loop(&mut self) -> Result<()> {
        let mut events = [EpollEvent::empty(); 4];
        while self.state != TracingState::Exiting {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("epoll wait"),
            };
            for event in &events[..n] {
                match event.data() {
                    TOKEN_SOCKET => self.drain_socket(),
                    TOKEN_SIGCHLD => self.drain_children(),
                    other => warn!("unexpected epoll token {other}"),
                }
            }
        }

        info!("shutting down");
        let _ = ptrace::detach(self.root, None);
        let _ = fs::remove_file(self.config.socket_path());
        self.update_status();
        Ok(())
    }

    fn drain_socket(&mut self) {
        let mut buf = [0u8; 8192];
        loop {
            let len = match self.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("control socket: {err}");
                    break;
                }
            };
            match ControlMessage::decode(&buf[..len]) {
                Ok(msg) => self.handle_control(msg),
                Err(err) => warn!("dropping control datagram: {err}"),
            }
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) {
        debug!("control: {msg:?}");
        match msg {
            ControlMessage::Start => self.handle_start(),
            ControlMessage::Stop => self.request_stop("requested over control channel".to_string()),
            ControlMessage::Exit => self.state = TracingState::Exiting,
            ControlMessage::ZygoteInjected(abi) => {
                self.injected[abi] = true;
                info!("zygote{} reports payload up", abi.suffix());
                self.update_status();
            }
            ControlMessage::DaemonInfo { abi, root_impl, modules } => {
                let daemon = &mut self.daemons[abi];
                daemon.running = true;
                daemon.root_impl = Some(root_impl);
                daemon.modules = modules;
                daemon.error = None;
                self.update_status();
            }
            ControlMessage::DaemonError { abi, text } => {
                warn!("daemon{}: {text}", abi.suffix());
                let daemon = &mut self.daemons[abi];
                daemon.running = false;
                daemon.error = Some(text);
                self.update_status();
            }
        }
    }

    fn handle_start(&mut self) {
        match self.state {
            TracingState::Stopped => match ptrace::seize(
                self.root,
                ptrace::Options::PTRACE_O_TRACEFORK,
            ) {
                Ok(()) => {
                    info!("tracing resumed");
                    self.state = TracingState::Tracing;
                    self.stop_reason = None;
                    self.respawns.abi64.reset();
                    self.respawns.abi32.reset();
                }
                Err(err) => error!("re-seizing root {}: {err}", self.root),
            },
            TracingState::Stopping => {
                // Cancel the pending stop; the root's group-stop will simply
                // be resumed when it arrives.
                info!("stop cancelled");
                self.state = TracingState::Tracing;
                self.stop_reason = None;
            }
            _ => debug!("start request while {}", self.state.as_str()),
        }
        self.update_status();
    }

    fn request_stop(&mut self, reason: String) {
        if self.state != TracingState::Tracing {
            return;
        }
        info!("stopping: {reason}");
        self.stop_reason = Some(reason);
        match ptrace::interrupt(self.root) {
            Ok(()) => self.state = TracingState::Stopping,
            Err(err) => {
                error!("interrupting root {}: {err}", self.root);
                self.state = TracingState::Stopped;
            }
        }
        self.update_status();
    }

    fn drain_children(&mut self) {
        while let Ok(Some(_)) = self.signals.read_signal() {}
        loop {
            let status = match waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
            ) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => status,
                Err(Errno::ECHILD) => break,
                Err(err) => {
                    warn!("waitpid: {err}");
                    break;
                }
            };
            self.dispatch(status);
        }
    }

    fn dispatch(&mut self, status: WaitStatus) {
        let Some(pid) = status.pid() else { return };
        if self.handle_daemon_exit(pid, status) {
            return;
        }
        if pid == self.root {
            self.handle_root_event(status);
            return;
        }
        match status {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                self.processes.remove(&pid);
            }
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXEC) => self.handle_exec(pid),
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) => {
                // First stop of a fork child; it may race ahead of the
                // parent's fork event.
                self.processes.entry(pid).or_insert(ProcessState::New);
                if let Err(err) = ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACEEXEC) {
                    warn!("enabling exec tracing on {pid}: {err}");
                    self.processes.remove(&pid);
                    let _ = ptrace::detach(pid, None);
                    return;
                }
                let _ = ptrace::cont(pid, None);
            }
            WaitStatus::Stopped(_, sig) if self.processes.contains_key(&pid) => {
                let _ = ptrace::cont(pid, Some(sig));
            }
            other => trace!("ignoring {other:?} from untracked {pid}"),
        }
    }

    fn handle_root_event(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::PtraceEvent(
                _,
                _,
                libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE,
            ) => {
                match ptrace::getevent(self.root) {
                    Ok(child) => {
                        #[allow(clippy::cast_possible_truncation)]
                        let child = Pid::from_raw(child as i32);
                        trace!("root forked {child}");
                        self.processes.entry(child).or_insert(ProcessState::New);
                    }
                    Err(err) => warn!("reading fork event message: {err}"),
                }
                let _ = ptrace::cont(self.root, None);
            }
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) => {
                if self.state == TracingState::Stopping {
                    match ptrace::detach(self.root, None) {
                        Ok(()) => {
                            info!("detached from root {}", self.root);
                            self.state = TracingState::Stopped;
                        }
                        Err(err) => error!("detaching from root: {err}"),
                    }
                    self.update_status();
                } else {
                    // A group-stop nobody asked for; the root must not stop
                    let _ = ptrace::cont(self.root, None);
                }
            }
            WaitStatus::Stopped(_, sig) => {
                let forward = if JOB_CONTROL.contains(&sig) { None } else { Some(sig) };
                let _ = ptrace::cont(self.root, forward);
            }
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                error!("root process {} is gone", self.root);
                self.state = TracingState::Exiting;
            }
            other => {
                trace!("root: {other:?}");
                let _ = ptrace::cont(self.root, None);
            }
        }
    }

    /// A tracked pid exec'd: classify it and inject if it is a zygote.
    fn handle_exec(&mut self, pid: Pid) {
        let program = match maps::exe_path(pid) {
            Ok(program) => program,
            Err(err) => {
                warn!("reading program path of {pid}: {err}");
                self.release(pid);
                return;
            }
        };
        let Some(abi) = Config::target_abi(&program) else {
            trace!("{pid} exec'd {}, not a target", program.display());
            self.release(pid);
            return;
        };

        info!("{pid} exec'd {} ({}-bit zygote)", program.display(), abi.suffix());
        self.processes.insert(pid, ProcessState::Execd);
        // A respawn means any previous injection died with its process
        self.injected[abi] = false;

        if self.state != TracingState::Tracing {
            debug!("not tracing, releasing zygote {pid}");
            self.release(pid);
            self.update_status();
            return;
        }

        if self.respawns[abi].record(Instant::now()) {
            let err = InjectorError::ResourceExhausted(format!(
                "zygote{} respawned {} times within {}s",
                abi.suffix(),
                crashloop::RESPAWN_LIMIT,
                crashloop::RESPAWN_WINDOW.as_secs()
            ));
            warn!("{err}");
            self.request_stop(err.to_string());
            self.release(pid);
            return;
        }

        self.ensure_daemon(abi);

        self.processes.insert(pid, ProcessState::Injecting);
        match self.hand_off(pid, abi) {
            Ok(()) => {
                self.processes.insert(pid, ProcessState::Running);
                self.injected[abi] = true;
                info!("zygote{} {pid} injected and released", abi.suffix());
            }
            Err(err) => warn!("injection into {pid} failed: {err}"),
        }
        // Detached either way; the table entry dies with the trace
        self.processes.remove(&pid);
        self.update_status();
    }

    /// Drop our trace of a pid we will not inject into.
    fn release(&mut self, pid: Pid) {
        let _ = ptrace::detach(pid, None);
        self.processes.remove(&pid);
    }

    /// Park the target in a plain SIGSTOP, drop our trace, and hand it to
    /// the injecting tracer: ourselves for the native width, the sibling
    /// binary for the other one.
    fn hand_off(&mut self, pid: Pid, abi: AbiWidth) -> Result<(), InjectorError> {
        kill(pid, Signal::SIGSTOP)
            .map_err(|e| InjectorError::from_tracee_errno(e, "kill SIGSTOP"))?;
        ptrace::cont(pid, None).map_err(|e| InjectorError::from_tracee_errno(e, "cont"))?;
        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL))
                .map_err(|e| InjectorError::from_tracee_errno(e, "waitpid"))?
            {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => break,
                WaitStatus::Stopped(_, sig) => {
                    ptrace::cont(pid, Some(sig))
                        .map_err(|e| InjectorError::from_tracee_errno(e, "cont"))?;
                }
                WaitStatus::PtraceEvent(..) => {
                    ptrace::cont(pid, None)
                        .map_err(|e| InjectorError::from_tracee_errno(e, "cont"))?;
                }
                other => {
                    return Err(InjectorError::Transient(format!(
                        "target vanished while parking: {other:?}"
                    )));
                }
            }
        }
        ptrace::detach(pid, Some(Signal::SIGSTOP))
            .map_err(|e| InjectorError::from_tracee_errno(e, "detach"))?;

        if abi == Config::native_abi() {
            Injector::new(self.config.payload_path(abi), self.config.file_backed_load).trace(pid)
        } else {
            self.spawn_sibling_tracer(pid, abi)
        }
    }

    fn spawn_sibling_tracer(&self, pid: Pid, abi: AbiWidth) -> Result<(), InjectorError> {
        let tracer = self.config.tracer_path(abi);
        let mut cmd = Command::new(&tracer);
        cmd.arg("trace").arg(pid.to_string()).arg("--workdir").arg(&self.config.workdir);
        if self.config.file_backed_load {
            cmd.arg("--file-backed");
        }
        let status = cmd.status().map_err(|e| {
            InjectorError::Transient(format!("spawning {}: {e}", tracer.display()))
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(InjectorError::ProtocolMismatch(format!(
                "{} exited with {status}",
                tracer.display()
            )))
        }
    }

    fn ensure_daemon(&mut self, abi: AbiWidth) {
        if self.daemons[abi].pid.is_some() {
            return;
        }
        let path = self.config.daemon_path(abi);
        match Command::new(&path).current_dir(&self.config.workdir).spawn() {
            Ok(child) => {
                #[allow(clippy::cast_possible_wrap)]
                let pid = Pid::from_raw(child.id() as i32);
                info!("started daemon{} as {pid}", abi.suffix());
                let daemon = &mut self.daemons[abi];
                daemon.pid = Some(pid);
                daemon.running = true;
                daemon.error = None;
            }
            Err(err) => {
                warn!("starting {}: {err}", path.display());
                self.daemons[abi].error = Some(format!("failed to start: {err}"));
            }
        }
    }

    /// Returns true when `pid` was one of our companion daemons.
    fn handle_daemon_exit(&mut self, pid: Pid, status: WaitStatus) -> bool {
        let abi = if self.daemons.abi64.pid == Some(pid) {
            AbiWidth::Abi64
        } else if self.daemons.abi32.pid == Some(pid) {
            AbiWidth::Abi32
        } else {
            return false;
        };
        let text = match status {
            WaitStatus::Exited(_, code) => format!("daemon exited with code {code}"),
            WaitStatus::Signaled(_, sig, _) => format!("daemon killed by {sig}"),
            _ => return false,
        };
        error!("daemon{}: {text}", abi.suffix());
        let daemon = &mut self.daemons[abi];
        daemon.pid = None;
        daemon.running = false;
        daemon.error = Some(text);
        // Injecting without a live daemon would leave payloads blind
        self.request_stop(format!("daemon{} died", abi.suffix()));
        true
    }

    fn update_status(&self) {
        let report = Report {
            monitor: MonitorReport {
                state: self.state.as_str(),
                stop_reason: self.stop_reason.as_deref(),
            },
            abi64: abi_report(&self.daemons.abi64, self.injected.abi64),
            abi32: abi_report(&self.daemons.abi32, self.injected.abi32),
        };
        self.status.write(&report);
    }
}

fn abi_report(daemon: &DaemonStatus, injected: bool) -> AbiReport<'_> {
    AbiReport {
        injected,
        daemon_running: daemon.running,
        daemon_error: daemon.error.as_deref(),
        root_impl: daemon.root_impl.as_deref(),
        modules: &daemon.modules,
    }
}
