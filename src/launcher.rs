//! The container launch pipeline.
//!
//! `start` walks a fixed state machine across three processes:
//!
//! ```text
//! launcher (caller)          outer child (supervisor)        init (pid 1)
//! ────────────────────────── ─────────────────────────────── ─────────────────
//! resolve chain, config,
//! mount plan, id ranges
//! catch SIGINT
//! claim init.pid (O_EXCL)
//! fork ────────────────────► unshare(user,mnt,pid,uts,ipc[,net])
//! read(ready) ◄───────────── write(ready)
//! install uid/gid maps
//! write(go) ───────────────► (now mapped root)
//!                            private propagation, tmpfs+overlay
//!                            pivot_root, /dev, sethostname
//!                            fork ─────────────────────────► /proc /sys /etc
//! read "PID n" ◄──────────── report init pid                 /tmp /run mounts
//!                            supervise: waitpid(init),       detach old root
//!                            unlink init.pid on exit         drop capabilities
//! read(status to EOF) ◄──────────────────────────────────────execve (pipe
//! fill init.pid, notify                                      closes, no data)
//! ```
//!
//! Failures anywhere before the `execve` travel back over the close-on-exec
//! status pipe as an error frame; a clean close with no data is the success
//! marker. A SIGINT while the launcher is blocked in this handshake fails
//! the pending read instead of killing the process, so the cleanup guard
//! kills the outer child's process group and removes the partial
//! `init.pid`; the same guard runs on any other launch failure.
//!
//! With `[container] tty = true` and a terminal on stdin, the init process
//! gets a pseudo-terminal from the container's own devpts as its
//! controlling tty (with `/dev/console` bound to it), the caller's
//! terminal switches to raw mode, and the supervisor proxies bytes and
//! `SIGWINCH`-driven window resizes between the two until the container
//! exits. In that mode `start` stays attached and reports the container's
//! exit code; otherwise the container runs detached and `start` returns
//! once pid 1 has exec'd.

use crate::config::{NamespaceMode, Settings};
use crate::constants::{MACVLAN_HELPER, MACVLAN_HELPER_ENV, OLD_ROOT_DIR, PID_FILE};
use crate::error::{Error, Result};
use crate::idmap::IdMaps;
use crate::mounts::{self, MountPlan};
use crate::sdnotify;
use crate::store::LayerStore;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, OpenptyResult};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::signal::{
    self, kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal,
};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    chdir, execvpe, fork, pipe, pipe2, pivot_root, setgid, setgroups, sethostname, setpgid,
    setsid, setuid, ttyname, ForkResult, Gid, Pid, Uid,
};
use std::ffi::CString;
use std::fs::File;
use std::io::{IsTerminal, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::{debug, info, warn};

/// Default PATH for containers whose image sets none.
const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// How a `start` concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The container runs detached; its init pid is recorded.
    Detached(Pid),
    /// A terminal was attached and the container ran to completion.
    Attached { pid: Pid, exit_code: i32 },
}

impl StartOutcome {
    /// The init pid, however the start concluded.
    pub fn pid(&self) -> Pid {
        match self {
            StartOutcome::Detached(pid) => *pid,
            StartOutcome::Attached { pid, .. } => *pid,
        }
    }
}

/// Launches and joins containers on top of a layer store.
pub struct Launcher<'a> {
    store: &'a LayerStore,
}

impl<'a> Launcher<'a> {
    pub fn new(store: &'a LayerStore) -> Self {
        Self { store }
    }

    /// Starts a container on `name`.
    ///
    /// Detached (the default): blocks until pid 1 has exec'd, not until it
    /// exits, and returns [`StartOutcome::Detached`]. With `tty = true`
    /// and a terminal on stdin the call stays attached, proxying the
    /// terminal until the container exits, and reports the exit code.
    /// The caller must be single-threaded: this forks.
    pub fn start(&self, name: &str) -> Result<StartOutcome> {
        // ---- prepare -------------------------------------------------------
        let chain = self.store.chain(name)?;
        let settings = Settings::from_config(&self.store.effective_config(name)?)?;
        if settings.command.is_empty() {
            return Err(Error::ExecFailed {
                command: String::new(),
                reason: "no command configured for this layer".to_string(),
            });
        }
        let attach = settings.tty && std::io::stdin().is_terminal();
        if settings.tty && !attach {
            warn!(layer = name, "tty requested but stdin is not a terminal; starting detached");
        }
        let plan = MountPlan::build(&chain, &settings);
        let maps = IdMaps::for_invoking_user()?;
        let layer = chain[0].clone();
        layer.ensure_dirs()?;

        // A Ctrl-C between the pid-file claim and the exec marker must run
        // the cleanup below rather than kill us mid-claim.
        let _sigint = SigintScope::install()?;

        self.store.acquire_pid_file(name)?;
        let mut guard = LaunchGuard {
            store: self.store,
            name,
            outer: None,
            armed: true,
        };

        let (ready_r, ready_w) = pipe().map_err(ns_err("creating pipe"))?;
        let (go_r, go_w) = pipe().map_err(ns_err("creating pipe"))?;
        // Close-on-exec: a successful execve closes this with no data.
        let (status_r, status_w) = pipe2(OFlag::O_CLOEXEC).map_err(ns_err("creating pipe"))?;

        // ---- fork outer ----------------------------------------------------
        // SAFETY: the caller is single-threaded; the child executes only the
        // launch sequence below and never returns.
        match unsafe { fork() }.map_err(ns_err("fork"))? {
            ForkResult::Child => {
                drop(ready_r);
                drop(go_w);
                drop(status_r);
                let outcome = outer_child(
                    &layer,
                    &plan,
                    &settings,
                    attach,
                    File::from(ready_w),
                    File::from(go_r),
                    File::from(status_w),
                );
                // Only reached on error; success never returns here.
                let _ = outcome;
                std::process::exit(1);
            }
            ForkResult::Parent { child } => {
                guard.outer = Some(child);
                // Both sides set the process group to close the race
                // between this fork returning and the child's setpgid.
                let _ = setpgid(child, child);
                drop(ready_w);
                drop(go_r);
                drop(status_w);

                let mut ready_r = File::from(ready_r);
                let mut go_w = File::from(go_w);
                let mut status_r = File::from(status_r);

                // ---- map ids -----------------------------------------------
                read_byte_interruptible(&mut ready_r, "outer child")?;
                maps.apply(child)?;
                go_w.write_all(b"g")
                    .map_err(|err| Error::NamespaceSetupFailed(err.to_string()))?;
                drop(go_w);

                // ---- wait for the exec marker ------------------------------
                let frames = read_frames_interruptible(&mut status_r)?;
                let init_pid = parse_status_frames(&frames)?;

                self.store.set_running(name, init_pid)?;
                guard.armed = false;
                info!(layer = name, pid = init_pid.as_raw(), "container started");

                if let Some(interface) = &settings.macvlan {
                    move_macvlan(interface, init_pid, settings.macvlan_mac.as_deref());
                }
                sdnotify::ready(init_pid);

                if attach {
                    let exit_code = wait_exit_code(child)?;
                    return Ok(StartOutcome::Attached {
                        pid: init_pid,
                        exit_code,
                    });
                }
                Ok(StartOutcome::Detached(init_pid))
            }
        }
    }

    /// Runs a command inside a running container by joining the init
    /// process's namespaces. Returns the command's exit code.
    pub fn exec(&self, name: &str, command: &[String]) -> Result<i32> {
        let pid = self.store.is_running(name)?.ok_or_else(|| Error::ExecFailed {
            command: command.join(" "),
            reason: format!("no container is running on layer '{}'", name),
        })?;
        let settings = Settings::from_config(&self.store.effective_config(name)?)?;

        let ns_dir = format!("/proc/{}/ns", pid.as_raw());
        let user_ns = File::open(format!("{}/user", ns_dir))?;
        let joins = [
            (File::open(format!("{}/mnt", ns_dir))?, CloneFlags::CLONE_NEWNS),
            (File::open(format!("{}/pid", ns_dir))?, CloneFlags::CLONE_NEWPID),
            (File::open(format!("{}/uts", ns_dir))?, CloneFlags::CLONE_NEWUTS),
            (File::open(format!("{}/ipc", ns_dir))?, CloneFlags::CLONE_NEWIPC),
            (File::open(format!("{}/net", ns_dir))?, CloneFlags::CLONE_NEWNET),
        ];

        // SAFETY: single-threaded caller; children only join and exec.
        match unsafe { fork() }.map_err(ns_err("fork"))? {
            ForkResult::Parent { child } => wait_exit_code(child),
            ForkResult::Child => {
                let outcome = (|| -> Result<()> {
                    setns(&user_ns, CloneFlags::CLONE_NEWUSER)
                        .map_err(ns_err("joining user namespace"))?;
                    for (fd, kind) in &joins {
                        setns(fd, *kind).map_err(ns_err("joining namespace"))?;
                    }
                    // The pid namespace applies to children, so exec from one.
                    match unsafe { fork() }.map_err(ns_err("fork"))? {
                        ForkResult::Parent { child } => {
                            std::process::exit(wait_exit_code(child).unwrap_or(1))
                        }
                        ForkResult::Child => {
                            chdir("/").map_err(ns_err("chdir"))?;
                            exec_command(command, &settings)
                        }
                    }
                })();
                if let Err(err) = outcome {
                    eprintln!("podder exec: {}", err);
                }
                std::process::exit(127);
            }
        }
    }
}

// =============================================================================
// Interrupt Handling
// =============================================================================

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_interrupt(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Catches SIGINT without `SA_RESTART` for the duration of a launch, so
/// the blocking handshake reads fail with `EINTR` and the cleanup guard
/// runs instead of the process dying mid-claim. Restores the previous
/// disposition when dropped.
struct SigintScope {
    previous: SigAction,
}

impl SigintScope {
    fn install() -> Result<Self> {
        INTERRUPTED.store(false, Ordering::Relaxed);
        let action = SigAction::new(
            SigHandler::Handler(note_interrupt),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic flag.
        let previous = unsafe { sigaction(Signal::SIGINT, &action) }
            .map_err(ns_err("installing SIGINT handler"))?;
        Ok(Self { previous })
    }
}

impl Drop for SigintScope {
    fn drop(&mut self) {
        // SAFETY: restores the disposition saved at install time.
        unsafe {
            let _ = sigaction(Signal::SIGINT, &self.previous);
        }
    }
}

fn interrupted_error() -> Error {
    Error::NamespaceSetupFailed("interrupted; launch aborted".to_string())
}

/// Reads one handshake byte. The std helpers silently retry on `EINTR`,
/// which would swallow the interrupt; this one checks the flag instead.
fn read_byte_interruptible(file: &mut File, who: &str) -> Result<()> {
    let mut byte = [0u8; 1];
    loop {
        match file.read(&mut byte) {
            Ok(0) => {
                return Err(Error::NamespaceSetupFailed(format!("{} died early", who)))
            }
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                if INTERRUPTED.load(Ordering::Relaxed) {
                    return Err(interrupted_error());
                }
            }
            Err(err) => return Err(Error::NamespaceSetupFailed(err.to_string())),
        }
    }
}

/// Drains the status pipe to EOF, bailing out on an interrupting signal.
fn read_frames_interruptible(file: &mut File) -> Result<String> {
    let mut frames = String::new();
    let mut buf = [0u8; 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return Ok(frames),
            Ok(n) => frames.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                if INTERRUPTED.load(Ordering::Relaxed) {
                    return Err(interrupted_error());
                }
            }
            Err(_) => return Ok(frames),
        }
    }
}

/// Removes a partially started container when the launcher unwinds.
///
/// The outer child leads its own process group throughout the launch
/// handshake (it only rejoins the caller's group, in attach mode, after
/// the success marker disarms this guard), so the group kill always
/// reaches both the outer child and a mid-setup init.
struct LaunchGuard<'a> {
    store: &'a LayerStore,
    name: &'a str,
    outer: Option<Pid>,
    armed: bool,
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(outer) = self.outer {
            let _ = kill(Pid::from_raw(-outer.as_raw()), Signal::SIGKILL);
            let _ = waitpid(outer, None);
        }
        let _ = self.store.clear_running(self.name);
    }
}

// =============================================================================
// Outer Child (supervisor)
// =============================================================================

fn outer_child(
    layer: &crate::store::Layer,
    plan: &MountPlan,
    settings: &Settings,
    attach: bool,
    mut ready_w: File,
    mut go_r: File,
    status_w: File,
) -> Result<()> {
    let mut status = Some(status_w);
    let result = (|| -> Result<()> {
        // Own process group so the parent can kill the whole launch on
        // abort; an attached supervisor rejoins the caller's group once
        // the launch has succeeded. The launcher may already have moved us
        // into the new group, so read the caller's group off the parent.
        let caller_group = nix::unistd::getpgid(Some(nix::unistd::getppid()))
            .unwrap_or_else(|_| nix::unistd::getpgrp());
        setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(ns_err("setpgid"))?;

        let mut flags = CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC;
        if settings.net == NamespaceMode::Private {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        unshare(flags).map_err(ns_err("unshare"))?;

        ready_w
            .write_all(b"u")
            .map_err(|err| Error::NamespaceSetupFailed(err.to_string()))?;
        drop(ready_w);
        let mut byte = [0u8; 1];
        go_r.read_exact(&mut byte)
            .map_err(|_| Error::NamespaceSetupFailed("launcher went away".into()))?;

        // The installed map makes our own uid container root from here on.
        // ---- filesystem bring-up -------------------------------------------
        mounts::make_propagation_private()?;
        mounts::mount_rootfs(plan)?;

        // The pid file outlives the pivot through this directory handle.
        let layer_dir = File::open(layer.path())?;

        pivot_root(&plan.merged, &plan.merged.join(OLD_ROOT_DIR))
            .map_err(ns_err("pivot_root"))?;
        chdir("/").map_err(ns_err("chdir"))?;

        mounts::populate_dev()?;

        let hostname = settings
            .hostname
            .clone()
            .unwrap_or_else(|| layer.name().to_string());
        sethostname(&hostname).map_err(ns_err("sethostname"))?;

        // ---- pid 1 ---------------------------------------------------------
        let mut status_w = status.take().expect("status pipe unconsumed");
        // With the devpts instance mounted, the pty for an attached start
        // comes from the container's own /dev/ptmx.
        let pty = if attach {
            let pty = openpty(None, None).map_err(ns_err("openpty"))?;
            let slave_path = ttyname(&pty.slave).map_err(ns_err("ttyname"))?;
            Some((pty, slave_path))
        } else {
            None
        };
        // SAFETY: still single-threaded; the child becomes the container init.
        match unsafe { fork() }.map_err(ns_err("fork"))? {
            ForkResult::Child => {
                drop(layer_dir);
                if let Some((pty, slave_path)) = pty {
                    if let Err(err) = attach_console(pty, &slave_path) {
                        let _ = status_w.write_all(format!("ERR {}", err).as_bytes());
                        let _ = status_w.flush();
                        std::process::exit(127);
                    }
                }
                init_process(plan, settings, status_w);
                // init_process never returns.
            }
            ForkResult::Parent { child } => {
                // Report the init pid, then leave the pipe to the init
                // process alone so its close still marks the exec.
                let _ = status_w.write_all(format!("PID {}\n", child.as_raw()).as_bytes());
                drop(status_w);
                match pty {
                    Some((pty, _)) => {
                        drop(pty.slave);
                        supervise_attached(child, layer_dir, pty.master, caller_group);
                    }
                    None => supervise(child, layer_dir),
                }
                // Neither supervisor returns.
            }
        }
    })();

    if let Err(err) = &result {
        // Failures before the pid-1 fork still own the pipe; frame them.
        if let Some(mut status_w) = status.take() {
            let _ = status_w.write_all(format!("ERR {}", err).as_bytes());
        }
    }
    result
}

static INIT_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_sigterm(_: libc::c_int) {
    let pid = INIT_PID.load(Ordering::Relaxed);
    if pid > 0 {
        // SAFETY: kill is async-signal-safe.
        unsafe { libc::kill(pid, libc::SIGTERM) };
    }
}

static RESIZED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_resize(_: libc::c_int) {
    RESIZED.store(true, Ordering::Relaxed);
}

/// Waits for the init process, then clears the pid file and exits with the
/// init's status.
fn supervise(init: Pid, layer_dir: File) -> ! {
    INIT_PID.store(init.as_raw(), Ordering::Relaxed);
    // SAFETY: installing an async-signal-safe forwarder.
    unsafe {
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(forward_sigterm));
    }

    let code = wait_init(init);
    clear_pid_file(&layer_dir);
    std::process::exit(code);
}

/// Attached supervision: raw mode on the caller's terminal, a byte and
/// window-size proxy to the pty master, then the same wait-and-clear as
/// the detached supervisor. Restores the terminal before exiting.
fn supervise_attached(init: Pid, layer_dir: File, master: OwnedFd, caller_group: Pid) -> ! {
    // Rejoin the caller's foreground group: the proxy reads the caller's
    // terminal and must receive SIGWINCH from it.
    let _ = setpgid(Pid::from_raw(0), caller_group);
    INIT_PID.store(init.as_raw(), Ordering::Relaxed);
    // SAFETY: both handlers only store to atomics or forward a signal.
    unsafe {
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(forward_sigterm));
        let _ = signal::signal(Signal::SIGWINCH, SigHandler::Handler(note_resize));
    }

    let saved = tcgetattr(std::io::stdin()).ok();
    if let Some(saved) = &saved {
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        let _ = tcsetattr(std::io::stdin(), SetArg::TCSADRAIN, &raw);
    }
    // Push the initial window size before the first byte flows.
    RESIZED.store(true, Ordering::Relaxed);

    proxy_terminal(&master);
    let code = wait_init(init);

    if let Some(saved) = &saved {
        // The restore may run after the foreground group changed; a
        // background write would stop us with SIGTTOU.
        unsafe {
            let _ = signal::signal(Signal::SIGTTOU, SigHandler::SigIgn);
        }
        let _ = tcsetattr(std::io::stdin(), SetArg::TCSADRAIN, saved);
    }

    clear_pid_file(&layer_dir);
    std::process::exit(code);
}

/// Shuttles bytes between the caller's terminal and the pty master until
/// the container hangs up, forwarding window resizes along the way.
fn proxy_terminal(master: &OwnedFd) {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let (mut tty_in, mut tty_out) = match (
        stdin.as_fd().try_clone_to_owned(),
        stdout.as_fd().try_clone_to_owned(),
    ) {
        (Ok(input), Ok(output)) => (File::from(input), File::from(output)),
        _ => return,
    };
    let mut master_file = match master.try_clone() {
        Ok(fd) => File::from(fd),
        Err(_) => return,
    };

    let mut buf = [0u8; 1024];
    let mut stdin_open = true;
    loop {
        if RESIZED.swap(false, Ordering::Relaxed) {
            forward_winsize(master.as_raw_fd());
        }

        let stdin_events = if stdin_open {
            PollFlags::POLLIN
        } else {
            PollFlags::empty()
        };
        // Scoped so the fd borrows end before the reads below.
        let (stdin_ready, master_ready) = {
            let mut fds = [
                PollFd::new(tty_in.as_fd(), stdin_events),
                PollFd::new(master.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
            (
                fds[0].revents().unwrap_or(PollFlags::empty()),
                fds[1].revents().unwrap_or(PollFlags::empty()),
            )
        };

        if stdin_ready.contains(PollFlags::POLLIN) {
            match tty_in.read(&mut buf) {
                Ok(0) | Err(_) => stdin_open = false,
                Ok(n) => {
                    if master_file.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        } else if stdin_ready.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            stdin_open = false;
        }

        if master_ready.contains(PollFlags::POLLIN) {
            match master_file.read(&mut buf) {
                // EIO here means every slave handle is gone: hang-up.
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tty_out.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        } else if master_ready.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            break;
        }
    }
}

/// Copies the caller's terminal size onto the pty master.
fn forward_winsize(master: RawFd) {
    // SAFETY: TIOCGWINSZ/TIOCSWINSZ read and write a plain winsize struct.
    unsafe {
        let mut size: libc::winsize = std::mem::zeroed();
        if libc::ioctl(0, libc::TIOCGWINSZ, &mut size) == 0 {
            let _ = libc::ioctl(master, libc::TIOCSWINSZ, &size);
        }
    }
}

fn wait_init(init: Pid) -> i32 {
    loop {
        match waitpid(init, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            // 128 + signal, as shells report it.
            Ok(WaitStatus::Signaled(_, sig, _)) => return 128 + sig as i32,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return 1,
        }
    }
}

fn clear_pid_file(layer_dir: &File) {
    let pid_file = CString::new(PID_FILE).unwrap();
    // SAFETY: unlinking a name relative to an owned directory fd.
    unsafe { libc::unlinkat(layer_dir.as_raw_fd(), pid_file.as_ptr(), 0) };
}

// =============================================================================
// Init Process (pid 1)
// =============================================================================

/// Makes the pty slave the init's controlling terminal and stdio, and
/// exposes it as `/dev/console`.
fn attach_console(pty: OpenptyResult, slave_path: &Path) -> Result<()> {
    drop(pty.master);
    setsid().map_err(ns_err("setsid"))?;
    let slave = pty.slave.as_raw_fd();
    // SAFETY: claiming a freshly opened pty as controlling terminal and
    // routing fds 0..=2 through it.
    unsafe {
        if libc::ioctl(slave, libc::TIOCSCTTY, 0) != 0 {
            return Err(Error::NamespaceSetupFailed(format!(
                "TIOCSCTTY: {}",
                std::io::Error::last_os_error()
            )));
        }
        for fd in 0..=2 {
            if libc::dup2(slave, fd) < 0 {
                return Err(Error::NamespaceSetupFailed(format!(
                    "dup2: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
    }
    drop(pty.slave);
    mounts::bind_console(slave_path)
}

fn init_process(plan: &MountPlan, settings: &Settings, mut status_w: File) -> ! {
    let outcome = (|| -> Result<()> {
        let run_source = if plan.ephemeral {
            Some(plan.run_dir.as_path())
        } else {
            None
        };
        mounts::mount_system(settings.net == NamespaceMode::Private, run_source)?;
        mounts::detach_old_root()?;

        if let Err(errno) = setgroups(&[]) {
            // Denied when the fallback single-id map wrote setgroups=deny.
            debug!(error = %errno, "could not clear supplementary groups");
        }
        if let Some((uid, gid)) = settings.user {
            if let Some(gid) = gid {
                setgid(Gid::from_raw(gid)).map_err(ns_err("setgid"))?;
            }
            setuid(Uid::from_raw(uid)).map_err(ns_err("setuid"))?;
        }

        drop_all_capabilities()?;

        if let Some(workdir) = &settings.workdir {
            chdir(workdir.as_path()).map_err(|errno| Error::ExecFailed {
                command: settings.command.join(" "),
                reason: format!("chdir {}: {}", workdir.display(), errno),
            })?;
        }

        exec_command(&settings.command, settings)
    })();

    // Only reachable on failure: send the error frame to the launcher.
    let err = outcome.expect_err("execve does not return on success");
    let _ = status_w.write_all(format!("ERR {}", err).as_bytes());
    let _ = status_w.flush();
    std::process::exit(127);
}

/// Clears ambient, inheritable, effective, and permitted capability sets,
/// in an order the kernel accepts.
fn drop_all_capabilities() -> Result<()> {
    use caps::CapSet;
    let fail = |set: &'static str| {
        move |err: caps::errors::CapsError| {
            Error::NamespaceSetupFailed(format!("dropping {} capabilities: {}", set, err))
        }
    };
    caps::clear(None, CapSet::Ambient).map_err(fail("ambient"))?;
    caps::clear(None, CapSet::Inheritable).map_err(fail("inheritable"))?;
    caps::clear(None, CapSet::Effective).map_err(fail("effective"))?;
    caps::clear(None, CapSet::Permitted).map_err(fail("permitted"))?;
    Ok(())
}

/// Execs `command` with the effective environment; never returns on success.
fn exec_command(command: &[String], settings: &Settings) -> Result<()> {
    let exec_failed = |reason: String| Error::ExecFailed {
        command: command.join(" "),
        reason,
    };

    let program = command
        .first()
        .ok_or_else(|| exec_failed("empty command".to_string()))?;
    let program = CString::new(program.as_str()).map_err(|_| exec_failed("NUL in command".into()))?;
    let args: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| exec_failed("NUL in argument".to_string()))?;

    let mut env: Vec<CString> = Vec::with_capacity(settings.env.len() + 1);
    for (key, value) in &settings.env {
        env.push(
            CString::new(format!("{}={}", key, value))
                .map_err(|_| exec_failed("NUL in environment".to_string()))?,
        );
    }
    if !settings.env.iter().any(|(key, _)| key == "PATH") {
        env.push(CString::new(DEFAULT_PATH).unwrap());
    }

    let errno = execvpe(&program, &args, &env).unwrap_err();
    Err(exec_failed(errno.to_string()))
}

// =============================================================================
// Helpers
// =============================================================================

/// Parses the status pipe contents: a `PID n` report followed by nothing
/// (exec succeeded) or an `ERR …` frame.
fn parse_status_frames(frames: &str) -> Result<Pid> {
    if let Some((_, message)) = frames.split_once("ERR ") {
        return Err(Error::NamespaceSetupFailed(message.trim().to_string()));
    }
    frames
        .lines()
        .find_map(|line| line.strip_prefix("PID "))
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .map(Pid::from_raw)
        .ok_or_else(|| {
            Error::NamespaceSetupFailed(
                "container setup failed before reporting a pid".to_string(),
            )
        })
}

/// Invokes the external privileged macvlan helper. A failing helper is
/// reported but does not tear down the container.
fn move_macvlan(interface: &str, init_pid: Pid, mac: Option<&str>) {
    let helper = std::env::var(MACVLAN_HELPER_ENV).unwrap_or_else(|_| MACVLAN_HELPER.to_string());
    let mut command = Command::new(&helper);
    command.arg(interface).arg(init_pid.as_raw().to_string());
    if let Some(mac) = mac {
        command.arg(mac);
    }
    match command.status() {
        Ok(status) if status.success() => {
            info!(interface, pid = init_pid.as_raw(), "macvlan interface moved");
        }
        Ok(status) => warn!(interface, %status, helper, "macvlan helper failed"),
        Err(err) => warn!(interface, error = %err, helper, "macvlan helper not runnable"),
    }
}

fn wait_exit_code(child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

fn ns_err(context: &'static str) -> impl Fn(nix::errno::Errno) -> Error {
    move |errno| Error::NamespaceSetupFailed(format!("{}: {}", context, errno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_frames_parse_the_pid_report() {
        let pid = parse_status_frames("PID 4321\n").unwrap();
        assert_eq!(pid.as_raw(), 4321);
    }

    #[test]
    fn status_frames_surface_error_frames() {
        let err = parse_status_frames("PID 4321\nERR failed to exec '/bin/sh': ENOENT")
            .unwrap_err();
        assert!(err.to_string().contains("ENOENT"));
    }

    #[test]
    fn missing_pid_report_is_an_error() {
        assert!(parse_status_frames("").is_err());
        assert!(parse_status_frames("garbage\n").is_err());
    }

    #[test]
    fn outcome_exposes_the_pid_either_way() {
        let pid = Pid::from_raw(7);
        assert_eq!(StartOutcome::Detached(pid).pid(), pid);
        assert_eq!(
            StartOutcome::Attached {
                pid,
                exit_code: 0
            }
            .pid(),
            pid
        );
    }
}
