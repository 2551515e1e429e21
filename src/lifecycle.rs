//! Container lifecycle: liveness, status, stop, and wait.
//!
//! The init process is not the controlling process's child (it runs
//! detached under its supervisor), so liveness is probed with signal 0
//! rather than `waitpid`, and `stop` polls for the pid to disappear.

use crate::error::{Error, Result};
use crate::store::LayerStore;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Poll interval while waiting for a container to die.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Observed state of a layer's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running(Pid),
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Running(pid) => write!(f, "running (pid {})", pid.as_raw()),
            ContainerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Reports whether a container is running on `name`.
pub fn status(store: &LayerStore, name: &str) -> Result<ContainerStatus> {
    Ok(match store.is_running(name)? {
        Some(pid) => ContainerStatus::Running(pid),
        None => ContainerStatus::Stopped,
    })
}

/// Stops the container on `name`: sends `signal`, escalates to SIGKILL
/// after `timeout`, waits for the init to disappear, and clears the pid
/// file. Stopping a stopped container is a no-op.
pub fn stop(store: &LayerStore, name: &str, signal: Signal, timeout: Duration) -> Result<()> {
    let pid = match store.is_running(name)? {
        Some(pid) => pid,
        None => {
            info!(layer = name, "no container running");
            return Ok(());
        }
    };

    info!(layer = name, pid = pid.as_raw(), %signal, "stopping container");
    send(pid, signal)?;

    let deadline = Instant::now() + timeout;
    while alive(pid) {
        if Instant::now() >= deadline {
            info!(layer = name, pid = pid.as_raw(), "grace period over; sending SIGKILL");
            send(pid, Signal::SIGKILL)?;
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    while alive(pid) {
        std::thread::sleep(POLL_INTERVAL);
    }

    // The supervisor usually beats us to this; either way it must be gone.
    store.clear_running(name)?;
    debug!(layer = name, "container stopped");
    Ok(())
}

/// Blocks until the container on `name` exits. Returns immediately when
/// nothing is running.
pub fn wait(store: &LayerStore, name: &str) -> Result<()> {
    while let Some(pid) = store.is_running(name)? {
        if !alive(pid) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

/// Parses a CLI signal argument: `TERM`, `SIGTERM`, or a number.
pub fn parse_signal(raw: &str) -> Result<Signal> {
    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| Error::ConfigInvalid(format!("unknown signal number {}", number)));
    }
    let name = if raw.starts_with("SIG") {
        raw.to_string()
    } else {
        format!("SIG{}", raw)
    };
    Signal::from_str(&name).map_err(|_| Error::ConfigInvalid(format!("unknown signal '{}'", raw)))
}

fn alive(pid: Pid) -> bool {
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}

fn send(pid: Pid, signal: Signal) -> Result<()> {
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn signal_names_parse_with_and_without_prefix() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert!(parse_signal("NOPE").is_err());
        assert!(parse_signal("4096").is_err());
    }

    #[test]
    fn status_reflects_the_pid_file() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path()).unwrap();
        store.create("a", None, None).unwrap();

        assert_eq!(status(&store, "a").unwrap(), ContainerStatus::Stopped);

        store.acquire_pid_file("a").unwrap();
        store.set_running("a", Pid::this()).unwrap();
        assert_eq!(
            status(&store, "a").unwrap(),
            ContainerStatus::Running(Pid::this())
        );
    }

    #[test]
    fn stopping_a_stopped_container_is_fine() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path()).unwrap();
        store.create("a", None, None).unwrap();
        stop(&store, "a", Signal::SIGTERM, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn status_of_a_missing_layer_fails() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path()).unwrap();
        assert!(matches!(
            status(&store, "ghost"),
            Err(Error::LayerNotFound(_))
        ));
    }
}
