//! Service-manager readiness notification.
//!
//! When `$NOTIFY_SOCKET` is set, `start` reports `READY=1` and the init
//! pid after the exec marker arrives, so the runtime can sit under a
//! systemd service of `Type=notify`. Both filesystem and abstract socket
//! addresses are supported. Notification failures are never fatal.

use nix::unistd::Pid;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use tracing::{debug, warn};

const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Sends `READY=1` with the container's main pid, if a notify socket is
/// configured.
pub fn ready(pid: Pid) {
    let Some(socket_path) = std::env::var_os(NOTIFY_SOCKET_ENV) else {
        return;
    };
    let Some(socket_path) = socket_path.to_str().map(str::to_string) else {
        warn!("NOTIFY_SOCKET is not valid UTF-8; skipping notification");
        return;
    };

    let message = format!("READY=1\nMAINPID={}\n", pid.as_raw());
    if let Err(err) = send(&socket_path, message.as_bytes()) {
        warn!(socket = %socket_path, error = %err, "sd_notify failed");
    } else {
        debug!(socket = %socket_path, "sd_notify READY=1 sent");
    }
}

fn send(socket_path: &str, message: &[u8]) -> std::io::Result<()> {
    let address = match socket_path.strip_prefix('@') {
        Some(name) => SocketAddr::from_abstract_name(name.as_bytes())?,
        None => SocketAddr::from_pathname(socket_path)?,
    };
    let socket = UnixDatagram::unbound()?;
    socket.send_to_addr(message, &address)?;
    Ok(())
}
