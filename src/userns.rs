//! User-namespaced staging: run work as mapped root without privilege.
//!
//! Layer extraction must write files owned by arbitrary archive UIDs. With
//! no privilege on the host that is only possible inside a user namespace
//! whose map makes the invoking user container ID 0 and lays the
//! subordinate ranges out above it. This module forks a child, has it
//! unshare a user namespace, installs the maps from the parent side (the
//! child cannot map itself), and then runs a closure in the child as
//! mapped root.
//!
//! Handshake, parent on the left:
//!
//! ```text
//!            fork ─────────────► unshare(CLONE_NEWUSER)
//!   read(ready) ◄──────────────── write(ready)
//!   write uid/gid maps
//!   write(go) ─────────────────► read(go)   (now uid 0 inside)
//!                                run closure
//!   read(status to EOF) ◄─────── error frame, or clean close
//!   waitpid
//! ```
//!
//! A failure inside the child travels back over the status pipe as a
//! human-readable frame; the parent surfaces it as an extraction error.

use crate::error::{Error, Result};
use crate::idmap::IdMaps;
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe, ForkResult};
use std::fs::File;
use std::io::{Read, Write};
use tracing::debug;

/// Forks into a mapped user namespace and runs `work` there as mapped root.
///
/// `label` names the operation in the error a failing child produces.
/// The caller must be single-threaded: this forks.
pub fn run_mapped<F>(maps: &IdMaps, label: &str, work: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    let (ready_r, ready_w) = pipe().map_err(map_err("creating pipe"))?;
    let (go_r, go_w) = pipe().map_err(map_err("creating pipe"))?;
    let (status_r, status_w) = pipe().map_err(map_err("creating pipe"))?;

    // SAFETY: the child only runs the closure after a minimal handshake;
    // the process is single-threaded at every call site.
    match unsafe { fork() }.map_err(map_err("fork"))? {
        ForkResult::Child => {
            drop(ready_r);
            drop(go_w);
            drop(status_r);
            let mut ready_w = File::from(ready_w);
            let mut go_r = File::from(go_r);
            let mut status_w = File::from(status_w);

            let outcome = (|| -> Result<()> {
                unshare(CloneFlags::CLONE_NEWUSER)
                    .map_err(map_err("unshare(CLONE_NEWUSER)"))?;
                ready_w
                    .write_all(b"u")
                    .map_err(|err| Error::NamespaceSetupFailed(err.to_string()))?;
                drop(ready_w);

                let mut byte = [0u8; 1];
                go_r.read_exact(&mut byte)
                    .map_err(|_| Error::NamespaceSetupFailed("parent went away".into()))?;

                // The installed map makes our own id container root.
                work()
            })();

            let code = match outcome {
                Ok(()) => 0,
                Err(err) => {
                    let _ = status_w.write_all(err.to_string().as_bytes());
                    1
                }
            };
            let _ = status_w.flush();
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            drop(ready_w);
            drop(go_r);
            drop(status_w);
            let mut ready_r = File::from(ready_r);
            let mut go_w = File::from(go_w);
            let mut status_r = File::from(status_r);

            let mut byte = [0u8; 1];
            ready_r
                .read_exact(&mut byte)
                .map_err(|_| Error::NamespaceSetupFailed("staging child died early".into()))?;

            maps.apply(child)?;
            go_w.write_all(b"g")
                .map_err(|err| Error::NamespaceSetupFailed(err.to_string()))?;
            drop(go_w);

            let mut frame = String::new();
            let _ = status_r.read_to_string(&mut frame);

            let status = waitpid(child, None).map_err(map_err("waitpid"))?;
            debug!(?status, label, "staging child finished");
            match status {
                WaitStatus::Exited(_, 0) => Ok(()),
                WaitStatus::Exited(_, _) if !frame.is_empty() => Err(Error::Extraction {
                    digest: label.to_string(),
                    reason: frame,
                }),
                other => Err(Error::Extraction {
                    digest: label.to_string(),
                    reason: format!("staging child crashed: {:?}", other),
                }),
            }
        }
    }
}

fn map_err(context: &'static str) -> impl Fn(nix::errno::Errno) -> Error {
    move |errno| Error::NamespaceSetupFailed(format!("{}: {}", context, errno))
}
