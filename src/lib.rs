//! # podder
//!
//! **Unprivileged, layer-based container runtime for Linux.**
//!
//! This crate pulls image layers from OCI-compatible registries,
//! materialises them as a chain of layer directories on disk, assembles a
//! root filesystem with an overlay mount, and runs an init process inside
//! a fresh set of namespaces — all without ever requiring privilege on the
//! host. Rootless operation rests on user namespaces and the invoking
//! user's subordinate UID/GID ranges.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │ pull                                                               │
//! │  RegistryClient ──► Importer ──► LayerStore                        │
//! │  (manifests, blobs)  (userns tar extraction)  (layer directories)  │
//! ├────────────────────────────────────────────────────────────────────┤
//! │ start                                                              │
//! │  LayerStore ──► MountPlan ──► Launcher ──► lifecycle               │
//! │  (chain, config) (overlay+tmpfs) (namespaces, pivot, exec) (pids)  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A **layer** is a directory holding its own filesystem contents
//! (`root/`), optional scoped configuration (`config.ini`), and a `parent`
//! edge to the next lower layer. Following parents yields the chain the
//! overlay is built from; configuration folds along the same chain with
//! descendants overriding ancestors.
//!
//! By default the container's writable layer is a tmpfs (**ephemeral**):
//! stopping the container discards every change. A layer configured with
//! `ephemeral = false` writes into its own `root/` instead.
//!
//! # Rootless model
//!
//! - Image layers are extracted in a forked child inside a user namespace
//!   whose maps make the invoking user container ID 0 and lay the
//!   subordinate ranges out above it, so archive ownership is preserved
//!   without host root.
//! - `start` unshares user, mount, pid, uts, ipc, and (by default) net
//!   namespaces, installs the same maps, mounts the overlay, pivots into
//!   it, and execs the configured command as pid 1 with all capabilities
//!   dropped.
//! - Moving a macvlan interface into the container needs `CAP_NET_ADMIN`
//!   and stays out of process: an external helper is invoked with
//!   `<interface> <pid> [mac]` and its failure never kills the container.
//!
//! # Example
//!
//! ```rust,ignore
//! use podder::{Importer, Launcher, LayerStore, RegistryClient};
//!
//! let store = LayerStore::open_default()?;
//! let client = RegistryClient::new()?;
//!
//! let reference = podder::ImageReference::parse("registry-1.docker.io/library/ubuntu:latest")?;
//! let outcome = Importer::new(&store).pull_blocking(&client, &reference)?;
//!
//! let started = Launcher::new(&store).start(&outcome.top_layer)?;
//! println!("init is pid {}", started.pid());
//! # Ok::<(), podder::Error>(())
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod extract;
pub mod idmap;
pub mod importer;
pub mod launcher;
pub mod lifecycle;
pub mod mounts;
pub mod platform;
pub mod registry;
pub mod sdnotify;
pub mod store;
pub mod userns;

pub use config::{Config, NamespaceMode, Settings};
pub use error::{Error, Result};
pub use importer::{Importer, PullOutcome};
pub use launcher::{Launcher, StartOutcome};
pub use lifecycle::ContainerStatus;
pub use platform::Platform;
pub use registry::{ImageReference, RegistryClient};
pub use store::{Layer, LayerStore};
