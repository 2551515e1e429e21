//! Constants for the layer store, registry client, and launcher.
//!
//! All limits, timeouts, media types, and well-known file names live here
//! so there are no magic values scattered through the codebase.

use std::time::Duration;

// =============================================================================
// Store Layout
// =============================================================================

/// Environment variable overriding the store root.
pub const STORE_ENV: &str = "PODDER_STORE";

/// Store directory name under `$XDG_DATA_HOME`.
pub const STORE_DIR_NAME: &str = "podder";

/// Per-layer configuration file name.
pub const CONFIG_FILE: &str = "config.ini";

/// Per-layer pid file name; present iff a container is believed running.
pub const PID_FILE: &str = "init.pid";

/// Per-layer parent symlink name.
pub const PARENT_LINK: &str = "parent";

/// Layer subdirectory holding the layer's own filesystem contents.
pub const ROOT_DIR: &str = "root";

/// Layer subdirectory where the assembled overlay is mounted.
pub const MERGED_DIR: &str = "merged";

/// Layer subdirectory for the ephemeral tmpfs (overlay upper/work, /run).
pub const RUN_DIR: &str = "run";

/// Cache directory (under the store root) for in-flight blob downloads.
pub const BLOB_CACHE_DIR: &str = ".cache/blobs";

/// Characters allowed in layer names.
pub const LAYER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789._-";

// =============================================================================
// Registry Limits and Retry Policy
// =============================================================================

/// Maximum image reference length (bytes).
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum manifest or image index size (4 MiB).
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// Maximum image config blob size (4 MiB).
pub const MAX_CONFIG_SIZE: usize = 4 * 1024 * 1024;

/// Maximum number of layers accepted in a manifest.
pub const MAX_LAYERS: usize = 128;

/// Attempts per network operation before the failure is surfaced.
pub const MAX_RETRIES: u32 = 4;

/// First retry delay; doubles per attempt.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Ceiling for the exponential backoff.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(8);

/// Connect timeout for registry requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// OCI / Docker Media Types
// =============================================================================

/// OCI image index media type.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Docker schema-2 manifest list media type.
pub const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// OCI image manifest media type.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Docker schema-2 manifest media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// OCI image config media type.
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Docker image config media type.
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Uncompressed layer media types.
pub const MEDIA_TYPES_LAYER_TAR: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar",
    "application/vnd.docker.image.rootfs.diff.tar",
];

/// Gzip-compressed layer media types.
pub const MEDIA_TYPES_LAYER_GZIP: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];

/// Zstd-compressed layer media types.
pub const MEDIA_TYPES_LAYER_ZSTD: &[&str] = &["application/vnd.oci.image.layer.v1.tar+zstd"];

// =============================================================================
// Whiteouts
// =============================================================================

/// Prefix marking a tar entry as a whiteout.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// File name marking its directory as opaque.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

// =============================================================================
// ID Mapping
// =============================================================================

/// Subordinate UID range file.
pub const SUBUID_PATH: &str = "/etc/subuid";

/// Subordinate GID range file.
pub const SUBGID_PATH: &str = "/etc/subgid";

/// Privileged helper for writing multi-range uid maps.
pub const NEWUIDMAP: &str = "newuidmap";

/// Privileged helper for writing multi-range gid maps.
pub const NEWGIDMAP: &str = "newgidmap";

// =============================================================================
// Launch
// =============================================================================

/// Device nodes bind-mounted from the host into `/dev`.
pub const DEV_NODES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

/// Host files bind-mounted into `/etc` for name resolution.
pub const ETC_BINDS: &[&str] = &["hosts", "resolv.conf"];

/// Directory inside the new root where the old root is parked during pivot.
pub const OLD_ROOT_DIR: &str = "old_root";

/// Default grace period between SIGTERM and SIGKILL on `stop`.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Age after which a claimed-but-unfilled pid file counts as abandoned
/// (the launcher that claimed it died before recording a pid).
pub const STALE_CLAIM_GRACE: Duration = Duration::from_secs(30);

/// External macvlan helper binary (runs with CAP_NET_ADMIN).
pub const MACVLAN_HELPER: &str = "podder-net";

/// Environment variable overriding the macvlan helper path.
pub const MACVLAN_HELPER_ENV: &str = "PODDER_NET_HELPER";
