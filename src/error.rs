//! Error types for the layer store, registry client, and launcher.

use std::path::PathBuf;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the runtime core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Layer Store Errors
    // =========================================================================
    /// Layer does not exist in the store.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// Layer already exists in the store.
    #[error("layer already exists: {0}")]
    LayerExists(String),

    /// Parent chain loops back on itself.
    #[error("layer parent chain contains a cycle at '{0}'")]
    Cycle(String),

    /// Parent link points at something that is not a layer in this store.
    #[error("layer '{layer}' has a broken parent link: {reason}")]
    BrokenParent { layer: String, reason: String },

    /// Layer name contains characters that are not filesystem-safe.
    #[error("invalid layer name '{0}': only [A-Za-z0-9._-] are allowed")]
    InvalidLayerName(String),

    /// Layer cannot be removed while a container is running on it.
    #[error("layer '{name}' is in use by a running container (pid {pid})")]
    InUse { name: String, pid: i32 },

    /// Layer cannot be removed while other layers name it as parent.
    #[error("layer '{name}' is the parent of: {}", children.join(", "))]
    HasChildren { name: String, children: Vec<String> },

    /// A container is already running (or starting) on this layer.
    #[error("container already running on layer '{0}'")]
    AlreadyRunning(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Manifest or blob does not exist on the registry.
    #[error("not found on registry: {0}")]
    RegistryNotFound(String),

    /// Registry demanded authentication we could not begin.
    #[error("registry '{0}' requires authentication")]
    AuthRequired(String),

    /// Token handshake completed but the registry still refused us.
    #[error("authentication against '{registry}' failed: {reason}")]
    AuthFailed { registry: String, reason: String },

    /// Downloaded content does not hash to its advertised digest.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    /// Media type we do not know how to handle.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Image index has no entry for the host platform.
    #[error("no manifest for platform '{wanted}'; available: {}", available.join(", "))]
    NoMatchingPlatform {
        wanted: String,
        available: Vec<String>,
    },

    /// Network-level failure (retried with backoff before being surfaced).
    #[error("network error: {0}")]
    Network(String),

    // =========================================================================
    // Import / Extraction Errors
    // =========================================================================
    /// Tar entry tried to escape the extraction root.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Layer extraction failed; the whole pull is aborted.
    #[error("failed to extract layer {digest}: {reason}")]
    Extraction { digest: String, reason: String },

    // =========================================================================
    // Launch Errors
    // =========================================================================
    /// A mount in the container mount plan failed.
    #[error("mount failed at {}: {reason}", target.display())]
    MountFailed { target: PathBuf, reason: String },

    /// Namespace creation or ID mapping failed.
    #[error("namespace setup failed: {0}")]
    NamespaceSetupFailed(String),

    /// The init process could not exec the configured command.
    #[error("failed to exec '{command}': {reason}")]
    ExecFailed { command: String, reason: String },

    /// Operation needs a privilege the invoking user does not have.
    #[error("permission denied: {0}")]
    Permission(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// config.ini could not be parsed, or a recognised key has a bad value.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    // =========================================================================
    // I/O
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps an error to its CLI exit code.
    ///
    /// `0` is success; errors map to `1` unless a more specific code is
    /// defined for the failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::LayerNotFound(_) | Error::RegistryNotFound(_) => 2,
            Error::AlreadyRunning(_) => 3,
            Error::AuthRequired(_) | Error::AuthFailed { .. } => 4,
            Error::DigestMismatch { .. } => 5,
            Error::NoMatchingPlatform { .. } => 6,
            _ => 1,
        }
    }

    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_cli_contract() {
        assert_eq!(Error::LayerNotFound("x".into()).exit_code(), 2);
        assert_eq!(Error::AlreadyRunning("x".into()).exit_code(), 3);
        assert_eq!(
            Error::AuthFailed {
                registry: "r".into(),
                reason: "denied".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            Error::DigestMismatch {
                expected: "sha256:aa".into(),
                computed: "sha256:bb".into()
            }
            .exit_code(),
            5
        );
        assert_eq!(
            Error::NoMatchingPlatform {
                wanted: "linux/arm64".into(),
                available: vec![]
            }
            .exit_code(),
            6
        );
        assert_eq!(Error::Cycle("a".into()).exit_code(), 1);
    }

    #[test]
    fn only_network_errors_are_transient() {
        assert!(Error::Network("timeout".into()).is_transient());
        assert!(!Error::LayerExists("x".into()).is_transient());
    }
}
