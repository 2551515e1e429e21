//! Host platform detection for manifest selection.
//!
//! The registry client needs the host OS and architecture to pick the right
//! entry out of a multi-platform image index. Only the platforms the runtime
//! actually supports are represented; anything else refuses to pull.

use std::fmt;

/// CPU architecture, in OCI platform vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// OCI `platform.architecture` string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }

    /// Default `platform.variant` for this architecture.
    ///
    /// Index entries for arm64 commonly carry `"v8"`; amd64 entries carry
    /// no variant at all.
    pub fn default_variant(&self) -> Option<&'static str> {
        match self {
            Arch::Amd64 => None,
            Arch::Arm64 => Some("v8"),
        }
    }
}

/// Detected host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub arch: Arch,
}

impl Platform {
    /// Detects the host platform at compile time.
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        let arch = Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        let arch = Arch::Arm64;

        Self { arch }
    }

    /// OCI `platform.os` string; the runtime only targets Linux.
    pub fn os(&self) -> &'static str {
        "linux"
    }

    /// Returns true when an index entry matches this host.
    ///
    /// A missing variant on either side matches; an explicit variant must
    /// agree with the architecture's default.
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        if os != self.os() || architecture != self.arch.as_str() {
            return false;
        }
        match (variant, self.arch.default_variant()) {
            (None, _) | (_, None) => true,
            (Some(v), Some(want)) => v == want,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os(), self.arch.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_platform_is_linux() {
        let platform = Platform::host();
        assert_eq!(platform.os(), "linux");
        assert!(platform.to_string().starts_with("linux/"));
    }

    #[test]
    fn variant_matching_is_lenient_about_absence() {
        let arm = Platform { arch: Arch::Arm64 };
        assert!(arm.matches("linux", "arm64", None));
        assert!(arm.matches("linux", "arm64", Some("v8")));
        assert!(!arm.matches("linux", "arm64", Some("v7")));
        assert!(!arm.matches("linux", "amd64", None));
        assert!(!arm.matches("windows", "arm64", None));
    }
}
