//! Layer configuration: INI parsing, inheritance, and the typed view.
//!
//! Every layer may carry a `config.ini`. The *effective* configuration of a
//! layer is the fold of all configurations along its parent chain, deepest
//! ancestor first, with descendants overriding matching keys. The store
//! produces the chain; [`Config::apply`] is the pure merge step.
//!
//! ## Schema
//!
//! | Section | Key | Value |
//! |---------|-----|-------|
//! | `[container]` | `command` | shell-split command line |
//! | | `env` | `KEY=VALUE`, may repeat |
//! | | `workdir` | absolute path |
//! | | `hostname` | string |
//! | | `user` | numeric `uid[:gid]` |
//! | | `tty` | `true` or `false` (default `false`): attach a terminal |
//! | `[namespaces]` | `net` | `host` or `private` (default `private`) |
//! | | `pid`, `ipc`, `uts` | `private` |
//! | `[storage]` | `ephemeral` | `true` or `false` (default `true`) |
//! | `[network]` | `macvlan` | host interface name |
//! | | `macvlan_mac` | MAC address for the moved interface |
//! | `[image]` | `reference`, `digest` | written by the importer |
//!
//! Unknown sections and keys are ignored with a warning; malformed lines and
//! bad values for recognised keys are [`Error::ConfigInvalid`].

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Keys whose values accumulate across the parent chain instead of being
/// replaced. Everything else is last-writer-wins per key.
const MULTI_VALUED: &[(&str, &str)] = &[("container", "env")];

/// Recognised sections and keys; anything else warns on load.
const KNOWN_KEYS: &[(&str, &[&str])] = &[
    (
        "container",
        &["command", "env", "workdir", "hostname", "user", "tty"],
    ),
    ("namespaces", &["net", "pid", "ipc", "uts"]),
    ("storage", &["ephemeral"]),
    ("network", &["macvlan", "macvlan_mac"]),
    ("image", &["reference", "digest"]),
];

/// A parsed configuration: sections mapping to ordered key/value pairs.
///
/// Pairs keep their file order so repeated keys (`env`) survive a
/// parse/serialise round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    sections: BTreeMap<String, Vec<(String, String)>>,
}

impl Config {
    /// Creates an empty configuration. The empty configuration is valid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `config.ini` text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut sections: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        let mut current: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(Error::ConfigInvalid(format!(
                        "line {}: malformed section header '{}'",
                        lineno + 1,
                        line
                    )));
                }
                let name = line[1..line.len() - 1].trim().to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
            } else if let Some((key, value)) = line.split_once('=') {
                let section = current.as_ref().ok_or_else(|| {
                    Error::ConfigInvalid(format!(
                        "line {}: key '{}' appears before any section",
                        lineno + 1,
                        key.trim()
                    ))
                })?;
                sections
                    .get_mut(section)
                    .unwrap()
                    .push((key.trim().to_string(), value.trim().to_string()));
            } else {
                return Err(Error::ConfigInvalid(format!(
                    "line {}: could not parse '{}'",
                    lineno + 1,
                    line
                )));
            }
        }

        let config = Self { sections };
        config.warn_unknown();
        Ok(config)
    }

    /// Loads a configuration file; a missing file yields the empty config.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Serialises the configuration back to INI text.
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        for (section, pairs) in &self.sections {
            if pairs.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", section);
            for (key, value) in pairs {
                let _ = writeln!(out, "{} = {}", key, value);
            }
        }
        out
    }

    /// Writes the configuration to `path`, or removes the file when empty.
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.is_empty() {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            return Ok(());
        }
        fs::write(path, self.to_ini())?;
        Ok(())
    }

    /// True when no section holds any key.
    pub fn is_empty(&self) -> bool {
        self.sections.values().all(|pairs| pairs.is_empty())
    }

    /// Last value set for `section.key`, if any.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section).and_then(|pairs| {
            pairs
                .iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        })
    }

    /// Every value set for `section.key`, in order.
    pub fn get_all(&self, section: &str, key: &str) -> Vec<&str> {
        self.sections
            .get(section)
            .map(|pairs| {
                pairs
                    .iter()
                    .filter(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replaces any existing values for `section.key` with a single value.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let pairs = self.sections.entry(section.to_string()).or_default();
        pairs.retain(|(k, _)| k != key);
        pairs.push((key.to_string(), value.into()));
    }

    /// Appends a value for `section.key`, keeping existing ones.
    pub fn push(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .push((key.to_string(), value.into()));
    }

    /// Applies a descendant configuration on top of this one.
    ///
    /// Scalar keys are overridden; multi-valued keys (`container.env`) are
    /// appended so descendants extend and shadow rather than erase.
    pub fn apply(&mut self, descendant: &Config) {
        for (section, pairs) in &descendant.sections {
            for (key, value) in pairs {
                if MULTI_VALUED.contains(&(section.as_str(), key.as_str())) {
                    self.push(section, key, value.clone());
                } else {
                    self.set(section, key, value.clone());
                }
            }
        }
    }

    /// Folds per-layer configurations, deepest ancestor first, into the
    /// effective configuration.
    pub fn effective<'a>(root_to_leaf: impl IntoIterator<Item = &'a Config>) -> Config {
        let mut merged = Config::new();
        for config in root_to_leaf {
            merged.apply(config);
        }
        merged
    }

    fn warn_unknown(&self) {
        for (section, pairs) in &self.sections {
            match KNOWN_KEYS.iter().find(|(name, _)| name == section) {
                None => warn!(section, "ignoring unknown configuration section"),
                Some((_, keys)) => {
                    for (key, _) in pairs {
                        if !keys.contains(&key.as_str()) {
                            warn!(section, key, "ignoring unknown configuration key");
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Typed View
// =============================================================================

/// Whether a namespace is unshared or inherited from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamespaceMode {
    #[default]
    Private,
    Host,
}

/// Validated view over an effective configuration, consumed by the mount
/// planner and the launcher.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Command line for the init process; empty means "not configured".
    pub command: Vec<String>,
    /// Environment, deduplicated by variable name (later entries win).
    pub env: Vec<(String, String)>,
    /// Working directory inside the container.
    pub workdir: Option<PathBuf>,
    /// Hostname override; defaults to the layer name when absent.
    pub hostname: Option<String>,
    /// `uid` and optional `gid` the init switches to before exec.
    pub user: Option<(u32, Option<u32>)>,
    /// Whether to allocate a pseudo-terminal and attach the caller's
    /// terminal to the container.
    pub tty: bool,
    /// Network namespace mode.
    pub net: NamespaceMode,
    /// Whether the writable layer lives on a tmpfs.
    pub ephemeral: bool,
    /// Host interface to hand to the macvlan helper.
    pub macvlan: Option<String>,
    /// MAC address for the moved macvlan interface.
    pub macvlan_mac: Option<String>,
}

impl Settings {
    /// Validates an effective configuration into a typed view.
    pub fn from_config(config: &Config) -> Result<Self> {
        let command = match config.get("container", "command") {
            Some(raw) => shell_words::split(raw).map_err(|err| {
                Error::ConfigInvalid(format!("container.command: {}", err))
            })?,
            None => Vec::new(),
        };

        let mut env: Vec<(String, String)> = Vec::new();
        for entry in config.get_all("container", "env") {
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                Error::ConfigInvalid(format!("container.env entry '{}' is not KEY=VALUE", entry))
            })?;
            env.retain(|(k, _)| k != key);
            env.push((key.to_string(), value.to_string()));
        }

        let workdir = match config.get("container", "workdir") {
            Some(dir) => {
                let path = PathBuf::from(dir);
                if !path.is_absolute() {
                    return Err(Error::ConfigInvalid(format!(
                        "container.workdir '{}' is not absolute",
                        dir
                    )));
                }
                Some(path)
            }
            None => None,
        };

        let user = match config.get("container", "user") {
            Some(raw) => Some(parse_user(raw)?),
            None => None,
        };

        let tty = match config.get("container", "tty") {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(Error::ConfigInvalid(format!(
                    "container.tty must be 'true' or 'false', got '{}'",
                    other
                )))
            }
        };

        let net = parse_namespace_mode(config, "net", true)?;
        for ns in ["pid", "ipc", "uts"] {
            // Only `private` is recognised for these; reject anything else.
            parse_namespace_mode(config, ns, false)?;
        }

        let ephemeral = match config.get("storage", "ephemeral") {
            None => true,
            Some("true") => true,
            Some("false") => false,
            Some(other) => {
                return Err(Error::ConfigInvalid(format!(
                    "storage.ephemeral must be 'true' or 'false', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            command,
            env,
            workdir,
            hostname: config.get("container", "hostname").map(str::to_string),
            user,
            tty,
            net,
            ephemeral,
            macvlan: config.get("network", "macvlan").map(str::to_string),
            macvlan_mac: config.get("network", "macvlan_mac").map(str::to_string),
        })
    }
}

fn parse_user(raw: &str) -> Result<(u32, Option<u32>)> {
    let (uid_str, gid_str) = match raw.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (raw, None),
    };
    let uid = uid_str
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("container.user uid '{}' is not numeric", uid_str)))?;
    let gid = match gid_str {
        Some(g) => Some(g.parse().map_err(|_| {
            Error::ConfigInvalid(format!("container.user gid '{}' is not numeric", g))
        })?),
        None => None,
    };
    Ok((uid, gid))
}

fn parse_namespace_mode(config: &Config, key: &str, host_allowed: bool) -> Result<NamespaceMode> {
    match config.get("namespaces", key) {
        None | Some("private") => Ok(NamespaceMode::Private),
        Some("host") if host_allowed => Ok(NamespaceMode::Host),
        Some(other) => Err(Error::ConfigInvalid(format!(
            "namespaces.{} has unsupported mode '{}'",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_keys_outside_sections() {
        assert!(Config::parse("command = /bin/sh\n").is_err());
    }

    #[test]
    fn parse_accepts_comments_and_blank_lines() {
        let config = Config::parse("# top\n\n[container]\n; aside\ncommand = /bin/sh\n").unwrap();
        assert_eq!(config.get("container", "command"), Some("/bin/sh"));
    }

    #[test]
    fn repeated_env_keys_accumulate() {
        let config =
            Config::parse("[container]\nenv = A=1\nenv = B=2\n").unwrap();
        assert_eq!(config.get_all("container", "env"), vec!["A=1", "B=2"]);
    }

    #[test]
    fn apply_overrides_scalars_and_appends_env() {
        let mut base = Config::parse("[container]\ncommand = /bin/sh\nenv = A=1\n").unwrap();
        let child = Config::parse("[container]\ncommand = /bin/bash\nenv = B=2\n").unwrap();
        base.apply(&child);
        assert_eq!(base.get("container", "command"), Some("/bin/bash"));
        assert_eq!(base.get_all("container", "env"), vec!["A=1", "B=2"]);
    }

    #[test]
    fn settings_dedupe_env_with_later_entries_winning() {
        let config = Config::parse("[container]\nenv = A=1\nenv = A=2\n").unwrap();
        let settings = Settings::from_config(&config).unwrap();
        assert_eq!(settings.env, vec![("A".to_string(), "2".to_string())]);
    }

    #[test]
    fn tty_defaults_off_and_validates() {
        assert!(!Settings::from_config(&Config::new()).unwrap().tty);

        let on = Config::parse("[container]\ntty = true\n").unwrap();
        assert!(Settings::from_config(&on).unwrap().tty);

        let bad = Config::parse("[container]\ntty = yes\n").unwrap();
        assert!(Settings::from_config(&bad).is_err());
    }

    #[test]
    fn settings_validate_values() {
        let relative = Config::parse("[container]\nworkdir = opt/app\n").unwrap();
        assert!(Settings::from_config(&relative).is_err());

        let bad_eph = Config::parse("[storage]\nephemeral = yes\n").unwrap();
        assert!(Settings::from_config(&bad_eph).is_err());

        let host_pid = Config::parse("[namespaces]\npid = host\n").unwrap();
        assert!(Settings::from_config(&host_pid).is_err());

        let host_net = Config::parse("[namespaces]\nnet = host\n").unwrap();
        assert_eq!(
            Settings::from_config(&host_net).unwrap().net,
            NamespaceMode::Host
        );
    }

    #[test]
    fn ini_round_trip_preserves_repeated_keys() {
        let config =
            Config::parse("[container]\ncommand = /bin/sh -c 'echo hi'\nenv = A=1\nenv = B=2\n")
                .unwrap();
        let reparsed = Config::parse(&config.to_ini()).unwrap();
        assert_eq!(config, reparsed);
    }
}
