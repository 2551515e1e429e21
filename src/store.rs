//! The layer store: on-disk layout, parent chains, and pid files.
//!
//! A layer is a directory under the store root, identified by its name:
//!
//! ```text
//! ~/.local/share/podder/
//! └── ubuntu/
//!     ├── config.ini   (scoped configuration, optional)
//!     ├── parent       (symlink to the next lower layer, optional)
//!     ├── root/        (the layer's own filesystem contents)
//!     ├── merged/      (mount point for the assembled overlay)
//!     ├── run/         (mount point for the ephemeral tmpfs)
//!     └── init.pid     (present iff a container is believed running)
//! ```
//!
//! Parent edges are symlinks on disk, but in memory a [`Layer`] holds only
//! its own name and path; parents are resolved on demand through the store,
//! so no owning reference cycles can form.
//!
//! ## Atomicity
//!
//! `create` stages a temporary directory and renames it into place, so a
//! crash never leaves a half-made layer under a usable name. `init.pid` is
//! created with `O_CREAT | O_EXCL`, making concurrent `start`s race-free;
//! a pid file whose process is gone is garbage and is reaped on observation.

use crate::config::Config;
use crate::constants::{
    BLOB_CACHE_DIR, CONFIG_FILE, LAYER_NAME_VALID_CHARS, MERGED_DIR, PARENT_LINK, PID_FILE,
    ROOT_DIR, RUN_DIR, STALE_CLAIM_GRACE, STORE_DIR_NAME, STORE_ENV,
};
use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Handle to one layer in the store.
///
/// Holds no parent reference; use [`LayerStore::parent_of`] or
/// [`LayerStore::chain`] to walk the ancestry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    name: String,
    path: PathBuf,
}

impl Layer {
    /// The layer's name, unique within its store.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The layer directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The layer's own filesystem contents (an overlay lower or upper).
    pub fn root_dir(&self) -> PathBuf {
        self.path.join(ROOT_DIR)
    }

    /// Mount point where the assembled union is presented.
    pub fn merged_dir(&self) -> PathBuf {
        self.path.join(MERGED_DIR)
    }

    /// Mount point for the ephemeral tmpfs (overlay upper/work and /run).
    pub fn run_dir(&self) -> PathBuf {
        self.path.join(RUN_DIR)
    }

    /// Path of the layer's own `config.ini`.
    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    /// Path of the pid file.
    pub fn pid_path(&self) -> PathBuf {
        self.path.join(PID_FILE)
    }

    /// Path of the parent symlink.
    pub fn parent_link(&self) -> PathBuf {
        self.path.join(PARENT_LINK)
    }

    /// Loads the layer's own (not effective) configuration.
    pub fn load_config(&self) -> Result<Config> {
        Config::load(&self.config_path())
    }

    /// Creates the `root/`, `merged/`, and `run/` subdirectories if absent.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.root_dir(), self.merged_dir(), self.run_dir()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// The on-disk layer store.
#[derive(Debug, Clone)]
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    /// Opens (creating if needed) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "layer store opened");
        Ok(Self { root })
    }

    /// Opens the store at the default location.
    ///
    /// `$PODDER_STORE` wins, then `$XDG_DATA_HOME/podder`, then
    /// `~/.local/share/podder`.
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_root())
    }

    /// The default store root for this user.
    pub fn default_root() -> PathBuf {
        if let Some(path) = std::env::var_os(STORE_ENV) {
            return PathBuf::from(path);
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(STORE_DIR_NAME)
    }

    /// The store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for in-flight blob downloads.
    pub fn blob_cache_dir(&self) -> PathBuf {
        self.root.join(BLOB_CACHE_DIR)
    }

    /// True when a layer of this name exists.
    pub fn contains(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.root.join(name).is_dir()
    }

    /// Resolves a layer by name.
    pub fn resolve(&self, name: &str) -> Result<Layer> {
        validate_name(name)?;
        let path = self.root.join(name);
        if !path.is_dir() {
            return Err(Error::LayerNotFound(name.to_string()));
        }
        Ok(Layer {
            name: name.to_string(),
            path,
        })
    }

    /// Lists every layer in the store, sorted by name.
    pub fn list(&self) -> Result<Vec<Layer>> {
        let mut layers = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            // Skip the blob cache and staging directories.
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            layers.push(Layer {
                path: entry.path(),
                name,
            });
        }
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(layers)
    }

    /// Resolves a layer's parent name, if it has one.
    ///
    /// The parent edge must point at a layer within this store; anything
    /// else is [`Error::BrokenParent`].
    pub fn parent_of(&self, layer: &Layer) -> Result<Option<String>> {
        let link = layer.parent_link();
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::BrokenParent {
                    layer: layer.name.clone(),
                    reason: err.to_string(),
                })
            }
        };
        let target = if target.is_absolute() {
            target
        } else {
            layer.path().join(target)
        };
        if target.parent() != Some(self.root.as_path()) {
            return Err(Error::BrokenParent {
                layer: layer.name.clone(),
                reason: format!("'{}' is outside the store", target.display()),
            });
        }
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::BrokenParent {
                layer: layer.name.clone(),
                reason: "unreadable parent name".to_string(),
            })?
            .to_string();
        if !self.contains(&name) {
            return Err(Error::BrokenParent {
                layer: layer.name.clone(),
                reason: format!("parent layer '{}' does not exist", name),
            });
        }
        Ok(Some(name))
    }

    /// Resolves the parent chain `[L0, L1, …, Lk]`, where `L0` is the
    /// requested layer and `Lk` is a root.
    pub fn chain(&self, name: &str) -> Result<Vec<Layer>> {
        let mut chain = vec![self.resolve(name)?];
        let mut seen: HashSet<String> = HashSet::from([name.to_string()]);

        while let Some(parent) = self.parent_of(chain.last().unwrap())? {
            if !seen.insert(parent.clone()) {
                return Err(Error::Cycle(parent));
            }
            chain.push(self.resolve(&parent)?);
        }
        Ok(chain)
    }

    /// Creates a layer, staging in a temporary directory and renaming into
    /// place so concurrent creates never expose a partial layer.
    pub fn create(
        &self,
        name: &str,
        parent: Option<&str>,
        config: Option<&Config>,
    ) -> Result<Layer> {
        validate_name(name)?;
        let parent = match parent {
            Some(parent) => Some(self.resolve(parent)?),
            None => None,
        };
        let path = self.root.join(name);
        if path.exists() {
            return Err(Error::LayerExists(name.to_string()));
        }

        let staging = self.root.join(format!(".tmp-{}", uuid::Uuid::now_v7()));
        let result = (|| -> Result<()> {
            for dir in [ROOT_DIR, MERGED_DIR, RUN_DIR] {
                fs::create_dir_all(staging.join(dir))?;
            }
            if let Some(parent) = &parent {
                std::os::unix::fs::symlink(parent.path(), staging.join(PARENT_LINK))?;
            }
            if let Some(config) = config {
                config.save(&staging.join(CONFIG_FILE))?;
            }
            fs::rename(&staging, &path).map_err(|err| {
                if path.exists() {
                    Error::LayerExists(name.to_string())
                } else {
                    err.into()
                }
            })
        })();

        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result?;

        debug!(layer = name, parent = ?parent.as_ref().map(Layer::name), "layer created");
        Ok(Layer {
            name: name.to_string(),
            path,
        })
    }

    /// Removes a layer.
    ///
    /// Refuses while a container is running on it or while any other layer
    /// names it as parent.
    pub fn remove(&self, name: &str) -> Result<()> {
        let layer = self.resolve(name)?;
        if let Some(pid) = self.is_running(name)? {
            return Err(Error::InUse {
                name: name.to_string(),
                pid: pid.as_raw(),
            });
        }
        let children = self.children_of(name)?;
        if !children.is_empty() {
            return Err(Error::HasChildren {
                name: name.to_string(),
                children,
            });
        }
        fs::remove_dir_all(layer.path())?;
        debug!(layer = name, "layer removed");
        Ok(())
    }

    /// Re-points a layer's parent edge, as a re-pull of a moved tag does.
    pub fn set_parent(&self, name: &str, parent: Option<&str>) -> Result<()> {
        let layer = self.resolve(name)?;
        let parent = match parent {
            Some(parent) => Some(self.resolve(parent)?),
            None => None,
        };
        match fs::remove_file(layer.parent_link()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = parent {
            std::os::unix::fs::symlink(parent.path(), layer.parent_link())?;
        }
        Ok(())
    }

    /// Names of the layers whose parent edge points at `name`.
    pub fn children_of(&self, name: &str) -> Result<Vec<String>> {
        let mut children = Vec::new();
        for layer in self.list()? {
            if layer.name() == name {
                continue;
            }
            match self.parent_of(&layer) {
                Ok(Some(parent)) if parent == name => children.push(layer.name().to_string()),
                // A sibling's broken edge must not block this removal.
                Ok(_) | Err(Error::BrokenParent { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(children)
    }

    /// Computes the effective configuration of a layer: the fold of every
    /// configuration along its chain, deepest ancestor first.
    pub fn effective_config(&self, name: &str) -> Result<Config> {
        let chain = self.chain(name)?;
        let configs = chain
            .iter()
            .rev()
            .map(Layer::load_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Config::effective(configs.iter()))
    }

    // =========================================================================
    // Pid Files
    // =========================================================================

    /// Claims the layer's pid file with an exclusive create.
    ///
    /// A stale file (process gone) is reaped first; a live one means a
    /// container is already running and the claim fails `AlreadyRunning`.
    pub fn acquire_pid_file(&self, name: &str) -> Result<()> {
        let layer = self.resolve(name)?;
        // Observation reaps a dead pid, freeing the slot.
        self.is_running(name)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(layer.pid_path())
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::AlreadyRunning(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Records the init pid for a layer. The pid file must already be
    /// claimed via [`LayerStore::acquire_pid_file`].
    pub fn set_running(&self, name: &str, pid: Pid) -> Result<()> {
        let layer = self.resolve(name)?;
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(layer.pid_path())?;
        writeln!(file, "{}", pid.as_raw())?;
        Ok(())
    }

    /// Removes the pid file; absent is fine.
    pub fn clear_running(&self, name: &str) -> Result<()> {
        let layer = self.resolve(name)?;
        match fs::remove_file(layer.pid_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the recorded init pid iff that process still exists.
    ///
    /// A pid file naming a dead process is removed on observation. A
    /// claimed-but-unfilled pid file (a start in progress) reports `None`
    /// and keeps blocking new claims — unless it has outlived
    /// [`STALE_CLAIM_GRACE`], in which case the launcher that claimed it
    /// died and the claim is reaped so the layer never stays locked.
    pub fn is_running(&self, name: &str) -> Result<Option<Pid>> {
        let layer = self.resolve(name)?;
        let text = match fs::read_to_string(layer.pid_path()) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let pid = match text.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Pid::from_raw(pid),
            _ => {
                let abandoned = fs::metadata(layer.pid_path())
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .and_then(|modified| modified.elapsed().ok())
                    .map_or(false, |age| age > STALE_CLAIM_GRACE);
                if abandoned {
                    warn!(layer = name, "reaping abandoned pid file claim");
                    let _ = fs::remove_file(layer.pid_path());
                }
                return Ok(None);
            }
        };
        match kill(pid, None) {
            // EPERM still proves the process exists.
            Ok(()) | Err(Errno::EPERM) => Ok(Some(pid)),
            Err(Errno::ESRCH) => {
                warn!(layer = name, pid = pid.as_raw(), "reaping stale pid file");
                let _ = fs::remove_file(layer.pid_path());
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || !name.chars().all(|c| LAYER_NAME_VALID_CHARS.contains(c))
    {
        return Err(Error::InvalidLayerName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LayerStore) {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path().join("store")).unwrap();
        (temp, store)
    }

    #[test]
    fn create_and_resolve_round_trip() {
        let (_temp, store) = store();
        let layer = store.create("base", None, None).unwrap();
        assert!(layer.root_dir().is_dir());
        assert!(layer.merged_dir().is_dir());
        assert!(layer.run_dir().is_dir());
        assert_eq!(store.resolve("base").unwrap().name(), "base");
    }

    #[test]
    fn create_refuses_duplicates_and_bad_names() {
        let (_temp, store) = store();
        store.create("base", None, None).unwrap();
        assert!(matches!(
            store.create("base", None, None),
            Err(Error::LayerExists(_))
        ));
        assert!(matches!(
            store.create("bad/name", None, None),
            Err(Error::InvalidLayerName(_))
        ));
        assert!(matches!(
            store.create(".hidden", None, None),
            Err(Error::InvalidLayerName(_))
        ));
    }

    #[test]
    fn create_requires_existing_parent() {
        let (_temp, store) = store();
        assert!(matches!(
            store.create("child", Some("ghost"), None),
            Err(Error::LayerNotFound(_))
        ));
    }

    #[test]
    fn chain_walks_to_the_root() {
        let (_temp, store) = store();
        store.create("a", None, None).unwrap();
        store.create("b", Some("a"), None).unwrap();
        store.create("c", Some("b"), None).unwrap();

        let names: Vec<_> = store
            .chain("c")
            .unwrap()
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        assert_eq!(names, ["c", "b", "a"]);
    }

    #[test]
    fn chain_detects_cycles() {
        let (_temp, store) = store();
        let a = store.create("a", None, None).unwrap();
        store.create("b", Some("a"), None).unwrap();
        // Close the loop behind the store's back.
        std::os::unix::fs::symlink(store.root().join("b"), a.parent_link()).unwrap();
        assert!(matches!(store.chain("b"), Err(Error::Cycle(_))));
    }

    #[test]
    fn chain_reports_broken_parents() {
        let (_temp, store) = store();
        let a = store.create("a", None, None).unwrap();
        std::os::unix::fs::symlink("/nowhere/at/all", a.parent_link()).unwrap();
        assert!(matches!(store.chain("a"), Err(Error::BrokenParent { .. })));
    }

    #[test]
    fn remove_refuses_layers_with_children() {
        let (_temp, store) = store();
        store.create("a", None, None).unwrap();
        store.create("b", Some("a"), None).unwrap();
        assert!(matches!(
            store.remove("a"),
            Err(Error::HasChildren { .. })
        ));
        store.remove("b").unwrap();
        store.remove("a").unwrap();
        assert!(!store.contains("a"));
    }

    #[test]
    fn pid_file_claim_is_exclusive() {
        let (_temp, store) = store();
        store.create("a", None, None).unwrap();
        store.acquire_pid_file("a").unwrap();
        assert!(matches!(
            store.acquire_pid_file("a"),
            Err(Error::AlreadyRunning(_))
        ));
        // A claimed but unfilled pid file reads as stopped.
        assert!(store.is_running("a").unwrap().is_none());
        store.clear_running("a").unwrap();
        store.acquire_pid_file("a").unwrap();
    }

    #[test]
    fn stale_pid_files_are_reaped_on_observation() {
        let (_temp, store) = store();
        let layer = store.create("a", None, None).unwrap();
        // No pid anywhere near i32::MAX should exist.
        fs::write(layer.pid_path(), format!("{}\n", i32::MAX - 1)).unwrap();
        assert!(store.is_running("a").unwrap().is_none());
        assert!(!layer.pid_path().exists());
    }

    #[test]
    fn abandoned_claims_are_reaped_after_the_grace_period() {
        let (_temp, store) = store();
        let layer = store.create("a", None, None).unwrap();
        store.acquire_pid_file("a").unwrap();

        // A fresh claim blocks a second start.
        assert!(matches!(
            store.acquire_pid_file("a"),
            Err(Error::AlreadyRunning(_))
        ));

        // Age the claim past the grace period; the slot frees up.
        let stale = std::time::SystemTime::now() - (STALE_CLAIM_GRACE + STALE_CLAIM_GRACE);
        OpenOptions::new()
            .write(true)
            .open(layer.pid_path())
            .unwrap()
            .set_modified(stale)
            .unwrap();
        assert!(store.is_running("a").unwrap().is_none());
        store.acquire_pid_file("a").unwrap();
    }

    #[test]
    fn own_pid_reads_as_running() {
        let (_temp, store) = store();
        store.create("a", None, None).unwrap();
        store.acquire_pid_file("a").unwrap();
        store.set_running("a", Pid::this()).unwrap();
        assert_eq!(store.is_running("a").unwrap(), Some(Pid::this()));
    }

    #[test]
    fn effective_config_folds_root_to_leaf() {
        let (_temp, store) = store();
        let base = Config::parse("[container]\ncommand = /bin/sh\nenv = A=1\n").unwrap();
        let top = Config::parse("[container]\ncommand = /bin/bash\nenv = B=2\n").unwrap();
        store.create("a", None, Some(&base)).unwrap();
        store.create("b", Some("a"), Some(&top)).unwrap();

        let effective = store.effective_config("b").unwrap();
        assert_eq!(effective.get("container", "command"), Some("/bin/bash"));
        assert_eq!(effective.get_all("container", "env"), vec!["A=1", "B=2"]);
    }
}
