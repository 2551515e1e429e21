//! Mount planning and execution for the container root filesystem.
//!
//! From a layer chain `[L0 … Lk]` the planner derives the overlay layout:
//!
//! - lowerdirs `L1/root : … : Lk/root` (uppermost first, overlay syntax);
//! - **ephemeral** (default): a fresh tmpfs on `L0/run` supplies `upper/`
//!   and `work/`, and `L0/root` joins the lowerdirs — the writable layer is
//!   volatile;
//! - **persistent**: `L0/root` is the upperdir and `L0/run/work` the
//!   workdir (same filesystem, as overlayfs requires);
//! - a chain of one layer with nothing to overlay degenerates to a bind
//!   mount.
//!
//! The union lands on `L0/merged`, which the launcher pivots into. The
//! auxiliary mounts inside the new root (`/dev`, `/proc`, `/sys`, `/run`,
//! `/tmp`, `/etc` binds) live here too. Every mount in the plan is
//! `MS_NOSUID` unless a bind dictates otherwise, and a failed step unwinds
//! whatever this module already mounted, in reverse order.

use crate::config::Settings;
use crate::constants::{DEV_NODES, ETC_BINDS, OLD_ROOT_DIR};
use crate::error::{Error, Result};
use crate::store::Layer;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The computed overlay layout for one container start.
#[derive(Debug, Clone)]
pub struct MountPlan {
    /// Mount point of the assembled union (`L0/merged`).
    pub merged: PathBuf,
    /// `L0/run`: tmpfs mount point when ephemeral, plain directory otherwise.
    pub run_dir: PathBuf,
    /// Overlay lowerdirs, uppermost first. Empty means bind-mount `upper`.
    pub lower: Vec<PathBuf>,
    /// Overlay upperdir (tmpfs-backed when ephemeral).
    pub upper: PathBuf,
    /// Overlay workdir.
    pub work: PathBuf,
    /// Whether the writable layer lives on a tmpfs.
    pub ephemeral: bool,
}

impl MountPlan {
    /// Builds the plan for a chain, `L0` first.
    pub fn build(chain: &[Layer], settings: &Settings) -> Self {
        let top = &chain[0];
        let run_dir = top.run_dir();

        let mut lower: Vec<PathBuf> = chain[1..].iter().map(Layer::root_dir).collect();
        let (upper, work) = if settings.ephemeral {
            lower.insert(0, top.root_dir());
            (run_dir.join("upper"), run_dir.join("work"))
        } else {
            (top.root_dir(), run_dir.join("work"))
        };

        Self {
            merged: top.merged_dir(),
            run_dir,
            lower,
            upper,
            work,
            ephemeral: settings.ephemeral,
        }
    }

    /// The overlayfs option string, or `None` when a bind mount suffices.
    ///
    /// Tmpfs uppers are ours, so regular (trusted) xattrs work; disk-backed
    /// uppers carry `userxattr` to match what an unprivileged extractor
    /// could write.
    pub fn overlay_options(&self) -> Option<String> {
        if self.lower.is_empty() {
            return None;
        }
        let lowerdir = self
            .lower
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let userxattr = if self.ephemeral { "" } else { ",userxattr" };
        Some(format!(
            "lowerdir={},upperdir={},workdir={},xino=off{}",
            lowerdir,
            self.upper.display(),
            self.work.display(),
            userxattr
        ))
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Records targets as they are mounted so a failure can unwind them.
struct Mounter {
    mounted: Vec<PathBuf>,
}

impl Mounter {
    fn new() -> Self {
        Self {
            mounted: Vec::new(),
        }
    }

    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data).map_err(|errno| Error::MountFailed {
            target: target.to_path_buf(),
            reason: errno.to_string(),
        })?;
        self.mounted.push(target.to_path_buf());
        Ok(())
    }

    /// Lazily unmounts everything this mounter mounted, newest first.
    fn rollback(&mut self) {
        for target in self.mounted.drain(..).rev() {
            if let Err(errno) = umount2(&target, MntFlags::MNT_DETACH) {
                warn!(target = %target.display(), error = %errno, "rollback unmount failed");
            }
        }
    }
}

/// Runs `steps` with rollback on failure; mounts stay up on success.
fn with_rollback(steps: impl FnOnce(&mut Mounter) -> Result<()>) -> Result<()> {
    let mut mounter = Mounter::new();
    match steps(&mut mounter) {
        Ok(()) => Ok(()),
        Err(err) => {
            mounter.rollback();
            Err(err)
        }
    }
}

/// Makes mount propagation private so nothing we do leaks to the host.
pub fn make_propagation_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|errno| Error::MountFailed {
        target: PathBuf::from("/"),
        reason: format!("making propagation private: {}", errno),
    })
}

/// Assembles the union at `plan.merged`. Runs inside the new mount
/// namespace, before pivoting.
pub fn mount_rootfs(plan: &MountPlan) -> Result<()> {
    with_rollback(|m| {
        if plan.ephemeral {
            m.mount(
                None,
                &plan.run_dir,
                Some("tmpfs"),
                MsFlags::MS_NOSUID,
                Some("mode=777"),
            )?;
        }
        fs::create_dir_all(&plan.upper)?;
        fs::create_dir_all(&plan.work)?;

        match plan.overlay_options() {
            Some(options) => m.mount(
                None,
                &plan.merged,
                Some("overlay"),
                MsFlags::MS_NOSUID,
                Some(options.as_str()),
            )?,
            None => m.mount(
                Some(plan.upper.as_path()),
                &plan.merged,
                None,
                MsFlags::MS_BIND,
                None,
            )?,
        }

        // The pivot parks the old root inside the union's writable layer.
        fs::create_dir_all(plan.merged.join(OLD_ROOT_DIR))?;
        debug!(merged = %plan.merged.display(), "rootfs assembled");
        Ok(())
    })
}

/// Populates `/dev` inside the pivoted root: tmpfs, standard symlinks,
/// bind-mounted host nodes, `/dev/shm`, and a fresh `devpts` instance.
pub fn populate_dev() -> Result<()> {
    with_rollback(|m| {
        // The overlay upper is writable, so missing mount points can be
        // created even for sparse hand-made layers.
        fs::create_dir_all("/dev")?;
        // mode=755 keeps the sticky bit off; a sticky /dev refuses writes
        // to other users' device nodes.
        m.mount(
            None,
            Path::new("/dev"),
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=755"),
        )?;

        std::os::unix::fs::symlink("/proc/self/fd", "/dev/fd")?;
        std::os::unix::fs::symlink("/proc/self/fd/0", "/dev/stdin")?;
        std::os::unix::fs::symlink("/proc/self/fd/1", "/dev/stdout")?;
        std::os::unix::fs::symlink("/proc/self/fd/2", "/dev/stderr")?;

        fs::create_dir("/dev/shm")?;
        m.mount(
            None,
            Path::new("/dev/shm"),
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=1777"),
        )?;

        for node in DEV_NODES {
            let target = PathBuf::from("/dev").join(node);
            fs::File::create(&target)?;
            let source = PathBuf::from("/").join(OLD_ROOT_DIR).join("dev").join(node);
            m.mount(Some(source.as_path()), &target, None, MsFlags::MS_BIND, None)?;
        }

        fs::create_dir("/dev/mqueue")?;
        m.mount(
            None,
            Path::new("/dev/mqueue"),
            Some("mqueue"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None,
        )?;

        fs::create_dir("/dev/pts")?;
        m.mount(
            None,
            Path::new("/dev/pts"),
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("newinstance,mode=620,ptmxmode=666,gid=5"),
        )?;
        std::os::unix::fs::symlink("pts/ptmx", "/dev/ptmx")?;
        Ok(())
    })
}

/// Mounts what only pid 1 of the new pid namespace can: `/proc`, `/sys`,
/// the `/etc` binds, `/tmp`, and `/run`.
///
/// `run_source` is the host path of the tmpfs backing the overlay upper;
/// when set it is re-exposed at `/run`, otherwise `/run` is a fresh tmpfs.
pub fn mount_system(net_private: bool, run_source: Option<&Path>) -> Result<()> {
    with_rollback(|m| {
        for dir in ["/proc", "/sys", "/tmp", "/run"] {
            fs::create_dir_all(dir)?;
        }
        m.mount(
            None,
            Path::new("/proc"),
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None,
        )?;

        mount_sys(m, net_private)?;

        for name in ETC_BINDS.iter().copied() {
            if let Err(err) = bind_etc_file(m, name) {
                warn!(file = name, error = %err, "skipping /etc bind");
            }
        }

        m.mount(
            None,
            Path::new("/tmp"),
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=1777"),
        )?;

        match run_source {
            Some(source) => {
                let old = old_root_path(source);
                m.mount(Some(old.as_path()), Path::new("/run"), None, MsFlags::MS_BIND, None)?;
            }
            None => m.mount(
                None,
                Path::new("/run"),
                Some("tmpfs"),
                MsFlags::MS_NOSUID,
                Some("mode=777"),
            )?,
        }
        Ok(())
    })
}

/// Binds the container's pty slave to `/dev/console`, so programs that
/// open the console reach the attached terminal.
pub fn bind_console(slave: &Path) -> Result<()> {
    fs::File::create("/dev/console")?;
    mount(
        Some(slave),
        "/dev/console",
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|errno| Error::MountFailed {
        target: PathBuf::from("/dev/console"),
        reason: errno.to_string(),
    })
}

/// Detaches and removes the parked old root. The container must not keep
/// a handle back to the host filesystem.
pub fn detach_old_root() -> Result<()> {
    let old_root = PathBuf::from("/").join(OLD_ROOT_DIR);
    umount2(&old_root, MntFlags::MNT_DETACH).map_err(|errno| Error::MountFailed {
        target: old_root.clone(),
        reason: format!("detaching old root: {}", errno),
    })?;
    fs::remove_dir(&old_root)?;
    Ok(())
}

/// A fresh read-only sysfs needs a private network namespace; otherwise
/// fall back to a recursive bind of the host's `/sys`.
fn mount_sys(m: &mut Mounter, net_private: bool) -> Result<()> {
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    if net_private {
        if m.mount(
            None,
            Path::new("/sys"),
            Some("sysfs"),
            flags | MsFlags::MS_RDONLY,
            None,
        )
        .is_ok()
        {
            return Ok(());
        }
    }
    let host_sys = PathBuf::from("/").join(OLD_ROOT_DIR).join("sys");
    m.mount(
        Some(host_sys.as_path()),
        Path::new("/sys"),
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )?;
    // Locked mounts can refuse the read-only remount; record and move on.
    if let Err(errno) = mount(
        None::<&str>,
        "/sys",
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    ) {
        warn!(error = %errno, "could not make /sys read-only");
    }
    Ok(())
}

/// Binds one host `/etc` file into the container, resolving host-side
/// symlinks against the parked old root so e.g. a resolv.conf pointing
/// into /run keeps working.
fn bind_etc_file(m: &mut Mounter, name: &str) -> Result<()> {
    let host_path = PathBuf::from("/").join(OLD_ROOT_DIR).join("etc").join(name);
    let source = match fs::read_link(&host_path) {
        Ok(link) if link.is_absolute() => old_root_path(&link),
        _ => host_path,
    };
    if !source.exists() {
        return Ok(());
    }

    let target = PathBuf::from("/etc").join(name);
    fs::create_dir_all("/etc")?;
    fs::File::create(&target)?;
    m.mount(Some(source.as_path()), &target, None, MsFlags::MS_BIND, None)
}

/// Rewrites an absolute host path to its location under the parked root.
fn old_root_path(path: &Path) -> PathBuf {
    PathBuf::from("/")
        .join(OLD_ROOT_DIR)
        .join(path.strip_prefix("/").unwrap_or(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::LayerStore;
    use tempfile::TempDir;

    fn settings(ephemeral: bool) -> Settings {
        let ini = format!("[storage]\nephemeral = {}\n", ephemeral);
        Settings::from_config(&Config::parse(&ini).unwrap()).unwrap()
    }

    fn three_layer_chain(store: &LayerStore) -> Vec<Layer> {
        store.create("base", None, None).unwrap();
        store.create("mid", Some("base"), None).unwrap();
        store.create("top", Some("mid"), None).unwrap();
        store.chain("top").unwrap()
    }

    #[test]
    fn ephemeral_plan_puts_the_upper_on_the_run_tmpfs() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path()).unwrap();
        let chain = three_layer_chain(&store);

        let plan = MountPlan::build(&chain, &settings(true));
        assert!(plan.ephemeral);
        assert_eq!(plan.upper, chain[0].run_dir().join("upper"));
        assert_eq!(plan.work, chain[0].run_dir().join("work"));
        // The top layer's own root becomes the uppermost lower.
        assert_eq!(
            plan.lower,
            vec![
                chain[0].root_dir(),
                chain[1].root_dir(),
                chain[2].root_dir()
            ]
        );
    }

    #[test]
    fn persistent_plan_writes_into_the_top_layer() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path()).unwrap();
        let chain = three_layer_chain(&store);

        let plan = MountPlan::build(&chain, &settings(false));
        assert_eq!(plan.upper, chain[0].root_dir());
        assert_eq!(plan.work, chain[0].run_dir().join("work"));
        assert_eq!(plan.lower, vec![chain[1].root_dir(), chain[2].root_dir()]);

        let options = plan.overlay_options().unwrap();
        assert!(options.contains("userxattr"));
        assert!(options.contains(&format!(
            "lowerdir={}:{}",
            chain[1].root_dir().display(),
            chain[2].root_dir().display()
        )));
    }

    #[test]
    fn ephemeral_overlay_options_use_trusted_xattrs() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path()).unwrap();
        let chain = three_layer_chain(&store);

        let options = MountPlan::build(&chain, &settings(true))
            .overlay_options()
            .unwrap();
        assert!(!options.contains("userxattr"));
        assert!(options.contains("xino=off"));
    }

    #[test]
    fn single_persistent_layer_degenerates_to_a_bind() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path()).unwrap();
        store.create("solo", None, None).unwrap();
        let chain = store.chain("solo").unwrap();

        let plan = MountPlan::build(&chain, &settings(false));
        assert!(plan.lower.is_empty());
        assert!(plan.overlay_options().is_none());
    }

    #[test]
    fn single_ephemeral_layer_still_overlays() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path()).unwrap();
        store.create("solo", None, None).unwrap();
        let chain = store.chain("solo").unwrap();

        let plan = MountPlan::build(&chain, &settings(true));
        assert_eq!(plan.lower.len(), 1);
        assert!(plan.overlay_options().is_some());
    }

    #[test]
    fn old_root_paths_are_rewritten() {
        assert_eq!(
            old_root_path(Path::new("/run/systemd/resolve/stub-resolv.conf")),
            PathBuf::from("/old_root/run/systemd/resolve/stub-resolv.conf")
        );
    }
}
