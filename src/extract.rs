//! Applying layer archives to a layer's `root/` directory.
//!
//! Runs inside the importer's user-namespaced staging child, where mapped
//! root may chown freely within the subordinate range. Each tar entry is
//! validated against path traversal before anything touches the disk.
//!
//! ## Entry handling
//!
//! - Regular files, directories, symlinks, hardlinks, and fifos unpack as
//!   usual, preserving mode and mtime; ownership is applied afterwards so
//!   out-of-range IDs degrade to a warning instead of aborting the layer.
//! - Character and block devices need privilege real user namespaces do not
//!   have; a refused `mknod` is recorded as a warning and skipped.
//! - `.wh.<name>` whiteouts become the overlayfs deletion marker: a `0/0`
//!   character device at the corresponding path. `.wh..wh..opq` marks its
//!   directory opaque via the `trusted.overlay.opaque` xattr, falling back
//!   to `user.overlay.opaque` where `trusted.*` needs real root.

use crate::constants::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::error::{Error, Result};
use crate::registry::LayerCompression;
use flate2::read::GzDecoder;
use nix::errno::Errno;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, warn};

/// What an extraction did, for logging and degradation reporting.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractSummary {
    /// Entries applied to the layer.
    pub entries: u64,
    /// Device nodes skipped for lack of privilege.
    pub skipped_devices: u64,
}

/// Extracts a layer blob into `root`.
///
/// `id_span` is the number of IDs the active user-namespace map covers;
/// archive owners at or beyond it are clamped to 0 with a warning.
pub fn extract_layer(
    blob: &Path,
    compression: LayerCompression,
    root: &Path,
    id_span: u32,
) -> Result<ExtractSummary> {
    let file = File::open(blob)?;
    let reader: Box<dyn Read> = match compression {
        LayerCompression::None => Box::new(file),
        LayerCompression::Gzip => Box::new(GzDecoder::new(file)),
        LayerCompression::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);

    let mut summary = ExtractSummary::default();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let target = safe_join(root, &entry_path)?;

        let file_name = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");

        if file_name == OPAQUE_WHITEOUT {
            let dir = target.parent().unwrap_or(root);
            fs::create_dir_all(dir)?;
            mark_opaque(dir)?;
            summary.entries += 1;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let marker = target.with_file_name(hidden);
            if let Some(parent) = marker.parent() {
                fs::create_dir_all(parent)?;
            }
            write_whiteout(&marker)?;
            summary.entries += 1;
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Char | EntryType::Block => {
                match unpack_device(&mut entry, &target) {
                    Ok(()) => summary.entries += 1,
                    Err(Error::Permission(reason)) => {
                        warn!(path = %entry_path.display(), reason, "skipping device node");
                        summary.skipped_devices += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => {
                if !entry.unpack_in(root)? {
                    // The tar crate silently skips what it considers
                    // unsafe; we already validated, so treat it as hostile.
                    return Err(Error::PathTraversal {
                        path: entry_path.display().to_string(),
                    });
                }
                apply_ownership(&entry, &target, id_span);
                summary.entries += 1;
            }
        }
    }

    debug!(
        root = %root.display(),
        entries = summary.entries,
        skipped_devices = summary.skipped_devices,
        "layer extracted"
    );
    Ok(summary)
}

/// Joins an archive entry path onto `root`, refusing absolute paths and
/// any `..` component.
pub fn safe_join(root: &Path, entry_path: &Path) -> Result<PathBuf> {
    let mut joined = root.to_path_buf();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: entry_path.display().to_string(),
                })
            }
        }
    }
    Ok(joined)
}

/// Creates the overlayfs whiteout marker: a `0/0` character device.
fn write_whiteout(path: &Path) -> Result<()> {
    match mknod(path, SFlag::S_IFCHR, Mode::from_bits_truncate(0o000), makedev(0, 0)) {
        Ok(()) => Ok(()),
        Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(Error::Extraction {
            digest: String::new(),
            reason: format!("whiteout at {}: {}", path.display(), errno),
        }),
    }
}

/// Marks a directory opaque for overlayfs.
fn mark_opaque(dir: &Path) -> Result<()> {
    match xattr::set(dir, "trusted.overlay.opaque", b"y") {
        Ok(()) => return Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
            // trusted.* needs real root; overlay accepts the user.* twin
            // when mounted with userxattr.
        }
        Err(err) => {
            return Err(Error::Extraction {
                digest: String::new(),
                reason: format!("opaque marker on {}: {}", dir.display(), err),
            })
        }
    }
    xattr::set(dir, "user.overlay.opaque", b"y").map_err(|err| Error::Extraction {
        digest: String::new(),
        reason: format!("opaque marker on {}: {}", dir.display(), err),
    })
}

/// Recreates a device node from its tar header.
fn unpack_device<R: Read>(entry: &mut tar::Entry<'_, R>, target: &Path) -> Result<()> {
    let header = entry.header();
    let kind = if header.entry_type() == EntryType::Char {
        SFlag::S_IFCHR
    } else {
        SFlag::S_IFBLK
    };
    let major = header
        .device_major()?
        .ok_or_else(|| Error::Extraction {
            digest: String::new(),
            reason: format!("device entry {} lacks a major number", target.display()),
        })?;
    let minor = header
        .device_minor()?
        .ok_or_else(|| Error::Extraction {
            digest: String::new(),
            reason: format!("device entry {} lacks a minor number", target.display()),
        })?;
    let mode = Mode::from_bits_truncate(header.mode()? & 0o7777);

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match mknod(target, kind, mode, makedev(major as u64, minor as u64)) {
        Ok(()) => Ok(()),
        Err(Errno::EPERM) | Err(Errno::EINVAL) => Err(Error::Permission(format!(
            "mknod {} {}:{}",
            target.display(),
            major,
            minor
        ))),
        Err(errno) => Err(errno.into()),
    }
}

/// Applies archive ownership, clamping IDs outside the mapped span to 0.
///
/// Hardlinks share their target's inode and are left alone. A refused
/// chown (the single-id fallback map) degrades to a warning.
fn apply_ownership<R: Read>(entry: &tar::Entry<'_, R>, target: &Path, id_span: u32) {
    let header = entry.header();
    if header.entry_type() == EntryType::Link {
        return;
    }
    let clamp = |id: u64, what: &str| -> u32 {
        if id_span > 0 && id >= id_span as u64 {
            warn!(path = %target.display(), id, what, "owner outside mapped range; clamping to 0");
            0
        } else {
            id as u32
        }
    };
    let uid = clamp(header.uid().unwrap_or(0), "uid");
    let gid = clamp(header.gid().unwrap_or(0), "gid");

    if let Err(err) = std::os::unix::fs::lchown(target, Some(uid), Some(gid)) {
        warn!(path = %target.display(), uid, gid, error = %err, "could not apply ownership");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn safe_join_refuses_traversal() {
        let root = Path::new("/store/layer/root");
        assert!(safe_join(root, Path::new("etc/passwd")).is_ok());
        assert!(matches!(
            safe_join(root, Path::new("../etc/passwd")),
            Err(Error::PathTraversal { .. })
        ));
        assert!(matches!(
            safe_join(root, Path::new("/etc/passwd")),
            Err(Error::PathTraversal { .. })
        ));
        assert!(matches!(
            safe_join(root, Path::new("a/../../b")),
            Err(Error::PathTraversal { .. })
        ));
    }

    #[test]
    fn safe_join_keeps_nested_paths_inside_the_root() {
        let root = Path::new("/r");
        assert_eq!(
            safe_join(root, Path::new("./usr/./bin/sh")).unwrap(),
            PathBuf::from("/r/usr/bin/sh")
        );
    }

    #[test]
    fn plain_entries_extract() {
        let temp = TempDir::new().unwrap();
        let tar = build_tar(&[("etc/hostname", b"box\n"), ("srv/file", b"data")]);
        let blob = temp.path().join("layer.tar");
        fs::write(&blob, tar).unwrap();

        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();
        let summary = extract_layer(&blob, LayerCompression::None, &root, 1).unwrap();

        assert_eq!(summary.entries, 2);
        assert_eq!(fs::read(root.join("etc/hostname")).unwrap(), b"box\n");
        assert_eq!(fs::read(root.join("srv/file")).unwrap(), b"data");
    }

    #[test]
    fn gzip_layers_decompress() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let temp = TempDir::new().unwrap();
        let tar = build_tar(&[("hello", b"world")]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let blob = temp.path().join("layer.tar.gz");
        fs::write(&blob, encoder.finish().unwrap()).unwrap();

        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();
        extract_layer(&blob, LayerCompression::Gzip, &root, 1).unwrap();
        assert_eq!(fs::read(root.join("hello")).unwrap(), b"world");
    }

    #[test]
    fn device_entries_degrade_to_warnings_without_privilege() {
        let temp = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Char);
        header.set_size(0);
        header.set_mode(0o666);
        header.set_device_major(1).unwrap();
        header.set_device_minor(3).unwrap();
        header.set_cksum();
        builder
            .append_data(&mut header, "dev/null", std::io::empty())
            .unwrap();
        let blob = temp.path().join("layer.tar");
        fs::write(&blob, builder.into_inner().unwrap()).unwrap();

        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();
        let summary = extract_layer(&blob, LayerCompression::None, &root, 1).unwrap();
        // Unprivileged test runs cannot mknod a real device.
        assert_eq!(summary.skipped_devices, 1);
        assert!(!root.join("dev/null").exists());
    }

    #[test]
    fn symlinks_survive_extraction() {
        let temp = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        builder
            .append_link(&mut header, "bin/sh", "busybox")
            .unwrap();
        let blob = temp.path().join("layer.tar");
        fs::write(&blob, builder.into_inner().unwrap()).unwrap();

        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();
        extract_layer(&blob, LayerCompression::None, &root, 1).unwrap();
        assert_eq!(
            fs::read_link(root.join("bin/sh")).unwrap(),
            PathBuf::from("busybox")
        );
    }
}
