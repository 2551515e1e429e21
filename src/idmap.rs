//! Subordinate UID/GID ranges and user-namespace ID maps.
//!
//! A rootless container maps container ID 0 to the invoking user and lays
//! every range allocated in `/etc/subuid` / `/etc/subgid` end to end from
//! container ID 1 upward. A user may own several ranges; all of them are
//! concatenated into the map, so the container sees the full sum. Mapping
//! 0 to the invoking user (rather than to a subordinate ID) keeps the
//! user-owned layer store writable from inside the namespace.
//!
//! Multi-range maps cannot be written by an unprivileged process directly;
//! they go through the setuid `newuidmap`/`newgidmap` helpers. When the
//! helpers are missing or refuse, the fallback is the one map the kernel
//! does allow us to write ourselves: the single line mapping container ID
//! 0 to the invoking user, with `setgroups` denied first.

use crate::constants::{NEWGIDMAP, NEWUIDMAP, SUBGID_PATH, SUBUID_PATH};
use crate::error::{Error, Result};
use nix::unistd::{self, Pid, User};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// One subordinate ID range from `/etc/subuid` or `/etc/subgid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIdRange {
    pub start: u32,
    pub count: u32,
}

/// One `uid_map`/`gid_map` line: `inside outside count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub inside: u32,
    pub outside: u32,
    pub count: u32,
}

/// The UID and GID maps prepared for a container.
#[derive(Debug, Clone)]
pub struct IdMaps {
    pub uid: Vec<IdMapping>,
    pub gid: Vec<IdMapping>,
}

impl IdMaps {
    /// Collects the invoking user's subordinate ranges into maps.
    pub fn for_invoking_user() -> Result<Self> {
        let uid = unistd::geteuid();
        let gid = unistd::getegid();
        let user = User::from_uid(uid)
            .map_err(Error::from)?
            .map(|u| u.name);

        let sub_uids = parse_subid_file(Path::new(SUBUID_PATH), user.as_deref(), uid.as_raw())?;
        let sub_gids = parse_subid_file(Path::new(SUBGID_PATH), user.as_deref(), gid.as_raw())?;

        Ok(Self {
            uid: mappings_from_ranges(uid.as_raw(), &sub_uids),
            gid: mappings_from_ranges(gid.as_raw(), &sub_gids),
        })
    }

    /// Total number of IDs the uid map covers.
    pub fn uid_span(&self) -> u32 {
        self.uid.iter().map(|m| m.count).sum()
    }

    /// Installs the maps for `pid`.
    ///
    /// Maps wider than the caller's own ID need the privileged helpers;
    /// when they are unavailable the fallback is the direct single-id map.
    pub fn apply(&self, pid: Pid) -> Result<()> {
        let uid_ok = self.uid.len() > 1 && run_map_helper(NEWUIDMAP, pid, &self.uid);
        let gid_ok = self.gid.len() > 1 && run_map_helper(NEWGIDMAP, pid, &self.gid);

        if uid_ok && gid_ok {
            debug!(
                pid = pid.as_raw(),
                uid_span = self.uid_span(),
                "subordinate id maps installed"
            );
            return Ok(());
        }
        if self.uid.len() > 1 && !uid_ok {
            warn!(
                pid = pid.as_raw(),
                "newuidmap unavailable; container is limited to a single-id map"
            );
        }

        // The kernel lets an unprivileged process map exactly its own id,
        // after denying setgroups.
        if !gid_ok {
            write_proc(pid, "setgroups", "deny")?;
            write_proc(
                pid,
                "gid_map",
                &format!("0 {} 1", unistd::getegid().as_raw()),
            )?;
        }
        if !uid_ok {
            write_proc(
                pid,
                "uid_map",
                &format!("0 {} 1", unistd::geteuid().as_raw()),
            )?;
        }
        Ok(())
    }
}

/// Builds the map: container ID 0 is the invoking user's own ID, and the
/// subordinate ranges lie end to end from container ID 1.
pub fn mappings_from_ranges(own_id: u32, ranges: &[SubIdRange]) -> Vec<IdMapping> {
    let mut mappings = vec![IdMapping {
        inside: 0,
        outside: own_id,
        count: 1,
    }];
    let mut inside = 1u32;
    for range in ranges {
        if range.count == 0 {
            continue;
        }
        mappings.push(IdMapping {
            inside,
            outside: range.start,
            count: range.count,
        });
        inside = inside.saturating_add(range.count);
    }
    mappings
}

/// Parses a `name_or_id:start:count` file, keeping *every* matching entry.
fn parse_subid_file(path: &Path, user: Option<&str>, id: u32) -> Result<Vec<SubIdRange>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    Ok(parse_subid_entries(&text, user, id))
}

fn parse_subid_entries(text: &str, user: Option<&str>, id: u32) -> Vec<SubIdRange> {
    let id_str = id.to_string();
    let mut ranges = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, ':');
        let (who, start, count) = match (fields.next(), fields.next(), fields.next()) {
            (Some(who), Some(start), Some(count)) => (who, start, count),
            _ => continue,
        };
        if Some(who) != user && who != id_str {
            continue;
        }
        if let (Ok(start), Ok(count)) = (start.trim().parse(), count.trim().parse()) {
            ranges.push(SubIdRange { start, count });
        }
    }
    ranges
}

fn run_map_helper(helper: &str, pid: Pid, mappings: &[IdMapping]) -> bool {
    let mut command = Command::new(helper);
    command.arg(pid.as_raw().to_string());
    for mapping in mappings {
        command
            .arg(mapping.inside.to_string())
            .arg(mapping.outside.to_string())
            .arg(mapping.count.to_string());
    }
    match command.status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            debug!(helper, %status, "id map helper refused");
            false
        }
        Err(err) => {
            debug!(helper, error = %err, "id map helper not runnable");
            false
        }
    }
}

fn write_proc(pid: Pid, file: &str, content: &str) -> Result<()> {
    let path = format!("/proc/{}/{}", pid.as_raw(), file);
    fs::write(&path, content).map_err(|err| {
        Error::NamespaceSetupFailed(format!("writing {}: {}", path, err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_matching_entries_are_collected() {
        let text = "alice:100000:65536\nbob:200000:65536\nalice:300000:1000\n";
        let ranges = parse_subid_entries(text, Some("alice"), 1000);
        assert_eq!(
            ranges,
            vec![
                SubIdRange {
                    start: 100000,
                    count: 65536
                },
                SubIdRange {
                    start: 300000,
                    count: 1000
                },
            ]
        );
    }

    #[test]
    fn numeric_ids_match_too() {
        let text = "1000:100000:65536\n";
        let ranges = parse_subid_entries(text, Some("alice"), 1000);
        assert_eq!(ranges.len(), 1);
    }

    #[test]
    fn comments_and_malformed_lines_are_skipped() {
        let text = "# subordinate ids\nalice:nonsense:10\nalice:100000:10\nshort:line\n";
        let ranges = parse_subid_entries(text, Some("alice"), 1000);
        assert_eq!(
            ranges,
            vec![SubIdRange {
                start: 100000,
                count: 10
            }]
        );
    }

    #[test]
    fn container_root_is_the_invoking_user() {
        let mappings = mappings_from_ranges(1000, &[]);
        assert_eq!(
            mappings,
            vec![IdMapping {
                inside: 0,
                outside: 1000,
                count: 1
            }]
        );
    }

    #[test]
    fn ranges_concatenate_from_container_id_one() {
        let mappings = mappings_from_ranges(
            1000,
            &[
                SubIdRange {
                    start: 100000,
                    count: 65536,
                },
                SubIdRange {
                    start: 300000,
                    count: 1000,
                },
            ],
        );
        assert_eq!(
            mappings,
            vec![
                IdMapping {
                    inside: 0,
                    outside: 1000,
                    count: 1
                },
                IdMapping {
                    inside: 1,
                    outside: 100000,
                    count: 65536
                },
                IdMapping {
                    inside: 65537,
                    outside: 300000,
                    count: 1000
                },
            ]
        );
        // Two ranges totalling N ids are all reachable from inside.
        let span: u32 = mappings.iter().map(|m| m.count).sum();
        assert_eq!(span, 1 + 65536 + 1000);
    }

    #[test]
    fn empty_ranges_are_dropped() {
        let mappings = mappings_from_ranges(
            1000,
            &[
                SubIdRange {
                    start: 100000,
                    count: 0,
                },
                SubIdRange {
                    start: 200000,
                    count: 10,
                },
            ],
        );
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1].inside, 1);
    }
}
