//! Reads of kernel and platform state: procfs, sysfs, /dev/disk aliases.
//!
//! Everything here is a read; mutations of kernel state go through the
//! external tools via [`crate::runner`].

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::size::SizeString;
use crate::{Result, VdoError};

const BY_ID_DIR: &str = "/dev/disk/by-id";

/// True if the path names an existing block-device node.
pub fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// The fully resolved form of a path; paths that cannot be resolved are
/// returned unchanged.
pub fn canonical_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Picks a stable alias for a device.
///
/// If `/dev/disk/by-id` carries aliases resolving to the same real device,
/// the `dm-uuid-*` and `md-uuid-*` aliases are preferred (they survive
/// reboots and device renumbering); otherwise the lexicographically first
/// alias wins. A device with no alias is returned as given.
pub fn resolve_stable_name(device: &Path) -> PathBuf {
    let target = canonical_path(device);
    let mut aliases: Vec<PathBuf> = match fs::read_dir(BY_ID_DIR) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| canonical_path(p) == target)
            .collect(),
        Err(_) => return device.to_path_buf(),
    };
    aliases.sort();
    let preferred = aliases.iter().find(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| {
                n.starts_with("dm-uuid-") || n.starts_with("md-uuid-")
            })
    });
    preferred
        .or(aliases.first())
        .cloned()
        .unwrap_or_else(|| device.to_path_buf())
}

/// `MemAvailable` from the system memory report, if it can be read.
pub fn available_memory() -> Option<SizeString> {
    static MEM_RE: OnceLock<Regex> = OnceLock::new();
    let re = MEM_RE.get_or_init(|| {
        Regex::new(r"MemAvailable:\s*(\d+)").expect("static regex")
    });
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let captures = re.captures(&meminfo)?;
    format!("{}K", &captures[1]).parse().ok()
}

/// The kernel block devices holding `device` open, from the holders
/// directory of its major:minor sysfs node. A device with no sysfs node
/// has no holders.
pub fn holders(device: &Path) -> Result<Vec<String>> {
    let metadata = fs::metadata(device)?;
    if !metadata.file_type().is_block_device() {
        return Ok(Vec::new());
    }
    let rdev = metadata.rdev();
    let dir = format!(
        "/sys/dev/block/{}:{}/holders",
        nix::sys::stat::major(rdev),
        nix::sys::stat::minor(rdev)
    );
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("no holders directory {dir}: {e}");
            return Ok(Vec::new());
        }
    };
    Ok(entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect())
}

/// The size of a block device in 512-byte sectors, from sysfs.
pub fn device_size_sectors(device: &Path) -> Result<u64> {
    let resolved = canonical_path(device);
    let base = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            VdoError::System(format!(
                "cannot determine device name for {}",
                device.display()
            ))
        })?;
    let path = format!("/sys/class/block/{base}/size");
    let contents = fs::read_to_string(&path).map_err(|e| {
        VdoError::System(format!("cannot read {path}: {e}"))
    })?;
    contents.trim().parse().map_err(|_| {
        VdoError::System(format!("malformed device size in {path}"))
    })
}

/// The instance number of a running volume from the driver's sysfs tree,
/// or None if it cannot be determined.
pub fn instance_number(name: &str) -> Option<u32> {
    let path = format!("/sys/kvdo/{name}/instance");
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Finds the full path to a command, or None if it is not in `$PATH`.
pub fn which(command: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(command);
        let Ok(metadata) = fs::metadata(&candidate) else {
            continue;
        };
        if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
            return Some(candidate);
        }
    }
    None
}

/// The node name, for the status report.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}
