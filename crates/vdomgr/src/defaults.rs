//! Centralized defaults and option validators.
//!
//! The validators are pure `&str -> Result<T, String>` functions so they
//! can be attached directly to the command-line options as value parsers
//! and reused by the volume service for runtime checks.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::size::{GB, KB, MB, SizeString, TB, VDO_BLOCK_SIZE};
use crate::types::{IndexMemory, LogLevel, WritePolicy};

/// Default values for volume attributes and manager behavior.
pub struct Defaults;

impl Defaults {
    pub const ACK_THREADS: u32 = 1;
    pub const ACK_THREADS_MIN: u32 = 0;
    pub const ACK_THREADS_MAX: u32 = 100;
    pub const BIO_ROTATION_INTERVAL: u32 = 64;
    pub const BIO_ROTATION_INTERVAL_MIN: u32 = 1;
    pub const BIO_ROTATION_INTERVAL_MAX: u32 = 1024;
    pub const BIO_THREADS: u32 = 4;
    pub const BIO_THREADS_MIN: u32 = 1;
    pub const BIO_THREADS_MAX: u32 = 100;
    pub const CPU_THREADS: u32 = 2;
    pub const HASH_ZONE_THREADS: u32 = 1;
    pub const LOGICAL_THREADS: u32 = 1;
    pub const PHYSICAL_THREADS: u32 = 1;
    pub const PHYSICAL_THREADS_MIN: u32 = 0;
    pub const PHYSICAL_THREADS_MAX: u32 = 16;

    pub const BLOCK_MAP_CACHE_SIZE: SizeString =
        SizeString::from_bytes(128 * MB);
    pub const BLOCK_MAP_CACHE_SIZE_MIN: SizeString =
        SizeString::from_bytes(128 * MB);
    pub const BLOCK_MAP_CACHE_SIZE_MAX_PLUS_ONE: SizeString =
        SizeString::from_bytes(16 * TB);
    pub const BLOCK_MAP_PERIOD: u32 = 16380;
    pub const BLOCK_MAP_PERIOD_MIN: u32 = 1;
    pub const BLOCK_MAP_PERIOD_MAX: u32 = 16380;

    pub const SLAB_SIZE: SizeString = SizeString::from_bytes(2 * GB);
    pub const SLAB_SIZE_MIN: SizeString = SizeString::from_bytes(128 * MB);
    pub const SLAB_SIZE_MAX: SizeString = SizeString::from_bytes(32 * GB);

    pub const LOGICAL_SIZE_MAX: SizeString =
        SizeString::from_bytes(4096 * TB);

    pub const MAX_DISCARD_SIZE: SizeString =
        SizeString::from_bytes(VDO_BLOCK_SIZE);
    pub const MAX_DISCARD_SIZE_MIN: SizeString =
        SizeString::from_bytes(4 * KB);
    pub const MAX_DISCARD_SIZE_MAX_PLUS_ONE: SizeString =
        SizeString::from_bytes(4 * GB);

    pub const INDEX_CFREQ: u32 = 0;
    pub const INDEX_THREADS: u32 = 0;
    pub const INDEX_MEM_INT_MIN: u32 = 1;
    pub const INDEX_MEM_INT_MAX: u32 = 1024;

    pub const WRITE_POLICY: WritePolicy = WritePolicy::Auto;
    pub const MD_RAID5_MODE: &'static str = "on";
    pub const TARGET_NAME: &'static str = "vdo";
    pub const MODULE_NAME: &'static str = "kvdo";
    pub const LOG_LEVEL: LogLevel = LogLevel::Info;

    /// Poll limit, in seconds, for the index to come online after
    /// enabling deduplication.
    pub const DEDUPLICATION_TIMEOUT: u64 = 20;

    /// The configuration file path: `$VDO_CONF_DIR/vdoconf.yml`, with the
    /// directory defaulting to `/etc`.
    pub fn conf_file() -> PathBuf {
        let dir = std::env::var("VDO_CONF_DIR")
            .unwrap_or_else(|_| "/etc".to_string());
        Path::new(&dir).join("vdoconf.yml")
    }
}

/// Checks that an option is an absolute pathname.
pub fn check_abspath(value: &str) -> Result<PathBuf, String> {
    let path = Path::new(value);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Err("must be an absolute pathname".to_string())
    }
}

/// Checks that an option is a valid name for the backing store.
pub fn check_blkdev(value: &str) -> Result<PathBuf, String> {
    check_abspath(value)
}

/// Checks that an option does not name an existing block device, for the
/// configuration and log file paths.
pub fn check_not_block_file(value: &str) -> Result<PathBuf, String> {
    let path = Path::new(value);
    if crate::system::is_block_device(path) {
        return Err(format!("{value} is a block device"));
    }
    Ok(path.to_path_buf())
}

fn range_check(min: u32, max: u32, value: &str) -> Result<u32, String> {
    value
        .parse::<u32>()
        .ok()
        .filter(|n| (min..=max).contains(n))
        .ok_or_else(|| {
            format!(
                "must be an integer at least {min} and less than or equal \
                 to {max}"
            )
        })
}

pub fn check_block_map_period(value: &str) -> Result<u32, String> {
    range_check(
        Defaults::BLOCK_MAP_PERIOD_MIN,
        Defaults::BLOCK_MAP_PERIOD_MAX,
        value,
    )
}

pub fn check_rotation_interval(value: &str) -> Result<u32, String> {
    range_check(
        Defaults::BIO_ROTATION_INTERVAL_MIN,
        Defaults::BIO_ROTATION_INTERVAL_MAX,
        value,
    )
}

/// Thread counts for worker types allowing between 0 and 100 threads.
pub fn check_thread_count_0_100(value: &str) -> Result<u32, String> {
    range_check(0, 100, value)
}

/// Thread counts for worker types requiring at least one thread.
pub fn check_thread_count_1_100(value: &str) -> Result<u32, String> {
    range_check(1, 100, value)
}

pub fn check_physical_thread_count(value: &str) -> Result<u32, String> {
    range_check(
        Defaults::PHYSICAL_THREADS_MIN,
        Defaults::PHYSICAL_THREADS_MAX,
        value,
    )
}

/// Checks that an option is an SI-unit size string (no sector suffix).
pub fn check_si_size(value: &str) -> Result<SizeString, String> {
    let acceptable = value.chars().last().is_some_and(|last| {
        last.is_ascii_digit()
            || "bkmgtpe".contains(last.to_ascii_lowercase())
    });
    if acceptable {
        if let Ok(size) = value.parse() {
            return Ok(size);
        }
    }
    Err("must be an SI-style size string".to_string())
}

/// Checks that an option is an LVM-style size string.
pub fn check_size(value: &str) -> Result<SizeString, String> {
    value
        .parse()
        .map_err(|_| "must be an LVM-style size string".to_string())
}

pub fn check_logical_size(value: &str) -> Result<SizeString, String> {
    let size = check_size(value)?;
    if size > Defaults::LOGICAL_SIZE_MAX {
        return Err(format!(
            "must be less than or equal to {}",
            Defaults::LOGICAL_SIZE_MAX
        ));
    }
    Ok(size)
}

pub fn check_page_cache_size(value: &str) -> Result<SizeString, String> {
    let size = check_si_size(value)?;
    if size < Defaults::BLOCK_MAP_CACHE_SIZE_MIN
        || size >= Defaults::BLOCK_MAP_CACHE_SIZE_MAX_PLUS_ONE
    {
        return Err(format!(
            "must be at least {} and less than {}",
            Defaults::BLOCK_MAP_CACHE_SIZE_MIN,
            Defaults::BLOCK_MAP_CACHE_SIZE_MAX_PLUS_ONE
        ));
    }
    Ok(size)
}

pub fn check_max_discard_size(value: &str) -> Result<SizeString, String> {
    let size = check_si_size(value)?;
    if size < Defaults::MAX_DISCARD_SIZE_MIN
        || size >= Defaults::MAX_DISCARD_SIZE_MAX_PLUS_ONE
        || size.to_bytes() % VDO_BLOCK_SIZE != 0
    {
        return Err(format!(
            "must be a multiple of {VDO_BLOCK_SIZE} bytes, at least {} and \
             less than {}",
            Defaults::MAX_DISCARD_SIZE_MIN,
            Defaults::MAX_DISCARD_SIZE_MAX_PLUS_ONE
        ));
    }
    Ok(size)
}

/// Checks that an option is a valid slab size: a power of two between
/// 128M and 32G. Zero means "use the default".
pub fn check_slab_size(value: &str) -> Result<SizeString, String> {
    let size = check_size(value)?;
    if size.is_zero() {
        return Ok(size);
    }
    if !size.to_bytes().is_power_of_two()
        || size < Defaults::SLAB_SIZE_MIN
        || size > Defaults::SLAB_SIZE_MAX
    {
        return Err(format!(
            "must be a power of two between {} and {}",
            Defaults::SLAB_SIZE_MIN,
            Defaults::SLAB_SIZE_MAX
        ));
    }
    Ok(size)
}

pub fn check_index_mem(value: &str) -> Result<IndexMemory, String> {
    let error = || {
        format!(
            "must be an integer at least {} and less than or equal to {} \
             or one of the special values of 0.25, 0.5, or 0.75",
            Defaults::INDEX_MEM_INT_MIN,
            Defaults::INDEX_MEM_INT_MAX
        )
    };
    match value.parse::<IndexMemory>().map_err(|_| error())? {
        IndexMemory::Gigabytes(n)
            if !(Defaults::INDEX_MEM_INT_MIN..=Defaults::INDEX_MEM_INT_MAX)
                .contains(&n) =>
        {
            Err(error())
        }
        memory => Ok(memory),
    }
}

/// Checks that an option is a valid VDO device name.
///
/// `dmsetup create` accepts many characters that are problematic for udev
/// or for shell quoting; only alphanumerics and a small set of punctuation
/// are permitted, and the name may not begin with a dash.
pub fn check_vdo_name(value: &str) -> Result<String, String> {
    const ALLOWED: &str = "A-Za-z0-9#+.:@_-";
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        Regex::new(&format!("^[{ALLOWED}]+$")).expect("static regex")
    });
    if !re.is_match(value) {
        return Err(format!(
            "VDO device names may only contain characters in '{ALLOWED}': \
             bad value '{value}'"
        ));
    }
    if value.starts_with('-') {
        return Err(format!(
            "VDO device names may not start with '-': bad value '{value}'"
        ));
    }
    Ok(value.to_string())
}

pub fn check_write_policy(value: &str) -> Result<WritePolicy, String> {
    value.parse()
}

pub fn check_log_level(value: &str) -> Result<LogLevel, String> {
    value.parse()
}

/// Checks that an option is either an empty string (generate a UUID) or a
/// canonical UUID.
pub fn check_uuid(value: &str) -> Result<String, String> {
    if value.is_empty() {
        return Ok(String::new());
    }
    uuid::Uuid::parse_str(value)
        .map(|u| u.to_string())
        .map_err(|_| "must be a valid UUID or an empty string".to_string())
}

/// Checks an enabled/disabled choice option.
pub fn check_enabled(value: &str) -> Result<bool, String> {
    match value {
        "enabled" => Ok(true),
        "disabled" => Ok(false),
        _ => Err("must be either enabled or disabled".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_size_boundaries() {
        assert!(check_slab_size("128M").is_ok());
        assert!(check_slab_size("32G").is_ok());
        assert!(check_slab_size("2G").is_ok());
        assert!(check_slab_size("0").is_ok());
        assert!(check_slab_size("192M").is_err());
        assert!(check_slab_size("64M").is_err());
        assert!(check_slab_size("64G").is_err());
    }

    #[test]
    fn index_memory_boundaries() {
        assert!(check_index_mem("0.25").is_ok());
        assert!(check_index_mem("0.50").is_err());
        assert!(check_index_mem("1024").is_ok());
        assert!(check_index_mem("1025").is_err());
        assert!(check_index_mem("0").is_err());
    }

    #[test]
    fn name_validation() {
        assert!(check_vdo_name("foo.bar_1").is_ok());
        assert!(check_vdo_name("-foo").is_err());
        assert!(check_vdo_name("foo=bar").is_err());
        assert!(check_vdo_name("").is_err());
    }

    #[test]
    fn logical_size_is_capped() {
        assert!(check_logical_size("4096T").is_ok());
        assert!(check_logical_size("4097T").is_err());
    }

    #[test]
    fn page_cache_size_range() {
        assert!(check_page_cache_size("128M").is_ok());
        assert!(check_page_cache_size("127M").is_err());
        assert!(check_page_cache_size("16T").is_err());
        // The sector suffix is not an SI size.
        assert!(check_page_cache_size("300S").is_err());
    }

    #[test]
    fn max_discard_size_range() {
        assert!(check_max_discard_size("4K").is_ok());
        assert!(check_max_discard_size("2K").is_err());
        assert!(check_max_discard_size("4G").is_err());
        assert!(check_max_discard_size("6K").is_err());
    }

    #[test]
    fn thread_count_ranges() {
        assert_eq!(check_thread_count_0_100("0"), Ok(0));
        assert!(check_thread_count_1_100("0").is_err());
        assert!(check_physical_thread_count("17").is_err());
        assert_eq!(check_physical_thread_count("16"), Ok(16));
        assert!(check_rotation_interval("1025").is_err());
    }

    #[test]
    fn uuid_validation() {
        assert_eq!(check_uuid(""), Ok(String::new()));
        assert!(
            check_uuid("6bde36f4-b4c8-4e02-a875-15f4053a2afd").is_ok()
        );
        assert!(check_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn abspath_validation() {
        assert!(check_abspath("/dev/sdx").is_ok());
        assert!(check_abspath("dev/sdx").is_err());
    }
}
