//! The YAML registry of managed volumes.
//!
//! A single-writer, file-locked store mapping volume names to their
//! persisted attributes, with schema versioning and atomic
//! replace-on-write. The registry is the only file the manager writes;
//! everything else it changes lives in the kernel.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::defaults::Defaults;
use crate::lock::{FileLock, LOCK_TIMEOUT_SECS};
use crate::runner::{RunContext, run_command};
use crate::size::{SizeString, VDO_BLOCK_SIZE};
use crate::types::{IndexMemory, OperationState, WritePolicy, enabled};
use crate::{Result, VdoError};

/// The only schema version accepted in the current release.
pub const CONFIG_SCHEMA_VERSION: u32 = 0x2017_0907;

const SUPPORTED_SCHEMA_VERSIONS: [u32; 1] = [CONFIG_SCHEMA_VERSION];

/// Lock file guarding the in-memory singleton table.
pub const SINGLETON_LOCK_FILE: &str = "/var/lock/vdo-config-singletons";

const BANNER: &str = "\
####################################################################\n\
# THIS FILE IS MACHINE GENERATED. DO NOT EDIT THIS FILE BY HAND.\n\
####################################################################\n";

/// One persisted volume.
///
/// The named fields are the registry schema; fields this release does not
/// know about are preserved in `extra` and re-emitted verbatim so that a
/// newer manager's entries survive a round trip through this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VdoRecord {
    #[serde(skip)]
    pub name: String,

    pub ack_threads: u32,
    #[serde(with = "enabled")]
    pub activated: bool,
    pub bio_rotation_interval: u32,
    pub bio_threads: u32,
    pub block_map_cache_size: SizeString,
    pub block_map_period: u32,
    #[serde(rename = "compression", with = "enabled")]
    pub enable_compression: bool,
    pub cpu_threads: u32,
    #[serde(rename = "deduplication", with = "enabled")]
    pub enable_deduplication: bool,
    pub device: PathBuf,
    pub hash_zone_threads: u32,
    pub index_cfreq: u32,
    pub index_memory: IndexMemory,
    #[serde(with = "enabled")]
    pub index_sparse: bool,
    pub index_threads: u32,
    pub logical_block_size: u32,
    pub logical_size: SizeString,
    pub logical_threads: u32,
    pub max_discard_size: SizeString,
    #[serde(default, alias = "_operationState")]
    pub operation_state: OperationState,
    pub physical_size: SizeString,
    pub physical_threads: u32,
    pub slab_size: SizeString,
    #[serde(default)]
    pub uuid: String,
    pub write_policy: WritePolicy,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl VdoRecord {
    /// A new record with the release defaults, as used by `create`.
    pub fn new(name: impl Into<String>, device: impl Into<PathBuf>) -> Self {
        VdoRecord {
            name: name.into(),
            ack_threads: Defaults::ACK_THREADS,
            activated: true,
            bio_rotation_interval: Defaults::BIO_ROTATION_INTERVAL,
            bio_threads: Defaults::BIO_THREADS,
            block_map_cache_size: Defaults::BLOCK_MAP_CACHE_SIZE,
            block_map_period: Defaults::BLOCK_MAP_PERIOD,
            enable_compression: true,
            cpu_threads: Defaults::CPU_THREADS,
            enable_deduplication: true,
            device: device.into(),
            hash_zone_threads: Defaults::HASH_ZONE_THREADS,
            index_cfreq: Defaults::INDEX_CFREQ,
            index_memory: IndexMemory::default(),
            index_sparse: false,
            index_threads: Defaults::INDEX_THREADS,
            logical_block_size: VDO_BLOCK_SIZE as u32,
            logical_size: SizeString::ZERO,
            logical_threads: Defaults::LOGICAL_THREADS,
            max_discard_size: Defaults::MAX_DISCARD_SIZE,
            operation_state: OperationState::Unknown,
            physical_size: SizeString::ZERO,
            physical_threads: Defaults::PHYSICAL_THREADS,
            slab_size: Defaults::SLAB_SIZE,
            uuid: String::new(),
            write_policy: Defaults::WRITE_POLICY,
            extra: BTreeMap::new(),
        }
    }

    /// The operation state with the legacy upgrade applied: entries
    /// predating the marker read as `unknown` and are treated as finished
    /// without being persisted.
    pub fn effective_operation_state(&self) -> OperationState {
        match self.operation_state {
            OperationState::Unknown => OperationState::Finished,
            state => state,
        }
    }

    /// True if a previous mutation of this volume never completed.
    pub fn previous_operation_failure(&self) -> bool {
        self.effective_operation_state() != OperationState::Finished
    }

    /// True if the incomplete previous operation cannot be recovered
    /// automatically.
    pub fn unrecoverable_previous_operation_failure(&self) -> bool {
        matches!(
            self.operation_state,
            OperationState::BeginCreate | OperationState::BeginImport
        )
    }

    /// The full path of the mapper device realizing this volume.
    pub fn device_path(&self) -> PathBuf {
        Path::new("/dev/mapper").join(&self.name)
    }
}

/// Configuration of the managed volumes.
#[derive(Debug)]
pub struct Configuration {
    filename: PathBuf,
    readonly: bool,
    dirty: bool,
    schema_version: u32,
    vdos: BTreeMap<String, VdoRecord>,
}

impl Configuration {
    /// Loads the registry from `filename`.
    ///
    /// A missing file is an empty registry, unless `must_exist` is set.
    pub fn load(
        filename: &Path,
        readonly: bool,
        must_exist: bool,
    ) -> Result<Self> {
        let filename = std::path::absolute(filename)?;
        if must_exist && !filename.exists() {
            return Err(VdoError::User(format!(
                "Configuration file {} does not exist.",
                filename.display()
            )));
        }
        let mut config = Configuration {
            filename: filename.clone(),
            readonly,
            dirty: false,
            schema_version: CONFIG_SCHEMA_VERSION,
            vdos: BTreeMap::new(),
        };
        if filename.exists() {
            let contents = fs::read_to_string(&filename)?;
            if !contents.is_empty() {
                debug!("reading configuration from {}", filename.display());
                config.read(&contents)?;
            }
        }
        Ok(config)
    }

    pub fn filepath(&self) -> &Path {
        &self.filename
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Retrieves a volume by name.
    pub fn get_vdo(&self, name: &str) -> Result<&VdoRecord> {
        self.vdos.get(name).ok_or_else(|| {
            VdoError::User(format!("VDO volume {name} not found"))
        })
    }

    /// Retrieves a volume for modification; the registry is marked dirty.
    pub fn get_vdo_mut(&mut self, name: &str) -> Result<&mut VdoRecord> {
        self.assert_can_modify();
        self.dirty = true;
        self.vdos.get_mut(name).ok_or_else(|| {
            VdoError::User(format!("VDO volume {name} not found"))
        })
    }

    pub fn have_vdo(&self, name: &str) -> bool {
        self.vdos.contains_key(name)
    }

    pub fn vdo_names(&self) -> Vec<String> {
        self.vdos.keys().cloned().collect()
    }

    pub fn all_vdos(&self) -> impl Iterator<Item = &VdoRecord> {
        self.vdos.values()
    }

    pub fn is_empty(&self) -> bool {
        self.vdos.is_empty()
    }

    /// Adds or replaces a volume. Returns false if the volume exists and
    /// `replace` is not set.
    pub fn add_vdo(&mut self, record: VdoRecord, replace: bool) -> bool {
        self.assert_can_modify();
        debug!("adding vdo \"{}\" to configuration", record.name);
        if !replace && self.have_vdo(&record.name) {
            return false;
        }
        self.vdos.insert(record.name.clone(), record);
        self.dirty = true;
        true
    }

    /// Removes a volume by name.
    pub fn remove_vdo(&mut self, name: &str) {
        self.assert_can_modify();
        self.vdos.remove(name);
        self.dirty = true;
    }

    /// True if some volume's canonical device path equals the canonical
    /// form of `device`.
    pub fn is_device_configured(&self, device: &Path) -> bool {
        let device = crate::system::canonical_path(device);
        self.vdos
            .values()
            .any(|vdo| crate::system::canonical_path(&vdo.device) == device)
    }

    /// Writes out the configuration if necessary.
    ///
    /// Read-only and unmodified registries are left alone. The new
    /// contents go to `<path>.new` first, are flushed and fsynced, renamed
    /// over the original, and the directory is fsynced. An empty registry
    /// deletes the file instead. In dry-run mode the YAML goes to standard
    /// output and nothing is written.
    pub fn persist(&mut self, ctx: &RunContext) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        if !self.dirty {
            debug!("configuration is clean, not persisting");
            return Ok(());
        }
        debug!("writing configuration to {}", self.filename.display());

        if self.vdos.is_empty() {
            self.remove_file(ctx)?;
            self.dirty = false;
            return Ok(());
        }

        let contents = format!("{BANNER}{}", self.config_yaml()?);
        if ctx.no_run_mode() {
            println!("New configuration (not written):");
            println!("{contents}");
            self.dirty = false;
            return Ok(());
        }

        let new_file =
            PathBuf::from(format!("{}.new", self.filename.display()));
        if new_file.exists() {
            fs::remove_file(&new_file)?;
        }
        {
            use std::io::Write;
            let mut fh = fs::File::create(&new_file)?;
            fh.write_all(contents.as_bytes())?;
            fh.flush()?;
            fh.sync_all()?;
        }
        fs::rename(&new_file, &self.filename)?;
        self.fsync_directory(ctx)?;
        self.dirty = false;
        Ok(())
    }

    /// The configuration's YAML representation to present to users.
    pub fn as_user_yaml(&self) -> Result<String> {
        Ok(format!(
            "{}filename: {}\n",
            self.config_yaml()?,
            self.filename.display()
        ))
    }

    /// A status summary of the configuration file itself.
    pub fn status(&self) -> Vec<(String, String)> {
        match fs::metadata(&self.filename) {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .map(|t| {
                        chrono::DateTime::<chrono::Local>::from(t)
                            .format("%Y-%m-%d %H:%M:%S")
                            .to_string()
                    })
                    .unwrap_or_else(|_| "not available".to_string());
                vec![
                    (
                        "File".to_string(),
                        self.filename.display().to_string(),
                    ),
                    ("Last modified".to_string(), modified),
                ]
            }
            Err(_) => vec![
                ("File".to_string(), "does not exist".to_string()),
                ("Last modified".to_string(), "not available".to_string()),
            ],
        }
    }

    fn assert_can_modify(&self) {
        assert!(!self.readonly, "configuration is read-only");
    }

    fn config_yaml(&self) -> Result<String> {
        let mut out = String::from("config:\n");
        out.push_str(&format!("  version: 0x{:X}\n", self.schema_version));
        if self.vdos.is_empty() {
            out.push_str("  vdos: {}\n");
            return Ok(out);
        }
        out.push_str("  vdos:\n");
        let body = serde_yaml::to_string(&self.vdos)
            .map_err(|e| VdoError::Yaml(e.to_string()))?;
        for line in body.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }

    fn read(&mut self, contents: &str) -> Result<()> {
        let bad = |detail: &str| {
            VdoError::BadConfigurationFile(format!(
                "Not a valid configuration file{detail}"
            ))
        };
        let doc: serde_yaml::Value =
            serde_yaml::from_str(contents).map_err(|_| bad(""))?;
        let section = doc
            .get("config")
            .ok_or_else(|| bad(" (missing 'config' section)"))?;

        let version = parse_schema_version(section.get("version"))?;
        if !SUPPORTED_SCHEMA_VERSIONS.contains(&version) {
            return Err(VdoError::BadConfigurationFile(format!(
                "Configuration file version 0x{version:X} not supported"
            )));
        }

        let vdos = match section.get("vdos") {
            None => return Err(bad(" (missing 'vdos' section)")),
            Some(serde_yaml::Value::Null) => BTreeMap::new(),
            Some(value) => serde_yaml::from_value::<
                BTreeMap<String, VdoRecord>,
            >(value.clone())
            .map_err(|e| bad(&format!(": {e}")))?,
        };

        self.schema_version = version;
        self.vdos = vdos;
        for (name, vdo) in self.vdos.iter_mut() {
            vdo.name = name.clone();
        }
        self.dirty = false;
        Ok(())
    }

    fn fsync_directory(&self, ctx: &RunContext) -> Result<()> {
        let dirname = self.filename.parent().unwrap_or(Path::new("/"));
        if ctx.no_run_mode() {
            let dir = dirname.display().to_string();
            let _ = run_command(ctx, &["fsync", &dir]);
            return Ok(());
        }
        fs::File::open(dirname)?.sync_all()?;
        Ok(())
    }

    fn remove_file(&self, ctx: &RunContext) -> Result<()> {
        if ctx.no_run_mode() {
            let path = self.filename.display().to_string();
            let _ = run_command(ctx, &["rm", &path]);
            return Ok(());
        }
        if self.filename.exists() {
            fs::remove_file(&self.filename)?;
            self.fsync_directory(ctx)?;
        }
        Ok(())
    }
}

fn parse_schema_version(value: Option<&serde_yaml::Value>) -> Result<u32> {
    let unsupported = || {
        VdoError::BadConfigurationFile(
            "Configuration file version not supported".to_string(),
        )
    };
    match value {
        Some(serde_yaml::Value::Number(n)) => {
            n.as_u64().map(|v| v as u32).ok_or_else(unsupported)
        }
        Some(serde_yaml::Value::String(s)) => {
            let parsed = if let Some(hex) = s.strip_prefix("0x") {
                u32::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            };
            parsed.ok_or_else(unsupported)
        }
        _ => Err(unsupported()),
    }
}

/// A shared handle on one mutable in-memory registry.
pub type SharedConfig = Rc<RefCell<Configuration>>;

/// Allocates and hands out modifiable singleton [`Configuration`]
/// instances, one per file path, so that separate entities share one
/// in-memory copy. The table itself is guarded by a well-known lock file.
pub struct ConfigRegistry {
    singleton_lock: PathBuf,
    table: RefCell<HashMap<PathBuf, SharedConfig>>,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    pub fn new() -> Self {
        ConfigRegistry {
            singleton_lock: PathBuf::from(SINGLETON_LOCK_FILE),
            table: RefCell::new(HashMap::new()),
        }
    }

    /// Overrides the singleton lock file location (tests).
    pub fn with_singleton_lock(mut self, path: impl Into<PathBuf>) -> Self {
        self.singleton_lock = path.into();
        self
    }

    /// Returns the modifiable singleton store for `path`, loading it on
    /// first use.
    pub fn modifiable_singleton(&self, path: &Path) -> Result<SharedConfig> {
        let _guard = FileLock::exclusive(&self.singleton_lock)
            .with_timeout(LOCK_TIMEOUT_SECS)
            .acquire()?;
        let mut table = self.table.borrow_mut();
        if let Some(config) = table.get(path) {
            return Ok(Rc::clone(config));
        }
        let config =
            Rc::new(RefCell::new(Configuration::load(path, false, false)?));
        table.insert(path.to_path_buf(), Rc::clone(&config));
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn run_ctx() -> RunContext {
        RunContext::default()
    }

    fn sample_record(name: &str, device: &str) -> VdoRecord {
        let mut record = VdoRecord::new(name, device);
        record.operation_state = OperationState::Finished;
        record.logical_size = "2T".parse().unwrap();
        record.physical_size = "10G".parse().unwrap();
        record
    }

    #[test]
    fn round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        let mut config = Configuration::load(&path, false, false).unwrap();
        config.add_vdo(sample_record("vol1", "/dev/vdx"), false);
        config.persist(&run_ctx()).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("#"));
        assert!(contents.contains("MACHINE GENERATED"));
        assert!(contents.contains("version: 0x20170907"));
        assert!(contents.contains("logicalSize: 2T"));
        assert!(contents.contains("operationState: finished"));
        assert!(contents.contains("activated: enabled"));
        assert!(contents.contains("writePolicy: auto"));

        let reloaded = Configuration::load(&path, true, true).unwrap();
        let vdo = reloaded.get_vdo("vol1").unwrap();
        assert_eq!(vdo.name, "vol1");
        assert_eq!(vdo.logical_size, "2T".parse().unwrap());
        assert_eq!(vdo.operation_state, OperationState::Finished);
        assert!(vdo.activated);
    }

    #[test]
    fn rejects_unknown_schema_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        fs::write(&path, "config:\n  version: 1\n  vdos: {}\n").unwrap();
        let err = Configuration::load(&path, true, false).unwrap_err();
        assert!(matches!(err, VdoError::BadConfigurationFile(_)));
    }

    #[test]
    fn rejects_files_without_a_config_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        fs::write(&path, "something: else\n").unwrap();
        let err = Configuration::load(&path, true, false).unwrap_err();
        assert!(matches!(err, VdoError::BadConfigurationFile(_)));
    }

    #[test]
    fn missing_file_is_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        let config = Configuration::load(&path, true, false).unwrap();
        assert!(config.is_empty());
        assert!(Configuration::load(&path, true, true).is_err());
    }

    #[test]
    fn accepts_yes_no_spellings_and_emits_canonical_forms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        let mut config = Configuration::load(&path, false, false).unwrap();
        config.add_vdo(sample_record("vol1", "/dev/vdx"), false);
        config.persist(&run_ctx()).unwrap();
        let contents = fs::read_to_string(&path)
            .unwrap()
            .replace("activated: enabled", "activated: yes")
            .replace("compression: enabled", "compression: no");
        fs::write(&path, contents).unwrap();

        let mut config = Configuration::load(&path, false, false).unwrap();
        {
            let vdo = config.get_vdo("vol1").unwrap();
            assert!(vdo.activated);
            assert!(!vdo.enable_compression);
        }
        config.get_vdo_mut("vol1").unwrap().block_map_period = 100;
        config.persist(&run_ctx()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("activated: enabled"));
        assert!(contents.contains("compression: disabled"));
    }

    #[test]
    fn preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        let mut config = Configuration::load(&path, false, false).unwrap();
        let mut record = sample_record("vol1", "/dev/vdx");
        record.extra.insert(
            "readCacheSize".to_string(),
            serde_yaml::Value::String("0M".to_string()),
        );
        config.add_vdo(record, false);
        config.persist(&run_ctx()).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("readCacheSize: 0M"));
        let reloaded = Configuration::load(&path, true, false).unwrap();
        let vdo = reloaded.get_vdo("vol1").unwrap();
        assert_eq!(
            vdo.extra.get("readCacheSize"),
            Some(&serde_yaml::Value::String("0M".to_string()))
        );
    }

    #[test]
    fn legacy_operation_state_key_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        let mut config = Configuration::load(&path, false, false).unwrap();
        config.add_vdo(sample_record("vol1", "/dev/vdx"), false);
        config.persist(&run_ctx()).unwrap();
        let contents = fs::read_to_string(&path)
            .unwrap()
            .replace("operationState:", "_operationState:");
        fs::write(&path, contents).unwrap();

        let reloaded = Configuration::load(&path, true, false).unwrap();
        assert_eq!(
            reloaded.get_vdo("vol1").unwrap().operation_state,
            OperationState::Finished
        );
    }

    #[test]
    fn entries_without_a_marker_upgrade_in_memory_only() {
        let mut record = sample_record("vol1", "/dev/vdx");
        record.operation_state = OperationState::Unknown;
        assert_eq!(
            record.effective_operation_state(),
            OperationState::Finished
        );
        assert!(!record.previous_operation_failure());
        assert_eq!(record.operation_state, OperationState::Unknown);
    }

    #[test]
    fn device_comparison_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("backing");
        fs::write(&target, b"").unwrap();
        let alias = dir.path().join("alias");
        std::os::unix::fs::symlink(&target, &alias).unwrap();

        let path = dir.path().join("vdoconf.yml");
        let mut config = Configuration::load(&path, false, false).unwrap();
        config.add_vdo(
            sample_record("vol1", target.to_str().unwrap()),
            false,
        );
        assert!(config.is_device_configured(&alias));
        assert!(config.is_device_configured(&target));
        assert!(!config.is_device_configured(Path::new("/dev/other")));
    }

    #[test]
    fn persisting_an_empty_registry_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        let mut config = Configuration::load(&path, false, false).unwrap();
        config.add_vdo(sample_record("vol1", "/dev/vdx"), false);
        config.persist(&run_ctx()).unwrap();
        assert!(path.exists());

        config.remove_vdo("vol1");
        config.persist(&run_ctx()).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn persist_leaves_no_temporary_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        let mut config = Configuration::load(&path, false, false).unwrap();
        config.add_vdo(sample_record("vol1", "/dev/vdx"), false);
        config.persist(&run_ctx()).unwrap();
        assert!(path.exists());
        let tmp = PathBuf::from(format!("{}.new", path.display()));
        assert!(!tmp.exists());
    }

    #[test]
    fn singleton_table_shares_one_instance_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        let registry = ConfigRegistry::new()
            .with_singleton_lock(dir.path().join("singletons.lock"));
        let first = registry.modifiable_singleton(&path).unwrap();
        let second = registry.modifiable_singleton(&path).unwrap();
        assert!(Rc::ptr_eq(&first, &second));

        first
            .borrow_mut()
            .add_vdo(sample_record("vol1", "/dev/vdx"), false);
        assert!(second.borrow().have_vdo("vol1"));
    }

    #[test]
    fn user_yaml_includes_the_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdoconf.yml");
        let mut config = Configuration::load(&path, false, false).unwrap();
        config.add_vdo(sample_record("vol1", "/dev/vdx"), false);
        let yaml = config.as_user_yaml().unwrap();
        assert!(yaml.starts_with("config:\n"));
        assert!(yaml.contains("vol1:"));
        assert!(yaml.trim_end().ends_with(&format!(
            "filename: {}",
            path.display()
        )));
    }
}
