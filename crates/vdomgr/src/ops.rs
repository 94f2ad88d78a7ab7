//! Top-level command dispatch.
//!
//! One invocation runs one command: take the configuration lock (shared
//! for the read-only listings, exclusive otherwise), load the registry,
//! resolve the named volumes, run the operation per volume inside a
//! transactional scope, persist, release. Per-volume errors under `--all`
//! are collected so the remaining volumes still get their turn; the first
//! one is re-raised at the end.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};
use tracing::{debug, error, info};

use crate::config::{ConfigRegistry, Configuration, SharedConfig, VdoRecord};
use crate::defaults::Defaults;
use crate::kmod::KernelModuleService;
use crate::lock::{FileLock, LOCK_TIMEOUT_SECS};
use crate::runner::{RunContext, RunOptions, run_command_with};
use crate::size::SizeString;
use crate::transaction::{Transaction, transactional};
use crate::types::{IndexMemory, LogLevel, WritePolicy};
use crate::volume::{ModifyArgs, VdoVolume, validate_modifiable_options};
use crate::{Result, VdoError, system};

/// Directory holding the per-configuration lock files.
pub const LOCK_DIR: &str = "/var/lock/vdo";

const REQUIRED_BINARIES: [&str; 3] =
    ["vdodumpconfig", "vdoforcerebuild", "vdoformat"];

/// Process-level options shared by every command.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub conf_file: PathBuf,
    pub verbose: bool,
    pub no_run: bool,
}

/// Volume selection: exactly one of a name or all of them.
#[derive(Debug, Clone)]
pub enum Naming {
    Name(String),
    All,
}

/// Attributes accepted by `create`.
#[derive(Debug, Clone, Default)]
pub struct CreateArgs {
    pub name: String,
    pub device: PathBuf,
    pub force: bool,
    pub activate: Option<bool>,
    pub compression: Option<bool>,
    pub deduplication: Option<bool>,
    pub emulate512: Option<bool>,
    pub sparse_index: Option<bool>,
    pub index_mem: Option<IndexMemory>,
    pub uuid: Option<String>,
    pub logical_size: Option<SizeString>,
    pub slab_size: Option<SizeString>,
    pub block_map_cache_size: Option<SizeString>,
    pub block_map_period: Option<u32>,
    pub max_discard_size: Option<SizeString>,
    pub ack_threads: Option<u32>,
    pub bio_rotation_interval: Option<u32>,
    pub bio_threads: Option<u32>,
    pub cpu_threads: Option<u32>,
    pub hash_zone_threads: Option<u32>,
    pub logical_threads: Option<u32>,
    pub physical_threads: Option<u32>,
    pub write_policy: Option<WritePolicy>,
    pub log_level: Option<LogLevel>,
}

impl CreateArgs {
    fn into_record(&self) -> VdoRecord {
        let mut record = VdoRecord::new(&self.name, &self.device);
        if let Some(v) = self.activate {
            record.activated = v;
        }
        if let Some(v) = self.compression {
            record.enable_compression = v;
        }
        if let Some(v) = self.deduplication {
            record.enable_deduplication = v;
        }
        if self.emulate512 == Some(true) {
            record.logical_block_size = 512;
        }
        if let Some(v) = self.sparse_index {
            record.index_sparse = v;
        }
        if let Some(v) = self.index_mem {
            record.index_memory = v;
        }
        if let Some(v) = &self.uuid {
            record.uuid = v.clone();
        }
        if let Some(v) = self.logical_size {
            record.logical_size = v.round_to_block();
        }
        if let Some(v) = self.slab_size {
            record.slab_size = v;
        }
        if let Some(v) = self.block_map_cache_size {
            record.block_map_cache_size = v;
        }
        if let Some(v) = self.block_map_period {
            record.block_map_period = v;
        }
        if let Some(v) = self.max_discard_size {
            record.max_discard_size = v;
        }
        if let Some(v) = self.ack_threads {
            record.ack_threads = v;
        }
        if let Some(v) = self.bio_rotation_interval {
            record.bio_rotation_interval = v;
        }
        if let Some(v) = self.bio_threads {
            record.bio_threads = v;
        }
        if let Some(v) = self.cpu_threads {
            record.cpu_threads = v;
        }
        if let Some(v) = self.hash_zone_threads {
            record.hash_zone_threads = v;
        }
        if let Some(v) = self.logical_threads {
            record.logical_threads = v;
        }
        if let Some(v) = self.physical_threads {
            record.physical_threads = v;
        }
        if let Some(v) = self.write_policy {
            record.write_policy = v;
        }
        record
    }
}

/// Attributes accepted by `import`; the geometry and index settings come
/// from the on-disk metadata instead of options.
#[derive(Debug, Clone, Default)]
pub struct ImportArgs {
    pub name: String,
    pub device: PathBuf,
    pub activate: Option<bool>,
    pub compression: Option<bool>,
    pub deduplication: Option<bool>,
    pub emulate512: Option<bool>,
    pub block_map_cache_size: Option<SizeString>,
    pub block_map_period: Option<u32>,
    pub max_discard_size: Option<SizeString>,
    pub uuid: Option<String>,
    pub ack_threads: Option<u32>,
    pub bio_rotation_interval: Option<u32>,
    pub bio_threads: Option<u32>,
    pub cpu_threads: Option<u32>,
    pub hash_zone_threads: Option<u32>,
    pub logical_threads: Option<u32>,
    pub physical_threads: Option<u32>,
    pub write_policy: Option<WritePolicy>,
    pub log_level: Option<LogLevel>,
}

impl ImportArgs {
    fn into_record(&self) -> VdoRecord {
        let create = CreateArgs {
            name: self.name.clone(),
            device: self.device.clone(),
            activate: self.activate,
            compression: self.compression,
            deduplication: self.deduplication,
            emulate512: self.emulate512,
            block_map_cache_size: self.block_map_cache_size,
            block_map_period: self.block_map_period,
            max_discard_size: self.max_discard_size,
            uuid: self.uuid.clone(),
            ack_threads: self.ack_threads,
            bio_rotation_interval: self.bio_rotation_interval,
            bio_threads: self.bio_threads,
            cpu_threads: self.cpu_threads,
            hash_zone_threads: self.hash_zone_threads,
            logical_threads: self.logical_threads,
            physical_threads: self.physical_threads,
            write_policy: self.write_policy,
            ..CreateArgs::default()
        };
        create.into_record()
    }
}

/// One top-level command, normalized from the argument parser.
#[derive(Debug, Clone)]
pub enum Operation {
    Activate { naming: Naming },
    ChangeWritePolicy { naming: Naming, policy: WritePolicy },
    Create(Box<CreateArgs>),
    Deactivate { naming: Naming },
    DisableCompression { naming: Naming },
    DisableDeduplication { naming: Naming },
    EnableCompression { naming: Naming },
    EnableDeduplication { naming: Naming },
    GrowLogical { name: String, size: SizeString },
    GrowPhysical { name: String },
    Import(Box<ImportArgs>),
    List { all: bool },
    Modify { naming: Naming, args: ModifyArgs },
    PrintConfigFile,
    Remove { naming: Naming, force: bool },
    Start { naming: Naming, force_rebuild: bool },
    Status { name: Option<String> },
    Stop { naming: Naming, force: bool },
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Activate { .. } => "activate",
            Operation::ChangeWritePolicy { .. } => "changeWritePolicy",
            Operation::Create(_) => "create",
            Operation::Deactivate { .. } => "deactivate",
            Operation::DisableCompression { .. } => "disableCompression",
            Operation::DisableDeduplication { .. } => "disableDeduplication",
            Operation::EnableCompression { .. } => "enableCompression",
            Operation::EnableDeduplication { .. } => "enableDeduplication",
            Operation::GrowLogical { .. } => "growLogical",
            Operation::GrowPhysical { .. } => "growPhysical",
            Operation::Import(_) => "import",
            Operation::List { .. } => "list",
            Operation::Modify { .. } => "modify",
            Operation::PrintConfigFile => "printConfigFile",
            Operation::Remove { .. } => "remove",
            Operation::Start { .. } => "start",
            Operation::Status { .. } => "status",
            Operation::Stop { .. } => "stop",
        }
    }

    /// Read-only listings hold the shared lock; everything else, status
    /// included (its recovery writes), holds the exclusive lock.
    fn shared_lock(&self) -> bool {
        matches!(
            self,
            Operation::List { .. } | Operation::PrintConfigFile
        )
    }

    fn requires_root(&self) -> bool {
        !matches!(
            self,
            Operation::List { .. }
                | Operation::PrintConfigFile
                | Operation::Status { .. }
        )
    }

    fn requires_run_mode(&self) -> bool {
        matches!(
            self,
            Operation::PrintConfigFile | Operation::Status { .. }
        )
    }

    fn check_binaries(&self) -> bool {
        matches!(
            self,
            Operation::Create(_)
                | Operation::Import(_)
                | Operation::Start { .. }
                | Operation::Status { .. }
                | Operation::EnableDeduplication { .. }
        )
    }
}

/// Runs one command to completion.
pub fn run(options: &GlobalOptions, operation: &Operation) -> Result<()> {
    let ctx = RunContext::new(options.verbose, options.no_run);
    preflight(&ctx, operation)?;

    let lock = config_lock(&options.conf_file, !operation.shared_lock());
    let _guard = lock.acquire()?;
    execute(&ctx, &options.conf_file, operation)
}

fn preflight(ctx: &RunContext, operation: &Operation) -> Result<()> {
    // A dry run performs no privileged action, so the euid check would
    // only get in the way of rehearsing commands.
    if operation.requires_root()
        && !ctx.no_run_mode()
        && !nix::unistd::Uid::effective().is_root()
    {
        return Err(VdoError::User(format!(
            "You must be root to use the \"{}\" command",
            operation.name()
        )));
    }
    if operation.requires_run_mode() && ctx.no_run_mode() {
        return Err(VdoError::User(format!(
            "{} command not available with --noRun",
            operation.name()
        )));
    }
    if operation.check_binaries() {
        for binary in REQUIRED_BINARIES {
            if system::which(binary).is_none() {
                return Err(VdoError::System(format!(
                    "executable '{binary}' not found in $PATH"
                )));
            }
        }
    }
    if let Operation::Modify { args, .. } = operation {
        validate_modifiable_options(args)?;
    }
    Ok(())
}

/// The lock file for a configuration path: the canonical path with `/`
/// replaced by `_`, under the lock directory.
fn config_lock(conf_file: &Path, exclusive: bool) -> FileLock {
    let conf = std::path::absolute(conf_file)
        .unwrap_or_else(|_| conf_file.to_path_buf());
    let conf = system::canonical_path(&conf);
    let base = format!("{}.lock", conf.display().to_string().replace('/', "_"));
    let path = Path::new(LOCK_DIR).join(base);
    let lock = if exclusive {
        FileLock::exclusive(path)
    } else {
        FileLock::shared(path)
    };
    lock.with_timeout(LOCK_TIMEOUT_SECS)
}

fn execute(
    ctx: &RunContext,
    conf_file: &Path,
    operation: &Operation,
) -> Result<()> {
    let registry = ConfigRegistry::new();
    match operation {
        Operation::Activate { naming } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                vdo.activate(txn)
            })
        }
        Operation::Deactivate { naming } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                vdo.deactivate(txn)
            })
        }
        Operation::ChangeWritePolicy { naming, policy } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                vdo.set_write_policy(txn, *policy)
            })
        }
        Operation::EnableCompression { naming } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                vdo.set_compression(txn, true)
            })
        }
        Operation::DisableCompression { naming } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                vdo.set_compression(txn, false)
            })
        }
        Operation::EnableDeduplication { naming } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                vdo.set_deduplication(txn, true)
            })
        }
        Operation::DisableDeduplication { naming } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                vdo.set_deduplication(txn, false)
            })
        }
        Operation::Start { naming, force_rebuild } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                if !vdo.get(|r| r.activated)? {
                    return Err(VdoError::State(format!(
                        "VDO volume {} not activated",
                        vdo.name()
                    )));
                }
                vdo.start(txn, *force_rebuild)?;
                announce_ready(vdo, false)
            })
        }
        Operation::Stop { naming, force } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, _txn| {
                vdo.stop(*force, None)
            })
        }
        Operation::Remove { naming, force } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                vdo.remove(txn, *force).map_err(|e| {
                    if let VdoError::PreviousOperationFailure {
                        name,
                        steps,
                        ..
                    } = &e
                    {
                        println!("A previous operation failed.");
                        println!(
                            "Recovery from the failure either failed or \
                             was interrupted."
                        );
                        println!(
                            "Add '--force' to 'remove' to perform the \
                             following cleanup."
                        );
                        println!("Steps to clean up VDO {name}:");
                        for step in steps {
                            println!("    {step}");
                        }
                    }
                    e
                })
            })
        }
        Operation::Modify { naming, args } => {
            apply_to_vdos(ctx, &registry, conf_file, naming, |vdo, txn| {
                vdo.set_modifiable_options(txn, args)
            })
        }
        Operation::Create(args) => {
            let conf = registry.modifiable_singleton(conf_file)?;
            let record = args.into_record();
            transactional(|txn| {
                let volume = VdoVolume::create(
                    ctx,
                    &conf,
                    txn,
                    record,
                    args.force,
                    args.log_level,
                )?;
                conf.borrow_mut().persist(ctx)?;
                announce_ready(&volume, true)
            })
        }
        Operation::Import(args) => {
            let conf = registry.modifiable_singleton(conf_file)?;
            let record = args.into_record();
            transactional(|txn| {
                let volume = VdoVolume::import(
                    ctx,
                    &conf,
                    txn,
                    record,
                    args.log_level,
                )?;
                conf.borrow_mut().persist(ctx)?;
                announce_ready(&volume, true)
            })
        }
        Operation::GrowLogical { name, size } => {
            let conf = registry.modifiable_singleton(conf_file)?;
            conf.borrow().get_vdo(name)?;
            let volume = VdoVolume::new(ctx, &conf, name);
            transactional(|txn| volume.grow_logical(txn, *size))?;
            conf.borrow_mut().persist(ctx)
        }
        Operation::GrowPhysical { name } => {
            let conf = registry.modifiable_singleton(conf_file)?;
            conf.borrow().get_vdo(name)?;
            let volume = VdoVolume::new(ctx, &conf, name);
            transactional(|txn| volume.grow_physical(txn))?;
            conf.borrow_mut().persist(ctx)
        }
        Operation::List { all } => list(ctx, conf_file, *all),
        Operation::PrintConfigFile => {
            let conf = Configuration::load(conf_file, true, true)?;
            print!("{}", conf.as_user_yaml()?);
            Ok(())
        }
        Operation::Status { name } => status(ctx, &registry, conf_file, name),
    }
}

/// Applies an operation to the selected volumes. A failure on one volume
/// does not keep it from being applied to the others; the registry is
/// persisted either way and the first error is re-raised.
fn apply_to_vdos(
    ctx: &RunContext,
    registry: &ConfigRegistry,
    conf_file: &Path,
    naming: &Naming,
    operation: impl Fn(&VdoVolume, &mut Transaction) -> Result<()>,
) -> Result<()> {
    let conf = registry.modifiable_singleton(conf_file)?;
    let names = resolve_names(&conf, naming)?;

    let mut first_error = None;
    for name in names {
        let volume = VdoVolume::new(ctx, &conf, &name);
        if let Err(e) = transactional(|txn| operation(&volume, txn)) {
            error!("operation failed on VDO {name}: {e}");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    let persisted = conf.borrow_mut().persist(ctx);
    match first_error {
        Some(e) => Err(e),
        None => persisted,
    }
}

fn resolve_names(conf: &SharedConfig, naming: &Naming) -> Result<Vec<String>> {
    match naming {
        Naming::All => Ok(conf.borrow().vdo_names()),
        Naming::Name(name) => {
            if name.trim().is_empty() {
                return Err(VdoError::User(
                    "Missing required argument '--name'".to_string(),
                ));
            }
            conf.borrow().get_vdo(name)?;
            Ok(vec![name.clone()])
        }
    }
}

fn announce_ready(volume: &VdoVolume, was_created: bool) -> Result<()> {
    if volume.running() {
        let instance = system::instance_number(volume.name())
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            "VDO instance {instance} volume is ready at {}",
            volume.path().display()
        );
    } else if was_created {
        info!("VDO volume created at {}", volume.path().display());
    } else if !volume.get(|r| r.activated)? {
        info!("VDO volume cannot be started (not activated)");
    }
    Ok(())
}

/// The names of running vdo targets, unioned with the configured ones
/// when `all` is requested, sorted.
fn list(ctx: &RunContext, conf_file: &Path, all: bool) -> Result<()> {
    static TARGET_RE: OnceLock<Regex> = OnceLock::new();
    let re = TARGET_RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?m)^(.+?): \d+ \d+ {} ",
            Defaults::TARGET_NAME
        ))
        .expect("static regex")
    });

    let output = run_command_with(
        ctx,
        &["dmsetup", "status"],
        RunOptions::new().no_throw(),
    )
    .unwrap_or_default();
    let mut names: Vec<String> = re
        .captures_iter(&output)
        .map(|c| c[1].to_string())
        .collect();

    if all {
        let conf = Configuration::load(conf_file, true, false)?;
        names.extend(conf.vdo_names());
    }
    names.sort();
    names.dedup();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn status(
    ctx: &RunContext,
    registry: &ConfigRegistry,
    conf_file: &Path,
    name: &Option<String>,
) -> Result<()> {
    let conf = registry.modifiable_singleton(conf_file)?;
    let is_root = nix::unistd::Uid::effective().is_root();

    let mut values = Mapping::new();
    values.insert(Value::from("Node"), Value::from(system::hostname()));
    values.insert(
        Value::from("Date"),
        Value::from(
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%:z").to_string(),
        ),
    );
    if !is_root {
        values.insert(
            Value::from("Note"),
            Value::from("Not running as root, some status may be unavailable"),
        );
    }

    let kernel_status = KernelModuleService::new().status(ctx);

    let mut conf_status = Mapping::new();
    for (key, value) in conf.borrow().status() {
        conf_status.insert(Value::from(key), Value::from(value));
    }

    let names = match name {
        Some(name) => {
            conf.borrow().get_vdo(name)?;
            vec![name.clone()]
        }
        None => conf.borrow().vdo_names(),
    };
    let mut vdos = Mapping::new();
    for name in names {
        let volume = VdoVolume::new(ctx, &conf, &name);
        let value = match volume.status(is_root) {
            Ok(status) => Value::Mapping(status),
            Err(e) => Value::from(e.to_string()),
        };
        vdos.insert(Value::from(name), value);
    }

    // Each section prints as its own document to keep the historical
    // output shape.
    print_section("VDO status", Value::Mapping(values))?;
    print_section("Kernel module", Value::Mapping(kernel_status))?;
    print_section("Configuration", Value::Mapping(conf_status))?;
    print_section("VDOs", Value::Mapping(vdos))?;
    debug!("status complete for {}", conf_file.display());
    Ok(())
}

fn print_section(title: &str, body: Value) -> Result<()> {
    let mut section = Mapping::new();
    section.insert(Value::from(title), body);
    let rendered = serde_yaml::to_string(&Value::Mapping(section))
        .map_err(|e| VdoError::Yaml(e.to_string()))?;
    print!("{rendered}");
    Ok(())
}
