//! The per-volume service: operations, invariants and the operation-state
//! machine.
//!
//! Each mutating operation that touches more than one source of truth
//! writes a begin-state marker into the registry before acting and flips
//! it to `finished` when done; [`recovery`] turns a leftover marker into
//! either an automatic repair or a refusal with cleanup instructions.

mod recovery;
pub mod table;

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::{SharedConfig, VdoRecord};
use crate::defaults::Defaults;
use crate::kmod::KernelModuleService;
use crate::runner::{
    RunContext, RunOptions, run_command, run_command_with,
};
use crate::size::{SECTOR_SIZE, SizeString, VDO_BLOCK_SIZE};
use crate::transaction::{Transaction, transactional};
use crate::types::{IndexMemory, LogLevel, OperationState, WritePolicy, enabled};
use crate::{Result, VdoError, system};
use table::DmTable;

/// Field offsets in `dmsetup status` output for the target.
mod status_fields {
    pub const DEDUPLICATION_STATUS: usize = 6;
}

/// Kernel deduplication states reported while the index comes up.
const DEDUP_STATUS_ERROR: &str = "error";
const DEDUP_STATUS_ONLINE: &str = "online";
const DEDUP_STATUS_OPENING: &str = "opening";

const REMOVE_RETRIES: u32 = 10;

/// Attributes that may be changed on an existing volume.
#[derive(Debug, Clone, Default)]
pub struct ModifyArgs {
    /// Present only to be rejected: the backing device is fixed at
    /// creation.
    pub device: Option<PathBuf>,
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
}

/// Validates that the arguments only name modifiable attributes.
pub fn validate_modifiable_options(args: &ModifyArgs) -> Result<()> {
    if args.device.is_some() {
        return Err(VdoError::User(
            "Cannot change option device after VDO creation".to_string(),
        ));
    }
    Ok(())
}

/// The hash zone, logical and physical thread counts must be all zero or
/// all non-zero.
pub fn validate_thread_counts(
    hash_zone: u32,
    logical: u32,
    physical: u32,
) -> Result<()> {
    let zeroes =
        [hash_zone, logical, physical].iter().filter(|&&n| n == 0).count();
    if zeroes != 0 && zeroes != 3 {
        return Err(VdoError::User(
            "hash zone, logical and physical threads must either all be \
             zero or all be non-zero"
                .to_string(),
        ));
    }
    Ok(())
}

/// On-disk metadata as reported by the dump tool.
#[derive(Debug, Deserialize)]
struct DumpedConfig {
    #[serde(rename = "UUID", default)]
    uuid: String,
    #[serde(rename = "VDOConfig")]
    vdo: DumpedVdoConfig,
    #[serde(rename = "IndexConfig", default)]
    index: Option<DumpedIndexConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DumpedVdoConfig {
    block_size: u64,
    physical_blocks: u64,
    logical_blocks: u64,
    #[serde(default)]
    slab_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DumpedIndexConfig {
    memory: IndexMemory,
    #[serde(default)]
    sparse: serde_yaml::Value,
    #[serde(default)]
    checkpoint_frequency: u32,
}

impl DumpedVdoConfig {
    fn logical_size(&self) -> SizeString {
        SizeString::from_sectors(
            self.logical_blocks * (self.block_size / SECTOR_SIZE),
        )
    }

    fn physical_size(&self) -> SizeString {
        SizeString::from_sectors(
            self.physical_blocks * (self.block_size / SECTOR_SIZE),
        )
    }
}

fn dump_config(ctx: &RunContext, device: &str) -> Result<DumpedConfig> {
    let output = run_command(ctx, &["vdodumpconfig", device])?;
    serde_yaml::from_str(&output).map_err(|e| {
        VdoError::System(format!("cannot read VDO metadata on {device}: {e}"))
    })
}

/// One managed volume: a handle over the shared registry plus the
/// execution context.
pub struct VdoVolume {
    pub(crate) name: String,
    pub(crate) ctx: RunContext,
    pub(crate) conf: SharedConfig,
}

impl VdoVolume {
    pub fn new(ctx: &RunContext, conf: &SharedConfig, name: &str) -> Self {
        VdoVolume {
            name: name.to_string(),
            ctx: ctx.clone(),
            conf: SharedConfig::clone(conf),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full path to the mapper device.
    pub fn path(&self) -> PathBuf {
        PathBuf::from("/dev/mapper").join(&self.name)
    }

    pub(crate) fn get<R>(
        &self,
        f: impl FnOnce(&VdoRecord) -> R,
    ) -> Result<R> {
        let conf = self.conf.borrow();
        Ok(f(conf.get_vdo(&self.name)?))
    }

    pub(crate) fn update<R>(
        &self,
        f: impl FnOnce(&mut VdoRecord) -> R,
    ) -> Result<R> {
        let mut conf = self.conf.borrow_mut();
        Ok(f(conf.get_vdo_mut(&self.name)?))
    }

    /// True if the kernel device exists. In dry-run mode the device is
    /// assumed not to be running.
    pub fn running(&self) -> bool {
        if self.ctx.no_run_mode() {
            return false;
        }
        run_command(&self.ctx, &["dmsetup", "status", &self.name]).is_ok()
    }

    /// Creates and starts a volume.
    ///
    /// The record carries the requested attributes; on success it is in
    /// the registry with its geometry read back from the formatted device
    /// and its operation state `finished`.
    pub fn create(
        ctx: &RunContext,
        conf: &SharedConfig,
        txn: &mut Transaction,
        mut record: VdoRecord,
        force: bool,
        log_level: Option<LogLevel>,
    ) -> Result<VdoVolume> {
        let name = record.name.clone();
        info!("Creating VDO {name}");

        if conf.borrow().have_vdo(&name) {
            let existing = VdoVolume::new(ctx, conf, &name);
            existing.handle_previous_operation_failure(txn)?;
            return Err(VdoError::AlreadyExists(name));
        }
        if conf.borrow().is_device_configured(&record.device) {
            return Err(VdoError::User(format!(
                "Device {} already configured for VDO use",
                record.device.display()
            )));
        }

        let volume = VdoVolume::new(ctx, conf, &name);
        if volume.running() {
            return Err(VdoError::AlreadyExists(name));
        }

        volume.validate_available_memory(record.index_memory)?;
        validate_thread_counts(
            record.hash_zone_threads,
            record.logical_threads,
            record.physical_threads,
        )?;

        if !ctx.no_run_mode() {
            if !record.device.exists() {
                return Err(VdoError::User(format!(
                    "{} does not exist",
                    record.device.display()
                )));
            }
            record.device = system::resolve_stable_name(&record.device);
        }

        if !force {
            volume.check_device_signatures(&record)?;
        }

        volume.install_kernel_module(log_level)?;

        // From here on a failure must take the new registry row with it.
        conf.borrow_mut().add_vdo(record.clone(), true);
        volume.set_operation_state(OperationState::BeginCreate)?;
        {
            let ctx = ctx.clone();
            let conf = SharedConfig::clone(conf);
            let name = name.clone();
            txn.add_undo_stage(move || {
                conf.borrow_mut().remove_vdo(&name);
                conf.borrow_mut().persist(&ctx)
            });
        }

        volume.format_target(&record, force)?;
        {
            let ctx = ctx.clone();
            let name = name.clone();
            let device = record.device.clone();
            txn.add_undo_stage(move || undo_create_cleanup(&ctx, &name, &device));
        }
        volume.read_back_geometry()?;

        if !record.uuid.is_empty() && !ctx.no_run_mode() {
            let device = record.device.display().to_string();
            run_command(ctx, &["vdosetuuid", "--uuid", &record.uuid, &device])?;
        }

        volume.start_within(txn, false)?;
        volume.set_operation_state(OperationState::Finished)?;
        Ok(volume)
    }

    /// Imports an existing formatted device: like create, but the on-disk
    /// metadata is read instead of written. An interrupted import is not
    /// automatically recoverable.
    pub fn import(
        ctx: &RunContext,
        conf: &SharedConfig,
        txn: &mut Transaction,
        mut record: VdoRecord,
        log_level: Option<LogLevel>,
    ) -> Result<VdoVolume> {
        let name = record.name.clone();
        info!("Importing VDO {name}");

        if conf.borrow().have_vdo(&name) {
            let existing = VdoVolume::new(ctx, conf, &name);
            existing.handle_previous_operation_failure(txn)?;
            return Err(VdoError::AlreadyExists(name));
        }
        if conf.borrow().is_device_configured(&record.device) {
            return Err(VdoError::User(format!(
                "Device {} already configured for VDO use",
                record.device.display()
            )));
        }
        let volume = VdoVolume::new(ctx, conf, &name);
        if volume.running() {
            return Err(VdoError::AlreadyExists(name));
        }

        if !ctx.no_run_mode() {
            if !record.device.exists() {
                return Err(VdoError::User(format!(
                    "{} does not exist",
                    record.device.display()
                )));
            }
            record.device = system::resolve_stable_name(&record.device);
        }

        volume.install_kernel_module(log_level)?;

        conf.borrow_mut().add_vdo(record.clone(), true);
        volume.set_operation_state(OperationState::BeginImport)?;
        {
            let ctx = ctx.clone();
            let conf = SharedConfig::clone(conf);
            let name = name.clone();
            txn.add_undo_stage(move || {
                conf.borrow_mut().remove_vdo(&name);
                conf.borrow_mut().persist(&ctx)
            });
        }

        if !ctx.no_run_mode() {
            let device = record.device.display().to_string();
            let dumped = dump_config(ctx, &device)?;
            volume.update(|r| {
                r.logical_size = dumped.vdo.logical_size();
                r.physical_size = dumped.vdo.physical_size();
                r.uuid = dumped.uuid.clone();
                if dumped.vdo.slab_size > 0 {
                    r.slab_size =
                        SizeString::from_blocks(dumped.vdo.slab_size);
                }
                if let Some(index) = &dumped.index {
                    r.index_memory = index.memory;
                    r.index_cfreq = index.checkpoint_frequency;
                    r.index_sparse = yaml_truthy(&index.sparse);
                }
            })?;
        }

        volume.start_within(txn, false)?;
        volume.set_operation_state(OperationState::Finished)?;
        Ok(volume)
    }

    /// Starts the volume. A volume that is not activated, or already
    /// running, is left alone with a notice.
    pub fn start(&self, txn: &mut Transaction, force_rebuild: bool) -> Result<()> {
        info!("Starting VDO {}", self.name);
        self.handle_previous_operation_failure(txn)?;
        self.start_within(txn, force_rebuild)
    }

    fn start_within(
        &self,
        txn: &mut Transaction,
        force_rebuild: bool,
    ) -> Result<()> {
        let record = self.get(|r| r.clone())?;
        if !record.activated {
            info!("VDO service {} not activated", self.name);
            return Ok(());
        }
        if self.running() {
            info!("VDO service {} already started", self.name);
            return Ok(());
        }

        self.validate_available_memory(record.index_memory)?;
        self.install_kernel_module(None)?;
        self.check_configuration(&record)?;

        if force_rebuild {
            let device = record.device.display().to_string();
            run_command(&self.ctx, &["vdoforcerebuild", &device]).map_err(
                |e| {
                    error!("Device {} not read-only", self.name);
                    VdoError::from(e)
                },
            )?;
        }

        let record = self.get(|r| r.clone())?;
        let table = DmTable::from_record(&record).to_string();
        let uuid = self.kernel_uuid(&record)?;
        run_command(
            &self.ctx,
            &["dmsetup", "create", &self.name, "--uuid", &uuid, "--table", &table],
        )
        .map_err(|e| {
            error!("Could not set up device mapper for {}", self.name);
            VdoError::from(e)
        })?;
        txn.add_undo_stage({
            let volume = self.clone_handle();
            move || volume.stop(true, None)
        });

        if !record.enable_deduplication {
            // Index startup races device creation; a failure to disable
            // here resolves itself at the next start.
            let _ = self.index_message("index-disable");
        }

        match system::instance_number(&self.name) {
            Some(instance) => {
                info!("started VDO service {} instance {instance}", self.name);
            }
            None => warn!(
                "unable to determine VDO service {} instance number",
                self.name
            ),
        }

        if record.enable_compression {
            self.compression_message(true).map_err(|e| {
                error!("Could not enable compression for {}", self.name);
                e
            })?;
        }

        // Fullness monitoring is best-effort; the daemon may not be
        // installed.
        let _ = run_command_with(
            &self.ctx,
            &["vdodmeventd", "-r", &self.name],
            RunOptions::new().no_throw(),
        );
        Ok(())
    }

    /// Stops the volume, refusing when held open or mounted (unless
    /// forced). `remove_steps`, when given, collects the cleanup command
    /// lines for the operator.
    pub fn stop(
        &self,
        force: bool,
        mut remove_steps: Option<&mut Vec<String>>,
    ) -> Result<()> {
        info!("Stopping VDO {}", self.name);
        let previous_failure = self.get(|r| r.previous_operation_failure())?;
        let execute = force || !previous_failure;

        if execute
            && !self.running()
            && !self.ctx.no_run_mode()
            && !previous_failure
        {
            info!("VDO service {} already stopped", self.name);
            return Ok(());
        }

        if execute && self.running() {
            let holders = system::holders(&self.path())?;
            if !holders.is_empty() {
                return Err(VdoError::State(format!(
                    "cannot stop VDO volume {}, in use by {}",
                    self.name,
                    holders.join(", ")
                )));
            }
        }

        let path = self.path().display().to_string();
        if self.has_mounts() || !execute {
            let command = format!("umount -f {path}");
            if let Some(steps) = remove_steps.as_deref_mut() {
                steps.push(command);
            }
            if execute {
                if force {
                    let _ = run_command_with(
                        &self.ctx,
                        &["umount", "-f", &path],
                        RunOptions::new().no_throw(),
                    );
                } else {
                    return Err(VdoError::State(format!(
                        "cannot stop VDO volume with mounts {}",
                        self.name
                    )));
                }
            }
        }

        // udevd may wake up and run blkid against the device at any time
        // (the unmount above can trigger exactly that); wait out its event
        // queue before removal.
        if let Some(steps) = remove_steps.as_deref_mut() {
            steps.push("udevadm settle".to_string());
        }
        if execute {
            let _ = run_command_with(
                &self.ctx,
                &["udevadm", "settle"],
                RunOptions::new().no_throw(),
            );
        }

        if let Some(steps) = remove_steps.as_deref_mut() {
            steps.push(format!("vdodmeventd -u {}", self.name));
        }
        if execute {
            let _ = run_command_with(
                &self.ctx,
                &["vdodmeventd", "-u", &self.name],
                RunOptions::new().no_throw(),
            );
        }

        if let Some(steps) = remove_steps.as_deref_mut() {
            steps.push(format!("dmsetup remove {}", self.name));
        }
        if execute {
            for _ in 0..REMOVE_RETRIES {
                match run_command(
                    &self.ctx,
                    &["dmsetup", "remove", &self.name],
                ) {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        if !e.to_string().contains("Device or resource busy") {
                            break;
                        }
                    }
                }
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        }

        if !execute {
            let operation = self
                .get(|r| r.effective_operation_state().operation_name())?;
            return Err(VdoError::PreviousOperationFailure {
                name: self.name.clone(),
                operation: operation.to_string(),
                steps: Vec::new(),
            });
        }

        if self.running() {
            return Err(VdoError::State(format!(
                "cannot stop VDO service {}",
                self.name
            )));
        }
        Ok(())
    }

    /// Removes the volume: stop, delete the registry row, then clear the
    /// on-disk metadata (in that order, so a failure never leaves a
    /// registry row pointing at wiped metadata unnoticed).
    pub fn remove(&self, txn: &mut Transaction, force: bool) -> Result<()> {
        info!("Removing VDO {}", self.name);

        let mut local_steps = Vec::new();
        let attach_steps = |e: VdoError, steps: Vec<String>| match e {
            VdoError::PreviousOperationFailure { name, operation, .. } => {
                VdoError::PreviousOperationFailure { name, operation, steps }
            }
            other => other,
        };
        if let Err(e) = self.stop(force, Some(&mut local_steps)) {
            return Err(attach_steps(e, local_steps));
        }
        if !force {
            if let Err(e) = self.handle_previous_operation_failure(txn) {
                return Err(attach_steps(e, local_steps));
            }
        }

        let device = self.get(|r| r.device.clone())?;
        {
            let mut conf = self.conf.borrow_mut();
            conf.remove_vdo(&self.name);
            conf.persist(&self.ctx)?;
        }
        self.clear_metadata(&device)
    }

    /// Grows the logical size of a running volume. The new size is rounded
    /// down to a block multiple and must be strictly larger than the
    /// current size.
    pub fn grow_logical(
        &self,
        txn: &mut Transaction,
        new_size: SizeString,
    ) -> Result<()> {
        self.handle_previous_operation_failure(txn)?;
        if !self.running() {
            return Err(VdoError::State(format!(
                "VDO volume {} must be running",
                self.name
            )));
        }

        let new_size = new_size.round_to_block();
        let current = self.get(|r| r.logical_size)?;
        if new_size < current {
            return Err(VdoError::User(format!(
                "Can't shrink a VDO volume (old size {current})"
            )));
        }
        if new_size == current {
            return Err(VdoError::User(format!(
                "Can't grow a VDO volume by less than {VDO_BLOCK_SIZE} bytes"
            )));
        }

        self.set_operation_state(OperationState::BeginGrowLogical)?;
        info!("Increasing logical size of VDO volume {}", self.name);

        transactional(|txn| {
            txn.set_message(format!(
                "Cannot prepare to grow logical on VDO {}",
                self.name
            ));
            let mut table = self.current_table()?;
            table.num_sectors = new_size.to_sectors();
            txn.set_message(format!(
                "Device {} could not be changed",
                self.name
            ));
            self.reload_table(&table)?;
            txn.clear_message();

            self.suspend(true)?;
            txn.add_undo_stage({
                let volume = self.clone_handle();
                move || volume.resume()
            });
            self.resume()
        })?;

        if self.ctx.no_run_mode() {
            self.update(|r| r.logical_size = new_size)?;
        } else {
            let device = self.get(|r| r.device.display().to_string())?;
            let dumped = dump_config(&self.ctx, &device)?;
            self.update(|r| r.logical_size = dumped.vdo.logical_size())?;
        }
        info!("Increased logical size of VDO volume {}", self.name);
        self.set_operation_state(OperationState::Finished)
    }

    /// Grows the physical size of a running volume to the current size of
    /// its backing device.
    pub fn grow_physical(&self, txn: &mut Transaction) -> Result<()> {
        self.handle_previous_operation_failure(txn)?;
        if !self.running() {
            return Err(VdoError::State(format!(
                "VDO volume {} must be running",
                self.name
            )));
        }

        self.set_operation_state(OperationState::BeginGrowPhysical)?;
        info!("Increasing physical size of VDO volume {}", self.name);

        let device = self.get(|r| r.device.clone())?;
        transactional(|txn| {
            txn.set_message(format!(
                "Cannot prepare to grow physical on VDO {}",
                self.name
            ));
            let mut table = self.current_table()?;
            if !self.ctx.no_run_mode() {
                let sectors = system::device_size_sectors(&device)?;
                table.physical_blocks =
                    SizeString::from_sectors(sectors).to_blocks();
            }
            txn.set_message(format!(
                "Device {} could not be changed",
                self.name
            ));
            self.reload_table(&table)?;
            txn.clear_message();

            self.suspend(true)?;
            txn.add_undo_stage({
                let volume = self.clone_handle();
                move || volume.resume()
            });
            self.resume()
        })?;

        if !self.ctx.no_run_mode() {
            let device = device.display().to_string();
            let dumped = dump_config(&self.ctx, &device)?;
            self.update(|r| r.physical_size = dumped.vdo.physical_size())?;
        }
        info!("Increased physical size of VDO volume {}", self.name);
        self.set_operation_state(OperationState::Finished)
    }

    /// Changes the write policy. A stopped volume only records the new
    /// value; a running one is reloaded under a recovery marker.
    pub fn set_write_policy(
        &self,
        txn: &mut Transaction,
        policy: WritePolicy,
    ) -> Result<()> {
        self.handle_previous_operation_failure(txn)?;
        let current = self.get(|r| r.write_policy)?;
        if policy == current {
            return Ok(());
        }
        self.update(|r| r.write_policy = policy)?;

        if self.running() {
            self.set_operation_state(
                OperationState::BeginRunningSetWritePolicy,
            )?;
            self.perform_running_set_write_policy()?;
            self.set_operation_state(OperationState::Finished)?;
        }
        Ok(())
    }

    pub(crate) fn perform_running_set_write_policy(&self) -> Result<()> {
        transactional(|txn| {
            self.suspend(false)?;
            txn.add_undo_stage({
                let volume = self.clone_handle();
                move || volume.resume()
            });

            txn.set_message(format!(
                "Device {} could not be read",
                self.name
            ));
            let mut table = self.current_table()?;
            table.write_policy = self.get(|r| r.write_policy)?;
            txn.set_message(format!(
                "Device {} could not be changed",
                self.name
            ));
            self.reload_table(&table)?;
            txn.clear_message();
            self.resume()
        })
    }

    /// Changes the compression setting; effective immediately when the
    /// volume is running.
    pub fn set_compression(
        &self,
        txn: &mut Transaction,
        enable: bool,
    ) -> Result<()> {
        info!(
            "{} compression on VDO {}",
            if enable { "Enabling" } else { "Disabling" },
            self.name
        );
        self.handle_previous_operation_failure(txn)?;
        let current = self.get(|r| r.enable_compression)?;
        if current == enable {
            info!(
                "compression already {} on VDO {}",
                enabled::as_str(enable),
                self.name
            );
            return Ok(());
        }
        self.update(|r| r.enable_compression = enable)?;
        if self.running() {
            self.compression_message(enable)?;
        }
        Ok(())
    }

    /// Changes the deduplication setting; effective immediately when the
    /// volume is running. Enabling waits for the index to come up.
    pub fn set_deduplication(
        &self,
        txn: &mut Transaction,
        enable: bool,
    ) -> Result<()> {
        info!(
            "{} deduplication on VDO {}",
            if enable { "Enabling" } else { "Disabling" },
            self.name
        );
        self.handle_previous_operation_failure(txn)?;
        let current = self.get(|r| r.enable_deduplication)?;
        if current == enable {
            info!(
                "deduplication already {} on VDO {}",
                enabled::as_str(enable),
                self.name
            );
            return Ok(());
        }
        self.update(|r| r.enable_deduplication = enable)?;

        if !self.running() {
            return Ok(());
        }
        if !enable {
            return self.index_message("index-disable").map_err(|e| {
                error!("Cannot stop deduplication on VDO {}", self.name);
                e
            });
        }

        self.index_message("index-enable")?;
        let mut status = self.deduplication_status();
        for _ in 0..Defaults::DEDUPLICATION_TIMEOUT {
            if status != DEDUP_STATUS_OPENING {
                break;
            }
            std::thread::sleep(std::time::Duration::from_secs(1));
            status = self.deduplication_status();
        }
        match status.as_str() {
            DEDUP_STATUS_ONLINE => Ok(()),
            DEDUP_STATUS_ERROR => Err(VdoError::State(format!(
                "Error enabling deduplication for {}",
                self.name
            ))),
            DEDUP_STATUS_OPENING => {
                warn!(
                    "Timeout enabling deduplication for {}, continuing",
                    self.name
                );
                Ok(())
            }
            other => Err(VdoError::State(format!(
                "Unexpected kernel status {other} enabling deduplication \
                 for {}",
                self.name
            ))),
        }
    }

    /// Marks the volume as activated.
    pub fn activate(&self, txn: &mut Transaction) -> Result<()> {
        self.handle_previous_operation_failure(txn)?;
        if self.get(|r| r.activated)? {
            info!("{} already activated", self.name);
            return Ok(());
        }
        info!("Activating VDO {}", self.name);
        self.update(|r| r.activated = true)
    }

    /// Marks the volume as not activated.
    pub fn deactivate(&self, txn: &mut Transaction) -> Result<()> {
        self.handle_previous_operation_failure(txn)?;
        if !self.get(|r| r.activated)? {
            info!("{} already deactivated", self.name);
            return Ok(());
        }
        info!("Deactivating VDO {}", self.name);
        self.update(|r| r.activated = false)
    }

    /// Applies any of the modifiable attributes. Most changes take effect
    /// at the next start; a UUID change requires the volume to be stopped
    /// and is written to the device immediately.
    pub fn set_modifiable_options(
        &self,
        txn: &mut Transaction,
        args: &ModifyArgs,
    ) -> Result<()> {
        self.handle_previous_operation_failure(txn)?;

        let record = self.get(|r| r.clone())?;
        validate_thread_counts(
            args.hash_zone_threads.unwrap_or(record.hash_zone_threads),
            args.logical_threads.unwrap_or(record.logical_threads),
            args.physical_threads.unwrap_or(record.physical_threads),
        )?;

        if let Some(uuid) = &args.uuid {
            self.change_uuid(uuid)?;
        }

        let mut modified = args.uuid.is_some();
        self.update(|r| {
            let mut set = |changed: bool| modified |= changed;
            if let Some(v) = args.block_map_cache_size {
                r.block_map_cache_size = v;
                set(true);
            }
            if let Some(v) = args.block_map_period {
                r.block_map_period = v;
                set(true);
            }
            if let Some(v) = args.max_discard_size {
                r.max_discard_size = v;
                set(true);
            }
            if let Some(v) = args.ack_threads {
                r.ack_threads = v;
                set(true);
            }
            if let Some(v) = args.bio_rotation_interval {
                r.bio_rotation_interval = v;
                set(true);
            }
            if let Some(v) = args.bio_threads {
                r.bio_threads = v;
                set(true);
            }
            if let Some(v) = args.cpu_threads {
                r.cpu_threads = v;
                set(true);
            }
            if let Some(v) = args.hash_zone_threads {
                r.hash_zone_threads = v;
                set(true);
            }
            if let Some(v) = args.logical_threads {
                r.logical_threads = v;
                set(true);
            }
            if let Some(v) = args.physical_threads {
                r.physical_threads = v;
                set(true);
            }
        })?;

        if modified && self.running() {
            info!(
                "Note: Changes will not apply until VDO {} is restarted",
                self.name
            );
        }
        Ok(())
    }

    fn change_uuid(&self, uuid: &str) -> Result<()> {
        if self.running() {
            return Err(VdoError::State(format!(
                "cannot change the UUID of running VDO volume {}",
                self.name
            )));
        }
        if !uuid.is_empty() {
            // The new UUID must be unique among every known volume. The
            // registry entry may predate UUID tracking, in which case the
            // device itself is asked.
            let others: Vec<(String, String, PathBuf)> = self
                .conf
                .borrow()
                .all_vdos()
                .filter(|other| other.name != self.name)
                .map(|o| (o.name.clone(), o.uuid.clone(), o.device.clone()))
                .collect();
            for (other_name, other_uuid, other_device) in others {
                let other_uuid = if other_uuid.is_empty() {
                    let device = other_device.display().to_string();
                    run_command_with(
                        &self.ctx,
                        &["blkid", "-s", "UUID", "-o", "value", &device],
                        RunOptions::new().stripped().no_throw(),
                    )
                    .unwrap_or_default()
                } else {
                    other_uuid
                };
                if other_uuid == uuid {
                    return Err(VdoError::User(format!(
                        "UUID {uuid} already in use by VDO volume \
                         {other_name}"
                    )));
                }
            }
        }

        let device = self.get(|r| r.device.display().to_string())?;
        if uuid.is_empty() {
            run_command(&self.ctx, &["vdosetuuid", &device])?;
        } else {
            run_command(&self.ctx, &["vdosetuuid", "--uuid", uuid, &device])?;
        }
        let new_uuid = if self.ctx.no_run_mode() || !uuid.is_empty() {
            uuid.to_string()
        } else {
            dump_config(&self.ctx, &device)?.uuid
        };
        self.update(|r| r.uuid = new_uuid)
    }

    /// The status report for this volume.
    pub fn status(&self, is_root: bool) -> Result<serde_yaml::Mapping> {
        transactional(|txn| self.handle_previous_operation_failure(txn))?;

        let record = self.get(|r| r.clone())?;
        let mut status = serde_yaml::Mapping::new();
        let mut put = |key: &str, value: serde_yaml::Value| {
            status.insert(serde_yaml::Value::from(key), value);
        };
        let text =
            |value: String| serde_yaml::Value::String(value);

        put("Storage device", text(record.device.display().to_string()));
        put(
            "Block map cache size",
            text(record.block_map_cache_size.to_string()),
        );
        put("Block map period", record.block_map_period.into());
        put("Block size", VDO_BLOCK_SIZE.into());
        put(
            "Emulate 512 byte",
            text(enabled::as_str(record.logical_block_size == 512).into()),
        );
        put("Activate", text(enabled::as_str(record.activated).into()));
        put(
            "Compression",
            text(enabled::as_str(record.enable_compression).into()),
        );
        put(
            "Deduplication",
            text(enabled::as_str(record.enable_deduplication).into()),
        );
        put("Logical size", text(record.logical_size.to_string()));
        put("Physical size", text(record.physical_size.to_string()));
        put("Acknowledgement threads", record.ack_threads.into());
        put("Bio submission threads", record.bio_threads.into());
        put("Bio rotation interval", record.bio_rotation_interval.into());
        put("CPU-work threads", record.cpu_threads.into());
        put("Hash zone threads", record.hash_zone_threads.into());
        put("Logical threads", record.logical_threads.into());
        put("Physical threads", record.physical_threads.into());
        put("Slab size", text(record.slab_size.to_string()));
        put("Max discard size", text(record.max_discard_size.to_string()));
        put("Configured write policy", text(record.write_policy.to_string()));
        put("Index checkpoint frequency", record.index_cfreq.into());
        put("Index memory setting", text(record.index_memory.to_string()));
        put("Index parallel factor", record.index_threads.into());
        put(
            "Index sparse",
            text(enabled::as_str(record.index_sparse).into()),
        );
        put("Index status", text(self.deduplication_status()));

        if is_root {
            put("Device mapper status", text(self.device_mapper_status()));
            let path = self.path().display().to_string();
            let statistics = run_command(
                &self.ctx,
                &["vdostats", "--verbose", &path],
            )
            .ok()
            .and_then(|out| serde_yaml::from_str(&out).ok())
            .unwrap_or_else(|| {
                serde_yaml::Value::String("not available".to_string())
            });
            put("VDO statistics", statistics);
        }
        Ok(status)
    }

    pub(crate) fn set_operation_state(
        &self,
        state: OperationState,
    ) -> Result<()> {
        self.update(|r| r.operation_state = state)?;
        self.conf.borrow_mut().persist(&self.ctx)
    }

    pub(crate) fn clone_handle(&self) -> VdoVolume {
        VdoVolume {
            name: self.name.clone(),
            ctx: self.ctx.clone(),
            conf: SharedConfig::clone(&self.conf),
        }
    }

    pub(crate) fn suspend(&self, noflush: bool) -> Result<()> {
        debug!("Suspending VDO volume {}", self.name);
        let result = if noflush {
            run_command(
                &self.ctx,
                &["dmsetup", "suspend", "--noflush", &self.name],
            )
        } else {
            run_command(&self.ctx, &["dmsetup", "suspend", &self.name])
        };
        result.map_err(|e| {
            error!("Can't suspend VDO volume {}; {e}", self.name);
            VdoError::from(e)
        })?;
        Ok(())
    }

    pub(crate) fn resume(&self) -> Result<()> {
        debug!("Resuming VDO volume {}", self.name);
        run_command(&self.ctx, &["dmsetup", "resume", &self.name]).map_err(
            |e| {
                error!("Can't resume VDO volume {}; {e}", self.name);
                VdoError::from(e)
            },
        )?;
        Ok(())
    }

    pub(crate) fn current_table(&self) -> Result<DmTable> {
        if self.ctx.no_run_mode() {
            return Ok(DmTable::from_record(&self.get(|r| r.clone())?));
        }
        let output =
            run_command(&self.ctx, &["dmsetup", "table", &self.name])?;
        DmTable::parse(output.trim_end())
    }

    pub(crate) fn reload_table(&self, table: &DmTable) -> Result<()> {
        let line = table.to_string();
        run_command(
            &self.ctx,
            &["dmsetup", "reload", &self.name, "--table", &line],
        )?;
        Ok(())
    }

    fn index_message(&self, message: &str) -> Result<()> {
        run_command(
            &self.ctx,
            &["dmsetup", "message", &self.name, "0", message],
        )?;
        Ok(())
    }

    fn compression_message(&self, enable: bool) -> Result<()> {
        if !self.running() {
            return Ok(());
        }
        info!(
            "{} compression on VDO {}",
            if enable { "Starting" } else { "Stopping" },
            self.name
        );
        run_command(
            &self.ctx,
            &[
                "dmsetup",
                "message",
                &self.name,
                "0",
                "compression",
                if enable { "on" } else { "off" },
            ],
        )?;
        Ok(())
    }

    pub(crate) fn deduplication_status(&self) -> String {
        let output =
            match run_command(&self.ctx, &["dmsetup", "status", &self.name]) {
                Ok(output) => output,
                Err(_) => return "not available".to_string(),
            };
        output
            .split_whitespace()
            .nth(status_fields::DEDUPLICATION_STATUS)
            .unwrap_or("not available")
            .to_string()
    }

    fn device_mapper_status(&self) -> String {
        run_command_with(
            &self.ctx,
            &["dmsetup", "status", &self.name],
            RunOptions::new()
                .stripped()
                .with_env("UDS_LOG_LEVEL", "WARNING"),
        )
        .map(|s| s.replace('"', ""))
        .unwrap_or_else(|_| "not available".to_string())
    }

    fn has_mounts(&self) -> bool {
        let output = run_command_with(
            &self.ctx,
            &["mount"],
            RunOptions::new().no_throw(),
        )
        .unwrap_or_default();
        let path = self.path().display().to_string();
        output.lines().any(|line| {
            line.split_whitespace().any(|token| token == path)
        })
    }

    fn validate_available_memory(&self, memory: IndexMemory) -> Result<()> {
        let needed = memory.to_size();
        let Some(available) = system::available_memory() else {
            info!("Unable to validate available memory");
            return Ok(());
        };
        if needed >= available {
            return Err(VdoError::User(format!(
                "Not enough available memory in system for index \
                 requirement of {needed}"
            )));
        }
        Ok(())
    }

    /// Invariant checks performed at start: the block map cache must cover
    /// the logical zones, and the block map period is clamped to its legal
    /// range.
    fn check_configuration(&self, record: &VdoRecord) -> Result<()> {
        let cache_pages = record.block_map_cache_size.to_blocks();
        if cache_pages < 2 * 2048 * record.logical_threads as u64 {
            return Err(VdoError::State(format!(
                "Insufficient block map cache for {}",
                self.name
            )));
        }
        let clamped = record
            .block_map_period
            .clamp(Defaults::BLOCK_MAP_PERIOD_MIN, Defaults::BLOCK_MAP_PERIOD_MAX);
        if clamped != record.block_map_period {
            self.update(|r| r.block_map_period = clamped)?;
        }
        Ok(())
    }

    fn install_kernel_module(&self, log_level: Option<LogLevel>) -> Result<()> {
        let kms = KernelModuleService::new();
        kms.start(&self.ctx).map_err(|e| {
            error!("Kernel module {} not installed", kms.name());
            e
        })?;
        if let Some(level) = log_level {
            kms.set_log_level(&self.ctx, level);
        }
        Ok(())
    }

    /// Pre-flight probe of the backing device, performed unless forced:
    /// delegate the signature checks to the LVM probe, falling back to a
    /// plain blkid scan when the probe is unavailable.
    fn check_device_signatures(&self, record: &VdoRecord) -> Result<()> {
        let device = record.device.display().to_string();
        let probe = run_command(
            &self.ctx,
            &[
                "pvcreate",
                "--config",
                "devices/scan_lvs=1",
                "-qq",
                "--test",
                &device,
            ],
        );
        let error = match probe {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        if error.exit_code == 2 && error.stderr.is_empty() {
            // The probe never ran (no such binary); fall back to blkid,
            // for which "nothing found" is exit status 2.
            return match run_command(&self.ctx, &["blkid", "-p", &device]) {
                Ok(output) => Err(VdoError::State(format!(
                    "{} detected on {device}; use --force to override",
                    output.trim(),
                ))),
                Err(e) if e.exit_code == 2 => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        // The probe's messages are not localized; pick the detection out
        // of its TEST MODE report.
        let lines: Vec<&str> = error.stderr.lines().collect();
        if lines.len() > 1 && lines[0].trim_start().starts_with("TEST MODE") {
            let detection = regex::Regex::new(
                r"WARNING: (.* detected .*)\.\s+Wipe it\?",
            )
            .expect("static regex")
            .captures(lines[1]);
            if let Some(captures) = detection {
                return Err(VdoError::State(format!(
                    "{}; use --force to override",
                    &captures[1]
                )));
            }
            let message = lines[1].to_string();
            let mut error = error;
            error.set_message(message);
            return Err(error.into());
        }
        Err(error.into())
    }

    fn format_target(&self, record: &VdoRecord, force: bool) -> Result<()> {
        debug!("construction - formatting backing device; vdo {}", self.name);
        let mut command: Vec<String> = vec![
            "vdoformat".to_string(),
            format!("--uds-checkpoint-frequency={}", record.index_cfreq),
            format!("--uds-memory-size={}", record.index_memory),
        ];
        if record.index_sparse {
            command.push("--uds-sparse".to_string());
        }
        if !record.logical_size.is_zero() {
            command.push(format!(
                "--logical-size={}",
                record.logical_size.as_lvm_text()
            ));
        }
        let slab_size = if record.slab_size.is_zero() {
            Defaults::SLAB_SIZE
        } else {
            record.slab_size
        };
        command.push(format!("--slab-bits={}", slab_bits(slab_size)));
        if force {
            command.push("--force".to_string());
        }
        command.push(record.device.display().to_string());

        let argv: Vec<&str> = command.iter().map(String::as_str).collect();
        run_command(&self.ctx, &argv)?;
        Ok(())
    }

    fn read_back_geometry(&self) -> Result<()> {
        if self.ctx.no_run_mode() {
            return Ok(());
        }
        let device = self.get(|r| r.device.display().to_string())?;
        let dumped = dump_config(&self.ctx, &device)?;
        self.update(|r| {
            r.physical_size = dumped.vdo.physical_size();
            r.logical_size = dumped.vdo.logical_size();
            if r.uuid.is_empty() {
                r.uuid = dumped.uuid;
            }
        })
    }

    fn kernel_uuid(&self, record: &VdoRecord) -> Result<String> {
        if self.ctx.no_run_mode() {
            return Ok(format!("VDO-{}", record.uuid));
        }
        let device = record.device.display().to_string();
        let dumped = dump_config(&self.ctx, &device)?;
        Ok(format!("VDO-{}", dumped.uuid))
    }

    /// Overwrites the first metadata block of the backing device, iff it
    /// is a block device no other kernel device holds open.
    fn clear_metadata(&self, device: &std::path::Path) -> Result<()> {
        if !self.ctx.no_run_mode() {
            if !system::is_block_device(device) {
                debug!(
                    "Not clearing {}, not a block device",
                    device.display()
                );
                return Ok(());
            }
            if !system::holders(device)?.is_empty() {
                debug!("Not clearing {}, device has holders", device.display());
                return Ok(());
            }
        }
        let of = format!("of={}", device.display());
        run_command(
            &self.ctx,
            &["dd", "if=/dev/zero", &of, "oflag=direct", "bs=4096", "count=1"],
        )?;
        Ok(())
    }
}

fn slab_bits(slab_size: SizeString) -> u32 {
    slab_size.to_blocks().ilog2()
}

fn yaml_truthy(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::Bool(b) => *b,
        serde_yaml::Value::Number(n) => n.as_u64().unwrap_or(0) != 0,
        serde_yaml::Value::String(s) => s == "true" || s == "1",
        _ => false,
    }
}

fn undo_create_cleanup(
    ctx: &RunContext,
    name: &str,
    device: &std::path::Path,
) -> Result<()> {
    let _ = run_command_with(
        ctx,
        &["dmsetup", "remove", name],
        RunOptions::new().no_throw(),
    );
    if system::is_block_device(device)
        && system::holders(device)?.is_empty()
    {
        let of = format!("of={}", device.display());
        let _ = run_command_with(
            ctx,
            &["dd", "if=/dev/zero", &of, "oflag=direct", "bs=4096", "count=1"],
            RunOptions::new().no_throw(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_triple_must_be_all_zero_or_all_nonzero() {
        assert!(validate_thread_counts(0, 0, 0).is_ok());
        assert!(validate_thread_counts(1, 2, 3).is_ok());
        assert!(validate_thread_counts(0, 2, 2).is_err());
        assert!(validate_thread_counts(1, 0, 2).is_err());
        assert!(validate_thread_counts(1, 2, 0).is_err());
    }

    #[test]
    fn device_is_not_modifiable() {
        let args = ModifyArgs {
            device: Some(PathBuf::from("/dev/sdy")),
            ..ModifyArgs::default()
        };
        let err = validate_modifiable_options(&args).unwrap_err();
        assert!(
            err.to_string()
                .contains("Cannot change option device after VDO creation")
        );
        assert!(validate_modifiable_options(&ModifyArgs::default()).is_ok());
    }

    #[test]
    fn slab_bits_follow_the_slab_size() {
        assert_eq!(slab_bits("2G".parse().unwrap()), 19);
        assert_eq!(slab_bits("128M".parse().unwrap()), 15);
        assert_eq!(slab_bits("32G".parse().unwrap()), 23);
    }

    #[test]
    fn dump_output_parses() {
        let yaml = "\
UUID: 6bde36f4-b4c8-4e02-a875-15f4053a2afd
VDOConfig:
  blockSize: 4096
  physicalBlocks: 2621440
  logicalBlocks: 524288
  slabSize: 524288
IndexConfig:
  memory: 0.25
  sparse: 0
  checkpointFrequency: 0
";
        let dumped: DumpedConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(dumped.uuid, "6bde36f4-b4c8-4e02-a875-15f4053a2afd");
        assert_eq!(
            dumped.vdo.logical_size(),
            "2G".parse::<SizeString>().unwrap()
        );
        assert_eq!(
            dumped.vdo.physical_size(),
            "10G".parse::<SizeString>().unwrap()
        );
        let index = dumped.index.unwrap();
        assert_eq!(index.memory, IndexMemory::Quarter);
        assert!(!yaml_truthy(&index.sparse));
    }
}
