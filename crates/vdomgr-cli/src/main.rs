//! The `vdomgr` command line tool.
//!
//! A declarative command table feeding the library dispatcher; every
//! option carries its validator as a value parser, so anything that makes
//! it past parsing is already normalized.

use std::path::PathBuf;

use clap::Parser;

use vdomgr::defaults::{
    self, Defaults, check_blkdev, check_block_map_period, check_index_mem,
    check_log_level, check_logical_size, check_max_discard_size,
    check_not_block_file, check_page_cache_size, check_physical_thread_count,
    check_rotation_interval, check_slab_size, check_thread_count_0_100,
    check_thread_count_1_100, check_uuid, check_vdo_name, check_write_policy,
};
use vdomgr::ops::{
    CreateArgs, GlobalOptions, ImportArgs, Naming, Operation, run,
};
use vdomgr::size::SizeString;
use vdomgr::types::{IndexMemory, LogLevel, WritePolicy};
use vdomgr::volume::ModifyArgs;

fn check_enabled(value: &str) -> Result<bool, String> {
    defaults::check_enabled(value)
}

#[derive(Debug, Parser)]
#[command(
    name = "vdomgr",
    version,
    about = "Manage deduplicating device-mapper volumes"
)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct Globals {
    /// Configuration file to use
    #[arg(
        short = 'f',
        long = "confFile",
        global = true,
        value_name = "file",
        value_parser = check_not_block_file
    )]
    conf_file: Option<PathBuf>,

    /// File to which log messages are directed; defaults to the terminal
    #[arg(
        long,
        global = true,
        value_name = "pathname",
        value_parser = check_not_block_file
    )]
    logfile: Option<PathBuf>,

    /// Print commands before executing them
    #[arg(long, global = true)]
    verbose: bool,

    /// Enable debugging output
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    /// Print commands instead of executing them
    #[arg(long = "noRun", global = true, hide = true)]
    no_run: bool,
}

/// Exactly one of `--name` or `--all`.
#[derive(Debug, clap::Args)]
#[group(required = true, multiple = false)]
struct NamingArgs {
    /// Operate on the specified VDO volume
    #[arg(short = 'n', long, value_name = "volume", value_parser = check_vdo_name)]
    name: Option<String>,

    /// Operate on all known VDO volumes
    #[arg(short = 'a', long)]
    all: bool,
}

impl NamingArgs {
    fn naming(&self) -> Naming {
        match &self.name {
            Some(name) => Naming::Name(name.clone()),
            None => Naming::All,
        }
    }
}

#[derive(Debug, clap::Args)]
struct CreateCommand {
    /// Name of the new VDO volume
    #[arg(short = 'n', long, required = true, value_name = "volume", value_parser = check_vdo_name)]
    name: String,

    /// Storage device backing the volume
    #[arg(long, required = true, value_name = "device", value_parser = check_blkdev)]
    device: PathBuf,

    /// Start the volume automatically
    #[arg(long, value_name = "enabled|disabled", value_parser = check_enabled)]
    activate: Option<bool>,

    #[arg(long, value_name = "enabled|disabled", value_parser = check_enabled)]
    compression: Option<bool>,

    #[arg(long, value_name = "enabled|disabled", value_parser = check_enabled)]
    deduplication: Option<bool>,

    /// Present a 512-byte logical block size to the layers above
    #[arg(long, value_name = "enabled|disabled", value_parser = check_enabled)]
    emulate512: Option<bool>,

    #[arg(long = "sparseIndex", value_name = "enabled|disabled", value_parser = check_enabled)]
    sparse_index: Option<bool>,

    /// Index memory in gigabytes, or 0.25, 0.5 or 0.75
    #[arg(long = "indexMem", value_name = "gigabytes", value_parser = check_index_mem)]
    index_mem: Option<IndexMemory>,

    #[arg(long, value_name = "uuid", value_parser = check_uuid)]
    uuid: Option<String>,

    #[arg(long = "vdoLogicalSize", value_name = "megabytes", value_parser = check_logical_size)]
    vdo_logical_size: Option<SizeString>,

    #[arg(long = "vdoSlabSize", value_name = "megabytes", value_parser = check_slab_size)]
    vdo_slab_size: Option<SizeString>,

    #[arg(long = "blockMapCacheSize", value_name = "megabytes", value_parser = check_page_cache_size)]
    block_map_cache_size: Option<SizeString>,

    #[arg(long = "blockMapPeriod", value_name = "period", value_parser = check_block_map_period)]
    block_map_period: Option<u32>,

    #[arg(long = "maxDiscardSize", value_name = "megabytes", value_parser = check_max_discard_size)]
    max_discard_size: Option<SizeString>,

    #[arg(long = "vdoAckThreads", value_name = "threads", value_parser = check_thread_count_0_100)]
    vdo_ack_threads: Option<u32>,

    #[arg(long = "vdoBioRotationInterval", value_name = "ios", value_parser = check_rotation_interval)]
    vdo_bio_rotation_interval: Option<u32>,

    #[arg(long = "vdoBioThreads", value_name = "threads", value_parser = check_thread_count_1_100)]
    vdo_bio_threads: Option<u32>,

    #[arg(long = "vdoCpuThreads", value_name = "threads", value_parser = check_thread_count_1_100)]
    vdo_cpu_threads: Option<u32>,

    #[arg(long = "vdoHashZoneThreads", value_name = "threads", value_parser = check_thread_count_0_100)]
    vdo_hash_zone_threads: Option<u32>,

    #[arg(long = "vdoLogicalThreads", value_name = "threads", value_parser = check_thread_count_0_100)]
    vdo_logical_threads: Option<u32>,

    #[arg(long = "vdoPhysicalThreads", value_name = "threads", value_parser = check_physical_thread_count)]
    vdo_physical_threads: Option<u32>,

    #[arg(long = "writePolicy", value_name = "policy", value_parser = check_write_policy)]
    write_policy: Option<WritePolicy>,

    #[arg(long = "vdoLogLevel", value_name = "level", value_parser = check_log_level)]
    vdo_log_level: Option<LogLevel>,

    /// Skip the safety checks on the backing device
    #[arg(long)]
    force: bool,
}

#[derive(Debug, clap::Args)]
struct ImportCommand {
    /// Name of the imported VDO volume
    #[arg(short = 'n', long, required = true, value_name = "volume", value_parser = check_vdo_name)]
    name: String,

    /// Formatted storage device to import
    #[arg(long, required = true, value_name = "device", value_parser = check_blkdev)]
    device: PathBuf,

    #[arg(long, value_name = "enabled|disabled", value_parser = check_enabled)]
    activate: Option<bool>,

    #[arg(long, value_name = "enabled|disabled", value_parser = check_enabled)]
    compression: Option<bool>,

    #[arg(long, value_name = "enabled|disabled", value_parser = check_enabled)]
    deduplication: Option<bool>,

    #[arg(long, value_name = "enabled|disabled", value_parser = check_enabled)]
    emulate512: Option<bool>,

    #[arg(long = "blockMapCacheSize", value_name = "megabytes", value_parser = check_page_cache_size)]
    block_map_cache_size: Option<SizeString>,

    #[arg(long = "blockMapPeriod", value_name = "period", value_parser = check_block_map_period)]
    block_map_period: Option<u32>,

    #[arg(long = "maxDiscardSize", value_name = "megabytes", value_parser = check_max_discard_size)]
    max_discard_size: Option<SizeString>,

    #[arg(long, value_name = "uuid", value_parser = check_uuid)]
    uuid: Option<String>,

    #[arg(long = "vdoAckThreads", value_name = "threads", value_parser = check_thread_count_0_100)]
    vdo_ack_threads: Option<u32>,

    #[arg(long = "vdoBioRotationInterval", value_name = "ios", value_parser = check_rotation_interval)]
    vdo_bio_rotation_interval: Option<u32>,

    #[arg(long = "vdoBioThreads", value_name = "threads", value_parser = check_thread_count_1_100)]
    vdo_bio_threads: Option<u32>,

    #[arg(long = "vdoCpuThreads", value_name = "threads", value_parser = check_thread_count_1_100)]
    vdo_cpu_threads: Option<u32>,

    #[arg(long = "vdoHashZoneThreads", value_name = "threads", value_parser = check_thread_count_0_100)]
    vdo_hash_zone_threads: Option<u32>,

    #[arg(long = "vdoLogicalThreads", value_name = "threads", value_parser = check_thread_count_0_100)]
    vdo_logical_threads: Option<u32>,

    #[arg(long = "vdoPhysicalThreads", value_name = "threads", value_parser = check_physical_thread_count)]
    vdo_physical_threads: Option<u32>,

    #[arg(long = "writePolicy", value_name = "policy", value_parser = check_write_policy)]
    write_policy: Option<WritePolicy>,

    #[arg(long = "vdoLogLevel", value_name = "level", value_parser = check_log_level)]
    vdo_log_level: Option<LogLevel>,
}

#[derive(Debug, clap::Args)]
struct ModifyCommand {
    #[command(flatten)]
    naming: NamingArgs,

    /// Not modifiable; accepted so the error can say so
    #[arg(long, hide = true, value_name = "device", value_parser = check_blkdev)]
    device: Option<PathBuf>,

    #[arg(long = "blockMapCacheSize", value_name = "megabytes", value_parser = check_page_cache_size)]
    block_map_cache_size: Option<SizeString>,

    #[arg(long = "blockMapPeriod", value_name = "period", value_parser = check_block_map_period)]
    block_map_period: Option<u32>,

    #[arg(long = "maxDiscardSize", value_name = "megabytes", value_parser = check_max_discard_size)]
    max_discard_size: Option<SizeString>,

    /// New UUID, or an empty string to generate one
    #[arg(long, value_name = "uuid", value_parser = check_uuid)]
    uuid: Option<String>,

    #[arg(long = "vdoAckThreads", value_name = "threads", value_parser = check_thread_count_0_100)]
    vdo_ack_threads: Option<u32>,

    #[arg(long = "vdoBioRotationInterval", value_name = "ios", value_parser = check_rotation_interval)]
    vdo_bio_rotation_interval: Option<u32>,

    #[arg(long = "vdoBioThreads", value_name = "threads", value_parser = check_thread_count_1_100)]
    vdo_bio_threads: Option<u32>,

    #[arg(long = "vdoCpuThreads", value_name = "threads", value_parser = check_thread_count_1_100)]
    vdo_cpu_threads: Option<u32>,

    #[arg(long = "vdoHashZoneThreads", value_name = "threads", value_parser = check_thread_count_0_100)]
    vdo_hash_zone_threads: Option<u32>,

    #[arg(long = "vdoLogicalThreads", value_name = "threads", value_parser = check_thread_count_0_100)]
    vdo_logical_threads: Option<u32>,

    #[arg(long = "vdoPhysicalThreads", value_name = "threads", value_parser = check_physical_thread_count)]
    vdo_physical_threads: Option<u32>,
}

#[derive(Debug, clap::Args)]
struct GrowLogicalCommand {
    #[arg(short = 'n', long, required = true, value_name = "volume", value_parser = check_vdo_name)]
    name: String,

    /// New logical size of the volume
    #[arg(long = "vdoLogicalSize", required = true, value_name = "megabytes", value_parser = check_logical_size)]
    vdo_logical_size: SizeString,
}

#[derive(Debug, clap::Args)]
struct GrowPhysicalCommand {
    #[arg(short = 'n', long, required = true, value_name = "volume", value_parser = check_vdo_name)]
    name: String,
}

#[derive(Debug, clap::Args)]
struct ChangeWritePolicyCommand {
    #[command(flatten)]
    naming: NamingArgs,

    #[arg(long = "writePolicy", required = true, value_name = "policy", value_parser = check_write_policy)]
    write_policy: WritePolicy,
}

#[derive(Debug, clap::Args)]
struct StartCommand {
    #[command(flatten)]
    naming: NamingArgs,

    /// Force a metadata rebuild before starting
    #[arg(long = "forceRebuild")]
    force_rebuild: bool,
}

#[derive(Debug, clap::Args)]
struct StopCommand {
    #[command(flatten)]
    naming: NamingArgs,

    /// Unmount file systems and clean up a failed previous operation
    #[arg(long)]
    force: bool,
}

/// At most one of `--name` or `--all`; omitting both reports on all
/// known volumes, so `--all` is the explicit spelling of the default.
#[derive(Debug, clap::Args)]
#[group(required = false, multiple = false)]
struct StatusCommand {
    /// Report on the specified VDO volume
    #[arg(short = 'n', long, value_name = "volume", value_parser = check_vdo_name)]
    name: Option<String>,

    /// Report on all known VDO volumes
    #[arg(short = 'a', long)]
    all: bool,
}

#[derive(Debug, clap::Args)]
struct ListCommand {
    /// Include volumes that are not started
    #[arg(short = 'a', long)]
    all: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Allow the volume to be started
    Activate(NamingArgs),
    /// Modify the write policy of one or all volumes
    #[command(name = "changeWritePolicy")]
    ChangeWritePolicy(ChangeWritePolicyCommand),
    /// Create a volume and its index, and make it available
    Create(CreateCommand),
    /// Prevent the volume from being started
    Deactivate(NamingArgs),
    #[command(name = "disableCompression")]
    DisableCompression(NamingArgs),
    #[command(name = "disableDeduplication")]
    DisableDeduplication(NamingArgs),
    #[command(name = "enableCompression")]
    EnableCompression(NamingArgs),
    #[command(name = "enableDeduplication")]
    EnableDeduplication(NamingArgs),
    /// Grow the logical size of a running volume
    #[command(name = "growLogical")]
    GrowLogical(GrowLogicalCommand),
    /// Grow a running volume to the current size of its backing device
    #[command(name = "growPhysical")]
    GrowPhysical(GrowPhysicalCommand),
    /// Adopt an already formatted device
    Import(ImportCommand),
    /// List started volumes
    List(ListCommand),
    /// Change modifiable attributes of one or all volumes
    Modify(ModifyCommand),
    /// Print the configuration file
    #[command(name = "printConfigFile")]
    PrintConfigFile,
    /// Stop and delete one or all volumes
    Remove(StopCommand),
    /// Start one or all activated volumes
    Start(StartCommand),
    /// Report the status of the manager and its volumes
    Status(StatusCommand),
    /// Stop one or all running volumes
    Stop(StopCommand),
}

impl Command {
    fn into_operation(self) -> Operation {
        match self {
            Command::Activate(naming) => {
                Operation::Activate { naming: naming.naming() }
            }
            Command::ChangeWritePolicy(args) => Operation::ChangeWritePolicy {
                naming: args.naming.naming(),
                policy: args.write_policy,
            },
            Command::Create(args) => Operation::Create(Box::new(CreateArgs {
                name: args.name,
                device: args.device,
                force: args.force,
                activate: args.activate,
                compression: args.compression,
                deduplication: args.deduplication,
                emulate512: args.emulate512,
                sparse_index: args.sparse_index,
                index_mem: args.index_mem,
                uuid: args.uuid,
                logical_size: args.vdo_logical_size,
                slab_size: args.vdo_slab_size,
                block_map_cache_size: args.block_map_cache_size,
                block_map_period: args.block_map_period,
                max_discard_size: args.max_discard_size,
                ack_threads: args.vdo_ack_threads,
                bio_rotation_interval: args.vdo_bio_rotation_interval,
                bio_threads: args.vdo_bio_threads,
                cpu_threads: args.vdo_cpu_threads,
                hash_zone_threads: args.vdo_hash_zone_threads,
                logical_threads: args.vdo_logical_threads,
                physical_threads: args.vdo_physical_threads,
                write_policy: args.write_policy,
                log_level: args.vdo_log_level,
            })),
            Command::Deactivate(naming) => {
                Operation::Deactivate { naming: naming.naming() }
            }
            Command::DisableCompression(naming) => {
                Operation::DisableCompression { naming: naming.naming() }
            }
            Command::DisableDeduplication(naming) => {
                Operation::DisableDeduplication { naming: naming.naming() }
            }
            Command::EnableCompression(naming) => {
                Operation::EnableCompression { naming: naming.naming() }
            }
            Command::EnableDeduplication(naming) => {
                Operation::EnableDeduplication { naming: naming.naming() }
            }
            Command::GrowLogical(args) => Operation::GrowLogical {
                name: args.name,
                size: args.vdo_logical_size,
            },
            Command::GrowPhysical(args) => {
                Operation::GrowPhysical { name: args.name }
            }
            Command::Import(args) => Operation::Import(Box::new(ImportArgs {
                name: args.name,
                device: args.device,
                activate: args.activate,
                compression: args.compression,
                deduplication: args.deduplication,
                emulate512: args.emulate512,
                block_map_cache_size: args.block_map_cache_size,
                block_map_period: args.block_map_period,
                max_discard_size: args.max_discard_size,
                uuid: args.uuid,
                ack_threads: args.vdo_ack_threads,
                bio_rotation_interval: args.vdo_bio_rotation_interval,
                bio_threads: args.vdo_bio_threads,
                cpu_threads: args.vdo_cpu_threads,
                hash_zone_threads: args.vdo_hash_zone_threads,
                logical_threads: args.vdo_logical_threads,
                physical_threads: args.vdo_physical_threads,
                write_policy: args.write_policy,
                log_level: args.vdo_log_level,
            })),
            Command::List(args) => Operation::List { all: args.all },
            Command::Modify(args) => Operation::Modify {
                naming: args.naming.naming(),
                args: ModifyArgs {
                    device: args.device,
                    block_map_cache_size: args.block_map_cache_size,
                    block_map_period: args.block_map_period,
                    max_discard_size: args.max_discard_size,
                    uuid: args.uuid,
                    ack_threads: args.vdo_ack_threads,
                    bio_rotation_interval: args.vdo_bio_rotation_interval,
                    bio_threads: args.vdo_bio_threads,
                    cpu_threads: args.vdo_cpu_threads,
                    hash_zone_threads: args.vdo_hash_zone_threads,
                    logical_threads: args.vdo_logical_threads,
                    physical_threads: args.vdo_physical_threads,
                },
            },
            Command::PrintConfigFile => Operation::PrintConfigFile,
            Command::Remove(args) => Operation::Remove {
                naming: args.naming.naming(),
                force: args.force,
            },
            Command::Start(args) => Operation::Start {
                naming: args.naming.naming(),
                force_rebuild: args.force_rebuild,
            },
            Command::Status(args) => {
                Operation::Status { name: args.name }
            }
            Command::Stop(args) => Operation::Stop {
                naming: args.naming.naming(),
                force: args.force,
            },
        }
    }
}

fn init_logging(globals: &Globals) {
    let debug_env = std::env::var("VDO_DEBUG").is_ok_and(|v| v == "1");
    let level = if globals.debug || debug_env {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    match &globals.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path);
            match file {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_max_level(level)
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file))
                        .init();
                }
                Err(e) => {
                    eprintln!(
                        "vdomgr: cannot open log file {}: {e}",
                        path.display()
                    );
                    std::process::exit(
                        vdomgr::ExitStatus::System.code(),
                    );
                }
            }
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.globals);

    let options = GlobalOptions {
        conf_file: cli
            .globals
            .conf_file
            .clone()
            .unwrap_or_else(Defaults::conf_file),
        verbose: cli.globals.verbose,
        no_run: cli.globals.no_run,
    };
    let operation = cli.command.into_operation();

    if let Err(e) = run(&options, &operation) {
        eprintln!("vdomgr: ERROR - {e}");
        std::process::exit(e.exit_status().code());
    }
}
