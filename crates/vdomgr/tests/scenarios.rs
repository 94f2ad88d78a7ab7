//! End-to-end scenarios with the external tools replaced by small scripts
//! on `$PATH`. Most run through the dispatcher in dry-run mode; the ones
//! that assert on the persisted registry file drive the volume layer
//! directly so the faked tools execute for real without any privilege
//! requirements. The kernel-facing tools keep their running-device state
//! in a scratch directory so `dmsetup status` behaves consistently across
//! the steps of a scenario.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Once;

use vdomgr::config::Configuration;
use vdomgr::ops::{CreateArgs, GlobalOptions, Naming, Operation, run};
use vdomgr::runner::RunContext;
use vdomgr::transaction::transactional;
use vdomgr::types::OperationState;
use vdomgr::volume::{ModifyArgs, VdoVolume};
use vdomgr::{ExitStatus, VdoError};

static SETUP: Once = Once::new();

/// A 2T logical / 10G physical geometry, as the dump tool reports it.
const DUMPED_CONFIG: &str = "\
UUID: 6bde36f4-b4c8-4e02-a875-15f4053a2afd
VDOConfig:
  blockSize: 4096
  physicalBlocks: 2621440
  logicalBlocks: 536870912
  slabSize: 524288
IndexConfig:
  memory: 0.25
  sparse: 0
  checkpointFrequency: 0
";

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn setup() {
    SETUP.call_once(|| {
        let bin_dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let state_dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let bin = bin_dir.path();

        write_script(
            bin,
            "dmsetup",
            r#"cmd="$1"
case "$cmd" in
  status)
    if [ -n "$2" ]; then
      if [ -e "$FAKE_STATE_DIR/running-$2" ]; then
        echo "0 8388608 vdo /dev/sdx normal - online online 1234 5678"
        exit 0
      fi
      exit 1
    fi
    for f in "$FAKE_STATE_DIR"/running-*; do
      [ -e "$f" ] || exit 0
      n="${f##*/running-}"
      echo "$n: 0 8388608 vdo V2 /dev/sdx online"
    done
    exit 0 ;;
  create) : > "$FAKE_STATE_DIR/running-$2"; exit 0 ;;
  remove) rm -f "$FAKE_STATE_DIR/running-$2"; exit 0 ;;
  table)
    echo "0 4294967296 vdo V2 /dev/sdx 2621440 4096 32768 16380 on auto $2 maxDiscard 1 ack 1 bio 4 bioRotationInterval 64 cpu 2 hash 1 logical 1 physical 1"
    exit 0 ;;
  targets) echo "vdo              v6.2.0"; exit 0 ;;
  *) exit 0 ;;
esac"#,
        );
        write_script(bin, "vdoformat", "exit 0");
        write_script(bin, "vdodumpconfig", &format!("cat <<'EOF'\n{DUMPED_CONFIG}EOF"));
        write_script(bin, "vdoforcerebuild", "exit 0");
        write_script(bin, "vdosetuuid", "exit 0");
        write_script(bin, "vdostats", "exit 1");
        write_script(bin, "vdodmeventd", "exit 0");
        write_script(bin, "modprobe", "exit 0");
        write_script(bin, "lsmod", "echo \"kvdo 570760 0\"");
        write_script(bin, "modinfo", "echo \"version:        6.2.0\"");
        write_script(bin, "udevadm", "exit 0");
        write_script(bin, "mount", "exit 0");
        write_script(bin, "umount", "exit 0");
        write_script(bin, "pvcreate", "exit 0");
        write_script(bin, "blkid", "exit 2");
        write_script(bin, "dd", "exit 0");

        let path = format!(
            "{}:{}",
            bin.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        unsafe {
            std::env::set_var("PATH", path);
            std::env::set_var("FAKE_STATE_DIR", state_dir.path());
        }
    });
}

fn is_root() -> bool {
    let status = fs::read_to_string("/proc/self/status").unwrap_or_default();
    status
        .lines()
        .find(|line| line.starts_with("Uid:"))
        .and_then(|line| line.split_whitespace().nth(2).map(str::to_string))
        .is_some_and(|euid| euid == "0")
}

fn mark_running(name: &str) {
    let dir = std::env::var("FAKE_STATE_DIR").unwrap();
    fs::write(Path::new(&dir).join(format!("running-{name}")), b"").unwrap();
}

fn global_options(conf_file: &Path) -> GlobalOptions {
    GlobalOptions {
        conf_file: conf_file.to_path_buf(),
        verbose: false,
        no_run: false,
    }
}

/// A writable shared handle on the registry, for driving the volume layer
/// directly (no dispatcher lock or privilege checks involved).
fn open_shared(
    conf_file: &Path,
) -> std::rc::Rc<std::cell::RefCell<Configuration>> {
    std::rc::Rc::new(std::cell::RefCell::new(
        Configuration::load(conf_file, false, false).unwrap(),
    ))
}

/// A registry primed with one volume in the given state, backed by a
/// regular file standing in for the device.
fn seed_config(
    dir: &Path,
    name: &str,
    state: OperationState,
) -> (PathBuf, PathBuf) {
    let device = dir.join("backing");
    fs::write(&device, vec![0u8; 4096]).unwrap();
    let conf_file = dir.join("vdoconf.yml");
    let mut conf = Configuration::load(&conf_file, false, false).unwrap();
    let mut record = vdomgr::config::VdoRecord::new(name, &device);
    record.operation_state = state;
    record.logical_size = "2T".parse().unwrap();
    record.physical_size = "10G".parse().unwrap();
    conf.add_vdo(record, false);
    conf.persist(&RunContext::default()).unwrap();
    (conf_file, device)
}

#[test]
fn create_persists_a_finished_volume() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("backing");
    fs::write(&device, vec![0u8; 4096]).unwrap();
    let conf_file = dir.path().join("vdoconf.yml");

    // Driven at the volume layer so the faked tools run for real and the
    // registry file is actually written, root or not.
    let conf = open_shared(&conf_file);
    let ctx = RunContext::default();
    let mut record = vdomgr::config::VdoRecord::new("scenario1", &device);
    record.logical_size = "2T".parse().unwrap();
    transactional(|txn| {
        VdoVolume::create(&ctx, &conf, txn, record, false, None).map(|_| ())
    })
    .unwrap();

    let contents = fs::read_to_string(&conf_file).unwrap();
    assert!(contents.contains("version: 0x20170907"));
    assert!(contents.contains("logicalSize: 2T"));
    assert!(contents.contains("physicalSize: 10G"));
    assert!(contents.contains("operationState: finished"));
    assert!(contents.contains("activated: enabled"));
    assert!(contents.contains("compression: enabled"));
    assert!(contents.contains("deduplication: enabled"));
    assert!(contents.contains("writePolicy: auto"));
}

#[test]
fn create_rejects_an_aliased_configured_device() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let (conf_file, device) =
        seed_config(dir.path(), "vol1", OperationState::Finished);
    let alias = dir.path().join("alias-of-backing");
    std::os::unix::fs::symlink(&device, &alias).unwrap();

    let args = CreateArgs {
        name: "vol2".to_string(),
        device: alias,
        ..CreateArgs::default()
    };
    let options = GlobalOptions {
        no_run: true,
        ..global_options(&conf_file)
    };
    let err =
        run(&options, &Operation::Create(Box::new(args))).unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::User);
    assert!(err.to_string().contains("already configured"));
}

#[test]
fn unrecoverable_create_blocks_stop_until_forced_remove() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let (conf_file, _device) =
        seed_config(dir.path(), "vol3", OperationState::BeginCreate);

    let options = GlobalOptions {
        no_run: true,
        ..global_options(&conf_file)
    };
    let stop = Operation::Stop {
        naming: Naming::Name("vol3".to_string()),
        force: false,
    };
    let err = run(&options, &stop).unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::State);
    assert!(matches!(err, VdoError::PreviousOperationFailure { .. }));

    // No state change from the refused stop.
    let conf = Configuration::load(&conf_file, true, true).unwrap();
    assert_eq!(
        conf.get_vdo("vol3").unwrap().operation_state,
        OperationState::BeginCreate
    );

    // The forced removal runs the faked tools for real so the registry
    // deletion reaches the file: the last volume takes the file with it.
    let shared = open_shared(&conf_file);
    let ctx = RunContext::default();
    let volume = VdoVolume::new(&ctx, &shared, "vol3");
    transactional(|txn| volume.remove(txn, true)).unwrap();
    assert!(!conf_file.exists());
}

#[test]
fn status_recovers_an_interrupted_grow_logical() {
    setup();
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (conf_file, _device) =
        seed_config(dir.path(), "vol4", OperationState::BeginGrowLogical);
    mark_running("vol4");

    let status = Operation::Status { name: Some("vol4".to_string()) };
    run(&global_options(&conf_file), &status).unwrap();

    let conf = Configuration::load(&conf_file, true, true).unwrap();
    let vdo = conf.get_vdo("vol4").unwrap();
    assert_eq!(vdo.operation_state, OperationState::Finished);
    assert_eq!(vdo.logical_size, "2T".parse().unwrap());
}

#[test]
fn modify_rejects_the_device_option_without_touching_the_registry() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let (conf_file, _device) =
        seed_config(dir.path(), "vol5", OperationState::Finished);
    let before = fs::read_to_string(&conf_file).unwrap();

    let modify = Operation::Modify {
        naming: Naming::Name("vol5".to_string()),
        args: ModifyArgs {
            device: Some(PathBuf::from("/dev/sdy")),
            ..ModifyArgs::default()
        },
    };
    let options = GlobalOptions {
        no_run: true,
        ..global_options(&conf_file)
    };
    let err = run(&options, &modify).unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::User);
    assert!(
        err.to_string()
            .contains("Cannot change option device after VDO creation")
    );
    assert_eq!(fs::read_to_string(&conf_file).unwrap(), before);
}

#[test]
fn modify_enforces_the_thread_count_triple() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let (conf_file, _device) =
        seed_config(dir.path(), "vol6", OperationState::Finished);

    let unbalanced = Operation::Modify {
        naming: Naming::Name("vol6".to_string()),
        args: ModifyArgs {
            hash_zone_threads: Some(0),
            logical_threads: Some(2),
            physical_threads: Some(2),
            ..ModifyArgs::default()
        },
    };
    let options = GlobalOptions {
        no_run: true,
        ..global_options(&conf_file)
    };
    let err = run(&options, &unbalanced).unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::User);

    let all_zero = Operation::Modify {
        naming: Naming::Name("vol6".to_string()),
        args: ModifyArgs {
            hash_zone_threads: Some(0),
            logical_threads: Some(0),
            physical_threads: Some(0),
            ..ModifyArgs::default()
        },
    };
    run(&options, &all_zero).unwrap();
}

#[test]
fn modify_persists_accepted_thread_counts() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let (conf_file, _device) =
        seed_config(dir.path(), "vol7", OperationState::Finished);

    let shared = open_shared(&conf_file);
    let ctx = RunContext::default();
    let volume = VdoVolume::new(&ctx, &shared, "vol7");
    let args = ModifyArgs {
        hash_zone_threads: Some(0),
        logical_threads: Some(0),
        physical_threads: Some(0),
        ..ModifyArgs::default()
    };
    transactional(|txn| volume.set_modifiable_options(txn, &args)).unwrap();
    shared.borrow_mut().persist(&ctx).unwrap();

    let conf = Configuration::load(&conf_file, true, true).unwrap();
    let vdo = conf.get_vdo("vol7").unwrap();
    assert_eq!(vdo.hash_zone_threads, 0);
    assert_eq!(vdo.logical_threads, 0);
    assert_eq!(vdo.physical_threads, 0);
}

#[test]
fn grow_logical_refuses_equal_and_smaller_sizes() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let (conf_file, _device) =
        seed_config(dir.path(), "vol8", OperationState::Finished);
    mark_running("vol8");

    let conf = open_shared(&conf_file);
    let ctx = RunContext::default();
    let volume = VdoVolume::new(&ctx, &conf, "vol8");

    let equal = transactional(|txn| {
        volume.grow_logical(txn, "2T".parse().unwrap())
    })
    .unwrap_err();
    assert_eq!(equal.exit_status(), ExitStatus::User);
    assert!(equal.to_string().contains("by less than 4096 bytes"));

    let smaller = transactional(|txn| {
        volume.grow_logical(txn, "1T".parse().unwrap())
    })
    .unwrap_err();
    assert_eq!(smaller.exit_status(), ExitStatus::User);
    assert!(smaller.to_string().contains("Can't shrink"));
}

#[test]
fn stop_and_start_are_idempotent_on_settled_volumes() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let (conf_file, _device) =
        seed_config(dir.path(), "vol9", OperationState::Finished);
    let before = fs::read_to_string(&conf_file).unwrap();

    let options = GlobalOptions {
        no_run: true,
        ..global_options(&conf_file)
    };

    // Not running: stop is a no-op.
    let stop = Operation::Stop {
        naming: Naming::Name("vol9".to_string()),
        force: false,
    };
    run(&options, &stop).unwrap();
    assert_eq!(fs::read_to_string(&conf_file).unwrap(), before);

    // Activate on an activated volume changes nothing.
    let activate = Operation::Activate {
        naming: Naming::Name("vol9".to_string()),
    };
    run(&options, &activate).unwrap();
    assert_eq!(fs::read_to_string(&conf_file).unwrap(), before);
}

#[test]
fn unknown_volumes_are_a_user_error() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let (conf_file, _device) =
        seed_config(dir.path(), "vol10", OperationState::Finished);

    let options = GlobalOptions {
        no_run: true,
        ..global_options(&conf_file)
    };
    let err = run(
        &options,
        &Operation::Stop {
            naming: Naming::Name("missing".to_string()),
            force: false,
        },
    )
    .unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::User);
    assert!(err.to_string().contains("not found"));
}
