//! The kernel-module service: makes sure the driver backing the
//! device-mapper target is loaded and answers questions about it.

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::defaults::Defaults;
use crate::runner::{RunContext, RunOptions, run_command, run_command_with};
use crate::types::LogLevel;
use crate::{Result, VdoError};

const RUNNING_RETRIES: u32 = 20;

/// Manages the kernel module on the local node.
#[derive(Debug, Clone)]
pub struct KernelModuleService {
    name: String,
}

impl Default for KernelModuleService {
    fn default() -> Self {
        KernelModuleService { name: Defaults::MODULE_NAME.to_string() }
    }
}

impl KernelModuleService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loads the module if necessary.
    pub fn start(&self, ctx: &RunContext) -> Result<()> {
        run_command(ctx, &["modprobe", &self.name])
            .map_err(VdoError::from)?;
        Ok(())
    }

    /// Removes the module.
    pub fn stop(&self, ctx: &RunContext) -> Result<()> {
        run_command(ctx, &["modprobe", "-r", &self.name])
            .map_err(VdoError::from)?;
        Ok(())
    }

    /// True if the module is loaded and the device-mapper target is
    /// registered. With `wait`, polls up to twenty times at one-second
    /// intervals.
    pub fn running(&self, ctx: &RunContext, wait: bool) -> bool {
        let retries = if wait { RUNNING_RETRIES } else { 1 };
        let module = format!("'{}'", self.name);
        let loaded = run_command_with(
            ctx,
            &["lsmod", "|", "grep", "-q", &module],
            RunOptions::new().shell().with_retries(retries),
        );
        if loaded.is_err() {
            return false;
        }
        run_command_with(
            ctx,
            &["dmsetup", "targets", "|", "grep", "-q", Defaults::TARGET_NAME],
            RunOptions::new().shell().with_retries(retries),
        )
        .is_ok()
    }

    /// The module version as a string.
    pub fn version(&self, ctx: &RunContext) -> String {
        let mut version = format!("{} ", self.name);
        let output = run_command_with(
            ctx,
            &["modinfo", &self.name],
            RunOptions::new().no_throw(),
        )
        .unwrap_or_default();
        for line in output.lines() {
            if line.starts_with("version") {
                version.push_str(line);
            }
        }
        version
    }

    /// Sets the driver log level, unless it is already the default.
    pub fn set_log_level(&self, ctx: &RunContext, level: LogLevel) {
        if level == Defaults::LOG_LEVEL {
            return;
        }
        debug!("setting {} log level to {level}", self.name);
        let redirect = format!("/sys/{}/log_level", self.name);
        let _ = run_command_with(
            ctx,
            &["echo", level.as_str(), ">", &redirect],
            RunOptions::new().shell().no_throw(),
        );
    }

    /// A status summary for the status report.
    pub fn status(&self, ctx: &RunContext) -> Mapping {
        let mut status = Mapping::new();
        status.insert(
            Value::from("Name"),
            Value::from(self.name.clone()),
        );
        status.insert(
            Value::from("Loaded"),
            Value::from(self.running(ctx, false)),
        );
        status.insert(
            Value::from("Version information"),
            Value::from(self.version(ctx)),
        );
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_reports_running() {
        // In dry-run mode every command nominally succeeds.
        let ctx = RunContext::new(false, true);
        let kms = KernelModuleService::new();
        assert!(kms.running(&ctx, false));
        assert!(kms.start(&ctx).is_ok());
    }

    #[test]
    fn status_carries_the_module_name() {
        let ctx = RunContext::new(false, true);
        let status = KernelModuleService::new().status(&ctx);
        assert_eq!(status.get("Name"), Some(&Value::from("kvdo")));
    }
}
