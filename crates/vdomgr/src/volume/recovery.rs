//! Crash recovery from interrupted operations.
//!
//! Running this recovery is the first action of every mutating operation
//! on a volume. A begin-state marker left in the registry classifies the
//! previous failure:
//!
//! | marker | policy |
//! |---|---|
//! | `beginCreate`, `beginImport` | unrecoverable; instruct `remove --force` |
//! | `beginGrowLogical`, `beginGrowPhysical` | re-read the size from the on-disk metadata, resume if running, finish |
//! | `beginRunningSetWritePolicy` | replay the reload when running, finish |
//! | anything else | developer error |

use tracing::debug;

use super::{VdoVolume, dump_config};
use crate::transaction::Transaction;
use crate::types::OperationState;
use crate::{Result, VdoError};

impl VdoVolume {
    /// Handles a previous operation failure, repairing it when the marker
    /// allows; otherwise refuses the current operation.
    pub fn handle_previous_operation_failure(
        &self,
        _txn: &mut Transaction,
    ) -> Result<()> {
        if !self.get(|r| r.previous_operation_failure())? {
            debug!(
                "No failure requiring recovery for VDO volume {}",
                self.name
            );
            return Ok(());
        }

        match self.get(|r| r.operation_state)? {
            OperationState::BeginCreate | OperationState::BeginImport => {
                Err(self.previous_operation_failure_response())
            }
            OperationState::BeginGrowLogical => self.recover_grow_logical(),
            OperationState::BeginGrowPhysical => self.recover_grow_physical(),
            OperationState::BeginRunningSetWritePolicy => {
                self.recover_running_set_write_policy()
            }
            state => Err(VdoError::Developer(format!(
                "Missing handler for recover from operation state: {state}"
            ))),
        }
    }

    fn previous_operation_failure_response(&self) -> VdoError {
        let operation = self
            .get(|r| r.effective_operation_state().operation_name())
            .unwrap_or("unknown");
        VdoError::PreviousOperationFailure {
            name: self.name.clone(),
            operation: operation.to_string(),
            steps: Vec::new(),
        }
    }

    /// Re-reads the authoritative logical size from the on-disk metadata
    /// and, if the kernel device is running, resumes it. Either the grow
    /// completed in the kernel or it never happened; both end `finished`.
    fn recover_grow_logical(&self) -> Result<()> {
        debug!("Recovering VDO volume {} from grow logical", self.name);
        if !self.ctx.no_run_mode() {
            let device = self.get(|r| r.device.display().to_string())?;
            let dumped = dump_config(&self.ctx, &device)?;
            self.update(|r| r.logical_size = dumped.vdo.logical_size())?;
        }
        // The failure may have been the user interrupting the original
        // command between suspend and resume; resuming again is safe.
        if self.running() {
            self.resume()?;
        }
        self.set_operation_state(OperationState::Finished)
    }

    fn recover_grow_physical(&self) -> Result<()> {
        debug!("Recovering VDO volume {} from grow physical", self.name);
        if !self.ctx.no_run_mode() {
            let device = self.get(|r| r.device.display().to_string())?;
            let dumped = dump_config(&self.ctx, &device)?;
            self.update(|r| r.physical_size = dumped.vdo.physical_size())?;
        }
        if self.running() {
            self.resume()?;
        }
        self.set_operation_state(OperationState::Finished)
    }

    /// A stopped volume will pick the persisted policy up at the next
    /// start; a running one gets the reload replayed.
    fn recover_running_set_write_policy(&self) -> Result<()> {
        debug!(
            "Recovering VDO volume {} from set write policy",
            self.name
        );
        if self.running() {
            self.perform_running_set_write_policy()?;
        }
        self.set_operation_state(OperationState::Finished)
    }
}
