//! Best-effort rollback for multi-step operations.
//!
//! A [`Transaction`] is an explicit value held on the call stack for the
//! duration of one operation. Steps that leave something behind register
//! an undo stage; if the operation fails the stages run in reverse order,
//! each swallowing its own errors. This is cleanup, not cross-process
//! atomicity; crash consistency comes from the operation-state markers in
//! the registry.

use tracing::{debug, error};

use crate::{Result, VdoError};

type UndoStage = Box<dyn FnOnce() -> Result<()>>;

/// An ordered list of undo stages plus an optional contextual message to
/// emit when an error propagates out of the next step.
#[derive(Default)]
pub struct Transaction {
    stages: Vec<UndoStage>,
    message: Option<String>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction::default()
    }

    /// Registers a stage to execute as part of roll-back.
    pub fn add_undo_stage(
        &mut self,
        stage: impl FnOnce() -> Result<()> + 'static,
    ) {
        self.stages.push(Box::new(stage));
    }

    /// Attaches a message to log if an error occurs before the message is
    /// cleared or replaced.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn clear_message(&mut self) {
        self.message = None;
    }

    /// Performs the undo processing, newest stage first. Errors from the
    /// stages are ignored.
    pub fn undo(&mut self, cause: &VdoError) {
        if let Some(message) = self.message.take() {
            error!("{message}; {cause}");
        }
        while let Some(stage) = self.stages.pop() {
            if let Err(e) = stage() {
                debug!("undo stage failed: {e}");
            }
        }
    }
}

/// Runs `f` inside a fresh transaction scope, rolling back on error.
///
/// Scopes nest: an operation called from within another scope gets its own
/// transaction, and its undo stages do not interfere with the caller's.
pub fn transactional<T>(
    f: impl FnOnce(&mut Transaction) -> Result<T>,
) -> Result<T> {
    let mut transaction = Transaction::new();
    match f(&mut transaction) {
        Ok(value) => Ok(value),
        Err(e) => {
            transaction.undo(&e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn fail() -> VdoError {
        VdoError::State("induced".into())
    }

    #[test]
    fn undo_stages_run_in_reverse_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let result: Result<()> = transactional(|txn| {
            for stage in ["first", "second", "third"] {
                let log = Rc::clone(&log);
                txn.add_undo_stage(move || {
                    log.borrow_mut().push(stage);
                    Ok(())
                });
            }
            Err(fail())
        });
        assert!(result.is_err());
        assert_eq!(*log.borrow(), vec!["third", "second", "first"]);
    }

    #[test]
    fn success_skips_undo() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let result: Result<i32> = transactional(|txn| {
            let log = Rc::clone(&log);
            txn.add_undo_stage(move || {
                log.borrow_mut().push("undone");
                Ok(())
            });
            Ok(17)
        });
        assert_eq!(result.unwrap(), 17);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn failing_stages_do_not_stop_the_rollback() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let result: Result<()> = transactional(|txn| {
            let inner = Rc::clone(&log);
            txn.add_undo_stage(move || {
                inner.borrow_mut().push("ran");
                Ok(())
            });
            txn.add_undo_stage(|| Err(fail()));
            Err(fail())
        });
        assert!(result.is_err());
        assert_eq!(*log.borrow(), vec!["ran"]);
    }

    #[test]
    fn nested_scopes_keep_their_own_stages() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let result: Result<()> = transactional(|outer| {
            let outer_log = Rc::clone(&log);
            outer.add_undo_stage(move || {
                outer_log.borrow_mut().push("outer");
                Ok(())
            });
            let inner_log = Rc::clone(&log);
            let inner: Result<()> = transactional(move |txn| {
                txn.add_undo_stage(move || {
                    inner_log.borrow_mut().push("inner");
                    Ok(())
                });
                Err(fail())
            });
            inner
        });
        assert!(result.is_err());
        // Inner stages first (its scope unwound first), then the outer's.
        assert_eq!(*log.borrow(), vec!["inner", "outer"]);
    }
}
