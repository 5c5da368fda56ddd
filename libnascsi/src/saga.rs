//! Compensating rollback for multi-step provisioning.
//!
//! A [`Rollback`] is a stack of undo actions.  Each provisioning step pushes
//! the action that reverses it right after it succeeds; when a later step
//! fails the stack is unwound LIFO.  Undo actions are lazy futures, so
//! nothing runs until [`Rollback::unwind`] polls them.
//!
//! Unwinding is best-effort: a failing undo action is logged and the next
//! one still runs.  The caller's original error is always the one returned.
//! Dropping a `Rollback` with pending actions (the operation future was
//! cancelled) runs nothing.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::appliance::ApplianceError;

type UndoFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ApplianceError>> + Send + 'a>>;

struct UndoStep<'a> {
    description: String,
    action: UndoFuture<'a>,
}

/// LIFO stack of committed-step undo actions.
#[derive(Default)]
pub struct Rollback<'a> {
    steps: Vec<UndoStep<'a>>,
}

impl fmt::Debug for Rollback<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| &s.description))
            .finish()
    }
}

impl<'a> Rollback<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Register the action undoing a step that just succeeded.
    pub fn push<F>(&mut self, description: impl Into<String>, undo: F)
    where
        F: Future<Output = Result<(), ApplianceError>> + Send + 'a,
    {
        self.steps.push(UndoStep {
            description: description.into(),
            action: Box::pin(undo),
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Await `step`; if it fails, unwind everything pushed so far and pass
    /// the error through unchanged.
    pub async fn attempt<T, E, F>(&mut self, step: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match step.await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(error = %e, pending = self.steps.len(), "step failed, rolling back");
                self.unwind().await;
                Err(e)
            }
        }
    }

    /// Run every pending undo action, most recent first.
    pub async fn unwind(&mut self) {
        while let Some(step) = self.steps.pop() {
            match step.action.await {
                Ok(()) => debug!(step = %step.description, "rolled back"),
                Err(e) if e.is_not_found() => {
                    debug!(step = %step.description, "already gone during rollback");
                }
                Err(e) => warn!(step = %step.description, error = %e, "rollback step failed"),
            }
        }
    }

    /// The operation succeeded: forget every undo action.
    pub fn commit(mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            debug!(pending = self.steps.len(), "rollback abandoned");
        }
    }
}
