//! Rollback stack for multi-step host mutations.
//!
//! Push an undo step after each mutation succeeds. Unless [`Reverter::success`]
//! is called, dropping the reverter runs the steps newest first.
//!
//! ```ignore
//! let mut revert = Reverter::new();
//! host.create_veth(&host_name, &peer, &settings)?;
//! revert.add(|| host.remove_interface(&host_name));
//! host.route_add(&route)?;   // on failure the veth is removed
//! revert.success();
//! ```

use crate::error::Result;

type Undo<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// LIFO list of undo steps.
#[derive(Default)]
pub struct Reverter<'a> {
    steps: Vec<Undo<'a>>,
}

impl<'a> Reverter<'a> {
    /// Empty reverter.
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Push an undo step.
    pub fn add<F>(&mut self, undo: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.steps.push(Box::new(undo));
    }

    /// Keep all mutations; nothing runs on drop.
    pub fn success(&mut self) {
        self.steps.clear();
    }

    /// Run every undo step now, newest first.
    pub fn fail(&mut self) {
        while let Some(undo) = self.steps.pop() {
            if let Err(e) = undo() {
                tracing::warn!(error = %e, "rollback step failed");
            }
        }
    }

    /// Number of pending undo steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no undo steps are pending.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Drop for Reverter<'_> {
    fn drop(&mut self) {
        self.fail();
    }
}
