//! Parallel validation with per-key dependencies

use super::{ConditionalScheduler, Outcome, SequencedPrepare, TotalOrderCore, TotalOrderManager};
use crate::Result;
use crate::config::ValidationStrategy;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Validates non-conflicting transactions concurrently.
///
/// Registration runs on the delivery thread, in delivery order: each
/// written key's current latch becomes a dependency and the key is then
/// taken over by the new transaction. The validation itself runs on the
/// scheduler once every dependency fired, and never blocks on the applier.
pub struct ParallelTotalOrderManager {
    core: Arc<TotalOrderCore>,
    scheduler: ConditionalScheduler,
    read_set_dependencies: bool,
}

impl ParallelTotalOrderManager {
    /// Create a manager with `workers` validation threads
    pub fn new(core: Arc<TotalOrderCore>, workers: usize, read_set_dependencies: bool) -> Result<Self> {
        let scheduler = ConditionalScheduler::new(&format!("to-validate-{}", core.node()), workers)?;
        Ok(Self {
            core,
            scheduler,
            read_set_dependencies,
        })
    }

    /// Underlying scheduler
    pub fn scheduler(&self) -> &ConditionalScheduler {
        &self.scheduler
    }
}

impl TotalOrderManager for ParallelTotalOrderManager {
    fn core(&self) -> &Arc<TotalOrderCore> {
        &self.core
    }

    fn strategy(&self) -> ValidationStrategy {
        ValidationStrategy::Parallel
    }

    fn is_asynchronous(&self) -> bool {
        true
    }

    fn process_transaction_from_sequencer(&self, prepare: SequencedPrepare) -> Result<Outcome> {
        let gtx = prepare.tx.gtx;
        let Some(remote) = self.core.accept(&prepare) else {
            return Ok(Outcome::Rejected(format!("{} delivered twice", gtx)));
        };
        let tx = remote
            .transaction()
            .ok_or_else(|| crate::Error::internal(format!("{} accepted without a body", gtx)))?;

        let dependencies = self
            .core
            .register_dependencies(&tx, self.read_set_dependencies);
        tracing::trace!(%gtx, dependencies = dependencies.len(), "validation scheduled");

        let core = self.core.clone();
        let one_phase = prepare.one_phase;
        self.scheduler.submit(gtx, dependencies, move || {
            match panic::catch_unwind(AssertUnwindSafe(|| core.validate(&remote, one_phase, false))) {
                Ok(outcome) => tracing::trace!(%gtx, ?outcome, "validation finished"),
                Err(payload) => {
                    // Dependents wait on this latch
                    core.abandon(&remote);
                    panic::resume_unwind(payload);
                }
            }
        });
        Ok(Outcome::Queued)
    }

    fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
