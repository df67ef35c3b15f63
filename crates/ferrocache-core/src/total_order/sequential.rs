//! Sequential validation on the delivery thread

use super::{Outcome, SequencedPrepare, TotalOrderCore, TotalOrderManager};
use crate::Result;
use crate::config::ValidationStrategy;
use std::sync::Arc;

/// Validates one transaction at a time, in delivery order, and waits for
/// it to be applied before returning to the delivery layer.
pub struct SequentialTotalOrderManager {
    core: Arc<TotalOrderCore>,
}

impl SequentialTotalOrderManager {
    /// Create a manager over `core`
    pub fn new(core: Arc<TotalOrderCore>) -> Self {
        Self { core }
    }
}

impl TotalOrderManager for SequentialTotalOrderManager {
    fn core(&self) -> &Arc<TotalOrderCore> {
        &self.core
    }

    fn strategy(&self) -> ValidationStrategy {
        ValidationStrategy::Sequential
    }

    fn process_transaction_from_sequencer(&self, prepare: SequencedPrepare) -> Result<Outcome> {
        let Some(remote) = self.core.accept(&prepare) else {
            return Ok(Outcome::Rejected(format!(
                "{} delivered twice",
                prepare.tx.gtx
            )));
        };
        Ok(self.core.validate(&remote, prepare.one_phase, true))
    }
}
