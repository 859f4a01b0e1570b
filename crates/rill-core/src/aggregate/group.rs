use rill_config::GroupSpec;
use serde_json::{Map, Value};

use super::accumulator::{Accumulator, FoldError};
use crate::document::Document;

/// Accumulators of one group within one window, in the order of
/// [`GroupSpec::accumulators`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupState {
    accumulators: Vec<Accumulator>,
    documents: u64,
}

impl GroupState {
    pub fn new(spec: &GroupSpec) -> Self {
        Self {
            accumulators: spec
                .accumulators
                .iter()
                .map(|a| Accumulator::new(a.op))
                .collect(),
            documents: 0,
        }
    }

    /// Fold one document into every accumulator, or into none of them.
    ///
    /// All inputs are checked before any accumulator changes, so a rejected
    /// document leaves the group exactly as it was.
    pub fn fold(&mut self, spec: &GroupSpec, doc: &Document) -> Result<(), FoldError> {
        let inputs: Vec<Option<&Value>> = spec
            .accumulators
            .iter()
            .map(|a| a.expr.eval_doc(doc.body()))
            .collect();

        for ((acc, def), input) in self.accumulators.iter().zip(&spec.accumulators).zip(&inputs) {
            acc.check(&def.name, *input)?;
        }
        for (acc, input) in self.accumulators.iter_mut().zip(&inputs) {
            acc.apply(*input);
        }
        self.documents += 1;
        Ok(())
    }

    /// Number of documents folded so far.
    pub fn documents(&self) -> u64 {
        self.documents
    }

    /// Final field values keyed by output name.
    pub fn finalize(&self, spec: &GroupSpec) -> Map<String, Value> {
        spec.accumulators
            .iter()
            .zip(&self.accumulators)
            .map(|(def, acc)| (def.name.clone(), acc.finalize()))
            .collect()
    }
}
