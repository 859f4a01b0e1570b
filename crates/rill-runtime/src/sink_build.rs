use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use orion_error::prelude::*;
use rill_config::{ProcessorConfig, SinkSpec};
use rill_core::merge::MergePolicy;
use rill_core::sink::{
    DeadLetterSink, FileCollection, FileDeadLetters, MemoryCollection, MemoryDeadLetters,
    MemorySink, OutputRouter, RetryPolicy, UpsertSink,
};

use crate::error::RuntimeResult;

// ---------------------------------------------------------------------------
// SinkCatalog: named in-memory outputs
// ---------------------------------------------------------------------------

/// Registry of `memory` outputs by name. Processors built from the same
/// catalog share collections, and callers keep a handle to inspect them.
#[derive(Debug, Default, Clone)]
pub struct SinkCatalog {
    inner: Arc<CatalogInner>,
}

#[derive(Debug, Default)]
struct CatalogInner {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
    dead_letters: Mutex<HashMap<String, Arc<MemoryDeadLetters>>>,
}

impl SinkCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The collection named `name`, created empty on first use.
    pub fn collection(&self, name: &str) -> Arc<MemoryCollection> {
        let mut map = self
            .inner
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(name.to_string()).or_insert_with(MemoryCollection::new))
    }

    /// The dead-letter list named `name`, created empty on first use.
    pub fn dead_letters(&self, name: &str) -> Arc<MemoryDeadLetters> {
        let mut map = self
            .inner
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| MemoryDeadLetters::new(name)),
        )
    }
}

// ---------------------------------------------------------------------------
// Build outputs from config
// ---------------------------------------------------------------------------

async fn build_good(
    spec: &SinkSpec,
    config: &ProcessorConfig,
    catalog: &SinkCatalog,
) -> RuntimeResult<Arc<dyn UpsertSink>> {
    let merge = &config.pipeline.merge;
    let policy = MergePolicy::new(merge.when_matched.clone(), merge.when_not_matched);
    let sink: Arc<dyn UpsertSink> = match spec {
        SinkSpec::Memory { name } => {
            Arc::new(MemorySink::new(spec.to_string(), catalog.collection(name), policy))
        }
        SinkSpec::File { path } => Arc::new(
            FileCollection::open(path, &merge.on, policy)
                .await
                .err_conv()?,
        ),
    };
    Ok(sink)
}

async fn build_dead_letter(
    spec: &SinkSpec,
    catalog: &SinkCatalog,
) -> RuntimeResult<Arc<dyn DeadLetterSink>> {
    let sink: Arc<dyn DeadLetterSink> = match spec {
        SinkSpec::Memory { name } => catalog.dead_letters(name),
        SinkSpec::File { path } => Arc::new(FileDeadLetters::open(path).await.err_conv()?),
    };
    Ok(sink)
}

/// Open the merge target and the dead-letter target of `config` and wire
/// them into an [`OutputRouter`].
pub async fn build_output_router(
    name: &str,
    config: &ProcessorConfig,
    catalog: &SinkCatalog,
) -> RuntimeResult<OutputRouter> {
    let merge = &config.pipeline.merge;
    let good = build_good(&merge.into, config, catalog)
        .await
        .position(merge.into.to_string())?;
    let dlq = match &config.dlq {
        Some(spec) => Some(
            build_dead_letter(spec, catalog)
                .await
                .position(spec.to_string())?,
        ),
        None => None,
    };
    rill_debug!(
        conf,
        good = %good.name(),
        dlq = dlq.as_ref().map(|d| d.name()).unwrap_or("none"),
        "outputs ready"
    );
    Ok(OutputRouter::new(
        name,
        merge.on.clone(),
        good,
        dlq,
        RetryPolicy::from_config(&config.retry),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_hands_out_shared_collections() {
        let catalog = SinkCatalog::new();
        let a = catalog.collection("good");
        let b = catalog.clone().collection("good");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &catalog.collection("other")));

        let d1 = catalog.dead_letters("dlq");
        let d2 = catalog.dead_letters("dlq");
        assert!(Arc::ptr_eq(&d1, &d2));
    }
}
