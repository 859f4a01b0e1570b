use crate::pipeline::SinkSpec;
use crate::processor::ProcessorConfig;
use crate::types::{LatePolicy, ValidationAction};

/// Internal validation, called automatically during `ProcessorConfig::from_str` / `load`.
pub(crate) fn validate(config: &ProcessorConfig) -> anyhow::Result<()> {
    if config.name.trim().is_empty() {
        anyhow::bail!("processor.name must not be empty");
    }

    if config.runtime.workers == 0 {
        anyhow::bail!("runtime.workers must be > 0");
    }
    if config.runtime.channel_capacity == 0 {
        anyhow::bail!("runtime.channel_capacity must be > 0");
    }
    if config.runtime.watermark_interval.is_zero() {
        anyhow::bail!("runtime.watermark_interval must be > 0");
    }

    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.initial_backoff > config.retry.max_backoff {
        anyhow::bail!(
            "retry.initial_backoff ({}) exceeds retry.max_backoff ({})",
            config.retry.initial_backoff,
            config.retry.max_backoff,
        );
    }

    // Routing a document to the dead-letter sink needs one to exist.
    if let Some(v) = &config.pipeline.validate
        && v.action == ValidationAction::Dlq
        && config.dlq.is_none()
    {
        anyhow::bail!("validate.action = \"dlq\" requires a [dlq] section");
    }
    if config.pipeline.window.late_policy == LatePolicy::Dlq && config.dlq.is_none() {
        anyhow::bail!("tumbling_window.late_policy = \"dlq\" requires a [dlq] section");
    }

    if let Some(dlq) = &config.dlq
        && same_target(dlq, &config.pipeline.merge.into)
    {
        anyhow::bail!("dlq and merge.into must not name the same sink ({dlq})");
    }

    Ok(())
}

fn same_target(a: &SinkSpec, b: &SinkSpec) -> bool {
    match (a, b) {
        (SinkSpec::Memory { name: x }, SinkSpec::Memory { name: y }) => x == y,
        (SinkSpec::File { path: x }, SinkSpec::File { path: y }) => x == y,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
