use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::logging::LoggingConfig;
use crate::pipeline::{Pipeline, SinkSpec, SinkTarget, StageDef};
use crate::runtime::{RetryConfig, RuntimeConfig};
use crate::validate;
use crate::window::WindowDefaults;

// ---------------------------------------------------------------------------
// Raw TOML structure (intermediate representation)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProcessorConfigRaw {
    processor: ProcessorSection,
    #[serde(default)]
    runtime: RuntimeConfig,
    #[serde(default)]
    window_defaults: WindowDefaults,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    stages: Vec<StageDef>,
    dlq: Option<SinkTarget>,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct ProcessorSection {
    name: String,
}

// ---------------------------------------------------------------------------
// ProcessorConfig (resolved, validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub name: String,
    pub runtime: RuntimeConfig,
    pub window_defaults: WindowDefaults,
    pub retry: RetryConfig,
    pub pipeline: Pipeline,
    /// Processor-level dead-letter target.
    pub dlq: Option<SinkSpec>,
    pub logging: LoggingConfig,
}

impl ProcessorConfig {
    /// Read and parse a processor file. Relative file paths inside it are
    /// resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let mut config: ProcessorConfig = content
            .parse()
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.pipeline.resolve_paths(base);
        if let Some(dlq) = &mut config.dlq {
            dlq.resolve_paths(base);
        }
        if let Some(file) = &mut config.logging.file
            && file.is_relative()
        {
            *file = base.join(&*file);
        }
        Ok(config)
    }
}

impl FromStr for ProcessorConfig {
    type Err = anyhow::Error;

    /// Parse a TOML string into a resolved, validated [`ProcessorConfig`].
    fn from_str(toml_str: &str) -> anyhow::Result<Self> {
        let raw: ProcessorConfigRaw = toml::from_str(toml_str)?;

        let pipeline = Pipeline::from_stages(raw.stages, &raw.window_defaults)?;
        let dlq = raw
            .dlq
            .map(SinkTarget::resolve)
            .transpose()
            .map_err(|e| anyhow::anyhow!("dlq: {e}"))?;

        let config = ProcessorConfig {
            name: raw.processor.name,
            runtime: raw.runtime,
            window_defaults: raw.window_defaults,
            retry: raw.retry,
            pipeline,
            dlq,
            logging: raw.logging,
        };

        validate::validate(&config)?;

        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
