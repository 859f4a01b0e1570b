use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use rill_config::ProcessorConfig;
use rill_runtime::tracing_init::init_tracing;
use rill_runtime::{Processor, wait_for_signal};

#[derive(Parser)]
#[command(name = "rill", about = "Rill windowed aggregation processor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a processor until its source ends or a signal arrives
    Run {
        /// Path to the processor TOML file
        #[arg(short, long)]
        config: PathBuf,
        /// Override the number of aggregation workers
        #[arg(long)]
        workers: Option<usize>,
        /// Print final counters as JSON on exit
        #[arg(long)]
        stats: bool,
    },
    /// Validate a processor file and print the resolved pipeline
    Check {
        /// Path to the processor TOML file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load(config: &Path) -> Result<(PathBuf, ProcessorConfig)> {
    let config_path = config
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("config path '{}': {e}", config.display()))?;
    let processor_config = ProcessorConfig::load(&config_path)?;
    Ok((config_path, processor_config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workers,
            stats,
        } => {
            let (config_path, mut processor_config) = load(&config)?;
            if let Some(n) = workers {
                anyhow::ensure!(n > 0, "--workers must be > 0");
                processor_config.runtime.workers = n;
            }
            let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
            let _guard = init_tracing(&processor_config.logging, base_dir)?;

            let name = processor_config.name.clone();
            let mut processor = Processor::create(name, processor_config);
            processor
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            tracing::info!(
                domain = "sys",
                processor = %processor.name(),
                listen = ?processor.listen_addr(),
                "rill processor started"
            );

            let signals = tokio::spawn(wait_for_signal(processor.cancel_token()));
            let result = processor.wait().await;
            signals.abort();

            if stats {
                println!("{}", serde_json::to_string_pretty(&processor.stats())?);
            }
            result.map_err(|e| anyhow::anyhow!("{e}"))?;
            processor.drop().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        Commands::Check { config } => {
            let (config_path, processor_config) = load(&config)?;
            println!("{}: ok", config_path.display());
            println!("processor {}", processor_config.name);
            println!(
                "  workers = {}, channel_capacity = {}, flush_on_stop = {}",
                processor_config.runtime.workers,
                processor_config.runtime.channel_capacity,
                processor_config.runtime.flush_on_stop
            );
            println!("{}", processor_config.pipeline);
            if let Some(dlq) = &processor_config.dlq {
                println!("  dlq            {dlq}");
            }
        }
    }

    Ok(())
}
