// ============================================================================
// SECTION 13: CLI & MAIN ENTRY POINT
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use procmon_engine::logging::init_logging;
use procmon_engine::{Engine, EngineConfig, EngineError, EngineResult, ENGINE_FULL_NAME, ENGINE_VERSION};

// ----------------------------------------------------------------------------
// 13.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Procmon CLI
#[derive(Parser, Debug)]
#[command(
    name = "procmon",
    author = "AIOps Team",
    version,
    about = "Per-process CPU, memory and IO monitor built on pidstat",
    long_about = "Procmon samples pidstat for a set of processes and persists the \
                  samples through named batching tasks that flush by size or by \
                  time and drain completely on shutdown."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "procmon.toml", env = "PROCMON_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PROCMON_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "PROCMON_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start sampling (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 13.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> EngineResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path).and_then(|config| config.validate_for_run().map(|()| config)) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Host address: {}", config.monitor.ip);
            println!("  • Processes: {}", config.monitor.process_names.join(", "));
            println!("  • Sampling interval: {}s", config.monitor.interval_secs);
            println!(
                "  • Batching: {} items or {}, queue of {}",
                config.tasks.max_batch_size,
                humantime::format_duration(config.tasks.flush_interval),
                config.tasks.queue_capacity
            );
            println!("  • Sink directory: {}", config.sink.directory.display());
            println!("  • Samplers enabled:");
            if config.monitor.cpu {
                println!("    - CPU (pidstat -u)");
            }
            if config.monitor.memory {
                println!("    - Memory (pidstat -r)");
            }
            if config.monitor.io {
                println!("    - IO (pidstat -d)");
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(EngineError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> EngineResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Features:");
    println!("  • Size- and time-triggered batching per task");
    println!("  • Consumer fault isolation");
    println!("  • Drain-on-close shutdown with grace period");
    println!("  • JSON-lines persistence");
    println!();
    println!("License: MIT");
}

// ----------------------------------------------------------------------------
// 13.3 Main
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need the engine
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    let engine = Engine::new(config);
    let report = engine.run().await?;

    if !report.all_closed() {
        warn!(target: "procmon::engine", "Some tasks did not acknowledge close");
    }
    info!(
        target: "procmon::engine",
        report = %serde_json::to_string(&report).unwrap_or_default(),
        "Shutdown report"
    );

    Ok(())
}
