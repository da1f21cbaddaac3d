use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the Quire binary.
#[derive(Debug, Parser)]
#[command(name = "quire", version, about = "Dependency-aware render cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QUIRE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Drive a concurrent read/write workload against the in-memory backend
    /// and check that no stale render is served.
    Simulate(SimulateArgs),
    /// Validate the configuration and print it as resolved.
    #[command(name = "check-config")]
    CheckConfig,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Concurrent workers, each mixing reads and writes.
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// Number of samples in the generated lab.
    #[arg(long, default_value_t = 50)]
    pub entities: usize,

    /// Operations per worker.
    #[arg(long, default_value_t = 500)]
    pub rounds: usize,

    /// Percentage of operations that are writes.
    #[arg(
        long = "write-percent",
        default_value_t = 10,
        value_parser = clap::value_parser!(u8).range(0..=100)
    )]
    pub write_percent: u8,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            workers: 8,
            entities: 50,
            rounds: 500,
            write_percent: 10,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the backend key namespace.
    #[arg(long = "cache-key-prefix", value_name = "PREFIX", global = true)]
    pub cache_key_prefix: Option<String>,

    /// Override how long to wait for an entity lock.
    #[arg(long = "cache-lock-timeout-ms", value_name = "MILLIS", global = true)]
    pub cache_lock_timeout_ms: Option<u64>,

    /// Override the capacity of the in-memory backend.
    #[arg(long = "cache-memory-capacity", value_name = "COUNT", global = true)]
    pub cache_memory_capacity: Option<usize>,
}
