
use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::load_test::{LoadTestConfig, run_load_test};

#[derive(Parser)]
#[command(name = "txcache")]
#[command(about = "Tooling for the txcache transactional object cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Concurrent transfers and reads against an in-memory store
    LoadTest {
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,
        #[arg(long, default_value_t = 8)]
        concurrency: usize,
        #[arg(long, default_value_t = 100)]
        rows: usize,
        #[arg(long, default_value_t = 80)]
        read_ratio: u8,
        #[arg(long, default_value_t = 100_000)]
        sample_max: usize,
        #[arg(long, default_value_t = 1_000)]
        initial_balance: i64,
        #[arg(long, default_value_t = 2_000)]
        timeout_ms: u64,
        #[arg(long, default_value_t = 10)]
        max_retries: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::LoadTest {
            duration_secs,
            concurrency,
            rows,
            read_ratio,
            sample_max,
            initial_balance,
            timeout_ms,
            max_retries,
        } => run_load_test(LoadTestConfig {
            duration_secs,
            concurrency,
            rows,
            read_ratio: read_ratio.min(100),
            sample_max,
            initial_balance,
            timeout_ms,
            max_retries,
        }),
    }
}
