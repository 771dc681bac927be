//! Bank Ledger CLI
//!
//! Replays a CSV of ledger operations and writes the final account states
//! (and optionally every transaction record) as CSV.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- operations.csv > accounts.csv
//! cargo run -- operations.csv --history --customer alice
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity

use bank_ledger::{BatchProcessor, Caller, Ledger, LedgerConfig, LogSink, Result};
use clap::Parser;
use log::info;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "bank-ledger", version, about = "Replay ledger operations from CSV")]
struct Args {
    /// CSV file with columns op,account,target,amount,description,key
    input: PathBuf,

    /// Also print the transaction history after the account states
    #[arg(long)]
    history: bool,

    /// Retries for conflicting or timed-out storage writes
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// UTC offset in minutes used for daily-limit windows of new accounts
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    utc_offset_minutes: i32,

    /// Run as this customer instead of as an administrator
    #[arg(long)]
    customer: Option<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let file = File::open(&args.input)?;
    let reader = BufReader::new(file);

    let config = LedgerConfig {
        max_retries: args.max_retries,
        default_utc_offset_secs: args.utc_offset_minutes.saturating_mul(60),
        ..LedgerConfig::default()
    };
    let ledger = Arc::new(Ledger::in_memory().with_config(config));
    let caller = match args.customer {
        Some(owner) => Caller::customer(owner),
        None => Caller::admin("operator"),
    };

    let mut processor = BatchProcessor::new(ledger, caller).with_sink(Arc::new(LogSink));
    let report = processor.process_csv(reader)?;
    info!(
        "Applied {} operations, rejected {}",
        report.applied, report.rejected
    );

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    processor.write_accounts(&mut handle)?;
    if args.history {
        writeln!(handle)?;
        processor.write_history(&mut handle)?;
    }

    Ok(())
}
