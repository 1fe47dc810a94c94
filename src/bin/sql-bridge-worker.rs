//! Process worker: reads tasks from stdin, writes replies to stdout.
//!
//! Logs go to stderr so they never interleave with replies.

use std::process::ExitCode;

use clap::Parser;
use sql_bridge::config::DEFAULT_POOL_LIMIT;
use sql_bridge::worker::{SqliteSyncDriver, serve_stdio};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Blocking SQL worker for sql-bridge")]
struct Args {
    /// Native connections allowed per distinct connect arguments.
    #[arg(long, default_value_t = DEFAULT_POOL_LIMIT)]
    pool_limit: usize,
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match serve_stdio(SqliteSyncDriver, args.pool_limit) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "worker stopped");
            ExitCode::FAILURE
        }
    }
}
