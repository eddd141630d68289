//! Tidemark CLI - versioned SQL schema migrations

use clap::Parser;
use std::process::ExitCode;
use std::time::Instant;
use tm_core::OpContext;

mod cli;
mod commands;

use cli::{Cli, Commands};
use commands::{create, down, force, status, up, validate, version};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    let started = Instant::now();
    let ctx = OpContext::background();
    let cancel = ctx.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current statement");
            cancel.cancel();
        }
    });

    let result = match &cli.command {
        Commands::Up(args) => up::execute(args, &cli.global, &ctx).await,
        Commands::Down(args) => down::execute(args, &cli.global, &ctx).await,
        Commands::Version => version::execute(&cli.global, &ctx).await,
        Commands::Force(args) => force::execute(args, &cli.global, &ctx).await,
        Commands::Validate => validate::execute(&cli.global, &ctx).await,
        Commands::Create(args) => create::execute(args, &cli.global).await,
        Commands::Status(args) => status::execute(args, &cli.global, &ctx).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            eprintln!("Failed after {:.2}s", started.elapsed().as_secs_f64());
            ExitCode::FAILURE
        }
    }
}

/// `-v` raises the default filter to debug; `RUST_LOG` wins over both.
fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_target(false)
        .init();
}
