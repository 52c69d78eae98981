mod cli;
mod command;
mod commands;
mod condition;
mod config;
mod error;
mod exec;
mod k8s;
mod model;
mod port_forward;
mod watch;

use anyhow::{Context, Result};
use clap::{ArgMatches, CommandFactory, FromArgMatches};
use cli::{CliArgs, Verbosity};
use command::CommandForest;
use config::Settings;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let forest = match command::assemble(commands::manifest()) {
        Ok(forest) => forest,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let matches = forest.to_command(CliArgs::command()).get_matches();
    let args = match CliArgs::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(error) => error.exit(),
    };

    match run(&forest, &matches, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report(&error, args.verbosity);
            ExitCode::FAILURE
        }
    }
}

async fn run(forest: &CommandForest, matches: &ArgMatches, args: &CliArgs) -> Result<()> {
    init_tracing(args.log_filter())?;

    let settings = Settings::load(args.config.as_deref())?;
    debug!(
        source = settings.source.as_deref().unwrap_or("defaults"),
        context = %settings.context,
        "loaded settings"
    );

    forest.dispatch(matches, Arc::new(settings)).await
}

fn report(error: &anyhow::Error, verbosity: Verbosity) {
    if verbosity == Verbosity::Loud {
        eprintln!("error: {error:?}");
    } else {
        eprintln!("error: {error:#}");
    }
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("warn"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}
