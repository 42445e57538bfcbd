use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use fastpull_core::FastpullConfig;
use tracing::debug;

mod cli;
mod commands;

use cli::FastpullCli;
use commands::ExecutionOutcome;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = FastpullCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let mut config = FastpullConfig::from_env().map_err(|err| eyre!("{err:?}"))?;
    if let Some(base) = &cli.base_path {
        config = config.with_base_path(base);
    }
    debug!(base = %config.base_path.display(), "configuration loaded");

    let outcome = commands::execute(&config, &cli.command)
        .await
        .map_err(|err| eyre!("{err:?}"))?;
    let code = emit_output(&cli, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("fastpull={level},fastpull_core={level},fastpull_blos={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn emit_output(cli: &FastpullCli, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.status.exit_code();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else if code == 0 {
        println!("{}", outcome.message);
    } else {
        eprintln!("fastpull: {}", outcome.message);
    }
    Ok(code)
}
