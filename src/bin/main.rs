use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use sarhub::config::Config;
use sarhub::server::Server;
use sarhub::telemetry;

/// Real-time collaboration server for search-and-rescue incident
/// coordination.
#[derive(Parser)]
#[command(name = "sarhub", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("sarhub: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    telemetry::init(cli.verbose, &config.logging);

    if let Err(err) = run(config) {
        tracing::error!(%err, "server failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(config: Config) -> sarhub::Result<()> {
    let server = Server::new(config)?;
    let handle = server.start()?;
    handle.wait();
    Ok(())
}
