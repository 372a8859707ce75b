mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Command};
use gdefs::config::Config;
use gdefs::Cancellation;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let long_running = matches!(cli.command, Command::Serve | Command::Watch { .. });
    let default_level = if long_running { "info" } else { "warn" };

    // Stdout stays clean for CLI output and MCP protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = Config::load_or_default(cli.config.as_deref())?;

    // Ctrl+C rolls back the repository being updated and stops the watch loop.
    let cancel = Cancellation::new();
    if !matches!(cli.command, Command::Serve) {
        let on_interrupt = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || on_interrupt.cancel()) {
            tracing::warn!(error = %e, "cannot install Ctrl+C handler, interrupts will not cancel");
        }
    }

    match cli.command {
        Command::Update { repos, all } => {
            commands::cmd_update(&config, &cli.actor, repos, all, &cancel, cli.json)
        }
        Command::Search {
            tokens,
            repo,
            unit,
            unit_type,
            limit,
        } => commands::cmd_search(
            &config, &cli.actor, tokens, repo, unit, unit_type, limit, cli.json,
        ),
        Command::RefreshRefs { repos } => {
            commands::cmd_refresh_refs(&config, &cli.actor, repos, cli.json)
        }
        Command::Defs { repo } => commands::cmd_defs(&config, &repo, cli.json),
        Command::Stats => commands::cmd_stats(&config, cli.json),
        Command::Watch { repos, interval } => {
            commands::cmd_watch(&config, &cli.actor, repos, interval, &cancel)
        }
        Command::Serve => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(gdefs::mcp::run_server(&config))
        }
    }
}
