use anyhow::Result;
use clap::{CommandFactory, Parser};

use tether::cli::{Cli, Commands};
use tether::config::Config;
use tether::{doctor, gateway, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    if let Some(shell) = cli.generate {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        return Ok(());
    }

    logging::init(cli.json_logs, cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    match cli.command.clone().unwrap_or(Commands::Serve) {
        Commands::Serve => gateway::serve(config).await,
        Commands::Doctor => {
            let checks = doctor::run_checks(&config).await;
            print!("{}", doctor::render(&checks));
            if checks.iter().all(|c| c.ok) {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
    }
}
