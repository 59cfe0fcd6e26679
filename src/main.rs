use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpserve::{Config, DhcpServer, LeaseEvent, Result};

#[derive(Parser)]
#[command(name = "dhcpserve")]
#[command(author, version, about = "An RFC 2131 DHCPv4 server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let server = DhcpServer::new(config).await?;

            let mut events = server.lease_events();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        LeaseEvent::Added(lease) => {
                            info!(client = %lease.hwaddr, address = %lease.address, "lease added");
                        }
                        LeaseEvent::Changed(lease) => {
                            info!(
                                client = %lease.hwaddr,
                                address = %lease.address,
                                status = ?lease.status,
                                "lease changed"
                            );
                        }
                        LeaseEvent::Removed(lease) => {
                            info!(client = %lease.hwaddr, address = %lease.address, "lease removed");
                        }
                    }
                }
            });

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    server.stop();
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("Configuration OK.");
            Ok(())
        }
    }
}
