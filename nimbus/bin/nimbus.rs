use std::net::SocketAddr;

use anyhow::Context;
use chrono::TimeDelta;
use clap::{CommandFactory, Parser};
use nimbus::{
    cli::{ConfigLocation, NimbusArgs, NimbusSubcommand, ServerSubcommand},
    server::{self, generate_server_key, issue_api_key},
    Nimbus,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = NimbusArgs::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match args.subcommand {
        Some(NimbusSubcommand::Server { subcommand }) => match subcommand {
            ServerSubcommand::Start { port, location } => start_server(port, &location).await?,
            ServerSubcommand::Keygen => println!("{}", generate_server_key()),
            ServerSubcommand::Token {
                team,
                expire_hours,
                location,
            } => {
                let config = location.load().await?;
                let key = config
                    .get_server_key()
                    .as_deref()
                    .context("no server key configured; set NIMBUS_SERVER_KEY or server_key")?;
                println!(
                    "{}",
                    issue_api_key(key, &team, TimeDelta::hours(expire_hours))?
                );
            }
        },
        Some(NimbusSubcommand::Config { location }) => {
            let config = location.load().await?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        None => {
            NimbusArgs::command().print_help()?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

async fn start_server(port: Option<u16>, location: &ConfigLocation) -> anyhow::Result<()> {
    let mut config = location.load().await?;
    if let Some(port) = port {
        let addr = SocketAddr::new(config.get_server_addr().ip(), port);
        config = config.with_server_addr(addr);
    }

    let nimbus = Nimbus::new(config).await?;
    let sweeper = nimbus.start_sweeper();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received interrupt, shutting down");
                signal.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for interrupts"),
        }
    });

    let served = server::serve(nimbus.clone(), shutdown).await;
    nimbus.shutdown().await;
    let _ = sweeper.await;

    served.context("server failed")
}
