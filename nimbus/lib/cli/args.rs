use std::path::PathBuf;

use clap::Parser;

use crate::{config::NimbusConfig, utils::NIMBUS_CONFIG_FILENAME, NimbusResult};

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// nimbus - Disposable micro-VM sandboxes for running untrusted code
#[derive(Debug, Parser)]
#[command(name = "nimbus", author, about, version, styles=styles::styles())]
pub struct NimbusArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<NimbusSubcommand>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Top-level subcommands
#[derive(Debug, Parser)]
pub enum NimbusSubcommand {
    /// Manage the REST server
    #[command(name = "server")]
    Server {
        /// The server action
        #[command(subcommand)]
        subcommand: ServerSubcommand,
    },

    /// Print the effective configuration
    #[command(name = "config")]
    Config {
        /// Options locating the configuration
        #[command(flatten)]
        location: ConfigLocation,
    },
}

/// Server subcommands
#[derive(Debug, Parser)]
pub enum ServerSubcommand {
    /// Start the REST server and the expiry sweeper
    #[command(name = "start")]
    Start {
        /// Port to listen on, keeping the configured interface
        #[arg(long)]
        port: Option<u16>,

        /// Options locating the configuration
        #[command(flatten)]
        location: ConfigLocation,
    },

    /// Print a new random server key
    #[command(name = "keygen")]
    Keygen,

    /// Issue an API key for a team, signed with the configured server key
    #[command(name = "token")]
    Token {
        /// The team the key acts for
        #[arg(long)]
        team: String,

        /// Hours until the key expires
        #[arg(long, default_value_t = 24)]
        expire_hours: i64,

        /// Options locating the configuration
        #[command(flatten)]
        location: ConfigLocation,
    },
}

/// Where the configuration comes from.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigLocation {
    /// The nimbus home directory
    #[arg(long, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// The configuration file. Defaults to nimbus.toml in the home directory
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl ConfigLocation {
    /// Loads the configuration, placing nimbus state under `--home` when it is given.
    pub async fn load(&self) -> NimbusResult<NimbusConfig> {
        let path = match (&self.config, &self.home) {
            (Some(config), _) => Some(config.clone()),
            (None, Some(home)) => Some(home.join(NIMBUS_CONFIG_FILENAME)),
            (None, None) => None,
        };

        let config = NimbusConfig::load(path.as_deref()).await?;
        Ok(match &self.home {
            Some(home) => config.with_home_dir(home),
            None => config,
        })
    }
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
