//! Command line and configuration loading
//!
//! Sources, lowest priority first: `conf/application.yml` (optional),
//! `PARLEY_*` environment variables, then command line flags.

use clap::{Parser, Subcommand};
use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};

use parley_core::model::Configuration;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "parley-server", version, about = "Parley peer coordination server")]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", env = "PARLEY_CONFIG", default_value = "conf/application.yml")]
    pub config_file: String,

    #[command(subcommand)]
    pub role: Role,
}

#[derive(Debug, Subcommand)]
pub enum Role {
    /// Run a peer: domain service, elections, clock sync and replication
    Peer {
        /// Display name of this peer
        #[arg(long)]
        name: Option<String>,
        /// Peer id, also the address of its coordination endpoint
        #[arg(long)]
        id: Option<String>,
        /// Address of the client-facing domain endpoint
        #[arg(long = "domain-address")]
        domain_address: Option<String>,
        #[arg(long = "reference-address")]
        reference_address: Option<String>,
        /// Directory of the domain store snapshot
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Run the reference service assigning ranks
    Reference {
        #[arg(long)]
        address: Option<String>,
    },
    /// Run the broadcast proxy
    Proxy {
        #[arg(long = "publish-address")]
        publish_address: Option<String>,
        #[arg(long = "subscribe-address")]
        subscribe_address: Option<String>,
    },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Peer { .. } => "peer",
            Role::Reference { .. } => "reference",
            Role::Proxy { .. } => "proxy",
        }
    }

    /// Configuration keys set on the command line
    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut overrides = Vec::new();
        let mut push = |key: &'static str, value: &Option<String>| {
            if let Some(value) = value {
                overrides.push((key, value.clone()));
            }
        };
        match self {
            Role::Peer {
                name,
                id,
                domain_address,
                reference_address,
                data_dir,
            } => {
                push("parley.peer.name", name);
                push("parley.peer.id", id);
                push("parley.peer.domain-address", domain_address);
                push("parley.reference.address", reference_address);
                push("parley.data.dir", data_dir);
            }
            Role::Reference { address } => push("parley.reference.address", address),
            Role::Proxy {
                publish_address,
                subscribe_address,
            } => {
                push("parley.proxy.publish-address", publish_address);
                push("parley.proxy.subscribe-address", subscribe_address);
            }
        }
        overrides
    }
}

fn base_builder(config_file: &str) -> ConfigBuilder<DefaultState> {
    Config::builder()
        .add_source(File::with_name(config_file).required(false))
        .add_source(
            Environment::with_prefix("PARLEY")
                .keep_prefix(true)
                .separator("__")
                .try_parsing(true),
        )
}

/// Build the layered configuration for `cli`
pub fn load_configuration(cli: &Cli) -> anyhow::Result<Configuration> {
    let mut builder = base_builder(&cli.config_file);
    for (key, value) in cli.role.overrides() {
        builder = builder.set_override(key, value)?;
    }
    Ok(Configuration::from_config(builder.build()?))
}
