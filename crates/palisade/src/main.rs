use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Error;
use clap::{Parser, Subcommand};
use palisade_policy::{dump, load_file, AllowAll, Authenticator, DenyAll};
use palisade_proxy::{Proxy, ProxyConfig};

#[derive(Parser, Debug)]
#[command(name = "palisade", version, about = "Inline HTTP firewall shim")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the shim in front of a backend service
    Run {
        /// Path to the JSON policy config
        #[arg(long)]
        config: PathBuf,

        /// Address to accept client connections on
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Address of the protected service
        #[arg(long)]
        backend: SocketAddr,

        /// Maximum simultaneous client connections
        #[arg(long, default_value_t = 1024)]
        max_connections: usize,

        /// Close connections idle for longer than this many seconds
        #[arg(long)]
        idle_timeout_secs: Option<u64>,

        /// Treat every client as logged in, skipping login checks
        #[arg(long)]
        assume_authenticated: bool,
    },

    /// Print the resolved policy table and exit
    DumpConfig {
        /// Path to the JSON policy config
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<(), Error> {
    devutils::init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            listen,
            backend,
            max_connections,
            idle_timeout_secs,
            assume_authenticated,
        } => {
            let table = Arc::new(load_file(&config)?);

            let auth: Box<dyn Authenticator + Send> = if assume_authenticated {
                Box::new(AllowAll)
            } else {
                Box::new(DenyAll)
            };

            let mut proxy_config = ProxyConfig::new(listen, backend);
            proxy_config.max_pairs = max_connections;
            proxy_config.idle_timeout = idle_timeout_secs.map(Duration::from_secs);

            let proxy = Proxy::bind(proxy_config, table, auth)?;
            proxy.run()
        }
        Command::DumpConfig { config } => {
            let table = load_file(&config)?;
            print!("{}", dump(&table));
            Ok(())
        }
    }
}
