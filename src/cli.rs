//! Command-line interface for sockws

use crate::client::{ClientOption, DispatchMode, Socks5Gateway};
use crate::server::{EgressServer, ServerOption};
use crate::version::{platform, VERSION};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::error::Error;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;

/// CLI represents the command-line interface for sockws
pub struct CLI {
    app: App,
}

/// SOCKS5 to multiplexed WebSocket tunnel proxy
#[derive(Parser)]
#[clap(version = VERSION, about = "SOCKS5 to multiplexed WebSocket tunnel proxy")]
struct App {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the version number
    Version,

    /// Start the local SOCKS5 gateway
    Client {
        /// Client configuration file
        #[clap(short = 'c', long, default_value = "client_config.json")]
        config: PathBuf,

        /// Override the SOCKS5 listen port
        #[clap(short = 'p', long)]
        port: Option<u16>,

        /// Override the egress server URL
        #[clap(short = 'u', long)]
        url: Option<String>,

        /// Dial targets directly instead of tunnelling
        #[clap(long)]
        direct: bool,

        /// Show debug logs (use -dd for trace logs)
        #[clap(short = 'd', long, action = clap::ArgAction::Count)]
        debug: u8,
    },

    /// Start the egress server
    Server {
        /// Server configuration file
        #[clap(short = 'c', long, default_value = "server_config.json")]
        config: PathBuf,

        /// Show debug logs (use -dd for trace logs)
        #[clap(short = 'd', long, action = clap::ArgAction::Count)]
        debug: u8,
    },
}

impl CLI {
    /// Creates a new CLI instance
    pub fn new() -> Self {
        CLI { app: App::parse() }
    }

    /// Executes the CLI application
    pub fn execute(&self) -> Result<(), Box<dyn Error>> {
        match &self.app.command {
            Commands::Version => {
                println!("sockws version {} {}", VERSION, platform());
                Ok(())
            }
            Commands::Client {
                config,
                port,
                url,
                direct,
                debug,
            } => {
                self.init_logging(*debug);
                let mut options = ClientOption::load(config)?;
                if let Some(port) = port {
                    options = options.with_client_port(*port);
                }
                if let Some(url) = url {
                    options = options.with_server_url(url.clone());
                }
                if *direct {
                    options = options.with_mode(DispatchMode::Direct);
                }
                self.run_client(options)
            }
            Commands::Server { config, debug } => {
                self.init_logging(*debug);
                self.run_server(ServerOption::load(config)?)
            }
        }
    }

    /// Initialize logging with appropriate level
    fn init_logging(&self, debug_level: u8) {
        let level = match debug_level {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        env_logger::Builder::new()
            .format_timestamp_millis()
            .filter_level(level)
            .init();
    }

    /// Run the client with the given options
    #[tokio::main]
    async fn run_client(&self, options: ClientOption) -> Result<(), Box<dyn Error>> {
        let gateway = Socks5Gateway::new(options)?;
        info!("Configuration:");
        info!("  Egress server: {}", gateway.options().server_url);
        info!("  Mode: {:?}", gateway.options().mode);
        until_ctrl_c("client", gateway.serve()).await
    }

    /// Run the server with the given options
    #[tokio::main]
    async fn run_server(&self, options: ServerOption) -> Result<(), Box<dyn Error>> {
        let server = EgressServer::new(options)?;
        until_ctrl_c("server", server.serve()).await
    }
}

impl Default for CLI {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive `serve` until it fails or Ctrl+C arrives
async fn until_ctrl_c<F>(name: &str, serve: F) -> Result<(), Box<dyn Error>>
where
    F: Future<Output = crate::error::Result<()>>,
{
    tokio::select! {
        result = serve => {
            if let Err(err) = &result {
                error!("Exit due to error: {}", err);
            }
            result.map_err(Into::into)
        }
        signal = signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("Shutting down {}...", name);
                // Allow time for log messages to be written before exit
                sleep(Duration::from_millis(100)).await;
                Ok(())
            }
            Err(err) => {
                error!("Error waiting for Ctrl+C: {}", err);
                Err(err.into())
            }
        },
    }
}
