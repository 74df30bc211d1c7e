//! Session launcher CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use cloudgrid::{init_logging, tunnel, Launcher, TunnelGuard};
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(name = "cloudgrid")]
#[command(about = "Cloud browser session launcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Account username
    #[arg(long)]
    username: Option<String>,

    /// Account access key (falls back to BROWSERSTACK_ACCESS_KEY)
    #[arg(long)]
    key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a tunnel is already listening locally
    Status,

    /// Open a remote session and navigate to a URL
    Open {
        /// URL to visit
        url: String,

        /// Browser name capability
        #[arg(long, default_value = "chrome")]
        browser: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let addr = tunnel::default_probe_addr();

            if tunnel::probe(addr) {
                println!("✓ Tunnel listening on {}", addr);
            } else {
                println!("✗ No tunnel listening on {}", addr);
            }
        }

        Commands::Open { url, browser } => {
            let guard = TunnelGuard::acquire();
            let mut launcher = Launcher::new(guard.handle());

            if let Some(username) = cli.username {
                launcher.config_mut().set_username(username);
            }
            if let Some(key) = cli.key {
                launcher.config_mut().set_access_key(key);
            }

            let mut caps = Map::new();
            caps.insert("browserName".to_string(), Value::String(browser));
            launcher.config_mut().set_capabilities(caps);

            let client = launcher.create_session(None).await?;

            println!("Navigating to: {}", url);
            client.goto(&url).await?;

            let title = client.title().await?;
            println!("✓ Page title: {}", title);

            client.close().await?;
        }
    }

    Ok(())
}
