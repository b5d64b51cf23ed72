use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use xray_pilot::config::{default_settings_path, Settings};
use xray_pilot::proxy::env::{export_lines, unset_line};
use xray_pilot::proxy::{Activation, ProxyController};

/// Run Xray-core as a local SOCKS5 proxy through the fastest subscription node.
#[derive(Parser, Debug)]
#[command(name = "xray-pilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, env = "XRAY_PILOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy with the saved subscription (default)
    On,
    /// Stop the proxy
    Off,
    /// Show whether the proxy is running
    Status,
    /// Save a subscription URL and start the proxy with it
    Subscribe { url: String },
    /// Start the proxy from a local subscription file without saving it
    Load { file: PathBuf },
    /// Download xray-core and its routing data
    Install,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let settings_path = cli.config.unwrap_or_else(default_settings_path);
    let settings = Settings::load(&settings_path)?;
    let mut controller = ProxyController::new(settings, &settings_path)?;

    match cli.command.unwrap_or(Command::On) {
        Command::On => report(&controller.enable().await?),
        Command::Subscribe { url } => report(&controller.subscribe(&url).await?),
        Command::Load { file } => report(&controller.enable_from_file(&file).await?),
        Command::Off => {
            controller.disable().await?;
            println!("proxy stopped");
            println!("to clear the proxy environment:\n  {}", unset_line());
        }
        Command::Status => {
            let status = controller.status();
            println!("proxy: {status}");
            let proxy = &controller.settings().proxy;
            if proxy.has_subscription() {
                println!("subscription: {}", proxy.subscription_url);
            } else {
                println!("run `xray-pilot subscribe <url>` to configure a subscription");
            }
        }
        Command::Install => {
            controller.install().await?;
            println!(
                "xray-core installed at {}",
                controller.settings().proxy.binary_path().display()
            );
        }
    }
    Ok(())
}

fn report(activation: &Activation) {
    let node = &activation.node;
    println!(
        "proxy running on {} (PID {}), node '{}' {}:{} ({}ms, {} nodes probed)",
        activation.proxy_url(),
        activation.pid,
        node.name,
        node.server,
        node.port,
        node.latency_ms.unwrap_or_default(),
        activation.total_nodes
    );
    println!("to use the proxy, set:");
    for line in export_lines(activation.local_port) {
        println!("  {line}");
    }
}
