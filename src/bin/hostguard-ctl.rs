//! hostguard-ctl - a cli for hostguard

#![deny(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;
use hostguard::commands::control_commands::{Command, PurgeArgs, VpnArgs};
use hostguard::commands::CommandClient;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, action, help = "output in json format")]
    json: bool,

    /// hostguard control socket to interact with
    #[clap(
        long,
        env = "HOSTGUARD_SOCKET",
        default_value = "/var/run/hostguard.sock"
    )]
    pub control_socket: PathBuf,

    #[clap(subcommand)]
    action: Command,
}

async fn show_ip_addresses(client: &CommandClient, json: bool) -> Result<()> {
    let ips = client.ip_addresses().await?;
    if json {
        println!(
            "{}",
            serde_json::to_string(&ips).context("Failed to serialize json")?
        );
    } else if ips.is_empty() {
        println!("No ip address");
    } else {
        println!("{}", ips.join("\n"));
    }
    Ok(())
}

/// The hostguard-ctl program entry point
#[tokio::main]
pub async fn main() {
    let args = Args::parse();
    let client = CommandClient::new(&args.control_socket);
    let res = match args.action {
        Command::Ping => client.ping().await.map(|m| println!("{m}")),
        Command::Ipaddr => show_ip_addresses(&client, args.json).await,
        Command::Purge(PurgeArgs { app_id }) => client.purge(&app_id).await.map(|m| println!("{m}")),
        Command::Reboot => client.reboot().await.map(|m| println!("{m}")),
        Command::Shutdown => client.shutdown().await.map(|m| println!("{m}")),
        Command::Vpn(VpnArgs { disable }) => {
            client.vpn_control(!disable).await.map(|m| println!("{m}"))
        }
    };
    if let Err(e) = res {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
