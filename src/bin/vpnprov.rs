//! vpnprov - VPN client provisioning CLI
//!
//! Operator entry point for issuing, revoking and inspecting a user's VPN
//! credentials on this server.

use anyhow::Context;
use clap::{Parser, Subcommand};
use libvpnprov::{ArtifactKind, ClientIdentity, ProvisionReport, Provisioner, ServerConfig, DEFAULT_SETUP_PATH};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "vpnprov")]
#[command(about = "Provision and revoke OpenVPN, WireGuard and VLESS clients", long_about = None)]
#[command(version)]
struct Cli {
    /// Server setup file
    #[arg(short, long, default_value = DEFAULT_SETUP_PATH)]
    setup: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, default_value = "text")]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue or reissue credentials on every protocol
    Create {
        /// Numeric user id, or an `n<id>` identity
        #[arg(value_parser = parse_user_id)]
        user_id: i64,
    },
    /// Revoke credentials and remove client profiles
    Delete {
        #[arg(value_parser = parse_user_id)]
        user_id: i64,
    },
    /// List the client profiles currently on disk
    Show {
        #[arg(value_parser = parse_user_id)]
        user_id: i64,
    },
}

fn parse_user_id(s: &str) -> Result<i64, String> {
    s.parse::<ClientIdentity>()
        .ok()
        .and_then(|id| id.user_id())
        .ok_or_else(|| format!("'{}' is not a user id", s))
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vpnprov={},libvpnprov={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = ServerConfig::load(&cli.setup)?;

    #[cfg(unix)]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 && !matches!(cli.command, Commands::Show { .. }) {
            warn!("Not running as root; PKI and WireGuard changes will likely fail");
        }
    }

    let provisioner = Provisioner::new(config);
    let json = cli.output == "json";

    match cli.command {
        Commands::Create { user_id } => {
            let report = provisioner
                .create_user(user_id)
                .await
                .with_context(|| format!("create failed for user {}", user_id))?;
            let artifacts = provisioner.list_artifacts(user_id).await?;
            if json {
                let mut value = report_json(&report);
                value["artifacts"] = artifacts_json(&artifacts);
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}", report);
                print_artifacts(user_id, &artifacts);
            }
            Ok(())
        }
        Commands::Delete { user_id } => {
            let report = provisioner
                .delete_user(user_id)
                .await
                .with_context(|| format!("delete failed for user {}", user_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
            } else {
                println!("{}", report);
            }
            Ok(())
        }
        Commands::Show { user_id } => {
            let artifacts = provisioner.list_artifacts(user_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&artifacts_json(&artifacts))?);
            } else {
                print_artifacts(user_id, &artifacts);
            }
            Ok(())
        }
    }
}

fn report_json(report: &ProvisionReport) -> Value {
    json!({
        "identity": report.identity.as_str(),
        "openvpn": report.openvpn.to_string(),
        "wireguard": report.wireguard.to_string(),
        "xray": report.xray.to_string(),
    })
}

fn artifacts_json(artifacts: &[(ArtifactKind, PathBuf)]) -> Value {
    artifacts
        .iter()
        .map(|(kind, path)| {
            json!({
                "kind": kind.prefix(),
                "protocol": kind.protocol().to_string(),
                "path": path.display().to_string(),
            })
        })
        .collect()
}

fn print_artifacts(user_id: i64, artifacts: &[(ArtifactKind, PathBuf)]) {
    if artifacts.is_empty() {
        println!("No client profiles for {}", ClientIdentity::from_user_id(user_id));
        return;
    }
    println!("{:<10} {:<10} PATH", "KIND", "PROTOCOL");
    for (kind, path) in artifacts {
        println!("{:<10} {:<10} {}", kind.prefix(), kind.protocol(), path.display());
    }
}
