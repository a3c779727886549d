//! ssgate Server Binary
//!
//! Usage: ssgate-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Run with the given configuration file
//!   -g, --generate             Print a sample configuration and users file
//!   --check-roster <FILE>      Fetch the configured roster once and summarise it
//!   -h, --help                 Print help information

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::watch;

use ssgate::crypto::{CipherKind, SecureRandom};
use ssgate::server::{
    sources_for, RosterConfig, RosterFile, Server, ServerConfig, ServerConfigFile, UserKey,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default level (e.g. RUST_LOG=ssgate=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        "--check-roster" => {
            if args.len() < 3 {
                eprintln!("Error: --check-roster requires a config file path");
                return Ok(());
            }
            check_roster(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"ssgate Server - multi-user AEAD tunneling relay

USAGE:
    ssgate-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>        Run with the given configuration file
    -g, --generate             Print a sample configuration and users file
    --check-roster <FILE>      Fetch the configured roster once and summarise it
    -h, --help                 Print help information

EXAMPLES:
    Generate a configuration:
        ssgate-server --generate

    Check which ports and users the roster yields:
        ssgate-server --check-roster server.toml

    Run the server:
        ssgate-server --config server.toml
"#
    );
}

fn load_config(path: &str) -> anyhow::Result<ServerConfig> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path))?;
    let config = ServerConfigFile::from_toml(&content)?.to_config()?;
    config.validate()?;
    Ok(config)
}

fn random_secret() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    URL_SAFE_NO_PAD.encode(SecureRandom::bytes::<16>())
}

fn generate_config() -> anyhow::Result<()> {
    let config = ServerConfig::new(RosterConfig::File {
        path: PathBuf::from("users.toml"),
    });
    let users = vec![
        UserKey::new("user-1", 8388, CipherKind::Chacha20IetfPoly1305, random_secret()),
        UserKey::new("user-2", 8388, CipherKind::Aes256Gcm, random_secret()),
        UserKey::new("user-3", 8389, CipherKind::Aes128Gcm, random_secret()),
    ];

    println!("# ssgate Server Configuration (server.toml)");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", ServerConfigFile::from_config(&config).to_toml()?);
    println!();
    println!("# Users (users.toml)");
    println!();
    println!("{}", RosterFile::from_users(&users).to_toml()?);

    Ok(())
}

async fn check_roster(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (roster, _) = sources_for(&config.roster)?;
    let users = roster.fetch().await?;

    let mut ports: BTreeMap<u16, Vec<&UserKey>> = BTreeMap::new();
    for user in &users {
        ports.entry(user.port).or_default().push(user);
    }

    println!("{} users on {} ports", users.len(), ports.len());
    for (port, users) in ports {
        println!();
        println!("Port {}:", port);
        for user in users {
            println!("  {:<24} {:<24} {}", user.id, user.cipher, user.fingerprint().short());
        }
    }

    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let server = Server::new(config)?;
    let metrics = server.metrics();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        shutdown_tx.send_replace(true);
    });

    server.run(shutdown_rx).await?;
    println!("{}", metrics.format_report());

    Ok(())
}
