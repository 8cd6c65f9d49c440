//! Portcullis daemon.
//!
//! Usage: portcullisd [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -t, --check          Validate the configuration and exit
//!   -V, --version        Print version information
//!   -h, --help           Print help information

use std::env;

use portcullis::{App, Config};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<String> = None;
    let mut check_only = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "-V" | "--version" => {
                println!("portcullis {}", portcullis::VERSION);
                return Ok(());
            }
            "-t" | "--check" => check_only = true,
            "-c" | "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = Some(path.clone()),
                    None => anyhow::bail!("--config requires a file path"),
                }
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage();
                std::process::exit(2);
            }
        }
        i += 1;
    }

    let path = match config_path {
        Some(path) => path.into(),
        None => Config::find_default()?,
    };
    let config = Config::load(&path)?;

    if check_only {
        println!("configuration ok: {}", path.display());
        return Ok(());
    }

    init_tracing(config.logging.level.as_deref());
    tracing::info!("portcullis {} using {}", portcullis::VERSION, path.display());

    let app = App::new(config)?;
    let token = CancellationToken::new();

    let shutdown_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown_token.cancel();
        }
    });

    app.run(token).await?;
    Ok(())
}

/// RUST_LOG takes precedence; the config level is the fallback.
fn init_tracing(config_level: Option<&str>) {
    let fallback = config_level.unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_target(false)
        .init();
}

fn print_usage() {
    println!(
        r#"portcullis - multi-protocol forwarding proxy

USAGE:
    portcullisd [OPTIONS]

OPTIONS:
    -c, --config <FILE>   Path to configuration file
    -t, --check           Validate the configuration and exit
    -V, --version         Print version information
    -h, --help            Print help information

Without --config the file is searched in ./portcullis.toml,
~/.portcullis.toml, /usr/local/etc/portcullis.toml and
/etc/portcullis.toml.
"#
    );
}
