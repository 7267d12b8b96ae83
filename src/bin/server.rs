//! noderelay tunnel node binary
//!
//! Usage: noderelay-node [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Generate new node configuration
//!   -h, --help           Print help information

use std::env;

use tokio_util::sync::CancellationToken;

use noderelay::config::NodeConfigFile;
use noderelay::tunnel::TunnelServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log level from RUST_LOG, defaulting to info
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
            run_node(&args[2]).await?;
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
        r#"noderelay-node - tunnel endpoint for noderelay-local

USAGE:
    noderelay-node [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Generate new node configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a new configuration:
        noderelay-node --generate > node.toml

    Run the node:
        noderelay-node --config node.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config_file = NodeConfigFile::sample();

    println!("# noderelay node configuration");
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);
    println!("# Client entry (add to the proxies list of config.json):");
    println!(
        "# {{\"name\": \"my-node\", \"type\": \"ss\", \"server\": \"YOUR_SERVER_IP\", \"port\": 8388, \"cipher\": \"{}\", \"password\": \"{}\"}}",
        config_file.cipher, config_file.password
    );

    Ok(())
}

async fn run_node(config_path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(config_path)?;
    let config = NodeConfigFile::from_toml(&content)?.to_config()?;

    tracing::info!("Starting tunnel node on {}", config.listen);
    tracing::info!("Cipher: {}", config.cipher);

    let server = TunnelServer::new(config);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let mut serve = tokio::spawn(async move { server.run(token).await });

    tokio::select! {
        finished = &mut serve => {
            finished??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }

    tracing::info!("Shutting down");
    cancel.cancel();
    serve.await??;

    Ok(())
}
