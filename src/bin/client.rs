//! noderelay local proxy binary
//!
//! Usage: noderelay-local [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Run the proxy with a configuration file
//!   -p, --probe <FILE>   Probe every node once and print a report
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use noderelay::node::Registry;
use noderelay::probe::ProbeReport;
use noderelay::proxy::ProxyServer;
use noderelay::Config;

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
        "-p" | "--probe" => {
            if args.len() < 3 {
                eprintln!("Error: --probe requires a config file path");
                return Ok(());
            }
            let json = args.get(3).map(String::as_str) == Some("--json");
            probe_once(&args[2], json).await?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_proxy(&args[2]).await?;
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
        r#"noderelay-local - latency-aware proxy over tunnel nodes

USAGE:
    noderelay-local [OPTIONS]

OPTIONS:
    -c, --config <FILE>          Run the proxy (SOCKS5 + HTTP on one port)
    -p, --probe <FILE> [--json]  Probe every node once and print a report
    -h, --help                   Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "mixed-port": 7890,
        "proxies": [
            {{"name": "香港 01", "type": "ss", "server": "hk.example.net",
              "port": 8388, "cipher": "aes-256-gcm", "password": "..."}}
        ],
        "rules": ["DOMAIN-SUFFIX,google.com,Proxy", "MATCH,DIRECT"],
        "dns": {{"nameservers": ["223.5.5.5"], "fallback": ["8.8.8.8"]}},
        "proxy": {{"region": "HK", "fallback": "direct"}}
    }}

EXAMPLES:
    Check which nodes answer:
        noderelay-local --probe config.json

    Run the proxy:
        noderelay-local --config config.json
"#
    );
}

async fn probe_once(config_path: &str, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let registry = Registry::new(&config.nodes)?;
    let nodes = registry.snapshot();

    tracing::info!("Probing {} nodes", nodes.len());
    config.probe.prober().probe_all(&nodes).await;

    let report = ProbeReport::from_nodes(&nodes, config.probe.report_top);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }

    Ok(())
}

async fn run_proxy(config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;

    let registry = Arc::new(Registry::new(&config.nodes)?);
    let server = Arc::new(ProxyServer::from_config(&config, Arc::clone(&registry))?);
    let prober = config.probe.prober();

    tracing::info!(
        "Loaded {} nodes and {} rules",
        registry.len(),
        config.rules.len()
    );

    let cancel = CancellationToken::new();

    let probe_task = {
        let registry = Arc::clone(&registry);
        let cancel = cancel.clone();
        tokio::spawn(async move { prober.run(registry, cancel).await })
    };

    let listener = TcpListener::bind(&config.listen).await?;
    let proxy_task = tokio::spawn(Arc::clone(&server).run(listener, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cancel.cancel();

    proxy_task.await??;
    probe_task.await?;

    let metrics = server.metrics().snapshot();
    tracing::info!(
        "Served {} connections ({} proxied, {} direct, {} rejected, {} failovers)",
        metrics.total_connections,
        metrics.proxied_connections,
        metrics.direct_connections,
        metrics.rejected_connections,
        metrics.failovers
    );
    println!("{}", serde_json::to_string_pretty(&registry.traffic_report())?);

    Ok(())
}
