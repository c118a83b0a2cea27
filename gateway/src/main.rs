//! Gateway binary: the public-facing process that accepts tunnels from
//! agents and allocates ingress ports. See [`supervisor::run`] for the
//! top-level accept loop; this file only wires up logging, config and
//! the `-version` flag, mirroring `cmd/wormhole/main.go`'s thin `main`.

mod config;
mod directory;
mod error;
mod ingress;
mod metrics;
mod session;
mod supervisor;

use config::Config;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-version" || a == "--version") {
        println!("wormhole-gateway {VERSION}");
        return;
    }
    if !args.iter().any(|a| a == "-server" || a == "--server") {
        eprintln!("wormhole-gateway must be run with -server");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tunnel_gateway=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(err) => {
            tracing::error!("config error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = supervisor::run(config).await {
        tracing::error!("gateway exited with error: {err}");
        std::process::exit(1);
    }
}
