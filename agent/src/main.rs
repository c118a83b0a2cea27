//! Agent binary: runs on the same host as the local application, dials
//! out to a gateway, and relays tunnel streams into it. See
//! [`supervisor::run`] for the reconnect loop; this file only wires up
//! logging, config and the supervised child, mirroring
//! `cmd/local/main.go`'s thin `main`.

mod backoff;
mod config;
mod process;
mod supervisor;

use config::Config;
use process::ChildProcess;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-version" || a == "--version") {
        println!("wormhole-agent {VERSION}");
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    // Everything after a lone `--` is the supervised program's command
    // line; strip the separator before handing the rest to `Config`.
    if let Some(pos) = args.iter().position(|a| a == "--") {
        args.remove(pos);
    }

    let config = match Config::from_env_and_args(args) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!("config error: {err}");
            std::process::exit(1);
        }
    };

    let child = if config.program_args.is_empty() {
        None
    } else {
        match ChildProcess::spawn(&config.program_args) {
            Ok(c) => Some(c),
            Err(err) => {
                tracing::error!("failed to start supervised program: {err}");
                std::process::exit(1);
            }
        }
    };

    if let Err(err) = supervisor::run(config, child).await {
        tracing::error!("agent exited with error: {err}");
        std::process::exit(1);
    }
}
