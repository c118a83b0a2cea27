//! Environment-driven configuration for the gateway process. Parsing is
//! hand-rolled (`std::env`) rather than pulled from a CLI-parsing crate —
//! flag/env parsing is an external collaborator whose interface only is
//! specified, mirroring the original's two bare `flag.Bool` calls.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tunnel_transport::kcp_transport::KcpConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Which transport variant this gateway instance speaks. Selected by
/// whether `SSH_PRIVATE_KEY` is set, per the external interface contract.
pub enum TransportVariant {
    Datagram { passphrase: String, kcp: KcpConfig },
    Handshake { private_key_path: String },
}

pub struct Config {
    pub listen_port: u16,
    pub node_id: String,
    pub redis_url: String,
    pub cluster_id: String,
    pub localhost: Option<String>,
    pub transport: TransportVariant,
    pub metrics_addr: SocketAddr,
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

fn env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl Config {
    /// Loads and validates configuration from the process environment.
    /// Fails fast: any missing required value is an error the caller
    /// should treat as fatal at startup (exit code 1).
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_port = env_var_opt("PORT")
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|_| ConfigError::InvalidValue {
                name: "PORT",
                value: std::env::var("PORT").unwrap_or_default(),
            })?
            .unwrap_or(10000);

        let node_id = env_var_opt("NODE_ID").unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-node".to_string())
        });

        let redis_url = env_var("REDIS_URL")?;
        let cluster_id = env_var("CLUSTER_URL")?;
        let localhost = env_var_opt("LOCALHOST");

        let transport = if let Some(path) = env_var_opt("SSH_PRIVATE_KEY") {
            // Fail fast on an unreadable key file rather than discovering
            // it only once the first agent tries to connect.
            std::fs::metadata(&path).map_err(|source| ConfigError::KeyFile { path: path.clone(), source })?;
            TransportVariant::Handshake {
                private_key_path: path,
            }
        } else {
            let passphrase = env_var("PASSPHRASE")?;
            TransportVariant::Datagram {
                passphrase,
                kcp: KcpConfig::default(),
            }
        };

        Ok(Self {
            listen_port,
            node_id,
            redis_url,
            cluster_id,
            localhost,
            transport,
            metrics_addr: "0.0.0.0:9191".parse().unwrap(),
        })
    }

    pub fn keepalive_interval(&self) -> Duration {
        match &self.transport {
            TransportVariant::Datagram { kcp, .. } => kcp.keepalive,
            TransportVariant::Handshake { .. } => Duration::from_secs(10),
        }
    }
}
