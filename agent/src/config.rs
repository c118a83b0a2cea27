//! Environment-driven configuration for the agent process. Hand-rolled
//! the same way `gateway::config` is, and for the same reason: flag/env
//! parsing is scoped out as an external collaborator whose interface
//! only is specified.

use thiserror::Error;
use tunnel_transport::kcp_transport::KcpConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("neither a child program nor LOCAL_ENDPOINT was provided")]
    NoLocalEndpoint,
}

/// Which transport variant to dial, mirroring `gateway::config`'s
/// selection rule: a passphrase means the encrypted-datagram variant,
/// its absence means the public-key handshake variant.
pub enum TransportVariant {
    Datagram { passphrase: String, kcp: KcpConfig },
    Handshake,
}

pub struct Config {
    /// Positional arguments forming a shell command line to run as the
    /// supervised child, if any (`cmd/local/main.go`'s `runProgram`).
    pub program_args: Vec<String>,
    pub local_endpoint: Option<String>,
    pub remote_endpoint: String,
    pub token: String,
    pub transport: TransportVariant,
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

fn env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl Config {
    pub fn from_env_and_args(program_args: Vec<String>) -> Result<Self, ConfigError> {
        let local_endpoint = env_var_opt("LOCAL_ENDPOINT");
        if program_args.is_empty() && local_endpoint.is_none() {
            return Err(ConfigError::NoLocalEndpoint);
        }

        let remote_endpoint = env_var_opt("REMOTE_ENDPOINT").unwrap_or_else(|| ":10000".to_string());
        let token = env_var("FLY_TOKEN")?;

        let transport = match env_var_opt("PASSPHRASE") {
            Some(passphrase) => TransportVariant::Datagram {
                passphrase,
                kcp: KcpConfig::default(),
            },
            None => TransportVariant::Handshake,
        };

        Ok(Self {
            program_args,
            local_endpoint,
            remote_endpoint,
            token,
            transport,
        })
    }

    /// The `host:port` the agent relays tunnel streams into: either the
    /// supervised child's `127.0.0.1:$PORT` or the operator-supplied
    /// `LOCAL_ENDPOINT`, resolved once the child (if any) has a port.
    pub fn local_endpoint(&self, child_port: Option<&str>) -> String {
        if let Some(port) = child_port {
            format!("127.0.0.1:{port}")
        } else {
            self.local_endpoint.clone().expect("validated in from_env_and_args")
        }
    }
}
