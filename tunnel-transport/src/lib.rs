//! Transport adapter, stream multiplexer and authenticator shared by the
//! agent and gateway binaries: everything about moving bytes between the
//! two processes that doesn't care which one is asking.

pub mod auth;
pub mod connection;
pub mod crypt;
pub mod error;
pub mod kcp_transport;
pub mod mux;
pub mod ssh_transport;

pub use connection::{Connection, Stream};
pub use error::{AuthError, TransportError};
pub use mux::Mux;
