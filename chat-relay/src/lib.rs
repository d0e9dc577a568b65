//! Line-oriented TCP chat relay.
//!
//! Every line a client sends is forwarded to every other connected client.
//! The server keeps one task per connection plus one accept loop; the only
//! state they share is the [`registry::PeerRegistry`].
//!
//! - [`server`] binds, runs the accept loop, and owns shutdown.
//! - [`session`] is the per-connection task: register, greet, read lines,
//!   relay them, clean up.
//! - [`registry`] is the lock-guarded set of connected peers.
//! - [`relay`] fans one message out to a snapshot of the registry.
//! - [`peer`] wraps the write half of a connection behind its own lock.
//! - [`frame`] reads and writes newline-delimited text.
//! - [`config`] and [`cli`] hold settings and their command-line form.
//! - [`client`] is a small terminal client for the same protocol.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use config::RelayConfig;
pub use error::RelayError;
pub use server::RelayServer;
