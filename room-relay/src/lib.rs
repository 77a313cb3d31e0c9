//! Room-based chat router over TCP with relayed file transfers.
//!
//! Clients speak newline-delimited JSON envelopes and plain text lines. A
//! single dispatcher task owns all shared state; each connection gets a read
//! pump and a write pump that talk to it over channels.
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`server`] binds the listener, spawns the hub, and accepts connections.
//! - [`connection`] runs the per-connection read and write pumps.
//! - [`hub`] dispatches commands, chat, and file chunks against the registries.
//! - [`session`], [`room`], [`transfer`] and [`credentials`] hold the state the
//!   hub owns.
//! - [`command`] classifies inbound lines and parses slash commands.
//! - [`message`] provides the envelope type plus async line helpers.
//! - [`client`] is the terminal client, including chunked file sending.

pub mod cli;
pub mod client;
pub mod command;
pub mod connection;
pub mod credentials;
pub mod hub;
pub mod message;
pub mod room;
pub mod server;
pub mod session;
pub mod transfer;
