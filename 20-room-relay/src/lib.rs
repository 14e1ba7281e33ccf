//! Room relay: named chat rooms over a TCP handshake and a UDP fan-out.
//!
//! A client opens a TCP connection, asks to create or join a room, and gets
//! back an opaque token. From then on it talks to the relay over UDP, quoting
//! the token in every datagram; the relay checks membership and forwards each
//! message to every member of the room.
//!
//! - [`registry`] owns the room and session tables behind one async mutex.
//! - [`handshake`] serves a single create/join request on one connection.
//! - [`acceptor`] accepts TCP connections and runs a bounded number of
//!   handshakes concurrently.
//! - [`relay`] is the single UDP consumer: authorization, fan-out, and the
//!   idle-member sweep.
//! - [`server`] binds both endpoints and drives the acceptor and relay under a
//!   shared cancellation token.
//! - [`protocol`] holds the JSON wire types and bounded read/write helpers.
//! - [`client`] is a terminal client for manual testing.
//! - [`cli`] and [`config`] turn command-line flags into a [`config::ServerConfig`].

pub mod acceptor;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
