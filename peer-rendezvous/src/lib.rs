//! Rendezvous broker for direct peer-to-peer chat sessions.
//!
//! Clients register with the broker, discover each other through a shared
//! registry, and negotiate a direct session through the broker before
//! talking to each other over UDP without it.
//!
//! - [`frame`] implements the length-prefixed wire protocol and its stream codec.
//! - [`command`] parses the command vocabulary and visibility values.
//! - [`registry`] is the lock-protected directory of connected clients.
//! - [`dispatcher`] serves one connection: registration, commands, cleanup.
//! - [`rendezvous`] negotiates a session between two dispatchers and
//!   exchanges addresses on acceptance.
//! - [`session`] runs the direct peer session after the handoff.
//! - [`broker`] accepts TCP connections and owns the registry.
//! - [`cli`] and [`client`] provide the command-line front end.
//!
//! Integration tests drive a real broker over TCP through this crate's codec.

pub mod broker;
pub mod cli;
pub mod client;
pub mod command;
pub mod dispatcher;
pub mod frame;
pub mod registry;
pub mod rendezvous;
pub mod session;
