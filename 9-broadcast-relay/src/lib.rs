//! Broadcast chat relay over MessagePack frames.
//!
//! Clients connect over TCP and send `[nickname, text]` frames; the server
//! relays every frame to every other connected client. Each module focuses on
//! one responsibility:
//!
//! - [`codec`] encodes messages and incrementally decodes an arbitrarily
//!   chunked byte stream back into them.
//! - [`session`] wraps one connection: decode buffer, outbound queue,
//!   counters, and the task loop driving the socket.
//! - [`registry`] keeps the set of live sessions and performs the
//!   exclude-sender fan-out.
//! - [`server`] accepts connections and wires each session to the registry.
//! - [`client`] is the participant side: one session to the server, a display
//!   sink, stdin bridging, and a one-shot disconnect signal.
//! - [`hammer`] floods a server with concurrent clients for load testing.
//! - [`cli`] parses the command-line interface for the binary.

pub mod cli;
pub mod client;
pub mod codec;
pub mod hammer;
pub mod registry;
pub mod server;
pub mod session;
