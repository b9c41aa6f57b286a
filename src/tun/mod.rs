//! Multiplexed, authenticated request/response transport over TCP.
//!
//! A connection is authenticated once during the handshake and keeps that
//! identity until it closes. Calls on one connection may be pipelined;
//! responses are matched to requests by id.

mod client;
mod frame;
mod server;
pub mod wire;

pub use client::{ClientOptions, Login, TunClient};
pub use server::TunServer;
