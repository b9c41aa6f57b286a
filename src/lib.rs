//! # Custos (trust and access control plane)
//!
//! `custos` issues and verifies identities for a fleet of nodes and the users
//! operating them, and exposes a role-scoped remote API over a single
//! multiplexed tunnel.
//!
//! ## Identities
//!
//! Two certificate authorities exist, one for hosts and one for users. Each
//! holds an Ed25519 signing key; resetting a CA discards the key and with it
//! every certificate it signed.
//!
//! ## Authentication
//!
//! A tunnel connection is authenticated exactly once, at connect time, with
//! one of four credentials:
//!
//! - **Password** + HOTP code. The code is consumed (counter advances) and a
//!   web session is created for the connection.
//! - **Web session** id, resuming a previous password login with a reduced
//!   capability set.
//! - **Signup token**, a single-use, time-limited token that lets a new user
//!   pick a password and enroll their HOTP secret.
//! - **Host certificate** plus a proof of possession of its private key.
//!
//! Every failure is reported as `AuthenticationFailed`; the reason is only
//! logged.
//!
//! ## Authorization
//!
//! Each call is checked against a permission table keyed by role *and* the
//! method that authenticated the caller, before any side effect happens.

pub mod api;
pub mod auth;
pub mod backend;
pub mod ca;
pub mod cli;
pub mod error;
pub mod health;
pub mod otp;
mod secret;
pub mod tun;

pub use error::{Error, Result};

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
