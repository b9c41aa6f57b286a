//! Messages exchanged over a tunnel connection.
//!
//! Handshake, in order: [`Greeting`] from the client, [`ServerHello`] from
//! the server, [`Authenticate`] from the client, [`AuthResult`] from the
//! server. After an accepted handshake the client sends [`Request`]s and the
//! server answers each with a [`Response`] carrying the same id, in any
//! order.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};

use crate::api::{Call, Reply};
use crate::auth::{Credential, Identity};
use crate::{Error, Result};

pub const PROTOCOL_VERSION: u16 = 1;

const NONCE_LEN: usize = 32;
const SERVER_PROOF_CONTEXT: &[u8] = b"custos-tun-server-v1:";
const CLIENT_PROOF_CONTEXT: &[u8] = b"custos-tun-client-v1:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    pub version: u16,
    pub nonce: String,
    /// Client software, for logs.
    #[serde(default)]
    pub client: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    pub version: u16,
    pub nonce: String,
    /// Host certificate of the server, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// Signature over the client nonce made with the certified key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authenticate {
    pub credential: Credential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthResult {
    Accepted {
        identity: Identity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Rejected {
        error: Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: std::result::Result<Reply, Error>,
}

/// Fresh random challenge, encoded for the wire.
pub(crate) fn new_nonce() -> Result<String> {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| Error::Connection(format!("failed to generate nonce: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

fn context(prefix: &[u8], nonce: &str) -> Vec<u8> {
    [prefix, nonce.as_bytes()].concat()
}

/// What the server signs to prove it holds its host key.
pub(crate) fn server_proof_message(client_nonce: &str) -> Vec<u8> {
    context(SERVER_PROOF_CONTEXT, client_nonce)
}

/// What a host-certificate client signs to prove it holds its key.
#[must_use]
pub fn client_proof_message(server_nonce: &str) -> Vec<u8> {
    context(CLIENT_PROOF_CONTEXT, server_nonce)
}
