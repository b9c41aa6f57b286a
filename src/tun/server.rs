//! Tunnel server: authenticates each connection once, then serves calls
//! through the role-gated API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::frame::{expect_message, read_message, write_message};
use super::wire::{
    self, AuthResult, Authenticate, Greeting, PROTOCOL_VERSION, Request, Response, ServerHello,
};
use crate::api::RoleGatedApi;
use crate::auth::Identity;
use crate::ca::HostSigner;
use crate::{Error, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_QUEUE: usize = 64;

pub struct TunServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    api: RoleGatedApi,
    signer: Option<HostSigner>,
}

impl TunServer {
    /// Bind `addr` and start accepting connections. Port 0 picks a free port.
    ///
    /// `signer` lets clients verify they reached the real auth server.
    ///
    /// # Errors
    /// Returns `Connection` if the address cannot be bound.
    pub async fn start(
        addr: impl ToSocketAddrs,
        api: RoleGatedApi,
        signer: Option<HostSigner>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared { api, signer });
        let task = tokio::spawn(accept_loop(listener, shared, shutdown.clone()));
        info!("tunnel listening on {addr}");
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and drop every open connection. Calls already running
    /// still complete.
    pub async fn close(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            warn!("tunnel accept loop ended abnormally: {err}");
        }
        info!("tunnel on {} closed", self.addr);
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let span = info_span!("tun.connection", %peer);
                    connections.spawn(
                        serve_connection(stream, shared.clone(), shutdown.child_token())
                            .instrument(span),
                    );
                }
                Err(err) => warn!("failed to accept connection: {err}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn serve_connection(mut stream: TcpStream, shared: Arc<Shared>, shutdown: CancellationToken) {
    let identity = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream, &shared))
        .await
    {
        Ok(Ok(identity)) => identity,
        Ok(Err(err)) => {
            debug!("handshake failed: {err}");
            let _ = stream.shutdown().await;
            return;
        }
        Err(_) => {
            debug!("handshake timed out");
            return;
        }
    };
    info!(principal = %identity.principal, role = %identity.role, method = %identity.method, "connection authenticated");

    let (mut reader, mut writer) = stream.into_split();
    let (responses, mut outgoing) = mpsc::channel::<Response>(RESPONSE_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(response) = outgoing.recv().await {
            if let Err(err) = write_message(&mut writer, &response).await {
                debug!("failed to write response: {err}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let identity = Arc::new(identity);
    loop {
        // Only cancellation may interrupt a read; a half-read frame is lost.
        let request = tokio::select! {
            () = shutdown.cancelled() => break,
            request = read_message::<Request, _>(&mut reader) => request,
        };
        match request {
            Ok(Some(Request { id, call })) => {
                let api = shared.api.clone();
                let identity = identity.clone();
                let responses = responses.clone();
                // Detached, so losing the connection discards the answer but
                // never interrupts a call halfway through its writes.
                tokio::spawn(
                    async move {
                        let result = api.call(&identity, call).await;
                        let _ = responses.send(Response { id, result }).await;
                    }
                    .in_current_span(),
                );
            }
            Ok(None) => break,
            Err(err) => {
                debug!("dropping connection: {err}");
                break;
            }
        }
    }

    // The writer drains until the last running call has answered.
    drop(responses);
    let _ = writer_task.await;
    debug!(principal = %identity.principal, "connection closed");
}

async fn handshake(stream: &mut TcpStream, shared: &Shared) -> Result<Identity> {
    let greeting: Greeting = expect_message(&mut *stream).await?;
    debug!(client = %greeting.client, "greeting");
    if greeting.version != PROTOCOL_VERSION {
        return Err(Error::Connection(format!(
            "unsupported protocol version {}",
            greeting.version
        )));
    }

    let nonce = wire::new_nonce()?;
    let hello = ServerHello {
        version: PROTOCOL_VERSION,
        nonce: nonce.clone(),
        certificate: shared
            .signer
            .as_ref()
            .map(|signer| signer.certificate().to_string()),
        proof: shared
            .signer
            .as_ref()
            .map(|signer| signer.sign(&wire::server_proof_message(&greeting.nonce))),
    };
    write_message(&mut *stream, &hello).await?;

    let Authenticate { credential } = expect_message(&mut *stream).await?;
    let authenticator = shared.api.auth().authenticator();
    match authenticator
        .authenticate(&credential, &wire::client_proof_message(&nonce))
        .await
    {
        Ok(authenticated) => {
            write_message(
                &mut *stream,
                &AuthResult::Accepted {
                    identity: authenticated.identity.clone(),
                    session_id: authenticated.session_id,
                },
            )
            .await?;
            Ok(authenticated.identity)
        }
        Err(err) => {
            write_message(&mut *stream, &AuthResult::Rejected { error: err.clone() }).await?;
            Err(err)
        }
    }
}
