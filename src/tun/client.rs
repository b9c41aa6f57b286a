//! Tunnel client: one authenticated connection, many concurrent calls.

use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::frame::{expect_message, read_message, write_message};
use super::wire::{
    self, AuthResult, Authenticate, Greeting, PROTOCOL_VERSION, Request, Response, ServerHello,
};
use crate::api::{Call, Reply};
use crate::auth::{Credential, Identity, OtpEnrollment, Role, Server, SignupTokenInfo, User};
use crate::ca::{self, CaDomain, HostSigner, KeyPair};
use crate::{APP_USER_AGENT, Error, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_QUEUE: usize = 64;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply>>>>>;

/// How the client authenticates.
#[derive(Debug)]
pub enum Login {
    Credential(Credential),
    /// Prove possession of a host key; the proof is made during the handshake.
    Host(HostSigner),
}

impl From<Credential> for Login {
    fn from(credential: Credential) -> Self {
        Self::Credential(credential)
    }
}

impl From<HostSigner> for Login {
    fn from(signer: HostSigner) -> Self {
        Self::Host(signer)
    }
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    host_authority: Option<String>,
    connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host_authority: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ClientOptions {
    /// Only talk to servers holding a host certificate from this authority.
    #[must_use]
    pub fn with_host_authority(mut self, public_key: String) -> Self {
        self.host_authority = Some(public_key);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

pub struct TunClient {
    identity: Identity,
    session_id: Option<String>,
    requests: mpsc::Sender<Request>,
    pending: Pending,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn closed() -> Error {
    Error::Connection("connection closed".to_string())
}

fn unexpected(reply: &Reply) -> Error {
    Error::Connection(format!("unexpected reply {reply:?}"))
}

macro_rules! expect_reply {
    ($reply:expr, $variant:ident) => {
        match $reply {
            Reply::$variant(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    };
}

impl TunClient {
    /// Connect and authenticate with default options.
    ///
    /// # Errors
    /// Returns `AuthenticationFailed` if the server rejects the credential
    /// and `Connection` for transport failures.
    pub async fn connect(addr: impl ToSocketAddrs, login: impl Into<Login>) -> Result<Self> {
        Self::connect_with(addr, login, ClientOptions::default()).await
    }

    /// # Errors
    /// See [`TunClient::connect`]. Also returns `Connection` when a pinned
    /// host authority does not vouch for the server.
    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        login: impl Into<Login>,
        options: ClientOptions,
    ) -> Result<Self> {
        let login = login.into();
        let (stream, identity, session_id) =
            tokio::time::timeout(options.connect_timeout, async {
                let mut stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let (identity, session_id) = handshake(&mut stream, login, &options).await?;
                Ok::<_, Error>((stream, identity, session_id))
            })
            .await
            .map_err(|_| Error::Connection("connect timed out".to_string()))??;

        let (mut reader, mut writer) = stream.into_split();
        let shutdown = CancellationToken::new();
        let pending: Pending = Arc::default();
        let (requests, mut outgoing) = mpsc::channel::<Request>(REQUEST_QUEUE);

        let writer_shutdown = shutdown.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    () = writer_shutdown.cancelled() => break,
                    request = outgoing.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                if let Err(err) = write_message(&mut writer, &request).await {
                    debug!("failed to send request: {err}");
                    break;
                }
            }
            writer_shutdown.cancel();
            let _ = writer.shutdown().await;
        });

        let reader_shutdown = shutdown.clone();
        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let response = tokio::select! {
                    () = reader_shutdown.cancelled() => break,
                    response = read_message::<Response, _>(&mut reader) => response,
                };
                match response {
                    Ok(Some(Response { id, result })) => {
                        if let Some(waiter) = reader_pending.lock().await.remove(&id) {
                            let _ = waiter.send(result);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!("connection lost: {err}");
                        break;
                    }
                }
            }
            // Cancel before draining so late callers see the closed state.
            reader_shutdown.cancel();
            for (_, waiter) in reader_pending.lock().await.drain() {
                let _ = waiter.send(Err(closed()));
            }
        });

        Ok(Self {
            identity,
            session_id,
            requests,
            pending,
            next_id: AtomicU64::new(1),
            shutdown,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        })
    }

    /// Identity the server bound to this connection.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Web session opened by a password login.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Send one call and wait for its reply.
    ///
    /// # Errors
    /// Returns the server's error for the call, or `Connection` if the
    /// connection is gone.
    pub async fn call(&self, call: Call) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, reply) = oneshot::channel();
        self.pending.lock().await.insert(id, waiter);
        if self.shutdown.is_cancelled() {
            self.pending.lock().await.remove(&id);
            return Err(closed());
        }
        if self.requests.send(Request { id, call }).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(closed());
        }
        reply.await.map_err(|_| closed())?
    }

    /// Close the connection. Calls still waiting fail with `Connection`.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn generate_key_pair(&self) -> Result<KeyPair> {
        expect_reply!(self.call(Call::GenerateKeyPair).await?, KeyPair)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn generate_host_cert(
        &self,
        public_key: &str,
        node_name: &str,
        hostname: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<String> {
        let call = Call::GenerateHostCert {
            public_key: public_key.to_string(),
            node_name: node_name.to_string(),
            hostname: hostname.to_string(),
            role,
            ttl,
        };
        expect_reply!(self.call(call).await?, Certificate)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn generate_user_cert(
        &self,
        public_key: &str,
        username: &str,
        ttl: Duration,
    ) -> Result<String> {
        let call = Call::GenerateUserCert {
            public_key: public_key.to_string(),
            username: username.to_string(),
            ttl,
        };
        expect_reply!(self.call(call).await?, Certificate)
    }

    /// Returns the new host CA public key.
    ///
    /// # Errors
    /// See [`TunClient::call`].
    pub async fn reset_host_ca(&self) -> Result<String> {
        expect_reply!(self.call(Call::ResetHostCa).await?, PublicKey)
    }

    /// Returns the new user CA public key.
    ///
    /// # Errors
    /// See [`TunClient::call`].
    pub async fn reset_user_ca(&self) -> Result<String> {
        expect_reply!(self.call(Call::ResetUserCa).await?, PublicKey)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn get_cert_authority(&self, domain: CaDomain) -> Result<String> {
        expect_reply!(
            self.call(Call::GetCertAuthority { domain }).await?,
            PublicKey
        )
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn upsert_password(&self, username: &str, password: &str) -> Result<OtpEnrollment> {
        let call = Call::UpsertPassword {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        };
        expect_reply!(self.call(call).await?, OtpEnrollment)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn create_signup_token(&self, username: &str) -> Result<String> {
        let call = Call::CreateSignupToken {
            username: username.to_string(),
        };
        expect_reply!(self.call(call).await?, SignupToken)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn get_signup_token_data(&self, token: &str) -> Result<SignupTokenInfo> {
        let call = Call::GetSignupTokenData {
            token: SecretString::from(token.to_string()),
        };
        expect_reply!(self.call(call).await?, SignupTokenData)
    }

    /// Returns the created username.
    ///
    /// # Errors
    /// See [`TunClient::call`].
    pub async fn create_user_with_token(
        &self,
        token: &str,
        password: &str,
        code: &str,
    ) -> Result<String> {
        let call = Call::CreateUserWithToken {
            token: SecretString::from(token.to_string()),
            password: SecretString::from(password.to_string()),
            code: code.to_string(),
        };
        expect_reply!(self.call(call).await?, Username)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn get_users(&self) -> Result<Vec<User>> {
        expect_reply!(self.call(Call::GetUsers).await?, Users)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        let call = Call::DeleteUser {
            username: username.to_string(),
        };
        done(self.call(call).await?)
    }

    /// Re-check the password and open a new web session.
    ///
    /// # Errors
    /// See [`TunClient::call`].
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<String> {
        let call = Call::SignIn {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        };
        expect_reply!(self.call(call).await?, SessionId)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn get_web_session(&self, username: &str, session_id: &str) -> Result<String> {
        let call = Call::GetWebSession {
            username: username.to_string(),
            session_id: SecretString::from(session_id.to_string()),
        };
        expect_reply!(self.call(call).await?, SessionId)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn delete_web_session(&self, username: &str, session_id: &str) -> Result<()> {
        let call = Call::DeleteWebSession {
            username: username.to_string(),
            session_id: SecretString::from(session_id.to_string()),
        };
        done(self.call(call).await?)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn get_servers(&self) -> Result<Vec<Server>> {
        expect_reply!(self.call(Call::GetServers).await?, Servers)
    }

    /// # Errors
    /// See [`TunClient::call`].
    pub async fn upsert_server(&self, server: Server, ttl: Option<Duration>) -> Result<()> {
        done(self.call(Call::UpsertServer { server, ttl }).await?)
    }
}

impl Drop for TunClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn done(reply: Reply) -> Result<()> {
    match reply {
        Reply::Done => Ok(()),
        other => Err(unexpected(&other)),
    }
}

async fn handshake(
    stream: &mut TcpStream,
    login: Login,
    options: &ClientOptions,
) -> Result<(Identity, Option<String>)> {
    let nonce = wire::new_nonce()?;
    write_message(
        &mut *stream,
        &Greeting {
            version: PROTOCOL_VERSION,
            nonce: nonce.clone(),
            client: APP_USER_AGENT.to_string(),
        },
    )
    .await?;

    let hello: ServerHello = expect_message(&mut *stream).await?;
    if hello.version != PROTOCOL_VERSION {
        return Err(Error::Connection(format!(
            "server speaks protocol version {}",
            hello.version
        )));
    }
    if let Some(authority) = &options.host_authority {
        verify_server(&hello, &nonce, authority)?;
    }

    let credential = match login {
        Login::Credential(credential) => credential,
        Login::Host(signer) => Credential::HostCertificate {
            certificate: signer.certificate().to_string(),
            proof: signer.sign(&wire::client_proof_message(&hello.nonce)),
        },
    };
    write_message(&mut *stream, &Authenticate { credential }).await?;

    match expect_message(&mut *stream).await? {
        AuthResult::Accepted {
            identity,
            session_id,
        } => Ok((identity, session_id)),
        AuthResult::Rejected { error } => Err(error),
    }
}

fn verify_server(hello: &ServerHello, nonce: &str, authority: &str) -> Result<()> {
    let untrusted = |reason: String| Error::Connection(format!("untrusted server: {reason}"));
    let (Some(certificate), Some(proof)) = (&hello.certificate, &hello.proof) else {
        return Err(untrusted("no host certificate presented".to_string()));
    };
    let cert = ca::verify_with_authority(CaDomain::Host, certificate, authority)
        .map_err(|err| untrusted(err.to_string()))?;
    ca::verify_proof(&cert, &wire::server_proof_message(nonce), proof)
        .map_err(|err| untrusted(err.to_string()))
}
