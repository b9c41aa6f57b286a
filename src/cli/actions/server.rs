use crate::{
    api::{AllowAllPermissions, PermissionChecker, RoleGatedApi, StandardPermissions},
    auth::{AuthConfig, AuthServer, Role},
    backend::{Backend, MemoryBackend, PgBackend},
    ca::{CaDomain, HostSigner},
    cli::commands::auth::Permissions,
    health,
    tun::TunServer,
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const REAPER_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Args {
    pub listen: SocketAddr,
    pub health_listen: Option<SocketAddr>,
    pub dsn: Option<SecretString>,
    pub hostname: String,
    pub otp_issuer: String,
    pub signup_token_ttl: Duration,
    pub signup_user_actions_ttl: Duration,
    pub session_ttl: Option<Duration>,
    pub permissions: Permissions,
}

async fn backend(
    dsn: Option<&SecretString>,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn Backend>> {
    if let Some(dsn) = dsn {
        let backend = PgBackend::connect(dsn.expose_secret())
            .await
            .context("Failed to connect to database")?;
        backend.spawn_reaper(REAPER_PERIOD, shutdown.child_token());
        info!("using postgres backend");
        Ok(Arc::new(backend))
    } else {
        let backend = MemoryBackend::new();
        backend.spawn_reaper(REAPER_PERIOD, shutdown.child_token());
        warn!("no --dsn given, state is kept in memory only");
        Ok(Arc::new(backend))
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if storage is unreachable, the CAs cannot be created, or a listener fails to bind.
pub async fn execute(args: Args) -> Result<()> {
    let shutdown = CancellationToken::new();
    let backend = backend(args.dsn.as_ref(), &shutdown).await?;

    let config = AuthConfig::new()
        .with_otp_issuer(args.otp_issuer)
        .with_signup_token_ttl(args.signup_token_ttl)
        .with_signup_user_actions_ttl(args.signup_user_actions_ttl)
        .with_session_ttl(args.session_ttl);
    let auth = AuthServer::new(backend, config);
    auth.ensure_authorities()
        .await
        .context("Failed to initialize certificate authorities")?;

    // Clients pin this key to recognize the server.
    let host_ca = auth.ca().public_key(CaDomain::Host).await?;
    info!("host CA public key: {host_ca}");

    let pair = auth.ca().generate_key_pair();
    let certificate = auth
        .ca()
        .issue_host_certificate(
            &pair.public_key,
            &args.hostname,
            &args.hostname,
            Role::Node,
            Duration::ZERO,
        )
        .await
        .context("Failed to issue the server's host certificate")?;
    let signer = HostSigner::new(&pair, &certificate)?;

    let permissions: Arc<dyn PermissionChecker> = match args.permissions {
        Permissions::Standard => Arc::new(StandardPermissions::new()),
        Permissions::AllowAll => {
            warn!("permission checks are disabled");
            Arc::new(AllowAllPermissions)
        }
    };
    let api = RoleGatedApi::new(auth.clone(), permissions);
    let tunnel = TunServer::start(args.listen, api, Some(signer))
        .await
        .with_context(|| format!("Failed to bind tunnel on {}", args.listen))?;

    let health_task = match args.health_listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind health endpoint on {addr}"))?;
            Some(tokio::spawn(health::serve(
                listener,
                auth.clone(),
                shutdown.child_token(),
            )))
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");

    shutdown.cancel();
    tunnel.close().await;
    if let Some(task) = health_task {
        task.await.context("health endpoint panicked")??;
    }

    Ok(())
}
