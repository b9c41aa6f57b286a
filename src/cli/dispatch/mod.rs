//! Map validated CLI arguments to the action to run.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{self, auth};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::net::SocketAddr;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let listen = matches
        .get_one::<SocketAddr>(commands::ARG_LISTEN)
        .copied()
        .context("missing required argument: --listen")?;
    let hostname = matches
        .get_one::<String>(commands::ARG_HOSTNAME)
        .cloned()
        .context("missing required argument: --hostname")?;
    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        listen,
        health_listen: matches
            .get_one::<SocketAddr>(commands::ARG_HEALTH_LISTEN)
            .copied(),
        dsn: matches
            .get_one::<String>(commands::ARG_DSN)
            .map(|dsn| SecretString::from(dsn.clone())),
        hostname,
        otp_issuer: auth_opts.otp_issuer,
        signup_token_ttl: auth_opts.signup_token_ttl,
        signup_user_actions_ttl: auth_opts.signup_user_actions_ttl,
        session_ttl: auth_opts.session_ttl,
        permissions: auth_opts.permissions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::time::Duration;

    fn clean_env<F: FnOnce()>(f: F) {
        temp_env::with_vars(
            [
                ("CUSTOS_DSN", None::<&str>),
                ("CUSTOS_HEALTH_LISTEN", None),
                ("CUSTOS_SESSION_TTL", None),
                ("CUSTOS_PERMISSIONS", None),
                ("CUSTOS_SIGNUP_TOKEN_TTL", None),
                ("CUSTOS_SIGNUP_USER_ACTIONS_TTL", None),
            ],
            f,
        );
    }

    #[test]
    fn defaults_to_memory_and_standard_permissions() {
        clean_env(|| {
            let matches = commands::new().get_matches_from(vec!["custos"]);
            let Ok(Action::Server(args)) = handler(&matches) else {
                panic!("expected a server action");
            };
            assert!(args.dsn.is_none());
            assert_eq!(args.permissions, auth::Permissions::Standard);
            assert_eq!(args.session_ttl, None);
            assert_eq!(args.signup_token_ttl, Duration::from_secs(86_400));
            assert_eq!(args.hostname, "localhost");
        });
    }

    #[test]
    fn zero_session_ttl_means_no_expiry() {
        clean_env(|| {
            let matches = commands::new().get_matches_from(vec![
                "custos",
                "--session-ttl",
                "0",
                "--dsn",
                "postgres://localhost/custos",
                "--permissions",
                "allow-all",
            ]);
            let Ok(Action::Server(args)) = handler(&matches) else {
                panic!("expected a server action");
            };
            assert_eq!(args.session_ttl, None);
            assert_eq!(args.permissions, auth::Permissions::AllowAll);
            assert_eq!(
                args.dsn.as_ref().map(|dsn| dsn.expose_secret().to_string()),
                Some("postgres://localhost/custos".to_string())
            );
        });
    }

    #[test]
    fn user_actions_ttl_cannot_exceed_token_ttl() {
        clean_env(|| {
            let matches = commands::new().get_matches_from(vec![
                "custos",
                "--signup-token-ttl",
                "60",
                "--signup-user-actions-ttl",
                "120",
            ]);
            assert!(handler(&matches).is_err());
        });
    }
}
