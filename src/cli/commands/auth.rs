use anyhow::{Result, anyhow};
use clap::{Arg, Command};
use std::time::Duration;

pub const ARG_SIGNUP_TOKEN_TTL: &str = "signup-token-ttl";
pub const ARG_SIGNUP_USER_ACTIONS_TTL: &str = "signup-user-actions-ttl";
pub const ARG_SESSION_TTL: &str = "session-ttl";
pub const ARG_OTP_ISSUER: &str = "otp-issuer";
pub const ARG_PERMISSIONS: &str = "permissions";

/// Which permission table the API enforces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permissions {
    Standard,
    AllowAll,
}

#[derive(Debug)]
pub struct Options {
    pub signup_token_ttl: Duration,
    pub signup_user_actions_ttl: Duration,
    pub session_ttl: Option<Duration>,
    pub otp_issuer: String,
    pub permissions: Permissions,
}

impl Options {
    /// # Errors
    /// Returns an error if a value is missing or inconsistent.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let seconds = |name: &str| {
            matches
                .get_one::<u64>(name)
                .copied()
                .ok_or_else(|| anyhow!("missing required argument: --{name}"))
        };
        let signup_token_ttl = Duration::from_secs(seconds(ARG_SIGNUP_TOKEN_TTL)?);
        let signup_user_actions_ttl = Duration::from_secs(seconds(ARG_SIGNUP_USER_ACTIONS_TTL)?);
        if signup_user_actions_ttl > signup_token_ttl {
            return Err(anyhow!(
                "--{ARG_SIGNUP_USER_ACTIONS_TTL} must not exceed --{ARG_SIGNUP_TOKEN_TTL}"
            ));
        }
        let session_ttl = match seconds(ARG_SESSION_TTL)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let permissions = match matches.get_one::<String>(ARG_PERMISSIONS).map(String::as_str) {
            Some("allow-all") => Permissions::AllowAll,
            _ => Permissions::Standard,
        };

        Ok(Self {
            signup_token_ttl,
            signup_user_actions_ttl,
            session_ttl,
            otp_issuer: matches
                .get_one::<String>(ARG_OTP_ISSUER)
                .cloned()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            permissions,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SIGNUP_TOKEN_TTL)
                .long(ARG_SIGNUP_TOKEN_TTL)
                .help("Signup token lifetime in seconds")
                .env("CUSTOS_SIGNUP_TOKEN_TTL")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SIGNUP_USER_ACTIONS_TTL)
                .long(ARG_SIGNUP_USER_ACTIONS_TTL)
                .help("Time advertised to signup clients for finishing enrollment, in seconds")
                .env("CUSTOS_SIGNUP_USER_ACTIONS_TTL")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Web session lifetime in seconds, 0 keeps sessions until deleted")
                .env("CUSTOS_SESSION_TTL")
                .default_value("0")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_OTP_ISSUER)
                .long(ARG_OTP_ISSUER)
                .help("Issuer shown by authenticator apps")
                .env("CUSTOS_OTP_ISSUER")
                .default_value(env!("CARGO_PKG_NAME")),
        )
        .arg(
            Arg::new(ARG_PERMISSIONS)
                .long(ARG_PERMISSIONS)
                .help("Permission table enforced on remote calls")
                .env("CUSTOS_PERMISSIONS")
                .default_value("standard")
                .value_parser(["standard", "allow-all"]),
        )
}
