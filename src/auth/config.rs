use std::time::Duration;

const DEFAULT_OTP_ISSUER: &str = "custos";
const DEFAULT_SIGNUP_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_SIGNUP_USER_ACTIONS_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
pub struct AuthConfig {
    otp_issuer: String,
    signup_token_ttl: Duration,
    signup_user_actions_ttl: Duration,
    session_ttl: Option<Duration>,
    server_ttl: Option<Duration>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            otp_issuer: DEFAULT_OTP_ISSUER.to_string(),
            signup_token_ttl: DEFAULT_SIGNUP_TOKEN_TTL,
            signup_user_actions_ttl: DEFAULT_SIGNUP_USER_ACTIONS_TTL,
            session_ttl: None,
            server_ttl: None,
        }
    }

    #[must_use]
    pub fn with_otp_issuer(mut self, issuer: String) -> Self {
        self.otp_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_signup_token_ttl(mut self, ttl: Duration) -> Self {
        self.signup_token_ttl = ttl;
        self
    }

    /// Advertised to signup clients as the time they have to finish; the
    /// server does not enforce it separately from the token TTL.
    #[must_use]
    pub fn with_signup_user_actions_ttl(mut self, ttl: Duration) -> Self {
        self.signup_user_actions_ttl = ttl;
        self
    }

    /// `None` keeps web sessions until they are deleted.
    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// `None` keeps server announcements until overwritten.
    #[must_use]
    pub fn with_server_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.server_ttl = ttl;
        self
    }

    #[must_use]
    pub fn otp_issuer(&self) -> &str {
        &self.otp_issuer
    }

    #[must_use]
    pub fn signup_token_ttl(&self) -> Duration {
        self.signup_token_ttl
    }

    #[must_use]
    pub fn signup_user_actions_ttl(&self) -> Duration {
        self.signup_user_actions_ttl
    }

    #[must_use]
    pub fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl
    }

    #[must_use]
    pub fn server_ttl(&self) -> Option<Duration> {
        self.server_ttl
    }
}
