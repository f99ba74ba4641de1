use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::util::http::{Client, NetworkError};
use crate::util::retry::with_backoff;

use super::exchange::{ExchangeError, TokenExchangeClient};
use super::store::{CredentialStore, Session, SessionState};
use super::token::{Credentials, Token, TokenKind, TokenSet};

/// Fallback validity for exchanged tokens whose JWT payload cannot be read.
const JWT_FALLBACK_TTL: Duration = Duration::from_secs(60 * 60);

/// Terminal authentication failures, tagged by the federation step that
/// produced them. Clonable so a joined refresh outcome can be handed to
/// every waiter.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The account service refused the email/password digest.
    #[error("account login rejected: {0}")]
    InvalidCredentials(String),

    /// The SSO→SaaS exchange failed.
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// The identity pool refused to issue temporary credentials.
    #[error("identity pool rejected the session: {0}")]
    IdentityPoolRejected(String),

    /// No unexpired SSO token and no retained password digest to rebuild
    /// the session from.
    #[error("re-authentication required")]
    ReauthenticationRequired,

    /// Transient failures that survived the retry budget.
    #[error(transparent)]
    Network(NetworkError),
}

/// Maps an exchange failure to the tag of the step it occurred in.
fn step_error(err: ExchangeError, step: TokenKind) -> AuthError {
    match (err, step) {
        (ExchangeError::Network(net), _) => AuthError::Network(net),
        (err, TokenKind::Sso) => AuthError::InvalidCredentials(err.to_string()),
        (err, TokenKind::Cognito | TokenKind::AccessKey) => {
            AuthError::IdentityPoolRejected(err.to_string())
        }
        (err, TokenKind::Saas) => AuthError::TokenExchangeFailed(err.to_string()),
    }
}

/// Orchestrates the ordered federation chain from account credentials to a
/// fully populated credential store. Owns the login and refresh state
/// machines; the individual calls live in [`TokenExchangeClient`].
pub struct AuthPipeline {
    exchange: TokenExchangeClient,
    store: Arc<CredentialStore>,
    config: Arc<Config>,
    credentials: Option<Credentials>,
}

impl AuthPipeline {
    pub fn new(
        config: Arc<Config>,
        store: Arc<CredentialStore>,
        credentials: Option<Credentials>,
    ) -> Self {
        let http = Client::new(config.request.timeout);
        Self {
            exchange: TokenExchangeClient::new(http, Arc::clone(&config)),
            store,
            config,
            credentials,
        }
    }

    /// Runs the full chain: account login → token exchange → identity-pool
    /// credentials. Publishes all tokens at once on success; on any failure
    /// the store holds nothing from this attempt.
    #[instrument(skip_all, err)]
    pub async fn login(&self) -> Result<Session, AuthError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(AuthError::ReauthenticationRequired)?;

        self.store.begin(SessionState::Authenticating);
        match self.run_login(creds).await {
            Ok(set) => {
                info!("session established");
                self.store.replace(set);
                Ok(self.store.session())
            }
            Err(err) => {
                self.store.login_failed();
                Err(err)
            }
        }
    }

    /// Re-runs the exchange steps off the held SSO token, falling back to a
    /// full login when that token is gone or expired. A failure leaves any
    /// still-valid tokens in place.
    #[instrument(skip_all, err)]
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        let held = self.store.snapshot().filter(|set| !set.sso.is_expired());

        let Some(current) = held else {
            if self.credentials.is_some() {
                info!("no usable sso token, falling back to full login");
                return self.login().await;
            }
            self.store.refresh_failed();
            return Err(AuthError::ReauthenticationRequired);
        };

        self.store.begin(SessionState::Refreshing);
        match self.run_exchange(&current.profile.user_id, current.sso.clone()).await {
            Ok(set) => {
                self.store.replace(TokenSet {
                    profile: current.profile.clone(),
                    ..set
                });
                Ok(self.store.session())
            }
            Err(err) => {
                warn!("refresh failed: {err}");
                self.store.refresh_failed();
                Err(err)
            }
        }
    }

    async fn run_login(&self, creds: &Credentials) -> Result<TokenSet, AuthError> {
        let retry = self.config.request.retry;
        let outcome = with_backoff(
            retry,
            || self.exchange.account_login(creds),
            ExchangeError::is_transient,
        )
        .await
        .map_err(|err| step_error(err, TokenKind::Sso))?;

        let sso = Token::with_ttl(
            TokenKind::Sso,
            outcome.sso_token,
            self.config.refresh.sso_ttl,
        );

        let mut set = self.run_exchange(&outcome.profile.user_id, sso).await?;
        set.profile = outcome.profile;
        Ok(set)
    }

    /// Steps 2 and 3 of the chain, shared by login and refresh. The profile
    /// on the returned set is a placeholder the caller overwrites.
    async fn run_exchange(&self, user_id: &str, sso: Token) -> Result<TokenSet, AuthError> {
        let retry = self.config.request.retry;

        let exchanged = with_backoff(
            retry,
            || self.exchange.exchange_tokens(user_id, sso.value()),
            ExchangeError::is_transient,
        )
        .await
        .map_err(|err| step_error(err, TokenKind::Saas))?;

        let keys = with_backoff(
            retry,
            || self.exchange.identity_credentials(&exchanged.cognito_token),
            ExchangeError::is_transient,
        )
        .await
        .map_err(|err| step_error(err, TokenKind::AccessKey))?;

        Ok(TokenSet {
            sso,
            saas: Token::from_jwt(TokenKind::Saas, exchanged.saas_token, JWT_FALLBACK_TTL),
            cognito: Token::from_jwt(TokenKind::Cognito, exchanged.cognito_token, JWT_FALLBACK_TTL),
            keys,
            profile: super::token::AccountProfile {
                user_id: user_id.to_string(),
                country: String::new(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::jwt_expiring_at;
    use crate::util::retry::RetryPolicy;
    use chrono::Utc;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    fn test_config(server: &Server) -> Arc<Config> {
        Arc::new(Config {
            account_endpoint: server.url(),
            saas_endpoint: server.url(),
            identity_endpoint: server.url(),
            request: crate::config::RequestConfig {
                timeout: Duration::from_secs(5),
                retry: RetryPolicy {
                    attempts: 3,
                    initial_backoff: Duration::from_millis(10),
                },
            },
            ..Config::default()
        })
    }

    fn pipeline(server: &Server, store: Arc<CredentialStore>) -> AuthPipeline {
        AuthPipeline::new(
            test_config(server),
            store,
            Some(Credentials::new("user@example.com", "secret")),
        )
    }

    async fn mock_login_ok(server: &mut ServerGuard) -> mockito::Mock {
        server
            .mock("POST", Matcher::Regex("/account/login.*".into()))
            .with_status(200)
            .with_body(
                json!({
                    "errorcode": "0",
                    "token": "sso-token",
                    "user": {"countryAbbr": "RO", "username": "user@example.com"}
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    async fn mock_exchange_ok(server: &mut ServerGuard) -> mockito::Mock {
        let exp = Utc::now().timestamp() + 3600;
        server
            .mock("POST", "/v3/auth/refresh_tokens")
            .with_status(200)
            .with_body(
                json!({
                    "errorcode": "0",
                    "data": {
                        "saasToken": jwt_expiring_at(exp),
                        "cognitoToken": jwt_expiring_at(exp)
                    }
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    async fn mock_identity_ok(server: &mut ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(
                json!({
                    "Credentials": {
                        "AccessKeyId": "ASIAEXAMPLE",
                        "SecretKey": "secret",
                        "SessionToken": "session",
                        "Expiration": Utc::now().timestamp() + 3600
                    }
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_login_populates_session() {
        let mut server = Server::new_async().await;
        let login = mock_login_ok(&mut server).await;
        let exchange = mock_exchange_ok(&mut server).await;
        let identity = mock_identity_ok(&mut server).await;

        let store = Arc::new(CredentialStore::new());
        let session = pipeline(&server, Arc::clone(&store)).login().await.unwrap();

        assert_eq!(session.state, SessionState::Authenticated);
        for kind in [
            TokenKind::Sso,
            TokenKind::Saas,
            TokenKind::Cognito,
            TokenKind::AccessKey,
        ] {
            let token = session.token(kind).unwrap();
            assert!(token.expires_at > Utc::now(), "{kind} must be unexpired");
        }

        login.assert_async().await;
        exchange.assert_async().await;
        identity.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_failure_leaves_no_partial_session() {
        let mut server = Server::new_async().await;
        let _login = mock_login_ok(&mut server).await;
        let _exchange = server
            .mock("POST", "/v3/auth/refresh_tokens")
            .with_status(200)
            .with_body(json!({"errorcode": "9001", "msg": "exchange down"}).to_string())
            .create_async()
            .await;

        let store = Arc::new(CredentialStore::new());
        let err = pipeline(&server, Arc::clone(&store))
            .login()
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::TokenExchangeFailed(_)));
        assert_eq!(store.state(), SessionState::Failed);
        assert!(store.get(TokenKind::Sso).is_none());
    }

    #[tokio::test]
    async fn test_login_rejection_is_tagged_invalid_credentials() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", Matcher::Regex("/account/login.*".into()))
            .with_status(200)
            .with_body(json!({"errorcode": "1200", "msg": "wrong password"}).to_string())
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(CredentialStore::new());
        let err = pipeline(&server, store).login().await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials(_)));
        // rejections never retry
        login.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_login_failures_are_retried() {
        let mut server = Server::new_async().await;
        let flaky = server
            .mock("POST", Matcher::Regex("/account/login.*".into()))
            .with_status(502)
            .expect(2)
            .create_async()
            .await;
        let login = mock_login_ok(&mut server).await;
        let _exchange = mock_exchange_ok(&mut server).await;
        let _identity = mock_identity_ok(&mut server).await;

        let store = Arc::new(CredentialStore::new());
        let session = pipeline(&server, store).login().await.unwrap();

        assert_eq!(session.state, SessionState::Authenticated);
        flaky.assert_async().await;
        login.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_reuses_valid_sso_token() {
        let mut server = Server::new_async().await;
        let login = mock_login_ok(&mut server).await;
        let _exchange = mock_exchange_ok(&mut server).await;
        let _identity = mock_identity_ok(&mut server).await;

        let store = Arc::new(CredentialStore::new());
        let pipeline = pipeline(&server, Arc::clone(&store));
        pipeline.login().await.unwrap();

        // only the first login may hit the account service
        let session = pipeline.refresh().await.unwrap();

        assert_eq!(session.state, SessionState::Authenticated);
        login.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_without_sso_falls_back_to_login() {
        let mut server = Server::new_async().await;
        let login = mock_login_ok(&mut server).await;
        let _exchange = mock_exchange_ok(&mut server).await;
        let _identity = mock_identity_ok(&mut server).await;

        let store = Arc::new(CredentialStore::new());
        let session = pipeline(&server, store).refresh().await.unwrap();

        assert_eq!(session.state, SessionState::Authenticated);
        login.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_without_credentials_requires_reauthentication() {
        let server = Server::new_async().await;
        let store = Arc::new(CredentialStore::new());
        let pipeline = AuthPipeline::new(test_config(&server), Arc::clone(&store), None);

        let err = pipeline.refresh().await.unwrap_err();

        assert!(matches!(err, AuthError::ReauthenticationRequired));
        assert_eq!(store.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_valid_session() {
        let mut server = Server::new_async().await;
        let _login = mock_login_ok(&mut server).await;
        let exchange = mock_exchange_ok(&mut server).await;
        let _identity = mock_identity_ok(&mut server).await;

        let store = Arc::new(CredentialStore::new());
        let pipeline = pipeline(&server, Arc::clone(&store));
        pipeline.login().await.unwrap();

        // subsequent exchanges fail permanently
        exchange.remove_async().await;
        let _down = server
            .mock("POST", "/v3/auth/refresh_tokens")
            .with_status(200)
            .with_body(json!({"errorcode": "9001", "msg": "maintenance"}).to_string())
            .create_async()
            .await;

        let err = pipeline.refresh().await.unwrap_err();

        assert!(matches!(err, AuthError::TokenExchangeFailed(_)));
        // held tokens are still valid, so the session stays usable
        assert_eq!(store.state(), SessionState::Authenticated);
        assert!(store.get(TokenKind::AccessKey).is_some());
    }
}
