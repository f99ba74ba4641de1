use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::util::http::{Client, Method, NetworkError, StatusCode};

use super::token::{AccessKeySet, AccountProfile, Credentials};

// App identity presented to the vendor services. The directory module
// reuses these; the services reject requests without them.
pub(crate) const PLATFORM: &str = "android";
pub(crate) const APP_VERSION: &str = "4.8.1";
pub(crate) const APP_BUILD: &str = "830";
pub(crate) const USER_AGENT: &str = "Android";
pub(crate) const CONTENT_TYPE: &str = "application/json; charset=UTF-8";

const IDENTITY_TARGET: &str = "AWSCognitoIdentityService.GetCredentialsForIdentity";
const IDENTITY_CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const IDENTITY_USER_AGENT: &str = "aws-sdk-iOS/2.26.2 iOS/18.4.1 en_RO";
const IDENTITY_LOGIN_PROVIDER: &str = "cognito-identity.amazonaws.com";

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The service understood the request and refused it; retrying cannot
    /// help.
    #[error("service rejected the request: ({code}) {message}")]
    Rejected { code: String, message: String },

    #[error("response missing required field: {0}")]
    Incomplete(&'static str),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl ExchangeError {
    fn rejected(code: impl Into<String>, message: Option<String>) -> Self {
        ExchangeError::Rejected {
            code: code.into(),
            message: message.unwrap_or_else(|| "no detail provided".to_string()),
        }
    }

    /// Only transport-level transience is retryable; rejections and
    /// incomplete payloads are final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(err) if err.is_transient())
    }
}

/// Result of a successful account login.
#[derive(Debug)]
pub struct LoginOutcome {
    pub sso_token: String,
    pub profile: AccountProfile,
}

/// Result of a successful SSO→SaaS exchange.
#[derive(Debug)]
pub struct ExchangedTokens {
    pub saas_token: String,
    pub cognito_token: String,
}

/// Stateless request/response wrapper for the individual federation calls.
/// Retry, caching and sequencing live in the pipeline, not here.
#[derive(Debug, Clone)]
pub struct TokenExchangeClient {
    http: Client,
    config: Arc<Config>,
}

impl TokenExchangeClient {
    pub fn new(http: Client, config: Arc<Config>) -> Self {
        Self { http, config }
    }

    /// Account login: email + password digest → SSO token and profile.
    #[instrument(skip_all, fields(email = creds.email()), err)]
    pub async fn account_login(&self, creds: &Credentials) -> Result<LoginOutcome, ExchangeError> {
        let url = format!(
            "{}/account/login?clientId={}",
            self.config.account_endpoint, self.config.client_id
        );
        let request = LoginRequest {
            equipment: 2,
            password: creds.password_digest(),
            os_type: 1,
            username: creds.email(),
            client_version: APP_VERSION,
            os_version: "6.0",
            device_model: "Android SDK built for x86",
            captcha_rule: 2,
            channel: "app",
        };

        debug!("calling account service");
        let response = self
            .http
            .request(Method::POST, &url, |req| {
                req.header("th_platform", PLATFORM)
                    .header("th_version", APP_VERSION)
                    // the misspelled header name is what the service expects
                    .header("th_appbulid", APP_BUILD)
                    .header("user-agent", USER_AGENT)
                    .header("content-type", CONTENT_TYPE)
                    .json(&request)
            })
            .await?;

        let response: LoginResponse = decode_vendor(response).await?;
        if response.errorcode != "0" {
            return Err(ExchangeError::rejected(response.errorcode, response.msg));
        }

        let sso_token = response.token.ok_or(ExchangeError::Incomplete("token"))?;
        let user = response.user.ok_or(ExchangeError::Incomplete("user"))?;
        Ok(LoginOutcome {
            sso_token,
            profile: AccountProfile {
                user_id: user.username.ok_or(ExchangeError::Incomplete("username"))?,
                country: user
                    .country_abbr
                    .ok_or(ExchangeError::Incomplete("countryAbbr"))?,
            },
        })
    }

    /// SSO token → SaaS token + identity-pool (Cognito) token.
    #[instrument(skip_all, err)]
    pub async fn exchange_tokens(
        &self,
        user_id: &str,
        sso_token: &str,
    ) -> Result<ExchangedTokens, ExchangeError> {
        let url = format!("{}/v3/auth/refresh_tokens", self.config.saas_endpoint);
        let request = ExchangeRequest {
            user_id,
            sso_token,
            app_id: &self.config.app_id,
        };

        debug!("calling token exchange");
        let response = self
            .http
            .request(Method::POST, &url, |req| {
                req.header("user-agent", USER_AGENT)
                    .header("content-type", CONTENT_TYPE)
                    .json(&request)
            })
            .await?;

        let response: ExchangeResponse = decode_vendor(response).await?;
        if response.errorcode != "0" {
            return Err(ExchangeError::rejected(response.errorcode, response.msg));
        }

        let data = response.data.ok_or(ExchangeError::Incomplete("data"))?;
        Ok(ExchangedTokens {
            saas_token: data.saas_token.ok_or(ExchangeError::Incomplete("saasToken"))?,
            cognito_token: data
                .cognito_token
                .ok_or(ExchangeError::Incomplete("cognitoToken"))?,
        })
    }

    /// Identity-pool token → temporary AWS access key triple.
    #[instrument(skip_all, err)]
    pub async fn identity_credentials(
        &self,
        cognito_token: &str,
    ) -> Result<AccessKeySet, ExchangeError> {
        let url = format!("{}/", self.config.identity_endpoint);
        let request = IdentityRequest {
            identity_id: &self.config.identity_id,
            logins: IdentityLogins {
                cognito: cognito_token,
            },
        };

        debug!("calling identity pool");
        let response = self
            .http
            .request(Method::POST, &url, |req| {
                req.header("x-amz-target", IDENTITY_TARGET)
                    .header("content-type", IDENTITY_CONTENT_TYPE)
                    .header("user-agent", IDENTITY_USER_AGENT)
                    .header("x-amz-date", Utc::now().format("%Y%m%dT%H%M%SZ").to_string())
                    .json(&request)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::FORBIDDEN {
            // identity-pool rejections come back as structured 400s
            let fault: IdentityFault = response.json().await.unwrap_or_default();
            return Err(ExchangeError::rejected(
                fault.kind.unwrap_or_else(|| status.to_string()),
                fault.message,
            ));
        }
        if !status.is_success() {
            return Err(NetworkError::Status(status).into());
        }

        let response: IdentityResponse = response.json().await?;
        let creds = response
            .credentials
            .ok_or(ExchangeError::Incomplete("Credentials"))?;
        let expires_at = chrono::DateTime::from_timestamp(creds.expiration as i64, 0)
            .ok_or(ExchangeError::Incomplete("Expiration"))?;
        Ok(AccessKeySet::new(
            creds.access_key_id,
            creds.secret_key,
            creds.session_token,
            expires_at,
        ))
    }
}

/// Applies the vendor convention that auth failures surface as HTTP 401/403
/// while everything else carries a JSON envelope.
async fn decode_vendor<T: serde::de::DeserializeOwned>(
    response: crate::util::http::Response,
) -> Result<T, ExchangeError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ExchangeError::rejected(status.to_string(), None));
    }
    if !status.is_success() {
        return Err(NetworkError::Status(status).into());
    }
    Ok(response.json().await?)
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    equipment: u8,
    password: &'a str,
    #[serde(rename = "osType")]
    os_type: u8,
    username: &'a str,
    #[serde(rename = "clientVersion")]
    client_version: &'a str,
    #[serde(rename = "osVersion")]
    os_version: &'a str,
    #[serde(rename = "deviceModel")]
    device_model: &'a str,
    #[serde(rename = "captchaRule")]
    captcha_rule: u8,
    channel: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    errorcode: String,
    msg: Option<String>,
    token: Option<String>,
    user: Option<LoginUser>,
}

#[derive(Deserialize)]
struct LoginUser {
    #[serde(rename = "countryAbbr")]
    country_abbr: Option<String>,
    username: Option<String>,
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    #[serde(rename = "userId")]
    user_id: &'a str,
    #[serde(rename = "ssoToken")]
    sso_token: &'a str,
    #[serde(rename = "appId")]
    app_id: &'a str,
}

#[derive(Deserialize)]
struct ExchangeResponse {
    #[serde(default)]
    errorcode: String,
    msg: Option<String>,
    data: Option<ExchangeData>,
}

#[derive(Deserialize)]
struct ExchangeData {
    #[serde(rename = "cognitoToken")]
    cognito_token: Option<String>,
    #[serde(rename = "saasToken")]
    saas_token: Option<String>,
}

#[derive(Serialize)]
struct IdentityRequest<'a> {
    #[serde(rename = "IdentityId")]
    identity_id: &'a str,
    #[serde(rename = "Logins")]
    logins: IdentityLogins<'a>,
}

#[derive(Serialize)]
struct IdentityLogins<'a> {
    #[serde(rename = "cognito-identity.amazonaws.com")]
    cognito: &'a str,
}

#[derive(Deserialize)]
struct IdentityResponse {
    #[serde(rename = "Credentials")]
    credentials: Option<IdentityCredentials>,
}

#[derive(Deserialize)]
struct IdentityCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretKey")]
    secret_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
    #[serde(rename = "Expiration")]
    expiration: f64,
}

#[derive(Default, Deserialize)]
struct IdentityFault {
    #[serde(rename = "__type")]
    kind: Option<String>,
    message: Option<String>,
}
