use std::time::Duration;

use crate::util::retry::RetryPolicy;

// IMPORTANT: the production values below identify this client to the vendor
// cloud as the official mobile app. Changing any of them changes what the
// services will accept; they are grouped here so regional variants only
// need to override endpoints.

/// Endpoints and identity of the vendor cloud plus request/refresh tuning.
#[derive(Clone, Debug)]
pub struct Config {
    /// Account (SSO) service base URL.
    pub account_endpoint: String,
    /// SaaS platform base URL (token exchange + device directory).
    pub saas_endpoint: String,
    /// Cognito identity-pool service URL.
    pub identity_endpoint: String,
    /// Message-broker (IoT) base URL commands are published to.
    pub broker_endpoint: String,
    /// AWS region the broker and identity pool live in.
    pub region: String,
    /// Identity reference presented when fetching temporary credentials.
    pub identity_id: String,
    /// Client id attached to account login calls.
    pub client_id: String,
    /// Application id attached to token exchange calls.
    pub app_id: String,

    pub request: RequestConfig,
    pub refresh: RefreshConfig,
}

#[derive(Clone, Debug)]
pub struct RequestConfig {
    /// Maximum time to wait for a single network call to complete.
    pub timeout: Duration,
    /// Retry budget applied to transient network failures.
    pub retry: RetryPolicy,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RefreshConfig {
    /// How often the background refresher re-checks token expiries.
    pub check_interval: Duration,
    /// Refresh is triggered once any credential expires within this margin.
    pub safety_margin: Duration,
    /// How long callers needing a usable session wait for an in-flight
    /// refresh before giving up.
    pub wait_timeout: Duration,
    /// Lifetime assumed for the account SSO token, which carries no expiry
    /// on the wire.
    pub sso_ttl: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            safety_margin: Duration::from_secs(5 * 60),
            wait_timeout: Duration::from_secs(10),
            sso_ttl: Duration::from_secs(8 * 60 * 60),
        }
    }
}

impl Default for Config {
    /// Production endpoints for the EU deployment of the vendor cloud.
    fn default() -> Self {
        Self {
            account_endpoint: "https://pa.account.tcl.com".to_string(),
            saas_endpoint: "https://prod-eu.aws.tcljd.com".to_string(),
            identity_endpoint: "https://cognito-identity.eu-central-1.amazonaws.com".to_string(),
            broker_endpoint: "https://a2qjkbbsk6qn2u-ats.iot.eu-central-1.amazonaws.com"
                .to_string(),
            region: "eu-central-1".to_string(),
            identity_id: "eu-central-1:61e8f839-2d72-c035-a2bf-7ef50a856ddd".to_string(),
            client_id: "54148614".to_string(),
            app_id: "wx6e1af3fa84fbe523".to_string(),
            request: RequestConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}
