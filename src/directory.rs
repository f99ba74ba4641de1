use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::auth::exchange::{APP_VERSION, CONTENT_TYPE, PLATFORM, USER_AGENT};
use crate::auth::refresher::CredentialRefresher;
use crate::auth::store::CredentialStore;
use crate::auth::token::TokenSet;
use crate::command::Control;
use crate::config::Config;
use crate::util::crypto::{md5_hex_digest, random_hex};
use crate::util::http::{Client, Method, NetworkError};
use crate::util::retry::with_backoff;

// The directory shard reports a newer app version than the account service.
const DIRECTORY_APP_VERSION: &str = "5.4.1";

#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No authenticated session and none could be produced within the
    /// configured wait.
    #[error("no usable session")]
    SessionUnavailable,

    #[error("directory rejected the request: ({code}) {message}")]
    Rejected { code: String, message: String },

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Which controls a device accepts, derived from the property names it
/// reports. Dispatch is capability-driven: a control maps to the vendor
/// field name, or is refused if the device never reported that field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub power: bool,
    pub target_temperature: bool,
    pub fan_speed: bool,
}

impl Capabilities {
    fn from_properties(properties: &serde_json::Map<String, Value>) -> Self {
        Self {
            power: properties.contains_key(Control::Power.shortcut()),
            target_temperature: properties.contains_key(Control::TargetTemperature.shortcut()),
            fan_speed: properties.contains_key(Control::FanSpeed.shortcut()),
        }
    }

    pub fn supports(&self, control: Control) -> bool {
        match control {
            Control::Power => self.power,
            Control::TargetTemperature => self.target_temperature,
            Control::FanSpeed => self.fan_speed,
        }
    }
}

/// A registered device as reported by the directory. An immutable snapshot;
/// the list is refreshed wholesale, never patched per field.
#[derive(Clone, Debug)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub device_type: Option<String>,
    pub capabilities: Capabilities,
    /// Last reported state, keyed by vendor field name.
    pub properties: serde_json::Map<String, Value>,
}

/// Fetches and caches the devices registered to the authenticated account.
pub struct DeviceDirectory {
    http: Client,
    config: Arc<Config>,
    store: Arc<CredentialStore>,
    refresher: Arc<CredentialRefresher>,
    devices: RwLock<Arc<Vec<Device>>>,
}

impl DeviceDirectory {
    pub fn new(
        config: Arc<Config>,
        store: Arc<CredentialStore>,
        refresher: Arc<CredentialRefresher>,
    ) -> Self {
        Self {
            http: Client::new(config.request.timeout),
            config,
            store,
            refresher,
            devices: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// The device list from the last successful fetch.
    pub fn cached(&self) -> Arc<Vec<Device>> {
        self.devices
            .read()
            .expect("device cache lock poisoned")
            .clone()
    }

    /// Fetches the full device list, replacing the cached snapshot. Callers
    /// own any diffing against previously known devices.
    #[instrument(skip_all, err)]
    pub async fn list_devices(&self) -> Result<Vec<Device>, DirectoryError> {
        let tokens = self.usable_tokens().await?;
        let url = format!("{}/v3/user/get_things", self.config.saas_endpoint);
        let saas = tokens.saas.value().to_string();
        let country = tokens.profile.country.clone();

        let response = with_backoff(
            self.config.request.retry,
            || self.fetch_things(&url, &saas, &country),
            NetworkError::is_transient,
        )
        .await?;

        if response.errorcode != "0" {
            return Err(DirectoryError::Rejected {
                code: response.errorcode,
                message: response
                    .msg
                    .unwrap_or_else(|| "no detail provided".to_string()),
            });
        }

        let devices: Vec<Device> = response
            .data
            .unwrap_or_default()
            .into_iter()
            .map(Device::from)
            .collect();
        debug!(count = devices.len(), "device list replaced");

        *self.devices.write().expect("device cache lock poisoned") =
            Arc::new(devices.clone());
        Ok(devices)
    }

    async fn fetch_things(
        &self,
        url: &str,
        saas: &str,
        country: &str,
    ) -> Result<ThingsResponse, NetworkError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let nonce = random_hex(16);
        // request signature over timestamp, nonce and session token
        let sign = md5_hex_digest(format!("{timestamp}{nonce}{saas}"));

        let response = self
            .http
            .request(Method::POST, url, move |req| {
                req.header("platform", PLATFORM)
                    .header("appversion", DIRECTORY_APP_VERSION)
                    .header("thomeversion", APP_VERSION)
                    .header("accesstoken", saas)
                    .header("countrycode", country)
                    .header("accept-language", "en")
                    .header("timestamp", timestamp)
                    .header("nonce", nonce)
                    .header("sign", sign)
                    .header("user-agent", USER_AGENT)
                    .header("content-type", CONTENT_TYPE)
                    .json(&serde_json::json!({}))
            })
            .await?;

        match response.status() {
            status if status.is_success() => response.json().await,
            status => Err(NetworkError::Status(status)),
        }
    }

    /// Returns tokens good for a directory call, refreshing first when the
    /// session is failed or the SaaS token has expired. Bounded by the
    /// configured wait.
    async fn usable_tokens(&self) -> Result<Arc<TokenSet>, DirectoryError> {
        let session = self.store.session();
        if session.is_authenticated() {
            if let Some(set) = session.tokens() {
                if !set.saas.is_expired() {
                    return Ok(set);
                }
            }
        }

        debug!("session not usable for directory call, requesting refresh");
        self.refresher
            .refresh_within(self.config.refresh.wait_timeout)
            .await
            .map_err(|_| DirectoryError::SessionUnavailable)?;

        self.store
            .snapshot()
            .filter(|set| !set.saas.is_expired())
            .ok_or(DirectoryError::SessionUnavailable)
    }
}

#[derive(Deserialize)]
struct ThingsResponse {
    #[serde(default)]
    errorcode: String,
    msg: Option<String>,
    data: Option<Vec<ThingRecord>>,
}

#[derive(Deserialize)]
struct ThingRecord {
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "nickName")]
    nick_name: Option<String>,
    #[serde(rename = "deviceType")]
    device_type: Option<String>,
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
}

impl From<ThingRecord> for Device {
    fn from(record: ThingRecord) -> Self {
        let capabilities = Capabilities::from_properties(&record.properties);
        Device {
            name: record
                .nick_name
                .unwrap_or_else(|| record.device_id.clone()),
            id: record.device_id,
            device_type: record.device_type,
            capabilities,
            properties: record.properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::pipeline::AuthPipeline;
    use crate::auth::store::SessionState;
    use crate::auth::token::{AccessKeySet, AccountProfile, Credentials, Token, TokenKind};
    use crate::util::retry::RetryPolicy;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::time::Duration;

    fn test_config(server: &Server) -> Arc<Config> {
        Arc::new(Config {
            account_endpoint: server.url(),
            saas_endpoint: server.url(),
            identity_endpoint: server.url(),
            request: crate::config::RequestConfig {
                timeout: Duration::from_secs(5),
                retry: RetryPolicy {
                    attempts: 1,
                    initial_backoff: Duration::from_millis(10),
                },
            },
            refresh: crate::config::RefreshConfig {
                check_interval: Duration::from_secs(60),
                safety_margin: Duration::from_secs(300),
                wait_timeout: Duration::from_millis(500),
                sso_ttl: Duration::from_secs(8 * 3600),
            },
            ..Config::default()
        })
    }

    fn directory_with_session(server: &Server) -> DeviceDirectory {
        let config = test_config(server);
        let store = Arc::new(CredentialStore::new());
        let ttl = Duration::from_secs(3600);
        store.replace(crate::auth::token::TokenSet {
            sso: Token::with_ttl(TokenKind::Sso, "sso", ttl),
            saas: Token::with_ttl(TokenKind::Saas, "saas-token", ttl),
            cognito: Token::with_ttl(TokenKind::Cognito, "cognito", ttl),
            keys: AccessKeySet::new(
                "akid",
                "secret",
                "session",
                Utc::now() + chrono::TimeDelta::hours(1),
            ),
            profile: AccountProfile {
                user_id: "user@example.com".to_string(),
                country: "RO".to_string(),
            },
        });
        let pipeline = Arc::new(AuthPipeline::new(
            Arc::clone(&config),
            Arc::clone(&store),
            None,
        ));
        let refresher = Arc::new(CredentialRefresher::new(
            pipeline,
            Arc::clone(&store),
            config.refresh.clone(),
        ));
        DeviceDirectory::new(config, store, refresher)
    }

    fn directory_with_failed_session(server: &Server) -> DeviceDirectory {
        let config = test_config(server);
        let store = Arc::new(CredentialStore::new());
        store.begin(SessionState::Authenticating);
        store.login_failed();
        let pipeline = Arc::new(AuthPipeline::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Some(Credentials::new("user@example.com", "secret")),
        ));
        let refresher = Arc::new(CredentialRefresher::new(
            pipeline,
            Arc::clone(&store),
            config.refresh.clone(),
        ));
        DeviceDirectory::new(config, store, refresher)
    }

    #[tokio::test]
    async fn test_list_devices_parses_and_caches() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v3/user/get_things")
            .match_header("accesstoken", "saas-token")
            .match_header("countrycode", "RO")
            .match_header("sign", Matcher::Regex("^[0-9a-f]{32}$".into()))
            .with_status(200)
            .with_body(
                json!({
                    "errorcode": "0",
                    "data": [
                        {
                            "deviceId": "ac-1",
                            "nickName": "Living Room AC",
                            "deviceType": "Split AC",
                            "properties": {
                                "powerSwitch": 1,
                                "targetTemperature": 22
                            }
                        },
                        {
                            "deviceId": "ac-2",
                            "properties": {"powerSwitch": 0, "windSpeed": 2}
                        }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let directory = directory_with_session(&server);
        let devices = directory.list_devices().await.unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "ac-1");
        assert_eq!(devices[0].name, "Living Room AC");
        assert!(devices[0].capabilities.power);
        assert!(devices[0].capabilities.target_temperature);
        assert!(!devices[0].capabilities.fan_speed);

        // devices without a nickname fall back to their id
        assert_eq!(devices[1].name, "ac-2");
        assert!(devices[1].capabilities.fan_speed);

        // the snapshot is replaced wholesale
        assert_eq!(directory.cached().len(), 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_devices_vendor_rejection() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v3/user/get_things")
            .with_status(200)
            .with_body(json!({"errorcode": "4000", "msg": "token mismatch"}).to_string())
            .create_async()
            .await;

        let directory = directory_with_session(&server);
        let err = directory.list_devices().await.unwrap_err();

        assert!(matches!(
            err,
            DirectoryError::Rejected { ref code, .. } if code == "4000"
        ));
    }

    #[tokio::test]
    async fn test_failed_session_with_failing_refresh_is_unavailable() {
        let mut server = Server::new_async().await;
        // the fallback login also fails, so no session can be produced
        let _login = server
            .mock("POST", Matcher::Regex("/account/login.*".into()))
            .with_status(200)
            .with_body(json!({"errorcode": "1200", "msg": "bad password"}).to_string())
            .create_async()
            .await;

        let directory = directory_with_failed_session(&server);
        let err = directory.list_devices().await.unwrap_err();

        assert!(matches!(err, DirectoryError::SessionUnavailable));
    }
}
