use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine as _};
use chrono::{DateTime, TimeDelta, Utc};

use crate::util::crypto::md5_hex_digest;

/// Account credentials as presented to the login endpoint. The raw password
/// is digested once at construction and never retained.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    email: String,
    password_digest: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: &str) -> Self {
        Self {
            email: email.into(),
            password_digest: md5_hex_digest(password),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub(crate) fn password_digest(&self) -> &str {
        &self.password_digest
    }
}

// Credentials end up in error/log context via the structs holding them;
// the digest must never be printed.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password_digest", &"<redacted>")
            .finish()
    }
}

/// The credential kinds held by a session, in the order the federation
/// chain produces them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Issued by account login; only good for obtaining the other tokens.
    Sso,
    /// Session token for the SaaS platform (device directory et al).
    Saas,
    /// Identity-pool login token, exchanged for temporary AWS credentials.
    Cognito,
    /// Temporary AWS access key triple used to sign broker requests.
    AccessKey,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Sso => "sso",
            TokenKind::Saas => "saas",
            TokenKind::Cognito => "cognito",
            TokenKind::AccessKey => "access-key",
        };
        name.fmt(f)
    }
}

/// A bearer credential with its validity window.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// A token whose expiry is not reported on the wire; `ttl` is the
    /// configured assumption.
    pub fn with_ttl(kind: TokenKind, value: impl Into<String>, ttl: Duration) -> Self {
        let issued_at = Utc::now();
        Self {
            kind,
            value: value.into(),
            issued_at,
            expires_at: issued_at + to_delta(ttl),
        }
    }

    /// Takes the expiry from the JWT `exp` claim when the value parses as a
    /// JWT, falling back to `fallback_ttl` otherwise.
    pub fn from_jwt(kind: TokenKind, value: impl Into<String>, fallback_ttl: Duration) -> Self {
        let value = value.into();
        let issued_at = Utc::now();
        let expires_at =
            jwt_expiry(&value).unwrap_or_else(|| issued_at + to_delta(fallback_ttl));
        Self {
            kind,
            value,
            issued_at,
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn expires_within(&self, margin: Duration) -> bool {
        Utc::now() + to_delta(margin) >= self.expires_at
    }
}

// Token values must never reach log output; only kind and expiry metadata
// are printable.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.kind)
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Temporary AWS credential triple used for request signing.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKeySet {
    pub access_key_id: String,
    secret_access_key: String,
    session_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessKeySet {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.into(),
            issued_at: Utc::now(),
            expires_at,
        }
    }

    pub(crate) fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub(crate) fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn expires_within(&self, margin: Duration) -> bool {
        Utc::now() + to_delta(margin) >= self.expires_at
    }
}

impl fmt::Debug for AccessKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKeySet")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Per-account metadata returned by login that later calls depend on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountProfile {
    /// Vendor-side user id (the account email).
    pub user_id: String,
    /// Country code selecting the SaaS shard.
    pub country: String,
}

/// One credential of every kind, produced together by a single login or
/// refresh cycle and only ever replaced as a whole.
#[derive(Clone, Debug)]
pub struct TokenSet {
    pub sso: Token,
    pub saas: Token,
    pub cognito: Token,
    pub keys: AccessKeySet,
    pub profile: AccountProfile,
}

impl TokenSet {
    /// True if any held credential expires within `margin`.
    pub fn expiring_within(&self, margin: Duration) -> bool {
        self.sso.expires_within(margin)
            || self.saas.expires_within(margin)
            || self.cognito.expires_within(margin)
            || self.keys.expires_within(margin)
    }

    /// True once every held credential has expired.
    pub fn fully_expired(&self) -> bool {
        self.sso.is_expired()
            && self.saas.is_expired()
            && self.cognito.is_expired()
            && self.keys.is_expired()
    }

    pub fn get(&self, kind: TokenKind) -> Token {
        match kind {
            TokenKind::Sso => self.sso.clone(),
            TokenKind::Saas => self.saas.clone(),
            TokenKind::Cognito => self.cognito.clone(),
            // the key id stands in as the token value; the secret parts
            // stay behind the AccessKeySet accessors
            TokenKind::AccessKey => Token {
                kind: TokenKind::AccessKey,
                value: self.keys.access_key_id.clone(),
                issued_at: self.keys.issued_at,
                expires_at: self.keys.expires_at,
            },
        }
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Extracts the `exp` claim from a JWT without verifying its signature;
/// expiry is the only claim this client consumes.
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = BASE64_URL.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.get("exp")?.as_i64()?, 0)
}

/// Builds an unsigned JWT carrying only an `exp` claim, for exercising
/// expiry extraction against mock services.
#[cfg(test)]
pub(crate) fn jwt_expiring_at(exp: i64) -> String {
    let header = BASE64_URL.encode(br#"{"alg":"none"}"#);
    let payload = BASE64_URL.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_digest_is_redacted() {
        let creds = Credentials::new("user@example.com", "secret");
        let debug = format!("{creds:?}");
        assert!(debug.contains("user@example.com"));
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&md5_hex_digest("secret")));
    }

    #[test]
    fn test_token_value_is_redacted() {
        let token = Token::with_ttl(TokenKind::Sso, "super-secret", Duration::from_secs(60));
        assert!(!format!("{token:?}").contains("super-secret"));
    }

    #[test]
    fn test_jwt_expiry_is_used() {
        let exp = Utc::now().timestamp() + 3600;
        let token = Token::from_jwt(
            TokenKind::Cognito,
            jwt_expiring_at(exp),
            Duration::from_secs(1),
        );
        assert_eq!(token.expires_at.timestamp(), exp);
        assert!(!token.is_expired());
    }

    #[test]
    fn test_malformed_jwt_falls_back_to_ttl() {
        let token = Token::from_jwt(
            TokenKind::Saas,
            "not-a-jwt",
            Duration::from_secs(3600),
        );
        let remaining = token.expires_at - Utc::now();
        assert!(remaining.num_seconds() > 3500 && remaining.num_seconds() <= 3600);
    }

    #[test]
    fn test_expires_within() {
        let token = Token::with_ttl(TokenKind::Saas, "t", Duration::from_secs(30));
        assert!(token.expires_within(Duration::from_secs(300)));
        assert!(!token.expires_within(Duration::from_secs(1)));
        assert!(!token.is_expired());
    }
}
