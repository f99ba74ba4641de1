use chrono::{DateTime, Utc};

use crate::util::crypto::{hmac_sha256, sha256_hex_digest};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Inputs to a single signature: the temporary key triple plus the signing
/// scope. The signature binds the request to `when`; the broker accepts it
/// only within a short window around that instant, independent of the
/// access key's own expiry.
pub struct SigningParams<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub session_token: Option<&'a str>,
    pub region: &'a str,
    pub service: &'a str,
    pub when: DateTime<Utc>,
}

/// A request with its authentication headers fully computed. The header
/// list includes everything that was signed (`host` included — transports
/// that set it themselves must send the identical value).
pub struct SignedRequest {
    pub headers: Vec<(String, String)>,
}

/// Computes an AWS-style request signature: canonical request hashing
/// followed by the HMAC-SHA256 key-derivation chain.
///
/// `path` and `query` must already be in their on-the-wire (percent-encoded)
/// form; they are signed exactly as given.
pub fn sign(
    method: &str,
    host: &str,
    path: &str,
    query: &str,
    extra_headers: &[(&str, &str)],
    payload: &[u8],
    params: &SigningParams<'_>,
) -> SignedRequest {
    let amz_date = params.when.format("%Y%m%dT%H%M%SZ").to_string();
    let datestamp = params.when.format("%Y%m%d").to_string();

    let mut headers: Vec<(String, String)> = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(token) = params.session_token {
        headers.push(("x-amz-security-token".to_string(), token.to_string()));
    }
    for (name, value) in extra_headers {
        headers.push((name.to_lowercase(), value.trim().to_string()));
    }
    headers.sort();

    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let scope = format!("{datestamp}/{}/{}/aws4_request", params.region, params.service);
    let canonical = canonical_request(method, path, query, &headers, &signed_headers, payload);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex_digest(canonical)
    );

    let signature = hex::encode(hmac_sha256(
        &signing_key(params.secret_access_key, &datestamp, params.region, params.service),
        string_to_sign.as_bytes(),
    ));

    headers.push((
        "authorization".to_string(),
        format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, \
             Signature={signature}",
            params.access_key_id
        ),
    ));

    SignedRequest { headers }
}

fn canonical_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &[(String, String)],
    signed_headers: &str,
    payload: &[u8],
) -> String {
    let canonical_query = {
        let mut parts: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        parts.sort_unstable();
        parts.join("&")
    };
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();

    format!(
        "{method}\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{}",
        sha256_hex_digest(payload)
    )
}

/// HMAC chain: secret → date → region → service → terminal marker.
fn signing_key(secret: &str, datestamp: &str, region: &str, service: &str) -> Vec<u8> {
    let key = hmac_sha256(format!("AWS4{secret}").as_bytes(), datestamp.as_bytes());
    let key = hmac_sha256(&key, region.as_bytes());
    let key = hmac_sha256(&key, service.as_bytes());
    hmac_sha256(&key, b"aws4_request")
}
