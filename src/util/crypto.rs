use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use sha2::{Digest as _, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub fn sha256_hex_digest<D: AsRef<[u8]>>(data: D) -> String {
    let mut hasher = Sha256::default();
    hasher.update(data.as_ref());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

/// The account service and the SaaS request signature both use MD5 hex
/// digests; the wire format fixes the algorithm.
pub fn md5_hex_digest<D: AsRef<[u8]>>(data: D) -> String {
    let mut hasher = Md5::default();
    hasher.update(data.as_ref());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Returns `len` random bytes as a lowercase hex string.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    hex::encode(bytes)
}
