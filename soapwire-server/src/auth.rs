//! `Authorization` header parsing: Basic and Digest (MD5, qop=auth).
//!
//! The server never stores passwords; the user-supplied validator receives
//! the parsed credentials and decides. For Digest it can recompute the
//! response hash with `DigestCredentials::verify`.

use base64::Engine as _;
use md5::{Digest as _, Md5};

/// Parsed client credentials. `Anonymous` stands for a request without an
/// `Authorization` header, so validators see every request uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { user: String, password: String },
    Digest(DigestCredentials),
}

impl Credentials {
    pub fn user(&self) -> &str {
        match self {
            Credentials::Anonymous => "",
            Credentials::Basic { user, .. } => user,
            Credentials::Digest(d) => &d.username,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub algorithm: Option<String>,
}

impl DigestCredentials {
    /// Recompute the RFC 2617 response for the given HTTP method and the
    /// candidate password, and compare with what the client sent.
    pub fn verify(&self, method: &str, password: &str) -> bool {
        let ha1 = md5_hex(&format!("{}:{}:{}", self.username, self.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method, self.uri));
        let expected = match (&self.qop, &self.nc, &self.cnonce) {
            (Some(qop), Some(nc), Some(cnonce)) => md5_hex(&format!(
                "{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}",
                self.nonce
            )),
            _ => md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce)),
        };
        expected == self.response.to_ascii_lowercase()
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse an `Authorization` header value. Unknown schemes and malformed
/// payloads yield `None`, which the caller treats as anonymous.
pub fn parse_authorization(header: &str) -> Option<Credentials> {
    let (scheme, rest) = header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("basic") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(rest.trim())
            .ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (user, password) = text.split_once(':')?;
        return Some(Credentials::Basic {
            user: user.to_owned(),
            password: password.to_owned(),
        });
    }
    if scheme.eq_ignore_ascii_case("digest") {
        let mut creds = DigestCredentials::default();
        for (key, value) in parse_auth_params(rest) {
            match key.as_str() {
                "username" => creds.username = value,
                "realm" => creds.realm = value,
                "nonce" => creds.nonce = value,
                "uri" => creds.uri = value,
                "response" => creds.response = value,
                "qop" => creds.qop = Some(value),
                "nc" => creds.nc = Some(value),
                "cnonce" => creds.cnonce = Some(value),
                "algorithm" => creds.algorithm = Some(value),
                _ => {}
            }
        }
        if creds.username.is_empty() || creds.response.is_empty() {
            return None;
        }
        return Some(Credentials::Digest(creds));
    }
    None
}

/// `key="value", key=value, ...` with commas allowed inside quotes.
fn parse_auth_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = stripped.find('"') else { break };
            value = stripped[..end].to_owned();
            rest = stripped[end + 1..].trim_start().trim_start_matches(',');
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_owned();
            rest = rest[end..].trim_start_matches(',');
        }
        rest = rest.trim_start();
        params.push((key, value));
    }
    params
}
