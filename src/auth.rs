//! Time-bound admission tokens for transport sessions
//!
//! The token is a chained, non-reversible digest of the client-issued time:
//!
//! ```text
//! token = HMAC(user ++ pass, HMAC(INTERNAL_KEY, seal(time)))
//! ```
//!
//! Both ends compute the same chain; the server compares the hex strings.
//! There is no freshness window on `time`.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Fixed key of the middle stage
const INTERNAL_KEY: &[u8] = b"sock.ws/internal-digest-key";

/// First stage of the token chain.
///
/// Stands in for the asymmetric transform both ends share key material for.
pub trait Sealer: Send + Sync {
    fn seal(&self, data: &[u8]) -> Vec<u8>;
}

/// SHA-256 over the shared key bytes followed by the input
#[derive(Clone, Default)]
pub struct KeySealer {
    key: Vec<u8>,
}

impl KeySealer {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        KeySealer { key: key.into() }
    }

    /// Load the shared key material from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let key = std::fs::read(path).map_err(|e| {
            Error::Config(format!("failed to read key file {}: {}", path.display(), e))
        })?;
        Ok(Self::new(key))
    }
}

impl Sealer for KeySealer {
    fn seal(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(data);
        hasher.finalize().to_vec()
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Config(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Credentials plus the sealing stage; computes and checks tokens
#[derive(Clone)]
pub struct AuthGate {
    secret: Vec<u8>,
    sealer: Arc<dyn Sealer>,
}

impl AuthGate {
    pub fn new(username: &str, password: &str, sealer: Arc<dyn Sealer>) -> Self {
        let mut secret = Vec::with_capacity(username.len() + password.len());
        secret.extend_from_slice(username.as_bytes());
        secret.extend_from_slice(password.as_bytes());
        AuthGate { secret, sealer }
    }

    /// Gate using the default [`KeySealer`], loading `key_file` when given
    pub fn from_key_file(username: &str, password: &str, key_file: Option<&Path>) -> Result<Self> {
        let sealer = match key_file {
            Some(path) => KeySealer::from_file(path)?,
            None => KeySealer::default(),
        };
        Ok(Self::new(username, password, Arc::new(sealer)))
    }

    /// Token for a `time` value, exactly as it appears in the query string
    pub fn token(&self, time: &str) -> Result<String> {
        let sealed = self.sealer.seal(time.as_bytes());
        let inner = hmac(INTERNAL_KEY, &sealed)?;
        Ok(hex::encode(hmac(&self.secret, &inner)?))
    }

    pub fn verify(&self, time: &str, token: &str) -> bool {
        matches!(self.token(time), Ok(expected) if expected == token)
    }

    /// Check the `time`/`token` pair in a request query string
    pub fn verify_query(&self, query: &str) -> bool {
        let mut time = None;
        let mut token = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "time" if time.is_none() => time = Some(value.into_owned()),
                "token" if token.is_none() => token = Some(value.into_owned()),
                _ => {}
            }
        }

        match (time, token) {
            (Some(time), Some(token)) => self.verify(&time, &token),
            _ => false,
        }
    }

    /// Connection URL carrying a fresh `time` and its token
    pub fn connection_url(&self, base: &str) -> Result<String> {
        self.connection_url_at(base, now_millis())
    }

    pub fn connection_url_at(&self, base: &str, time: u128) -> Result<String> {
        let mut url = Url::parse(base).map_err(|e| Error::InvalidUrl(format!("{}: {}", base, e)))?;
        let time = time.to_string();
        let token = self.token(&time)?;
        url.query_pairs_mut()
            .append_pair("time", &time)
            .append_pair("token", &token);
        Ok(url.into())
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
