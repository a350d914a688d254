use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::{debug, warn};

use crate::claims::Claims;
use crate::error::{AuthError, AuthResult};
use crate::jwks::JwksFetcher;

/// What every presented token is checked against. RS256 is the only
/// accepted algorithm; there is no HS256 escape hatch.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub issuer: String,
    pub audience: String,
    pub leeway_seconds: u32,
}

impl VerifyOptions {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            leeway_seconds: 30,
        }
    }

    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }
}

/// Where decoding keys come from.
pub enum KeySource {
    /// A fixed PEM-encoded RSA public key registered under `kid`.
    StaticPem { kid: String, pem: Vec<u8> },
    /// A JWKS endpoint, fetched at startup and refreshed in the background.
    Jwks(String),
}

/// Bearer-token verifier. The validation ruleset is built once; the key map
/// is replaced wholesale on JWKS refresh and read with a shared lock on the
/// request path.
pub struct JwtVerifier {
    validation: Validation,
    keys: RwLock<HashMap<String, DecodingKey>>,
    jwks: Option<JwksFetcher>,
}

impl JwtVerifier {
    /// Assemble the verifier from its configured sources. A JWKS source is
    /// fetched here so a bad endpoint fails startup loudly instead of
    /// rejecting every bearer token at runtime.
    pub async fn from_sources(
        options: VerifyOptions,
        sources: Vec<KeySource>,
    ) -> AuthResult<Self> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[options.issuer.clone()]);
        validation.set_audience(&[options.audience.clone()]);
        validation.leeway = options.leeway_seconds.into();

        let mut keys = HashMap::new();
        let mut jwks = None;
        for source in sources {
            match source {
                KeySource::StaticPem { kid, pem } => {
                    let key = DecodingKey::from_rsa_pem(&pem)
                        .map_err(|err| AuthError::KeyParse(kid.clone(), err.to_string()))?;
                    keys.insert(kid, key);
                }
                KeySource::Jwks(url) => jwks = Some(JwksFetcher::new(url)),
            }
        }

        let verifier = Self {
            validation,
            keys: RwLock::new(keys),
            jwks,
        };
        verifier.refresh_jwks().await?;
        Ok(verifier)
    }

    pub fn jwks_fetcher(&self) -> Option<&JwksFetcher> {
        self.jwks.as_ref()
    }

    fn key_for(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let guard = self.keys.read().expect("key map poisoned");
        match kid {
            Some(kid) => guard.get(kid).cloned(),
            // Dev-minted tokens may omit the kid; that is only unambiguous
            // while a single key is loaded.
            None if guard.len() == 1 => guard.values().next().cloned(),
            None => None,
        }
    }

    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        let header =
            decode_header(token).map_err(|err| AuthError::InvalidHeader(err.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let key = self
            .key_for(header.kid.as_deref())
            .ok_or(match header.kid {
                Some(kid) => AuthError::UnknownKeyId(kid),
                None => AuthError::MissingKeyId,
            })?;

        let token_data = decode::<Value>(token, &key, &self.validation)?;
        let claims = Claims::try_from(token_data.claims)?;
        debug!(subject = %claims.subject, "verified bearer token");
        Ok(claims)
    }

    /// Pull the current key set from the JWKS endpoint. The map is replaced
    /// only when at least one usable key came back, so a flapping endpoint
    /// never empties a working verifier.
    pub async fn refresh_jwks(&self) -> AuthResult<usize> {
        let Some(fetcher) = &self.jwks else {
            return Ok(0);
        };
        let fetched = fetcher.fetch().await?;
        let count = fetched.len();
        if count > 0 {
            let mut guard = self.keys.write().expect("key map poisoned");
            guard.clear();
            guard.extend(fetched);
        }
        Ok(count)
    }

    /// Background JWKS refresh loop; a no-op for PEM-only verifiers. Keeps
    /// serving the last good key set when a fetch fails.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) {
        if self.jwks.is_none() {
            return;
        }
        let verifier = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(60)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match verifier.refresh_jwks().await {
                    Ok(count) => {
                        debug!(count, "Refreshed JWKS key set");
                    }
                    Err(err) => {
                        warn!(error = %err, "JWKS refresh failed; keeping previous keys");
                    }
                }
            }
        });
    }
}
