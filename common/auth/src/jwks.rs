use jsonwebtoken::DecodingKey;
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::error::{AuthError, AuthResult};

/// Pulls RSA decoding keys from a JWKS endpoint. Entries that are not
/// usable RS256 keys are skipped with a warning rather than failing the
/// whole fetch; the verifier decides what an empty set means.
#[derive(Clone)]
pub struct JwksFetcher {
    client: Client,
    url: String,
}

impl JwksFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self) -> AuthResult<Vec<(String, DecodingKey)>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::JwksFetch(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let document: JwksDocument = response
            .json()
            .await
            .map_err(|err| AuthError::JwksDecode(err.to_string()))?;

        let mut keys = Vec::new();
        for entry in document.keys {
            match entry.decoding_key() {
                Ok(pair) => keys.push(pair),
                Err(reason) => {
                    warn!(jwks_url = %self.url, reason, "Skipping unusable JWKS entry");
                }
            }
        }
        Ok(keys)
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: Option<String>,
    alg: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

impl JwkEntry {
    fn decoding_key(&self) -> Result<(String, DecodingKey), &'static str> {
        let Some(kid) = &self.kid else {
            return Err("missing kid");
        };
        if self.kty.as_deref().unwrap_or("RSA") != "RSA" {
            return Err("not an RSA key");
        }
        if let Some(alg) = &self.alg {
            if alg != "RS256" {
                return Err("not an RS256 key");
            }
        }
        let (Some(n), Some(e)) = (&self.n, &self.e) else {
            return Err("missing modulus or exponent");
        };
        let key = DecodingKey::from_rsa_components(n, e).map_err(|_| "bad RSA components")?;
        Ok((kid.clone(), key))
    }
}
