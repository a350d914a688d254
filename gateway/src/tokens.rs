use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use uuid::Uuid;

use crate::identity::User;

pub struct TokenConfig {
    pub issuer: String,
    pub audience: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

/// RS256 signer for the tokens minted at the OAuth callback. Both the access
/// and refresh tokens are JWTs; the refresh token carries `token_use=refresh`
/// and is rejected by the authenticator on API surfaces.
pub struct TokenSigner {
    config: TokenConfig,
    kid: String,
    encoding_key: EncodingKey,
}

pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub access_expires_in: i64,
    pub refresh_expires_in: i64,
    pub token_type: &'static str,
}

impl TokenSigner {
    pub fn from_pem(config: TokenConfig, kid: impl Into<String>, pem: &str) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|err| anyhow!("Failed to parse signing key: {err}"))?;
        Ok(Self {
            config,
            kid: kid.into(),
            encoding_key,
        })
    }

    pub fn issue_tokens(&self, user: &User) -> Result<IssuedTokens> {
        let now = Utc::now();
        let access_exp = now + Duration::seconds(self.config.access_ttl_seconds);
        let refresh_exp = now + Duration::seconds(self.config.refresh_ttl_seconds);

        let access_token = self.sign(user, now, access_exp, "access")?;
        let refresh_token = self.sign(user, now, refresh_exp, "refresh")?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            access_expires_at: access_exp,
            refresh_expires_at: refresh_exp,
            access_expires_in: self.config.access_ttl_seconds,
            refresh_expires_in: self.config.refresh_ttl_seconds,
            token_type: "Bearer",
        })
    }

    fn sign(
        &self,
        user: &User,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        token_use: &str,
    ) -> Result<String> {
        let claims = SignedClaims {
            sub: user.id.to_string(),
            email: &user.email,
            tier: user.tier.as_str(),
            scope: &["*".to_string()],
            token_use,
            iss: &self.config.issuer,
            aud: &self.config.audience,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());

        encode(&header, &claims, &self.encoding_key)
            .map_err(|err| anyhow!("Failed to sign {token_use} token: {err}"))
    }
}

#[derive(Serialize)]
struct SignedClaims<'a> {
    sub: String,
    email: &'a str,
    tier: &'a str,
    scope: &'a [String],
    token_use: &'a str,
    iss: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
    jti: String,
}
