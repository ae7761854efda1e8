//! Token signing and verification
//!
//! HS256 over `header.payload` via `jsonwebtoken`. Expiry, issuer and
//! audience are checked here against the injected clock rather than by the
//! library, so tests can drive time and callers can ask for the
//! allow-expired diagnostic mode.

use chrono::{DateTime, TimeZone, Utc};
use gatehouse_core::{
    AuthConfig, AuthError, Clock, Result, Role, SecretProvider, TokenType, User, UserId,
};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Claims carried by every token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub iss: String,
    pub aud: String,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expiry (Unix seconds)
    pub exp: i64,
    pub jti: String,
    /// User id, decimal
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub role: Role,
    #[serde(rename = "tvr")]
    pub token_version: i64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,
}

impl TokenPayload {
    /// Tokens without a `type` claim are access tokens
    pub fn kind(&self) -> TokenType {
        self.token_type.unwrap_or(TokenType::Access)
    }

    pub fn user_id(&self) -> Result<UserId> {
        self.sub.parse().map_err(|_| AuthError::TokenMalformed)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        timestamp(self.exp)
    }
}

/// Wire claims before presence checks
#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: Option<String>,
    aud: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
    jti: Option<String>,
    sub: Option<String>,
    email: Option<String>,
    role: Option<String>,
    tvr: Option<i64>,
    #[serde(rename = "type")]
    token_type: Option<TokenType>,
}

/// Whether `verify` enforces `exp`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryMode {
    Enforce,
    /// Diagnostic and logout paths only
    AllowExpired,
}

/// Signs and verifies access and refresh tokens
pub struct TokenSigner {
    secrets: Arc<dyn SecretProvider>,
    clock: Arc<dyn Clock>,
    issuer: String,
    audience: String,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl TokenSigner {
    pub fn new(
        config: &AuthConfig,
        secrets: Arc<dyn SecretProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secrets,
            clock,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl_secs: i64::try_from(config.access_ttl_secs).unwrap_or(i64::MAX),
            refresh_ttl_secs: i64::try_from(config.refresh_ttl_secs).unwrap_or(i64::MAX),
        }
    }

    /// Fresh payload for `user` with a random `jti`
    pub fn payload_for(&self, user: &User, kind: TokenType) -> Result<TokenPayload> {
        let id = user
            .id
            .ok_or_else(|| AuthError::Issuance("user has no id".to_string()))?;
        let now = self.clock.now().timestamp();
        let ttl = match kind {
            TokenType::Access => self.access_ttl_secs,
            TokenType::Refresh => self.refresh_ttl_secs,
        };

        Ok(TokenPayload {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: now.saturating_add(ttl),
            jti: Uuid::new_v4().to_string(),
            sub: id.to_string(),
            email: Some(user.email.clone()),
            role: user.role,
            token_version: user.token_version,
            token_type: Some(kind),
        })
    }

    fn secret(&self, kind: TokenType) -> Result<Vec<u8>> {
        self.secrets
            .secret(kind)
            .ok_or_else(|| AuthError::Config(format!("no signing secret configured for {kind} tokens")))
    }

    /// Encode and sign. The payload's `type` selects the secret.
    pub fn sign(&self, payload: &TokenPayload) -> Result<String> {
        if payload.exp <= self.clock.now().timestamp() {
            return Err(AuthError::Issuance("exp is not in the future".to_string()));
        }
        let secret = self.secret(payload.kind())?;
        encode(
            &Header::new(Algorithm::HS256),
            payload,
            &EncodingKey::from_secret(&secret),
        )
        .map_err(|e| AuthError::Issuance(e.to_string()))
    }

    /// Verify signature, expiry, required claims, issuer/audience and type
    pub fn verify(&self, token: &str, expected: TokenType, mode: ExpiryMode) -> Result<TokenPayload> {
        if !has_three_segments(token) {
            return Err(AuthError::TokenMalformed);
        }
        let secret = self.secret(expected)?;

        let raw = decode::<RawClaims>(token, &DecodingKey::from_secret(&secret), &lenient_validation())
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthError::TokenInvalidSignature
                }
                _ => AuthError::TokenMalformed,
            })?
            .claims;

        let exp = raw.exp.ok_or_else(|| missing("exp"))?;
        if mode == ExpiryMode::Enforce && exp <= self.clock.now().timestamp() {
            return Err(AuthError::TokenExpired);
        }

        let payload = TokenPayload {
            sub: raw.sub.ok_or_else(|| missing("sub"))?,
            jti: raw.jti.ok_or_else(|| missing("jti"))?,
            role: raw
                .role
                .ok_or_else(|| missing("role"))?
                .parse()
                .map_err(|_| missing("role"))?,
            token_version: raw.tvr.ok_or_else(|| missing("tvr"))?,
            iat: raw.iat.ok_or_else(|| missing("iat"))?,
            iss: raw.iss.ok_or_else(|| missing("iss"))?,
            aud: raw.aud.ok_or_else(|| missing("aud"))?,
            exp,
            email: raw.email,
            token_type: raw.token_type,
        };

        if payload.iss != self.issuer || payload.aud != self.audience {
            return Err(AuthError::TokenAudienceMismatch);
        }
        if payload.kind() != expected {
            return Err(AuthError::TokenTypeMismatch { expected });
        }
        Ok(payload)
    }
}

fn missing(claim: &str) -> AuthError {
    AuthError::TokenMissingClaims(claim.to_string())
}

fn lenient_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.leeway = 0;
    validation.required_spec_claims.clear();
    validation
}

fn has_three_segments(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    segments.len() == 3 && segments.iter().all(|s| !s.is_empty())
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// SHA-256 of the wire token, hex encoded. Token Store rows hold this, never the token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Decode claims without checking anything. Never use for authorization.
pub fn peek_unverified(token: &str) -> Result<serde_json::Value> {
    if !has_three_segments(token) {
        return Err(AuthError::TokenMalformed);
    }
    let mut validation = lenient_validation();
    validation.insecure_disable_signature_validation();
    decode::<serde_json::Value>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|_| AuthError::TokenMalformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gatehouse_core::{ManualClock, StaticSecrets};

    fn signer() -> (Arc<ManualClock>, TokenSigner) {
        let clock = Arc::new(ManualClock::starting_now());
        let signer = TokenSigner::new(
            &AuthConfig::default(),
            Arc::new(StaticSecrets::new(Some("access-secret"), Some("refresh-secret"))),
            clock.clone(),
        );
        (clock, signer)
    }

    fn user() -> User {
        User {
            id: Some(42),
            email: "client@example.com".to_string(),
            password_hash: String::new(),
            role: Role::Client,
            verified: true,
            token_version: 0,
            customer_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let (_, signer) = signer();
        let payload = signer.payload_for(&user(), TokenType::Access).unwrap();
        let token = signer.sign(&payload).unwrap();

        let verified = signer
            .verify(&token, TokenType::Access, ExpiryMode::Enforce)
            .unwrap();
        assert_eq!(verified, payload);
        assert_eq!(verified.user_id().unwrap(), 42);
    }

    #[test]
    fn test_expired_token() {
        let (clock, signer) = signer();
        let payload = signer.payload_for(&user(), TokenType::Access).unwrap();
        let token = signer.sign(&payload).unwrap();

        clock.advance(Duration::minutes(31));
        assert!(matches!(
            signer.verify(&token, TokenType::Access, ExpiryMode::Enforce),
            Err(AuthError::TokenExpired)
        ));
        assert!(signer
            .verify(&token, TokenType::Access, ExpiryMode::AllowExpired)
            .is_ok());
    }

    #[test]
    fn test_sign_rejects_past_exp() {
        let (_, signer) = signer();
        let mut payload = signer.payload_for(&user(), TokenType::Access).unwrap();
        payload.exp = payload.iat - 1;
        assert!(matches!(signer.sign(&payload), Err(AuthError::Issuance(_))));
    }

    #[test]
    fn test_wrong_secret() {
        let (clock, signer) = signer();
        let other = TokenSigner::new(
            &AuthConfig::default(),
            Arc::new(StaticSecrets::new(Some("another-secret"), None)),
            clock,
        );
        let token = other
            .sign(&other.payload_for(&user(), TokenType::Access).unwrap())
            .unwrap();
        assert!(matches!(
            signer.verify(&token, TokenType::Access, ExpiryMode::Enforce),
            Err(AuthError::TokenInvalidSignature)
        ));
    }

    #[test]
    fn test_malformed_tokens() {
        let (_, signer) = signer();
        for token in ["", "abc", "a.b", "a..c", "a.b.c.d", "not.a.token"] {
            assert!(
                matches!(
                    signer.verify(token, TokenType::Access, ExpiryMode::Enforce),
                    Err(AuthError::TokenMalformed)
                ),
                "{token:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_refresh_token_is_not_an_access_token() {
        let (_, signer) = signer();
        let payload = signer.payload_for(&user(), TokenType::Refresh).unwrap();
        let token = signer.sign(&payload).unwrap();

        // Distinct secrets: the access secret cannot verify it
        assert!(matches!(
            signer.verify(&token, TokenType::Access, ExpiryMode::Enforce),
            Err(AuthError::TokenInvalidSignature)
        ));
        assert!(signer
            .verify(&token, TokenType::Refresh, ExpiryMode::Enforce)
            .is_ok());
    }

    #[test]
    fn test_type_mismatch_with_shared_secret() {
        let clock = Arc::new(ManualClock::starting_now());
        let signer = TokenSigner::new(
            &AuthConfig::default(),
            Arc::new(StaticSecrets::new(Some("shared"), None)),
            clock,
        );
        let access = signer
            .sign(&signer.payload_for(&user(), TokenType::Access).unwrap())
            .unwrap();
        assert!(matches!(
            signer.verify(&access, TokenType::Refresh, ExpiryMode::Enforce),
            Err(AuthError::TokenTypeMismatch {
                expected: TokenType::Refresh
            })
        ));
    }

    #[test]
    fn test_missing_claims() {
        let (clock, signer) = signer();
        let exp = (clock.now() + Duration::minutes(5)).timestamp();
        let claims = serde_json::json!({
            "iss": "gatehouse",
            "aud": "gatehouse-clients",
            "iat": clock.now().timestamp(),
            "exp": exp,
            "sub": "42",
            "role": "client",
            "tvr": 0,
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"access-secret"),
        )
        .unwrap();

        match signer.verify(&token, TokenType::Access, ExpiryMode::Enforce) {
            Err(AuthError::TokenMissingClaims(claim)) => assert_eq!(claim, "jti"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_audience_mismatch() {
        let (clock, signer) = signer();
        let config = AuthConfig {
            audience: "someone-else".to_string(),
            ..Default::default()
        };
        let foreign = TokenSigner::new(
            &config,
            Arc::new(StaticSecrets::new(Some("access-secret"), None)),
            clock,
        );
        let token = foreign
            .sign(&foreign.payload_for(&user(), TokenType::Access).unwrap())
            .unwrap();
        assert!(matches!(
            signer.verify(&token, TokenType::Access, ExpiryMode::Enforce),
            Err(AuthError::TokenAudienceMismatch)
        ));
    }

    #[test]
    fn test_missing_secret_is_config_error() {
        let signer = TokenSigner::new(
            &AuthConfig::default(),
            Arc::new(StaticSecrets::default()),
            Arc::new(ManualClock::starting_now()),
        );
        let payload = signer.payload_for(&user(), TokenType::Access).unwrap();
        assert!(matches!(signer.sign(&payload), Err(AuthError::Config(_))));
    }

    #[test]
    fn test_issue_requires_user_id() {
        let (_, signer) = signer();
        let user = User { id: None, ..user() };
        assert!(matches!(
            signer.payload_for(&user, TokenType::Access),
            Err(AuthError::Issuance(_))
        ));
    }

    #[test]
    fn test_hash_token_is_stable_hex() {
        let hash = hash_token("abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("abc"));
        assert_ne!(hash, hash_token("abd"));
    }

    #[test]
    fn test_peek_unverified() {
        let (_, signer) = signer();
        let token = signer
            .sign(&signer.payload_for(&user(), TokenType::Refresh).unwrap())
            .unwrap();
        let claims = peek_unverified(&token).unwrap();
        assert_eq!(claims["sub"], "42");
        assert_eq!(claims["type"], "refresh");
        assert!(peek_unverified("garbage").is_err());
    }
}
