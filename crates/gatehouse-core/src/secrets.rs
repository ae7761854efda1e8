//! Signing secret lookup
//!
//! Access and refresh tokens may be signed with distinct secrets.

use crate::config::AuthConfig;
use crate::TokenType;

/// Supplies the HMAC secret for a token kind
pub trait SecretProvider: Send + Sync {
    /// `None` means no secret is configured for this kind
    fn secret(&self, kind: TokenType) -> Option<Vec<u8>>;
}

/// Secrets fixed at startup
#[derive(Clone, Default)]
pub struct StaticSecrets {
    access: Option<Vec<u8>>,
    refresh: Option<Vec<u8>>,
}

impl StaticSecrets {
    pub fn new(access: Option<&str>, refresh: Option<&str>) -> Self {
        let access = access.filter(|s| !s.is_empty()).map(|s| s.as_bytes().to_vec());
        let refresh = refresh.filter(|s| !s.is_empty()).map(|s| s.as_bytes().to_vec());
        Self { access, refresh }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.access_secret.as_deref(),
            config.refresh_secret.as_deref(),
        )
    }
}

impl std::fmt::Debug for StaticSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecrets")
            .field("access", &self.access.as_ref().map(|_| "<redacted>"))
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SecretProvider for StaticSecrets {
    fn secret(&self, kind: TokenType) -> Option<Vec<u8>> {
        match kind {
            TokenType::Access => self.access.clone(),
            TokenType::Refresh => self.refresh.clone().or_else(|| self.access.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_falls_back_to_access_secret() {
        let secrets = StaticSecrets::new(Some("a"), None);
        assert_eq!(secrets.secret(TokenType::Refresh), Some(b"a".to_vec()));

        let secrets = StaticSecrets::new(Some("a"), Some("r"));
        assert_eq!(secrets.secret(TokenType::Refresh), Some(b"r".to_vec()));
    }

    #[test]
    fn test_empty_secret_counts_as_missing() {
        let secrets = StaticSecrets::new(Some(""), None);
        assert!(secrets.secret(TokenType::Access).is_none());
        assert!(secrets.secret(TokenType::Refresh).is_none());
    }

    #[test]
    fn test_debug_redacts() {
        let secrets = StaticSecrets::new(Some("hunter2"), None);
        assert!(!format!("{secrets:?}").contains("hunter2"));
    }
}
