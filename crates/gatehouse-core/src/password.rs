//! Credential hashing for the login and registration flows
//!
//! Hashes are Argon2id PHC strings (salt and parameters embedded).

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("Failed to hash password: {0}")]
    HashingFailed(String),

    #[error("Failed to verify password: {0}")]
    VerificationFailed(String),

    #[error("Invalid password hash format")]
    InvalidHashFormat,
}

/// Argon2id cost parameters
#[derive(Debug, Clone)]
pub struct PasswordConfig {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Iterations
    pub time_cost: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost: 64 * 1024,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl PasswordConfig {
    fn hasher(&self) -> Result<Argon2<'static>, PasswordError> {
        let params = Params::new(self.memory_cost, self.time_cost, self.parallelism, Some(32))
            .map_err(|e| PasswordError::HashingFailed(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Hash with the default cost parameters
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    hash_password_with_config(password, &PasswordConfig::default())
}

/// Hash a plaintext password using Argon2id
///
/// # Arguments
///
/// * `password` - The plaintext password to hash
/// * `config` - Cost parameters; tests pass cheap ones
///
/// # Returns
///
/// * `Ok(String)` - PHC string (algorithm, parameters, salt and hash)
/// * `Err(PasswordError)` - Invalid parameters or hashing failure
pub fn hash_password_with_config(
    password: &str,
    config: &PasswordConfig,
) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = config
        .hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a plaintext password against a stored PHC string
///
/// Parameters are read from the hash itself, so hashes produced with any
/// [`PasswordConfig`] verify here.
///
/// # Returns
///
/// * `Ok(true)` - Password matches
/// * `Ok(false)` - Password does not match
/// * `Err(PasswordError)` - Malformed hash or verifier failure
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed = PasswordHash::new(hash).map_err(|_| PasswordError::InvalidHashFormat)?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::VerificationFailed(e.to_string())),
    }
}

/// Minimum strength accepted at registration
///
/// At least 8 characters with upper case, lower case, a digit and a symbol.
pub fn validate_password_strength(password: &str) -> Result<(), String> {
    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }
    let checks: [(fn(char) -> bool, &str); 4] = [
        (char::is_uppercase, "an uppercase letter"),
        (char::is_lowercase, "a lowercase letter"),
        (|c| c.is_ascii_digit(), "a digit"),
        (|c| !c.is_alphanumeric(), "a special character"),
    ];
    for (check, what) in checks {
        if !password.chars().any(check) {
            return Err(format!("Password must contain at least {what}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cheap parameters keep the suite fast
    fn light() -> PasswordConfig {
        PasswordConfig {
            memory_cost: 8 * 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password_with_config("SecureP@ssw0rd!", &light()).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("SecureP@ssw0rd!", &hash).unwrap());
        assert!(!verify_password("WrongPassword", &hash).unwrap());
    }

    #[test]
    fn test_salted() {
        let a = hash_password_with_config("Same1!pass", &light()).unwrap();
        let b = hash_password_with_config("Same1!pass", &light()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_hash_format() {
        assert!(matches!(
            verify_password("password", "not-a-phc-string"),
            Err(PasswordError::InvalidHashFormat)
        ));
    }

    #[test]
    fn test_password_strength() {
        assert!(validate_password_strength("SecureP@ssw0rd!").is_ok());
        assert!(validate_password_strength("Abc123!").is_err());
        assert!(validate_password_strength("password123!").is_err());
        assert!(validate_password_strength("PASSWORD123!").is_err());
        assert!(validate_password_strength("Password!").is_err());
        assert!(validate_password_strength("Password123").is_err());
    }
}
