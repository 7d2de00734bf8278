use crate::domain::error::{AppError, Result};
use keyring::Entry;

pub const KEYCHAIN_SERVICE: &str = "sqlnav";

/// Resolves secret references against the environment or the OS keychain,
/// so configuration files only ever name a secret.
pub struct KeyringManager {
    service: String,
}

impl KeyringManager {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn keychain_lookup(&self, key: &str) -> Result<String> {
        Entry::new(&self.service, key)
            .and_then(|entry| entry.get_password())
            .map_err(|e| {
                AppError::Security(format!(
                    "No keychain secret '{}' under service '{}': {}",
                    key, self.service, e
                ))
            })
    }

    /// Resolves a secret reference.
    ///
    /// - `env:NAME` reads the environment variable `NAME`
    /// - `keychain:KEY` reads `KEY` from the OS keychain under this service
    /// - `plain:VALUE` returns `VALUE` (development only)
    /// - anything else is taken literally
    pub fn resolve(&self, reference: &str) -> Result<String> {
        match reference.split_once(':') {
            Some(("env", name)) => std::env::var(name).map_err(|_| {
                AppError::Config(format!("Environment variable '{}' is not set", name))
            }),
            Some(("keychain", key)) => self.keychain_lookup(key),
            Some(("plain", value)) => Ok(value.to_string()),
            _ => Ok(reference.to_string()),
        }
    }
}

impl Default for KeyringManager {
    fn default() -> Self {
        Self::new(KEYCHAIN_SERVICE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_env_reference() {
        std::env::set_var("SQLNAV_TEST_SECRET", "secret123");
        let manager = KeyringManager::default();
        assert_eq!(manager.resolve("env:SQLNAV_TEST_SECRET").unwrap(), "secret123");
        std::env::remove_var("SQLNAV_TEST_SECRET");
        assert!(matches!(
            manager.resolve("env:SQLNAV_TEST_SECRET"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_plain_and_literal() {
        let manager = KeyringManager::default();
        assert_eq!(manager.resolve("plain:hunter2").unwrap(), "hunter2");
        assert_eq!(manager.resolve("plain:a:b").unwrap(), "a:b");
        assert_eq!(manager.resolve("direct_password").unwrap(), "direct_password");
        assert_eq!(
            manager.resolve("postgres://u:p@h/db").unwrap(),
            "postgres://u:p@h/db"
        );
    }
}
