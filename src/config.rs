//! Mail-forwarding configuration.
//!
//! Settings live in the persisted key/value store; this is the read-only
//! snapshot taken when a dispatch (or a start validation) needs one.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::error::StoreError;
use crate::store::{Store, keys};

pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Snapshot of the mail settings.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Address forwarded messages are sent to.
    pub target_email: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    /// SMTP account; also used as the From address.
    pub username: String,
    pub password: SecretString,
}

impl ForwarderConfig {
    /// Load a snapshot from the settings store, applying defaults for the
    /// SMTP host/port.
    pub async fn load(store: &Arc<dyn Store>) -> Result<Self, StoreError> {
        let target_email = store.get(keys::TARGET_EMAIL).await?.unwrap_or_default();
        let smtp_host = store
            .get(keys::SMTP_HOST)
            .await?
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string());
        let smtp_port = store
            .get(keys::SMTP_PORT)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SMTP_PORT);
        let username = store.get(keys::USERNAME).await?.unwrap_or_default();
        let password = SecretString::from(store.get(keys::PASSWORD).await?.unwrap_or_default());

        Ok(Self {
            target_email,
            smtp_host,
            smtp_port,
            username,
            password,
        })
    }

    /// Names of the required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.target_email.is_empty() {
            missing.push(keys::TARGET_EMAIL);
        }
        if self.username.is_empty() {
            missing.push(keys::USERNAME);
        }
        if self.password.expose_secret().is_empty() {
            missing.push(keys::PASSWORD);
        }
        missing
    }

    /// True when target address, username and password are all set.
    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;

    async fn store() -> Arc<dyn Store> {
        Arc::new(LibSqlStore::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn load_applies_defaults() {
        let store = store().await;
        let config = ForwarderConfig::load(&store).await.unwrap();
        assert_eq!(config.smtp_host, DEFAULT_SMTP_HOST);
        assert_eq!(config.smtp_port, DEFAULT_SMTP_PORT);
        assert!(config.target_email.is_empty());
    }

    #[tokio::test]
    async fn missing_fields_lists_each_empty_required_key() {
        let store = store().await;
        store.set(keys::USERNAME, "me@gmail.com").await.unwrap();

        let config = ForwarderConfig::load(&store).await.unwrap();
        assert!(!config.is_complete());
        assert_eq!(config.missing_fields(), vec!["target_email", "password"]);
    }

    #[tokio::test]
    async fn complete_config() {
        let store = store().await;
        store.set(keys::TARGET_EMAIL, "to@example.com").await.unwrap();
        store.set(keys::USERNAME, "me@gmail.com").await.unwrap();
        store.set(keys::PASSWORD, "app-password").await.unwrap();
        store.set(keys::SMTP_PORT, "2525").await.unwrap();

        let config = ForwarderConfig::load(&store).await.unwrap();
        assert!(config.is_complete());
        assert_eq!(config.smtp_port, 2525);
    }

    #[tokio::test]
    async fn unparsable_port_falls_back_to_default() {
        let store = store().await;
        store.set(keys::SMTP_PORT, "not-a-port").await.unwrap();
        let config = ForwarderConfig::load(&store).await.unwrap();
        assert_eq!(config.smtp_port, DEFAULT_SMTP_PORT);
    }
}
