//! Client configuration file
//!
//! ```json
//! { "token": "secret", "address": "localhost:8001" }
//! ```

use crate::ClientError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "relay-client.json";
pub const DEFAULT_ADDRESS: &str = "localhost:8001";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_address")]
    pub address: String,
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            address: default_address(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Like [`ClientConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ClientError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Command line values win over the file.
    pub fn with_overrides(mut self, token: Option<String>, address: Option<String>) -> Self {
        if let Some(token) = token {
            self.token = token;
        }
        if let Some(address) = address {
            self.address = address;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.token.trim().is_empty() {
            return Err(ClientError::Config(
                "no token configured (set \"token\" in the config file or pass --token)".into(),
            ));
        }
        if self.address.trim().is_empty() {
            return Err(ClientError::Config("no relay address configured".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_fills_default_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, r#"{"token":"t-alice"}"#).unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.token, "t-alice");
        assert_eq!(config.address, DEFAULT_ADDRESS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults_and_flags_override() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_or_default(&dir.path().join("absent.json"))
            .unwrap()
            .with_overrides(Some("t-bob".into()), Some("relay:9000".into()));

        assert_eq!(config.token, "t-bob");
        assert_eq!(config.address, "relay:9000");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, "token: yaml").unwrap();

        assert!(matches!(
            ClientConfig::load(&path),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_empty_token_is_rejected() {
        assert!(matches!(
            ClientConfig::default().validate(),
            Err(ClientError::Config(_))
        ));
    }
}
