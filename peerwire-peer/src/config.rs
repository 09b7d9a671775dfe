//! Peer configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PEERWIRE_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default call timeout in milliseconds.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;

/// Peer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Call configuration.
    pub calls: CallConfig,
}

impl PeerConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PEERWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: PeerConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.auth.apply_env_overrides();
        self.calls.apply_env_overrides();
    }

    /// Loads secrets from external file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (user, hash) in &self.auth.credentials {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::ValidationError(format!(
                    "credential hash for user '{}' is not a SHA-256 hex digest",
                    user
                )));
            }
        }
        Ok(())
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// User presented to the remote in our handshake.
    pub user: String,
    /// Password presented to the remote in our handshake.
    pub password: String,
    /// Whether the remote must present credentials.
    pub required: bool,
    /// Accepted remote users, mapped to SHA-256 hex hashes of their passwords.
    pub credentials: BTreeMap<String, String>,
    /// Optional path to a secrets file with one `user:hash` pair per line.
    pub secrets_file: Option<PathBuf>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("PEERWIRE_AUTH_USER") {
            self.user = user;
        }

        if let Ok(password) = std::env::var("PEERWIRE_AUTH_PASSWORD") {
            self.password = password;
        }

        if let Ok(required) = std::env::var("PEERWIRE_AUTH_REQUIRED") {
            self.required = required == "1" || required.to_lowercase() == "true";
        }

        if let Ok(path) = std::env::var("PEERWIRE_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Loads credentials from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            for (n, line) in content.lines().enumerate() {
                let line = line.trim();
                // Skip empty lines and comments
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let (user, hash) = line.split_once(':').ok_or_else(|| {
                    ConfigError::ParseError(
                        path.clone(),
                        format!("line {}: expected user:hash", n + 1),
                    )
                })?;
                self.credentials
                    .insert(user.trim().to_string(), hash.trim().to_string());
            }
        }
        Ok(())
    }
}

/// Call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Default call timeout in milliseconds. Zero disables the timeout.
    pub timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

impl CallConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("PEERWIRE_CALL_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.timeout_ms = ms;
            }
        }
    }

    /// Returns the call timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialValidator;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PeerConfig::default();
        assert_eq!(config.calls.timeout(), Duration::from_secs(10));
        assert!(!config.auth.required);
        assert!(config.auth.user.is_empty());
        assert!(config.auth.credentials.is_empty());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = PeerConfig::default();
        config.auth.user = "alice".to_string();
        config.calls.timeout_ms = 250;

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: PeerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.auth.user, "alice");
        assert_eq!(parsed.calls.timeout_ms, 250);
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.yaml");
        std::fs::write(&path, "auth:\n  required: true\n").unwrap();

        let config = PeerConfig::from_file(&path).unwrap();
        assert!(config.auth.required);
        assert_eq!(config.calls.timeout_ms, DEFAULT_CALL_TIMEOUT_MS);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            PeerConfig::from_file(&missing),
            Err(ConfigError::IoError(..))
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "calls: [not, a, map]\n").unwrap();
        let err = PeerConfig::from_file(&bad).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.yaml");

        let mut config = PeerConfig::default();
        config.auth.credentials.insert(
            "bob".to_string(),
            CredentialValidator::hash_password("builder"),
        );
        config.save(&path).unwrap();

        let loaded = PeerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.auth.credentials, config.auth.credentials);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_load_secrets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# users").unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            "alice:{}",
            CredentialValidator::hash_password("wonderland")
        )
        .unwrap();

        let mut auth = AuthConfig {
            secrets_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        auth.load_secrets().unwrap();

        assert_eq!(auth.credentials.len(), 1);
        let validator = CredentialValidator::from_config(&auth);
        assert!(validator.validate("alice", "wonderland"));
    }

    #[test]
    fn test_load_secrets_malformed_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no-separator-here").unwrap();

        let mut auth = AuthConfig {
            secrets_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let err = auth.load_secrets().unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_load_with_env_overrides() {
        const VARS: [&str; 5] = [
            "PEERWIRE_CONFIG",
            "PEERWIRE_AUTH_USER",
            "PEERWIRE_AUTH_REQUIRED",
            "PEERWIRE_AUTH_SECRETS_FILE",
            "PEERWIRE_CALL_TIMEOUT_MS",
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.yaml");
        std::fs::write(
            &path,
            "auth:\n  user: from-file\n  password: pw\ncalls:\n  timeout_ms: 500\n",
        )
        .unwrap();

        // No other test touches these variables.
        std::env::set_var("PEERWIRE_CONFIG", &path);
        std::env::set_var("PEERWIRE_AUTH_USER", "from-env");
        std::env::set_var("PEERWIRE_AUTH_REQUIRED", "TRUE");
        std::env::set_var("PEERWIRE_CALL_TIMEOUT_MS", "250");
        let secrets = dir.path().join("secrets");
        std::fs::write(&secrets, format!("carol:{}\n", CredentialValidator::hash_password("x")))
            .unwrap();
        std::env::set_var("PEERWIRE_AUTH_SECRETS_FILE", &secrets);

        let mut config = PeerConfig::load().unwrap();
        config.load_secrets().unwrap();
        assert!(config.auth.credentials.contains_key("carol"));
        assert_eq!(config.auth.user, "from-env");
        assert_eq!(config.auth.password, "pw");
        assert!(config.auth.required);
        assert_eq!(config.calls.timeout(), Duration::from_millis(250));

        std::env::set_var("PEERWIRE_CALL_TIMEOUT_MS", "soon");
        std::env::set_var("PEERWIRE_AUTH_REQUIRED", "no");
        let config = PeerConfig::load().unwrap();
        assert_eq!(config.calls.timeout_ms, 500);
        assert!(!config.auth.required);

        std::env::remove_var("PEERWIRE_CONFIG");
        let config = PeerConfig::from_env();
        assert_eq!(config.auth.user, "from-env");
        assert_eq!(config.calls.timeout_ms, DEFAULT_CALL_TIMEOUT_MS);

        std::env::set_var("PEERWIRE_CONFIG", dir.path().join("missing.yaml"));
        assert!(matches!(PeerConfig::load(), Err(ConfigError::IoError(..))));

        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_validate_rejects_bad_hash() {
        let mut config = PeerConfig::default();
        config
            .auth
            .credentials
            .insert("eve".to_string(), "plaintext".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
