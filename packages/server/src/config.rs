//! Server configuration.
//!
//! A config file (`.json5` or `.json`) is read with `json5`, then
//! `SWITCHBOARD_*` environment variables are overlaid on top of it.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use switchboard_ws::connection::{ConnectionOptions, DispatchMode};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

/// Errors that can occur when loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] json5::Error),
    /// An environment variable holds a value that does not parse
    #[error("Invalid value for {name}: '{value}'")]
    InvalidEnv { name: &'static str, value: String },
    /// `useTls` is set without both certificate and key paths
    #[error("useTls requires tls.cert and tls.key")]
    MissingTls,
    /// `enablePubSub` is set without a backbone URL
    #[error("enablePubSub requires pubSub.url")]
    MissingPubSub,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    pub use_tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pub_sub: Option<PubSubConfig>,
    pub enable_pub_sub: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    pub dispatch: DispatchMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: None,
            use_tls: false,
            pub_sub: None,
            enable_pub_sub: false,
            idle_timeout_secs: None,
            dispatch: DispatchMode::default(),
        }
    }
}

impl Config {
    /// Loads a config file. A port of `0` is treated as unset.
    ///
    /// # Errors
    ///
    /// * If the file cannot be read
    /// * If the file is not valid JSON5
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::debug!("Loading config from {}", path.display());

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config file contents.
    ///
    /// # Errors
    ///
    /// * If the contents are not valid JSON5
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = json5::from_str(content)?;

        if config.port == 0 {
            config.port = DEFAULT_PORT;
        }

        Ok(config)
    }

    /// Picks `<dir>/switchboard.json5`, falling back to `<dir>/switchboard.json`.
    #[must_use]
    pub fn find_in(dir: &Path) -> Option<std::path::PathBuf> {
        ["switchboard.json5", "switchboard.json"]
            .into_iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Default configuration with the process environment overlaid.
    ///
    /// # Errors
    ///
    /// * If a `SWITCHBOARD_*` variable holds an invalid value
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlays the process environment.
    ///
    /// # Errors
    ///
    /// * If a `SWITCHBOARD_*` variable holds an invalid value
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Overlays variables looked up through `var`.
    ///
    /// # Errors
    ///
    /// * If a variable holds an invalid value
    pub fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = var("SWITCHBOARD_HOST") {
            self.host = host;
        }
        if let Some(port) = var("SWITCHBOARD_PORT") {
            self.port = parse_var("SWITCHBOARD_PORT", port)?;
        }

        let cert = var("SWITCHBOARD_TLS_CERT");
        let key = var("SWITCHBOARD_TLS_KEY");
        if cert.is_some() || key.is_some() {
            let tls = self.tls.get_or_insert_with(TlsConfig::default);
            if let Some(cert) = cert {
                tls.cert = cert;
            }
            if let Some(key) = key {
                tls.key = key;
            }
            self.use_tls = !tls.cert.is_empty() && !tls.key.is_empty();
        }

        if let Some(url) = var("SWITCHBOARD_REDIS_URL") {
            self.pub_sub = Some(PubSubConfig { url });
            self.enable_pub_sub = true;
        }
        if let Some(secs) = var("SWITCHBOARD_IDLE_TIMEOUT_SECS") {
            self.idle_timeout_secs = Some(parse_var("SWITCHBOARD_IDLE_TIMEOUT_SECS", secs)?);
        }
        if let Some(dispatch) = var("SWITCHBOARD_DISPATCH") {
            self.dispatch = parse_var("SWITCHBOARD_DISPATCH", dispatch)?;
        }

        Ok(())
    }

    /// # Errors
    ///
    /// * If `useTls` is set without a certificate and key
    /// * If `enablePubSub` is set without a backbone URL
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_tls
            && self
                .tls
                .as_ref()
                .is_none_or(|x| x.cert.is_empty() || x.key.is_empty())
        {
            return Err(ConfigError::MissingTls);
        }
        if self.enable_pub_sub && self.pub_sub_url().is_none() {
            return Err(ConfigError::MissingPubSub);
        }

        Ok(())
    }

    #[must_use]
    pub fn pub_sub_url(&self) -> Option<&str> {
        self.pub_sub
            .as_ref()
            .map(|x| x.url.as_str())
            .filter(|x| !x.is_empty())
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|x| *x > 0)
            .map(Duration::from_secs)
    }

    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            dispatch: self.dispatch,
            idle_timeout: self.idle_timeout(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test_log::test]
    fn parses_camel_case_json5_with_comments() {
        let config = Config::parse(
            r#"{
                // local cluster
                host: "127.0.0.1",
                port: 9000,
                useTls: true,
                tls: { cert: "cert.pem", key: "key.pem" },
                enablePubSub: true,
                pubSub: { url: "redis://127.0.0.1:6379" },
                idleTimeoutSecs: 30,
                dispatch: "sequential",
            }"#,
        )
        .unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(
            config.tls,
            Some(TlsConfig {
                cert: "cert.pem".to_string(),
                key: "key.pem".to_string(),
            })
        );
        assert_eq!(config.pub_sub_url(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.dispatch, DispatchMode::Sequential);
        config.validate().unwrap();
    }

    #[test_log::test]
    fn missing_fields_use_defaults_and_zero_port_is_unset() {
        let config = Config::parse("{ port: 0 }").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connection_options(), ConnectionOptions::default());
    }

    #[test_log::test]
    fn invalid_json5_is_a_parse_error() {
        assert!(matches!(
            Config::parse("{ port: "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test_log::test]
    fn load_reads_the_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.json5");
        std::fs::write(&path, "{ host: 'localhost' }").unwrap();

        assert_eq!(Config::find_in(dir.path()), Some(path.clone()));
        assert_eq!(Config::load(&path).unwrap().host, "localhost");
    }

    #[test_log::test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(Config::find_in(dir.path()), None);
        assert!(matches!(
            Config::load(dir.path().join("nope.json5")),
            Err(ConfigError::Read(_))
        ));
    }

    #[test_log::test]
    fn environment_overlays_file_values() {
        let mut config = Config::parse("{ host: 'file-host', port: 1234 }").unwrap();

        config
            .apply_vars(vars(&[
                ("SWITCHBOARD_PORT", "4321"),
                ("SWITCHBOARD_TLS_CERT", "c.pem"),
                ("SWITCHBOARD_TLS_KEY", "k.pem"),
                ("SWITCHBOARD_REDIS_URL", "redis://cache:6379"),
                ("SWITCHBOARD_IDLE_TIMEOUT_SECS", "5"),
                ("SWITCHBOARD_DISPATCH", "sequential"),
            ]))
            .unwrap();

        assert_eq!(config.host, "file-host");
        assert_eq!(config.port, 4321);
        assert!(config.use_tls);
        assert!(config.enable_pub_sub);
        assert_eq!(config.pub_sub_url(), Some("redis://cache:6379"));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.dispatch, DispatchMode::Sequential);
    }

    #[test_log::test]
    fn invalid_environment_value_names_the_variable() {
        let mut config = Config::default();

        let err = config
            .apply_vars(vars(&[("SWITCHBOARD_PORT", "eighty")]))
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                name: "SWITCHBOARD_PORT",
                ..
            }
        ));
    }

    #[test_log::test]
    fn validation_requires_tls_paths_and_pub_sub_url() {
        let config = Config {
            use_tls: true,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingTls)));

        let config = Config {
            enable_pub_sub: true,
            pub_sub: Some(PubSubConfig::default()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingPubSub)));
    }
}
