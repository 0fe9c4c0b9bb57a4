//! Server configuration.
//!
//! Layered the usual way: built-in defaults, then an optional TOML file,
//! then `VOXRELAY__*` environment entries, and finally the flat
//! deployment variables (`PORT`, `BRIDGE_TOKEN`, ...) that operators set
//! on the host, which always win.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use log::warn;
use serde::{Deserialize, Serialize};

/// Shipping this token to production is a misconfiguration.
pub const DEFAULT_BRIDGE_TOKEN: &str = "default-bridge-token";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub http: HttpSettings,
    pub bridge: BridgeSettings,
    pub tls: TlsSettings,
    /// Directory for persisted state (push tokens).
    pub data_dir: PathBuf,
    pub push: PushSettings,
    pub stt: SttSettings,
    pub local: LocalGatewaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    /// Bearer token required on `/api/*` when set.
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub port: u16,
    /// Shared secret bridges present in their register frame.
    pub token: String,
}

/// TLS material is validated at startup; termination itself happens in
/// the fronting listener, not in this process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Path to the FCM service-account JSON key.
    pub service_account: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    /// Recognizer WebSocket endpoint.
    pub upstream_url: String,
    /// Recognizer outputs matching any of these are suppressed.
    pub filler_phrases: Vec<String>,
}

/// Optional OpenAI-compatible gateway on this host; requests with
/// `instanceId == "local"` bypass the bridge fabric and go here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalGatewaySettings {
    pub url: Option<String>,
    pub token: Option<String>,
    pub name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            bridge: BridgeSettings::default(),
            tls: TlsSettings::default(),
            data_dir: PathBuf::from("/var/lib/voxrelay"),
            push: PushSettings::default(),
            stt: SttSettings::default(),
            local: LocalGatewaySettings::default(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            auth_token: None,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            port: 9090,
            token: DEFAULT_BRIDGE_TOKEN.to_string(),
        }
    }
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            upstream_url: "ws://127.0.0.1:2700".to_string(),
            filler_phrases: vec!["인식 중...".to_string(), "인식 중".to_string()],
        }
    }
}

impl Default for LocalGatewaySettings {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            name: "local".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the optional config file and the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let built = builder
            .add_source(Environment::with_prefix("VOXRELAY").separator("__"))
            .build()
            .context("assembling configuration")?;

        let mut settings: Settings = built
            .try_deserialize()
            .context("deserializing configuration")?;

        settings.apply_flat_env();
        Ok(settings)
    }

    /// Apply the documented flat environment variables.
    fn apply_flat_env(&mut self) {
        if let Some(port) = env_parsed::<u16>("PORT") {
            self.http.port = port;
        }
        if let Some(port) = env_parsed::<u16>("BRIDGE_PORT") {
            self.bridge.port = port;
        }
        if let Some(token) = env_nonempty("BRIDGE_TOKEN") {
            self.bridge.token = token;
        }
        if let Some(token) = env_nonempty("AUTH_TOKEN") {
            self.http.auth_token = Some(token);
        }
        if let Some(dir) = env_nonempty("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(enabled) = env_nonempty("TLS_ENABLED") {
            self.tls.enabled = enabled == "true" || enabled == "1";
        }
        if let Some(cert) = env_nonempty("TLS_CERT") {
            self.tls.cert = Some(PathBuf::from(cert));
        }
        if let Some(key) = env_nonempty("TLS_KEY") {
            self.tls.key = Some(PathBuf::from(key));
        }
        if let Some(path) = env_nonempty("FCM_SERVICE_ACCOUNT") {
            self.push.service_account = Some(PathBuf::from(path));
        }
        if let Some(url) = env_nonempty("LOCAL_OPENCLAW_URL") {
            self.local.url = Some(url);
        }
        if let Some(token) = env_nonempty("LOCAL_OPENCLAW_TOKEN") {
            self.local.token = Some(token);
        }
        if let Some(name) = env_nonempty("LOCAL_OPENCLAW_NAME") {
            self.local.name = name;
        }
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tls.enabled {
            let cert = self
                .tls
                .cert
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("TLS enabled but no certificate configured"))?;
            let key = self
                .tls
                .key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("TLS enabled but no private key configured"))?;

            if !cert.is_file() {
                bail!("TLS certificate not readable: {}", cert.display());
            }
            if !key.is_file() {
                bail!("TLS private key not readable: {}", key.display());
            }
        }

        if self.bridge.token == DEFAULT_BRIDGE_TOKEN {
            warn!("bridge token is the built-in default; set BRIDGE_TOKEN before exposing this server");
        }

        Ok(())
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }

    pub fn bridge_addr(&self) -> String {
        format!("{}:{}", self.http.host, self.bridge.port)
    }

    /// Whether the local-gateway bypass is configured.
    pub fn local_gateway_enabled(&self) -> bool {
        self.local.url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_nonempty(key)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.http.port, 8080);
        assert_eq!(settings.bridge.port, 9090);
        assert_eq!(settings.bridge.token, DEFAULT_BRIDGE_TOKEN);
        assert!(!settings.tls.enabled);
        assert!(!settings.local_gateway_enabled());
        assert!(settings
            .stt
            .filler_phrases
            .iter()
            .any(|phrase| phrase == "인식 중"));
    }

    #[test]
    fn test_flat_env_overrides() {
        std::env::set_var("PORT", "18080");
        std::env::set_var("BRIDGE_TOKEN", "hunter2");
        std::env::set_var("LOCAL_OPENCLAW_URL", "http://localhost:18789");

        let mut settings = Settings::default();
        settings.apply_flat_env();

        std::env::remove_var("PORT");
        std::env::remove_var("BRIDGE_TOKEN");
        std::env::remove_var("LOCAL_OPENCLAW_URL");

        assert_eq!(settings.http.port, 18080);
        assert_eq!(settings.bridge.token, "hunter2");
        assert!(settings.local_gateway_enabled());
    }

    #[test]
    fn test_validate_rejects_missing_tls_material() {
        let mut settings = Settings::default();
        settings.tls.enabled = true;
        assert!(settings.validate().is_err());

        settings.tls.cert = Some(PathBuf::from("/nonexistent/cert.pem"));
        settings.tls.key = Some(PathBuf::from("/nonexistent/key.pem"));
        assert!(settings.validate().is_err());
    }
}
