//! Push delivery via FCM HTTP v1.
//!
//! Used as the fallback when a notification finds no live WebSocket
//! client. Device tokens are persisted under the data directory so they
//! survive restarts; the OAuth2 access token is cached until shortly
//! before the provider-reported expiry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

const FIREBASE_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_LIFETIME_SECS: i64 = 3600;

/// Refresh this long before the provider says the token expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Service-account key file as issued by the provider.
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    project_id: String,
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: String,
}

struct ServiceAccount {
    project_id: String,
    client_email: String,
    token_uri: String,
    key: EncodingKey,
}

impl ServiceAccount {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading service account key {}", path.display()))?;
        let sa: ServiceAccountKey =
            serde_json::from_str(&raw).context("parsing service account key")?;
        let key = EncodingKey::from_rsa_pem(sa.private_key.as_bytes())
            .context("parsing service account private key")?;

        let token_uri = if sa.token_uri.is_empty() {
            DEFAULT_TOKEN_URI.to_string()
        } else {
            sa.token_uri
        };

        Ok(Self {
            project_id: sa.project_id,
            client_email: sa.client_email,
            token_uri,
            key,
        })
    }
}

#[derive(Serialize)]
struct OauthClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// FCM push gateway with a persisted `instanceId -> device token` map.
pub struct PushGateway {
    tokens: RwLock<HashMap<String, String>>,
    tokens_path: PathBuf,
    account: Option<ServiceAccount>,
    http: reqwest::Client,
    access: Mutex<Option<CachedToken>>,
}

impl PushGateway {
    /// Build the gateway. A missing or broken service-account key leaves
    /// push disabled but never prevents startup.
    pub fn new(data_dir: &Path, service_account: Option<&Path>) -> Self {
        let tokens_path = data_dir.join("fcm_tokens.json");
        let tokens = load_tokens(&tokens_path);

        let account = service_account.and_then(|path| match ServiceAccount::load(path) {
            Ok(account) => {
                info!(
                    "push service account loaded: {} (project {})",
                    account.client_email, account.project_id
                );
                Some(account)
            }
            Err(err) => {
                warn!("push service account unavailable: {err:#}");
                None
            }
        });

        Self {
            tokens: RwLock::new(tokens),
            tokens_path,
            account,
            http: reqwest::Client::new(),
            access: Mutex::new(None),
        }
    }

    /// Store a device token for an instance; empty ids land on "default".
    pub fn register_token(&self, instance_id: &str, token: &str) {
        let key = if instance_id.is_empty() {
            "default"
        } else {
            instance_id
        };
        self.tokens
            .write()
            .unwrap()
            .insert(key.to_string(), token.to_string());
        self.save_tokens();
        info!("push token registered for instance {key}");
    }

    pub fn token_count(&self) -> usize {
        self.tokens.read().unwrap().len()
    }

    fn save_tokens(&self) {
        let snapshot = self.tokens.read().unwrap().clone();
        let data = match serde_json::to_vec_pretty(&snapshot) {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to serialize push tokens: {err}");
                return;
            }
        };
        if let Some(parent) = self.tokens_path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("failed to create data directory {}: {err}", parent.display());
                return;
            }
        }
        if let Err(err) = std::fs::write(&self.tokens_path, data) {
            warn!(
                "failed to persist push tokens to {}: {err}",
                self.tokens_path.display()
            );
        }
    }

    /// Push to every registered device. Returns the last error if any
    /// delivery failed.
    pub async fn send(&self, title: &str, body: &str) -> Result<()> {
        let targets: Vec<(String, String)> = self
            .tokens
            .read()
            .unwrap()
            .iter()
            .map(|(id, token)| (id.clone(), token.clone()))
            .collect();
        if targets.is_empty() {
            bail!("no push tokens registered");
        }

        let mut last_err = None;
        for (instance_id, token) in targets {
            match self.send_to_token(&token, title, body).await {
                Ok(()) => info!("push sent to {instance_id}"),
                Err(err) => {
                    warn!("push to {instance_id} failed: {err:#}");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Push to one instance, falling back to "default" and then to any
    /// registered token.
    pub async fn send_to(&self, instance_id: &str, title: &str, body: &str) -> Result<()> {
        let token = self
            .resolve_token(instance_id)
            .context("no push token available")?;
        self.send_to_token(&token, title, body).await
    }

    fn resolve_token(&self, instance_id: &str) -> Option<String> {
        let tokens = self.tokens.read().unwrap();
        tokens
            .get(instance_id)
            .or_else(|| tokens.get("default"))
            .or_else(|| tokens.values().next())
            .cloned()
    }

    async fn send_to_token(&self, token: &str, title: &str, body: &str) -> Result<()> {
        let account = self
            .account
            .as_ref()
            .context("no push service account loaded")?;
        let access_token = self.access_token().await?;

        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            account.project_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&message_payload(token, title, body))
            .send()
            .await
            .context("sending push request")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("push provider error {status}: {detail}");
        }
        Ok(())
    }

    /// OAuth2 access token, refreshed when the cached one is near expiry.
    async fn access_token(&self) -> Result<String> {
        let account = self
            .account
            .as_ref()
            .context("no push service account loaded")?;

        let mut cached = self.access.lock().await;
        if let Some(entry) = cached.as_ref() {
            if Instant::now() < entry.expires_at {
                return Ok(entry.token.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = OauthClaims {
            iss: &account.client_email,
            scope: FIREBASE_SCOPE,
            aud: &account.token_uri,
            iat: now,
            exp: now + JWT_LIFETIME_SECS,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &account.key)
            .context("signing service account assertion")?;

        let response = self
            .http
            .post(&account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("exchanging assertion for access token")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("token endpoint error {status}: {detail}");
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("parsing access token response")?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        info!("push access token refreshed, valid {}s", token.expires_in);
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }
}

/// FCM v1 message body.
fn message_payload(token: &str, title: &str, body: &str) -> serde_json::Value {
    json!({
        "message": {
            "token": token,
            "notification": {
                "title": title,
                "body": body,
            },
            "data": {
                "title": title,
                "message": body,
            },
            "android": {
                "priority": "high",
            },
        }
    })
}

fn load_tokens(path: &Path) -> HashMap<String, String> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, String>>(&raw) {
        Ok(tokens) => {
            info!("loaded {} push tokens", tokens.len());
            tokens
        }
        Err(err) => {
            warn!("ignoring corrupt push token store {}: {err}", path.display());
            HashMap::new()
        }
    }
}
