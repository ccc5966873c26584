use anyhow::{anyhow, Context, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_bind_address")]
    pub bind_address: String,
    #[serde(default = "ServerConfig::default_public_url")]
    pub public_url: String,
}

impl ServerConfig {
    fn default_bind_address() -> String {
        "127.0.0.1:5000".to_owned()
    }

    fn default_public_url() -> String {
        "http://127.0.0.1:5000".to_owned()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: Self::default_bind_address(),
            public_url: Self::default_public_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Google client-secrets document, usually injected through the environment.
    #[serde(default)]
    pub client_secrets_json: Option<String>,
    #[serde(default)]
    pub client_secrets_path: Option<String>,
    #[serde(default = "OAuthConfig::default_auth_url")]
    pub auth_url: String,
    #[serde(default = "OAuthConfig::default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default = "OAuthConfig::default_scopes")]
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    fn default_auth_url() -> String {
        "https://accounts.google.com/o/oauth2/auth".to_owned()
    }

    fn default_token_url() -> String {
        "https://oauth2.googleapis.com/token".to_owned()
    }

    fn default_scopes() -> Vec<String> {
        vec!["https://www.googleapis.com/auth/calendar".to_owned()]
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            client_secrets_json: None,
            client_secrets_path: None,
            auth_url: Self::default_auth_url(),
            token_url: Self::default_token_url(),
            redirect_uri: None,
            scopes: Self::default_scopes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    #[serde(default = "GoogleConfig::default_api_base")]
    pub api_base: String,
    #[serde(default = "GoogleConfig::default_calendar_id")]
    pub calendar_id: String,
    #[serde(default = "GoogleConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl GoogleConfig {
    fn default_api_base() -> String {
        "https://www.googleapis.com/calendar/v3".to_owned()
    }

    fn default_calendar_id() -> String {
        "primary".to_owned()
    }

    fn default_request_timeout_secs() -> u64 {
        30
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            api_base: Self::default_api_base(),
            calendar_id: Self::default_calendar_id(),
            request_timeout_secs: Self::default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_credential_path")]
    pub credential_path: String,
    #[serde(default)]
    pub use_in_memory: bool,
}

impl StorageConfig {
    fn default_credential_path() -> String {
        "token.json".to_owned()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credential_path: Self::default_credential_path(),
            use_in_memory: false,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let builder = Config::builder()
            .add_source(File::with_name("config/config").required(false))
            .add_source(File::with_name("config/config.local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        let cfg = builder.build()?;
        cfg.try_deserialize().map_err(|err: ConfigError| err.into())
    }

    /// OAuth providers compare the redirect URI byte for byte against the
    /// registered one, so it must match the environment the server runs in.
    pub fn redirect_uri(&self) -> String {
        match &self.oauth.redirect_uri {
            Some(uri) => uri.clone(),
            None => format!(
                "{}/oauth2callback",
                self.server.public_url.trim_end_matches('/')
            ),
        }
    }

    pub fn uses_https(&self) -> bool {
        self.server.public_url.starts_with("https://")
    }
}

/// OAuth client registration issued by the provider's developer console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsDocument {
    #[serde(alias = "installed")]
    web: ClientSecretsEntry,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsEntry {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    auth_uri: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

impl ClientRegistration {
    /// Resolves the registration once at startup: an inline secrets document
    /// wins over a secrets file, which wins over bare client id/secret values.
    pub fn resolve(oauth: &OAuthConfig) -> Result<Self> {
        if let Some(raw) = oauth.client_secrets_json.as_deref() {
            return Self::from_secrets_json(raw, oauth)
                .context("failed to parse inline client secrets document");
        }

        if let Some(path) = oauth.client_secrets_path.as_deref() {
            return Self::from_secrets_file(path, oauth);
        }

        match (&oauth.client_id, &oauth.client_secret) {
            (Some(client_id), Some(client_secret)) => Ok(Self {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                auth_url: oauth.auth_url.clone(),
                token_url: oauth.token_url.clone(),
                redirect_uris: oauth.redirect_uri.iter().cloned().collect(),
            }),
            _ => Err(anyhow!(
                "no OAuth client registration configured; set oauth.client_secrets_json, \
                 oauth.client_secrets_path, or oauth.client_id and oauth.client_secret"
            )),
        }
    }

    pub fn from_secrets_file(path: impl AsRef<Path>, oauth: &OAuthConfig) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read client secrets from {}", path.display()))?;
        Self::from_secrets_json(&raw, oauth)
            .with_context(|| format!("failed to parse client secrets in {}", path.display()))
    }

    pub fn from_secrets_json(raw: &str, oauth: &OAuthConfig) -> Result<Self> {
        let document: ClientSecretsDocument = serde_json::from_str(raw)?;
        let entry = document.web;
        Ok(Self {
            client_id: entry.client_id,
            client_secret: entry.client_secret,
            auth_url: entry.auth_uri.unwrap_or_else(|| oauth.auth_url.clone()),
            token_url: entry.token_uri.unwrap_or_else(|| oauth.token_url.clone()),
            redirect_uris: entry.redirect_uris,
        })
    }

    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.is_empty() || self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }
}
