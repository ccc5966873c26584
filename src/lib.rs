pub mod booking;
pub mod config;
pub mod error;
pub mod google_calendar;
pub mod handlers;
pub mod oauth;

use anyhow::Result;
use config::{AppConfig, ClientRegistration};
use error::BookingError;
use google_calendar::GoogleCalendarClient;
use oauth::{storage::CredentialStore, AuthorizationContext, Credential, OAuthClient};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

use chrono::{DateTime, Utc};

pub struct AppState {
    pub config: AppConfig,
    pub oauth_client: OAuthClient,
    pub google_calendar: GoogleCalendarClient,
    pub credential_store: Arc<dyn CredentialStore>,
    /// Pending authorizations keyed by the browser session id.
    pub auth_sessions: Arc<RwLock<HashMap<String, AuthorizationSession>>>,
    credential_guard: Mutex<()>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let registration = ClientRegistration::resolve(&config.oauth)?;
        let timeout = config.google.request_timeout();
        let oauth_client = OAuthClient::new(
            &registration,
            &config.oauth.scopes,
            &config.redirect_uri(),
            timeout,
        )?;
        let google_calendar = GoogleCalendarClient::new(&config.google.api_base, timeout)?
            .with_calendar(config.google.calendar_id.clone());

        Ok(Self {
            config,
            oauth_client,
            google_calendar,
            credential_store: store,
            auth_sessions: Arc::new(RwLock::new(HashMap::new())),
            credential_guard: Mutex::new(()),
        })
    }

    /// Loads the stored credential, refreshing and re-saving it when the access
    /// token has expired. Serialized so concurrent callers never refresh twice
    /// or overwrite a newer token with an older one.
    pub async fn authorized_credential(&self) -> Result<Credential, BookingError> {
        let _guard = self.credential_guard.lock().await;

        let stored = self
            .credential_store
            .load()
            .await?
            .ok_or_else(BookingError::not_authorized)?;

        if !stored.is_expired() {
            return Ok(stored);
        }

        let refreshed = self.oauth_client.ensure_valid(stored).await?;
        self.credential_store.save(&refreshed).await?;
        Ok(refreshed)
    }

    pub async fn store_credential(&self, credential: &Credential) -> Result<(), BookingError> {
        let _guard = self.credential_guard.lock().await;
        self.credential_store.save(credential).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationSession {
    pub state: AuthorizationContext,
    pub created_at: DateTime<Utc>,
}
