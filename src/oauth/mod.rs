pub mod storage;

use crate::config::ClientRegistration;
use crate::error::BookingError;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{
    BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicTokenResponse,
};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration as StdDuration;
use url::Url;

/// Access tokens this close to expiry are treated as already expired.
const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContext {
    pub authorize_url: Url,
    pub csrf_state: String,
    pub pkce_verifier: String,
}

/// The single stored OAuth credential. Field names on disk follow Google's
/// authorized-user token file so existing `token.json` files load as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiry", default)]
    pub token_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    pub client_id: String,
    pub client_secret: String,
}

impl Credential {
    /// A credential without an expiry is treated as valid until the provider
    /// says otherwise.
    pub fn is_expired(&self) -> bool {
        match self.token_expiry {
            Some(expiry) => Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) >= expiry,
            None => false,
        }
    }
}

pub struct OAuthClient {
    client: BasicClient,
    client_id: String,
    client_secret: String,
    scopes: Vec<Scope>,
    timeout: StdDuration,
}

impl OAuthClient {
    pub fn new(
        registration: &ClientRegistration,
        scopes: &[String],
        redirect_uri: &str,
        timeout: StdDuration,
    ) -> Result<Self> {
        let auth_url = AuthUrl::new(registration.auth_url.clone())
            .map_err(|e| anyhow!("invalid auth url: {e}"))?;
        let token_url = TokenUrl::new(registration.token_url.clone())
            .map_err(|e| anyhow!("invalid token url: {e}"))?;
        let redirect = RedirectUrl::new(redirect_uri.to_owned())
            .map_err(|err| anyhow!("invalid redirect url: {err}"))?;

        if !registration.allows_redirect(redirect_uri) {
            tracing::warn!(
                redirect_uri = %redirect_uri,
                "redirect uri is not among the registered redirect uris; the provider will reject it"
            );
        }

        let client = BasicClient::new(
            ClientId::new(registration.client_id.clone()),
            Some(ClientSecret::new(registration.client_secret.clone())),
            auth_url,
            Some(token_url),
        )
        .set_redirect_uri(redirect)
        .set_auth_type(oauth2::AuthType::RequestBody);

        let scopes = scopes.iter().cloned().map(Scope::new).collect::<Vec<_>>();

        Ok(Self {
            client,
            client_id: registration.client_id.clone(),
            client_secret: registration.client_secret.clone(),
            scopes,
            timeout,
        })
    }

    /// Builds the provider URL the browser is sent to. Offline access plus a
    /// forced consent prompt make the provider issue a refresh token even when
    /// the account already granted access before.
    pub fn begin_authorization(&self) -> AuthorizationContext {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = self
            .client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge)
            .add_extra_param("access_type", "offline")
            .add_extra_param("include_granted_scopes", "true")
            .add_extra_param("prompt", "consent");

        for scope in &self.scopes {
            request = request.add_scope(scope.clone());
        }

        let (authorize_url, csrf_state) = request.url();

        AuthorizationContext {
            authorize_url,
            csrf_state: csrf_state.secret().to_owned(),
            pkce_verifier: pkce_verifier.secret().to_owned(),
        }
    }

    pub async fn complete_authorization(
        &self,
        callback_url: &Url,
        expected: &AuthorizationContext,
    ) -> Result<Credential, BookingError> {
        let params: HashMap<String, String> = callback_url.query_pairs().into_owned().collect();

        let state = params.get("state").ok_or_else(|| {
            BookingError::AuthStateMismatch("callback is missing the state parameter".into())
        })?;
        if *state != expected.csrf_state {
            return Err(BookingError::AuthStateMismatch(
                "state does not match the pending authorization request".into(),
            ));
        }

        if let Some(error) = params.get("error") {
            return Err(BookingError::TokenExchange(format!(
                "provider denied authorization: {error}"
            )));
        }

        let code = params.get("code").ok_or_else(|| {
            BookingError::TokenExchange("callback is missing the authorization code".into())
        })?;

        let exchange = self
            .client
            .exchange_code(AuthorizationCode::new(code.clone()))
            .set_pkce_verifier(PkceCodeVerifier::new(expected.pkce_verifier.clone()))
            .request_async(async_http_client);
        let response = self.within_deadline(exchange, map_token_error).await?;

        let scopes = self.scopes.iter().map(|s| s.as_str().to_owned()).collect();
        Ok(self.credential_from(&response, None, scopes))
    }

    /// Returns the credential untouched while its access token is still valid;
    /// otherwise trades the refresh token for a new access token.
    pub async fn ensure_valid(&self, credential: Credential) -> Result<Credential, BookingError> {
        if !credential.is_expired() {
            return Ok(credential);
        }

        let refresh_token = credential.refresh_token.clone().ok_or_else(|| {
            BookingError::Unauthorized(
                "access token is expired and no refresh token is stored. Visit /authorize first."
                    .into(),
            )
        })?;

        let refresh_secret = RefreshToken::new(refresh_token.clone());
        let refresh = self
            .client
            .exchange_refresh_token(&refresh_secret)
            .request_async(async_http_client);
        let response = self.within_deadline(refresh, map_refresh_error).await?;

        let refreshed = self.credential_from(&response, Some(refresh_token), credential.scopes);
        tracing::info!(
            expires_at = ?refreshed.token_expiry,
            rotated = refreshed.refresh_token != credential.refresh_token,
            "refreshed access token"
        );
        Ok(refreshed)
    }

    async fn within_deadline<F, RE, M>(
        &self,
        exchange: F,
        map_error: M,
    ) -> Result<BasicTokenResponse, BookingError>
    where
        F: Future<Output = Result<BasicTokenResponse, RequestTokenError<RE, BasicErrorResponse>>>,
        RE: std::error::Error + 'static,
        M: FnOnce(RequestTokenError<RE, BasicErrorResponse>) -> BookingError,
    {
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result.map_err(map_error),
            Err(_) => Err(BookingError::Timeout {
                service: "OAuth token endpoint",
            }),
        }
    }

    fn credential_from(
        &self,
        response: &BasicTokenResponse,
        previous_refresh_token: Option<String>,
        previous_scopes: BTreeSet<String>,
    ) -> Credential {
        let refresh_token = response
            .refresh_token()
            .map(|token| token.secret().to_owned())
            .or(previous_refresh_token);
        let token_expiry = response
            .expires_in()
            .map(|duration| Utc::now() + Duration::from_std(duration).unwrap_or_default());
        let scopes = match response.scopes() {
            Some(granted) => granted.iter().map(|s| s.as_str().to_owned()).collect(),
            None => previous_scopes,
        };

        Credential {
            access_token: response.access_token().secret().to_owned(),
            refresh_token,
            token_expiry,
            scopes,
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }
}

fn map_token_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> BookingError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            BookingError::TokenExchange(response.to_string())
        }
        RequestTokenError::Request(source) => BookingError::Transport(source.to_string()),
        RequestTokenError::Parse(source, _) => {
            BookingError::TokenExchange(format!("malformed token response: {source}"))
        }
        RequestTokenError::Other(message) => BookingError::TokenExchange(message),
    }
}

/// A refresh token the provider no longer honours leaves no usable
/// credential, so the operator has to authorize again.
fn map_refresh_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> BookingError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response)
            if *response.error() == BasicErrorResponseType::InvalidGrant =>
        {
            BookingError::Unauthorized(format!(
                "stored refresh token was rejected ({response}). Visit /authorize first."
            ))
        }
        other => map_token_error(other),
    }
}
