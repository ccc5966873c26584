mod pages;

use crate::booking::BookingRequest;
use crate::error::BookingError;
use crate::{AppState, AuthorizationSession};
use anyhow::Context;
use axum::body::Bytes;
use axum::extract::RawQuery;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json, Redirect};
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use url::Url;
use uuid::Uuid;

const SESSION_COOKIE: &str = "booking_session";
const SESSION_TTL_MINUTES: i64 = 10;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/test", get(test_form))
        .route("/health", get(health))
        .route("/authorize", get(authorize))
        .route("/oauth2callback", get(oauth2callback))
        .route("/add_event", post(add_event))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

async fn home() -> Html<&'static str> {
    Html(pages::HOME_PAGE)
}

async fn test_form() -> Html<&'static str> {
    Html(pages::TEST_PAGE)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn authorize(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    cleanup_sessions(&state);

    let context = state.oauth_client.begin_authorization();
    let session_id = Uuid::new_v4().to_string();

    {
        let mut sessions = state.auth_sessions.write();
        if let Some(previous) = session_id_from(&headers) {
            sessions.remove(&previous);
        }
        sessions.insert(
            session_id.clone(),
            AuthorizationSession {
                state: context.clone(),
                created_at: Utc::now(),
            },
        );
    }

    tracing::info!("redirecting browser to the authorization endpoint");
    let cookie = session_cookie(&session_id, state.config.uses_https());
    (
        [(SET_COOKIE, cookie)],
        Redirect::to(context.authorize_url.as_str()),
    )
}

async fn oauth2callback(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<impl IntoResponse, HandlerError> {
    // The pending request is consumed whatever the outcome.
    let session = session_id_from(&headers)
        .and_then(|id| state.auth_sessions.write().remove(&id))
        .ok_or_else(|| {
            BookingError::AuthStateMismatch(
                "no authorization request is pending for this browser session".into(),
            )
        })?;

    if session.created_at < Utc::now() - Duration::minutes(SESSION_TTL_MINUTES) {
        return Err(BookingError::AuthStateMismatch(
            "authorization request expired; start again from /authorize".into(),
        )
        .into());
    }

    let mut callback_url =
        Url::parse(&state.config.redirect_uri()).context("configured redirect uri is invalid")?;
    callback_url.set_query(query.as_deref());

    let credential = state
        .oauth_client
        .complete_authorization(&callback_url, &session.state)
        .await?;
    state.store_credential(&credential).await?;

    tracing::info!(
        has_refresh_token = credential.refresh_token.is_some(),
        "calendar account connected"
    );

    Ok((
        [(SET_COOKIE, expired_session_cookie())],
        Html(pages::CONNECTED_PAGE),
    ))
}

async fn add_event(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, HandlerError> {
    let event = BookingRequest::parse(&body)?.into_event()?;
    let credential = state.authorized_credential().await?;

    let link = state
        .google_calendar
        .create_event(&credential, &event)
        .await?;

    tracing::info!(
        event_id = link.event_id.as_deref().unwrap_or_default(),
        summary = %event.summary,
        "created calendar event"
    );

    Ok(Json(json!({
        "status": "success",
        "eventLink": link.html_link,
    })))
}

fn cleanup_sessions(state: &Arc<AppState>) {
    let cutoff = Utc::now() - Duration::minutes(SESSION_TTL_MINUTES);
    let mut sessions = state.auth_sessions.write();
    sessions.retain(|_, session| session.created_at > cutoff);
}

fn session_cookie(session_id: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={session_id}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
        SESSION_TTL_MINUTES * 60
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn expired_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0")
}

fn session_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .find_map(|cookie| {
            cookie
                .trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
                .filter(|id| !id.is_empty())
                .map(str::to_owned)
        })
}

fn status_for(err: &BookingError) -> StatusCode {
    match err {
        BookingError::AuthStateMismatch(_)
        | BookingError::TokenExchange(_)
        | BookingError::Validation(_) => StatusCode::BAD_REQUEST,
        BookingError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        BookingError::Upstream { status, .. } => StatusCode::from_u16(*status)
            .ok()
            .filter(StatusCode::is_client_error)
            .unwrap_or(StatusCode::BAD_GATEWAY),
        BookingError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        BookingError::Transport(_) => StatusCode::BAD_GATEWAY,
        BookingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug)]
pub struct HandlerError {
    code: StatusCode,
    message: String,
    retryable: bool,
    source: Option<anyhow::Error>,
}

impl HandlerError {
    fn new(code: StatusCode, message: impl Into<String>, source: Option<anyhow::Error>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
            source,
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> axum::response::Response {
        match &self.source {
            Some(source) if self.code.is_server_error() => {
                tracing::error!(
                    error = ?source,
                    status = %self.code,
                    "handler error: {}",
                    self.message
                );
            }
            _ => {
                tracing::warn!(status = %self.code, "handler error: {}", self.message);
            }
        }

        let mut body = json!({
            "error": self.message,
        });
        if self.retryable {
            body["retryable"] = json!(true);
        }
        (self.code, Json(body)).into_response()
    }
}

impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(value: E) -> Self {
        let err = value.into();
        let booking = err.downcast_ref::<BookingError>();
        let code = booking
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retryable = booking.is_some_and(BookingError::is_retryable);

        // Internal failures carry file paths and similar detail; those stay in the log.
        let message = if code == StatusCode::INTERNAL_SERVER_ERROR {
            "internal server error".to_owned()
        } else {
            err.to_string()
        };

        let mut handler_error = HandlerError::new(code, message, Some(err));
        handler_error.retryable = retryable;
        handler_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, GoogleConfig, OAuthConfig, ServerConfig, StorageConfig};
    use crate::oauth::storage::{CredentialStore, InMemoryCredentialStore};
    use crate::oauth::Credential;
    use axum::body::{to_bytes, Body};
    use axum::http::header::LOCATION;
    use axum::http::Request;
    use axum::response::Response;
    use serde_json::Value;
    use std::collections::{BTreeSet, HashMap};
    use tower::ServiceExt;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        state: Arc<AppState>,
        store: Arc<InMemoryCredentialStore>,
        router: Router,
    }

    fn harness(server: &MockServer) -> Harness {
        let config = AppConfig {
            server: ServerConfig::default(),
            oauth: OAuthConfig {
                client_id: Some("client".into()),
                client_secret: Some("secret".into()),
                token_url: format!("{}/token", server.uri()),
                ..OAuthConfig::default()
            },
            google: GoogleConfig {
                api_base: format!("{}/calendar/v3", server.uri()),
                request_timeout_secs: 5,
                ..GoogleConfig::default()
            },
            storage: StorageConfig {
                use_in_memory: true,
                ..StorageConfig::default()
            },
        };
        let store = Arc::new(InMemoryCredentialStore::new());
        let state = Arc::new(AppState::new(config, store.clone()).unwrap());
        let router = build_router(state.clone());
        Harness {
            state,
            store,
            router,
        }
    }

    fn credential(access_token: &str, expires_in: Duration) -> Credential {
        Credential {
            access_token: access_token.into(),
            refresh_token: Some("refresh".into()),
            token_expiry: Some(Utc::now() + expires_in),
            scopes: BTreeSet::from(["https://www.googleapis.com/auth/calendar".to_owned()]),
            client_id: "client".into(),
            client_secret: "secret".into(),
        }
    }

    fn booking(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/add_event")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn mount_calendar(server: &MockServer, bearer: &str, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/calendar/v3/calendars/primary/events"))
            .and(header("authorization", format!("Bearer {bearer}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "evt123",
                "htmlLink": "https://www.google.com/calendar/event?eid=evt123"
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    /// Runs `/authorize` and returns the session cookie and issued state.
    async fn start_authorization(harness: &Harness) -> (String, String) {
        let response = harness
            .router
            .clone()
            .oneshot(get("/authorize", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let location = Url::parse(response.headers()[LOCATION].to_str().unwrap()).unwrap();
        let params: HashMap<String, String> = location.query_pairs().into_owned().collect();
        let cookie = response.headers()[SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_owned();
        (cookie, params["state"].clone())
    }

    #[tokio::test]
    async fn home_page_links_both_flows() {
        let server = MockServer::start().await;
        let harness = harness(&server);

        let response = harness.router.oneshot(get("/", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains(r#"href="/authorize""#));
        assert!(page.contains(r#"href="/test""#));
    }

    #[tokio::test]
    async fn test_form_renders_results_as_text() {
        let server = MockServer::start().await;
        let harness = harness(&server);

        let response = harness.router.oneshot(get("/test", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains("fetch('/add_event'"));
        assert!(page.contains("message.textContent = text"));
        assert!(!page.contains("innerHTML"));
    }

    #[tokio::test]
    async fn missing_times_return_400_without_calling_calendar() {
        let server = MockServer::start().await;
        mount_calendar(&server, "access", 0).await;
        let harness = harness(&server);
        harness
            .store
            .save(&credential("access", Duration::hours(1)))
            .await
            .unwrap();

        for body in [
            json!({}),
            json!({"summary": "Test Dental Appointment"}),
            json!({"start_time": "2025-01-01T10:00:00Z"}),
            json!({"end_time": "2025-01-01T11:00:00Z", "summary": "x"}),
        ] {
            let response = harness.router.clone().oneshot(booking(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = json_body(response).await;
            assert_eq!(body["error"], "Missing start_time or end_time");
        }
    }

    #[tokio::test]
    async fn booking_without_credential_is_unauthorized() {
        let server = MockServer::start().await;
        mount_calendar(&server, "access", 0).await;
        let harness = harness(&server);

        let response = harness
            .router
            .oneshot(booking(json!({
                "summary": "Test Dental Appointment",
                "start_time": "2025-01-01T10:00:00Z",
                "end_time": "2025-01-01T11:00:00Z"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("/authorize"));
    }

    #[tokio::test]
    async fn booking_creates_event_in_primary_calendar() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calendar/v3/calendars/primary/events"))
            .and(header("authorization", "Bearer access"))
            .and(body_json(json!({
                "summary": "Test Dental Appointment",
                "start": {"dateTime": "2025-01-01T10:00:00Z", "timeZone": "UTC"},
                "end": {"dateTime": "2025-01-01T11:00:00Z", "timeZone": "UTC"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "evt123",
                "htmlLink": "https://www.google.com/calendar/event?eid=evt123"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let harness = harness(&server);
        harness
            .store
            .save(&credential("access", Duration::hours(1)))
            .await
            .unwrap();

        let response = harness
            .router
            .oneshot(booking(json!({
                "summary": "Test Dental Appointment",
                "start_time": "2025-01-01T10:00:00Z",
                "end_time": "2025-01-01T11:00:00Z"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(
            body["eventLink"],
            "https://www.google.com/calendar/event?eid=evt123"
        );
    }

    #[tokio::test]
    async fn concurrent_bookings_refresh_expired_token_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_calendar(&server, "fresh", 2).await;

        let harness = harness(&server);
        harness
            .store
            .save(&credential("stale", Duration::minutes(-5)))
            .await
            .unwrap();

        let body = json!({
            "start_time": "2025-01-01T10:00:00Z",
            "end_time": "2025-01-01T11:00:00Z"
        });
        let (first, second) = tokio::join!(
            harness.router.clone().oneshot(booking(body.clone())),
            harness.router.clone().oneshot(booking(body)),
        );
        assert_eq!(first.unwrap().status(), StatusCode::OK);
        assert_eq!(second.unwrap().status(), StatusCode::OK);

        let stored = harness.store.load().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh"));
    }

    #[tokio::test]
    async fn calendar_rejection_is_reported_with_provider_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calendar/v3/calendars/primary/events"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"code": 403, "message": "Insufficient Permission"}
            })))
            .mount(&server)
            .await;
        let harness = harness(&server);
        harness
            .store
            .save(&credential("access", Duration::hours(1)))
            .await
            .unwrap();

        let response = harness
            .router
            .oneshot(booking(json!({
                "start_time": "2025-01-01T11:00:00Z",
                "end_time": "2025-01-01T10:00:00Z"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(
            body["error"],
            "calendar service returned 403: Insufficient Permission"
        );
    }

    #[tokio::test]
    async fn authorize_issues_state_and_session_cookie() {
        let server = MockServer::start().await;
        let harness = harness(&server);

        let (cookie, state) = start_authorization(&harness).await;
        assert!(cookie.starts_with("booking_session="));
        assert!(!state.is_empty());

        let sessions = harness.state.auth_sessions.read();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.values().next().unwrap().state.csrf_state, state);
    }

    #[tokio::test]
    async fn callback_with_forged_state_persists_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let harness = harness(&server);
        let (cookie, _state) = start_authorization(&harness).await;

        let response = harness
            .router
            .clone()
            .oneshot(get("/oauth2callback?state=forged&code=abc", Some(&cookie)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("authorization state mismatch"));
        assert!(harness.store.load().await.unwrap().is_none());
        assert!(harness.state.auth_sessions.read().is_empty());
    }

    #[tokio::test]
    async fn callback_without_pending_session_is_rejected() {
        let server = MockServer::start().await;
        let harness = harness(&server);

        let response = harness
            .router
            .oneshot(get("/oauth2callback?state=any&code=abc", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(harness.store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn callback_persists_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=good-code"))
            .and(body_string_contains(
                "redirect_uri=http%3A%2F%2F127.0.0.1%3A5000%2Foauth2callback",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "refresh_token": "refresh",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let harness = harness(&server);
        let (cookie, state) = start_authorization(&harness).await;

        let response = harness
            .router
            .clone()
            .oneshot(get(
                &format!("/oauth2callback?state={state}&code=good-code"),
                Some(&cookie),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let stored = harness.store.load().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh"));

        let replay = harness
            .router
            .clone()
            .oneshot(get(
                &format!("/oauth2callback?state={state}&code=good-code"),
                Some(&cookie),
            ))
            .await
            .unwrap();
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn revoked_refresh_token_asks_for_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_calendar(&server, "stale", 0).await;

        let harness = harness(&server);
        harness
            .store
            .save(&credential("stale", Duration::minutes(-5)))
            .await
            .unwrap();

        let response = harness
            .router
            .oneshot(booking(json!({
                "start_time": "2025-01-01T10:00:00Z",
                "end_time": "2025-01-01T11:00:00Z"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("/authorize"));
        assert!(body.get("retryable").is_none());
    }

    #[tokio::test]
    async fn internal_error_detail_is_not_sent_to_clients() {
        let err = anyhow::anyhow!("failed to replace credential file /srv/app/token.json");
        let response = HandlerError::from(BookingError::Internal(err)).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body, json!({"error": "internal server error"}));
    }

    #[tokio::test]
    async fn transport_failures_are_marked_retryable() {
        let response =
            HandlerError::from(BookingError::Transport("connection reset".into())).into_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["retryable"], true);
        assert_eq!(body["error"], "transport error: connection reset");
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            "theme=dark; booking_session=abc-123; other=1".parse().unwrap(),
        );
        assert_eq!(session_id_from(&headers).as_deref(), Some("abc-123"));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "booking_session_old=zzz".parse().unwrap());
        assert!(session_id_from(&headers).is_none());
    }

    #[test]
    fn upstream_server_errors_map_to_bad_gateway() {
        let err = BookingError::Upstream {
            status: 503,
            message: "Backend Error".into(),
        };
        assert_eq!(status_for(&err), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&BookingError::Timeout {
                service: "calendar service"
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
