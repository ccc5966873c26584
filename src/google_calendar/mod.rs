use crate::error::BookingError;
use crate::oauth::Credential;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Clone)]
pub struct GoogleCalendarClient {
    http: Client,
    api_base: Url,
    calendar_id: String,
}

impl GoogleCalendarClient {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("calendar-booking/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build calendar http client")?;

        let mut normalized = api_base.trim().to_owned();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }

        let api_base = Url::parse(&normalized)
            .with_context(|| format!("invalid calendar api base url: {api_base}"))?;

        Ok(Self {
            http,
            api_base,
            calendar_id: "primary".to_owned(),
        })
    }

    pub fn with_calendar(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = calendar_id.into();
        self
    }

    fn events_url(&self) -> Result<Url> {
        let encoded_calendar = urlencoding::encode(&self.calendar_id);
        let joined = self
            .api_base
            .join(&format!("calendars/{encoded_calendar}/events"))
            .context("failed to compose calendar endpoint")?;
        Ok(joined)
    }

    /// Inserts one event. Time ordering is left to the calendar service,
    /// which rejects inverted ranges itself.
    pub async fn create_event(
        &self,
        credential: &Credential,
        event: &NewEvent,
    ) -> Result<EventLink, BookingError> {
        let url = self.events_url()?;

        let response = self
            .http
            .post(url)
            .bearer_auth(&credential.access_token)
            .json(event)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BookingError::Upstream {
                status: status.as_u16(),
                message: upstream_message(status, &body),
            });
        }

        let created = response
            .json::<CalendarEvent>()
            .await
            .map_err(transport_error)?;

        match created.html_link {
            Some(link) if !link.is_empty() => Ok(EventLink {
                event_id: created.id,
                html_link: link,
            }),
            _ => Err(BookingError::Upstream {
                status: status.as_u16(),
                message: "calendar service response did not include an event link".into(),
            }),
        }
    }
}

fn transport_error(err: reqwest::Error) -> BookingError {
    if err.is_timeout() {
        BookingError::Timeout {
            service: "calendar service",
        }
    } else {
        BookingError::Transport(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Prefers the message from Google's `{"error": {"message": ..}}` envelope.
fn upstream_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<GoogleErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error.message)
        .filter(|message| !message.is_empty())
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        })
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_owned())
}

/// Body of an event insert request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NewEvent {
    pub summary: String,
    pub start: EventDateTime,
    pub end: EventDateTime,
}

impl NewEvent {
    pub fn new(summary: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            summary: summary.into(),
            start: EventDateTime::utc(start),
            end: EventDateTime::utc(end),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventDateTime {
    #[serde(rename = "dateTime")]
    pub date_time: String,
    #[serde(rename = "timeZone")]
    pub time_zone: String,
}

impl EventDateTime {
    pub fn utc(at: DateTime<Utc>) -> Self {
        Self {
            date_time: at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            time_zone: "UTC".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CalendarEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "htmlLink", default)]
    html_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLink {
    pub event_id: Option<String>,
    pub html_link: String,
}
