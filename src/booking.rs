use crate::error::BookingError;
use crate::google_calendar::NewEvent;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

pub const DEFAULT_SUMMARY: &str = "Untitled Event";

/// Body of `POST /add_event`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingRequest {
    pub summary: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl BookingRequest {
    /// Missing time fields are reported ahead of any other problem with the
    /// body, so callers always learn about them first.
    pub fn parse(body: &[u8]) -> Result<Self, BookingError> {
        let value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice::<Value>(body).map_err(|err| {
                BookingError::Validation(format!("request body is not valid JSON: {err}"))
            })?
        };

        let object = value.as_object().ok_or_else(|| {
            BookingError::Validation("request body must be a JSON object".into())
        })?;

        let start_time = text_field(object, "start_time")?;
        let end_time = text_field(object, "end_time")?;
        if start_time.is_none() || end_time.is_none() {
            return Err(BookingError::Validation(
                "Missing start_time or end_time".into(),
            ));
        }

        let summary = match object.get("summary") {
            None | Some(Value::Null) => None,
            Some(Value::String(summary)) => Some(summary.clone()),
            Some(_) => {
                return Err(BookingError::Validation("summary must be a string".into()));
            }
        };

        Ok(Self {
            summary,
            start_time,
            end_time,
        })
    }

    pub fn into_event(self) -> Result<NewEvent, BookingError> {
        let (Some(start_time), Some(end_time)) = (self.start_time, self.end_time) else {
            return Err(BookingError::Validation(
                "Missing start_time or end_time".into(),
            ));
        };

        let start = parse_timestamp("start_time", &start_time)?;
        let end = parse_timestamp("end_time", &end_time)?;
        let summary = self.summary.unwrap_or_else(|| DEFAULT_SUMMARY.to_owned());

        Ok(NewEvent::new(summary, start, end))
    }
}

/// Empty strings count as absent.
fn text_field(object: &Map<String, Value>, name: &str) -> Result<Option<String>, BookingError> {
    match object.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(BookingError::Validation(format!("{name} must be a string"))),
    }
}

/// Formats a `datetime-local` input or a bare ISO-8601 value may take.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Timestamps without an offset are read as UTC, the zone every event is
/// booked in.
fn parse_timestamp(name: &str, raw: &str) -> Result<DateTime<Utc>, BookingError> {
    let trimmed = raw.trim();
    match DateTime::parse_from_rfc3339(trimmed) {
        Ok(parsed) => Ok(parsed.with_timezone(&Utc)),
        Err(err) => NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
            .map(|naive| naive.and_utc())
            .ok_or_else(|| {
                BookingError::Validation(format!(
                    "{name} '{raw}' is not an RFC3339 timestamp: {err}"
                ))
            }),
    }
}
