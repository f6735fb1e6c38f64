//! CTFtime event lookup.

use crate::adapters::ctfd::BROWSER_USER_AGENT;
use crate::utils::error::{CtfError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use reqwest::{redirect, Client};
use serde::{Deserialize, Serialize};

pub const CTFTIME_API: &str = "https://ctftime.org/api/v1";

/// Dates on the command line look like `May 2, 2023`.
const DATE_FORMAT: &str = "%B %d, %Y";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organizer {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDuration {
    pub hours: u32,
    pub days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    #[serde(default)]
    pub ctf_id: u64,
    pub title: String,
    #[serde(default)]
    pub organizers: Vec<Organizer>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub ctftime_url: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub format_id: u64,
    #[serde(default)]
    pub onsite: bool,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub restrictions: String,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub participants: u64,
    #[serde(default)]
    pub logo: String,
    #[serde(default)]
    pub live_feed: String,
    #[serde(default)]
    pub is_votable_now: bool,
    #[serde(default)]
    pub public_votable: bool,
    pub start: String,
    pub finish: String,
    #[serde(default)]
    pub duration: EventDuration,
}

impl Event {
    /// ISO weekdays (Monday = 1 .. Sunday = 7) the event runs on.
    pub fn weekdays(&self) -> Result<Vec<u32>> {
        let start = parse_timestamp(&self.start)?.date_naive();
        let finish = parse_timestamp(&self.finish)?.date_naive();

        let mut days = Vec::new();
        let mut day = start;
        // 一週以上就是每天都有
        while day <= finish && days.len() < 7 {
            let weekday = day.weekday().number_from_monday();
            if !days.contains(&weekday) {
                days.push(weekday);
            }
            day += Duration::days(1);
        }
        days.sort_unstable();
        Ok(days)
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| CtfError::protocol(format!("invalid event time {:?}: {}", text, e)))
}

/// `May 2, 2023` at midnight UTC.
pub fn parse_date(text: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).map_err(|e| {
        CtfError::InvalidConfigValueError {
            field: "date".to_string(),
            value: text.to_string(),
            reason: format!("expected a date like 'May 2, 2023': {}", e),
        }
    })?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
}

/// Case-insensitive substring filters; empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub organizer: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub weekdays: Vec<u32>,
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> Result<bool> {
        if let Some(organizer) = &self.organizer {
            if !event
                .organizers
                .iter()
                .any(|o| contains_ignore_case(&o.name, organizer))
            {
                return Ok(false);
            }
        }
        if let Some(title) = &self.title {
            if !contains_ignore_case(&event.title, title) {
                return Ok(false);
            }
        }
        if let Some(description) = &self.description {
            if !contains_ignore_case(&event.description, description) {
                return Ok(false);
            }
        }
        if !self.weekdays.is_empty() {
            let days = event.weekdays()?;
            if !days.iter().any(|day| self.weekdays.contains(day)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn apply(&self, events: Vec<Event>) -> Result<Vec<Event>> {
        let mut kept = Vec::new();
        for event in events {
            if self.matches(&event)? {
                kept.push(event);
            }
        }
        Ok(kept)
    }
}

/// Keeps only `keys` of every event, as JSON objects.
pub fn select_keys(events: &[Event], keys: &[String]) -> Result<Vec<serde_json::Value>> {
    events
        .iter()
        .map(|event| {
            let full = serde_json::to_value(event)?;
            let picked: serde_json::Map<String, serde_json::Value> = keys
                .iter()
                .map(|key| (key.clone(), full.get(key).cloned().unwrap_or_default()))
                .collect();
            Ok(serde_json::Value::Object(picked))
        })
        .collect()
}

pub struct CtftimeClient {
    client: Client,
    base_url: String,
}

impl CtftimeClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(CTFTIME_API)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn events(
        &self,
        limit: u32,
        start: DateTime<Utc>,
        finish: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let url = format!("{}/events/", self.base_url);
        tracing::debug!("GET {} {} .. {}", url, start, finish);
        let events = self
            .client
            .get(url)
            .query(&[
                ("limit", limit.to_string()),
                ("start", start.timestamp().to_string()),
                ("finish", finish.timestamp().to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(events)
    }

    pub async fn events_by_date(&self, limit: u32, start: &str, finish: &str) -> Result<Vec<Event>> {
        self.events(limit, parse_date(start)?, parse_date(finish)?).await
    }
}
