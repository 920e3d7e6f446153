//! Normalisation of heterogeneous upstream JSON into canonical events.
//!
//! The schedule feed has no stable shape across services and areas. The
//! walker visits every object in the payload and accepts any object that
//! carries both a start-like and an end-like timestamp; each canonical
//! field is filled from a table of candidate field names applied in order.

use std::collections::HashMap;

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Tokyo;
use serde_json::Value;

use crate::domain::{BroadcastEvent, Series, ServiceId};

const START_KEYS: &[&str] = &["start_time", "startTime", "start", "from", "open_time"];
const END_KEYS: &[&str] = &["end_time", "endTime", "end", "to", "close_time"];
const EVENT_ID_KEYS: &[&str] = &["broadcast_event_id", "broadcastEventId", "event_id", "id"];
const SERIES_ID_KEYS: &[&str] = &["radio_series_id", "series_id", "seriesId", "site_id"];
const EPISODE_ID_KEYS: &[&str] = &["radio_episode_id", "episode_id", "episodeId", "corner_id"];
const SERVICE_KEYS: &[&str] = &["service_id", "service", "channel", "area_service"];
const AREA_KEYS: &[&str] = &["area_id", "area", "areakey", "area_code"];
const NAME_KEYS: &[&str] = &["name", "title", "program_title", "series_name"];
const DESCRIPTION_KEYS: &[&str] = &["description", "subtitle", "summary", "content"];
const DURATION_KEYS: &[&str] = &["duration", "duration_iso"];
const LOCATION_KEYS: &[&str] = &["location", "place"];
const URL_KEYS: &[&str] = &["url", "link", "page_url"];
const IMAGE_KEYS: &[&str] = &["image_url", "image", "thumbnail_url", "logo_url"];
const GENRE_KEYS: &[&str] = &["genres", "genre"];

/// Fallback area when the feed omits one; the broadcaster's schedule
/// defaults to the capital region.
const DEFAULT_AREA: &str = "tokyo";

/// Parse one upstream timestamp value.
///
/// Accepted forms: ISO-8601 with an explicit offset or `Z` (fractional
/// seconds included), ISO-8601 without a zone (broadcaster-local),
/// compact `YYYYMMDDHHMMSS` (broadcaster-local), and numeric epoch
/// seconds.
pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_instant_str(s.trim()),
        Value::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_opt(secs, 0).single()
        }
        _ => None,
    }
}

fn parse_instant_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // ISO-8601 without a zone.
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return tokyo_to_utc(naive);
        }
    }
    // Compact local form.
    if s.len() == 14 && s.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S") {
            return tokyo_to_utc(naive);
        }
    }
    // Epoch seconds as a string.
    if let Ok(secs) = s.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    None
}

fn tokyo_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match Tokyo.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(dt, _) => Some(dt.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// True for a payload-level "not found" response such as
/// `{"error":{"code":404}}`.
pub fn is_payload_not_found(payload: &Value) -> bool {
    let code = payload
        .get("error")
        .and_then(|e| e.get("code"))
        .or_else(|| payload.get("code"));
    matches!(code.and_then(Value::as_i64), Some(404))
}

fn field<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| object.get(*k))
}

fn string_field(object: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    field(object, keys).and_then(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn int_field(object: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<i64> {
    field(object, keys).and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Walk the payload and collect every object that normalises into a
/// canonical broadcast event. Events with `end <= start` or without a
/// resolvable service are dropped.
pub fn extract_events(payload: &Value, fallback_series_id: Option<i64>) -> Vec<BroadcastEvent> {
    let mut events = Vec::new();
    walk(payload, fallback_series_id, &mut events);
    events
}

fn walk(value: &Value, fallback_series_id: Option<i64>, out: &mut Vec<BroadcastEvent>) {
    match value {
        Value::Object(object) => {
            if let Some(event) = normalise_event(object, fallback_series_id) {
                out.push(event);
                return;
            }
            for child in object.values() {
                walk(child, fallback_series_id, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, fallback_series_id, out);
            }
        }
        _ => {}
    }
}

fn normalise_event(
    object: &serde_json::Map<String, Value>,
    fallback_series_id: Option<i64>,
) -> Option<BroadcastEvent> {
    let start = parse_instant(field(object, START_KEYS)?)?;
    let end = parse_instant(field(object, END_KEYS)?)?;
    if end <= start {
        return None;
    }

    let service_id = string_field(object, SERVICE_KEYS)
        .as_deref()
        .and_then(ServiceId::from_upstream)?;

    let radio_series_id = int_field(object, SERIES_ID_KEYS).or(fallback_series_id)?;
    let broadcast_event_id = string_field(object, EVENT_ID_KEYS)
        .unwrap_or_else(|| format!("{}-{}", radio_series_id, start.timestamp()));

    let genres = match field(object, GENRE_KEYS) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    };

    Some(BroadcastEvent {
        broadcast_event_id,
        radio_series_id,
        radio_episode_id: int_field(object, EPISODE_ID_KEYS),
        service_id,
        area_id: string_field(object, AREA_KEYS)
            .map(|a| a.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_AREA.to_string()),
        start,
        end,
        name: string_field(object, NAME_KEYS).unwrap_or_else(|| "Untitled programme".to_string()),
        description: string_field(object, DESCRIPTION_KEYS),
        genres,
        duration_iso: string_field(object, DURATION_KEYS),
        location: string_field(object, LOCATION_KEYS),
        url: string_field(object, URL_KEYS),
        image_url: string_field(object, IMAGE_KEYS),
    })
}

const SERIES_CODE_KEYS: &[&str] = &["series_code", "seriesCode", "code", "corner_code"];
const SERIES_LOOKUP_ID_KEYS: &[&str] = &["radio_series_id", "series_id", "seriesId", "site_id", "id"];

/// Collect series descriptors from the upstream catalogue document. An
/// object qualifies when it carries a numeric series id and a display name
/// and is not itself a broadcast event.
pub fn extract_series(payload: &Value) -> Vec<Series> {
    let mut series = Vec::new();
    walk_series(payload, &mut series);
    series
}

fn walk_series(value: &Value, out: &mut Vec<Series>) {
    match value {
        Value::Object(object) => {
            if let Some(descriptor) = normalise_series(object) {
                if !out.iter().any(|s: &Series| s.radio_series_id == descriptor.radio_series_id) {
                    out.push(descriptor);
                }
                return;
            }
            for child in object.values() {
                walk_series(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_series(item, out);
            }
        }
        _ => {}
    }
}

fn normalise_series(object: &serde_json::Map<String, Value>) -> Option<Series> {
    // Broadcast events also carry ids and names; they are not series rows.
    if field(object, START_KEYS).is_some() && field(object, END_KEYS).is_some() {
        return None;
    }
    let radio_series_id = int_field(object, SERIES_LOOKUP_ID_KEYS)?;
    let name = string_field(object, NAME_KEYS)?;
    Some(Series {
        radio_series_id,
        series_code: string_field(object, SERIES_CODE_KEYS),
        name,
        description: string_field(object, DESCRIPTION_KEYS),
        url: string_field(object, URL_KEYS),
        image_url: string_field(object, IMAGE_KEYS),
    })
}

/// Derive the `(area, service) -> HLS playlist URL` table from the upstream
/// configuration document. Any object with an area-like field contributes
/// one row per field whose key names a service and whose value is a
/// playlist URL.
pub fn extract_hls_sources(payload: &Value) -> HashMap<(String, ServiceId), String> {
    let mut sources = HashMap::new();
    walk_hls(payload, &mut sources);
    sources
}

fn walk_hls(value: &Value, out: &mut HashMap<(String, ServiceId), String>) {
    match value {
        Value::Object(object) => {
            if let Some(area) = string_field(object, AREA_KEYS) {
                let area = area.to_ascii_lowercase();
                for (key, val) in object {
                    let Some(url) = val.as_str() else { continue };
                    if !url.starts_with("http") || !url.contains(".m3u8") {
                        continue;
                    }
                    if let Some(service) = ServiceId::from_upstream(key) {
                        out.entry((area.clone(), service)).or_insert_with(|| url.to_string());
                    }
                }
            }
            for child in object.values() {
                walk_hls(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_hls(item, out);
            }
        }
        _ => {}
    }
}
