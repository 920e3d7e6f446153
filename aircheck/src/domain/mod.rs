//! Core domain entities: broadcast events, reservations and recordings.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Grace window for accepting a start instant that is already in the past.
pub const PAST_START_GRACE: Duration = Duration::seconds(10);

/// Radio service carrying a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceId {
    R1,
    R2,
    Fm,
}

impl ServiceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::R1 => "r1",
            ServiceId::R2 => "r2",
            ServiceId::Fm => "fm",
        }
    }

    /// Map an upstream service label onto a canonical service.
    ///
    /// Matching is by case-insensitive substring: "r1" selects R1,
    /// "r2" or "rs" selects R2, "r3" or "fm" selects FM.
    pub fn from_upstream(label: &str) -> Option<Self> {
        let label = label.to_ascii_lowercase();
        if label.contains("r1") {
            Some(ServiceId::R1)
        } else if label.contains("r2") || label.contains("rs") {
            Some(ServiceId::R2)
        } else if label.contains("r3") || label.contains("fm") {
            Some(ServiceId::Fm)
        } else {
            None
        }
    }
}

impl FromStr for ServiceId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "r1" => Ok(ServiceId::R1),
            "r2" => Ok(ServiceId::R2),
            "fm" => Ok(ServiceId::Fm),
            _ => Err(format!("'{s}' is not a valid service id")),
        }
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single dated episode of a radio programme, normalised from the
/// upstream schedule feed. Instants are stored as UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub broadcast_event_id: String,
    pub radio_series_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radio_episode_id: Option<i64>,
    pub service_id: ServiceId,
    pub area_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_iso: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl BroadcastEvent {
    /// Scheduled on-air duration.
    pub fn scheduled_duration(&self) -> Duration {
        self.end - self.start
    }

    /// Validate an event for reservation.
    ///
    /// `just_in_time` relaxes the past-start check for events materialised
    /// by the scheduler right before (or after) they begin.
    pub fn validate_for_reservation(&self, now: DateTime<Utc>, just_in_time: bool) -> Result<()> {
        if self.broadcast_event_id.trim().is_empty() {
            return Err(Error::bad_request("event.broadcast_event_id must not be empty"));
        }
        if self.end <= self.start {
            return Err(Error::bad_request("event.end must be after event.start"));
        }
        if !just_in_time && self.start < now - PAST_START_GRACE {
            return Err(Error::bad_request("event.start is in the past"));
        }
        Ok(())
    }
}

/// Lifecycle of a single-event reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Canceled,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }
}

/// What a reservation asks for: one event, or every future event of a series.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReservationKind {
    SingleEvent {
        event: BroadcastEvent,
        status: ReservationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recording_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_watch_id: Option<String>,
    },
    SeriesWatch {
        radio_series_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        series_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        area_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
        #[serde(default)]
        seen_broadcast_event_ids: BTreeSet<String>,
    },
}

/// A user-created recording request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ReservationKind,
}

impl Reservation {
    pub fn new_single_event(event: BroadcastEvent, parent_watch_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            kind: ReservationKind::SingleEvent {
                event,
                status: ReservationStatus::Pending,
                recording_id: None,
                parent_watch_id,
            },
        }
    }

    pub fn new_series_watch(
        radio_series_id: i64,
        series_code: Option<String>,
        area_id: Option<String>,
        name: Option<String>,
        description: Option<String>,
        image_url: Option<String>,
        seen_broadcast_event_ids: BTreeSet<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            kind: ReservationKind::SeriesWatch {
                radio_series_id,
                series_code,
                area_id: area_id.map(|a| a.to_ascii_lowercase()),
                name,
                description,
                image_url,
                seen_broadcast_event_ids,
            },
        }
    }

    /// The reported status. A series watch stays pending until deleted.
    pub fn status(&self) -> ReservationStatus {
        match &self.kind {
            ReservationKind::SingleEvent { status, .. } => *status,
            ReservationKind::SeriesWatch { .. } => ReservationStatus::Pending,
        }
    }

    pub fn event(&self) -> Option<&BroadcastEvent> {
        match &self.kind {
            ReservationKind::SingleEvent { event, .. } => Some(event),
            ReservationKind::SeriesWatch { .. } => None,
        }
    }

    pub fn set_status(&mut self, new: ReservationStatus) {
        if let ReservationKind::SingleEvent { status, .. } = &mut self.kind {
            *status = new;
        }
    }

    pub fn set_recording_id(&mut self, id: String) {
        if let ReservationKind::SingleEvent { recording_id, .. } = &mut self.kind {
            *recording_id = Some(id);
        }
    }

    pub fn is_series_watch(&self) -> bool {
        matches!(self.kind, ReservationKind::SeriesWatch { .. })
    }
}

/// A series descriptor from the upstream catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub radio_series_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_code: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// A committed capture, visible through the API once its HLS tree has been
/// atomically moved under the recordings root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    pub reservation_id: String,
    pub event: BroadcastEvent,
    /// Directory path relative to the recordings root.
    pub directory: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub duration_secs: f64,
}
