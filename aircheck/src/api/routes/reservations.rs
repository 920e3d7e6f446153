//! Reservation CRUD routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::{BroadcastEvent, Reservation, ServiceId};
use crate::error::Error;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/reservations", get(list_reservations))
        .route("/reservation/single-event", post(create_single_event))
        .route("/reservation/watch-series", post(create_series_watch))
        .route("/reservations/{id}", delete(delete_reservation))
}

async fn list_reservations(State(state): State<AppState>) -> Json<Vec<Reservation>> {
    Json(state.store.list_reservations().await)
}

/// Event snapshot as posted by the front-end; display fields are optional.
#[derive(Debug, Deserialize)]
struct EventPayload {
    broadcast_event_id: String,
    #[serde(default)]
    radio_episode_id: Option<i64>,
    service_id: ServiceId,
    area_id: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    duration_iso: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateSingleEventRequest {
    series_id: i64,
    #[serde(default)]
    #[allow(dead_code)]
    series_code: Option<String>,
    event: EventPayload,
}

async fn create_single_event(
    State(state): State<AppState>,
    Json(body): Json<CreateSingleEventRequest>,
) -> ApiResult<(StatusCode, Json<Reservation>)> {
    let payload = body.event;
    let event = BroadcastEvent {
        broadcast_event_id: payload.broadcast_event_id,
        radio_series_id: body.series_id,
        radio_episode_id: payload.radio_episode_id,
        service_id: payload.service_id,
        area_id: payload.area_id.to_ascii_lowercase(),
        start: payload.start,
        end: payload.end,
        name: payload.name.unwrap_or_else(|| "Untitled programme".to_string()),
        description: payload.description,
        genres: payload.genres,
        duration_iso: payload.duration_iso,
        location: payload.location,
        url: payload.url,
        image_url: payload.image_url,
    };
    event.validate_for_reservation(Utc::now(), false)?;

    if let Some(existing) = state
        .store
        .find_event_reservation(&event.broadcast_event_id)
        .await
    {
        return Err(ApiError(Error::conflict(format!(
            "broadcast event '{}' is already reserved by '{existing}'",
            event.broadcast_event_id
        ))));
    }

    let reservation = state
        .store
        .create_reservation(Reservation::new_single_event(event, None))
        .await?;
    state.scheduler.notify_changed();
    Ok((StatusCode::CREATED, Json(reservation)))
}

#[derive(Debug, Deserialize)]
struct CreateSeriesWatchRequest {
    series_id: i64,
    #[serde(default)]
    series_code: Option<String>,
    #[serde(default)]
    area_id: Option<String>,
    #[serde(default)]
    seen_broadcast_event_ids: Vec<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

async fn create_series_watch(
    State(state): State<AppState>,
    Json(body): Json<CreateSeriesWatchRequest>,
) -> ApiResult<(StatusCode, Json<Reservation>)> {
    if body.series_id <= 0 && body.series_code.is_none() {
        return Err(ApiError(Error::bad_request(
            "series_id or series_code is required",
        )));
    }

    let reservation = state
        .store
        .create_reservation(Reservation::new_series_watch(
            body.series_id,
            body.series_code,
            body.area_id,
            body.name,
            body.description,
            body.image_url,
            body.seen_broadcast_event_ids.into_iter().collect(),
        ))
        .await?;
    state.scheduler.notify_changed();
    Ok((StatusCode::CREATED, Json(reservation)))
}

async fn delete_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.scheduler.delete_reservation(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
