//! Series catalogue and schedule lookup routes.

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::{BroadcastEvent, Series};
use crate::error::Error;
use crate::upstream::SeriesSelector;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/series", get(list_series))
        .route("/series/resolve", get(resolve_series))
        .route("/events", get(list_events))
}

async fn list_series(State(state): State<AppState>) -> ApiResult<Json<Vec<Series>>> {
    let series = state.upstream.list_series().await?;
    Ok(Json(series.as_ref().clone()))
}

#[derive(Deserialize)]
struct ResolveQuery {
    series_url: String,
}

#[derive(Serialize)]
struct ResolveResponse {
    #[serde(rename = "seriesCode")]
    series_code: String,
}

async fn resolve_series(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<Json<ResolveResponse>> {
    let code = state
        .upstream
        .resolve_series_code(&query.series_url)
        .await?
        .ok_or_else(|| ApiError(Error::not_found("series", query.series_url.clone())))?;
    Ok(Json(ResolveResponse { series_code: code }))
}

#[derive(Deserialize)]
struct EventsQuery {
    series_code: Option<String>,
    series_url: Option<String>,
    series_id: Option<i64>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<BroadcastEvent>>> {
    let selector = if let Some(code) = query.series_code {
        SeriesSelector::Code(code)
    } else if let Some(url) = query.series_url {
        SeriesSelector::Url(url)
    } else if let Some(id) = query.series_id {
        SeriesSelector::Id(id)
    } else {
        return Err(ApiError(Error::bad_request(
            "one of series_code, series_url or series_id is required",
        )));
    };

    let horizon = Duration::from_std(state.config.watch_horizon).unwrap_or(Duration::days(7));
    let events = state.upstream.fetch_events(&selector, Utc::now() + horizon).await?;
    Ok(Json(events))
}
