//! Integration tests for the HTTP API surface.
//!
//! These drive the real router, store and scheduler with a stubbed
//! upstream feed; no network and no muxer processes are involved.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tower::ServiceExt;

use aircheck::api::{AppState, routes};
use aircheck::capture::CaptureWorker;
use aircheck::capture::muxer::FfmpegMuxer;
use aircheck::clock::SystemClock;
use aircheck::config::Config;
use aircheck::convert::Converter;
use aircheck::domain::{BroadcastEvent, Recording, Series, ServiceId};
use aircheck::error::Result;
use aircheck::scheduler::{Scheduler, SchedulerConfig};
use aircheck::store::Store;
use aircheck::upstream::{ScheduleFeed, SeriesSelector};

struct StubFeed;

#[async_trait]
impl ScheduleFeed for StubFeed {
    async fn list_series(&self) -> Result<Arc<Vec<Series>>> {
        Ok(Arc::new(vec![Series {
            radio_series_id: 42,
            series_code: Some("Z9L1V2M24L".to_string()),
            name: "Evening Story".to_string(),
            description: None,
            url: Some("https://example.jp/series/Z9L1V2M24L".to_string()),
            image_url: None,
        }]))
    }

    async fn resolve_series_code(&self, series_url: &str) -> Result<Option<String>> {
        Ok(series_url
            .contains("Z9L1V2M24L")
            .then(|| "Z9L1V2M24L".to_string()))
    }

    async fn fetch_events(
        &self,
        _selector: &SeriesSelector,
        _horizon_end: DateTime<Utc>,
    ) -> Result<Vec<BroadcastEvent>> {
        Ok(Vec::new())
    }

    async fn fetch_hls_source(&self, _service_id: ServiceId, _area_id: &str) -> Result<String> {
        Ok("https://example.jp/live/master.m3u8".to_string())
    }
}

async fn test_app(data_root: &Path) -> (Router, Arc<Store>) {
    let config = Arc::new(Config {
        data_root: data_root.to_path_buf(),
        ..Config::default()
    });
    let store = Arc::new(Store::open(data_root).await.unwrap());
    let clock = Arc::new(SystemClock);
    let feed: Arc<dyn ScheduleFeed> = Arc::new(StubFeed);
    let worker = Arc::new(CaptureWorker::new(
        clock.clone(),
        Arc::new(FfmpegMuxer::new("ffmpeg-not-present".into())),
        Arc::clone(&store),
        config.grace_period,
        config.segment_duration_secs,
    ));
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&feed),
        clock,
        worker,
        SchedulerConfig::from(config.as_ref()),
    );
    let state = AppState::new(
        config,
        Arc::clone(&store),
        scheduler,
        feed,
        Arc::new(Converter::new("ffmpeg-not-present".into())),
    );
    (routes::create_router(state), store)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn single_event_body(event_id: &str) -> Value {
    let start = Utc::now() + Duration::hours(1);
    let end = start + Duration::minutes(30);
    json!({
        "series_id": 42,
        "event": {
            "broadcast_event_id": event_id,
            "service_id": "r2",
            "area_id": "Tokyo",
            "start": start.to_rfc3339(),
            "end": end.to_rfc3339(),
            "name": "Evening Story"
        }
    })
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path()).await;

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn single_event_reservation_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path()).await;

    // Create.
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/reservation/single-event",
            single_event_body("E1"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["type"], "single_event");
    assert_eq!(created["status"], "pending");
    assert_eq!(created["event"]["area_id"], "tokyo");
    let id = created["id"].as_str().unwrap().to_string();

    // Listed.
    let response = app.clone().oneshot(get("/reservations")).await.unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // An identical payload conflicts.
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/reservation/single-event",
            single_event_body("E1"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let conflict = body_json(response).await;
    assert_eq!(conflict["error"]["kind"], "conflict");

    // Delete.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/reservations/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.clone().oneshot(get("/reservations")).await.unwrap();
    let listed = body_json(response).await;
    assert!(listed.as_array().unwrap().is_empty());

    // Deleting again is a 404.
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/reservations/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_event_windows_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path()).await;

    let start = Utc::now() + Duration::hours(1);
    let body = json!({
        "series_id": 42,
        "event": {
            "broadcast_event_id": "E1",
            "service_id": "r1",
            "area_id": "tokyo",
            "start": start.to_rfc3339(),
            "end": start.to_rfc3339()
        }
    });
    let response = app
        .oneshot(json_request("POST", "/reservation/single-event", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["error"]["kind"], "bad_request");
}

#[tokio::test]
async fn series_watch_creation_and_series_listing() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path()).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/reservation/watch-series",
            json!({
                "series_id": 42,
                "series_code": "Z9L1V2M24L",
                "area_id": "tokyo",
                "seen_broadcast_event_ids": [],
                "name": "Evening Story"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["type"], "series_watch");

    let response = app.clone().oneshot(get("/series")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let series = body_json(response).await;
    assert_eq!(series[0]["series_code"], "Z9L1V2M24L");

    let response = app
        .clone()
        .oneshot(get("/series/resolve?series_url=https://example.jp/series/Z9L1V2M24L"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let resolved = body_json(response).await;
    assert_eq!(resolved["seriesCode"], "Z9L1V2M24L");

    // Events lookup requires a selector.
    let response = app.oneshot(get("/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

fn sample_recording(id: &str) -> Recording {
    let now = Utc::now();
    Recording {
        id: id.to_string(),
        reservation_id: "res-1".to_string(),
        event: BroadcastEvent {
            broadcast_event_id: "E1".to_string(),
            radio_series_id: 42,
            radio_episode_id: None,
            service_id: ServiceId::R2,
            area_id: "tokyo".to_string(),
            start: now - Duration::hours(1),
            end: now - Duration::minutes(30),
            name: "Evening Story".to_string(),
            description: None,
            genres: Vec::new(),
            duration_iso: None,
            location: None,
            url: None,
            image_url: None,
        },
        directory: String::new(),
        metadata: BTreeMap::new(),
        created_at: now,
        size_bytes: 2048,
        duration_secs: 1800.0,
    }
}

async fn seed_recording(store: &Store, data_root: &Path, id: &str) {
    let reservation = aircheck::domain::Reservation::new_single_event(
        sample_recording(id).event.clone(),
        None,
    );
    let reservation_id = reservation.id.clone();
    store.create_reservation(reservation).await.unwrap();

    let staging = data_root.join("staging").join(format!("cap-{id}"));
    std::fs::create_dir_all(staging.join("segments")).unwrap();
    std::fs::write(staging.join("segments/00000.ts"), vec![1u8; 128]).unwrap();
    std::fs::write(
        staging.join("recording.m3u8"),
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nsegments/00000.ts\n#EXT-X-ENDLIST\n",
    )
    .unwrap();

    let mut recording = sample_recording(id);
    recording.reservation_id = reservation_id;
    store.atomic_commit_recording(recording, &staging).await.unwrap();
}

#[tokio::test]
async fn recordings_metadata_playback_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(dir.path()).await;

    let response = app.clone().oneshot(get("/recordings")).await.unwrap();
    assert!(body_json(response).await.as_array().unwrap().is_empty());

    seed_recording(&store, dir.path(), "rec-1").await;

    // Listed once committed.
    let response = app.clone().oneshot(get("/recordings")).await.unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // Static playback serves the playlist.
    let response = app
        .clone()
        .oneshot(get("/recordings/rec-1/recording.m3u8"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(std::str::from_utf8(&bytes).unwrap().starts_with("#EXTM3U"));

    // Segments too.
    let response = app
        .clone()
        .oneshot(get("/recordings/rec-1/segments/00000.ts"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Traversal-looking segment names are rejected.
    let response = app
        .clone()
        .oneshot(get("/recordings/rec-1/segments/..%2Fcatalogue.json"))
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::OK);

    // Metadata patch.
    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/recordings/rec-1/metadata",
            json!({"title": "My Title", "tags": "jazz"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await;
    assert_eq!(updated["metadata"]["title"], "My Title");

    // Patch on a missing recording is a 404.
    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/recordings/nope/metadata",
            json!({"title": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Delete removes the row and the directory.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/recordings/rec-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!dir.path().join("recordings/rec-1").exists());

    let response = app.oneshot(get("/recordings")).await.unwrap();
    assert!(body_json(response).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn bulk_download_of_unknown_recording_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path()).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/recordings/bulk-download",
            json!({"ids": ["missing"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(json_request("POST", "/recordings/bulk-download", json!({"ids": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
