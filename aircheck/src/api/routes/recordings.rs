//! Recording catalogue, playback and download routes.

use std::collections::BTreeMap;
use std::io::Write;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use serde::Deserialize;
use tower_http::services::ServeFile;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::convert::CONTAINER_EXTENSION;
use crate::domain::Recording;
use crate::error::Error;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/recordings", get(list_recordings))
        .route("/recordings/bulk-download", post(bulk_download))
        .route("/recordings/{id}", delete(delete_recording))
        .route("/recordings/{id}/metadata", patch(update_metadata))
        .route("/recordings/{id}/download", get(download))
        .route("/recordings/{id}/recording.m3u8", get(serve_playlist))
        .route("/recordings/{id}/segments/{segment}", get(serve_segment))
}

async fn list_recordings(State(state): State<AppState>) -> Json<Vec<Recording>> {
    Json(state.store.list_recordings().await)
}

async fn update_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<BTreeMap<String, Option<String>>>,
) -> ApiResult<Json<Recording>> {
    let updated = state.store.update_recording_metadata(&id, patch).await?;
    Ok(Json(updated))
}

async fn delete_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_recording(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Convert the stored HLS tree into one container and stream it back.
async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let dir = state.store.recording_dir(&id).await?;
    let bytes = state.converter.to_container(&dir).await?;

    let disposition = format!("attachment; filename=\"{id}.{CONTAINER_EXTENSION}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "audio/mp4".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(bytes),
    )
        .into_response())
}

#[derive(Deserialize)]
struct BulkDownloadRequest {
    ids: Vec<String>,
}

/// Bundle the requested recordings into a ZIP of stored (uncompressed)
/// entries, in exactly the requested order.
async fn bulk_download(
    State(state): State<AppState>,
    Json(body): Json<BulkDownloadRequest>,
) -> ApiResult<Response> {
    if body.ids.is_empty() {
        return Err(ApiError(Error::bad_request("ids must not be empty")));
    }

    let mut entries = Vec::with_capacity(body.ids.len());
    for id in &body.ids {
        let dir = state.store.recording_dir(id).await?;
        let bytes = state.converter.to_container(&dir).await?;
        entries.push((format!("{id}.{CONTAINER_EXTENSION}"), bytes));
    }

    let archive = build_archive(&entries).map_err(ApiError)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"recordings.zip\"".to_string(),
            ),
        ],
        Body::from(archive),
    )
        .into_response())
}

fn build_archive(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, Error> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut cursor);
    // The containers are already compressed audio; store them as-is.
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

    for (name, bytes) in entries {
        zip.start_file(name, options)
            .map_err(|e| Error::internal(format!("failed to add zip entry: {e}")))?;
        zip.write_all(bytes)
            .map_err(|e| Error::internal(format!("failed to write zip entry: {e}")))?;
    }
    zip.finish()
        .map_err(|e| Error::internal(format!("failed to finish zip: {e}")))?;

    Ok(cursor.into_inner())
}

/// Serve the recording's playlist for in-browser HLS playback.
async fn serve_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    let dir = state.store.recording_dir(&id).await?;
    serve_file(dir.join("recording.m3u8"), req).await
}

async fn serve_segment(
    State(state): State<AppState>,
    Path((id, segment)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Response> {
    // Path parameters cannot carry '/', but stay strict about what a
    // segment name looks like.
    if segment.contains("..") || !segment.ends_with(".ts") {
        return Err(ApiError(Error::bad_request("invalid segment name")));
    }
    let dir = state.store.recording_dir(&id).await?;
    serve_file(dir.join("segments").join(segment), req).await
}

async fn serve_file(path: std::path::PathBuf, req: Request) -> ApiResult<Response> {
    if !path.is_file() {
        return Err(ApiError(Error::not_found("file", path.display().to_string())));
    }
    match ServeFile::new(path).try_call(req).await {
        Ok(response) => Ok(response.into_response()),
        Err(e) => Err(ApiError(Error::internal(format!("failed to serve file: {e}")))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_entries_keep_request_order_and_are_stored() {
        let entries = vec![
            ("r2.m4a".to_string(), vec![2u8; 64]),
            ("r1.m4a".to_string(), vec![1u8; 32]),
        ];
        let bytes = build_archive(&entries).unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);

        let first = archive.by_index(0).unwrap();
        assert_eq!(first.name(), "r2.m4a");
        assert_eq!(first.compression(), zip::CompressionMethod::Stored);
        assert_eq!(first.size(), 64);
        drop(first);

        let second = archive.by_index(1).unwrap();
        assert_eq!(second.name(), "r1.m4a");
        assert_eq!(second.compression(), zip::CompressionMethod::Stored);
    }
}
