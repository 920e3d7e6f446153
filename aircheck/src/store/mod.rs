//! Durable catalogue of reservations and recordings.
//!
//! The whole catalogue lives in one JSON document under the data root and is
//! replaced atomically on every mutation: serialise to a sibling temp file,
//! fsync, rename over the primary. In-memory state sits behind a
//! reader-writer lock; readers get cheap snapshots, writers serialise.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::{Recording, Reservation, ReservationKind, ReservationStatus};
use crate::error::{Error, Result};

/// Bounds for the free-form recording metadata map.
const METADATA_MAX_ENTRIES: usize = 64;
const METADATA_MAX_KEY_LEN: usize = 128;
const METADATA_MAX_VALUE_LEN: usize = 4096;

const CATALOGUE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct Catalogue {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    reservations: Vec<Reservation>,
    #[serde(default)]
    recordings: Vec<Recording>,
}

/// Durable store for reservations and recordings.
pub struct Store {
    catalogue_path: PathBuf,
    recordings_root: PathBuf,
    staging_root: PathBuf,
    state: RwLock<Catalogue>,
}

impl Store {
    /// Open the catalogue under `data_root`, creating the directory layout
    /// on first run and reconciling disk state with the catalogue.
    pub async fn open(data_root: &Path) -> Result<Self> {
        let catalogue_path = data_root.join("catalogue.json");
        let recordings_root = data_root.join("recordings");
        let staging_root = data_root.join("staging");

        for dir in [data_root, recordings_root.as_path(), staging_root.as_path()] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::storage_io("creating directory", dir, e))?;
        }

        let mut catalogue = match tokio::fs::read(&catalogue_path).await {
            Ok(bytes) => serde_json::from_slice::<Catalogue>(&bytes)
                .map_err(|e| Error::internal(format!("catalogue is unreadable: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Catalogue {
                version: CATALOGUE_SCHEMA_VERSION,
                ..Catalogue::default()
            },
            Err(e) => return Err(Error::storage_io("reading catalogue", &catalogue_path, e)),
        };

        let store = Self {
            catalogue_path,
            recordings_root,
            staging_root,
            state: RwLock::new(Catalogue::default()),
        };
        store.recover(&mut catalogue).await?;
        *store.state.write().await = catalogue;
        Ok(store)
    }

    /// Startup recovery: reclaim staging space, delete orphaned recording
    /// directories, drop rows whose directory vanished (failing their source
    /// reservation), and return interrupted captures to pending.
    async fn recover(&self, catalogue: &mut Catalogue) -> Result<()> {
        let mut dirty = false;

        // Partial captures from a previous run are worthless.
        let mut staging = tokio::fs::read_dir(&self.staging_root)
            .await
            .map_err(|e| Error::storage_io("reading staging root", &self.staging_root, e))?;
        while let Ok(Some(entry)) = staging.next_entry().await {
            let path = entry.path();
            info!(path = %path.display(), "removing stale staging directory");
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove staging entry");
            }
        }

        // Directories on disk with no catalogue row.
        let mut on_disk = tokio::fs::read_dir(&self.recordings_root)
            .await
            .map_err(|e| Error::storage_io("reading recordings root", &self.recordings_root, e))?;
        while let Ok(Some(entry)) = on_disk.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if !catalogue.recordings.iter().any(|r| r.id == name) {
                let path = entry.path();
                info!(path = %path.display(), "removing orphaned recording directory");
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to remove orphan");
                }
            }
        }

        // Catalogue rows whose directory vanished.
        let mut missing: Vec<String> = Vec::new();
        for recording in &catalogue.recordings {
            if !self.recordings_root.join(&recording.directory).is_dir() {
                warn!(
                    recording_id = %recording.id,
                    "recording directory is missing; dropping row"
                );
                missing.push(recording.id.clone());
            }
        }
        if !missing.is_empty() {
            dirty = true;
            for reservation in &mut catalogue.reservations {
                if let ReservationKind::SingleEvent {
                    status,
                    recording_id: Some(rid),
                    ..
                } = &mut reservation.kind
                    && missing.contains(rid)
                {
                    *status = ReservationStatus::Failed;
                }
            }
            catalogue.recordings.retain(|r| !missing.contains(&r.id));
        }

        // A capture interrupted by a crash never committed; let the next
        // reconciliation tick decide whether the window is still worth it.
        for reservation in &mut catalogue.reservations {
            if let ReservationKind::SingleEvent { status, .. } = &mut reservation.kind
                && *status == ReservationStatus::InProgress
            {
                info!(reservation_id = %reservation.id, "reverting interrupted capture to pending");
                *status = ReservationStatus::Pending;
                dirty = true;
            }
        }

        if catalogue.version == 0 {
            catalogue.version = CATALOGUE_SCHEMA_VERSION;
            dirty = true;
        }
        if dirty {
            self.persist(catalogue)?;
        }
        Ok(())
    }

    /// Serialise the catalogue to a sibling temp file, fsync, and rename it
    /// over the primary. Readers never observe a partial write.
    fn persist(&self, catalogue: &Catalogue) -> Result<()> {
        let tmp_path = self.catalogue_path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(catalogue)?;

        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| Error::storage_io("creating catalogue temp file", &tmp_path, e))?;
        file.write_all(&bytes)
            .map_err(|e| Error::storage_io("writing catalogue", &tmp_path, e))?;
        file.sync_all()
            .map_err(|e| Error::storage_io("syncing catalogue", &tmp_path, e))?;
        drop(file);

        std::fs::rename(&tmp_path, &self.catalogue_path)
            .map_err(|e| Error::storage_io("replacing catalogue", &self.catalogue_path, e))?;

        // Make the rename itself durable.
        #[cfg(unix)]
        if let Some(dir) = self.catalogue_path.parent()
            && let Ok(handle) = std::fs::File::open(dir)
        {
            let _ = handle.sync_all();
        }

        Ok(())
    }

    pub fn recordings_root(&self) -> &Path {
        &self.recordings_root
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    // ---- reservations ----

    /// All reservations in stable order (created_at ascending, id as a
    /// tie-break).
    pub async fn list_reservations(&self) -> Vec<Reservation> {
        let state = self.state.read().await;
        let mut out = state.reservations.clone();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn get_reservation(&self, id: &str) -> Result<Reservation> {
        let state = self.state.read().await;
        state
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("reservation", id))
    }

    /// Insert a new reservation; the id must be unused.
    pub async fn create_reservation(&self, reservation: Reservation) -> Result<Reservation> {
        let mut state = self.state.write().await;
        if state.reservations.iter().any(|r| r.id == reservation.id) {
            return Err(Error::conflict(format!(
                "reservation '{}' already exists",
                reservation.id
            )));
        }
        state.reservations.push(reservation.clone());
        self.persist(&state)?;
        Ok(reservation)
    }

    /// Replace an existing reservation.
    pub async fn put_reservation(&self, reservation: Reservation) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .reservations
            .iter_mut()
            .find(|r| r.id == reservation.id)
            .ok_or_else(|| Error::not_found("reservation", reservation.id.clone()))?;
        *slot = reservation;
        self.persist(&state)
    }

    /// Insert new child reservations and replace their parent watch in one
    /// catalogue write, so a crash never leaves children without their seen
    /// set entry.
    pub async fn put_watch_with_children(
        &self,
        watch: Reservation,
        children: Vec<Reservation>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .reservations
            .iter_mut()
            .find(|r| r.id == watch.id)
            .ok_or_else(|| Error::not_found("reservation", watch.id.clone()))?;
        *slot = watch;
        for child in children {
            if state.reservations.iter().any(|r| r.id == child.id) {
                return Err(Error::conflict(format!(
                    "reservation '{}' already exists",
                    child.id
                )));
            }
            state.reservations.push(child);
        }
        self.persist(&state)
    }

    pub async fn delete_reservation(&self, id: &str) -> Result<Reservation> {
        let mut state = self.state.write().await;
        let idx = state
            .reservations
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::not_found("reservation", id))?;
        let removed = state.reservations.remove(idx);
        self.persist(&state)?;
        Ok(removed)
    }

    /// Look for an existing live single-event reservation of the same
    /// broadcast event, used to reject duplicate POSTs.
    pub async fn find_event_reservation(&self, broadcast_event_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state.reservations.iter().find_map(|r| match &r.kind {
            ReservationKind::SingleEvent { event, status, .. }
                if event.broadcast_event_id == broadcast_event_id
                    && !matches!(status, ReservationStatus::Canceled | ReservationStatus::Failed) =>
            {
                Some(r.id.clone())
            }
            _ => None,
        })
    }

    // ---- recordings ----

    pub async fn list_recordings(&self) -> Vec<Recording> {
        let state = self.state.read().await;
        let mut out = state.recordings.clone();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn get_recording(&self, id: &str) -> Result<Recording> {
        let state = self.state.read().await;
        state
            .recordings
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("recording", id))
    }

    /// Absolute path of a recording's HLS directory.
    pub async fn recording_dir(&self, id: &str) -> Result<PathBuf> {
        let recording = self.get_recording(id).await?;
        Ok(self.recordings_root.join(recording.directory))
    }

    /// Move `staging_dir` under the recordings root and insert the catalogue
    /// row in one logical transaction. The source reservation is marked done
    /// and linked in the same write. On any failure nothing observable
    /// changes.
    pub async fn atomic_commit_recording(
        &self,
        mut recording: Recording,
        staging_dir: &Path,
    ) -> Result<Recording> {
        let final_dir = self.recordings_root.join(&recording.id);
        recording.directory = recording.id.clone();

        let mut state = self.state.write().await;
        if state.recordings.iter().any(|r| r.id == recording.id) {
            return Err(Error::conflict(format!(
                "recording '{}' already exists",
                recording.id
            )));
        }
        // A reservation deleted mid-capture must never surface a recording,
        // even if the cancellation raced the muxer's own exit.
        if !state
            .reservations
            .iter()
            .any(|r| r.id == recording.reservation_id)
        {
            return Err(Error::Canceled);
        }

        std::fs::rename(staging_dir, &final_dir)
            .map_err(|e| Error::storage_io("publishing recording", &final_dir, e))?;

        state.recordings.push(recording.clone());
        if let Some(reservation) = state
            .reservations
            .iter_mut()
            .find(|r| r.id == recording.reservation_id)
        {
            reservation.set_status(ReservationStatus::Done);
            reservation.set_recording_id(recording.id.clone());
        }

        if let Err(e) = self.persist(&state) {
            // Roll back: un-publish the directory and drop the row.
            state.recordings.retain(|r| r.id != recording.id);
            if let Some(reservation) = state
                .reservations
                .iter_mut()
                .find(|r| r.id == recording.reservation_id)
            {
                reservation.set_status(ReservationStatus::InProgress);
            }
            if let Err(undo) = std::fs::rename(&final_dir, staging_dir) {
                warn!(error = %undo, "failed to roll back published directory");
            }
            return Err(e);
        }
        Ok(recording)
    }

    /// Apply a partial metadata patch: `Some(value)` sets a key, `None`
    /// removes it.
    pub async fn update_recording_metadata(
        &self,
        id: &str,
        patch: BTreeMap<String, Option<String>>,
    ) -> Result<Recording> {
        let mut state = self.state.write().await;
        let recording = state
            .recordings
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::not_found("recording", id))?;

        let mut next = recording.metadata.clone();
        for (key, value) in patch {
            if key.len() > METADATA_MAX_KEY_LEN {
                return Err(Error::bad_request(format!("metadata key '{key}' is too long")));
            }
            match value {
                Some(v) if v.len() > METADATA_MAX_VALUE_LEN => {
                    return Err(Error::bad_request(format!(
                        "metadata value for '{key}' is too long"
                    )));
                }
                Some(v) => {
                    next.insert(key, v);
                }
                None => {
                    next.remove(&key);
                }
            }
        }
        if next.len() > METADATA_MAX_ENTRIES {
            return Err(Error::bad_request("metadata map exceeds the entry limit"));
        }

        recording.metadata = next;
        let updated = recording.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    /// Delete the catalogue row, then the recording's directory. The row is
    /// the source of truth; a leftover directory is swept on next startup.
    pub async fn delete_recording(&self, id: &str) -> Result<()> {
        let dir = {
            let mut state = self.state.write().await;
            let idx = state
                .recordings
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| Error::not_found("recording", id))?;
            let removed = state.recordings.remove(idx);
            self.persist(&state)?;
            self.recordings_root.join(removed.directory)
        };
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %dir.display(), error = %e, "failed to remove recording directory");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BroadcastEvent, ServiceId};
    use chrono::{Duration, Utc};

    fn sample_event(id: &str) -> BroadcastEvent {
        let now = Utc::now();
        BroadcastEvent {
            broadcast_event_id: id.to_string(),
            radio_series_id: 7,
            radio_episode_id: Some(70),
            service_id: ServiceId::Fm,
            area_id: "tokyo".to_string(),
            start: now + Duration::minutes(5),
            end: now + Duration::minutes(35),
            name: "Evening Concert".to_string(),
            description: Some("Live from the hall".to_string()),
            genres: vec!["music".to_string()],
            duration_iso: None,
            location: None,
            url: None,
            image_url: None,
        }
    }

    fn sample_recording(id: &str, reservation_id: &str) -> Recording {
        Recording {
            id: id.to_string(),
            reservation_id: reservation_id.to_string(),
            event: sample_event("E1"),
            directory: String::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            size_bytes: 1024,
            duration_secs: 1800.0,
        }
    }

    #[tokio::test]
    async fn create_and_list_keeps_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let mut first = Reservation::new_single_event(sample_event("E1"), None);
        first.created_at = Utc::now() - Duration::minutes(2);
        let second = Reservation::new_single_event(sample_event("E2"), None);

        store.create_reservation(second.clone()).await.unwrap();
        store.create_reservation(first.clone()).await.unwrap();

        let listed = store.list_reservations().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn duplicate_reservation_id_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let reservation = Reservation::new_single_event(sample_event("E1"), None);
        store.create_reservation(reservation.clone()).await.unwrap();
        let err = store.create_reservation(reservation).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn catalogue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let reservation = Reservation::new_single_event(sample_event("E1"), None);
        {
            let store = Store::open(dir.path()).await.unwrap();
            store.create_reservation(reservation.clone()).await.unwrap();
        }
        let store = Store::open(dir.path()).await.unwrap();
        let reloaded = store.get_reservation(&reservation.id).await.unwrap();
        assert_eq!(reloaded.event().unwrap().broadcast_event_id, "E1");
    }

    #[tokio::test]
    async fn atomic_commit_publishes_directory_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let reservation = Reservation::new_single_event(sample_event("E1"), None);
        store.create_reservation(reservation.clone()).await.unwrap();

        let staging = dir.path().join("staging").join("cap-1");
        std::fs::create_dir_all(staging.join("segments")).unwrap();
        std::fs::write(staging.join("recording.m3u8"), "#EXTM3U\n").unwrap();

        let recording = sample_recording("rec-1", &reservation.id);
        let committed = store.atomic_commit_recording(recording, &staging).await.unwrap();

        assert!(!staging.exists());
        assert!(dir.path().join("recordings/rec-1/recording.m3u8").is_file());
        assert_eq!(committed.directory, "rec-1");

        let reservation = store.get_reservation(&reservation.id).await.unwrap();
        assert_eq!(reservation.status(), ReservationStatus::Done);
        assert_eq!(store.list_recordings().await.len(), 1);
    }

    #[tokio::test]
    async fn recovery_drops_rows_without_directories_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let reservation = Reservation::new_single_event(sample_event("E1"), None);
        {
            let store = Store::open(dir.path()).await.unwrap();
            store.create_reservation(reservation.clone()).await.unwrap();

            let staging = dir.path().join("staging").join("cap-1");
            std::fs::create_dir_all(&staging).unwrap();
            std::fs::write(staging.join("recording.m3u8"), "#EXTM3U\n").unwrap();
            store
                .atomic_commit_recording(sample_recording("rec-1", &reservation.id), &staging)
                .await
                .unwrap();
        }

        // Simulate a vanished directory plus an orphan next to it.
        std::fs::remove_dir_all(dir.path().join("recordings/rec-1")).unwrap();
        std::fs::create_dir_all(dir.path().join("recordings/orphan")).unwrap();
        std::fs::create_dir_all(dir.path().join("staging/leftover")).unwrap();

        let store = Store::open(dir.path()).await.unwrap();
        assert!(store.list_recordings().await.is_empty());
        assert!(!dir.path().join("recordings/orphan").exists());
        assert!(!dir.path().join("staging/leftover").exists());

        let reservation = store.get_reservation(&reservation.id).await.unwrap();
        assert_eq!(reservation.status(), ReservationStatus::Failed);
    }

    #[tokio::test]
    async fn metadata_patch_sets_and_removes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let reservation = Reservation::new_single_event(sample_event("E1"), None);
        store.create_reservation(reservation.clone()).await.unwrap();
        let staging = dir.path().join("staging").join("cap-1");
        std::fs::create_dir_all(&staging).unwrap();
        store
            .atomic_commit_recording(sample_recording("rec-1", &reservation.id), &staging)
            .await
            .unwrap();

        let mut patch = BTreeMap::new();
        patch.insert("title".to_string(), Some("Night Session".to_string()));
        let updated = store.update_recording_metadata("rec-1", patch).await.unwrap();
        assert_eq!(updated.metadata.get("title").unwrap(), "Night Session");

        let mut patch = BTreeMap::new();
        patch.insert("title".to_string(), None);
        let updated = store.update_recording_metadata("rec-1", patch).await.unwrap();
        assert!(updated.metadata.is_empty());
    }

    #[tokio::test]
    async fn delete_recording_removes_row_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let reservation = Reservation::new_single_event(sample_event("E1"), None);
        store.create_reservation(reservation.clone()).await.unwrap();
        let staging = dir.path().join("staging").join("cap-1");
        std::fs::create_dir_all(&staging).unwrap();
        store
            .atomic_commit_recording(sample_recording("rec-1", &reservation.id), &staging)
            .await
            .unwrap();

        store.delete_recording("rec-1").await.unwrap();
        assert!(store.list_recordings().await.is_empty());
        assert!(!dir.path().join("recordings/rec-1").exists());
    }
}
