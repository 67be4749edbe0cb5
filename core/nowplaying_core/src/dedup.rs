use chrono::{Duration, NaiveDateTime};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::{
    error::PipelineError,
    extract::SongInfo,
    store::{HistoryStore, ListenRecord},
};

pub const DEFAULT_DEDUP_WINDOW_MINUTES: i64 = 10;

type SongKey = (String, String);

/// Suppresses a song that was already recorded inside the dedup window.
///
/// The lookup and the insert for one (title, artist) run under a per-song
/// lock, so two detections racing each other yield a single record. Other
/// songs are not blocked.
#[derive(Clone)]
pub struct DedupGate {
    store: HistoryStore,
    window: Duration,
    in_flight: Arc<StdMutex<HashMap<SongKey, Arc<Mutex<()>>>>>,
}

impl DedupGate {
    pub fn new(store: HistoryStore, window: Duration) -> Self {
        Self {
            store,
            window,
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub async fn record(
        &self,
        song: &SongInfo,
        now: NaiveDateTime,
    ) -> Result<ListenRecord, PipelineError> {
        let entry = self.enter((song.title.clone(), song.artist.clone()));
        let _guard = entry.lock().await;
        self.check_and_insert(song, now).await
    }

    async fn check_and_insert(
        &self,
        song: &SongInfo,
        now: NaiveDateTime,
    ) -> Result<ListenRecord, PipelineError> {
        // A window reaching past the calendar range covers all history.
        let since = now.checked_sub_signed(self.window);
        if let Some(prev) = self
            .store
            .find_recent(&song.title, &song.artist, since)
            .await?
        {
            debug!(
                "duplicate detected: {} / {} (last at {}, since {since:?})",
                song.title, song.artist, prev.timestamp
            );
            return Err(PipelineError::DuplicateSuppressed {
                title: song.title.clone(),
                artist: song.artist.clone(),
            });
        }

        Ok(self.store.insert(&song.title, &song.artist, now).await?)
    }

    fn enter(&self, key: SongKey) -> InFlight<'_> {
        let lock = lock_map(&self.in_flight)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        InFlight {
            gate: self,
            key,
            lock: Some(lock),
        }
    }

    // Drop the entry once no run holds or waits on it.
    fn release(&self, key: &SongKey) {
        let mut map = lock_map(&self.in_flight);
        if map.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

fn lock_map(
    map: &StdMutex<HashMap<SongKey, Arc<Mutex<()>>>>,
) -> std::sync::MutexGuard<'_, HashMap<SongKey, Arc<Mutex<()>>>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-song lock handle. Releases the map entry when dropped, including when
/// the owning `record` future is cancelled mid-await.
struct InFlight<'a> {
    gate: &'a DedupGate,
    key: SongKey,
    lock: Option<Arc<Mutex<()>>>,
}

impl InFlight<'_> {
    async fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        Some(self.lock.as_ref()?.lock().await)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.gate.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 15)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap()
    }

    fn song(title: &str, artist: &str) -> SongInfo {
        SongInfo {
            title: title.to_string(),
            artist: artist.to_string(),
        }
    }

    fn gate(store: &HistoryStore) -> DedupGate {
        DedupGate::new(store.clone(), Duration::minutes(DEFAULT_DEDUP_WINDOW_MINUTES))
    }

    #[tokio::test]
    async fn suppresses_within_window_and_records_after() {
        let store = HistoryStore::open_in_memory().unwrap();
        let gate = gate(&store);
        let s = song("Song A", "Artist X");

        gate.record(&s, t0()).await.unwrap();
        let err = gate.record(&s, t0() + Duration::minutes(2)).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateSuppressed { .. }));
        gate.record(&s, t0() + Duration::minutes(15)).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn match_exactly_at_window_edge_is_not_a_duplicate() {
        let store = HistoryStore::open_in_memory().unwrap();
        let gate = gate(&store);
        let s = song("Song A", "Artist X");

        gate.record(&s, t0()).await.unwrap();
        gate.record(&s, t0() + Duration::minutes(10)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn different_artist_or_case_is_a_new_song() {
        let store = HistoryStore::open_in_memory().unwrap();
        let gate = gate(&store);

        gate.record(&song("Song A", "Artist X"), t0()).await.unwrap();
        gate.record(&song("Song A", "Artist Y"), t0()).await.unwrap();
        gate.record(&song("song a", "Artist X"), t0()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn window_is_measured_from_latest_record() {
        let store = HistoryStore::open_in_memory().unwrap();
        let gate = gate(&store);
        let s = song("Song A", "Artist X");

        gate.record(&s, t0()).await.unwrap();
        gate.record(&s, t0() + Duration::minutes(11)).await.unwrap();
        // Within 10 minutes of the second record, past 10 of the first.
        assert!(gate.record(&s, t0() + Duration::minutes(19)).await.is_err());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn oversized_window_covers_all_history() {
        let store = HistoryStore::open_in_memory().unwrap();
        let gate = DedupGate::new(store.clone(), Duration::minutes(1_000_000_000_000));
        let s = song("Song A", "Artist X");

        gate.record(&s, t0()).await.unwrap();
        let err = gate.record(&s, t0() + Duration::days(365)).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateSuppressed { .. }));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_record_releases_its_song_lock() {
        let store = HistoryStore::open_in_memory().unwrap();
        let gate = gate(&store);

        // Park the run inside the store call, then drop it there.
        let conn = store.hold_connection().await;
        let res = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            gate.record(&song("Song A", "Artist X"), t0()),
        )
        .await;
        assert!(res.is_err());
        drop(conn);

        assert_eq!(gate.tracked_keys(), 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    // Two detections of the same song racing each other must not both pass
    // the lookup.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_detections_of_one_song_record_once() {
        let store = HistoryStore::open_in_memory().unwrap();
        let gate = gate(&store);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.record(&song("Song A", "Artist X"), t0()).await
            }));
        }
        let mut recorded = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                recorded += 1;
            }
        }

        assert_eq!(recorded, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(gate.tracked_keys(), 0);
    }
}
