use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    dedup::DedupGate,
    error::PipelineError,
    event::{EventFilter, NotificationEvent},
    extract::Extractor,
    store::ListenRecord,
};

/// Filter, extract, dedup, persist.
pub struct Pipeline {
    filter: EventFilter,
    extractor: Extractor,
    gate: DedupGate,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(filter: EventFilter, extractor: Extractor, gate: DedupGate) -> Self {
        Self {
            filter,
            extractor,
            gate,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn filter_packages(&self) -> Vec<&str> {
        let mut packages: Vec<&str> = self.filter.packages().collect();
        packages.sort_unstable();
        packages
    }

    pub async fn process_at(
        &self,
        event: &NotificationEvent,
        now: NaiveDateTime,
    ) -> Result<ListenRecord, PipelineError> {
        if !self.filter.accepts(event) {
            return Err(PipelineError::FilteredOut);
        }
        debug!(
            "target notification from {}: title={:?} text={:?}",
            event.source_package, event.raw_title, event.raw_body
        );

        let song = self
            .extractor
            .extract(event.raw_title.as_deref(), event.raw_body.as_deref())?;
        self.gate.record(&song, now).await
    }

    /// Runs one event to completion and logs the outcome. Never fails.
    pub async fn handle(&self, event: &NotificationEvent, now: NaiveDateTime) {
        let result = self.process_at(event, now).await;
        self.stats.observe(&result);
        match result {
            Ok(record) => info!(
                "saved: {} / {} at {}",
                record.title, record.artist, record.timestamp
            ),
            Err(PipelineError::FilteredOut) => {
                trace!("ignored notification from {}", event.source_package)
            }
            Err(PipelineError::ExtractionSkipped) => {
                debug!("skipped notification with blank title from {}", event.source_package)
            }
            Err(PipelineError::DuplicateSuppressed { .. }) => {}
            Err(err @ PipelineError::Persistence(_)) => {
                error!("error saving history: {err}")
            }
        }
    }
}

#[derive(Default)]
pub struct PipelineStats {
    recorded: AtomicU64,
    filtered: AtomicU64,
    skipped: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub recorded: u64,
    pub filtered: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl PipelineStats {
    fn observe(&self, result: &Result<ListenRecord, PipelineError>) {
        let counter = match result {
            Ok(_) => &self.recorded,
            Err(PipelineError::FilteredOut) => &self.filtered,
            Err(PipelineError::ExtractionSkipped) => &self.skipped,
            Err(PipelineError::DuplicateSuppressed { .. }) => &self.duplicates,
            Err(PipelineError::Persistence(_)) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            recorded: self.recorded.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubmitError {
    QueueFull,
    ShuttingDown,
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::QueueFull => "queue_full",
            SubmitError::ShuttingDown => "shutting_down",
        }
    }
}

/// Bounded hand-off between the delivery callback and the pipeline workers.
///
/// `submit` never waits: the caller gets control back immediately and a full
/// queue drops the event.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<NotificationEvent>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
}

pub struct IngestWorkers {
    workers: JoinSet<()>,
    cancel: CancellationToken,
}

impl IngestQueue {
    pub fn start(
        pipeline: Arc<Pipeline>,
        capacity: usize,
        workers: usize,
        cancel: CancellationToken,
    ) -> (Self, IngestWorkers) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut set = JoinSet::new();
        for id in 0..workers.max(1) {
            set.spawn(worker_loop(id, rx.clone(), pipeline.clone(), cancel.clone()));
        }

        (
            Self {
                tx,
                pipeline,
                cancel: cancel.clone(),
            },
            IngestWorkers {
                workers: set,
                cancel,
            },
        )
    }

    pub fn submit(&self, event: NotificationEvent) -> Result<(), SubmitError> {
        if self.cancel.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.pipeline.stats().record_dropped();
                warn!("ingest queue full, dropping notification from {}", event.source_package);
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::ShuttingDown),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.pipeline.stats().snapshot()
    }
}

impl IngestWorkers {
    /// Cancels the workers and waits for them. Queued events that were not
    /// started are discarded; a run already in progress finishes.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                error!("ingest worker failed: {err}");
            }
        }
        info!("ingest workers stopped");
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<NotificationEvent>>>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = rx.recv() => event,
            }
        };
        let Some(event) = next else {
            break;
        };
        pipeline.handle(&event, Local::now().naive_local()).await;
    }
    debug!("ingest worker {id} exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dedup::DEFAULT_DEDUP_WINDOW_MINUTES, store::HistoryStore};
    use chrono::{Duration, NaiveDate};

    const SOURCE: &str = "com.google.android.as";

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 15)
            .unwrap()
            .and_hms_opt(21, 0, 0)
            .unwrap()
    }

    fn event(pkg: &str, title: &str, body: &str) -> NotificationEvent {
        NotificationEvent {
            source_package: pkg.to_string(),
            raw_title: Some(title.to_string()),
            raw_body: Some(body.to_string()),
        }
    }

    fn pipeline(store: &HistoryStore) -> Pipeline {
        Pipeline::new(
            EventFilter::default(),
            Extractor::default(),
            DedupGate::new(store.clone(), Duration::minutes(DEFAULT_DEDUP_WINDOW_MINUTES)),
        )
    }

    #[tokio::test]
    async fn repeated_announcements_yield_two_records() {
        let store = HistoryStore::open_in_memory().unwrap();
        let p = pipeline(&store);
        let e = event(SOURCE, "Song A (Artist X)", "");

        for offset in [0, 2, 15] {
            p.handle(&e, t0() + Duration::minutes(offset)).await;
        }

        let all = store.stream_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].timestamp, t0() + Duration::minutes(15));
        assert_eq!(all[1].timestamp, t0());
        assert!(all.iter().all(|r| r.title == "Song A" && r.artist == "Artist X"));

        let stats = p.stats().snapshot();
        assert_eq!(stats.recorded, 2);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn foreign_package_never_records() {
        let store = HistoryStore::open_in_memory().unwrap();
        let p = pipeline(&store);

        let err = p
            .process_at(&event("com.spotify.music", "Song A (Artist X)", ""), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FilteredOut));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blank_title_is_skipped_without_record() {
        let store = HistoryStore::open_in_memory().unwrap();
        let p = pipeline(&store);

        p.handle(&event(SOURCE, "  ", "Artist"), t0()).await;
        p.handle(
            &NotificationEvent {
                source_package: SOURCE.to_string(),
                raw_title: None,
                raw_body: None,
            },
            t0(),
        )
        .await;

        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(p.stats().snapshot().skipped, 2);
    }

    #[tokio::test]
    async fn split_fields_record_body_as_artist() {
        let store = HistoryStore::open_in_memory().unwrap();
        let p = pipeline(&store);

        let rec = p
            .process_at(&event(SOURCE, "Bohemian Rhapsody", "Queen"), t0())
            .await
            .unwrap();
        assert_eq!((rec.title.as_str(), rec.artist.as_str()), ("Bohemian Rhapsody", "Queen"));
    }

    #[tokio::test]
    async fn failed_lookup_abandons_run_without_insert() {
        let store = HistoryStore::open_in_memory().unwrap();
        // Sorts after any real timestamp, so the lookup hits it and fails to parse.
        store.insert_raw("Song A", "Artist X", "yesterday").await;
        let p = pipeline(&store);
        let e = event(SOURCE, "Song A (Artist X)", "");

        p.handle(&e, t0()).await;
        assert_eq!(store.count().await.unwrap(), 1);
        let stats = p.stats().snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.recorded, 0);

        let err = p.process_at(&e, t0()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_processes_submitted_events() {
        let store = HistoryStore::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        let (queue, workers) = IngestQueue::start(Arc::new(pipeline(&store)), 8, 2, cancel);

        let mut changes = store.subscribe();
        queue.submit(event(SOURCE, "Song B (Artist Y)", "")).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), changes.changed())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(queue.stats().recorded, 1);
        workers.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let store = HistoryStore::open_in_memory().unwrap();
        let p = Arc::new(pipeline(&store));
        // No workers started: build the queue by hand so nothing drains it.
        let (tx, _rx) = mpsc::channel(1);
        let queue = IngestQueue {
            tx,
            pipeline: p,
            cancel: CancellationToken::new(),
        };

        queue.submit(event(SOURCE, "One", "")).unwrap();
        assert_eq!(
            queue.submit(event(SOURCE, "Two", "")),
            Err(SubmitError::QueueFull)
        );
        assert_eq!(queue.stats().dropped, 1);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let store = HistoryStore::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        let (queue, workers) = IngestQueue::start(Arc::new(pipeline(&store)), 4, 1, cancel);

        workers.shutdown().await;
        assert_eq!(
            queue.submit(event(SOURCE, "Song", "Artist")),
            Err(SubmitError::ShuttingDown)
        );
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
