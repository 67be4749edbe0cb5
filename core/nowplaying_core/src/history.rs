use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::store::{HistoryStore, ListenRecord};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DayGroup {
    pub date: NaiveDate,
    pub records: Vec<ListenRecord>,
}

/// Listen history grouped by local calendar date, newest day first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HistoryByDate {
    pub days: Vec<DayGroup>,
}

impl HistoryByDate {
    pub fn total_records(&self) -> usize {
        self.days.iter().map(|d| d.records.len()).sum()
    }
}

/// Groups records by their local date. Relative order is kept, so a
/// newest-first input yields newest-first days and newest-first entries.
pub fn group_by_date(records: &[ListenRecord]) -> HistoryByDate {
    let mut days: Vec<DayGroup> = Vec::new();
    for r in records {
        let date = r.timestamp.date();
        match days.iter_mut().find(|d| d.date == date) {
            Some(day) => day.records.push(r.clone()),
            None => days.push(DayGroup {
                date,
                records: vec![r.clone()],
            }),
        }
    }
    HistoryByDate { days }
}

/// Keeps a `HistoryByDate` snapshot in sync with the store.
pub struct HistoryFeed {
    snapshot: watch::Receiver<Arc<HistoryByDate>>,
    handle: JoinHandle<()>,
}

impl HistoryFeed {
    pub async fn spawn(store: HistoryStore, cancel: CancellationToken) -> Self {
        let mut changes = store.subscribe();
        changes.mark_unchanged();

        let initial = match store.stream_all().await {
            Ok(records) => group_by_date(&records),
            Err(err) => {
                error!("initial history load failed: {err}");
                HistoryByDate::default()
            }
        };
        let (tx, snapshot) = watch::channel(Arc::new(initial));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        changes.mark_unchanged();
                        match store.stream_all().await {
                            Ok(records) => {
                                let grouped = group_by_date(&records);
                                debug!(
                                    "history rebuilt: {} records over {} days",
                                    grouped.total_records(),
                                    grouped.days.len()
                                );
                                let _ = tx.send(Arc::new(grouped));
                            }
                            Err(err) => error!("history rebuild failed: {err}"),
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            info!("history feed stopped");
        });

        Self { snapshot, handle }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<HistoryByDate>> {
        self.snapshot.clone()
    }

    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            error!("history feed task failed: {err}");
        }
    }
}
