mod config;
mod dedup;
mod error;
mod event;
mod extract;
mod history;
mod http;
mod pipeline;
mod store;

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::{parse_listen, Args, Settings},
    dedup::DedupGate,
    event::EventFilter,
    extract::Extractor,
    history::HistoryFeed,
    http::AppState,
    pipeline::{IngestQueue, Pipeline},
    store::HistoryStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nowplaying_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::from_args(&args);
    let addr = parse_listen(&args.listen)?;

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = HistoryStore::open(&args.db)?;

    let filter = EventFilter::new(settings.source_packages.iter().cloned());
    let gate = DedupGate::new(
        store.clone(),
        chrono::Duration::minutes(settings.dedup_window_minutes),
    );
    let pipeline = Arc::new(Pipeline::new(filter, Extractor::default(), gate));

    let cancel = CancellationToken::new();
    let (queue, workers) = IngestQueue::start(
        pipeline.clone(),
        settings.queue_capacity,
        settings.workers,
        cancel.clone(),
    );
    let feed = HistoryFeed::spawn(store.clone(), cancel.clone()).await;

    let app = http::router(AppState {
        queue,
        history: feed.subscribe(),
        store,
    });

    info!("Core listening on http://{addr}");
    info!("DB: {}", args.db.display());
    info!(
        "accepting {} (dedup window {} min, {} workers)",
        pipeline.filter_packages().join(", "),
        settings.dedup_window_minutes,
        settings.workers
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    workers.shutdown().await;
    feed.join().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
