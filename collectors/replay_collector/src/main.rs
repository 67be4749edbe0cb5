use clap::Parser;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "replay_collector", version)]
struct Args {
    /// Core base URL, e.g. http://127.0.0.1:17700
    #[arg(long, default_value = "http://127.0.0.1:17700")]
    core_url: String,

    /// Captured notifications, one JSON object per line. Use `-` for stdin.
    ///
    /// Each line looks like
    /// {"sourcePackage":"com.google.android.as","rawTitle":"Song (Artist)","rawBody":null}
    /// and may carry "delayMs" to wait before that notification is delivered.
    #[arg(long)]
    input: PathBuf,

    /// Pause between notifications (milliseconds), on top of any per-line delay.
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
struct CapturedNotification {
    #[serde(rename = "sourcePackage")]
    source_package: String,
    #[serde(rename = "rawTitle", default)]
    raw_title: Option<String>,
    #[serde(rename = "rawBody", default)]
    raw_body: Option<String>,
    #[serde(rename = "delayMs", default, skip_serializing)]
    delay_ms: u64,
}

impl CapturedNotification {
    fn wait_ms(&self, interval_ms: u64) -> u64 {
        self.delay_ms.saturating_add(interval_ms)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Skip,
    Notification(CapturedNotification),
    Invalid(String),
}

fn parse_line(raw: &str) -> Line {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Skip;
    }
    match serde_json::from_str::<CapturedNotification>(trimmed) {
        Ok(n) => Line::Notification(n),
        Err(e) => Line::Invalid(e.to_string()),
    }
}

#[derive(Debug, Default)]
struct Summary {
    sent: usize,
    rejected: usize,
    failed: usize,
    invalid: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replay_collector=info".into()),
        )
        .init();

    let args = Args::parse();
    let endpoint = format!("{}/notification", args.core_url.trim_end_matches('/'));
    info!("Replay collector started. Posting to {endpoint}");

    let summary = if args.input.as_os_str() == "-" {
        replay(BufReader::new(tokio::io::stdin()), &endpoint, args.interval_ms).await?
    } else {
        let file = tokio::fs::File::open(&args.input).await?;
        replay(BufReader::new(file), &endpoint, args.interval_ms).await?
    };

    info!(
        "replay finished: sent={} rejected={} failed={} invalid={}",
        summary.sent, summary.rejected, summary.failed, summary.invalid
    );
    Ok(())
}

async fn replay<R: AsyncBufRead + Unpin>(
    reader: R,
    endpoint: &str,
    interval_ms: u64,
) -> anyhow::Result<Summary> {
    let client = Client::new();
    let mut summary = Summary::default();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(raw) = lines.next_line().await? {
        line_no += 1;
        let notification = match parse_line(&raw) {
            Line::Skip => continue,
            Line::Invalid(e) => {
                warn!("line {line_no}: skipping malformed notification ({e})");
                summary.invalid += 1;
                continue;
            }
            Line::Notification(n) => n,
        };

        let wait = notification.wait_ms(interval_ms);
        if wait > 0 {
            sleep(Duration::from_millis(wait)).await;
        }

        // Serial delivery, like the OS dispatcher: one request at a time.
        match client.post(endpoint).json(&notification).send().await {
            Ok(res) if res.status().is_success() => {
                summary.sent += 1;
            }
            Ok(res) => {
                warn!("line {line_no}: core rejected notification ({})", res.status());
                summary.rejected += 1;
            }
            Err(e) => {
                error!("line {line_no}: post failed: {e}");
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}
