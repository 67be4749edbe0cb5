use regex::Regex;
use std::sync::LazyLock;

use crate::error::PipelineError;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

// "<title> (<artist>)" with half- or full-width brackets, optional half- or
// full-width space before the opening bracket.
static BRACKETED_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)[ \t\x{3000}]*[(（]([^()（）]+)[)）]$").expect("invalid bracketed suffix regex")
});

// Bodies that are system boilerplate rather than an artist name
// ("Tap to see your song history", "タップして履歴を表示").
const PLACEHOLDER_MARKERS: [&str; 4] = ["tap to", "history", "タップ", "履歴"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SongInfo {
    pub title: String,
    pub artist: String,
}

/// One way of reading a song out of notification text. Strategies return
/// `None` when the text is not in their format.
pub trait ExtractStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, title: &str, body: &str) -> Option<SongInfo>;
}

/// Newer builds put both fields into the title: `Shape of You (Ed Sheeran)`.
pub struct BracketedSuffix;

impl ExtractStrategy for BracketedSuffix {
    fn name(&self) -> &'static str {
        "bracketed_suffix"
    }

    fn extract(&self, title: &str, _body: &str) -> Option<SongInfo> {
        let caps = BRACKETED_SUFFIX.captures(title)?;
        let song = caps.get(1)?.as_str().trim();
        let artist = caps.get(2)?.as_str().trim();
        if song.is_empty() || artist.is_empty() {
            return None;
        }
        Some(SongInfo {
            title: song.to_string(),
            artist: artist.to_string(),
        })
    }
}

/// Older builds split the song across the title and body fields.
pub struct SplitFields;

impl ExtractStrategy for SplitFields {
    fn name(&self) -> &'static str {
        "split_fields"
    }

    fn extract(&self, title: &str, body: &str) -> Option<SongInfo> {
        let artist = if body.is_empty() || is_placeholder(body) {
            UNKNOWN_ARTIST
        } else {
            body
        };
        Some(SongInfo {
            title: title.to_string(),
            artist: artist.to_string(),
        })
    }
}

fn is_placeholder(body: &str) -> bool {
    let lowered = body.to_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m))
}

pub struct Extractor {
    strategies: Vec<Box<dyn ExtractStrategy>>,
}

impl Extractor {
    pub fn new(strategies: Vec<Box<dyn ExtractStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn extract(
        &self,
        raw_title: Option<&str>,
        raw_body: Option<&str>,
    ) -> Result<SongInfo, PipelineError> {
        let title = raw_title.unwrap_or_default().trim();
        if title.is_empty() {
            return Err(PipelineError::ExtractionSkipped);
        }
        let body = raw_body.unwrap_or_default().trim();

        for strategy in &self.strategies {
            if let Some(info) = strategy.extract(title, body) {
                tracing::trace!(strategy = strategy.name(), "extracted song");
                return Ok(info);
            }
        }
        Err(PipelineError::ExtractionSkipped)
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(vec![Box::new(BracketedSuffix), Box::new(SplitFields)])
    }
}
