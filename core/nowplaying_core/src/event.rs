use serde::Deserialize;
use std::collections::HashSet;

// Pixel "Now Playing" notifications moved from the legacy ambient-services
// package to Android System Intelligence.
pub const DEFAULT_SOURCE_PACKAGES: [&str; 2] =
    ["com.google.intelligence.sense", "com.google.android.as"];

#[derive(Clone, Debug, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "sourcePackage")]
    pub source_package: String,
    #[serde(rename = "rawTitle", default)]
    pub raw_title: Option<String>,
    #[serde(rename = "rawBody", default)]
    pub raw_body: Option<String>,
}

#[derive(Clone, Debug)]
pub struct EventFilter {
    allowed: HashSet<String>,
}

impl EventFilter {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: packages
                .into_iter()
                .map(|p| Into::<String>::into(p).trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn accepts(&self, event: &NotificationEvent) -> bool {
        self.allowed.contains(event.source_package.as_str())
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_PACKAGES)
    }
}
