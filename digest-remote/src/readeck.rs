//! Bookmark archive adapter for the Readeck REST API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use digest_core::config::ArchiveSettings;
use digest_core::SourceRef;

use crate::boundary::{ArchiveBoundary, ArchiveItem};
use crate::error::RemoteError;
use crate::http;

pub struct ReadeckClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    lookback_days: u32,
    page_limit: u32,
}

/// Subset of the bookmark payload the digest uses.
#[derive(Debug, Deserialize)]
struct Bookmark {
    id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl From<Bookmark> for ArchiveItem {
    fn from(bm: Bookmark) -> Self {
        ArchiveItem {
            source_ref: SourceRef::from(bm.id),
            url: bm.url,
            title: bm.title,
            kind: bm.kind,
        }
    }
}

impl ReadeckClient {
    pub fn new(settings: &ArchiveSettings, timeout: Duration) -> Result<Self, RemoteError> {
        Ok(Self {
            client: http::client(timeout)?,
            base_url: settings.url.clone(),
            token: settings.token.clone(),
            lookback_days: settings.lookback_days,
            page_limit: settings.page_limit,
        })
    }

    /// Query string for the bookmarks created in the lookback window
    /// ending at `now`.
    fn weekly_query(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let since = now - chrono::Duration::days(i64::from(self.lookback_days));
        vec![
            ("range_start", since.format("%Y-%m-%d").to_string()),
            ("sort", "-created".to_string()),
            ("limit", self.page_limit.to_string()),
            ("page", "1".to_string()),
        ]
    }
}

#[async_trait]
impl ArchiveBoundary for ReadeckClient {
    async fn list_weekly_items(&self) -> Result<Vec<ArchiveItem>, RemoteError> {
        let request = self
            .client
            .get(http::join(&self.base_url, "/api/bookmarks"))
            .bearer_auth(&self.token)
            .query(&self.weekly_query(Utc::now()));
        let bookmarks: Vec<Bookmark> = http::send(request).await?.json().await?;
        tracing::info!(count = bookmarks.len(), "weekly bookmarks retrieved");
        Ok(bookmarks.into_iter().map(ArchiveItem::from).collect())
    }

    async fn fetch_extracted_text(
        &self,
        item: &ArchiveItem,
    ) -> Result<Option<String>, RemoteError> {
        let path = format!("/api/bookmarks/{}/article.md", item.source_ref);
        let request = self
            .client
            .get(http::join(&self.base_url, &path))
            .bearer_auth(&self.token);
        match http::send(request).await {
            Ok(response) => {
                let text = response.text().await?;
                Ok(Some(text).filter(|t| !t.trim().is_empty()))
            }
            Err(RemoteError::Rejected { status: 404, .. }) => {
                tracing::info!(source_ref = %item.source_ref, "no extracted content");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn weekly_query_covers_lookback_window() {
        let settings = ArchiveSettings {
            lookback_days: 7,
            page_limit: 50,
            ..ArchiveSettings::default()
        };
        let client = ReadeckClient::new(&settings, Duration::from_secs(5)).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 8, 23, 0, 0).unwrap();
        let query = client.weekly_query(now);
        assert!(query.contains(&("range_start", "2026-03-01".to_string())));
        assert!(query.contains(&("sort", "-created".to_string())));
        assert!(query.contains(&("limit", "50".to_string())));
    }

    #[test]
    fn bookmark_payload_maps_to_archive_item() {
        let json = r#"[
            {"id": "a1", "url": "https://example.org/x.pdf", "title": "Paper", "type": "article"},
            {"id": "b2", "url": "https://example.org/post"}
        ]"#;
        let bookmarks: Vec<Bookmark> = serde_json::from_str(json).unwrap();
        let items: Vec<ArchiveItem> = bookmarks.into_iter().map(ArchiveItem::from).collect();
        assert_eq!(items[0].source_ref, SourceRef::from("a1"));
        assert!(!items[0].is_browsable());
        assert_eq!(items[1].title, None);
        assert!(items[1].is_browsable());
    }
}
