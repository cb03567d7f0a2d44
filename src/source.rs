//! Tweet enumeration for job creation
//!
//! The control plane hands the engine account handles, not item lists; this
//! module resolves each account into concrete capturable tweets at
//! `create_job` time. The engine only depends on the [`TweetSource`] trait;
//! the HTTP implementation targets a syndication-style JSON timeline.

use crate::error::CaptureError;
use crate::job::{ItemKind, Tweet};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::time::Duration as StdDuration;
use tracing::debug;

#[async_trait]
pub trait TweetSource: Send + Sync {
    /// Most recent tweets for `account`, newest first, bounded by the
    /// `days_back` window and the per-account cap.
    async fn fetch_recent(
        &self,
        account: &str,
        days_back: i64,
        max: usize,
    ) -> Result<Vec<Tweet>, CaptureError>;
}

/// Timeline entry as served by the enumeration endpoint.
#[derive(Debug, Deserialize)]
struct TimelineEntry {
    id_str: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    retweeted: bool,
    #[serde(default)]
    is_thread: bool,
}

impl TimelineEntry {
    fn kind(&self) -> ItemKind {
        if self.is_thread {
            ItemKind::Thread
        } else if self.retweeted {
            ItemKind::Retweet
        } else {
            ItemKind::Tweet
        }
    }
}

/// HTTP tweet source over the configured timeline endpoint.
pub struct HttpTweetSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTweetSource {
    pub fn new(base_url: &str, user_agent: Option<&str>) -> Result<Self, CaptureError> {
        let mut builder = reqwest::Client::builder().timeout(StdDuration::from_secs(30));
        if let Some(ua) = user_agent {
            builder = builder.user_agent(ua.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| CaptureError::Source(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TweetSource for HttpTweetSource {
    async fn fetch_recent(
        &self,
        account: &str,
        days_back: i64,
        max: usize,
    ) -> Result<Vec<Tweet>, CaptureError> {
        let url = format!("{}/timeline/{}", self.base_url, account);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CaptureError::NotFound(format!("account {account}")));
        }
        if !response.status().is_success() {
            return Err(CaptureError::Source(format!(
                "timeline request for {} returned {}",
                account,
                response.status()
            )));
        }

        let entries: Vec<TimelineEntry> = response.json().await?;
        let cutoff = Utc::now() - Duration::days(days_back);

        let tweets: Vec<Tweet> = entries
            .into_iter()
            .filter(|e| e.created_at >= cutoff)
            .take(max)
            .map(|e| Tweet {
                id: e.id_str.clone(),
                account: account.to_string(),
                kind: e.kind(),
                created_at: e.created_at,
            })
            .collect();

        debug!("Enumerated {} tweets for @{}", tweets.len(), account);
        Ok(tweets)
    }
}
