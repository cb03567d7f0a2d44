//! Job and item records for the capture engine
//!
//! A `Job` is one capture run over a set of accounts; an `Item` is one
//! capturable unit (tweet, retweet, or thread) within it. Items double as
//! checkpoint records: the serialized item is exactly what the engine
//! rebuilds its state from after a restart.

use crate::config::{JobSpec, OutputFormat};
use crate::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a capture job
///
/// Transitions are forward-only except `Running ⇄ Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            (Paused, Running) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One capture run, owned exclusively by the `JobManager`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub accounts: Vec<String>,
    pub days_back: i64,
    pub max_tweets_per_account: usize,
    pub concurrency: Option<usize>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
}

impl Job {
    pub fn new(spec: &JobSpec) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            accounts: spec.accounts.clone(),
            days_back: spec.days_back,
            max_tweets_per_account: spec.max_tweets_per_account,
            concurrency: spec.concurrency,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
        }
    }

    /// All items have reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.completed_items + self.failed_items == self.total_items
    }

    /// Fraction of items that failed permanently, 0.0 for an empty job.
    pub fn failure_ratio(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            self.failed_items as f64 / self.total_items as f64
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Kind of capturable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Tweet,
    Retweet,
    Thread,
}

impl ItemKind {
    /// Lowercase label used in artifact keys.
    pub fn label(&self) -> &'static str {
        match self {
            ItemKind::Tweet => "tweet",
            ItemKind::Retweet => "retweet",
            ItemKind::Thread => "thread",
        }
    }
}

/// Processing state of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    PermanentlyFailed,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Succeeded | ItemState::Failed | ItemState::PermanentlyFailed
        )
    }
}

/// Time-bounded ownership claim on an item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One capturable unit within a job; also the durable checkpoint record
///
/// Items are never deleted, only marked terminal, so a crash leaves
/// auditable state behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub account: String,
    pub kind: ItemKind,
    pub state: ItemState,
    pub attempt_count: usize,
    pub last_error_category: Option<ErrorCategory>,
    pub artifact_keys: Vec<String>,
    pub checkpoint_version: u64,
    pub lease: Option<Lease>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn from_tweet(tweet: &Tweet) -> Self {
        Self {
            item_id: tweet.id.clone(),
            account: tweet.account.clone(),
            kind: tweet.kind,
            state: ItemState::Pending,
            attempt_count: 0,
            last_error_category: None,
            artifact_keys: Vec::new(),
            checkpoint_version: 0,
            lease: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the item can be claimed: pending, or in-progress past its lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            ItemState::Pending => true,
            ItemState::InProgress => self
                .lease
                .as_ref()
                .map(|l| l.is_expired(now))
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Canonical URL the renderer navigates to.
    pub fn url(&self) -> String {
        format!("https://x.com/{}/status/{}", self.account, self.item_id)
    }
}

/// One tweet as enumerated by the `TweetSource`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    pub account: String,
    pub kind: ItemKind,
    pub created_at: DateTime<Utc>,
}

/// Deterministic artifact key: `{date}/{account}/{kind}_{item_id}/{timestamp}_page_{n}`
///
/// Unique per item and page, so concurrent uploads never collide and a retry
/// of the same capture lands on the same prefix.
pub fn artifact_key(
    item: &Item,
    captured_at: DateTime<Utc>,
    page: usize,
    format: OutputFormat,
) -> String {
    let ext = match format {
        OutputFormat::Png => "png",
        OutputFormat::Jpeg => "jpg",
        OutputFormat::Webp => "webp",
    };
    format!(
        "{}/{}/{}_{}/{}_page_{}.{}",
        captured_at.format("%Y-%m-%d"),
        item.account,
        item.kind.label(),
        item.item_id,
        captured_at.format("%H%M%S"),
        page,
        ext
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_item() -> Item {
        Item::from_tweet(&Tweet {
            id: "17283945".to_string(),
            account: "nasa".to_string(),
            kind: ItemKind::Thread,
            created_at: Utc::now(),
        })
    }

    #[test]
    fn status_transitions_are_forward_only() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Paused.can_transition_to(Cancelled));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Paused));
    }

    #[test]
    fn claimable_states() {
        let now = Utc::now();
        let mut item = sample_item();
        assert!(item.is_claimable(now));

        item.state = ItemState::InProgress;
        item.lease = Some(Lease {
            owner: "w1".to_string(),
            expires_at: now + chrono::Duration::seconds(60),
        });
        assert!(!item.is_claimable(now));

        item.lease = Some(Lease {
            owner: "w1".to_string(),
            expires_at: now - chrono::Duration::seconds(1),
        });
        assert!(item.is_claimable(now));

        item.state = ItemState::Succeeded;
        assert!(!item.is_claimable(now));
    }

    #[test]
    fn artifact_key_layout() {
        let item = sample_item();
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let key = artifact_key(&item, at, 2, OutputFormat::Png);
        assert_eq!(key, "2026-03-14/nasa/thread_17283945/092653_page_2.png");
    }

    #[test]
    fn failure_ratio_handles_empty_job() {
        let spec = JobSpec {
            accounts: vec!["nasa".to_string()],
            days_back: 7,
            max_tweets_per_account: 10,
            concurrency: None,
        };
        let mut job = Job::new(&spec);
        assert_eq!(job.failure_ratio(), 0.0);
        job.total_items = 4;
        job.failed_items = 1;
        assert_eq!(job.failure_ratio(), 0.25);
    }
}
