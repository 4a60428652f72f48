use crate::collaborators::ExtractedRecord;
use crate::report::FailureCategory;
use crate::tier::TierUsed;
use serde::Serialize;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Detail {
    Success {
        record: ExtractedRecord,
        location: String,
    },
    Failed {
        category: FailureCategory,
        message: String,
    },
    Skipped {
        reason: String,
    },
}

/// Result of processing one item in one run. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingOutcome {
    index: usize,
    item_id: Uuid,
    tier: TierUsed,
    #[serde(with = "crate::config::duration_ms")]
    duration: Duration,
    #[serde(flatten)]
    detail: Detail,
}

impl ProcessingOutcome {
    pub fn success(
        index: usize,
        item_id: Uuid,
        record: ExtractedRecord,
        location: impl Into<String>,
        tier: TierUsed,
        duration: Duration,
    ) -> Self {
        Self {
            index,
            item_id,
            tier,
            duration,
            detail: Detail::Success {
                record,
                location: location.into(),
            },
        }
    }

    pub fn failed(
        index: usize,
        item_id: Uuid,
        category: FailureCategory,
        message: impl Into<String>,
        tier: TierUsed,
        duration: Duration,
    ) -> Self {
        Self {
            index,
            item_id,
            tier,
            duration,
            detail: Detail::Failed {
                category,
                message: message.into(),
            },
        }
    }

    pub fn skipped(
        index: usize,
        item_id: Uuid,
        reason: impl Into<String>,
        tier: TierUsed,
        duration: Duration,
    ) -> Self {
        Self {
            index,
            item_id,
            tier,
            duration,
            detail: Detail::Skipped {
                reason: reason.into(),
            },
        }
    }

    /// Position of the item in its batch.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn item_id(&self) -> Uuid {
        self.item_id
    }

    pub fn status(&self) -> OutcomeStatus {
        match self.detail {
            Detail::Success { .. } => OutcomeStatus::Success,
            Detail::Failed { .. } => OutcomeStatus::Failed,
            Detail::Skipped { .. } => OutcomeStatus::Skipped,
        }
    }

    pub fn tier(&self) -> TierUsed {
        self.tier
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn record(&self) -> Option<&ExtractedRecord> {
        match &self.detail {
            Detail::Success { record, .. } => Some(record),
            _ => None,
        }
    }

    pub fn location(&self) -> Option<&str> {
        match &self.detail {
            Detail::Success { location, .. } => Some(location),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<(FailureCategory, &str)> {
        match &self.detail {
            Detail::Failed { category, message } => Some((*category, message)),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match &self.detail {
            Detail::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Outcome of one processor run. Derived from the outcome list only.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    submitter: String,
    outcomes: Vec<ProcessingOutcome>,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    #[serde(with = "crate::config::duration_ms")]
    elapsed: Duration,
    started_at: SystemTime,
    finished_at: SystemTime,
}

impl BatchResult {
    /// Build from outcomes; they are ordered by item index.
    pub fn from_outcomes(
        submitter: impl Into<String>,
        mut outcomes: Vec<ProcessingOutcome>,
        started_at: SystemTime,
        elapsed: Duration,
    ) -> Self {
        outcomes.sort_by_key(|o| o.index);
        let count = |s: OutcomeStatus| outcomes.iter().filter(|o| o.status() == s).count();
        let succeeded = count(OutcomeStatus::Success);
        let failed = count(OutcomeStatus::Failed);
        let skipped = count(OutcomeStatus::Skipped);
        Self {
            submitter: submitter.into(),
            succeeded,
            failed,
            skipped,
            elapsed,
            started_at,
            finished_at: started_at + elapsed,
            outcomes,
        }
    }

    pub fn submitter(&self) -> &str {
        &self.submitter
    }

    pub fn outcomes(&self) -> &[ProcessingOutcome] {
        &self.outcomes
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn success_count(&self) -> usize {
        self.succeeded
    }

    pub fn failure_count(&self) -> usize {
        self.failed
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped
    }

    /// Fraction in `[0, 1]`; `0` for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.succeeded as f64 / self.outcomes.len() as f64
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn finished_at(&self) -> SystemTime {
        self.finished_at
    }

    pub fn successes(&self) -> impl Iterator<Item = &ProcessingOutcome> {
        self.with_status(OutcomeStatus::Success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProcessingOutcome> {
        self.with_status(OutcomeStatus::Failed)
    }

    pub fn skips(&self) -> impl Iterator<Item = &ProcessingOutcome> {
        self.with_status(OutcomeStatus::Skipped)
    }

    fn with_status(&self, status: OutcomeStatus) -> impl Iterator<Item = &ProcessingOutcome> {
        self.outcomes.iter().filter(move |o| o.status() == status)
    }
}
