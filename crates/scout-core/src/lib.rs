//! Core domain model and run bookkeeping types for Scout.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-core";

/// Canonical organisation record derived from the sponsor register.
///
/// `name` is the natural key across snapshot rows; `id` is assigned only once
/// the entity is persisted, so freshly parsed entities carry `None`. The three
/// list fields keep first-occurrence order from the snapshot, and equality on
/// them is deliberately order-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organisation {
    pub id: Option<Uuid>,
    pub name: String,
    pub county: String,
    pub town_cities: Vec<String>,
    pub type_and_ratings: Vec<String>,
    pub routes: Vec<String>,
}

impl Organisation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            county: String::new(),
            town_cities: Vec::new(),
            type_and_ratings: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// Lifecycle status of one reconciliation run.
///
/// Exactly one record may be `InProgress` at a time; every run ends in one of
/// the three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
    NoUpdate,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "InProgress",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
            RunStatus::NoUpdate => "NoUpdate",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InProgress" => Ok(RunStatus::InProgress),
            "Completed" => Ok(RunStatus::Completed),
            "Failed" => Ok(RunStatus::Failed),
            "NoUpdate" => Ok(RunStatus::NoUpdate),
            other => Err(UnknownRunStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRunStatus(pub String);

impl fmt::Display for UnknownRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown run status {:?}", self.0)
    }
}

impl std::error::Error for UnknownRunStatus {}

/// One failure observed during a run, kept for later inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub origin: String,
    pub trace: Option<String>,
}

impl RunError {
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            origin: origin.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddedRecords {
    pub count: usize,
    pub organisation_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletedRecords {
    pub count: usize,
    pub organisation_names: Vec<String>,
}

/// Before/after images captured at the moment an in-place update is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDetail {
    pub before: Organisation,
    pub after: Organisation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatedRecords {
    pub count: usize,
    pub details: Vec<UpdateDetail>,
}

/// Resumable record of one reconciliation attempt.
///
/// Holds the source file identity, timestamps, accumulated outcome counters
/// and any errors. The persisted copy of the single `InProgress` record is the
/// anchor that lets a later invocation pick up a crashed run instead of
/// starting a duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub status: RunStatus,
    pub file_name: Option<String>,
    pub source_last_update: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_records_processed: usize,
    pub added: AddedRecords,
    pub updated: UpdatedRecords,
    pub deleted: DeletedRecords,
    pub errors: Vec<RunError>,
}

impl RunRecord {
    /// Fresh `InProgress` record for a new invocation.
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::InProgress,
            file_name: None,
            source_last_update: None,
            started_at: Utc::now(),
            finished_at: None,
            total_records_processed: 0,
            added: AddedRecords::default(),
            updated: UpdatedRecords::default(),
            deleted: DeletedRecords::default(),
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, error: RunError) {
        self.errors.push(error);
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_strings() {
        for status in [
            RunStatus::InProgress,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::NoUpdate,
        ] {
            let parsed: RunStatus = status.as_str().parse().expect("parse status");
            assert_eq!(parsed, status);
        }
        assert!("Stalled".parse::<RunStatus>().is_err());
    }

    #[test]
    fn new_run_record_starts_in_progress_with_empty_outcome() {
        let run = RunRecord::begin();
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(run.file_name.is_none());
        assert!(run.finished_at.is_none());
        assert_eq!(run.added.count, 0);
        assert_eq!(run.updated.count, 0);
        assert_eq!(run.deleted.count, 0);
        assert!(run.errors.is_empty());
        assert!(!run.is_terminal());
    }

    #[test]
    fn list_field_equality_is_order_sensitive() {
        let mut a = Organisation::new("Acme Corporation");
        a.town_cities = vec!["London".into(), "Manchester".into()];
        let mut b = a.clone();
        b.town_cities = vec!["Manchester".into(), "London".into()];
        assert_ne!(a, b);
    }
}
