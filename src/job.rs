// src/job.rs
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A job claimed from the queue, held by the worker while it runs.
///
/// `token` identifies the lease the job was claimed under; every renewal and
/// terminal transition must present it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub payload: Value,
    pub token: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start_date, self.end_date)
    }
}

/// What a job asks the worker to do, decided once from the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Backup { project_id: String },
    Initialize(DateRange),
    Invalid(Value),
}

impl JobPayload {
    /// A truthy `projectId` always wins; otherwise both range bounds must be
    /// truthy.
    pub fn classify(payload: &Value) -> Self {
        if let Some(project_id) = payload.get("projectId").and_then(truthy_key) {
            return JobPayload::Backup { project_id };
        }

        let start = payload.get("startDate").and_then(truthy_key);
        let end = payload.get("endDate").and_then(truthy_key);
        match (start, end) {
            (Some(start_date), Some(end_date)) => JobPayload::Initialize(DateRange {
                start_date,
                end_date,
            }),
            _ => JobPayload::Invalid(payload.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Backup { .. } => "backup",
            JobPayload::Initialize(_) => "initialize",
            JobPayload::Invalid(_) => "invalid",
        }
    }
}

// Loose truthiness: empty strings, zero, false and null do not count as set.
fn truthy_key(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Result of one project backup: sub-unit failures are data, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackupSummary {
    pub errors: u64,
    pub completed: u64,
}

impl BackupSummary {
    pub fn succeeded(&self) -> u64 {
        self.completed.saturating_sub(self.errors)
    }
}

/// Per-job overrides handed to the backup collaborator. Currently empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOptions {}

/// Why a job failed, as handed to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn project_id_wins_over_date_range() {
        let payload = json!({
            "projectId": "P1",
            "startDate": "2024-01-01",
            "endDate": "2024-01-31",
        });
        assert_eq!(
            JobPayload::classify(&payload),
            JobPayload::Backup { project_id: "P1".into() }
        );
    }

    #[test]
    fn numeric_project_id_is_stringified() {
        let payload = json!({ "projectId": 42 });
        assert_eq!(
            JobPayload::classify(&payload),
            JobPayload::Backup { project_id: "42".into() }
        );
    }

    #[test]
    fn falsy_project_id_falls_through_to_range() {
        let payload = json!({
            "projectId": "",
            "startDate": "2024-01-01",
            "endDate": "2024-01-31",
        });
        assert_eq!(
            JobPayload::classify(&payload),
            JobPayload::Initialize(DateRange {
                start_date: "2024-01-01".into(),
                end_date: "2024-01-31".into(),
            })
        );
    }

    #[test]
    fn half_a_range_is_invalid() {
        for payload in [
            json!({ "startDate": "2024-01-01" }),
            json!({ "endDate": "2024-01-31" }),
            json!({ "startDate": null, "endDate": "2024-01-31" }),
            json!({ "projectId": 0 }),
            json!({}),
            json!("projectId"),
        ] {
            assert!(
                matches!(JobPayload::classify(&payload), JobPayload::Invalid(_)),
                "{payload} should be invalid"
            );
        }
    }

    #[test]
    fn partial_failure_split() {
        let summary = BackupSummary { errors: 2, completed: 10 };
        assert_eq!(summary.succeeded(), 8);
        let nonsense = BackupSummary { errors: 5, completed: 1 };
        assert_eq!(nonsense.succeeded(), 0);
    }

    #[test]
    fn date_range_display() {
        let range = DateRange {
            start_date: "2024-01-01".into(),
            end_date: "2024-01-31".into(),
        };
        assert_eq!(range.to_string(), "2024-01-01 - 2024-01-31");
    }
}
