use super::buffer::LogBuffer;
use super::process::ChildHandle;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

#[derive(
    Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
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

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Every job passes through Running; terminal states only leave via a new start.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Running, JobStatus::Running) => false,
            (_, JobStatus::Running) => true,
            (JobStatus::Running, s) => s.is_terminal(),
            _ => false,
        }
    }
}

/// The single live job owned by the job service.
#[derive(Debug)]
pub struct JobRecord {
    pub id: Option<uuid::Uuid>,
    pub status: JobStatus,
    pub logs: LogBuffer,
    /// Lines ever appended to `logs` during this job, evicted ones included
    pub logged: u64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    /// Present only while a child process is alive
    pub child: Option<ChildHandle>,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
}

impl JobRecord {
    pub fn idle(log_capacity: usize) -> Self {
        Self {
            id: None,
            status: JobStatus::Idle,
            logs: LogBuffer::new(log_capacity),
            logged: 0,
            result: None,
            error: None,
            cancel_requested: false,
            child: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Fresh record for a newly started job, already Running.
    pub fn running(id: uuid::Uuid, log_capacity: usize) -> Self {
        Self {
            id: Some(id),
            status: JobStatus::Running,
            started_at: Some(Local::now()),
            ..Self::idle(log_capacity)
        }
    }

    pub fn push_log(&mut self, line: String) {
        self.logs.push(line);
        self.logged += 1;
    }

    /// Retained lines numbered `seq` and later, and the next sequence number.
    pub fn logs_since(&self, seq: u64) -> (Vec<String>, u64) {
        let first_retained = self.logged - self.logs.len() as u64;
        let skip = seq.saturating_sub(first_retained);
        let lines = self
            .logs
            .iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        (lines, self.logged)
    }

    /// Move to a terminal state. Returns false (and changes nothing) if the
    /// transition is not allowed.
    pub fn finish(&mut self, status: JobStatus) -> bool {
        if !status.is_terminal() || !self.status.can_transition_to(status) {
            tracing::warn!(
                "Ignoring invalid job transition {} -> {}",
                self.status,
                status
            );
            return false;
        }
        self.status = status;
        self.child = None;
        self.finished_at = Some(Local::now());
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            status: self.status,
            logs: self.logs.to_vec(),
            result: self.result.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Consistent copy of the job record taken in one lock acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Option<uuid::Uuid>,
    pub status: JobStatus,
    pub logs: Vec<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_status_display_roundtrip() {
        for status in JobStatus::iter() {
            let text = status.to_string();
            assert_eq!(text, text.to_lowercase());
            assert_eq!(JobStatus::from_str(&text).unwrap(), status);
        }
    }

    #[test]
    fn test_transitions_pass_through_running() {
        use JobStatus::*;
        assert!(Idle.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Running));
    }

    #[test]
    fn test_finish_rejects_invalid_transition() {
        let mut record = JobRecord::idle(10);
        assert!(!record.finish(JobStatus::Completed));
        assert_eq!(record.status, JobStatus::Idle);

        let mut record = JobRecord::running(uuid::Uuid::new_v4(), 10);
        assert!(record.id.is_some());
        assert!(record.finish(JobStatus::Failed));
        assert!(record.finished_at.is_some());
        assert!(!record.finish(JobStatus::Completed));
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[test]
    fn test_logs_since_counts_repeated_lines() {
        let mut record = JobRecord::running(uuid::Uuid::new_v4(), 3);
        for _ in 0..3 {
            record.push_log("progress".into());
        }
        let (lines, seq) = record.logs_since(0);
        assert_eq!(lines.len(), 3);
        assert_eq!(seq, 3);

        record.push_log("progress".into());
        record.push_log("progress".into());
        let (lines, seq) = record.logs_since(seq);
        assert_eq!(lines, vec!["progress", "progress"]);
        assert_eq!(seq, 5);
        assert!(record.logs_since(seq).0.is_empty());
    }

    #[test]
    fn test_logs_since_skips_evicted_lines() {
        let mut record = JobRecord::running(uuid::Uuid::new_v4(), 2);
        for line in ["a", "b", "c", "d", "e"] {
            record.push_log(line.into());
        }
        assert_eq!(record.logs_since(1), (vec!["d".to_string(), "e".to_string()], 5));
        assert_eq!(record.logs_since(4), (vec!["e".to_string()], 5));
    }

    #[test]
    fn test_snapshot_copies_logs() {
        let mut record = JobRecord::running(uuid::Uuid::new_v4(), 2);
        record.push_log("a".into());
        record.push_log("b".into());
        record.push_log("c".into());
        let snap = record.snapshot();
        assert_eq!(snap.status, JobStatus::Running);
        assert_eq!(snap.logs, vec!["b", "c"]);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "running");
    }
}
