use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::TaskId;

/// A time-bounded claim granting one worker exclusive visibility of an
/// envelope. Owned by the broker; once `expires_at` passes the envelope
/// becomes reclaimable by any other worker (crash recovery without
/// mutexes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLease {
    pub worker_id: String,
    pub queue: String,
    pub task_id: TaskId,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WorkerLease {
    pub fn new(
        worker_id: impl Into<String>,
        queue: impl Into<String>,
        task_id: TaskId,
        duration: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let duration = chrono::Duration::from_std(duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2));
        Self {
            worker_id: worker_id.into(),
            queue: queue.into(),
            task_id,
            granted_at: now,
            expires_at: now + duration,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn extend(&mut self, extension: std::time::Duration) {
        if let Ok(extension) = chrono::Duration::from_std(extension) {
            self.expires_at += extension;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lease_expires_after_duration() {
        let now = Utc::now();
        let lease = WorkerLease::new("w-1", "default", TaskId::new(), Duration::from_secs(5), now);
        assert!(!lease.is_expired(now));
        assert!(!lease.is_expired(now + chrono::Duration::seconds(4)));
        assert!(lease.is_expired(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn extension_pushes_expiry_out() {
        let now = Utc::now();
        let mut lease =
            WorkerLease::new("w-1", "default", TaskId::new(), Duration::from_secs(5), now);
        lease.extend(Duration::from_secs(10));
        assert!(!lease.is_expired(now + chrono::Duration::seconds(14)));
        assert!(lease.is_expired(now + chrono::Duration::seconds(15)));
    }
}
