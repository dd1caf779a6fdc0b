use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Append-only text log that keeps only the most recent `max_chars`
/// characters.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    text: String,
    max_chars: usize,
}

impl LogBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            max_chars,
        }
    }

    pub fn push(&mut self, entry: &str) {
        self.text.push_str(entry);
        self.truncate_front();
    }

    pub fn push_line(&mut self, line: &str) {
        self.text.push('\n');
        self.push(line);
    }

    /// Drop the oldest characters until at most `max_chars` remain.
    fn truncate_front(&mut self) {
        let len = self.text.chars().count();
        if len <= self.max_chars {
            return;
        }
        let excess = len - self.max_chars;
        let cut = self
            .text
            .char_indices()
            .nth(excess)
            .map(|(idx, _)| idx)
            .unwrap_or(self.text.len());
        self.text.drain(..cut);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Snapshot of a worker for the local status API.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub online: bool,
    pub current_job: Option<Uuid>,
}

/// Process-local worker state. Shared between the agent loop and the local
/// API; reset on restart.
#[derive(Debug)]
pub struct WorkerStatus {
    online: AtomicBool,
    loop_active: AtomicBool,
    current_job: RwLock<Option<Uuid>>,
    logs: RwLock<LogBuffer>,
}

impl WorkerStatus {
    pub fn new(log_limit: usize) -> Self {
        Self {
            online: AtomicBool::new(false),
            loop_active: AtomicBool::new(false),
            current_job: RwLock::new(None),
            logs: RwLock::new(LogBuffer::new(log_limit)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Set the online flag, returning its previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }

    /// Mark the agent loop as running. False if one already is.
    pub fn claim_loop(&self) -> bool {
        !self.loop_active.swap(true, Ordering::SeqCst)
    }

    pub fn release_loop(&self) {
        self.loop_active.store(false, Ordering::SeqCst);
    }

    pub async fn current_job(&self) -> Option<Uuid> {
        *self.current_job.read().await
    }

    pub async fn set_current_job(&self, job_id: Option<Uuid>) {
        *self.current_job.write().await = job_id;
    }

    pub async fn log(&self, entry: &str) {
        self.logs.write().await.push(entry);
    }

    pub async fn log_line(&self, line: &str) {
        self.logs.write().await.push_line(line);
    }

    pub async fn logs(&self) -> String {
        self.logs.read().await.as_str().to_string()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            online: self.is_online(),
            current_job: self.current_job().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_limit() {
        let mut log = LogBuffer::new(10);
        log.push("hello");
        assert_eq!(log.as_str(), "hello");
    }

    #[test]
    fn retains_most_recent_characters() {
        let mut log = LogBuffer::new(5);
        log.push("abc");
        log.push("defgh");
        assert_eq!(log.as_str(), "defgh");
        log.push("ij");
        assert_eq!(log.as_str(), "fghij");
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let mut log = LogBuffer::new(4);
        log.push("ééééé✓");
        assert_eq!(log.as_str(), "ééé✓");
        assert_eq!(log.char_len(), 4);
    }

    #[test]
    fn bounded_at_fifty_thousand() {
        let mut log = LogBuffer::new(50_000);
        let chunk: String = (0..1_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let mut all = String::new();
        for _ in 0..70 {
            log.push(&chunk);
            all.push_str(&chunk);
            assert!(log.char_len() <= 50_000);
        }

        assert_eq!(log.char_len(), 50_000);
        assert_eq!(log.as_str(), &all[all.len() - 50_000..]);
    }

    #[test]
    fn push_line_prefixes_newline() {
        let mut log = LogBuffer::new(100);
        log.push_line("Starting job");
        assert_eq!(log.as_str(), "\nStarting job");
    }

    #[tokio::test]
    async fn status_defaults_offline() {
        let status = WorkerStatus::new(100);
        assert!(!status.is_online());
        assert!(!status.set_online(true));
        assert!(status.set_online(true));

        assert!(status.claim_loop());
        assert!(!status.claim_loop());
        status.release_loop();
        assert!(status.claim_loop());

        let snapshot = status.snapshot().await;
        assert!(snapshot.online);
        assert!(snapshot.current_job.is_none());
    }
}
