//! Per-job log fan-out.
//!
//! Each job gets its own bounded `tokio::sync::broadcast` channel. A
//! subscriber sees only entries published after it attached; a subscriber
//! that falls more than `capacity` entries behind skips what it missed and
//! keeps its place in the stream.

use std::pin::Pin;

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::models::{LogEntry, LogLevel, LogRole};

pub type LogStream = Pin<Box<dyn Stream<Item = LogEntry> + Send>>;

pub struct LogBroadcaster {
    channels: DashMap<Uuid, broadcast::Sender<LogEntry>>,
    capacity: usize,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry to its job's stream. Never blocks; with nobody
    /// listening the entry only reaches the tracing output.
    pub fn publish(&self, entry: LogEntry) {
        trace_entry(&entry);
        if let Some(tx) = self.channels.get(&entry.job_id) {
            let _ = tx.send(entry);
        }
    }

    /// Convenience for the common "narrate a step" case.
    pub fn emit(&self, job_id: Uuid, round: u32, level: LogLevel, role: LogRole, message: impl Into<String>) {
        self.publish(LogEntry::new(job_id, round, level, role, message));
    }

    /// Attach a new consumer to a job's stream.
    pub fn subscribe(&self, job_id: Uuid) -> LogStream {
        let rx = self
            .channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| item.ok()))
    }

    /// Drop a job's channel. Streams of current subscribers end once they
    /// have drained what was already published.
    pub fn close(&self, job_id: Uuid) {
        self.channels.remove(&job_id);
    }

    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.channels
            .get(&job_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}

fn trace_entry(entry: &LogEntry) {
    match entry.level {
        LogLevel::Info | LogLevel::Success => tracing::info!(
            job_id = %entry.job_id,
            round = entry.round,
            role = ?entry.role,
            "{}",
            entry.message
        ),
        LogLevel::Warn => tracing::warn!(
            job_id = %entry.job_id,
            round = entry.round,
            role = ?entry.role,
            "{}",
            entry.message
        ),
        LogLevel::Error => tracing::error!(
            job_id = %entry.job_id,
            round = entry.round,
            role = ?entry.role,
            "{}",
            entry.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(job_id: Uuid, message: &str) -> LogEntry {
        LogEntry::new(job_id, 0, LogLevel::Info, LogRole::System, message)
    }

    async fn next(stream: &mut LogStream) -> Option<LogEntry> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream stalled")
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_entries_after_attach() {
        let logs = LogBroadcaster::new(16);
        let job = Uuid::new_v4();
        let mut early = logs.subscribe(job);

        logs.publish(entry(job, "before"));
        let mut late = logs.subscribe(job);
        logs.publish(entry(job, "after"));

        assert_eq!(next(&mut early).await.unwrap().message, "before");
        assert_eq!(next(&mut early).await.unwrap().message, "after");
        assert_eq!(next(&mut late).await.unwrap().message, "after");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let logs = LogBroadcaster::new(16);
        let job = Uuid::new_v4();
        logs.publish(entry(job, "nobody listening"));
        assert_eq!(logs.open_channels(), 0);

        let mut stream = logs.subscribe(job);
        logs.publish(entry(job, "first seen"));
        assert_eq!(next(&mut stream).await.unwrap().message, "first seen");
    }

    #[tokio::test]
    async fn test_jobs_are_isolated() {
        let logs = LogBroadcaster::new(16);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut stream_a = logs.subscribe(a);
        let _stream_b = logs.subscribe(b);
        logs.publish(entry(b, "for b"));
        logs.publish(entry(a, "for a"));
        let got = next(&mut stream_a).await.unwrap();
        assert_eq!(got.job_id, a);
        assert_eq!(got.message, "for a");
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let logs = LogBroadcaster::new(16);
        let job = Uuid::new_v4();
        let mut stream = logs.subscribe(job);
        logs.publish(entry(job, "last words"));
        logs.close(job);
        assert_eq!(next(&mut stream).await.unwrap().message, "last words");
        assert!(next(&mut stream).await.is_none());
        assert_eq!(logs.subscriber_count(job), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_and_continues() {
        let logs = LogBroadcaster::new(2);
        let job = Uuid::new_v4();
        let mut slow = logs.subscribe(job);
        for i in 0..5 {
            logs.publish(entry(job, &format!("m{}", i)));
        }
        // Only the newest `capacity` entries survive for a lagging cursor.
        assert_eq!(next(&mut slow).await.unwrap().message, "m3");
        assert_eq!(next(&mut slow).await.unwrap().message, "m4");
        logs.publish(entry(job, "m5"));
        assert_eq!(next(&mut slow).await.unwrap().message, "m5");
    }

    #[tokio::test]
    async fn test_subscriber_count_tracks_drops() {
        let logs = LogBroadcaster::new(4);
        let job = Uuid::new_v4();
        let first = logs.subscribe(job);
        let _second = logs.subscribe(job);
        assert_eq!(logs.subscriber_count(job), 2);
        drop(first);
        assert_eq!(logs.subscriber_count(job), 1);
    }
}
