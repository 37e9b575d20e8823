//! Exactly-once commit of a draw's winner.
//!
//! Every replica calls [`OutcomePersister::finish`] when its own replay
//! lands. The durable write is a compare-and-swap on the session record, so
//! only the first writer commits; the rest observe the stored winner and do
//! nothing.

use crate::channel::{publish_json, SharedStateChannel};
use crate::error::ChannelError;
use crate::types::{keys, DrawEvent, DrawSession, RoomId};
use std::sync::Arc;
use tokio::sync::Mutex;

/// CAS retries before giving up on a contended record
const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// This call wrote the winner
    Committed,
    /// The record already held the winner for this run
    AlreadyCommitted,
    /// The stored record belongs to a newer run, or this run was cancelled
    Superseded,
    /// Store unreachable; kept for reconciliation on next access
    WriteFailed,
}

pub struct OutcomePersister {
    room: RoomId,
    channel: Arc<dyn SharedStateChannel>,
    /// Finished session whose durable write failed
    pending: Mutex<Option<DrawSession>>,
}

impl OutcomePersister {
    pub fn new(room: RoomId, channel: Arc<dyn SharedStateChannel>) -> Self {
        Self {
            room,
            channel,
            pending: Mutex::new(None),
        }
    }

    /// Commit the winner of `session` once, then broadcast the result.
    pub async fn finish(&self, session: &DrawSession) -> FinishOutcome {
        let finished = session.finished();
        let Some(winner) = finished.winner.clone() else {
            tracing::warn!(run_id = %session.run_id, "Session has no target entry, nothing to commit");
            return FinishOutcome::Superseded;
        };

        let mut pending = self.pending.lock().await;
        if let Some(earlier) = pending.take() {
            if earlier.run_id != finished.run_id {
                *pending = self.retry(earlier).await;
            }
        }

        let outcome = match self.commit(&finished).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    run_id = %finished.run_id,
                    "Winner commit failed, will reconcile later: {}",
                    e
                );
                *pending = Some(finished.clone());
                FinishOutcome::WriteFailed
            }
        };
        drop(pending);

        if outcome == FinishOutcome::Superseded && self.is_cancelled(&finished).await {
            return outcome;
        }

        // Lagging replicas snap to the terminal pose from this
        publish_json(
            self.channel.as_ref(),
            &keys::draw_topic(&self.room),
            &DrawEvent::Result {
                run_id: finished.run_id,
                winner,
            },
        )
        .await;
        outcome
    }

    /// Retry a previously failed commit. Returns true when nothing is left pending.
    pub async fn reconcile(&self) -> bool {
        let mut pending = self.pending.lock().await;
        if let Some(earlier) = pending.take() {
            *pending = self.retry(earlier).await;
        }
        pending.is_none()
    }

    async fn retry(&self, finished: DrawSession) -> Option<DrawSession> {
        match self.commit(&finished).await {
            Ok(outcome) => {
                tracing::info!(run_id = %finished.run_id, ?outcome, "Reconciled pending winner");
                None
            }
            Err(e) => {
                tracing::debug!(run_id = %finished.run_id, "Reconcile still failing: {}", e);
                Some(finished)
            }
        }
    }

    async fn is_cancelled(&self, finished: &DrawSession) -> bool {
        match self.channel.read(&keys::session(&self.room)).await {
            Ok(Some(stored)) => stored
                .decode::<DrawSession>()
                .is_ok_and(|s| s.run_id == finished.run_id && s.cancelled),
            _ => false,
        }
    }

    async fn commit(&self, finished: &DrawSession) -> Result<FinishOutcome, ChannelError> {
        let key = keys::session(&self.room);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let stored = self.channel.read(&key).await?;
            let expected = match &stored {
                None => None,
                Some(record) => {
                    match record.decode::<DrawSession>() {
                        Ok(current) if current.run_id > finished.run_id => {
                            return Ok(FinishOutcome::Superseded);
                        }
                        Ok(current) if current.run_id == finished.run_id => {
                            if current.cancelled {
                                return Ok(FinishOutcome::Superseded);
                            }
                            if current.winner.is_some() {
                                tracing::debug!(run_id = %finished.run_id, "Winner already committed");
                                return Ok(FinishOutcome::AlreadyCommitted);
                            }
                        }
                        // Older run or unreadable record: ours replaces it
                        _ => {}
                    }
                    Some(record.version)
                }
            };

            let value = serde_json::to_value(finished)?;
            if self.channel.compare_and_swap(&key, expected, value).await? {
                tracing::info!(
                    run_id = %finished.run_id,
                    winner = ?finished.winner,
                    "Winner committed"
                );
                return Ok(FinishOutcome::Committed);
            }
            // Lost a race; re-read and decide again
        }

        Ok(FinishOutcome::AlreadyCommitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{read_json, ChannelResult, Versioned};
    use crate::state::AppState;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast;

    /// AppState whose durable operations can be switched off
    struct FlakyChannel {
        inner: AppState,
        offline: AtomicBool,
    }

    impl FlakyChannel {
        fn check(&self) -> ChannelResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                Err(ChannelError::Unavailable("offline".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SharedStateChannel for FlakyChannel {
        async fn read(&self, key: &str) -> ChannelResult<Option<Versioned>> {
            self.check()?;
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, value: Value) -> ChannelResult<u64> {
            self.check()?;
            self.inner.write(key, value).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<u64>,
            value: Value,
        ) -> ChannelResult<bool> {
            self.check()?;
            self.inner.compare_and_swap(key, expected, value).await
        }

        fn subscribe_key(&self, key: &str) -> broadcast::Receiver<Value> {
            self.inner.subscribe_key(key)
        }

        async fn publish(&self, topic: &str, msg: Value) {
            self.inner.publish(topic, msg).await
        }

        fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<Value> {
            self.inner.subscribe_topic(topic)
        }
    }

    fn session() -> DrawSession {
        DrawSession {
            run_id: ulid::Ulid::new(),
            started_by: "Alice".to_string(),
            started_at: 1_000,
            duration_ms: 6_000,
            entries: vec!["Alice".into(), "Bob".into(), "Carol".into(), "Dave".into()],
            target_index: 2,
            loops: 6,
            is_spinning: true,
            winner: None,
            cancelled: false,
        }
    }

    async fn stored(channel: &dyn SharedStateChannel) -> (u64, DrawSession) {
        read_json(channel, &keys::session("room"))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_finish_commits_once() {
        let state = Arc::new(AppState::new());
        let s = session();
        state
            .write(&keys::session("room"), serde_json::to_value(&s).unwrap())
            .await
            .unwrap();

        let first = OutcomePersister::new("room".into(), state.clone());
        let second = OutcomePersister::new("room".into(), state.clone());

        assert_eq!(first.finish(&s).await, FinishOutcome::Committed);
        assert_eq!(second.finish(&s).await, FinishOutcome::AlreadyCommitted);
        assert_eq!(first.finish(&s).await, FinishOutcome::AlreadyCommitted);

        let (version, record) = stored(state.as_ref()).await;
        assert_eq!(version, 2);
        assert_eq!(record.winner.as_deref(), Some("Carol"));
        assert!(!record.is_spinning);
    }

    #[tokio::test]
    async fn test_concurrent_finish_single_writer() {
        let state = Arc::new(AppState::new());
        let s = session();
        state
            .write(&keys::session("room"), serde_json::to_value(&s).unwrap())
            .await
            .unwrap();

        let persisters: Vec<_> = (0..5)
            .map(|_| OutcomePersister::new("room".into(), state.clone()))
            .collect();
        let outcomes =
            futures::future::join_all(persisters.iter().map(|p| p.finish(&s))).await;

        let committed = outcomes
            .iter()
            .filter(|o| **o == FinishOutcome::Committed)
            .count();
        assert_eq!(committed, 1);
        assert_eq!(stored(state.as_ref()).await.0, 2);
    }

    #[tokio::test]
    async fn test_finish_always_broadcasts_result() {
        let state = Arc::new(AppState::new());
        let mut rx = state.subscribe_topic(&keys::draw_topic("room"));
        let s = session();
        let persister = OutcomePersister::new("room".into(), state.clone());

        persister.finish(&s).await;
        persister.finish(&s).await;

        for _ in 0..2 {
            let event: DrawEvent = serde_json::from_value(rx.recv().await.unwrap()).unwrap();
            assert_eq!(
                event,
                DrawEvent::Result {
                    run_id: s.run_id,
                    winner: "Carol".into()
                }
            );
        }
    }

    #[tokio::test]
    async fn test_newer_run_is_not_overwritten() {
        let state = Arc::new(AppState::new());
        let mut gen = ulid::Generator::new();
        let mut old = session();
        old.run_id = gen.generate().unwrap();
        let mut new = session();
        new.run_id = gen.generate().unwrap();
        state
            .write(&keys::session("room"), serde_json::to_value(&new).unwrap())
            .await
            .unwrap();

        let persister = OutcomePersister::new("room".into(), state.clone());
        assert_eq!(persister.finish(&old).await, FinishOutcome::Superseded);
        assert_eq!(stored(state.as_ref()).await.1, new);
    }

    #[tokio::test]
    async fn test_cancelled_run_gets_no_winner() {
        let state = Arc::new(AppState::new());
        let mut rx = state.subscribe_topic(&keys::draw_topic("room"));
        let s = session();
        let cancelled = DrawSession {
            is_spinning: false,
            cancelled: true,
            ..s.clone()
        };
        state
            .write(&keys::session("room"), serde_json::to_value(&cancelled).unwrap())
            .await
            .unwrap();

        let persister = OutcomePersister::new("room".into(), state.clone());
        assert_eq!(persister.finish(&s).await, FinishOutcome::Superseded);
        assert!(stored(state.as_ref()).await.1.winner.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_failure_still_broadcasts_and_reconciles() {
        let channel = Arc::new(FlakyChannel {
            inner: AppState::new(),
            offline: AtomicBool::new(true),
        });
        let mut rx = channel.subscribe_topic(&keys::draw_topic("room"));
        let s = session();
        let persister = OutcomePersister::new("room".into(), channel.clone());

        assert_eq!(persister.finish(&s).await, FinishOutcome::WriteFailed);
        assert!(rx.recv().await.is_ok());
        assert!(!persister.reconcile().await);

        channel.offline.store(false, Ordering::SeqCst);
        assert!(persister.reconcile().await);

        let (_, record) = stored(channel.as_ref()).await;
        assert_eq!(record.winner.as_deref(), Some("Carol"));
    }
}
